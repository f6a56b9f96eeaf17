//! trellis-core library.
//!
//! Issues are plain-text records on a dedicated git branch (the shared
//! line). Each clone edits them through a private worktree of that branch
//! (the mirror), merges concurrent edits field by field, and pushes with
//! bounded retry.

pub mod attic;
pub mod codec;
pub mod config;
pub mod error;
pub mod git;
pub mod integrity;
pub mod lock;
pub mod merge;
pub mod mirror;
pub mod model;
pub mod project;
pub mod store;
pub mod sync;
pub mod workspace;

pub use error::{Error, ErrorCode, Result};
pub use model::{Alias, DepKind, Field, Issue, IssueId, IssuePatch, Kind, Priority, Status};
pub use project::{ListFilter, Project};

/// # Conventions
///
/// - **Errors**: Library code returns [`error::Result`] with a typed
///   [`Error`]; only configuration loading and binaries use `anyhow::Result`.
/// - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).
/// - **Time**: Model, merge and store functions take `now` explicitly.
pub const FORMAT_VERSION: u32 = 1;
