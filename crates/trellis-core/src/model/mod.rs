//! Issue records and the identifiers that name them.

pub mod field;
pub mod id;
pub mod issue;
pub mod time;

pub use field::{Field, Strategy};
pub use id::{Alias, AliasMap, IdManager, IssueId};
pub use issue::{DepKind, Issue, IssuePatch, Kind, ParseEnumError, Priority, Status};
