use std::fmt;
use std::path::PathBuf;

use crate::codec::DecodeError;
use crate::git::GitError;
use crate::lock::LockError;
use crate::store::StoreError;

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ValidationFailed,
    NotFound,
    IdSpaceExhausted,
    MirrorUnhealthy,
    IntegrityViolation,
    ConflictingWrite,
    EnvironmentRejection,
    GitCommandFailed,
    StoreWriteFailed,
    LockContention,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ValidationFailed => "E2001",
            Self::NotFound => "E2002",
            Self::IdSpaceExhausted => "E2003",
            Self::MirrorUnhealthy => "E3001",
            Self::IntegrityViolation => "E3002",
            Self::ConflictingWrite => "E4001",
            Self::EnvironmentRejection => "E4002",
            Self::GitCommandFailed => "E4003",
            Self::StoreWriteFailed => "E5001",
            Self::LockContention => "E5002",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "Project not initialized",
            Self::ValidationFailed => "Invalid record or input",
            Self::NotFound => "Issue not found",
            Self::IdSpaceExhausted => "Could not allocate a unique identifier",
            Self::MirrorUnhealthy => "Shared-line mirror is missing or corrupted",
            Self::IntegrityViolation => "Integrity check failed",
            Self::ConflictingWrite => "Push rejected as non-fast-forward",
            Self::EnvironmentRejection => "Push refused by the remote or environment",
            Self::GitCommandFailed => "git command failed",
            Self::StoreWriteFailed => "Record file write failed",
            Self::LockContention => "Lock contention",
        }
    }

    /// Recovery action that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run `trl init` inside a git repository."),
            Self::ValidationFailed => Some("Fix the offending field and retry; nothing was written."),
            Self::NotFound => Some("Use the exact alias or internal id shown by `trl list`."),
            Self::IdSpaceExhausted => Some("Retry the command; if it persists run `trl check`."),
            Self::MirrorUnhealthy => {
                Some("Run `trl repair-mirror`; if repair keeps failing inspect .git/trellis/.")
            }
            Self::IntegrityViolation => Some("Run `trl check --repair` to fix what can be fixed."),
            Self::ConflictingWrite => Some(
                "Retry `trl sync`, or run `trl save` to keep your changes in a workspace.",
            ),
            Self::EnvironmentRejection => Some(
                "Run `trl save` to keep your changes in a workspace, then restore remote access.",
            ),
            Self::GitCommandFailed => Some("Check that git is installed and the repository is readable."),
            Self::StoreWriteFailed => Some("Check disk space and write permissions."),
            Self::LockContention => Some("Retry after the other `trl` process releases its lock."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors surfaced by the trellis core.
///
/// Variants follow the recovery taxonomy: validation problems are never
/// partially applied, mirror problems require repair, push rejections are
/// split by whether retrying can help.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no trellis project at {}", .0.display())]
    NotInitialized(PathBuf),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("{}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },

    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },

    #[error("{what} not found: {key}")]
    NotFound { what: &'static str, key: String },

    #[error("could not allocate a unique {what} after {attempts} attempts")]
    IdExhausted { what: &'static str, attempts: usize },

    #[error("shared-line mirror at {} is unhealthy: {reason}", .path.display())]
    MirrorUnhealthy { path: PathBuf, reason: String },

    #[error("integrity check found {count} problem(s): {summary}")]
    Integrity { count: usize, summary: String },

    #[error(
        "push to {remote} rejected as non-fast-forward after {attempts} attempt(s); \
         run `trl save` to keep local changes in a workspace"
    )]
    ConflictingWrite { remote: String, attempts: usize },

    #[error(
        "push to {remote} refused: {detail}; retrying cannot help, \
         run `trl save` to keep local changes in a workspace"
    )]
    EnvironmentRejection { remote: String, detail: String },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("invalid config {}: {reason}", .path.display())]
    Config { path: PathBuf, reason: String },
}

impl Error {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized(_) => ErrorCode::NotInitialized,
            Self::Decode(_) | Self::Invalid { .. } | Self::Config { .. } => {
                ErrorCode::ValidationFailed
            }
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::IdExhausted { .. } => ErrorCode::IdSpaceExhausted,
            Self::MirrorUnhealthy { .. } => ErrorCode::MirrorUnhealthy,
            Self::Integrity { .. } | Self::Corrupt { .. } => ErrorCode::IntegrityViolation,
            Self::ConflictingWrite { .. } => ErrorCode::ConflictingWrite,
            Self::EnvironmentRejection { .. } => ErrorCode::EnvironmentRejection,
            Self::Git(_) => ErrorCode::GitCommandFailed,
            Self::Store(_) => ErrorCode::StoreWriteFailed,
            Self::Lock(err) => err.code(),
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    pub(crate) fn invalid(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            what,
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(what: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            key: key.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
