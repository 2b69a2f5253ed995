use crate::lock::LockError;
use crate::scope::Scope;
use crate::tree::validate::PlacementError;
use std::fmt;

/// Machine-readable error codes for operator tooling and caller retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ScopeNotFound,
    ScopeExists,
    ConfigParseError,
    ParentNotFound,
    NodeNotFound,
    RootAlreadyExists,
    DuplicateCode,
    TypeNotPermitted,
    ScopeMismatch,
    WindowOutsideParent,
    NodeInactive,
    ChildLimitReached,
    CycleDetected,
    CounterUnderflow,
    IntegrityFailed,
    LockContention,
    StorageFailure,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ScopeNotFound => "E1001",
            Self::ScopeExists => "E1002",
            Self::ConfigParseError => "E1003",
            Self::ParentNotFound => "E2001",
            Self::NodeNotFound => "E2002",
            Self::RootAlreadyExists => "E2003",
            Self::DuplicateCode => "E2004",
            Self::TypeNotPermitted => "E2005",
            Self::ScopeMismatch => "E2006",
            Self::WindowOutsideParent => "E2007",
            Self::NodeInactive => "E2008",
            Self::ChildLimitReached => "E2009",
            Self::CycleDetected => "E2010",
            Self::CounterUnderflow => "E2011",
            Self::IntegrityFailed => "E4001",
            Self::LockContention => "E5001",
            Self::StorageFailure => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ScopeNotFound => "Scope not provisioned",
            Self::ScopeExists => "Scope already provisioned",
            Self::ConfigParseError => "Config or rules file parse error",
            Self::ParentNotFound => "Parent node not found",
            Self::NodeNotFound => "Node not found",
            Self::RootAlreadyExists => "Scope already has a root node",
            Self::DuplicateCode => "Sibling code already in use",
            Self::TypeNotPermitted => "Unit type not permitted under this parent",
            Self::ScopeMismatch => "Parent belongs to a different scope",
            Self::WindowOutsideParent => "Validity window exceeds the parent's",
            Self::NodeInactive => "Node is deactivated",
            Self::ChildLimitReached => "Parent is at its child limit for this type",
            Self::CycleDetected => "Move would create a cycle",
            Self::CounterUnderflow => "Counter delta would drop below zero",
            Self::IntegrityFailed => "Scope failed range integrity",
            Self::LockContention => "Scope lock contention",
            Self::StorageFailure => "Storage layer failure",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ScopeNotFound => Some("Run `cnp init --scope <tenant>/<domain>` first."),
            Self::ScopeExists => Some("Use the existing scope or pick another tenant/domain pair."),
            Self::ConfigParseError => Some("Fix the TOML syntax and retry."),
            Self::ParentNotFound | Self::NodeNotFound | Self::ScopeMismatch => None,
            Self::RootAlreadyExists => Some("Create further nodes under the existing root."),
            Self::DuplicateCode => {
                Some("Codes must be unique among siblings; pick a different code.")
            }
            Self::TypeNotPermitted => Some("Check the scope's level rules for permitted parents."),
            Self::WindowOutsideParent => {
                Some("Clip the child window so it lies inside the parent's window.")
            }
            Self::NodeInactive => Some("Pick an active node; deactivated nodes accept no children."),
            Self::ChildLimitReached => {
                Some("Raise max_children in the level rules or choose another parent.")
            }
            Self::CycleDetected => Some("Pick a destination outside the moved subtree."),
            Self::CounterUnderflow => Some("Run `cnp reconcile` to repair drifted counters."),
            Self::IntegrityFailed => {
                Some("Repair the scope's ranges, then clear with `cnp verify --clear`.")
            }
            Self::LockContention => Some("Retry after the other canopy process releases its lock."),
            Self::StorageFailure => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Top-level error for engine operations.
///
/// Placement and lock failures keep their own enums (`PlacementError`,
/// `LockError`) and are wrapped transparently; everything the engine can
/// refuse or fail with maps onto one stable [`ErrorCode`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("scope '{0}' is not provisioned")]
    ScopeNotFound(Scope),

    #[error("scope '{0}' is already provisioned")]
    ScopeExists(Scope),

    #[error("node '{node_id}' not found in scope '{scope}'")]
    NodeNotFound { scope: Scope, node_id: String },

    #[error("invalid level rules: {reason}")]
    InvalidRules { reason: String },

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(
        "counters on '{node_id}' would drop below zero \
         (total {total}+{total_delta}, active {active}+{active_delta})"
    )]
    CounterUnderflow {
        node_id: String,
        total: i64,
        active: i64,
        total_delta: i64,
        active_delta: i64,
    },

    #[error(transparent)]
    Conflict(#[from] LockError),

    #[error("scope '{0}' failed range integrity; structural writes are refused until repaired")]
    IntegrityFailed(Scope),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ScopeNotFound(_) => ErrorCode::ScopeNotFound,
            Self::ScopeExists(_) => ErrorCode::ScopeExists,
            Self::NodeNotFound { .. } => ErrorCode::NodeNotFound,
            Self::InvalidRules { .. } => ErrorCode::ConfigParseError,
            Self::Placement(e) => e.code(),
            Self::CounterUnderflow { .. } => ErrorCode::CounterUnderflow,
            Self::Conflict(e) => e.code(),
            Self::IntegrityFailed(_) => ErrorCode::IntegrityFailed,
            Self::Storage(_) => ErrorCode::StorageFailure,
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}
