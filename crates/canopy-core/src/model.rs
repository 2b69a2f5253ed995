//! Domain value types shared across the engine: node identifiers, membership
//! states and transitions, validity windows, and the input specs for node
//! creation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Prefix for node identifiers.
pub const NODE_ID_PREFIX: &str = "cn-";

/// Mint a fresh node identifier: `cn-` plus a hex UUIDv7.
///
/// The hex form keeps ids free of `%` and `_`, so materialized paths are
/// safe inside SQL `LIKE` prefix patterns.
#[must_use]
pub fn generate_node_id() -> String {
    format!("{NODE_ID_PREFIX}{}", Uuid::now_v7().simple())
}

/// Current wall-clock time in microseconds since the Unix epoch.
#[must_use]
pub fn now_us() -> i64 {
    Utc::now().timestamp_micros()
}

const fn flag(b: bool) -> i64 {
    if b { 1 } else { 0 }
}

/// Membership lifecycle states as reported by the external membership system.
///
/// The engine never stores member identity; it only folds these states into
/// signed counter deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    None,
    Pending,
    Active,
    Lapsed,
}

impl MemberState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Lapsed => "lapsed",
        }
    }

    /// Whether this state counts toward `total_count`.
    #[must_use]
    pub const fn is_member(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Whether this state counts toward `active_count`.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a membership state from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStateError {
    pub got: String,
}

impl fmt::Display for ParseStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid member state: '{}'", self.got)
    }
}

impl std::error::Error for ParseStateError {}

impl FromStr for MemberState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "lapsed" => Ok(Self::Lapsed),
            _ => Err(ParseStateError { got: s.to_string() }),
        }
    }
}

/// One membership state-transition event from the external membership system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipTransition {
    pub member_id: String,
    pub node_id: String,
    pub old_state: MemberState,
    pub new_state: MemberState,
}

impl MembershipTransition {
    /// Signed `(total, active)` deltas implied by this transition.
    ///
    /// Becoming a member is +1 total, ceasing is -1; entering the active
    /// state is +1 active, leaving it is -1. A state change that crosses
    /// neither boundary yields `(0, 0)`.
    #[must_use]
    pub const fn deltas(&self) -> (i64, i64) {
        (
            flag(self.new_state.is_member()) - flag(self.old_state.is_member()),
            flag(self.new_state.is_active()) - flag(self.old_state.is_active()),
        )
    }
}

/// Temporal validity window. `None` bounds are open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub valid_from_us: Option<i64>,
    pub valid_to_us: Option<i64>,
}

impl Window {
    /// An unbounded window.
    #[must_use]
    pub const fn open() -> Self {
        Self {
            valid_from_us: None,
            valid_to_us: None,
        }
    }

    /// True when `self` lies entirely inside `outer`.
    ///
    /// An open bound on `outer` admits anything on that side; an open bound
    /// on `self` fits only under an open bound on `outer`.
    #[must_use]
    pub const fn within(&self, outer: &Self) -> bool {
        let from_ok = match (outer.valid_from_us, self.valid_from_us) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(o), Some(s)) => s >= o,
        };
        let to_ok = match (outer.valid_to_us, self.valid_to_us) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(o), Some(s)) => s <= o,
        };
        from_ok && to_ok
    }
}

/// Input for `create_node`: where the node goes and what it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub parent_id: String,
    pub unit_type: String,
    pub code: String,
    pub name: String,
    pub window: Window,
}

/// Input for the root node written during scope provisioning. The root's
/// unit type comes from the scope's level rules (the one rule without a
/// parent type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootSpec {
    pub code: String,
    pub name: String,
    pub window: Window,
}
