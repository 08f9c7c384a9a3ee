use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EnforceError;

// ---------------------------------------------------------------------------
// EntityType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Track,
    Album,
    Artist,
    PlaylistEntry,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Track => "track",
            EntityType::Album => "album",
            EntityType::Artist => "artist",
            EntityType::PlaylistEntry => "playlist_entry",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = EnforceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "track" => Ok(EntityType::Track),
            "album" => Ok(EntityType::Album),
            "artist" => Ok(EntityType::Artist),
            "playlist_entry" => Ok(EntityType::PlaylistEntry),
            _ => Err(EnforceError::InvalidValue {
                field: "entity_type",
                value: s.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionKind
// ---------------------------------------------------------------------------

/// A mutation against a provider library.
///
/// `Remove`, `Unfollow` and `Dislike` are the forward actions a planner may
/// submit. `Restore`, `Follow` and `RemoveRating` only appear in the ledger as
/// the reversal of a forward action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Remove,
    Unfollow,
    Dislike,
    Restore,
    Follow,
    RemoveRating,
}

impl ActionKind {
    pub fn forward() -> &'static [ActionKind] {
        &[ActionKind::Remove, ActionKind::Unfollow, ActionKind::Dislike]
    }

    pub fn is_forward(self) -> bool {
        Self::forward().contains(&self)
    }

    pub fn inverse(self) -> ActionKind {
        match self {
            ActionKind::Remove => ActionKind::Restore,
            ActionKind::Unfollow => ActionKind::Follow,
            ActionKind::Dislike => ActionKind::RemoveRating,
            ActionKind::Restore => ActionKind::Remove,
            ActionKind::Follow => ActionKind::Unfollow,
            ActionKind::RemoveRating => ActionKind::Dislike,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Remove => "remove",
            ActionKind::Unfollow => "unfollow",
            ActionKind::Dislike => "dislike",
            ActionKind::Restore => "restore",
            ActionKind::Follow => "follow",
            ActionKind::RemoveRating => "remove_rating",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = EnforceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remove" => Ok(ActionKind::Remove),
            "unfollow" => Ok(ActionKind::Unfollow),
            "dislike" => Ok(ActionKind::Dislike),
            "restore" => Ok(ActionKind::Restore),
            "follow" => Ok(ActionKind::Follow),
            "remove_rating" => Ok(ActionKind::RemoveRating),
            _ => Err(EnforceError::InvalidValue {
                field: "action",
                value: s.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// BatchStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a batch.
///
/// Transitions: `Pending → Running → Completed | Failed | Cancelled`
///
/// `Running` survives process restarts through the checkpoint. Status never
/// moves backwards, except that an explicit resume may take a `Cancelled`
/// batch back to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    fn rank(self) -> u8 {
        match self {
            BatchStatus::Pending => 0,
            BatchStatus::Running => 1,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Whether `self → next` is a legal forward move.
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        if self == next {
            return !self.is_terminal();
        }
        if self == BatchStatus::Cancelled && next == BatchStatus::Running {
            return true;
        }
        next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ItemStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Succeeded => "succeeded",
            ItemStatus::Failed => "failed",
            ItemStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// HaltReason
// ---------------------------------------------------------------------------

/// Why a `Running` (or `Cancelled`) batch stopped short of its last item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    CircuitOpen,
    ReconnectRequired,
    Cancelled,
}

impl HaltReason {
    pub fn as_str(self) -> &'static str {
        match self {
            HaltReason::CircuitOpen => "circuit_open",
            HaltReason::ReconnectRequired => "reconnect_required",
            HaltReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
