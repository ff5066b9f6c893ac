//! The `status:` labels that encode where an item is in its lifecycle.

use std::fmt;
use std::str::FromStr;

use crate::store::ItemKind;

pub const STATUS_PREFIX: &str = "status:";

/// Lifecycle state of a tracked item. Exactly one is carried as a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    SpecReview,
    SpecReviewing,
    Ready,
    Implementing,
    Reviewing,
    InReview,
    Approved,
    ChangesRequested,
    Escalated,
    Failed,
    CiFailed,
}

impl Status {
    pub const ALL: [Self; 11] = [
        Self::SpecReview,
        Self::SpecReviewing,
        Self::Ready,
        Self::Implementing,
        Self::Reviewing,
        Self::InReview,
        Self::Approved,
        Self::ChangesRequested,
        Self::Escalated,
        Self::Failed,
        Self::CiFailed,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SpecReview => "spec-review",
            Self::SpecReviewing => "spec-reviewing",
            Self::Ready => "ready",
            Self::Implementing => "implementing",
            Self::Reviewing => "reviewing",
            Self::InReview => "in-review",
            Self::Approved => "approved",
            Self::ChangesRequested => "changes-requested",
            Self::Escalated => "escalated",
            Self::Failed => "failed",
            Self::CiFailed => "ci-failed",
        }
    }

    /// Full label text, e.g. `status:ready`.
    pub fn label(self) -> String {
        format!("{STATUS_PREFIX}{}", self.as_str())
    }

    /// Parse a full `status:` label. Non-status labels yield `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        label.strip_prefix(STATUS_PREFIX)?.parse().ok()
    }

    /// Statuses that mean some agent holds the item's lock.
    pub const fn is_in_progress(self) -> bool {
        matches!(self, Self::SpecReviewing | Self::Implementing | Self::InReview)
    }

    /// Where a stale in-progress item goes when its label history does not say
    /// what it was before.
    pub const fn recovery_default(self, kind: ItemKind) -> Self {
        match (self, kind) {
            (Self::Implementing, ItemKind::Change) => Self::ChangesRequested,
            (Self::Implementing, ItemKind::Ticket) => Self::Ready,
            (Self::InReview, _) => Self::Reviewing,
            (Self::SpecReviewing, _) => Self::SpecReview,
            (other, _) => other,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
