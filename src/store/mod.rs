//! The remote issue tracker: task queue, lock medium, and mailbox in one.
//!
//! Every call either returns a value or a [`StoreError`]. Callers treat an
//! error as "the operation did not happen" and never assume a write landed.

pub mod github;
pub mod memory;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::status::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    /// An issue carrying a specification.
    Ticket,
    /// A change proposal (pull request).
    Change,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ticket => "ticket",
            Self::Change => "change",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPair {
    pub head: String,
    pub base: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: BTreeSet<String>,
    /// Present only for change proposals.
    pub branches: Option<BranchPair>,
}

impl Item {
    pub const fn kind(&self) -> ItemKind {
        if self.branches.is_some() {
            ItemKind::Change
        } else {
            ItemKind::Ticket
        }
    }

    pub fn has_status(&self, status: Status) -> bool {
        self.labels.contains(&status.label())
    }

    /// Every recognised `status:` label on the item. Normally exactly one.
    pub fn statuses(&self) -> Vec<Status> {
        self.labels.iter().filter_map(|l| Status::from_label(l)).collect()
    }

    /// The single current status, if the item is in a consistent state.
    pub fn status(&self) -> Option<Status> {
        match self.statuses().as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// Ticket number referenced by `Closes #N` / `Fixes #N` / `Resolves #N`.
    pub fn linked_ticket(&self) -> Option<u64> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"(?i)\b(?:close[sd]?|fix(?:e[sd])?|resolve[sd]?)\s+#(\d+)")
                .expect("linked ticket regex is valid")
        });
        re.captures(&self.body)?.get(1)?.as_str().parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: u64,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelEventKind {
    Labeled,
    Unlabeled,
}

/// One entry of an item's label-change history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelEvent {
    pub kind: LabelEventKind,
    pub label: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Success,
    Failure,
    Pending,
    /// No checks configured.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildStatus {
    pub state: BuildState,
    pub pending: usize,
}

impl BuildStatus {
    pub const fn of(state: BuildState) -> Self {
        Self { state, pending: 0 }
    }

    /// Green means mergeable from CI's point of view; no CI counts as green.
    pub const fn is_green(self) -> bool {
        matches!(self.state, BuildState::Success | BuildState::None)
    }
}

/// A failed build check with whatever diagnostic text the tracker exposes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckFailure {
    pub name: String,
    pub conclusion: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    #[default]
    Squash,
    Merge,
    Rebase,
}

impl MergeMethod {
    pub const fn flag(self) -> &'static str {
        match self {
            Self::Squash => "--squash",
            Self::Merge => "--merge",
            Self::Rebase => "--rebase",
        }
    }
}

/// Parameters for opening a change proposal.
#[derive(Debug, Clone)]
pub struct NewChange<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub head: &'a str,
    pub base: &'a str,
    pub labels: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{op} failed: {message}")]
    Request { op: &'static str, message: String },

    #[error("could not decode {op} response: {message}")]
    Decode { op: &'static str, message: String },

    #[error("item #{0} not found")]
    NotFound(u64),
}

pub trait RemoteStore {
    /// Open items of `kind` carrying `label`.
    fn list_items(&self, kind: ItemKind, label: &str) -> Result<Vec<Item>, StoreError>;
    fn get_item(&self, number: u64) -> Result<Item, StoreError>;
    fn comments(&self, number: u64) -> Result<Vec<Comment>, StoreError>;
    fn post_comment(&self, number: u64, body: &str) -> Result<(), StoreError>;
    fn add_label(&self, number: u64, label: &str) -> Result<(), StoreError>;
    fn remove_label(&self, number: u64, label: &str) -> Result<(), StoreError>;
    fn label_events(&self, number: u64) -> Result<Vec<LabelEvent>, StoreError>;
    fn create_item(&self, title: &str, body: &str, labels: &[String]) -> Result<u64, StoreError>;
    fn update_body(&self, number: u64, body: &str) -> Result<(), StoreError>;
    fn open_change(&self, change: &NewChange<'_>) -> Result<u64, StoreError>;
    fn change_diff(&self, number: u64) -> Result<String, StoreError>;
    fn approve_change(&self, number: u64, body: &str) -> Result<(), StoreError>;
    fn request_changes(&self, number: u64, body: &str) -> Result<(), StoreError>;
    fn merge_change(&self, number: u64, method: MergeMethod) -> Result<(), StoreError>;
    fn build_status(&self, number: u64) -> Result<BuildStatus, StoreError>;
    fn failed_checks(&self, number: u64) -> Result<Vec<CheckFailure>, StoreError>;
    /// Body of the most recent review that requested changes.
    fn latest_review_feedback(&self, number: u64) -> Result<Option<String>, StoreError>;
    fn default_branch(&self) -> Result<String, StoreError>;
}
