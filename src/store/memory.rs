//! In-memory [`RemoteStore`] for tests and dry runs.
//!
//! Writes are immediately visible to every reader sharing the store, which
//! models a tracker with zero propagation delay. Timestamps come from the
//! injected clock. Individual operations can be made to fail on demand and
//! build statuses can be scripted per change.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};

use super::{
    BranchPair, BuildState, BuildStatus, CheckFailure, Comment, Item, ItemKind, LabelEvent,
    LabelEventKind, MergeMethod, NewChange, RemoteStore, StoreError,
};
use crate::clock::Clock;

/// A review left on a change, newest last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewRecord {
    Approved(String),
    ChangesRequested(String),
}

#[derive(Debug, Default)]
struct Entry {
    item: Option<Item>,
    comments: Vec<Comment>,
    events: Vec<LabelEvent>,
    diff: String,
    reviews: Vec<ReviewRecord>,
    merged: Option<MergeMethod>,
    build_script: VecDeque<BuildStatus>,
    failed_checks: Vec<CheckFailure>,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<u64, Entry>,
    next_comment_id: u64,
    failures: HashMap<&'static str, usize>,
    calls: HashMap<&'static str, usize>,
    default_builds: VecDeque<BuildStatus>,
}

pub struct MemoryStore {
    clock: Box<dyn Clock>,
    default_branch: String,
    state: RefCell<State>,
}

impl MemoryStore {
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            default_branch: "main".to_string(),
            state: RefCell::new(State::default()),
        }
    }

    // --- seeding ---

    pub fn seed_ticket(&self, number: u64, title: &str, body: &str, labels: &[&str]) {
        self.seed(number, title, body, labels, None);
    }

    pub fn seed_change(&self, number: u64, title: &str, body: &str, labels: &[&str], branches: BranchPair) {
        self.seed(number, title, body, labels, Some(branches));
    }

    fn seed(&self, number: u64, title: &str, body: &str, labels: &[&str], branches: Option<BranchPair>) {
        let mut state = self.state.borrow_mut();
        let entry = state.entries.entry(number).or_default();
        entry.item = Some(Item {
            number,
            title: title.to_string(),
            body: body.to_string(),
            labels: labels.iter().map(|l| (*l).to_string()).collect(),
            branches,
        });
    }

    /// Insert a comment with an explicit timestamp, bypassing the clock.
    pub fn insert_comment_at(&self, number: u64, body: &str, at: DateTime<Utc>) {
        let mut state = self.state.borrow_mut();
        state.next_comment_id += 1;
        let id = state.next_comment_id;
        state.entries.entry(number).or_default().comments.push(Comment {
            id,
            body: body.to_string(),
            created_at: at,
        });
    }

    /// Append a label-history event without touching the current labels.
    pub fn insert_label_event(&self, number: u64, kind: LabelEventKind, label: &str, at: DateTime<Utc>) {
        self.state
            .borrow_mut()
            .entries
            .entry(number)
            .or_default()
            .events
            .push(LabelEvent {
                kind,
                label: label.to_string(),
                at,
            });
    }

    pub fn set_diff(&self, number: u64, diff: &str) {
        self.state.borrow_mut().entries.entry(number).or_default().diff = diff.to_string();
    }

    /// Statuses returned by successive `build_status` calls; the last one repeats.
    pub fn script_builds(&self, number: u64, statuses: &[BuildState]) {
        self.state.borrow_mut().entries.entry(number).or_default().build_script =
            statuses.iter().copied().map(BuildStatus::of).collect();
    }

    /// Script used for changes that have no script of their own (e.g. ones opened during a test).
    pub fn script_default_builds(&self, statuses: &[BuildState]) {
        self.state.borrow_mut().default_builds = statuses.iter().copied().map(BuildStatus::of).collect();
    }

    pub fn set_failed_checks(&self, number: u64, checks: Vec<CheckFailure>) {
        self.state.borrow_mut().entries.entry(number).or_default().failed_checks = checks;
    }

    pub fn add_review(&self, number: u64, review: ReviewRecord) {
        self.state.borrow_mut().entries.entry(number).or_default().reviews.push(review);
    }

    /// Make the next `times` calls of `op` fail. `op` is the trait method name.
    pub fn fail_next(&self, op: &'static str, times: usize) {
        self.state.borrow_mut().failures.insert(op, times);
    }

    // --- inspection ---

    pub fn item(&self, number: u64) -> Option<Item> {
        self.state.borrow().entries.get(&number)?.item.clone()
    }

    pub fn comment_bodies(&self, number: u64) -> Vec<String> {
        self.state
            .borrow()
            .entries
            .get(&number)
            .map(|e| e.comments.iter().map(|c| c.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn reviews(&self, number: u64) -> Vec<ReviewRecord> {
        self.state
            .borrow()
            .entries
            .get(&number)
            .map(|e| e.reviews.clone())
            .unwrap_or_default()
    }

    pub fn merged(&self, number: u64) -> Option<MergeMethod> {
        self.state.borrow().entries.get(&number)?.merged
    }

    /// How many times `op` has been called, failed calls included.
    pub fn calls(&self, op: &'static str) -> usize {
        self.state.borrow().calls.get(op).copied().unwrap_or(0)
    }

    // --- internals ---

    fn enter(&self, op: &'static str) -> Result<(), StoreError> {
        let mut state = self.state.borrow_mut();
        *state.calls.entry(op).or_default() += 1;
        if let Some(left) = state.failures.get_mut(op) {
            if *left > 0 {
                *left -= 1;
                return Err(StoreError::Request {
                    op,
                    message: "injected failure".to_string(),
                });
            }
        }
        Ok(())
    }

    fn with_item<T>(&self, number: u64, f: impl FnOnce(&mut Entry, &mut Item) -> T) -> Result<T, StoreError> {
        let mut state = self.state.borrow_mut();
        let entry = state
            .entries
            .get_mut(&number)
            .ok_or(StoreError::NotFound(number))?;
        let mut item = entry.item.take().ok_or(StoreError::NotFound(number))?;
        let out = f(entry, &mut item);
        entry.item = Some(item);
        Ok(out)
    }

    fn next_number(&self) -> u64 {
        self.state
            .borrow()
            .entries
            .keys()
            .next_back()
            .map_or(1, |n| n + 1)
    }
}

impl RemoteStore for MemoryStore {
    fn list_items(&self, kind: ItemKind, label: &str) -> Result<Vec<Item>, StoreError> {
        self.enter("list_items")?;
        Ok(self
            .state
            .borrow()
            .entries
            .values()
            .filter_map(|e| e.item.as_ref())
            .filter(|i| i.kind() == kind && i.labels.contains(label))
            .cloned()
            .collect())
    }

    fn get_item(&self, number: u64) -> Result<Item, StoreError> {
        self.enter("get_item")?;
        self.item(number).ok_or(StoreError::NotFound(number))
    }

    fn comments(&self, number: u64) -> Result<Vec<Comment>, StoreError> {
        self.enter("comments")?;
        self.with_item(number, |entry, _| entry.comments.clone())
    }

    fn post_comment(&self, number: u64, body: &str) -> Result<(), StoreError> {
        self.enter("post_comment")?;
        let now = self.clock.now();
        let mut state = self.state.borrow_mut();
        state.next_comment_id += 1;
        let id = state.next_comment_id;
        let entry = state
            .entries
            .get_mut(&number)
            .filter(|e| e.item.is_some())
            .ok_or(StoreError::NotFound(number))?;
        entry.comments.push(Comment {
            id,
            body: body.to_string(),
            created_at: now,
        });
        Ok(())
    }

    fn add_label(&self, number: u64, label: &str) -> Result<(), StoreError> {
        self.enter("add_label")?;
        let now = self.clock.now();
        self.with_item(number, |entry, item| {
            if item.labels.insert(label.to_string()) {
                entry.events.push(LabelEvent {
                    kind: LabelEventKind::Labeled,
                    label: label.to_string(),
                    at: now,
                });
            }
        })
    }

    fn remove_label(&self, number: u64, label: &str) -> Result<(), StoreError> {
        self.enter("remove_label")?;
        let now = self.clock.now();
        let removed = self.with_item(number, |entry, item| {
            let removed = item.labels.remove(label);
            if removed {
                entry.events.push(LabelEvent {
                    kind: LabelEventKind::Unlabeled,
                    label: label.to_string(),
                    at: now,
                });
            }
            removed
        })?;
        if removed {
            Ok(())
        } else {
            Err(StoreError::Request {
                op: "remove_label",
                message: format!("label {label} not on #{number}"),
            })
        }
    }

    fn label_events(&self, number: u64) -> Result<Vec<LabelEvent>, StoreError> {
        self.enter("label_events")?;
        self.with_item(number, |entry, _| entry.events.clone())
    }

    fn create_item(&self, title: &str, body: &str, labels: &[String]) -> Result<u64, StoreError> {
        self.enter("create_item")?;
        let number = self.next_number();
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        self.seed_ticket(number, title, body, &labels);
        Ok(number)
    }

    fn update_body(&self, number: u64, body: &str) -> Result<(), StoreError> {
        self.enter("update_body")?;
        self.with_item(number, |_, item| item.body = body.to_string())
    }

    fn open_change(&self, change: &NewChange<'_>) -> Result<u64, StoreError> {
        self.enter("open_change")?;
        let number = self.next_number();
        let labels: Vec<&str> = change.labels.iter().map(String::as_str).collect();
        self.seed_change(
            number,
            change.title,
            change.body,
            &labels,
            BranchPair {
                head: change.head.to_string(),
                base: change.base.to_string(),
            },
        );
        Ok(number)
    }

    fn change_diff(&self, number: u64) -> Result<String, StoreError> {
        self.enter("change_diff")?;
        self.with_item(number, |entry, _| entry.diff.clone())
    }

    fn approve_change(&self, number: u64, body: &str) -> Result<(), StoreError> {
        self.enter("approve_change")?;
        self.with_item(number, |entry, _| {
            entry.reviews.push(ReviewRecord::Approved(body.to_string()));
        })
    }

    fn request_changes(&self, number: u64, body: &str) -> Result<(), StoreError> {
        self.enter("request_changes")?;
        self.with_item(number, |entry, _| {
            entry.reviews.push(ReviewRecord::ChangesRequested(body.to_string()));
        })
    }

    fn merge_change(&self, number: u64, method: MergeMethod) -> Result<(), StoreError> {
        self.enter("merge_change")?;
        self.with_item(number, |entry, _| entry.merged = Some(method))
    }

    fn build_status(&self, number: u64) -> Result<BuildStatus, StoreError> {
        self.enter("build_status")?;
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        let entry = state
            .entries
            .get_mut(&number)
            .ok_or(StoreError::NotFound(number))?;
        if entry.build_script.is_empty() {
            entry.build_script = state.default_builds.clone();
        }
        let status = if entry.build_script.len() > 1 {
            entry.build_script.pop_front()
        } else {
            entry.build_script.front().copied()
        };
        Ok(status.unwrap_or(BuildStatus::of(BuildState::None)))
    }

    fn failed_checks(&self, number: u64) -> Result<Vec<CheckFailure>, StoreError> {
        self.enter("failed_checks")?;
        self.with_item(number, |entry, _| entry.failed_checks.clone())
    }

    fn latest_review_feedback(&self, number: u64) -> Result<Option<String>, StoreError> {
        self.enter("latest_review_feedback")?;
        self.with_item(number, |entry, _| {
            entry.reviews.iter().rev().find_map(|r| match r {
                ReviewRecord::ChangesRequested(body) => Some(body.clone()),
                ReviewRecord::Approved(_) => None,
            })
        })
    }

    fn default_branch(&self) -> Result<String, StoreError> {
        self.enter("default_branch")?;
        Ok(self.default_branch.clone())
    }
}
