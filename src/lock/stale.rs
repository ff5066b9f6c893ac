//! Force-unlock of in-progress labels whose holder went quiet.
//!
//! The age of a lock is measured from the label history, not from comments:
//! the most recent time the in-progress label was added. Recovery is
//! unconditional once the timeout has passed; a still-running holder simply
//! loses its claim and finds out on its next transition.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, to_delta};
use crate::identity::Role;
use crate::markers::{self, Marker};
use crate::status::Status;
use crate::store::{Item, ItemKind, LabelEvent, LabelEventKind, RemoteStore, StoreError};

/// One completed force-unlock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovery {
    pub item: u64,
    pub from: Status,
    pub to: Status,
    pub age: TimeDelta,
}

pub struct StaleLockDetector<'a> {
    store: &'a dyn RemoteStore,
    clock: &'a dyn Clock,
    role: Role,
    timeout: Duration,
}

impl<'a> StaleLockDetector<'a> {
    pub fn new(store: &'a dyn RemoteStore, clock: &'a dyn Clock, role: Role, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            role,
            timeout,
        }
    }

    /// Check every ticket and change carrying one of `statuses`.
    ///
    /// A failure on one item is logged and does not stop the sweep; only a
    /// failed listing aborts it.
    #[instrument(skip_all, fields(role = %self.role))]
    pub fn sweep(&self, statuses: &[Status]) -> Result<Vec<Recovery>, StoreError> {
        let mut recovered = Vec::new();
        for &status in statuses {
            for kind in [ItemKind::Ticket, ItemKind::Change] {
                for item in self.store.list_items(kind, &status.label())? {
                    match self.check(&item, status) {
                        Ok(Some(r)) => recovered.push(r),
                        Ok(None) => {}
                        Err(e) => warn!(item = item.number, "stale check failed: {e}"),
                    }
                }
            }
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered stale locks");
        }
        Ok(recovered)
    }

    /// Recover `item` if it has sat in `status` for longer than the timeout.
    pub fn check(&self, item: &Item, status: Status) -> Result<Option<Recovery>, StoreError> {
        let events = self.store.label_events(item.number)?;
        let Some(entered) = self.entered_at(item.number, status, &events)? else {
            warn!(item = item.number, %status, "no label history or claim for in-progress item; skipping");
            return Ok(None);
        };

        let age = self.clock.now() - entered;
        let timeout = to_delta(self.timeout);
        if age <= timeout {
            debug!(item = item.number, age_secs = age.num_seconds(), "lock still fresh");
            return Ok(None);
        }

        let to = prior_status(&events, status, entered)
            .unwrap_or_else(|| status.recovery_default(item.kind()));

        // Remove failures are tolerated: a half-finished previous recovery may
        // have already taken the label off.
        if let Err(e) = self.store.remove_label(item.number, &status.label()) {
            warn!(item = item.number, "could not remove {status}: {e}");
        }
        self.store.add_label(item.number, &to.label())?;

        let body = format!(
            "**Stale lock recovered**: `{status}` -> `{to}`\n\n\
             The `{status}` label was applied {age} ago, past the {limit} timeout. \
             Returning the item to `{to}` so another agent can pick it up.",
            age = human(age),
            limit = human(timeout),
        );
        if let Err(e) = self.store.post_comment(item.number, &body) {
            warn!(item = item.number, "recovery comment not posted: {e}");
        }

        info!(item = item.number, from = %status, %to, age_secs = age.num_seconds(), "stale lock recovered");
        Ok(Some(Recovery {
            item: item.number,
            from: status,
            to,
            age,
        }))
    }

    /// When the item last entered `status`: the newest `Labeled` event for it,
    /// else the newest ACK for this role.
    fn entered_at(
        &self,
        number: u64,
        status: Status,
        events: &[LabelEvent],
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let label = status.label();
        let labeled = events
            .iter()
            .filter(|e| e.kind == LabelEventKind::Labeled && e.label == label)
            .map(|e| e.at)
            .max();
        if labeled.is_some() {
            return Ok(labeled);
        }

        let role = self.role.as_str();
        let comments = self.store.comments(number)?;
        Ok(comments
            .iter()
            .filter_map(|c| match markers::parse(&c.body) {
                Marker::Ack { role: r, at_ms, .. } if r == role => DateTime::from_timestamp_millis(at_ms),
                _ => None,
            })
            .max())
    }
}

/// The status the item held before it entered `current` at `entered`.
///
/// Prefers the last status label removed at or before entry (the `from` half
/// of the transition), then the last other status label added before entry.
pub fn prior_status(events: &[LabelEvent], current: Status, entered: DateTime<Utc>) -> Option<Status> {
    let mut ordered: Vec<&LabelEvent> = events.iter().filter(|e| e.at <= entered).collect();
    ordered.sort_by_key(|e| e.at);

    let status_of = |e: &&LabelEvent| Status::from_label(&e.label).filter(|s| *s != current);

    ordered
        .iter()
        .rev()
        .filter(|e| e.kind == LabelEventKind::Unlabeled)
        .find_map(status_of)
        .or_else(|| {
            ordered
                .iter()
                .rev()
                .filter(|e| e.kind == LabelEventKind::Labeled && e.at < entered)
                .find_map(status_of)
        })
}

fn human(delta: TimeDelta) -> String {
    let secs = delta.num_seconds();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
