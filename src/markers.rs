//! Machine-readable markers carried in item comments.
//!
//! Comments double as the lock medium and the inter-agent mailbox. Each
//! comment is classified by trying the known grammars in a fixed order:
//!
//! 1. `ACK:<role>:<agent-id>:<epoch-ms>` on the first line
//! 2. `ESCALATION:<role>` on the first line, reason in the remainder
//! 3. a `<!-- <kind>:N -->` counter trailer anywhere in the body
//!
//! Anything else is [`Marker::Unrecognized`]. A body that looks almost like a
//! marker (missing field, non-numeric timestamp) is unrecognized, never guessed.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::store::Comment;

/// Counter families. Each has its own trailer tag and is counted independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// Local verification failures within one implementer claim.
    Local,
    /// Rework rounds after a reviewer requested changes.
    Review,
    /// Specification revisions by the spec-writer.
    Revision,
}

impl RetryKind {
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Local => "retry-count",
            Self::Review => "review-retry",
            Self::Revision => "spec-revision",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "retry-count" => Some(Self::Local),
            "review-retry" => Some(Self::Review),
            "spec-revision" => Some(Self::Revision),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Ack {
        role: String,
        agent: String,
        at_ms: i64,
    },
    RetryCount {
        kind: RetryKind,
        count: u32,
    },
    Escalation {
        role: String,
        reason: String,
    },
    Unrecognized,
}

pub fn parse(body: &str) -> Marker {
    parse_ack(body)
        .or_else(|| parse_escalation(body))
        .or_else(|| parse_retry(body))
        .unwrap_or(Marker::Unrecognized)
}

fn parse_ack(body: &str) -> Option<Marker> {
    let line = body.trim().lines().next()?.trim();
    let rest = line.strip_prefix("ACK:")?;
    let mut fields = rest.split(':');
    let role = fields.next().filter(|s| !s.is_empty())?;
    let agent = fields.next().filter(|s| !s.is_empty())?;
    let at_ms = fields.next()?.parse::<i64>().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(Marker::Ack {
        role: role.to_string(),
        agent: agent.to_string(),
        at_ms,
    })
}

fn parse_escalation(body: &str) -> Option<Marker> {
    let trimmed = body.trim_start();
    let (first, remainder) = trimmed.split_once('\n').unwrap_or((trimmed, ""));
    let role = first.trim().strip_prefix("ESCALATION:")?.trim();
    if role.is_empty() || role.contains(char::is_whitespace) {
        return None;
    }
    let reason = remainder
        .lines()
        .find_map(|l| l.trim().strip_prefix("Reason:").map(str::trim))
        .map_or_else(|| remainder.trim().to_string(), str::to_string);
    Some(Marker::Escalation {
        role: role.to_string(),
        reason,
    })
}

fn retry_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<!--\s*(retry-count|review-retry|spec-revision):(\d+)\s*-->")
            .expect("retry trailer regex is valid")
    })
}

fn parse_retry(body: &str) -> Option<Marker> {
    let caps = retry_re().captures(body)?;
    let kind = RetryKind::from_tag(caps.get(1)?.as_str())?;
    let count = caps.get(2)?.as_str().parse().ok()?;
    Some(Marker::RetryCount { kind, count })
}

/// `ACK:<role>:<agent-id>:<epoch-ms>`
pub fn ack(role: &str, agent: &str, at_ms: i64) -> String {
    format!("ACK:{role}:{agent}:{at_ms}")
}

pub fn retry_trailer(kind: RetryKind, count: u32) -> String {
    format!("<!-- {}:{count} -->", kind.tag())
}

pub fn escalation(role: &str, reason: &str, details: &str) -> String {
    let mut body = format!("ESCALATION:{role}\n\nReason: {reason}");
    if !details.trim().is_empty() {
        body.push_str("\n\n");
        body.push_str(details.trim());
    }
    body
}

/// Highest counter of `kind` among comments created at or after `since`.
pub fn highest_count(comments: &[Comment], kind: RetryKind, since: Option<DateTime<Utc>>) -> u32 {
    comments
        .iter()
        .filter(|c| since.is_none_or(|t| c.created_at >= t))
        .filter_map(|c| match parse(&c.body) {
            Marker::RetryCount { kind: k, count } if k == kind => Some(count),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

/// An escalation hand-off that no spec revision has answered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenEscalation {
    pub comment_id: u64,
    pub role: String,
    pub reason: String,
    pub body: String,
}

/// Latest escalation posted after the latest spec-revision marker.
pub fn unresolved_escalation(comments: &[Comment]) -> Option<OpenEscalation> {
    let mut open = None;
    for comment in sorted(comments) {
        match parse(&comment.body) {
            Marker::Escalation { role, reason } => {
                open = Some(OpenEscalation {
                    comment_id: comment.id,
                    role,
                    reason,
                    body: comment.body.clone(),
                });
            }
            Marker::RetryCount {
                kind: RetryKind::Revision,
                ..
            } => open = None,
            _ => {}
        }
    }
    open
}

/// Comments in timestamp order; equal timestamps keep store order.
pub fn sorted(comments: &[Comment]) -> Vec<&Comment> {
    let mut ordered: Vec<&Comment> = comments.iter().collect();
    ordered.sort_by_key(|c| c.created_at);
    ordered
}
