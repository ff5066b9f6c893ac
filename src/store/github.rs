//! [`RemoteStore`] backed by the `gh` CLI.
//!
//! JSON coming back from `gh` is parsed tolerantly: unknown fields are
//! ignored, missing optional fields default, and line-delimited `--jq` output
//! skips lines that fail to decode instead of failing the whole read.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{
    BranchPair, BuildState, BuildStatus, CheckFailure, Comment, Item, ItemKind, LabelEvent,
    LabelEventKind, MergeMethod, NewChange, RemoteStore, StoreError,
};
use crate::subprocess::Tool;

const LIST_LIMIT: &str = "100";

pub struct GhStore {
    repo: String,
    gh: String,
}

impl GhStore {
    pub fn new(repo: &str, gh_cli: &str) -> Self {
        Self {
            repo: repo.to_string(),
            gh: gh_cli.to_string(),
        }
    }

    /// Run `gh` and return stdout, mapping any failure to [`StoreError::Request`].
    fn gh(&self, op: &'static str, args: &[&str]) -> Result<String, StoreError> {
        let output = Tool::new(&self.gh)
            .args(args)
            .env("GH_PROMPT_DISABLED", "1")
            .run()
            .map_err(|e| StoreError::Request {
                op,
                message: format!("{e:#}"),
            })?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(StoreError::Request {
                op,
                message: output.stderr.trim().to_string(),
            })
        }
    }

    fn issue_path(&self, number: u64, suffix: &str) -> String {
        format!("repos/{}/issues/{number}{suffix}", self.repo)
    }

    fn head_sha(&self, number: u64) -> Result<String, StoreError> {
        let n = number.to_string();
        let out = self.gh(
            "pr view",
            &["pr", "view", &n, "--repo", &self.repo, "--json", "headRefOid", "--jq", ".headRefOid"],
        )?;
        let sha = out.trim();
        if sha.is_empty() {
            return Err(StoreError::Decode {
                op: "pr view",
                message: "empty head sha".into(),
            });
        }
        Ok(sha.to_string())
    }
}

impl RemoteStore for GhStore {
    fn list_items(&self, kind: ItemKind, label: &str) -> Result<Vec<Item>, StoreError> {
        let (sub, fields) = match kind {
            ItemKind::Ticket => ("issue", "number,title,body,labels"),
            ItemKind::Change => ("pr", "number,title,body,labels,headRefName,baseRefName"),
        };
        let out = self.gh(
            "list",
            &[
                sub, "list", "--repo", &self.repo, "--label", label, "--state", "open", "--limit",
                LIST_LIMIT, "--json", fields,
            ],
        )?;
        parse_item_list(&out)
    }

    fn get_item(&self, number: u64) -> Result<Item, StoreError> {
        let path = self.issue_path(number, "");
        let out = match self.gh("get item", &["api", &path]) {
            Err(StoreError::Request { message, .. }) if message.contains("Not Found") => {
                return Err(StoreError::NotFound(number));
            }
            other => other?,
        };
        let raw: ApiIssue = decode("get item", &out)?;
        let branches = if raw.pull_request.is_some() {
            let n = number.to_string();
            let pr = self.gh(
                "pr view",
                &["pr", "view", &n, "--repo", &self.repo, "--json", "headRefName,baseRefName"],
            )?;
            let refs: PrRefs = decode("pr view", &pr)?;
            Some(BranchPair {
                head: refs.head_ref_name,
                base: refs.base_ref_name,
            })
        } else {
            None
        };
        Ok(Item {
            number: raw.number,
            title: raw.title,
            body: raw.body.unwrap_or_default(),
            labels: raw.labels.into_iter().map(|l| l.name).collect(),
            branches,
        })
    }

    fn comments(&self, number: u64) -> Result<Vec<Comment>, StoreError> {
        let path = self.issue_path(number, "/comments");
        let out = self.gh(
            "comments",
            &["api", &path, "--paginate", "--jq", ".[] | {id, body, created_at}"],
        )?;
        Ok(parse_lines::<ApiComment>(&out)
            .into_iter()
            .filter_map(|c| {
                Some(Comment {
                    id: c.id,
                    body: c.body.unwrap_or_default(),
                    created_at: parse_time(&c.created_at)?,
                })
            })
            .collect())
    }

    fn post_comment(&self, number: u64, body: &str) -> Result<(), StoreError> {
        let path = self.issue_path(number, "/comments");
        let field = format!("body={body}");
        self.gh("post comment", &["api", &path, "-f", &field]).map(drop)
    }

    fn add_label(&self, number: u64, label: &str) -> Result<(), StoreError> {
        let path = self.issue_path(number, "/labels");
        let field = format!("labels[]={label}");
        self.gh("add label", &["api", &path, "-f", &field]).map(drop)
    }

    fn remove_label(&self, number: u64, label: &str) -> Result<(), StoreError> {
        let path = self.issue_path(number, &format!("/labels/{}", encode_segment(label)));
        self.gh("remove label", &["api", "-X", "DELETE", &path]).map(drop)
    }

    fn label_events(&self, number: u64) -> Result<Vec<LabelEvent>, StoreError> {
        let path = self.issue_path(number, "/events");
        let out = self.gh(
            "label events",
            &[
                "api",
                &path,
                "--paginate",
                "--jq",
                r#".[] | select(.event == "labeled" or .event == "unlabeled") | {event, label: .label.name, created_at}"#,
            ],
        )?;
        Ok(parse_lines::<ApiLabelEvent>(&out)
            .into_iter()
            .filter_map(ApiLabelEvent::into_event)
            .collect())
    }

    fn create_item(&self, title: &str, body: &str, labels: &[String]) -> Result<u64, StoreError> {
        let mut args = vec!["issue", "create", "--repo", self.repo.as_str(), "--title", title, "--body", body];
        for label in labels {
            args.extend(["--label", label.as_str()]);
        }
        let out = self.gh("create item", &args)?;
        number_from_url(&out).ok_or_else(|| StoreError::Decode {
            op: "create item",
            message: format!("no item number in {:?}", out.trim()),
        })
    }

    fn update_body(&self, number: u64, body: &str) -> Result<(), StoreError> {
        let path = self.issue_path(number, "");
        let field = format!("body={body}");
        self.gh("update body", &["api", "-X", "PATCH", &path, "-f", &field]).map(drop)
    }

    fn open_change(&self, change: &NewChange<'_>) -> Result<u64, StoreError> {
        let mut args = vec![
            "pr", "create", "--repo", self.repo.as_str(), "--title", change.title, "--body", change.body,
            "--head", change.head, "--base", change.base,
        ];
        for label in change.labels {
            args.extend(["--label", label.as_str()]);
        }
        let out = self.gh("open change", &args)?;
        number_from_url(&out).ok_or_else(|| StoreError::Decode {
            op: "open change",
            message: format!("no change number in {:?}", out.trim()),
        })
    }

    fn change_diff(&self, number: u64) -> Result<String, StoreError> {
        let n = number.to_string();
        self.gh("change diff", &["pr", "diff", &n, "--repo", &self.repo])
    }

    fn approve_change(&self, number: u64, body: &str) -> Result<(), StoreError> {
        let n = number.to_string();
        self.gh(
            "approve",
            &["pr", "review", &n, "--repo", &self.repo, "--approve", "--body", body],
        )
        .map(drop)
    }

    fn request_changes(&self, number: u64, body: &str) -> Result<(), StoreError> {
        let n = number.to_string();
        self.gh(
            "request changes",
            &["pr", "review", &n, "--repo", &self.repo, "--request-changes", "--body", body],
        )
        .map(drop)
    }

    fn merge_change(&self, number: u64, method: MergeMethod) -> Result<(), StoreError> {
        let n = number.to_string();
        self.gh(
            "merge",
            &["pr", "merge", &n, "--repo", &self.repo, method.flag(), "--delete-branch"],
        )
        .map(drop)
    }

    fn build_status(&self, number: u64) -> Result<BuildStatus, StoreError> {
        let n = number.to_string();
        // `gh pr checks` exits non-zero while checks fail or are pending but
        // still prints the JSON, so the exit code alone is not an error.
        let output = Tool::new(&self.gh)
            .args(&["pr", "checks", &n, "--repo", &self.repo, "--json", "name,state,bucket"])
            .run()
            .map_err(|e| StoreError::Request {
                op: "build status",
                message: format!("{e:#}"),
            })?;
        if output.stdout.trim_start().starts_with('[') {
            return parse_checks(&output.stdout);
        }
        if output.stderr.contains("no checks reported") {
            return Ok(BuildStatus::of(BuildState::None));
        }
        Err(StoreError::Request {
            op: "build status",
            message: output.stderr.trim().to_string(),
        })
    }

    fn failed_checks(&self, number: u64) -> Result<Vec<CheckFailure>, StoreError> {
        let sha = self.head_sha(number)?;
        let path = format!("repos/{}/commits/{sha}/check-runs", self.repo);
        let out = self.gh(
            "failed checks",
            &[
                "api",
                &path,
                "--jq",
                r#".check_runs[] | select(.conclusion == "failure" or .conclusion == "timed_out") | {name, conclusion, html_url, title: .output.title, summary: .output.summary}"#,
            ],
        )?;
        Ok(parse_lines::<ApiCheckRun>(&out)
            .into_iter()
            .map(|c| CheckFailure {
                name: c.name,
                conclusion: c.conclusion.unwrap_or_default(),
                url: c.html_url,
                title: c.title,
                summary: c.summary,
            })
            .collect())
    }

    fn latest_review_feedback(&self, number: u64) -> Result<Option<String>, StoreError> {
        let path = format!("repos/{}/pulls/{number}/reviews", self.repo);
        let out = self.gh("reviews", &["api", &path, "--paginate", "--jq", ".[] | {state, body}"])?;
        Ok(latest_feedback(&parse_lines::<ApiReview>(&out)))
    }

    fn default_branch(&self) -> Result<String, StoreError> {
        let path = format!("repos/{}", self.repo);
        let out = self.gh("default branch", &["api", &path, "--jq", ".default_branch"])?;
        let branch = out.trim();
        if branch.is_empty() {
            Ok("main".to_string())
        } else {
            Ok(branch.to_string())
        }
    }
}

// --- wire shapes ---

#[derive(Debug, Deserialize)]
struct GhLabel {
    #[serde(default)]
    name: String,
}

/// One entry of `gh issue list` / `gh pr list --json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedItem {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GhLabel>,
    #[serde(default)]
    head_ref_name: Option<String>,
    #[serde(default)]
    base_ref_name: Option<String>,
}

/// `GET repos/{repo}/issues/{n}`; pull requests carry a `pull_request` key.
#[derive(Debug, Deserialize)]
struct ApiIssue {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GhLabel>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrRefs {
    head_ref_name: String,
    base_ref_name: String,
}

#[derive(Debug, Deserialize)]
struct ApiComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct ApiLabelEvent {
    event: String,
    #[serde(default)]
    label: Option<String>,
    created_at: String,
}

impl ApiLabelEvent {
    fn into_event(self) -> Option<LabelEvent> {
        let kind = match self.event.as_str() {
            "labeled" => LabelEventKind::Labeled,
            "unlabeled" => LabelEventKind::Unlabeled,
            _ => return None,
        };
        Some(LabelEvent {
            kind,
            label: self.label?,
            at: parse_time(&self.created_at)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiCheck {
    #[serde(default)]
    bucket: String,
}

#[derive(Debug, Deserialize)]
struct ApiCheckRun {
    #[serde(default)]
    name: String,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiReview {
    #[serde(default)]
    state: String,
    #[serde(default)]
    body: Option<String>,
}

// --- parsing helpers ---

fn decode<T: DeserializeOwned>(op: &'static str, json: &str) -> Result<T, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Decode {
        op,
        message: e.to_string(),
    })
}

/// Decode newline-delimited JSON, skipping lines that do not parse.
fn parse_lines<T: DeserializeOwned>(text: &str) -> Vec<T> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| match serde_json::from_str(l) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!("skipping undecodable gh line: {e}");
                None
            }
        })
        .collect()
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_item_list(json: &str) -> Result<Vec<Item>, StoreError> {
    let listed: Vec<ListedItem> = decode("list", json)?;
    Ok(listed
        .into_iter()
        .map(|raw| {
            let branches = match (raw.head_ref_name, raw.base_ref_name) {
                (Some(head), Some(base)) => Some(BranchPair { head, base }),
                _ => None,
            };
            Item {
                number: raw.number,
                title: raw.title,
                body: raw.body.unwrap_or_default(),
                labels: raw.labels.into_iter().map(|l| l.name).collect::<BTreeSet<_>>(),
                branches,
            }
        })
        .collect())
}

/// Aggregate per-check buckets (`pass`, `fail`, `pending`, `skipping`, `cancel`).
fn parse_checks(json: &str) -> Result<BuildStatus, StoreError> {
    let checks: Vec<ApiCheck> = decode("build status", json)?;
    if checks.is_empty() {
        return Ok(BuildStatus::of(BuildState::None));
    }
    if checks.iter().any(|c| matches!(c.bucket.as_str(), "fail" | "cancel")) {
        return Ok(BuildStatus::of(BuildState::Failure));
    }
    let pending = checks.iter().filter(|c| c.bucket == "pending").count();
    if pending > 0 {
        return Ok(BuildStatus {
            state: BuildState::Pending,
            pending,
        });
    }
    Ok(BuildStatus::of(BuildState::Success))
}

fn latest_feedback(reviews: &[ApiReview]) -> Option<String> {
    let with_body = |r: &&ApiReview| r.body.as_deref().is_some_and(|b| !b.trim().is_empty());
    reviews
        .iter()
        .rev()
        .filter(with_body)
        .find(|r| r.state == "CHANGES_REQUESTED")
        .or_else(|| reviews.iter().rev().find(with_body))
        .and_then(|r| r.body.clone())
}

/// `https://github.com/o/r/issues/12\n` -> 12
fn number_from_url(out: &str) -> Option<u64> {
    out.trim().rsplit('/').next()?.parse().ok()
}

/// Percent-encode a label for use as a URL path segment.
fn encode_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~' | b':') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_issue_list() {
        let json = r#"[
            {"number": 42, "title": "Add thing", "body": "spec", "labels": [{"name": "status:ready"}, {"name": "bug"}]},
            {"number": 43, "title": "No body", "body": null, "labels": []}
        ]"#;
        let items = parse_item_list(json).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].number, 42);
        assert!(items[0].labels.contains("status:ready"));
        assert_eq!(items[0].kind(), ItemKind::Ticket);
        assert_eq!(items[1].body, "");
    }

    #[test]
    fn parses_pr_list_with_branches() {
        let json = r#"[{"number": 7, "title": "t", "body": "Closes #3", "labels": [],
            "headRefName": "auto/issue-3", "baseRefName": "main", "isDraft": false}]"#;
        let items = parse_item_list(json).unwrap();
        assert_eq!(
            items[0].branches,
            Some(BranchPair {
                head: "auto/issue-3".into(),
                base: "main".into()
            })
        );
        assert_eq!(items[0].linked_ticket(), Some(3));
    }

    #[test]
    fn malformed_list_is_decode_error() {
        assert!(matches!(
            parse_item_list("not json"),
            Err(StoreError::Decode { .. })
        ));
    }

    #[test]
    fn comment_lines_skip_garbage() {
        let text = concat!(
            r#"{"id": 1, "body": "ACK:implementer:w-1:1700000000000", "created_at": "2024-01-01T10:00:00Z"}"#,
            "\n",
            "garbage\n",
            r#"{"id": 2, "body": null, "created_at": "2024-01-01T10:01:00Z"}"#,
        );
        let comments: Vec<ApiComment> = parse_lines(text);
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[1].id, 2);
    }

    #[test]
    fn label_events_keep_only_label_changes() {
        let text = concat!(
            r#"{"event": "labeled", "label": "status:ready", "created_at": "2024-01-01T09:59:00Z"}"#,
            "\n",
            r#"{"event": "unlabeled", "label": "status:ready", "created_at": "2024-01-01T10:00:00Z"}"#,
            "\n",
            r#"{"event": "labeled", "label": null, "created_at": "2024-01-01T10:00:00Z"}"#,
        );
        let events: Vec<LabelEvent> = parse_lines::<ApiLabelEvent>(text)
            .into_iter()
            .filter_map(ApiLabelEvent::into_event)
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, LabelEventKind::Unlabeled);
        assert_eq!(events[1].at, parse_time("2024-01-01T10:00:00Z").unwrap());
    }

    #[test]
    fn check_buckets_aggregate() {
        assert_eq!(parse_checks("[]").unwrap().state, BuildState::None);
        assert_eq!(
            parse_checks(r#"[{"bucket": "pass"}, {"bucket": "skipping"}]"#).unwrap().state,
            BuildState::Success
        );
        let pending = parse_checks(r#"[{"bucket": "pass"}, {"bucket": "pending"}, {"bucket": "pending"}]"#)
            .unwrap();
        assert_eq!(pending.state, BuildState::Pending);
        assert_eq!(pending.pending, 2);
        assert_eq!(
            parse_checks(r#"[{"bucket": "pending"}, {"bucket": "fail"}]"#).unwrap().state,
            BuildState::Failure
        );
    }

    #[test]
    fn feedback_prefers_latest_changes_requested() {
        let reviews = vec![
            ApiReview { state: "CHANGES_REQUESTED".into(), body: Some("old".into()) },
            ApiReview { state: "CHANGES_REQUESTED".into(), body: Some("new".into()) },
            ApiReview { state: "COMMENTED".into(), body: Some("chatter".into()) },
        ];
        assert_eq!(latest_feedback(&reviews).as_deref(), Some("new"));

        let only_comments = vec![ApiReview { state: "COMMENTED".into(), body: Some("note".into()) }];
        assert_eq!(latest_feedback(&only_comments).as_deref(), Some("note"));
        assert_eq!(latest_feedback(&[]), None);
    }

    #[test]
    fn item_numbers_come_from_urls() {
        assert_eq!(number_from_url("https://github.com/o/r/issues/12\n"), Some(12));
        assert_eq!(number_from_url("https://github.com/o/r/pull/9"), Some(9));
        assert_eq!(number_from_url("oops"), None);
    }

    #[test]
    fn labels_are_path_encoded() {
        assert_eq!(encode_segment("status:ready"), "status:ready");
        assert_eq!(encode_segment("needs review"), "needs%20review");
        assert_eq!(encode_segment("a/b"), "a%2Fb");
    }
}
