//! Parsing of backend review output.
//!
//! The review prompt asks for a JSON object. Backends wrap it in prose or a
//! code fence often enough that the first `{` to the last `}` is extracted
//! before parsing. When no JSON parses, a `DECISION: APPROVE` or
//! `DECISION: CHANGES_REQUESTED` line is accepted instead.

use std::fmt::Write as _;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approve,
    ChangesRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    Minor,
    Trivial,
    #[serde(other)]
    Unknown,
}

impl Severity {
    pub const fn is_blocking(self) -> bool {
        matches!(self, Self::Critical | Self::Major)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::Major => "MAJOR",
            Self::Minor => "MINOR",
            Self::Trivial => "TRIVIAL",
            Self::Unknown => "NOTE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    #[serde(default)]
    pub file: String,
    #[serde(default, deserialize_with = "line_number")]
    pub line: Option<u64>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReviewVerdict {
    pub decision: Option<Decision>,
    #[serde(default)]
    pub summary: String,
    #[serde(default, rename = "issues")]
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("review output has neither a JSON verdict nor a DECISION line")]
pub struct UnparseableVerdict;

impl ReviewVerdict {
    pub fn parse(output: &str) -> Result<Self, UnparseableVerdict> {
        if let Some(verdict) = extract_json(output) {
            return Ok(verdict);
        }
        decision_line(output)
            .map(|decision| Self {
                decision: Some(decision),
                summary: output.trim().to_string(),
                findings: Vec::new(),
            })
            .ok_or(UnparseableVerdict)
    }

    /// Any critical or major finding, or an explicit request for changes.
    pub fn blocking(&self) -> bool {
        self.decision == Some(Decision::ChangesRequested)
            || self.findings.iter().any(|f| f.severity.is_blocking())
    }

    /// Markdown body for a change request: blocking findings first.
    pub fn change_request_body(&self) -> String {
        let mut body = String::from("## Changes requested\n\n");
        let mut findings: Vec<&Finding> = self.findings.iter().collect();
        findings.sort_by_key(|f| f.severity);
        for f in findings {
            write_finding(&mut body, f);
        }
        if !self.summary.is_empty() {
            let _ = write!(body, "\n## Summary\n\n{}\n", self.summary);
        }
        body
    }

    /// Markdown body for an approval, listing non-blocking notes.
    pub fn approval_body(&self, reviewer: &str) -> String {
        let mut body = format!("## Approved by `{reviewer}`\n\n");
        if !self.summary.is_empty() {
            let _ = writeln!(body, "{}\n", self.summary);
        }
        let notes: Vec<&Finding> = self.findings.iter().filter(|f| !f.severity.is_blocking()).collect();
        if !notes.is_empty() {
            body.push_str("### Notes\n\n");
            for f in notes {
                write_finding(&mut body, f);
            }
        }
        body
    }
}

fn write_finding(out: &mut String, f: &Finding) {
    let location = match (f.file.as_str(), f.line) {
        ("", _) => String::new(),
        (file, Some(line)) => format!(" {file}:{line}"),
        (file, None) => format!(" {file}"),
    };
    let _ = writeln!(out, "- **[{}]**{location} {}", f.severity.as_str(), f.description);
    if !f.suggestion.is_empty() {
        let _ = writeln!(out, "  - Suggestion: {}", f.suggestion);
    }
}

fn extract_json(output: &str) -> Option<ReviewVerdict> {
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&output[start..=end]).ok()
}

fn decision_line(output: &str) -> Option<Decision> {
    output.lines().find_map(|line| {
        let rest = line.trim().trim_start_matches(['#', '*', ' ']);
        let value = rest
            .get(..9)
            .filter(|p| p.eq_ignore_ascii_case("decision:"))
            .map(|_| rest[9..].trim().trim_matches('*').trim().to_ascii_uppercase())?;
        if value.starts_with("APPROVE") {
            Some(Decision::Approve)
        } else if value.starts_with("CHANGES_REQUESTED") || value.starts_with("REQUEST_CHANGES") {
            Some(Decision::ChangesRequested)
        } else {
            None
        }
    })
}

/// Backends emit `line` as a number, a numeric string, or null.
fn line_number<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
