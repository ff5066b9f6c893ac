use std::io::IsTerminal;
use std::path::Path;
use std::time::Duration;

use clap::Args;
use serde::Serialize;

use super::load_config;
use crate::config::Config;
use crate::error::ExitError;
use crate::subprocess::Tool;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Args)]
pub struct DoctorArgs {
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub repo: String,
    pub backend: String,
    pub checks: Vec<CheckStatus>,
    pub issues: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckStatus {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

impl DoctorArgs {
    pub fn execute(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        let config = load_config(config_path)?;
        let report = diagnose(&config);

        let format = self.format.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                OutputFormat::Pretty
            } else {
                OutputFormat::Text
            }
        });
        match format {
            OutputFormat::Pretty => print_pretty(&report),
            OutputFormat::Text => print_text(&report),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        }

        if report.issues.is_empty() {
            return Ok(());
        }
        Err(ExitError::Other(format!("{} issue(s) found", report.issues.len())).into())
    }
}

/// Probe every external dependency an agent needs: the CLIs, tracker
/// authentication, and read access to the configured repository.
pub fn diagnose(config: &Config) -> DoctorReport {
    let gh = config.store.gh_cli.as_str();
    let backend = config.backend.cli();
    let checks = vec![
        probe("git", Tool::new(&config.git.program).arg("--version")),
        probe("gh", Tool::new(gh).arg("--version")),
        probe(&format!("backend ({backend})"), Tool::new(backend).arg("--version")),
        probe("gh auth", Tool::new(gh).args(&["auth", "status"])),
        probe(
            &format!("repo {}", config.repo),
            Tool::new(gh).args(&["api", &format!("repos/{}", config.repo), "--jq", ".full_name"]),
        ),
    ];
    let issues = checks
        .iter()
        .filter(|c| !c.ok)
        .map(|c| format!("{}: {}", c.name, c.detail))
        .collect();
    DoctorReport {
        repo: config.repo.clone(),
        backend: backend.to_string(),
        checks,
        issues,
    }
}

fn probe(name: &str, tool: Tool) -> CheckStatus {
    let (ok, detail) = match tool.env("GH_PROMPT_DISABLED", "1").timeout(PROBE_TIMEOUT).run() {
        // `gh auth status` reports on stderr.
        Ok(out) => (out.success(), first_line(&out.combined())),
        Err(e) => (false, e.to_string()),
    };
    CheckStatus {
        name: name.to_string(),
        ok,
        detail,
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_string()
}

fn print_pretty(report: &DoctorReport) {
    println!("=== Relay Doctor ===\n");
    println!("Repo:    {}", report.repo);
    println!("Backend: {}", report.backend);
    println!("\nChecks:");
    for check in &report.checks {
        let mark = if check.ok { "✓" } else { "✗" };
        println!("  {mark} {}: {}", check.name, check.detail);
    }
    if report.issues.is_empty() {
        println!("\n✓ No issues found");
    } else {
        println!("\nIssues ({}):", report.issues.len());
        for issue in &report.issues {
            println!("  • {issue}");
        }
    }
}

fn print_text(report: &DoctorReport) {
    println!("relay-doctor  repo={}  backend={}", report.repo, report.backend);
    for check in &report.checks {
        let status = if check.ok { "ok" } else { "failed" };
        println!("check  {}  {status}  {}", check.name, check.detail);
    }
    if !report.issues.is_empty() {
        println!("issues  count={}", report.issues.len());
    }
}
