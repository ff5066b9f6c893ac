use assert_cmd::Command;
use predicates::prelude::*;

fn relay() -> Command {
    let mut cmd = Command::cargo_bin("relay").unwrap();
    cmd.env_remove("RELAY_LOG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn schema_describes_the_config() {
    relay()
        .arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"repo\""))
        .stdout(predicate::str::contains("stale_timeout_minutes"));
}

#[test]
fn config_check_accepts_a_minimal_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".relay.toml");
    std::fs::write(&path, "repo = \"acme/widgets\"\n\n[lock]\nsettle_delay_ms = 500\n").unwrap();

    relay()
        .args(["config", "check", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("settle_delay_ms = 500"));
}

#[test]
fn config_is_found_in_the_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".relay.json"), r#"{"repo": "acme/widgets"}"#).unwrap();

    relay()
        .current_dir(dir.path())
        .args(["config", "check"])
        .assert()
        .success()
        .stderr(predicate::str::contains("config ok: acme/widgets"));
}

#[test]
fn invalid_config_exits_with_code_2() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".relay.toml");
    std::fs::write(&path, "repo = \"not-a-repo\"\n").unwrap();

    relay()
        .args(["config", "check", "--config"])
        .arg(&path)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("owner/name"));
}

#[test]
fn missing_config_exits_with_code_2() {
    let dir = tempfile::tempdir().unwrap();

    relay()
        .current_dir(dir.path())
        .args(["config", "check"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("pass --config"));
}

#[test]
fn run_requires_a_role() {
    relay()
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required arguments were not provided"));
}

#[test]
fn run_rejects_an_unknown_role() {
    relay()
        .args(["run", "janitor"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value 'janitor'"));
}

#[test]
fn doctor_reports_missing_tracker_cli() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".relay.toml");
    std::fs::write(
        &path,
        "repo = \"acme/widgets\"\n\n[store]\ngh_cli = \"relay-missing-gh\"\n\n[backend]\ncodex_cli = \"true\"\n\n[git]\nprogram = \"true\"\n",
    )
    .unwrap();

    relay()
        .args(["doctor", "--format", "json", "--config"])
        .arg(&path)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("\"repo acme/widgets\""))
        .stdout(predicate::str::contains("relay-missing-gh"))
        .stderr(predicate::str::contains("3 issue(s) found"));
}
