//! CLI integration tests for procflow-migrate.
//!
//! These tests verify command-line argument parsing, help output,
//! exit codes and end-to-end runs against snapshot files.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Get a command for the procflow-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("procflow-migrate").unwrap()
}

const SOURCE: &str = r#"[
  {"id": "p-1", "kind": "process", "version": 1, "payload": {"type": "process", "name": "Onboarding"}},
  {"id": "p-2", "kind": "process", "version": 1, "payload": {"type": "process", "name": "Offboarding"}},
  {"id": "e-1", "kind": "element", "version": 1,
   "payload": {"type": "element", "process_id": "p-1", "element_type": "task", "name": "Collect documents"}}
]"#;

/// Workspace with a config, a source snapshot and an empty target directory.
struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self::with_migration("  batch_size: 2\n")
    }

    fn with_migration(migration: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("source.json"), SOURCE).unwrap();
        let config = format!(
            "source:\n  path: source.json\ntarget:\n  path: target\nmigration:\n{}",
            migration
        );
        std::fs::write(dir.path().join("config.yaml"), config).unwrap();
        Self { dir }
    }

    fn config(&self) -> String {
        self.dir.path().join("config.yaml").display().to_string()
    }

    fn target(&self) -> PathBuf {
        self.dir.path().join("target")
    }

    fn seed_relational(&self, records: &str) {
        std::fs::create_dir_all(self.target()).unwrap();
        std::fs::write(self.target().join("relational.json"), records).unwrap();
    }

    fn relational_ids(&self) -> Vec<String> {
        read_ids(&self.target().join("relational.json"))
    }

    fn cmd(&self) -> Command {
        let mut cmd = cmd();
        cmd.args(["--config", &self.config(), "--verbosity", "error"]);
        cmd
    }
}

fn read_ids(path: &Path) -> Vec<String> {
    let records: Vec<Value> =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    records
        .iter()
        .map(|r| r["id"].as_str().unwrap().to_string())
        .collect()
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("gaps"))
        .stdout(predicate::str::contains("fix"))
        .stdout(predicate::str::contains("check-config"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--batch-size"))
        .stdout(predicate::str::contains("--continue-on-error"));
}

#[test]
fn test_fix_subcommand_help() {
    cmd()
        .args(["fix", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--yes"))
        .stdout(predicate::str::contains("--dry-run"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("procflow-migrate"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flags_and_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--progress"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--report-dir"))
        .stdout(predicate::str::contains("[default: config.yaml]"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("[default: info]"));
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Exit Code Tests - Config Errors
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_1() {
    // Missing file is an IO error, not a config error
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "check-config"])
        .assert()
        .code(1);
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "check-config"])
        .assert()
        .code(2);
}

#[test]
fn test_missing_required_fields_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "source:").unwrap();
    writeln!(file, "  path: legacy.json").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "check-config"])
        .assert()
        .code(2);
}

#[test]
fn test_zero_batch_size_exits_with_code_2() {
    let fixture = Fixture::with_migration("  batch_size: 0\n");
    fixture
        .cmd()
        .arg("check-config")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("batch_size"));
}

#[test]
fn test_check_config_ok() {
    Fixture::new()
        .cmd()
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("Batch size: 2"));
}

#[test]
fn test_unknown_scope_exits_with_code_2() {
    Fixture::new()
        .cmd()
        .args(["gaps", "--scope", "sideways"])
        .assert()
        .code(2);
}

// =============================================================================
// End-to-end Tests
// =============================================================================

#[test]
fn test_run_migrates_snapshot() {
    let fixture = Fixture::new();
    let output = fixture
        .cmd()
        .args(["--output-json", "run"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let result = stdout_json(&output);
    assert_eq!(result["status"], "success");
    assert_eq!(result["migrated_records"], 3);
    assert_eq!(result["gaps_after"]["total"], 0);

    let mut ids = fixture.relational_ids();
    ids.sort();
    assert_eq!(ids, vec!["e-1", "p-1", "p-2"]);
}

#[test]
fn test_dry_run_leaves_target_untouched() {
    let fixture = Fixture::new();
    let output = fixture
        .cmd()
        .args(["--output-json", "run", "--dry-run"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["dry_run"], true);
    assert!(!fixture.target().exists());
}

#[test]
fn test_run_writes_signed_result() {
    let fixture = Fixture::new();
    let reports = fixture.dir.path().join("reports");
    fixture
        .cmd()
        .args(["--report-dir", reports.to_str().unwrap(), "run"])
        .assert()
        .success();

    let artifacts: Vec<_> = std::fs::read_dir(&reports)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(artifacts.len(), 1);
    assert!(artifacts[0].starts_with("migration_result-"));

    let artifact: Value = serde_json::from_str(
        &std::fs::read_to_string(reports.join(&artifacts[0])).unwrap(),
    )
    .unwrap();
    assert!(artifact["hmac"].is_string());
    assert_eq!(artifact["payload"]["status"], "success");
}

#[test]
fn test_progress_lines_on_stderr() {
    Fixture::new()
        .cmd()
        .args(["--progress", "run"])
        .assert()
        .success()
        .stderr(predicate::str::contains(r#""event":"progress""#))
        .stderr(predicate::str::contains(r#""event":"complete""#));
}

#[test]
fn test_gaps_before_and_after_run() {
    let fixture = Fixture::new();

    let before = fixture
        .cmd()
        .args(["--output-json", "gaps", "--scope", "pre"])
        .output()
        .unwrap();
    assert!(before.status.success());
    let gaps = stdout_json(&before);
    let gaps = gaps.as_array().unwrap();
    assert_eq!(gaps.len(), 3);
    assert!(gaps.iter().all(|g| g["gap_type"] == "missing_record"));

    fixture.cmd().arg("run").assert().success();

    let after = fixture
        .cmd()
        .args(["--output-json", "gaps"])
        .output()
        .unwrap();
    assert!(after.status.success());
    assert_eq!(stdout_json(&after), serde_json::json!([]));
}

#[test]
fn test_gaps_single_kind() {
    let output = Fixture::new()
        .cmd()
        .args(["--output-json", "gaps", "--kind", "element"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(stdout_json(&output).as_array().unwrap().len(), 1);
}

const ORPHAN: &str = r#"[
  {"id": "p-9", "kind": "process", "version": 1, "payload": {"type": "process", "name": "Retired"}}
]"#;

#[test]
fn test_fix_without_confirmation_keeps_orphan() {
    let fixture = Fixture::new();
    fixture.cmd().arg("run").assert().success();
    let mut records: Vec<Value> = serde_json::from_str(
        &std::fs::read_to_string(fixture.target().join("relational.json")).unwrap(),
    )
    .unwrap();
    records.extend(serde_json::from_str::<Vec<Value>>(ORPHAN).unwrap());
    fixture.seed_relational(&serde_json::to_string(&records).unwrap());

    // stdin is not a terminal, so the prompt declines
    let output = fixture
        .cmd()
        .args(["--output-json", "fix"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["fixed"], 0);
    assert_eq!(report["skipped"], 1);
    assert!(fixture.relational_ids().contains(&"p-9".to_string()));
}

#[test]
fn test_fix_with_yes_repairs_target() {
    let fixture = Fixture::new();
    fixture.seed_relational(ORPHAN);
    let reports = fixture.dir.path().join("reports");

    let output = fixture
        .cmd()
        .args([
            "--output-json",
            "--report-dir",
            reports.to_str().unwrap(),
            "fix",
            "--yes",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report = stdout_json(&output);
    assert_eq!(report["failed"], 0);
    assert_eq!(report["fixed"], 4);

    let mut ids = fixture.relational_ids();
    ids.sort();
    assert_eq!(ids, vec!["e-1", "p-1", "p-2"]);

    assert!(reports.join("backups").read_dir().unwrap().count() >= 4);
    let has_report = std::fs::read_dir(&reports)
        .unwrap()
        .any(|e| e.unwrap().file_name().to_string_lossy().starts_with("fix_report-"));
    assert!(has_report);
}

#[test]
fn test_fix_dry_run_changes_nothing() {
    let fixture = Fixture::new();
    fixture.seed_relational(ORPHAN);

    let output = fixture
        .cmd()
        .args(["--output-json", "fix", "--yes", "--dry-run"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["dry_run"], true);
    assert_eq!(fixture.relational_ids(), vec!["p-9"]);
}
