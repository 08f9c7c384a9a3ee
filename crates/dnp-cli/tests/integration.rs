#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

fn dnp(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("dnp").unwrap();
    cmd.current_dir(dir.path()).env("DNP_ROOT", dir.path());
    cmd
}

fn init_root(dir: &TempDir) {
    dnp(dir)
        .args(["init", "--provider", "spotify"])
        .assert()
        .success();
}

fn json_out(cmd: &mut Command) -> serde_json::Value {
    let out = cmd.arg("--json").assert().success().get_output().stdout.clone();
    serde_json::from_slice(&out).unwrap()
}

/// Write a submission file and return its path.
fn write_submission(dir: &TempDir, key: &str, dry_run: bool) -> PathBuf {
    let body = serde_json::json!({
        "user": "user-1",
        "provider": "spotify",
        "idempotency_key": key,
        "dry_run": dry_run,
        "action_items": [
            { "entity_type": "track", "entity_id": "t1", "action": "remove" },
            { "entity_type": "artist", "entity_id": "a1", "action": "unfollow" },
            { "entity_type": "track", "entity_id": "t2", "action": "dislike" },
        ],
    });
    let path = dir.path().join(format!("{key}.json"));
    std::fs::write(&path, serde_json::to_vec_pretty(&body).unwrap()).unwrap();
    path
}

fn submit(dir: &TempDir, key: &str, dry_run: bool) -> String {
    let path = write_submission(dir, key, dry_run);
    let out = json_out(dnp(dir).args(["batch", "submit"]).arg(&path));
    out["batch"]["id"].as_str().unwrap().to_string()
}

// ---------------------------------------------------------------------------
// dnp init / config
// ---------------------------------------------------------------------------

#[test]
fn init_creates_state_tree() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);

    assert!(dir.path().join(".dnp").is_dir());
    assert!(dir.path().join(".dnp/previews").is_dir());
    assert!(dir.path().join(".dnp/config.yaml").exists());
    assert!(dir.path().join(".dnp/enforcement.db").exists());

    let config = std::fs::read_to_string(dir.path().join(".dnp/config.yaml")).unwrap();
    assert!(config.contains("spotify"));
}

#[test]
fn init_is_idempotent_and_adds_providers() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    dnp(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:"));

    let out = json_out(dnp(&dir).args(["init", "--provider", "tidal"]));
    assert_eq!(out["created_config"], false);
    assert_eq!(out["providers_added"], serde_json::json!(["tidal"]));
}

#[test]
fn init_rejects_bad_provider_name() {
    let dir = TempDir::new().unwrap();
    dnp(&dir)
        .args(["init", "--provider", "Not Valid"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid provider name"));
}

#[test]
fn commands_require_init() {
    let dir = TempDir::new().unwrap();
    dnp(&dir)
        .args(["batch", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("dnp init"));
}

#[test]
fn config_validate_passes_on_fresh_init() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    dnp(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn config_validate_fails_on_zero_rate() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    std::fs::write(
        dir.path().join(".dnp/config.yaml"),
        "providers:\n  spotify:\n    rate_limit:\n      requests_per_window: 0\n",
    )
    .unwrap();
    dnp(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("requests_per_window=0"));
}

#[test]
fn config_show_json_lists_providers() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    let out = json_out(dnp(&dir).args(["config", "show"]));
    assert!(out["providers"]["spotify"].is_object());
    assert_eq!(out["ledger"]["rollback_window_days"], 7);
}

// ---------------------------------------------------------------------------
// dnp batch
// ---------------------------------------------------------------------------

#[test]
fn batch_submit_is_idempotent() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    let path = write_submission(&dir, "k-1", false);

    dnp(&dir)
        .args(["batch", "submit"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Submitted batch"));
    dnp(&dir)
        .args(["batch", "submit"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"));

    let list = json_out(dnp(&dir).args(["batch", "list"]));
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["summary"]["total"], 3);
}

#[test]
fn batch_submit_reads_stdin() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    let path = write_submission(&dir, "k-stdin", false);
    let body = std::fs::read_to_string(path).unwrap();

    dnp(&dir)
        .args(["batch", "submit", "-"])
        .write_stdin(body)
        .assert()
        .success();
    let list = json_out(dnp(&dir).args(["batch", "list"]));
    assert_eq!(list[0]["idempotency_key"], "k-stdin");
}

#[test]
fn batch_show_lists_items() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    let id = submit(&dir, "k-1", false);

    let out = json_out(dnp(&dir).args(["batch", "show", &id]));
    assert_eq!(out["batch"]["status"], "pending");
    let items = out["items"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[2]["action"], "dislike");
    assert!(out["checkpoint"].is_null());
}

#[test]
fn batch_show_unknown_id_fails() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    dnp(&dir)
        .args(["batch", "show", "00000000-0000-0000-0000-000000000000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("batch not found"));
}

#[test]
fn batch_preview_runs_dry_run_and_saves_file() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    let id = submit(&dir, "k-dry", true);

    let summary = json_out(dnp(&dir).args(["batch", "preview", &id]));
    assert_eq!(summary["status"], "completed");
    assert_eq!(summary["dry_run"], true);
    assert_eq!(summary["succeeded"], 3);
    assert_eq!(summary["preview"].as_array().unwrap().len(), 3);

    let saved = dir.path().join(format!(".dnp/previews/{id}.json"));
    let on_disk: serde_json::Value =
        serde_json::from_slice(&std::fs::read(saved).unwrap()).unwrap();
    assert_eq!(on_disk["batch_id"], id.as_str());

    // A dry run never writes the ledger.
    let runs = json_out(dnp(&dir).args(["ledger", "list"]));
    assert!(runs.as_array().unwrap().is_empty());
}

#[test]
fn batch_preview_refuses_live_batch() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    let id = submit(&dir, "k-live", false);
    dnp(&dir)
        .args(["batch", "preview", &id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a dry run"));
}

#[test]
fn batch_cancel_then_cancel_again() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    let id = submit(&dir, "k-1", false);

    dnp(&dir)
        .args(["batch", "cancel", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cancelled batch"));
    dnp(&dir)
        .args(["batch", "cancel", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("already cancelled"));

    let out = json_out(dnp(&dir).args(["batch", "show", &id]));
    assert_eq!(out["batch"]["status"], "cancelled");
    assert_eq!(out["batch"]["halt_reason"], "cancelled");
}

// ---------------------------------------------------------------------------
// dnp provider / circuit / ledger
// ---------------------------------------------------------------------------

#[test]
fn provider_status_shows_fresh_state() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);

    let out = json_out(dnp(&dir).args(["provider", "status", "spotify"]));
    assert_eq!(out["provider"], "spotify");
    assert_eq!(out["configured"], true);
    assert_eq!(out["circuit"]["state"], "closed");

    let all = json_out(dnp(&dir).args(["provider", "status"]));
    assert_eq!(all.as_array().unwrap().len(), 1);

    dnp(&dir)
        .args(["provider", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("PROVIDER").and(predicate::str::contains("spotify")));
}

#[test]
fn circuit_reset_reports_closed() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    dnp(&dir)
        .args(["circuit", "reset", "spotify"])
        .assert()
        .success()
        .stdout(predicate::str::contains("is closed"));
}

#[test]
fn ledger_list_and_prune_on_empty_ledger() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    dnp(&dir)
        .args(["ledger", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Ledger is empty"));

    let report = json_out(dnp(&dir).args(["ledger", "prune"]));
    assert_eq!(report["entries_archived"], 0);
    assert!(report["runs_archived"].as_array().unwrap().is_empty());
}

#[test]
fn ledger_archived_flag_requires_run() {
    let dir = TempDir::new().unwrap();
    init_root(&dir);
    dnp(&dir)
        .args(["ledger", "list", "--archived"])
        .assert()
        .failure();
}
