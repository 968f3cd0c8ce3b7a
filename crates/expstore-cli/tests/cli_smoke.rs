use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

fn expstore(db: &Path) -> Command {
    let mut cmd = Command::cargo_bin("expstore").unwrap();
    cmd.env_remove("EXPSTORE_ACCESS_MODE")
        .env("EXPSTORE_LOG", "warn")
        .arg("--db")
        .arg(db);
    cmd
}

fn json_stdout(cmd: &mut Command) -> Value {
    let out = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&out).unwrap()
}

#[test]
fn triage_get_log_and_undo() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("exp.db");

    expstore(&db)
        .args(["triage", "--grouping", "circle", "--digest", "aaa", "--digest", "bbb"])
        .args(["--label", "positive", "--user", "alice"])
        .assert()
        .success()
        .stderr(contains("labeled 2 digest(s)"));

    let got = json_stdout(expstore(&db).arg("get"));
    assert_eq!(got.as_array().unwrap().len(), 2);
    assert_eq!(got[0]["digest"], "aaa");
    assert_eq!(got[0]["label"], "positive");

    let log = json_stdout(expstore(&db).args(["log", "--details"]));
    assert_eq!(log["total"], 1);
    let record = log["entries"][0]["id"].as_str().unwrap().to_string();
    assert_eq!(log["entries"][0]["details"].as_array().unwrap().len(), 2);

    let undo = json_stdout(expstore(&db).args(["undo", "--record", &record, "--user", "bob"]));
    assert_eq!(undo["undone"], record.as_str());

    let got = json_stdout(expstore(&db).arg("get"));
    assert!(got
        .as_array()
        .unwrap()
        .iter()
        .all(|d| d["label"] == "untriaged"));

    let history = json_stdout(expstore(&db).args(["history", "--grouping", "circle", "--digest", "aaa"]));
    assert_eq!(history.as_array().unwrap().len(), 2);
    assert_eq!(history[0]["user"], "bob");
}

#[test]
fn change_list_scope_is_separate() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("exp.db");

    expstore(&db)
        .args(["triage", "--change-list", "123", "--crs", "gerrit"])
        .args(["--grouping", "circle", "--digest", "aaa", "--label", "negative", "--user", "carol"])
        .assert()
        .success()
        .stderr(contains("gerrit_123"));

    let master = json_stdout(expstore(&db).arg("get"));
    assert!(master.as_array().unwrap().is_empty());
    let cl = json_stdout(expstore(&db).args(["get", "--change-list", "123"]));
    assert_eq!(cl[0]["label"], "negative");

    expstore(&db)
        .args(["get", "--change-list", "12/3"])
        .assert()
        .code(2);
}

#[test]
fn read_only_mode_refuses_writes() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("exp.db");

    expstore(&db)
        .env("EXPSTORE_ACCESS_MODE", "read_only")
        .args(["triage", "--grouping", "circle", "--digest", "aaa"])
        .args(["--label", "positive", "--user", "mallory"])
        .assert()
        .code(3)
        .stderr(contains("read-only"));
}

#[test]
fn gc_and_incomplete_commands() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("exp.db");

    expstore(&db)
        .args(["triage", "--grouping", "circle", "--digest", "aaa"])
        .args(["--label", "positive", "--user", "alice"])
        .assert()
        .success();

    let touched = json_stdout(expstore(&db).args(["touch", "--grouping", "circle", "--digest", "aaa"]));
    assert_eq!(touched["touched"], 1);

    // Nothing is older than the threshold yet.
    let marked = json_stdout(expstore(&db).args(["gc", "mark", "--label", "positive"]));
    assert_eq!(marked["marked"], 0);
    let collected = json_stdout(expstore(&db).args(["gc", "collect"]));
    assert_eq!(collected["deleted"], 0);

    expstore(&db)
        .args(["gc", "mark", "--label", "positive", "--older-than-days", "9223372036854775807"])
        .assert()
        .code(2)
        .stderr(contains("out of range"));

    let stuck = json_stdout(expstore(&db).arg("incomplete"));
    assert!(stuck.as_array().unwrap().is_empty());
}

#[test]
fn strict_config_rejects_unknown_keys() {
    let dir = TempDir::new().unwrap();
    let cfg = dir.path().join("expstore.yaml");
    std::fs::write(&cfg, "master_shards: 4\nbogus_key: 1\n").unwrap();

    Command::cargo_bin("expstore")
        .unwrap()
        .args(["--strict", "--config"])
        .arg(&cfg)
        .arg("get")
        .assert()
        .code(2)
        .stderr(contains("bogus_key"));
}
