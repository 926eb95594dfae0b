mod common;

use assert_cmd::Command;
use canopy::overlay::DetachedBackend;
use common::{get_canopy_path, Workspace};
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn canopy(home: &Path) -> Command {
    let mut cmd = Command::new(get_canopy_path());
    cmd.env("CANOPY_CONFIG_DIR", home.join("config"))
        .env("CANOPY_DATA_DIR", home.join("data"))
        .env("CANOPY_LOG", "warn");
    cmd
}

#[test]
fn test_help_lists_commands() {
    let dir = tempfile::tempdir().unwrap();
    canopy(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("unlock"));
}

#[test]
fn test_list_with_no_state_prints_empty_array() {
    let dir = tempfile::tempdir().unwrap();
    canopy(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::diff("[]\n"));
}

#[test]
fn test_lock_unknown_job_fails() {
    let dir = tempfile::tempdir().unwrap();
    canopy(dir.path())
        .args(["lock", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not found"));
}

#[test]
fn test_serve_requires_base() {
    let dir = tempfile::tempdir().unwrap();
    canopy(dir.path())
        .args(["serve", "job-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--base"));
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = dir.path().join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(config_dir.join("config.toml"), "[fuse]\nworkers = 0\n").unwrap();

    canopy(dir.path())
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("workers"));
}

#[test]
fn test_list_reads_recorded_mounts_and_lock_round_trips() {
    let ws = Workspace::new(&[]);
    let home = ws.path().join("home");
    let data_dir = home.join("data");

    let mut settings = ws.settings();
    settings.upper_root = data_dir.join("uppers");
    settings.changelist_root = data_dir.join("changelists");
    settings.mount_root = data_dir.join("mounts");
    settings.state_file = data_dir.join("registry.json");
    {
        let registry =
            canopy::MountRegistry::open(settings, Arc::new(DetachedBackend::new())).unwrap();
        registry
            .mount("job-a", &ws.mount_path("a"), Arc::clone(&ws.base), None)
            .unwrap();
        registry.shutdown().unwrap();
    }

    canopy(&home)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"job_id\": \"job-a\""))
        .stdout(predicate::str::contains("\"state\": \"unmounted\""));

    canopy(&home)
        .args(["lock", "job-a"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"locked\": true"));

    canopy(&home)
        .args(["remove", "job-a"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("locked"));

    canopy(&home)
        .args(["unlock", "job-a"])
        .assert()
        .success();
    canopy(&home)
        .args(["remove", "job-a"])
        .assert()
        .success();

    canopy(&home)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::diff("[]\n"));
}

#[test]
fn test_admin_commands_refuse_while_a_server_owns_the_state() {
    let ws = Workspace::new(&[]);
    let home = ws.path().join("home");
    let data_dir = home.join("data");

    let mut settings = ws.settings();
    settings.upper_root = data_dir.join("uppers");
    settings.changelist_root = data_dir.join("changelists");
    settings.mount_root = data_dir.join("mounts");
    settings.state_file = data_dir.join("registry.json");
    let server = canopy::MountRegistry::open(settings, Arc::new(DetachedBackend::new())).unwrap();
    server
        .mount("job-a", &ws.mount_path("a"), Arc::clone(&ws.base), None)
        .unwrap();

    for command in ["lock", "unlock", "remove"] {
        canopy(&home)
            .args([command, "job-a"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("canopy serve"));
    }
    assert!(!server.get("job-a").unwrap().locked);

    canopy(&home)
        .args(["lock", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("`canopy serve`"));
}
