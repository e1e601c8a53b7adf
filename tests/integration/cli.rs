use std::{
    fs,
    path::Path,
    process::{Command as StdCommand, Stdio},
};

use assert_cmd::Command;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::tempdir;

fn write_config(dir: &Path) -> std::path::PathBuf {
    let world = dir.join("world");
    fs::create_dir_all(world.join("world")).unwrap();
    fs::write(world.join("world/level.dat"), b"level").unwrap();
    fs::write(world.join("server.properties"), "motd=CLI\n").unwrap();

    let config_path = dir.join("mcsv.yaml");
    fs::write(
        &config_path,
        r#"name: cli-test
version: "1.20.4"
directory: world
memory_mb: 512
eula: true
cache:
  enabled: false
"#,
    )
    .unwrap();
    config_path
}

fn mcsv() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("mcsv"))
}

#[test]
fn backup_list_and_restore_round_trip() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(temp.path());
    let world = temp.path().join("world");

    mcsv()
        .args(["backups", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    let output = mcsv()
        .args(["backup", "--config"])
        .arg(&config)
        .output()
        .expect("failed to run backup");
    assert!(output.status.success());
    let archive = String::from_utf8(output.stdout).unwrap().trim().to_string();
    assert!(archive.ends_with(".tar.gz"), "unexpected output: {archive}");
    assert!(Path::new(&archive).exists());

    mcsv()
        .args(["backups", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(contains(archive.as_str()));

    fs::remove_dir_all(world.join("world")).unwrap();
    fs::write(world.join("server.properties"), "motd=changed\n").unwrap();

    mcsv()
        .args(["restore", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(contains("Restored"));

    assert_eq!(fs::read(world.join("world/level.dat")).unwrap(), b"level");
    assert_eq!(
        fs::read_to_string(world.join("server.properties")).unwrap(),
        "motd=CLI\n"
    );
}

#[test]
fn restore_explicit_archive() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(temp.path());

    let output = mcsv()
        .args(["backup", "-c"])
        .arg(&config)
        .output()
        .unwrap();
    let archive = String::from_utf8(output.stdout).unwrap().trim().to_string();

    mcsv()
        .args(["restore", "-c"])
        .arg(&config)
        .args(["--archive", &archive])
        .assert()
        .success()
        .stdout(contains(archive.as_str()));
}

#[test]
fn restore_without_backups_fails() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(temp.path());

    mcsv()
        .args(["restore", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(contains("No backups found"));
}

#[test]
fn invalid_config_is_reported() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = temp.path().join("mcsv.yaml");
    fs::write(&config, "name: broken\nmemory: 1024\n").unwrap();

    mcsv()
        .args(["backups", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(contains("unknown field").and(contains("memory")));
}

#[test]
fn missing_config_is_reported() {
    let temp = tempdir().expect("failed to create tempdir");

    mcsv()
        .args(["backups", "--config"])
        .arg(temp.path().join("absent.yaml"))
        .assert()
        .failure()
        .stderr(contains("absent.yaml"));
}

#[test]
fn stats_reports_json_for_live_process() {
    let mut child = StdCommand::new("sleep")
        .arg("5")
        .stdout(Stdio::null())
        .spawn()
        .expect("failed to spawn sleep");

    mcsv()
        .args(["stats", "--json", "--pid", &child.id().to_string()])
        .assert()
        .success()
        .stdout(contains("\"cpu_percent\"").and(contains("\"thread_count\"")));

    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn stats_fails_for_unknown_pid() {
    mcsv()
        .args(["stats", "--pid", "999999999"])
        .assert()
        .failure()
        .stderr(contains("No process with PID"));
}

#[test]
fn rejects_invalid_log_level() {
    mcsv()
        .args(["backups", "--log-level", "loud"])
        .assert()
        .failure()
        .stderr(contains("invalid log level"));
}
