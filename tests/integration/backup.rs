#[path = "common/mod.rs"]
mod common;

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::mpsc,
    time::Duration,
};

use common::{
    ECHO_SERVER, no_signals, test_config, test_server, wait_until, write_fake_java,
};
use mcsupervisor::{
    archive::{restore_backup, verify_backup},
    config::BackupSchedule,
    error::ServerError,
    schedule::{BackupOutcome, BackupScheduler},
    server::BackupMode,
};
use tempfile::tempdir;

fn seed_world(world: &Path) {
    fs::create_dir_all(world.join("world/region")).unwrap();
    fs::write(world.join("world/level.dat"), b"level data").unwrap();
    fs::write(world.join("world/region/r.0.0.mca"), vec![7u8; 64 * 1024]).unwrap();
    fs::write(world.join("ops.json"), "[]").unwrap();
}

#[test]
fn blocking_backup_round_trips_through_restore() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));
    let world = server.directory();
    seed_world(&world);

    let archive = server
        .backup(BackupMode::Blocking)
        .expect("backup failed")
        .expect("blocking backup returns a path");
    assert!(archive.starts_with(server.backup_dir()));
    verify_backup(&archive).expect("fresh archive verifies");
    assert_eq!(server.list_backups().unwrap(), vec![archive.clone()]);

    fs::remove_dir_all(world.join("world")).unwrap();
    fs::write(world.join("ops.json"), "[\"griefer\"]").unwrap();

    let summary = server.restore(&archive).expect("restore failed");
    assert!(summary.files >= 3);
    assert_eq!(fs::read(world.join("world/level.dat")).unwrap(), b"level data");
    assert_eq!(
        fs::read(world.join("world/region/r.0.0.mca")).unwrap().len(),
        64 * 1024
    );
    assert_eq!(fs::read_to_string(world.join("ops.json")).unwrap(), "[]");
    assert!(archive.exists(), "restore must not touch the backup store");
}

/// Every entry under `root` keyed by relative path; directories map to `None`.
fn snapshot(root: &Path) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Option<Vec<u8>>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let relative = path.strip_prefix(root).unwrap().to_path_buf();
            if path.is_dir() {
                out.insert(relative, None);
                walk(root, &path, out);
            } else {
                out.insert(relative, Some(fs::read(&path).unwrap()));
            }
        }
    }

    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

#[test]
fn restore_into_fresh_directory_reproduces_the_tree() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));
    let world = server.directory();
    seed_world(&world);
    fs::create_dir_all(world.join("world/empty")).unwrap();
    fs::write(world.join("server.properties"), "motd=Fresh\n").unwrap();

    let archive = server.backup(BackupMode::Blocking).unwrap().unwrap();
    let fresh = temp.path().join("fresh");
    restore_backup(&archive, &fresh).expect("restore into fresh directory");

    let mut expected = snapshot(&world);
    expected.retain(|path, _| !path.starts_with("backups"));
    assert_eq!(snapshot(&fresh), expected);
    assert!(!fresh.join("backups").exists());
}

#[test]
fn detached_backup_reports_through_callback() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));
    seed_world(&server.directory());

    let (tx, rx) = mpsc::channel();
    server.on_backup_finished(move |result| {
        let _ = tx.send(result.as_ref().cloned().map_err(|e| e.to_string()));
    });

    assert_eq!(server.backup(BackupMode::Detached).unwrap(), None);
    let archive = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("reporter was not called")
        .expect("detached backup failed");
    assert!(archive.exists());
}

#[test]
fn detached_backup_reports_unusable_store_to_caller() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));
    seed_world(&server.directory());
    fs::write(server.backup_dir(), "in the way").unwrap();

    let (tx, rx) = mpsc::channel();
    server.on_backup_finished(move |_| {
        let _ = tx.send(());
    });

    assert!(matches!(
        server.backup(BackupMode::Detached),
        Err(ServerError::Io(_))
    ));
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
}

#[test]
fn concurrent_backups_never_share_a_file() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));
    seed_world(&server.directory());

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let server = server.clone();
            std::thread::spawn(move || server.backup(BackupMode::Blocking).unwrap().unwrap())
        })
        .collect();
    let mut archives: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    archives.sort();
    archives.dedup();

    assert_eq!(archives.len(), 3);
    for archive in &archives {
        verify_backup(archive).unwrap();
    }
}

#[test]
fn backup_while_running_and_restore_requires_stop() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));
    seed_world(&server.directory());

    server.start(&no_signals()).unwrap();
    let archive = server.backup(BackupMode::Blocking).unwrap().unwrap();

    assert!(matches!(
        server.restore(&archive),
        Err(ServerError::AlreadyRunning(_))
    ));

    server.stop().unwrap();
    server.restore(&archive).expect("restore after stop");
    assert_eq!(server.latest_backup().unwrap(), Some(archive));
}

#[test]
fn scheduler_runs_backups_and_prunes() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));
    seed_world(&server.directory());

    let scheduler = BackupScheduler::spawn(
        server.clone(),
        &BackupSchedule {
            schedule: "* * * * * *".into(),
            timezone: None,
            retain: Some(2),
        },
    )
    .expect("scheduler should start");
    assert!(scheduler.next_run().is_some());

    assert!(
        wait_until(Duration::from_secs(15), || scheduler.history().len() >= 3),
        "scheduler did not run three backups"
    );
    scheduler.stop();

    let backups = server.list_backups().unwrap();
    assert!(!backups.is_empty());
    assert!(backups.len() <= 2, "expected pruning, found {backups:?}");
}

#[test]
fn scheduler_records_failures() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));
    // The server directory is a plain file, so archiving it fails.
    fs::write(server.directory(), "not a directory").unwrap();

    let scheduler = BackupScheduler::spawn(
        server,
        &BackupSchedule {
            schedule: "* * * * * *".into(),
            timezone: Some("UTC".into()),
            retain: None,
        },
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(10), || !scheduler
        .history()
        .is_empty()));
    let history = scheduler.history();
    assert!(matches!(history[0].outcome, BackupOutcome::Failed(_)));
}
