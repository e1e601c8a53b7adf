#[path = "common/mod.rs"]
mod common;

use std::{sync::Mutex, time::Duration};

use common::{ECHO_SERVER, test_config, test_server, wait_until, write_fake_java};
use mcsupervisor::{
    server::{ServerState, StartOptions},
    signals::subscriber_count,
};
use nix::sys::signal::{Signal, raise};
use tempfile::tempdir;

/// Signals reach every subscriber in the process, so these tests must not overlap.
static SIGNAL_LOCK: Mutex<()> = Mutex::new(());

fn with_signals() -> StartOptions {
    StartOptions {
        handle_signals: true,
        ..StartOptions::default()
    }
}

#[test]
fn terminate_signal_stops_the_server() {
    let _guard = SIGNAL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));

    server.start(&with_signals()).unwrap();
    assert_eq!(subscriber_count(), 1);

    raise(Signal::SIGTERM).expect("raise failed");
    assert!(
        wait_until(Duration::from_secs(10), || server.state() == ServerState::Stopped),
        "server still {} after SIGTERM",
        server.state()
    );

    // The subscription outlives the process and goes away with the server.
    assert_eq!(subscriber_count(), 1);
    drop(server);
    assert!(wait_until(Duration::from_secs(5), || subscriber_count() == 0));
}

#[test]
fn reload_signal_restarts_the_server() {
    let _guard = SIGNAL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));

    server.start(&with_signals()).unwrap();
    let first = server.pid().unwrap();

    raise(Signal::SIGHUP).expect("raise failed");
    assert!(
        wait_until(Duration::from_secs(10), || {
            server.is_running() && server.pid().is_some_and(|pid| pid != first)
        }),
        "server was not restarted after SIGHUP"
    );

    // Restarting reuses the existing subscription.
    assert_eq!(subscriber_count(), 1);

    server.stop().unwrap();
    drop(server);
    assert!(wait_until(Duration::from_secs(5), || subscriber_count() == 0));
}
