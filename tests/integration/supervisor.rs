#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use common::{
    ECHO_SERVER, STUBBORN_SERVER, capture_stdout, is_process_alive, no_signals, test_config,
    test_server, wait_for_output, wait_for_path, wait_until, write_fake_java,
};
use mcsupervisor::{error::ServerError, properties::load_properties, server::ServerState};
use tempfile::tempdir;

#[test]
fn start_prepares_directory_and_launches_java() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let mut config = test_config(temp.path(), &java);
    config.properties.set("motd", "Integration");
    let server = test_server(config);
    let output = capture_stdout(&server);

    server.start(&no_signals()).expect("start failed");
    assert!(server.is_running());
    assert_eq!(server.state(), ServerState::Running);
    assert!(server.pid().is_some_and(|pid| pid > 0));
    wait_for_output(&output, "Alice joined the game");

    let world = temp.path().join("world");
    assert_eq!(fs::read_to_string(world.join("eula.txt")).unwrap(), "eula=true\n");
    let props = load_properties(&world.join("server.properties")).unwrap();
    assert_eq!(props.get("motd"), Some("Integration"));
    assert_eq!(props.get("server-port"), Some("25565"));

    wait_for_path(&world.join("args.txt"));
    assert!(wait_until(Duration::from_secs(5), || {
        fs::read_to_string(world.join("args.txt"))
            .map(|args| args.trim() == "-Xmx512M -Xms512M -jar server.jar nogui")
            .unwrap_or(false)
    }));
    let cwd = fs::read_to_string(world.join("cwd.txt")).unwrap();
    assert_eq!(
        fs::canonicalize(cwd.trim()).unwrap(),
        fs::canonicalize(&world).unwrap()
    );

    server.send_command("hello").expect("send_command failed");
    wait_for_output(&output, "got: hello");

    server.stop().expect("stop failed");
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(!server.is_running());
    assert_eq!(server.pid(), None);
}

#[test]
fn player_events_track_online_count() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));

    let joins = Arc::new(Mutex::new(Vec::new()));
    let leaves = Arc::new(Mutex::new(Vec::new()));
    {
        let joins = Arc::clone(&joins);
        server.on_player_join(move |name, count| {
            joins.lock().unwrap().push((name.to_string(), count))
        });
        let leaves = Arc::clone(&leaves);
        server.on_player_leave(move |name, count| {
            leaves.lock().unwrap().push((name.to_string(), count))
        });
    }

    server.start(&no_signals()).expect("start failed");
    assert!(wait_until(Duration::from_secs(5), || server.player_count() == 1));
    assert_eq!(*joins.lock().unwrap(), vec![("Alice".to_string(), 1)]);

    server.send_command("leave").unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        leaves.lock().unwrap().len() == 1
    }));
    assert_eq!(*leaves.lock().unwrap(), vec![("Alice".to_string(), 0)]);
    assert_eq!(server.player_count(), 0);

    server.stop().unwrap();
}

#[test]
fn stderr_is_delivered_separately() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));
    let stdout = capture_stdout(&server);
    let stderr = Arc::new(Mutex::new(String::new()));
    {
        let stderr = Arc::clone(&stderr);
        server.on_stderr(move |text| stderr.lock().unwrap().push_str(text));
    }

    server.start(&no_signals()).unwrap();
    server.send_command("oops").unwrap();

    wait_for_output(&stderr, "something broke");
    wait_for_output(&stdout, "got: oops");
    assert!(!stdout.lock().unwrap().contains("something broke"));

    server.stop().unwrap();
}

#[test]
fn world_commands_are_forwarded() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));
    let output = capture_stdout(&server);

    server.start(&no_signals()).unwrap();
    server.set_weather("rain").unwrap();
    server.set_time("noon").unwrap();
    assert!(matches!(
        server.set_time("dusk"),
        Err(ServerError::Validation { field: "time", .. })
    ));

    wait_for_output(&output, "got: weather rain");
    wait_for_output(&output, "got: time set noon");
    assert!(!output.lock().unwrap().contains("dusk"));

    server.stop().unwrap();
}

#[test]
fn second_start_is_rejected() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let config = test_config(temp.path(), &java);
    let server = test_server(config.clone());

    server.start(&no_signals()).unwrap();
    assert!(matches!(
        server.start(&no_signals()),
        Err(ServerError::AlreadyRunning(_))
    ));

    // A second supervisor on the same directory is locked out.
    let intruder = test_server(config);
    assert!(matches!(
        intruder.start(&no_signals()),
        Err(ServerError::AlreadyRunning(_))
    ));
    assert_eq!(intruder.state(), ServerState::NotStarted);

    server.stop().unwrap();
    intruder.start(&no_signals()).expect("lock should be free after stop");
    intruder.stop().unwrap();
}

#[test]
fn server_can_be_restarted_after_stop() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));

    server.start(&no_signals()).unwrap();
    let first = server.pid().unwrap();
    server.stop().unwrap();

    server.start(&no_signals()).unwrap();
    let second = server.pid().unwrap();
    assert_ne!(first, second);
    assert!(server.is_running());
    server.stop().unwrap();
}

#[test]
fn server_outlives_the_thread_that_started_it() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));
    let output = capture_stdout(&server);

    let starter = server.clone();
    thread::spawn(move || starter.start(&no_signals()).unwrap())
        .join()
        .expect("start thread panicked");
    let pid = server.pid().unwrap();

    thread::sleep(Duration::from_millis(1500));
    assert!(server.is_running(), "server exited with its starting thread");
    assert!(is_process_alive(pid));

    server.send_command("still here").unwrap();
    wait_for_output(&output, "got: still here");
    server.stop().unwrap();
}

#[test]
fn stubborn_process_is_killed_after_timeout() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), STUBBORN_SERVER);
    let mut config = test_config(temp.path(), &java);
    config.shutdown_timeout = Duration::from_secs(1);
    config.shutdown_poll_interval = Duration::from_millis(100);
    let server = test_server(config);
    let output = capture_stdout(&server);

    server.start(&no_signals()).unwrap();
    wait_for_output(&output, "ready");
    let pid = server.pid().unwrap();

    let began = Instant::now();
    server.stop().expect("forced stop should succeed");
    assert!(began.elapsed() >= Duration::from_secs(1));
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.pid(), None);

    assert!(
        wait_until(Duration::from_secs(5), || !is_process_alive(pid)),
        "process {pid} survived SIGKILL"
    );
}

#[test]
fn process_that_exits_on_its_own_is_reaped() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));

    server.start(&no_signals()).unwrap();
    server.send_command("stop").unwrap();

    assert!(wait_until(Duration::from_secs(5), || !server.is_running()));
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.pid(), None);
    assert!(matches!(server.stop(), Err(ServerError::NotRunning(_))));
    assert!(matches!(
        server.send_command("hello"),
        Err(ServerError::NotRunning(_))
    ));
}

#[test]
fn missing_java_fails_start_cleanly() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = temp.path().join("no-such-java");
    let server = test_server(test_config(temp.path(), &java));

    assert!(matches!(
        server.start(&no_signals()),
        Err(ServerError::Io(_))
    ));
    assert_eq!(server.state(), ServerState::NotStarted);
    assert!(!server.is_running());
}

#[test]
fn stats_sample_the_running_process() {
    let temp = tempdir().expect("failed to create tempdir");
    let java = write_fake_java(temp.path(), ECHO_SERVER);
    let server = test_server(test_config(temp.path(), &java));

    server.start(&no_signals()).unwrap();
    let stats = server.stats().expect("stats for running server");
    assert!(stats.memory_mb >= 0.0);
    server.stop().unwrap();

    assert!(matches!(server.stats(), Err(ServerError::NotRunning(_))));
}
