#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use mcsupervisor::{
    config::ServerConfig,
    constants::SERVER_JAR_NAME,
    download::{ArtifactResolver, CacheOptions},
    error::DownloadError,
    server::{Server, StartOptions},
};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Echoes console input back as `got: <line>`, announces Alice on start, and reacts to the
/// `leave`, `oops` and `stop` commands. Dies on SIGTERM.
pub const ECHO_SERVER: &str = r#"#!/bin/sh
pwd > cwd.txt
echo "$@" > args.txt
echo "[12:00:00] [Server thread/INFO]: Starting minecraft server"
echo "[12:00:01] [Server thread/INFO]: Alice joined the game"
while IFS= read -r line; do
  echo "got: $line"
  case "$line" in
    leave) echo "[12:00:02] [Server thread/INFO]: Alice left the game" ;;
    oops) echo "something broke" >&2 ;;
    stop) exit 0 ;;
  esac
done
"#;

/// Ignores SIGTERM so shutdown has to escalate.
pub const STUBBORN_SERVER: &str = r#"#!/bin/sh
trap '' TERM
echo "ready"
while true; do sleep 0.1; done
"#;

/// Writes an executable stand-in for `java` into `dir`.
pub fn write_fake_java(dir: &Path, script: &str) -> PathBuf {
    let path = dir.join("fake-java.sh");
    fs::write(&path, script).expect("failed to write fake java");
    let mut perms = fs::metadata(&path).expect("failed to stat fake java").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("failed to chmod fake java");
    path
}

/// Resolver that drops a placeholder jar instead of downloading one.
pub struct StubResolver;

impl ArtifactResolver for StubResolver {
    fn fetch_server_artifact(
        &self,
        _version_spec: &str,
        target_dir: &Path,
        _cache: &CacheOptions,
    ) -> Result<PathBuf, DownloadError> {
        let jar = target_dir.join(SERVER_JAR_NAME);
        fs::write(&jar, b"not really a jar")?;
        Ok(jar)
    }
}

/// Configuration for a server living in `<root>/world` and launched through `java`.
pub fn test_config(root: &Path, java: &Path) -> ServerConfig {
    ServerConfig {
        name: "test".into(),
        directory: root.join("world"),
        memory_mb: 512,
        eula: true,
        java: java.display().to_string(),
        shutdown_timeout: Duration::from_secs(5),
        shutdown_poll_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    }
}

pub fn test_server(config: ServerConfig) -> Server {
    Server::with_resolver(config, Arc::new(StubResolver))
}

pub fn no_signals() -> StartOptions {
    StartOptions {
        handle_signals: false,
        ..StartOptions::default()
    }
}

/// Collects everything the server prints to stdout.
pub fn capture_stdout(server: &Server) -> Arc<Mutex<String>> {
    let output = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&output);
    server.on_stdout(move |text| sink.lock().unwrap().push_str(text));
    output
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

pub fn wait_for_output(output: &Mutex<String>, needle: &str) {
    let found = wait_until(Duration::from_secs(5), || {
        output.lock().unwrap().contains(needle)
    });
    assert!(
        found,
        "Timed out waiting for '{needle}' in output: {:?}",
        output.lock().unwrap()
    );
}

pub fn wait_for_path(path: &Path) {
    assert!(
        wait_until(Duration::from_secs(5), || path.exists()),
        "Timed out waiting for {:?} to exist",
        path
    );
}

pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system.process(Pid::from_u32(pid)).is_some()
}
