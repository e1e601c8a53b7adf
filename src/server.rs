//! Supervision of a single Minecraft server process.
//!
//! A [`Server`] owns at most one child JVM. Starting it validates the configuration, prepares
//! the working directory, fetches the server jar and spawns the process with every standard
//! stream piped. Reader threads turn the output into [`ServerEvent`]s; stopping sends SIGTERM
//! and escalates to SIGKILL once the grace period runs out.
use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak, mpsc},
    thread,
    time::Instant,
};

use fs2::FileExt;
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use strum_macros::AsRefStr;
use tracing::{debug, error, info, warn};

use crate::{
    archive::{self, RestoreSummary},
    config::ServerConfig,
    constants::{
        BACKUP_DIR_NAME, EULA_ACCEPTED_CONTENT, EULA_FILE_NAME, LOCK_FILE_NAME, MEMORY_STEP_MB,
        METADATA_DIR_NAME, NO_GUI_FLAG, PROPERTIES_FILE_NAME, READ_BUFFER_SIZE,
        SERVER_PORT_PROPERTY,
    },
    download::{ArtifactResolver, CacheOptions, MojangResolver},
    error::{ArchiveError, ServerError},
    events::{EventExtractor, EventHandlers, ServerEvent, StreamKind},
    properties::{Properties, merge_properties},
    signals::{self, SignalKind, SignalSubscription},
    stats::{ServerStats, sample_process, total_memory_mb},
    world::{Difficulty, TimeOfDay, Weather, parse_setting},
};

/// Lifecycle of the supervised process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ServerState {
    #[default]
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Options for a single start. Reused verbatim when a reload signal restarts the server.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Manifest cache used while resolving the server jar.
    pub cache: CacheOptions,
    /// Install SIGINT/SIGTERM/SIGHUP handling for this server.
    pub handle_signals: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            cache: CacheOptions::default(),
            handle_signals: true,
        }
    }
}

/// How [`Server::backup`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    /// Archive on the calling thread and return the archive path.
    Blocking,
    /// Archive on a background thread; the outcome goes to the backup reporter.
    Detached,
}

/// Receives the outcome of every backup.
pub type BackupCallback = Arc<dyn Fn(&Result<PathBuf, ArchiveError>) + Send + Sync>;

#[derive(Default)]
struct Runtime {
    state: ServerState,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    /// Exclusive lock on the server directory, held while the process runs.
    lock: Option<File>,
    parent: Option<ParentThread>,
    signals: Option<SignalSubscription>,
}

impl Runtime {
    fn clear_process(&mut self, state: ServerState) {
        self.state = state;
        self.child = None;
        self.stdin = None;
        self.pid = None;
        self.lock = None;
        self.parent = None;
    }
}

#[derive(Default)]
struct EventState {
    players: usize,
    handlers: EventHandlers,
}

// Lock order: runtime, then settings. `events` is never held together with either.
struct Inner {
    settings: Mutex<ServerConfig>,
    runtime: Mutex<Runtime>,
    events: Arc<Mutex<EventState>>,
    backup_reporter: Mutex<Option<BackupCallback>>,
    resolver: Arc<dyn ArtifactResolver>,
}

/// Handle to a supervised server. Clones share the same process.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Launched {
    child: Child,
    stdin: Option<ChildStdin>,
    lock: File,
    parent: ParentThread,
}

/// Keeps the thread that forked the server process alive.
///
/// The child is started with `PR_SET_PDEATHSIG`, which fires when the forking thread exits
/// rather than the whole supervisor. That thread parks until this guard is dropped.
struct ParentThread {
    _release: mpsc::Sender<()>,
}

fn recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Server {
    /// Creates a server that downloads artifacts from Mojang.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        Ok(Self::with_resolver(config, Arc::new(MojangResolver::new()?)))
    }

    /// Creates a server that obtains its jar from `resolver`.
    pub fn with_resolver(config: ServerConfig, resolver: Arc<dyn ArtifactResolver>) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings: Mutex::new(config),
                runtime: Mutex::new(Runtime::default()),
                events: Arc::new(Mutex::new(EventState::default())),
                backup_reporter: Mutex::new(None),
                resolver,
            }),
        }
    }

    pub fn name(&self) -> String {
        recover(&self.inner.settings).name.clone()
    }

    pub fn directory(&self) -> PathBuf {
        recover(&self.inner.settings).directory.clone()
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> ServerConfig {
        recover(&self.inner.settings).clone()
    }

    /// Marks the EULA as accepted. Required before [`Server::start`].
    pub fn accept_eula(&self) {
        recover(&self.inner.settings).eula = true;
    }

    pub fn state(&self) -> ServerState {
        let mut runtime = recover(&self.inner.runtime);
        self.reap_exited(&mut runtime);
        runtime.state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// PID of the live process.
    pub fn pid(&self) -> Option<u32> {
        let mut runtime = recover(&self.inner.runtime);
        self.reap_exited(&mut runtime);
        runtime.pid
    }

    /// Players currently online according to the log.
    pub fn player_count(&self) -> usize {
        recover(&self.inner.events).players
    }

    /// Starts the server process.
    ///
    /// Configuration problems are reported before anything touches the disk. If a later step
    /// fails, the state reverts and no process is left behind.
    pub fn start(&self, options: &StartOptions) -> Result<(), ServerError> {
        let (config, previous) = {
            let mut runtime = self.inner.runtime.lock()?;
            self.reap_exited(&mut runtime);
            if !matches!(
                runtime.state,
                ServerState::NotStarted | ServerState::Stopped
            ) {
                return Err(ServerError::AlreadyRunning(self.name()));
            }

            let config = self.validated_config()?;
            let previous = runtime.state;
            runtime.state = ServerState::Starting;
            (config, previous)
        };

        info!("Starting server '{}' in {}", config.name, config.directory.display());
        match self.launch(&config, options) {
            Ok(launched) => {
                let pid = launched.child.id();
                let mut runtime = recover(&self.inner.runtime);
                runtime.state = ServerState::Running;
                runtime.pid = Some(pid);
                runtime.child = Some(launched.child);
                runtime.stdin = launched.stdin;
                runtime.lock = Some(launched.lock);
                runtime.parent = Some(launched.parent);
                info!("Server '{}' started with PID {pid}", config.name);
                Ok(())
            }
            Err(err) => {
                recover(&self.inner.runtime).state = previous;
                error!("Failed to start server '{}': {err}", config.name);
                Err(err)
            }
        }
    }

    /// Fills in a generated name when needed and checks every start precondition.
    fn validated_config(&self) -> Result<ServerConfig, ServerError> {
        let mut settings = self.inner.settings.lock()?;

        if settings.directory.as_os_str().is_empty() {
            return Err(ServerError::Config("Server directory is not set".into()));
        }
        if settings.name.is_empty() {
            settings.name = generate_name(&settings.directory, &settings.version)?;
            debug!("Generated server name '{}'", settings.name);
        }
        validate_port(settings.port)?;
        validate_memory(settings.memory_mb, total_memory_mb())?;
        if !settings.eula {
            return Err(ServerError::Config(format!(
                "The Minecraft EULA must be accepted before starting server '{}'",
                settings.name
            )));
        }

        Ok(settings.clone())
    }

    fn launch(&self, config: &ServerConfig, options: &StartOptions) -> Result<Launched, ServerError> {
        let directory = &config.directory;
        fs::create_dir_all(directory)?;
        let lock = acquire_directory_lock(directory, &config.name)?;

        let jar = self
            .inner
            .resolver
            .fetch_server_artifact(&config.version, directory, &options.cache)?;

        fs::write(directory.join(EULA_FILE_NAME), EULA_ACCEPTED_CONTENT)?;

        let mut properties = config.properties.clone();
        if !properties.contains_key(SERVER_PORT_PROPERTY) {
            properties.set(SERVER_PORT_PROPERTY, config.port.to_string());
        }
        merge_properties(&directory.join(PROPERTIES_FILE_NAME), &properties)?;

        if options.handle_signals {
            self.ensure_signal_worker(options)?;
        }

        let (mut child, parent) = spawn_process(config, &jar)?;
        let stdin = child.stdin.take();
        recover(&self.inner.events).players = 0;

        if let Err(err) = self.spawn_readers(&config.name, &mut child) {
            warn!("Killing server '{}' after reader setup failed", config.name);
            let _ = child.kill();
            let _ = child.wait();
            return Err(err.into());
        }

        Ok(Launched {
            child,
            stdin,
            lock,
            parent,
        })
    }

    fn spawn_readers(&self, name: &str, child: &mut Child) -> io::Result<()> {
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(name, StreamKind::Stdout, stdout, Arc::clone(&self.inner.events))?;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(name, StreamKind::Stderr, stderr, Arc::clone(&self.inner.events))?;
        }
        Ok(())
    }

    /// Subscribes this server to process signals once; later calls are no-ops.
    fn ensure_signal_worker(&self, options: &StartOptions) -> Result<(), ServerError> {
        let mut runtime = self.inner.runtime.lock()?;
        if runtime.signals.is_some() {
            return Ok(());
        }

        let (subscription, receiver) = signals::subscribe()?;
        let server: Weak<Inner> = Arc::downgrade(&self.inner);
        let options = options.clone();

        thread::Builder::new()
            .name(format!("{}-signals", self.name()))
            .spawn(move || {
                for kind in receiver {
                    let Some(inner) = server.upgrade() else {
                        break;
                    };
                    Server { inner }.handle_signal(kind, &options);
                }
            })?;

        runtime.signals = Some(subscription);
        Ok(())
    }

    fn handle_signal(&self, kind: SignalKind, options: &StartOptions) {
        let name = self.name();
        match kind {
            SignalKind::Terminate => {
                info!("Stopping server '{name}' on termination signal");
                if let Err(err) = self.stop() {
                    warn!("Failed to stop server '{name}': {err}");
                }
            }
            SignalKind::Reload => {
                info!("Restarting server '{name}' on reload signal");
                if let Err(err) = self.stop() {
                    warn!("Failed to stop server '{name}' for restart: {err}");
                }
                if let Err(err) = self.start(options) {
                    error!("Failed to restart server '{name}': {err}");
                }
            }
        }
    }

    /// Stops the server: SIGTERM, a bounded wait, then SIGKILL.
    pub fn stop(&self) -> Result<(), ServerError> {
        let name = self.name();
        let (shutdown_timeout, poll_interval) = {
            let settings = recover(&self.inner.settings);
            (settings.shutdown_timeout, settings.shutdown_poll_interval)
        };

        let mut child = {
            let mut runtime = self.inner.runtime.lock()?;
            self.reap_exited(&mut runtime);
            if runtime.state != ServerState::Running {
                return Err(ServerError::NotRunning(name));
            }
            let Some(child) = runtime.child.take() else {
                return Err(ServerError::NotRunning(name));
            };
            runtime.state = ServerState::Stopping;
            child
        };

        let pid = child.id();
        let target = Pid::from_raw(pid as i32);
        info!("Stopping server '{name}' (PID {pid})");

        match kill(target, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                debug!("Server '{name}' exited before SIGTERM could be delivered");
            }
            Err(err) => {
                error!("Failed to send SIGTERM to server '{name}': {err}");
                self.restore_running(child);
                return Err(ServerError::Shutdown { pid, source: err });
            }
        }

        let deadline = Instant::now() + shutdown_timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.finish_stop(&name, Some(status));
                    return Ok(());
                }
                Ok(None) => {}
                Err(err) => warn!("Failed to poll server '{name}': {err}"),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(poll_interval.min(deadline - now));
        }

        warn!("Server '{name}' did not exit after SIGTERM; sending SIGKILL");
        match kill(target, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => {
                error!("Failed to forcefully terminate server '{name}': {err}");
                self.restore_running(child);
                return Err(ServerError::Shutdown { pid, source: err });
            }
        }

        let reaper = thread::Builder::new()
            .name(format!("{name}-reaper"))
            .spawn(move || match child.wait() {
                Ok(status) => debug!("Reaped killed server process {pid}: {status}"),
                Err(err) => warn!("Failed to reap server process {pid}: {err}"),
            });
        if let Err(err) = reaper {
            warn!("Failed to spawn reaper for server process {pid}: {err}");
        }

        self.finish_stop(&name, None);
        Ok(())
    }

    fn restore_running(&self, child: Child) {
        let mut runtime = recover(&self.inner.runtime);
        runtime.child = Some(child);
        runtime.state = ServerState::Running;
    }

    fn finish_stop(&self, name: &str, status: Option<ExitStatus>) {
        recover(&self.inner.runtime).clear_process(ServerState::Stopped);
        match status {
            Some(status) => info!("Server '{name}' stopped ({status})"),
            None => info!("Server '{name}' killed"),
        }
    }

    /// Moves a process that exited on its own to `Stopped`.
    fn reap_exited(&self, runtime: &mut Runtime) {
        if runtime.state != ServerState::Running {
            return;
        }
        let Some(child) = runtime.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                warn!("Server '{}' exited unexpectedly ({status})", self.name());
                runtime.clear_process(ServerState::Stopped);
            }
            Ok(None) => {}
            Err(err) => debug!("Failed to poll server '{}': {err}", self.name()),
        }
    }

    /// Writes one console command to the server's stdin.
    pub fn send_command(&self, command: &str) -> Result<(), ServerError> {
        let mut runtime = self.inner.runtime.lock()?;
        self.reap_exited(&mut runtime);
        if runtime.state != ServerState::Running {
            return Err(ServerError::NotRunning(self.name()));
        }

        let stdin = runtime.stdin.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "server stdin is closed")
        })?;
        stdin.write_all(format!("{command}\n").as_bytes())?;
        stdin.flush()?;
        debug!("Sent command to server: {command}");
        Ok(())
    }

    /// Sets a property for the next start.
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        recover(&self.inner.settings).properties.set(key, value);
    }

    pub fn property(&self, key: &str) -> Option<String> {
        recover(&self.inner.settings)
            .properties
            .get(key)
            .map(str::to_string)
    }

    /// Copy of all configured properties.
    pub fn properties(&self) -> Properties {
        recover(&self.inner.settings).properties.clone()
    }

    /// Applies several property changes under one lock.
    pub fn update_properties(&self, update: impl FnOnce(&mut Properties)) {
        update(&mut recover(&self.inner.settings).properties);
    }

    pub fn set_difficulty(&self, difficulty: &str) -> Result<(), ServerError> {
        let difficulty: Difficulty = parse_setting("difficulty", difficulty)?;
        self.set_property("difficulty", difficulty.as_ref());
        Ok(())
    }

    pub fn set_weather(&self, weather: &str) -> Result<(), ServerError> {
        let weather: Weather = parse_setting("weather", weather)?;
        self.send_command(&format!("weather {}", weather.as_ref()))
    }

    pub fn set_time(&self, time: &str) -> Result<(), ServerError> {
        let time: TimeOfDay = parse_setting("time", time)?;
        self.send_command(&format!("time set {}", time.as_ref()))
    }

    pub fn on_stdout(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        recover(&self.inner.events).handlers.stdout = Some(Arc::new(callback));
    }

    pub fn on_stderr(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        recover(&self.inner.events).handlers.stderr = Some(Arc::new(callback));
    }

    /// Called with the player name and the new player count.
    pub fn on_player_join(&self, callback: impl Fn(&str, usize) + Send + Sync + 'static) {
        recover(&self.inner.events).handlers.player_join = Some(Arc::new(callback));
    }

    /// Called with the player name and the new player count.
    pub fn on_player_leave(&self, callback: impl Fn(&str, usize) + Send + Sync + 'static) {
        recover(&self.inner.events).handlers.player_leave = Some(Arc::new(callback));
    }

    pub fn on_backup_finished(
        &self,
        callback: impl Fn(&Result<PathBuf, ArchiveError>) + Send + Sync + 'static,
    ) {
        *recover(&self.inner.backup_reporter) = Some(Arc::new(callback));
    }

    /// Samples CPU, memory, threads and uptime of the live process.
    pub fn stats(&self) -> Result<ServerStats, ServerError> {
        let pid = self.pid().ok_or_else(|| ServerError::NotRunning(self.name()))?;
        sample_process(pid).ok_or_else(|| ServerError::NotRunning(self.name()))
    }

    /// Directory holding this server's archives.
    pub fn backup_dir(&self) -> PathBuf {
        self.directory().join(BACKUP_DIR_NAME)
    }

    /// Archives the server directory into [`Server::backup_dir`].
    ///
    /// Returns the archive path in blocking mode and `None` in detached mode. The backup store
    /// is created before the archive is written, so failing to create it is an error in
    /// either mode.
    pub fn backup(&self, mode: BackupMode) -> Result<Option<PathBuf>, ServerError> {
        let source = self.directory();
        let store = self.backup_dir();
        let reporter = recover(&self.inner.backup_reporter).clone();
        fs::create_dir_all(&store)?;

        match mode {
            BackupMode::Blocking => {
                let result = archive::create_backup(&source, &store);
                if let Some(reporter) = &reporter {
                    reporter(&result);
                }
                Ok(Some(result?))
            }
            BackupMode::Detached => {
                let name = self.name();
                thread::Builder::new()
                    .name(format!("{name}-backup"))
                    .spawn(move || {
                        let result = archive::create_backup(&source, &store);
                        if let Err(err) = &result {
                            error!("Backup of server '{name}' failed: {err}");
                        }
                        if let Some(reporter) = &reporter {
                            reporter(&result);
                        }
                    })?;
                Ok(None)
            }
        }
    }

    /// Archives in [`Server::backup_dir`], oldest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>, ServerError> {
        Ok(archive::list_backups(&self.backup_dir())?)
    }

    pub fn latest_backup(&self) -> Result<Option<PathBuf>, ServerError> {
        Ok(self.list_backups()?.pop())
    }

    /// Restores `archive` into the server directory. The server must not be running.
    pub fn restore(&self, archive_path: &Path) -> Result<RestoreSummary, ServerError> {
        let mut runtime = self.inner.runtime.lock()?;
        self.reap_exited(&mut runtime);
        if matches!(
            runtime.state,
            ServerState::Starting | ServerState::Running | ServerState::Stopping
        ) {
            return Err(ServerError::AlreadyRunning(self.name()));
        }

        let directory = self.directory();
        fs::create_dir_all(&directory)?;
        let _lock = acquire_directory_lock(&directory, &self.name())?;
        Ok(archive::restore_backup(archive_path, &directory)?)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name())
            .field("directory", &self.directory())
            .finish_non_exhaustive()
    }
}

/// `<version>-server`, suffixed with `-N` when N-1 files in `directory` already carry that name.
fn generate_name(directory: &Path, version: &str) -> io::Result<String> {
    let base = format!("{version}-server");
    let existing = match fs::read_dir(directory) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| !t.is_dir()).unwrap_or(false))
            .filter(|entry| entry.file_name().to_string_lossy().contains(&base))
            .count(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
        Err(err) => return Err(err),
    };

    Ok(if existing == 0 {
        base
    } else {
        format!("{base}-{}", existing + 1)
    })
}

fn validate_port(port: u32) -> Result<(), ServerError> {
    if (1..=65535).contains(&port) {
        Ok(())
    } else {
        Err(ServerError::Config(format!(
            "Port {port} is outside the range 1-65535"
        )))
    }
}

/// Memory must be a multiple of 512 MB, at least 512 MB, and leave 512 MB for the host.
fn validate_memory(memory_mb: u64, total_mb: u64) -> Result<(), ServerError> {
    let max = total_mb.saturating_sub(MEMORY_STEP_MB);
    if memory_mb < MEMORY_STEP_MB {
        return Err(ServerError::Config(format!(
            "Memory must be at least {MEMORY_STEP_MB} MB, got {memory_mb} MB"
        )));
    }
    if memory_mb > max {
        return Err(ServerError::Config(format!(
            "Memory must not exceed {max} MB on this host, got {memory_mb} MB"
        )));
    }
    if memory_mb % MEMORY_STEP_MB != 0 {
        return Err(ServerError::Config(format!(
            "Memory must be a multiple of {MEMORY_STEP_MB} MB, got {memory_mb} MB"
        )));
    }
    Ok(())
}

/// Takes the per-directory lock so two supervisors never drive the same world.
fn acquire_directory_lock(directory: &Path, name: &str) -> Result<File, ServerError> {
    let metadata_dir = directory.join(METADATA_DIR_NAME);
    fs::create_dir_all(&metadata_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(metadata_dir.join(LOCK_FILE_NAME))?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
            Err(ServerError::AlreadyRunning(name.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

fn spawn_process(config: &ServerConfig, jar: &Path) -> io::Result<(Child, ParentThread)> {
    let jar = jar.strip_prefix(&config.directory).unwrap_or(jar);

    let mut cmd = Command::new(&config.java);
    cmd.arg(format!("-Xmx{}M", config.memory_mb))
        .arg(format!("-Xms{}M", config.memory_mb))
        .args(&config.jvm_args)
        .arg("-jar")
        .arg(jar)
        .arg(NO_GUI_FLAG)
        .current_dir(&config.directory)
        .envs(&config.env.vars)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    unsafe {
        cmd.pre_exec(|| {
            // Own process group: a Ctrl-C on the terminal reaches the supervisor only, which
            // then shuts the server down gracefully.
            if libc::setpgid(0, 0) < 0 {
                return Err(io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            {
                use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    debug!("Launching server process: {cmd:?}");

    let (spawned_tx, spawned_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    thread::Builder::new()
        .name(format!("{}-parent", config.name))
        .spawn(move || {
            let spawned = cmd.spawn();
            let started = spawned.is_ok();
            if spawned_tx.send(spawned).is_ok() && started {
                // Returns once the guard is dropped.
                let _ = release_rx.recv();
            }
        })?;

    let child = spawned_rx
        .recv()
        .map_err(|_| io::Error::other("server launcher thread exited before spawning"))??;
    Ok((
        child,
        ParentThread {
            _release: release_tx,
        },
    ))
}

fn spawn_reader<R>(
    name: &str,
    kind: StreamKind,
    mut stream: R,
    events: Arc<Mutex<EventState>>,
) -> io::Result<()>
where
    R: Read + Send + 'static,
{
    let name = name.to_string();
    thread::Builder::new()
        .name(format!("{name}-{kind}"))
        .spawn(move || {
            let mut extractor = EventExtractor::new(kind);
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(read) => {
                        deliver(&events, |players| extractor.feed(&buf[..read], players));
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!("Stopped reading {kind} of server '{name}': {err}");
                        break;
                    }
                }
            }
            deliver(&events, |players| extractor.finish(players));
            debug!("{kind} of server '{name}' closed");
        })?;
    Ok(())
}

/// Runs `extract` against the player counter, then dispatches outside the lock.
fn deliver(
    events: &Mutex<EventState>,
    extract: impl FnOnce(&mut usize) -> Vec<ServerEvent>,
) {
    let (batch, handlers) = {
        let mut state = recover(events);
        let batch = extract(&mut state.players);
        (batch, state.handlers.clone())
    };
    for event in &batch {
        handlers.dispatch(event);
    }
}
