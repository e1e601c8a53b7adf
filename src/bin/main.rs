use std::{
    error::Error,
    fs,
    io::{self, BufRead, Write},
    path::Path,
    thread,
    time::Duration,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mcsupervisor::{
    cli::{Cli, Commands, parse_args},
    config::load_config,
    download::{ArtifactResolver, MojangResolver},
    schedule::BackupScheduler,
    server::{BackupMode, Server, ServerState, StartOptions},
    stats::sample_process,
};

/// How often `run` checks whether the server is still up.
const RUN_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Run { config } => run_foreground(&config)?,
        Commands::Backup { config } => {
            let server = Server::new(load_config(&config)?)?;
            if let Some(archive) = server.backup(BackupMode::Blocking)? {
                println!("{}", archive.display());
            }
        }
        Commands::Restore { config, archive } => {
            let server = Server::new(load_config(&config)?)?;
            let archive = match archive {
                Some(archive) => archive,
                None => server
                    .latest_backup()?
                    .ok_or_else(|| format!("No backups found in {}", server.backup_dir().display()))?,
            };
            let summary = server.restore(&archive)?;
            println!(
                "Restored {} files and {} directories from {}",
                summary.files,
                summary.directories,
                archive.display()
            );
        }
        Commands::Backups { config } => {
            let server = Server::new(load_config(&config)?)?;
            for archive in server.list_backups()? {
                println!("{}", archive.display());
            }
        }
        Commands::Fetch { config } => {
            let config = load_config(&config)?;
            fs::create_dir_all(&config.directory)?;
            let jar = MojangResolver::new()?.fetch_server_artifact(
                &config.version,
                &config.directory,
                &config.cache.options(),
            )?;
            println!("{}", jar.display());
        }
        Commands::Stats { pid, json } => {
            let stats = sample_process(pid).ok_or_else(|| format!("No process with PID {pid}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("CPU:     {:.1}%", stats.cpu_percent);
                println!("Memory:  {:.1} MB", stats.memory_mb);
                println!("Threads: {}", stats.thread_count);
                println!("Uptime:  {}s", stats.uptime.as_secs());
            }
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Server output owns stdout.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Runs the server until it stops, forwarding console input and running scheduled backups.
fn run_foreground(config_path: &Path) -> Result<(), Box<dyn Error>> {
    let config = load_config(config_path)?;
    let schedule = config.backup.clone();
    let options = StartOptions {
        cache: config.cache.options(),
        handle_signals: true,
    };

    let server = Server::new(config)?;
    server.on_stdout(|text| {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    });
    server.on_stderr(|text| {
        let _ = io::stderr().lock().write_all(text.as_bytes());
    });
    server.on_player_join(|player, online| info!("{player} joined ({online} online)"));
    server.on_player_leave(|player, online| info!("{player} left ({online} online)"));

    server.start(&options)?;

    let scheduler = schedule
        .map(|schedule| BackupScheduler::spawn(server.clone(), &schedule))
        .transpose()?;

    let console = server.clone();
    thread::Builder::new()
        .name("console".into())
        .spawn(move || forward_console(&console))?;

    wait_until_stopped(&server);

    if let Some(scheduler) = scheduler {
        scheduler.stop();
    }
    info!("Server '{}' is no longer running", server.name());
    Ok(())
}

fn forward_console(server: &Server) {
    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!("Stopped reading console input: {err}");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if let Err(err) = server.send_command(&line) {
            warn!("Failed to send '{line}': {err}");
        }
    }
}

/// Returns once the server has been down for two consecutive checks, so a signal-driven
/// restart does not end the run.
fn wait_until_stopped(server: &Server) {
    let mut down_checks = 0;
    while down_checks < 2 {
        thread::sleep(RUN_POLL_INTERVAL);
        match server.state() {
            ServerState::Stopped | ServerState::NotStarted => down_checks += 1,
            _ => down_checks = 0,
        }
    }
}
