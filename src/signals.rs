//! Process-wide OS signal delivery multiplexed into per-instance subscriptions.
//!
//! Signal handlers can only be installed once per process, so a single self-pipe carries
//! signal numbers from the async-signal-safe handler to a dispatcher thread, which fans each
//! signal out to every live [`SignalSubscription`]. Handlers are installed when the first
//! subscription is created and the previous dispositions are restored when the last one is
//! dropped.
use std::{
    collections::HashMap,
    fs::File,
    io::Read,
    os::fd::{AsRawFd, OwnedFd},
    sync::{
        Mutex, OnceLock,
        atomic::{AtomicI32, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    thread,
};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::{debug, warn};

use crate::error::ServerError;

/// Policy class of a received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGINT or SIGTERM: stop the server.
    Terminate,
    /// SIGHUP: restart the server.
    Reload,
}

impl SignalKind {
    fn from_raw(signum: i32) -> Option<Self> {
        match Signal::try_from(signum).ok()? {
            Signal::SIGINT | Signal::SIGTERM => Some(SignalKind::Terminate),
            Signal::SIGHUP => Some(SignalKind::Reload),
            _ => None,
        }
    }
}

const HANDLED_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

/// Write end of the self-pipe, read by the signal handler. Negative until the pipe exists.
static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<u64, Sender<SignalKind>>,
    previous: Option<Vec<(Signal, SigAction)>>,
    pipe_ready: bool,
}

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

extern "C" fn on_signal(signum: libc::c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        // SAFETY: write(2) is async-signal-safe and `byte` outlives the call.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Creates the self-pipe and the dispatcher thread. Runs once per process.
fn ensure_pipe(registry: &mut Registry) -> Result<(), ServerError> {
    if registry.pipe_ready {
        return Ok(());
    }

    let (read_end, write_end): (OwnedFd, OwnedFd) =
        nix::unistd::pipe().map_err(ServerError::Signal)?;
    PIPE_WRITE_FD.store(write_end.as_raw_fd(), Ordering::SeqCst);
    // The write end stays open for the life of the process.
    std::mem::forget(write_end);

    thread::Builder::new()
        .name("signal-dispatch".into())
        .spawn(move || dispatch_loop(File::from(read_end)))?;

    registry.pipe_ready = true;
    Ok(())
}

fn dispatch_loop(mut pipe: File) {
    let mut buf = [0u8; 16];
    loop {
        let read = match pipe.read(&mut buf) {
            Ok(0) => return,
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("Signal dispatcher stopped reading: {err}");
                return;
            }
        };

        for &signum in &buf[..read] {
            let Some(kind) = SignalKind::from_raw(i32::from(signum)) else {
                continue;
            };
            debug!("Received signal {signum}, dispatching {kind:?}");

            let Ok(mut registry) = registry().lock() else {
                return;
            };
            registry
                .subscribers
                .retain(|_, sender| sender.send(kind).is_ok());
        }
    }
}

fn install_handlers(registry: &mut Registry) -> Result<(), ServerError> {
    if registry.previous.is_some() {
        return Ok(());
    }

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let mut previous = Vec::with_capacity(HANDLED_SIGNALS.len());
    for signal in HANDLED_SIGNALS {
        // SAFETY: `on_signal` only performs an async-signal-safe write(2).
        let old = unsafe { sigaction(signal, &action) }.map_err(ServerError::Signal)?;
        previous.push((signal, old));
    }

    debug!("Installed handlers for SIGINT, SIGTERM and SIGHUP");
    registry.previous = Some(previous);
    Ok(())
}

fn restore_handlers(registry: &mut Registry) {
    let Some(previous) = registry.previous.take() else {
        return;
    };
    for (signal, action) in previous {
        // SAFETY: restores a disposition previously returned by sigaction.
        if let Err(err) = unsafe { sigaction(signal, &action) } {
            warn!("Failed to restore handler for {signal}: {err}");
        }
    }
    debug!("Restored previous signal handlers");
}

/// Handle to one registration with the process-wide signal registry.
///
/// Dropping it unsubscribes; the paired receiver then reports disconnection.
#[derive(Debug)]
pub struct SignalSubscription {
    id: u64,
}

impl SignalSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        let Ok(mut registry) = registry().lock() else {
            return;
        };
        registry.subscribers.remove(&self.id);
        if registry.subscribers.is_empty() {
            restore_handlers(&mut registry);
        }
    }
}

/// Subscribes to terminate and reload signals.
pub fn subscribe() -> Result<(SignalSubscription, Receiver<SignalKind>), ServerError> {
    let mut registry = registry().lock()?;
    ensure_pipe(&mut registry)?;
    install_handlers(&mut registry)?;

    let (sender, receiver) = mpsc::channel();
    let id = registry.next_id;
    registry.next_id += 1;
    registry.subscribers.insert(id, sender);

    Ok((SignalSubscription { id }, receiver))
}

/// Number of live subscriptions.
pub fn subscriber_count() -> usize {
    registry()
        .lock()
        .map(|registry| registry.subscribers.len())
        .unwrap_or(0)
}
