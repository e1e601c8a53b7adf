//! Constants and configuration values for the supervisor.
//!
//! This module centralizes file names, process invocation details, and timing
//! values used throughout the crate.

use std::time::Duration;

// ============================================================================
// Server Directory Layout
// ============================================================================

/// Name of the EULA marker file written into the server directory on each start.
pub const EULA_FILE_NAME: &str = "eula.txt";

/// Content of the EULA marker file.
pub const EULA_ACCEPTED_CONTENT: &str = "eula=true\n";

/// Name of the property file the server reads at boot.
pub const PROPERTIES_FILE_NAME: &str = "server.properties";

/// Name of the server artifact inside the server directory.
pub const SERVER_JAR_NAME: &str = "server.jar";

/// Directory holding supervisor bookkeeping (version metadata, lock file).
pub const METADATA_DIR_NAME: &str = ".mcsupervisor";

/// Name of the downloaded version metadata document.
pub const VERSION_DATA_FILE_NAME: &str = "version.json";

/// Lock file guarding a server directory against a second supervisor.
pub const LOCK_FILE_NAME: &str = "supervisor.lock";

/// Name of the backup store directory inside the server directory.
/// Excluded from every backup and skipped on restore.
pub const BACKUP_DIR_NAME: &str = "backups";

/// Prefix of every archive written to the backup store.
pub const BACKUP_FILE_PREFIX: &str = "backup-";

/// Extension of every archive written to the backup store.
pub const BACKUP_FILE_EXTENSION: &str = ".tar.gz";

/// Extension of the checksum sidecar written next to each archive.
pub const CHECKSUM_SIDECAR_EXTENSION: &str = ".sha256";

/// chrono format of the sortable timestamp embedded in archive names.
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

// ============================================================================
// Server Defaults and Limits
// ============================================================================

/// Default port of a Minecraft server.
pub const DEFAULT_PORT: u16 = 25565;

/// Default memory allotment in megabytes.
pub const DEFAULT_MEMORY_MB: u64 = 2048;

/// Memory allotments must be a multiple of this many megabytes, and at least this much
/// must stay free for the host.
pub const MEMORY_STEP_MB: u64 = 512;

/// Property key carrying the listening port.
pub const SERVER_PORT_PROPERTY: &str = "server-port";

// ============================================================================
// Process Invocation
// ============================================================================

/// Default Java executable used to launch the server.
pub const DEFAULT_JAVA: &str = "java";

/// Flag disabling the server's interactive GUI console.
pub const NO_GUI_FLAG: &str = "nogui";

// ============================================================================
// Process Management Timing
// ============================================================================

/// Maximum time to wait for the server to exit after SIGTERM before sending SIGKILL.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between liveness checks while waiting for the server to exit.
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Interval at which the backup scheduler checks for due runs.
pub const SCHEDULER_TICK: Duration = Duration::from_secs(1);

// ============================================================================
// Streams and Downloads
// ============================================================================

/// Buffer size for reads from the server's stdout/stderr pipes.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Longest unterminated stdout line kept for event classification. Output that never ends
/// a line (progress spinners using `\r`) is classified and dropped once it grows past this.
pub const MAX_PENDING_LINE: usize = 64 * 1024;

/// Location of the Mojang version manifest.
pub const MANIFEST_URL: &str =
    "https://piston-meta.mojang.com/mc/game/version_manifest_v2.json";

/// File name of the cached version manifest inside the cache directory.
pub const MANIFEST_CACHE_FILE_NAME: &str = "manifest.json";

/// How long a cached manifest is reused before it is fetched again.
pub const MANIFEST_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Name of the cache directory created under the user cache root.
pub const CACHE_DIR_NAME: &str = "mcsupervisor";

/// Timeout applied to every HTTP request made by the artifact resolver.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(120);
