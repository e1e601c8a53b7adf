//! mcsupervisor launches a Minecraft server as a child process and supervises it. It
//! turns the server's console output into events, forwards commands to its stdin, shuts it
//! down gracefully on request or on OS signals, and takes streaming backups of the server
//! directory that can later be restored.

/// Tar/gzip backups of the server directory.
pub mod archive;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// File names, defaults, and timing constants.
pub mod constants;

/// Server jar resolution and download.
pub mod download;

/// Error handling.
pub mod error;

/// Log event extraction.
pub mod events;

/// `server.properties` storage.
pub mod properties;

/// Cron-driven backups.
pub mod schedule;

/// Process supervision.
pub mod server;

/// OS signal subscriptions.
pub mod signals;

/// Process resource sampling.
pub mod stats;

/// In-game settings.
pub mod world;
