//! Turns the server's raw output streams into domain events.
//!
//! Chunks may split lines (and UTF-8 sequences) anywhere. Text is forwarded as soon as it
//! decodes, while player classification waits for a complete line so an event split across
//! two reads is still seen exactly once.
use std::{fmt, sync::Arc};

use crate::constants::MAX_PENDING_LINE;

/// Marker the server prints when a player connects.
const JOINED_MARKER: &str = "joined the game";

/// Marker the server prints when a player disconnects.
const LEFT_MARKER: &str = "left the game";

/// Separator between the log prefix and the message.
const LOG_PREFIX_DELIMITER: &str = "]: ";

/// Output stream of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events produced while a server is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Text written to stdout, forwarded verbatim.
    Stdout(String),
    /// Text written to stderr, forwarded verbatim.
    Stderr(String),
    /// A player connected; carries the player name and the new player count.
    PlayerJoin(String, usize),
    /// A player disconnected; carries the player name and the new player count.
    PlayerLeave(String, usize),
}

/// Player activity recognised in a single log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerActivity {
    Joined(String),
    Left(String),
}

pub type TextCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type PlayerCallback = Arc<dyn Fn(&str, usize) + Send + Sync>;

/// Zero-or-one callback per event kind. Registering again replaces the previous callback.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub stdout: Option<TextCallback>,
    pub stderr: Option<TextCallback>,
    pub player_join: Option<PlayerCallback>,
    pub player_leave: Option<PlayerCallback>,
}

impl EventHandlers {
    /// Invokes the callback registered for `event`, if any.
    pub fn dispatch(&self, event: &ServerEvent) {
        match event {
            ServerEvent::Stdout(text) => {
                if let Some(callback) = &self.stdout {
                    callback(text);
                }
            }
            ServerEvent::Stderr(text) => {
                if let Some(callback) = &self.stderr {
                    callback(text);
                }
            }
            ServerEvent::PlayerJoin(name, count) => {
                if let Some(callback) = &self.player_join {
                    callback(name, *count);
                }
            }
            ServerEvent::PlayerLeave(name, count) => {
                if let Some(callback) = &self.player_leave {
                    callback(name, *count);
                }
            }
        }
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("player_join", &self.player_join.is_some())
            .field("player_leave", &self.player_leave.is_some())
            .finish()
    }
}

/// Classifies one complete log line.
///
/// Lines mentioning a join or leave are split on the first `"]: "`; the player name is the
/// first whitespace-delimited token after it. Lines without the delimiter are ignored.
pub fn classify_line(line: &str) -> Option<PlayerActivity> {
    let joined = line.contains(JOINED_MARKER);
    if !joined && !line.contains(LEFT_MARKER) {
        return None;
    }

    let (_, message) = line.split_once(LOG_PREFIX_DELIMITER)?;
    let name = message.split_whitespace().next()?.to_string();

    if message.contains(JOINED_MARKER) {
        Some(PlayerActivity::Joined(name))
    } else if message.contains(LEFT_MARKER) {
        Some(PlayerActivity::Left(name))
    } else {
        None
    }
}

/// Applies one activity to the player counter, returning the new count and the event to
/// emit. The counter never drops below zero.
pub fn apply_activity(count: usize, activity: PlayerActivity) -> (usize, ServerEvent) {
    match activity {
        PlayerActivity::Joined(name) => {
            let count = count + 1;
            (count, ServerEvent::PlayerJoin(name, count))
        }
        PlayerActivity::Left(name) => {
            let count = count.saturating_sub(1);
            (count, ServerEvent::PlayerLeave(name, count))
        }
    }
}

/// Returns the length of the prefix of `bytes` that does not end in a truncated UTF-8
/// sequence.
fn complete_utf8_prefix(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let expected = match byte {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => 1,
        };
        return if expected > back { len - back } else { len };
    }
    len
}

/// Incremental extractor for one output stream.
#[derive(Debug)]
pub struct EventExtractor {
    kind: StreamKind,
    pending_bytes: Vec<u8>,
    partial_line: String,
}

impl EventExtractor {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            pending_bytes: Vec::new(),
            partial_line: String::new(),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Feeds one chunk read from the stream.
    ///
    /// Returns the text event for everything that decoded (when non-empty) followed by any
    /// player events from lines completed by this chunk. `players` is updated in place.
    pub fn feed(&mut self, chunk: &[u8], players: &mut usize) -> Vec<ServerEvent> {
        self.pending_bytes.extend_from_slice(chunk);
        let cut = complete_utf8_prefix(&self.pending_bytes);
        let rest = self.pending_bytes.split_off(cut);
        let text = String::from_utf8_lossy(&self.pending_bytes).into_owned();
        self.pending_bytes = rest;

        self.process_text(text, players, false)
    }

    /// Flushes buffered input at end of stream, classifying a trailing unterminated line.
    pub fn finish(&mut self, players: &mut usize) -> Vec<ServerEvent> {
        let text = String::from_utf8_lossy(&std::mem::take(&mut self.pending_bytes)).into_owned();
        self.process_text(text, players, true)
    }

    fn process_text(&mut self, text: String, players: &mut usize, at_end: bool) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if self.kind == StreamKind::Stdout {
            self.partial_line.push_str(&text);
        }

        if !text.is_empty() {
            events.push(match self.kind {
                StreamKind::Stdout => ServerEvent::Stdout(text),
                StreamKind::Stderr => ServerEvent::Stderr(text),
            });
        }

        if self.kind != StreamKind::Stdout {
            return events;
        }

        while let Some(index) = self.partial_line.find('\n') {
            let line: String = self.partial_line.drain(..=index).collect();
            Self::classify_into(line.trim_end_matches(['\r', '\n']), players, &mut events);
        }

        if at_end || self.partial_line.len() > MAX_PENDING_LINE {
            let line = std::mem::take(&mut self.partial_line);
            if !line.is_empty() {
                Self::classify_into(&line, players, &mut events);
            }
        }

        events
    }

    fn classify_into(line: &str, players: &mut usize, events: &mut Vec<ServerEvent>) {
        if let Some(activity) = classify_line(line) {
            let (count, event) = apply_activity(*players, activity);
            *players = count;
            events.push(event);
        }
    }
}
