//! Line-oriented activity feed.
//!
//! Reads one activity signal per line from stdin or a Unix socket. A line is
//! either a bare event name (`mousemove`) or a serialized DOM event object
//! with a `type` field (`{"type":"mousemove","x":10}`).

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::ActivityKind;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

type LineReader = BufReader<Box<dyn AsyncRead + Unpin + Send>>;

/// Errors that can occur while reading the feed.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Socket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Socket path not found: {0}")]
    SocketNotFound(String),

    #[error("Failed to read from feed: {0}")]
    Read(#[from] std::io::Error),
}

/// Source of parsed activity signals.
pub struct ActivityFeed {
    reader: Option<LineReader>,

    /// Set when reading from a socket; enables reconnection.
    socket_path: Option<PathBuf>,

    backoff: Duration,
}

impl ActivityFeed {
    /// Read signals from an arbitrary byte stream. EOF ends the feed.
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let reader: Box<dyn AsyncRead + Unpin + Send> = Box::new(reader);
        Self {
            reader: Some(BufReader::new(reader)),
            socket_path: None,
            backoff: INITIAL_BACKOFF,
        }
    }

    /// Read signals from this process's stdin.
    pub fn stdin() -> Self {
        Self::from_reader(tokio::io::stdin())
    }

    /// Connect to a Unix socket emitting signals. The feed reconnects on EOF.
    pub async fn connect(path: &Path) -> Result<Self, FeedError> {
        info!("Connecting to activity socket: {}", path.display());
        let stream = open_socket(path).await?;
        info!("Connected to activity socket");

        Ok(Self {
            reader: Some(socket_reader(stream)),
            socket_path: Some(path.to_path_buf()),
            backoff: INITIAL_BACKOFF,
        })
    }

    /// Wait for the next recognized activity signal.
    ///
    /// Returns `Ok(None)` once a non-socket feed reaches EOF. A socket feed
    /// keeps reconnecting instead. Unrecognized or non-UTF-8 lines are
    /// skipped; only I/O failures of a non-socket feed are errors.
    pub async fn next_signal(&mut self) -> Result<Option<ActivityKind>, FeedError> {
        loop {
            let Some(reader) = self.reader.as_mut() else {
                if self.socket_path.is_some() {
                    if let Err(e) = self.reconnect().await {
                        warn!("Reconnect failed: {}", e);
                    }
                    continue;
                }
                return Ok(None);
            };

            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => {
                    debug!("Activity feed reached EOF");
                    self.reader = None;
                }
                Ok(_) => match std::str::from_utf8(&line) {
                    Ok(line) => {
                        if let Some(kind) = parse_line(line) {
                            return Ok(Some(kind));
                        }
                    }
                    Err(e) => trace!("Ignoring line that is not UTF-8: {}", e),
                },
                Err(e) => {
                    if self.socket_path.is_none() {
                        return Err(FeedError::Read(e));
                    }
                    warn!("Read error: {}", e);
                    self.reader = None;
                }
            }
        }
    }

    /// Attempt to reconnect to the activity socket.
    async fn reconnect(&mut self) -> Result<(), FeedError> {
        let Some(path) = self.socket_path.clone() else {
            return Ok(());
        };

        warn!(
            "Activity socket connection lost. Retrying in {:?}...",
            self.backoff
        );
        tokio::time::sleep(self.backoff).await;
        self.backoff = std::cmp::min(self.backoff * 2, MAX_BACKOFF);

        let stream = open_socket(&path).await?;
        info!("Reconnected to activity socket");
        self.reader = Some(socket_reader(stream));
        self.backoff = INITIAL_BACKOFF;

        Ok(())
    }
}

fn socket_reader(stream: UnixStream) -> LineReader {
    let stream: Box<dyn AsyncRead + Unpin + Send> = Box::new(stream);
    BufReader::new(stream)
}

async fn open_socket(path: &Path) -> Result<UnixStream, FeedError> {
    if !path.exists() {
        return Err(FeedError::SocketNotFound(path.display().to_string()));
    }
    UnixStream::connect(path)
        .await
        .map_err(|e| FeedError::ConnectionFailed(e.to_string()))
}

/// Serialized DOM event; only the type matters.
#[derive(Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
}

/// Parse one feed line into an activity kind.
fn parse_line(line: &str) -> Option<ActivityKind> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let name = if line.starts_with('{') {
        match serde_json::from_str::<WireEvent>(line) {
            Ok(event) => event.kind,
            Err(e) => {
                trace!("Ignoring malformed event object ({}): {}", e, line);
                return None;
            }
        }
    } else {
        line.to_string()
    };

    match name.parse() {
        Ok(kind) => Some(kind),
        Err(e) => {
            trace!("Ignoring line: {}", e);
            None
        }
    }
}
