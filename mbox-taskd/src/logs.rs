//! Reading worker log files.
//!
//! Workers write one line per message, prefixed with an RFC 3339 timestamp:
//! `2024-05-01T10:00:00.123Z message`. Lines without a parseable timestamp
//! are returned as-is with a zero timestamp.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::DateTime;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;

const FOLLOW_CHANNEL_CAPACITY: usize = 256;

/// How often a followed log file is checked for new data.
pub const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    /// Microseconds since the epoch, 0 when unknown.
    pub realtime_timestamp: i64,
    pub message: String,
    /// Task type or app id the log belongs to.
    pub source: String,
}

pub fn parse_line(line: &str, source: &str) -> LogLine {
    let parsed = line.split_once(' ').and_then(|(ts, rest)| {
        DateTime::parse_from_rfc3339(ts)
            .ok()
            .map(|dt| (dt.timestamp_micros(), rest.trim_start()))
    });

    let (realtime_timestamp, message) = match parsed {
        Some((ts, rest)) => (ts, rest),
        None => (0, line),
    };

    LogLine {
        realtime_timestamp,
        message: message.to_string(),
        source: source.to_string(),
    }
}

/// Last `lines` non-empty lines of `path`. A missing file has no lines.
pub async fn tail(path: &Path, lines: usize, source: &str) -> Result<Vec<LogLine>> {
    let content = match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let all: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = all.len().saturating_sub(lines);

    Ok(all[start..]
        .iter()
        .map(|line| parse_line(line, source))
        .collect())
}

/// Stream the last `lines` lines of `path`, then every line appended later.
///
/// The file does not have to exist yet and may be truncated or replaced
/// while followed. Following stops once the receiver is dropped.
pub fn follow(
    path: PathBuf,
    lines: usize,
    source: String,
    poll_interval: Duration,
) -> mpsc::Receiver<LogLine> {
    let (tx, rx) = mpsc::channel(FOLLOW_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut offset = 0u64;
        let mut partial = String::new();
        let mut first = true;

        while !tx.is_closed() {
            match read_from(&path, offset).await {
                Ok(Some((len, chunk))) => {
                    if len < offset {
                        debug!(path = %path.display(), "Log file truncated, reading from start");
                        offset = 0;
                        partial.clear();
                        continue;
                    }
                    offset = len;
                    partial.push_str(&chunk);

                    // Only complete lines are emitted; the rest waits for its newline
                    let complete = match partial.rfind('\n') {
                        Some(end) => partial.drain(..=end).collect::<String>(),
                        None => String::new(),
                    };
                    let mut new_lines: Vec<&str> =
                        complete.lines().filter(|l| !l.trim().is_empty()).collect();
                    if first {
                        let start = new_lines.len().saturating_sub(lines);
                        new_lines.drain(..start);
                        first = false;
                    }

                    for line in new_lines {
                        if tx.send(parse_line(line, &source)).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => first = false,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read followed log file");
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    });

    rx
}

/// Current length of `path` and everything after `offset`. `None` if the
/// file does not exist. A length below `offset` means it was truncated.
async fn read_from(path: &Path, offset: u64) -> std::io::Result<Option<(u64, String)>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let len = file.metadata().await?.len();
    if len <= offset {
        return Ok(Some((len, String::new())));
    }

    file.seek(SeekFrom::Start(offset)).await?;
    let mut bytes = Vec::with_capacity((len - offset) as usize);
    file.take(len - offset).read_to_end(&mut bytes).await?;
    Ok(Some((len, String::from_utf8_lossy(&bytes).into_owned())))
}
