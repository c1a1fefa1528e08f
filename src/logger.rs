//! Gateway logger
//!
//! Leveled, source-tagged logging persisted to the SQLite log store with a
//! stdout echo. Writes are batched on a dedicated thread so hot request
//! paths never block on the database.

use std::path::PathBuf;
use std::sync::{mpsc, Once, RwLock};
use std::time::{Duration, Instant};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

static INIT: Once = Once::new();
static LOG_SENDER: RwLock<Option<mpsc::Sender<LogMessage>>> = RwLock::new(None);

#[derive(Debug, Clone)]
enum LogMessage {
    Entry {
        timestamp: i64,
        level: LogLevel,
        source: String,
        message: String,
    },
    Flush(mpsc::Sender<()>),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

fn min_level() -> LogLevel {
    std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|v| LogLevel::from_str(&v))
        .unwrap_or(LogLevel::Info)
}

fn db_path() -> PathBuf {
    let mut p = crate::config::data_dir();
    p.push("system_logs.db");
    p
}

/// Initialize the log table and spawn the batch writer. Idempotent.
pub fn init() {
    INIT.call_once(|| {
        if let Ok(conn) = Connection::open(db_path()) {
            conn.pragma_update(None, "journal_mode", "WAL").ok();
            conn.execute(
                "CREATE TABLE IF NOT EXISTS system_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp INTEGER NOT NULL,
                    level TEXT NOT NULL,
                    source TEXT NOT NULL,
                    message TEXT NOT NULL
                )",
                [],
            )
            .ok();
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_system_logs_timestamp
                 ON system_logs(timestamp DESC)",
                [],
            )
            .ok();
        }
        spawn_batch_writer();
    });
}

fn spawn_batch_writer() {
    let (tx, rx) = mpsc::channel::<LogMessage>();
    {
        let mut sender = LOG_SENDER.write().expect("log sender lock");
        *sender = Some(tx);
    }

    std::thread::spawn(move || {
        let mut buffer: Vec<LogMessage> = Vec::with_capacity(128);
        let mut last_flush = Instant::now();
        let flush_interval = Duration::from_secs(1);

        loop {
            let timeout = flush_interval
                .checked_sub(last_flush.elapsed())
                .unwrap_or(Duration::ZERO);

            match rx.recv_timeout(timeout) {
                Ok(LogMessage::Flush(done)) => {
                    flush_entries(&mut buffer);
                    last_flush = Instant::now();
                    done.send(()).ok();
                }
                Ok(msg) => {
                    buffer.push(msg);
                    if buffer.len() >= 128 || last_flush.elapsed() >= flush_interval {
                        flush_entries(&mut buffer);
                        last_flush = Instant::now();
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if !buffer.is_empty() {
                        flush_entries(&mut buffer);
                    }
                    last_flush = Instant::now();
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    flush_entries(&mut buffer);
                    break;
                }
            }
        }
    });
}

fn flush_entries(buffer: &mut Vec<LogMessage>) {
    if buffer.is_empty() {
        return;
    }
    let Ok(mut conn) = Connection::open(db_path()) else {
        buffer.clear();
        return;
    };
    let Ok(tx) = conn.transaction() else {
        buffer.clear();
        return;
    };
    for msg in buffer.drain(..) {
        if let LogMessage::Entry {
            timestamp,
            level,
            source,
            message,
        } = msg
        {
            tx.execute(
                "INSERT INTO system_logs(timestamp, level, source, message)
                 VALUES (?1, ?2, ?3, ?4)",
                params![timestamp, level.as_str(), source, message],
            )
            .ok();
        }
    }
    tx.commit().ok();
}

fn log(level: LogLevel, source: &str, message: &str) {
    if level < min_level() {
        return;
    }
    let now = chrono::Utc::now();
    println!(
        "{} [{}] {}: {}",
        now.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        level.as_str(),
        source,
        message
    );
    if let Ok(sender) = LOG_SENDER.read() {
        if let Some(tx) = sender.as_ref() {
            tx.send(LogMessage::Entry {
                timestamp: now.timestamp_millis(),
                level,
                source: source.to_string(),
                message: message.to_string(),
            })
            .ok();
        }
    }
}

pub fn debug(source: &str, message: &str) {
    log(LogLevel::Debug, source, message);
}

pub fn info(source: &str, message: &str) {
    log(LogLevel::Info, source, message);
}

pub fn warn(source: &str, message: &str) {
    log(LogLevel::Warn, source, message);
}

pub fn error(source: &str, message: &str) {
    log(LogLevel::Error, source, message);
}

/// Block until all queued entries have been written. Called on shutdown.
pub fn shutdown() {
    let sender = {
        let guard = LOG_SENDER.read().ok();
        guard.and_then(|g| g.as_ref().cloned())
    };
    if let Some(tx) = sender {
        let (done_tx, done_rx) = mpsc::channel();
        if tx.send(LogMessage::Flush(done_tx)).is_ok() {
            done_rx.recv_timeout(Duration::from_secs(5)).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn level_round_trip() {
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(LogLevel::from_str(level.as_str()), Some(level));
        }
        assert_eq!(LogLevel::from_str("nope"), None);
    }
}
