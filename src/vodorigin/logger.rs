// SPDX-License-Identifier: GPL-2.0-or-later

use common::{ILogger, LogEntry};
use serde::Serialize;
use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::broadcast;

/// Logger used everywhere across the application: prints to
/// stdout and fans entries out to subscribers.
pub struct Logger {
    feed: broadcast::Sender<LogEntryWithTime>,
}

impl Logger {
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(64);
        Self { feed }
    }

    /// Subscribe to the log feed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntryWithTime> {
        self.feed.subscribe()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl ILogger for Logger {
    /// Sends the entry to all subscribers, stamped now.
    fn log(&self, log: LogEntry) {
        let log = LogEntryWithTime {
            level: log.level,
            source: log.source,
            message: log.message,
            time: unix_micro_now(),
        };

        println!("{log}");

        // Only errors when there are no subscribers.
        self.feed.send(log).ok();
    }
}

/// Log entry with time in microseconds since the epoch.
#[derive(Clone, Debug, Serialize)]
pub struct LogEntryWithTime {
    pub level: common::LogLevel,
    pub source: common::LogSource,
    pub message: String,
    pub time: u64,
}

impl fmt::Display for LogEntryWithTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: {}",
            self.level.to_string().to_uppercase(),
            self.time,
            self.source,
            self.message
        )
    }
}

fn unix_micro_now() -> u64 {
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("broken system clock")
            .as_micros(),
    )
    .expect("really broken system clock")
}
