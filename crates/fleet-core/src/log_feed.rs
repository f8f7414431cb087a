use chrono::{DateTime, Local};
use std::collections::VecDeque;

/// Lines kept by a viewer's log pane; older lines drop off the front.
pub const DEFAULT_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Info,
    Debug,
}

impl LogLevel {
    /// Substring classification. Error markers win; untagged output is info.
    pub fn classify(text: &str) -> Self {
        if text.contains("[ERROR]") || text.contains("FAILED") {
            LogLevel::Error
        } else if text.contains("[DEBUG]") && !text.contains("[INFO]") {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub received_at: DateTime<Local>,
    pub level: LogLevel,
    pub text: String,
}

impl LogEntry {
    pub fn new(text: impl Into<String>, received_at: DateTime<Local>) -> Self {
        let text = text.into();
        Self {
            received_at,
            level: LogLevel::classify(&text),
            text,
        }
    }

    /// `HH:MM:SS` in local time, 24-hour.
    pub fn timestamp(&self) -> String {
        self.received_at.format("%H:%M:%S").to_string()
    }
}

#[derive(Debug, Clone)]
pub struct LogFeed {
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

impl LogFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, text: impl Into<String>) -> &LogEntry {
        self.push_at(text, Local::now())
    }

    pub fn push_at(&mut self, text: impl Into<String>, received_at: DateTime<Local>) -> &LogEntry {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry::new(text, received_at));
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LogFeed {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn classification_follows_markers() {
        assert_eq!(LogLevel::classify("[ERROR] spawn failed"), LogLevel::Error);
        assert_eq!(LogLevel::classify("[INFO] start FAILED"), LogLevel::Error);
        assert_eq!(LogLevel::classify("[INFO] started"), LogLevel::Info);
        assert_eq!(LogLevel::classify("[DEBUG] argv"), LogLevel::Debug);
        assert_eq!(LogLevel::classify("Importing image..."), LogLevel::Info);
    }

    #[test]
    fn feed_drops_oldest_past_capacity() {
        let mut feed = LogFeed::default();
        for idx in 0..150 {
            feed.push(format!("line {idx}"));
        }
        assert_eq!(feed.len(), DEFAULT_LOG_CAPACITY);
        assert_eq!(feed.entries().next().map(|e| e.text.as_str()), Some("line 50"));
        assert_eq!(feed.entries().last().map(|e| e.text.as_str()), Some("line 149"));
    }

    #[test]
    fn timestamp_is_24_hour() {
        let at = Local
            .with_ymd_and_hms(2024, 5, 1, 17, 4, 9)
            .single()
            .expect("local time");
        let mut feed = LogFeed::new(4);
        let entry = feed.push_at("[INFO] ok", at);
        assert_eq!(entry.timestamp(), "17:04:09");
        assert_eq!(entry.level, LogLevel::Info);
    }
}
