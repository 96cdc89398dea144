// Test suite for the utils module
// This file contains tests for the command journal and the tracing setup.

use crate::utils::journal::Journal;

#[cfg(test)]
mod journal_tests {
    use super::*;

    /// Entries carry a timestamp, the origin, the request and the reply
    #[test]
    fn test_entry_format() {
        let entry = Journal::format_entry("127.0.0.1:5000", "status focus\r\n", "DONE: idle");
        assert!(entry.ends_with("[127.0.0.1:5000] status focus => DONE: idle\n"));
        let stamp = entry.split_whitespace().next().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[test]
    fn test_entry_without_reply() {
        let entry = Journal::format_entry("bus:tcs", "lock focus", "");
        assert!(entry.contains("lock focus => (no reply)"));
    }

    /// Entries are appended in order
    #[async_std::test]
    async fn test_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commands.log");
        let journal = Journal::new(&path);

        journal.record("a", "help", "DONE: ok").await;
        journal.record("b", "ping focus", "ERROR: focus: busy").await;

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[a] help => DONE: ok"));
        assert!(lines[1].contains("[b] ping focus => ERROR: focus: busy"));
    }

    /// An unwritable journal is ignored
    #[async_std::test]
    async fn test_unwritable_journal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("missing").join("commands.log"));
        journal.record("a", "help", "DONE: ok").await;
        assert!(!dir.path().join("missing").exists());
    }

    #[async_std::test]
    async fn test_disabled_journal() {
        Journal::disabled().record("a", "help", "DONE: ok").await;
    }
}

#[cfg(test)]
mod tracing_tests {
    use crate::utils::tracing::{build_subscriber, setup_tracing};

    /// Setting up twice is harmless and the log file is created
    #[test]
    fn test_setup_tracing_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mechd.log");
        setup_tracing(&path);
        setup_tracing(&path);
        tracing::info!("tracing test line");
    }

    /// An unopenable log file leaves a working stdout-only subscriber
    #[test]
    fn test_fallback_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let (subscriber, guard, failure) = build_subscriber(dir.path());
        assert!(guard.is_none());
        assert!(failure.is_some());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("stdout only");
        });
    }

    #[test]
    fn test_file_layer_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer.log");
        let (subscriber, guard, failure) = build_subscriber(&path);
        assert!(failure.is_none());
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("written to file");
        });
        drop(guard);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("written to file"));
    }
}
