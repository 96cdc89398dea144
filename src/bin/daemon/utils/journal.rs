//! Command Journal
//!
//! Append-only record of every dispatched command and its reply, one line each, separate
//! from the diagnostic log. Failing to write the journal never fails the request.

use async_std::fs::OpenOptions;
use async_std::io::WriteExt;
use async_std::sync::Mutex;
use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Journal sink; `None` path disables it
pub struct Journal {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl Journal {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            lock: Mutex::new(()),
        }
    }

    /// A journal that records nothing
    pub fn disabled() -> Self {
        Self {
            path: None,
            lock: Mutex::new(()),
        }
    }

    /// Format one journal line
    ///
    /// # Arguments
    /// * `origin` - Peer address or bus source
    /// * `request` - The command line as received
    /// * `reply` - The reply line, empty when none was sent
    pub fn format_entry(origin: &str, request: &str, reply: &str) -> String {
        format!(
            "{} [{}] {} => {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            origin,
            request.trim(),
            if reply.is_empty() { "(no reply)" } else { reply.trim() }
        )
    }

    /// Append one entry; failures are logged and swallowed
    pub async fn record(&self, origin: &str, request: &str, reply: &str) {
        let Some(path) = &self.path else {
            return;
        };
        let entry = Self::format_entry(origin, request, reply);

        let _serial = self.lock.lock().await;
        let written = async {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(entry.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!("Cannot write command journal {}: {}", path.display(), e);
        }
    }
}
