//! Dated append-only stream files

use super::event::{AuditCategory, AuditEvent};
use crate::error::{SecurityError, SecurityResult};
use chrono::{Datelike, NaiveDate};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Prefix of the stream every event is written to
pub(crate) const MASTER_STREAM: &str = "audit";

/// Prefix of the stream SECURITY_EVENTS are additionally written to
pub(crate) const SECURITY_STREAM: &str = "security";

/// File name of a dated stream: `{prefix}_{YYYYMMDD}.log`
#[must_use]
pub fn stream_file_name(prefix: &str, date: NaiveDate) -> String {
    format!(
        "{prefix}_{:04}{:02}{:02}.log",
        date.year(),
        date.month(),
        date.day()
    )
}

/// Date encoded in a stream file name, if it is one
fn stream_date(file_name: &str) -> Option<NaiveDate> {
    let stem = file_name.strip_suffix(".log")?;
    let (_, date) = stem.rsplit_once('_')?;
    if date.len() != 8 {
        return None;
    }
    NaiveDate::parse_from_str(date, "%Y%m%d").ok()
}

pub(crate) struct StreamWriter {
    dir: PathBuf,
}

impl StreamWriter {
    pub(crate) fn new(dir: PathBuf) -> SecurityResult<Self> {
        std::fs::create_dir_all(&dir).map_err(|e| SecurityError::io("create audit directory", &e))?;
        Ok(Self { dir })
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn stream_path(&self, prefix: &str, date: NaiveDate) -> PathBuf {
        self.dir.join(stream_file_name(prefix, date))
    }

    /// Streams an event belongs to: its category, the master stream and,
    /// for security events, the security stream
    pub(crate) fn paths_for(&self, event: &AuditEvent) -> Vec<PathBuf> {
        let date = event.timestamp.date_naive();
        let mut paths = vec![
            self.stream_path(event.category.as_str(), date),
            self.stream_path(MASTER_STREAM, date),
        ];
        if event.category == AuditCategory::SecurityEvents {
            paths.push(self.stream_path(SECURITY_STREAM, date));
        }
        paths
    }

    pub(crate) async fn append(&self, path: &Path, line: &str) -> SecurityResult<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| SecurityError::io("open audit stream", &e))?;

        let mut buffer = Vec::with_capacity(line.len() + 1);
        buffer.extend_from_slice(line.as_bytes());
        buffer.push(b'\n');
        file.write_all(&buffer)
            .await
            .map_err(|e| SecurityError::io("append audit stream", &e))?;
        file.flush()
            .await
            .map_err(|e| SecurityError::io("flush audit stream", &e))
    }

    /// Delete stream files dated before `cutoff`
    pub(crate) async fn remove_older_than(&self, cutoff: NaiveDate) -> SecurityResult<usize> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| SecurityError::io("read audit directory", &e))?;

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SecurityError::io("read audit directory", &e))?
        {
            let name = entry.file_name();
            let Some(date) = name.to_str().and_then(stream_date) else {
                continue;
            };
            if date < cutoff {
                tokio::fs::remove_file(entry.path())
                    .await
                    .map_err(|e| SecurityError::io("remove audit stream", &e))?;
                debug!("Removed expired audit stream {:?}", name);
                removed += 1;
            }
        }
        Ok(removed)
    }
}
