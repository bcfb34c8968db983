//! Append-only record of credential submissions.
//!
//! One line per submission: `<ISO-8601 timestamp> <OUTCOME>`. The running
//! gateway only ever appends; purging is a manual operation.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::Failure => "FAILURE",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub client: Ipv4Addr,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
}

impl SubmissionRecord {
    pub fn new(client: Ipv4Addr, timestamp: DateTime<Utc>, outcome: Outcome) -> Self {
        SubmissionRecord {
            client,
            timestamp,
            outcome,
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{} {}\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.outcome.as_str()
        )
    }
}

pub struct SubmissionLog {
    sink: Option<(PathBuf, Mutex<File>)>,
}

impl SubmissionLog {
    /// Opens `path` for appending, creating it readable by owner and group only.
    pub async fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o640);
        let file = options.open(path).await?;
        info!("Recording submissions to {}", path.display());
        Ok(SubmissionLog {
            sink: Some((path.to_path_buf(), Mutex::new(file))),
        })
    }

    /// A log that only emits tracing events.
    pub fn disabled() -> Self {
        SubmissionLog { sink: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|(path, _)| path.as_path())
    }

    pub async fn append(&self, record: &SubmissionRecord) -> io::Result<()> {
        info!(
            client = %record.client,
            outcome = record.outcome.as_str(),
            "submission"
        );
        if let Some((_, file)) = &self.sink {
            let mut file = file.lock().await;
            file.write_all(record.to_line().as_bytes()).await?;
            file.flush().await?;
        }
        Ok(())
    }
}
