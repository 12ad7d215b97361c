//! ---
//! ops_section: "02-messaging-event-delivery"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Event envelopes, delivery, and dead-letter handling."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
//! Directory-backed broker: one JSON-lines log per topic plus a shared offsets file.
//!
//! Every topic has a single partition. State lives on disk and survives restarts, so
//! successive CLI invocations share it. Appends and offset commits are serialised by
//! an in-process lock only: at most one process may use a directory at a time.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::broker::{Broker, Record, RecordMeta};
use crate::{EventError, Result};

const OFFSETS_FILE: &str = "offsets.json";
const LOG_EXTENSION: &str = "jsonl";

/// One line of a topic log.
#[derive(Debug, Serialize, Deserialize)]
struct LogLine {
    offset: u64,
    #[serde(default)]
    key: Option<String>,
    timestamp: DateTime<Utc>,
    value: String,
}

/// Committed positions: group, then topic, then next offset to read.
type Offsets = IndexMap<String, IndexMap<String, u64>>;

/// Broker persisting topics as append-only JSON-lines files.
#[derive(Debug)]
pub struct FileLogBroker {
    directory: PathBuf,
    lock: Mutex<()>,
}

impl FileLogBroker {
    /// Open (creating if needed) a broker rooted at `directory`.
    pub fn open(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            lock: Mutex::new(()),
        })
    }

    /// Root directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn log_path(&self, topic: &str) -> PathBuf {
        self.directory.join(format!("{topic}.{LOG_EXTENSION}"))
    }

    fn offsets_path(&self) -> PathBuf {
        self.directory.join(OFFSETS_FILE)
    }

    fn read_log(&self, topic: &str) -> Result<Vec<Record>> {
        let path = self.log_path(topic);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogLine>(&line) {
                Ok(entry) => records.push(Record {
                    topic: topic.to_owned(),
                    partition: 0,
                    offset: entry.offset,
                    key: entry.key,
                    value: Bytes::from(entry.value),
                    timestamp: entry.timestamp,
                }),
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        line = index + 1,
                        error = %err,
                        "skipping corrupt log line"
                    );
                }
            }
        }
        Ok(records)
    }

    fn read_offsets(&self) -> Result<Offsets> {
        let path = self.offsets_path();
        if !path.exists() {
            return Ok(Offsets::new());
        }
        let raw = fs::read_to_string(&path)?;
        if raw.trim().is_empty() {
            return Ok(Offsets::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_offsets(&self, offsets: &Offsets) -> Result<()> {
        let path = self.offsets_path();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(offsets)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[async_trait]
impl Broker for FileLogBroker {
    async fn send(&self, topic: &str, key: Option<&str>, value: Bytes) -> Result<RecordMeta> {
        let value = String::from_utf8(value.to_vec())
            .map_err(|err| EventError::InvalidPayload(format!("record is not UTF-8: {err}")))?;
        let _guard = self.lock.lock();
        let offset = self.read_log(topic)?.last().map(|r| r.offset + 1).unwrap_or(0);
        let line = LogLine {
            offset,
            key: key.map(str::to_owned),
            timestamp: Utc::now(),
            value,
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(topic))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &line)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        debug!(topic, offset, "record appended to file log");
        Ok(RecordMeta {
            topic: topic.to_owned(),
            partition: 0,
            offset,
        })
    }

    async fn fetch(
        &self,
        topics: &[String],
        group: &str,
        max_records: usize,
    ) -> Result<Vec<Record>> {
        let _guard = self.lock.lock();
        let mut offsets = self.read_offsets()?;
        let mut batch = Vec::new();
        let mut advanced = false;
        for topic in topics {
            if batch.len() >= max_records {
                break;
            }
            let position = offsets
                .entry(group.to_owned())
                .or_default()
                .entry(topic.clone())
                .or_insert(0);
            let pending: Vec<Record> = self
                .read_log(topic)?
                .into_iter()
                .filter(|record| record.offset >= *position)
                .take(max_records - batch.len())
                .collect();
            if let Some(last) = pending.last() {
                *position = last.offset + 1;
                advanced = true;
            }
            batch.extend(pending);
        }
        if advanced {
            self.write_offsets(&offsets)?;
        }
        Ok(batch)
    }

    async fn records(&self, topic: &str) -> Result<Vec<Record>> {
        let _guard = self.lock.lock();
        self.read_log(topic)
    }

    fn name(&self) -> &'static str {
        "file_log"
    }
}
