//! Filesystem ingestion adapter: emits one work unit per file newer than the
//! last run's checkpoint.
//!
//! The checkpoint is the newest modification time (unix seconds) seen so far,
//! kept in a [`StateStore`] under `last_modified_time`. Only files with a
//! strictly newer mtime are picked up on the next run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, instrument, trace};

use crate::contract::{
    CompletionNotice, CompletionNotifier, HandleFactory, Metadata, ScheduleType, TriggerAdapter,
    WorkUnit,
};
use crate::error::{BoxError, IngestError, Result};

const NAME: &str = "ReadDir";
const CHECKPOINT_KEY: &str = "last_modified_time";

pub type State = HashMap<String, serde_json::Value>;

/// Persists adapter state between runs.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait StateStore: Send + Sync {
    fn get_state(&self) -> std::result::Result<State, BoxError>;

    fn set_state(&self, state: State) -> std::result::Result<(), BoxError>;
}

/// State kept for the lifetime of the process.
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<State>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get_state(&self) -> std::result::Result<State, BoxError> {
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn set_state(&self, state: State) -> std::result::Result<(), BoxError> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadDirConfig {
    pub input: PathBuf,
    #[serde(default)]
    pub remove_source: bool,
    /// Matched against the file name, not the full path.
    #[serde(default)]
    pub regex_filter: Option<String>,
    #[serde(default)]
    pub recursive: bool,
}

pub struct ReadDir {
    config: ReadDirConfig,
    filter: Option<Regex>,
    state: Box<dyn StateStore>,
}

struct Candidate {
    path: PathBuf,
    modified: i64,
}

impl ReadDir {
    pub fn new(config: ReadDirConfig, state: Box<dyn StateStore>) -> Result<Self> {
        if config.input.as_os_str().is_empty() {
            return Err(IngestError::Config("input is required".into()));
        }
        let filter = config
            .regex_filter
            .as_deref()
            .filter(|pattern| !pattern.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|e| IngestError::Config(format!("invalid regex_filter: {e}")))?;
        Ok(Self {
            config,
            filter,
            state,
        })
    }

    fn checkpoint(state: &State) -> i64 {
        state
            .get(CHECKPOINT_KEY)
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0)
    }

    fn accepts(&self, path: &Path) -> bool {
        match &self.filter {
            Some(filter) => path
                .file_name()
                .map(|name| filter.is_match(&name.to_string_lossy()))
                .unwrap_or(false),
            None => true,
        }
    }

    /// Files under `root` modified after `since`, in lexical order per directory.
    async fn list_files(&self, root: &Path, since: i64) -> std::io::Result<Vec<Candidate>> {
        let mut files = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = Vec::new();
            let mut listing = fs::read_dir(&dir).await?;
            while let Some(entry) = listing.next_entry().await? {
                entries.push(entry.path());
            }
            entries.sort();

            let mut subdirs = Vec::new();
            for path in entries {
                let meta = fs::metadata(&path).await?;
                if meta.is_dir() {
                    if self.config.recursive {
                        subdirs.push(path);
                    }
                    continue;
                }
                let modified = meta
                    .modified()?
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                if modified <= since || !self.accepts(&path) {
                    trace!(path = %path.display(), modified, "Skipping file");
                    continue;
                }
                files.push(Candidate {
                    path: std::path::absolute(&path)?,
                    modified,
                });
            }
            pending.extend(subdirs.into_iter().rev());
        }
        Ok(files)
    }

    async fn copy_into_handle(&self, path: &Path, factory: &dyn HandleFactory) -> std::io::Result<WorkUnit> {
        let handle = factory.produce();
        let mut source = fs::File::open(path).await?;
        let mut writer = handle.writer().await?;
        let copied = tokio::io::copy(&mut source, &mut writer).await?;
        writer.shutdown().await?;
        debug!(path = %path.display(), bytes = copied, "Copied file into handle");

        let mut metadata = Metadata::new();
        metadata.insert(
            format!("{NAME}.InputPath"),
            json!(self.config.input.to_string_lossy()),
        );
        metadata.insert(format!("{NAME}.FilePath"), json!(path.to_string_lossy()));
        Ok(WorkUnit::new(metadata, handle))
    }
}

impl CompletionNotifier for ReadDir {
    fn notify_completion(&self, notice: CompletionNotice) {
        trace!(token = ?notice.token, "ReadDir ignores completion notices");
    }
}

#[async_trait]
impl TriggerAdapter for ReadDir {
    fn name(&self) -> &'static str {
        NAME
    }

    fn schedule_type(&self) -> ScheduleType {
        ScheduleType::CronDriven
    }

    #[instrument(level = "debug", skip_all, fields(input = %self.config.input.display()))]
    async fn execute(&self, factory: &dyn HandleFactory) -> Result<Vec<WorkUnit>> {
        let mut state = self.state.get_state().map_err(|e| {
            error!(error = %e, "Failed to load ReadDir state");
            IngestError::Client(e)
        })?;
        let since = Self::checkpoint(&state);
        debug!(last_modified_time = since, "Loaded checkpoint");

        let files = self.list_files(&self.config.input, since).await.map_err(|e| {
            error!(error = %e, "Failed to list input directory");
            IngestError::Io(e)
        })?;

        let mut newest = since;
        let mut units = Vec::with_capacity(files.len());
        for file in files {
            let unit = self.copy_into_handle(&file.path, factory).await.map_err(|e| {
                error!(error = %e, path = %file.path.display(), "Failed to ingest file");
                IngestError::Io(e)
            })?;
            if self.config.remove_source {
                fs::remove_file(&file.path).await?;
                debug!(path = %file.path.display(), "Removed source file");
            }
            newest = newest.max(file.modified);
            units.push(unit);
        }

        state.insert(CHECKPOINT_KEY.to_string(), json!(newest));
        self.state.set_state(state).map_err(|e| {
            error!(error = %e, "Failed to store ReadDir state");
            IngestError::Client(e)
        })?;

        info!(produced = units.len(), last_modified_time = newest, "Completed ReadDir execution");
        Ok(units)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
