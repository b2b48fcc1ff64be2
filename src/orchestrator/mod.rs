//! Fan-out/fan-in encoding orchestration.
//!
//! [`Orchestrator`] owns the job-record lifecycle: it decides between
//! single-shot and chunked encoding, runs individual jobs with a watchdog,
//! folds finished chunk groups back into one rendition, keeps the media's
//! aggregate status current, and fires packaging and trim follow-ups.
//!
//! All shared state lives in the database. Workers may run concurrently
//! and in any order; every transition is a conditional update so that
//! racing finishers cannot double-apply it.

mod encode;
mod execute;
pub mod failure;
mod fan_in;
mod lifecycle;
pub mod paths;
pub mod status;

pub use encode::{applicability, EncodeMode, EncodeReport, EncodeRequest, SkipReason};
pub use failure::FailureKind;
pub use lifecycle::{ImportRequest, RecoveryReport};

use crate::config::Config;
use crate::dispatcher::{JobDispatcher, QueuedJob};
use crate::events::EngineEvents;
use crate::media_tools::MediaTools;
use crate::processes::ProcessRegistry;
use reelforge_common::Result;
use reelforge_db::models::Encoding;
use reelforge_db::queries::{chunk_groups, encodings};
use reelforge_db::{get_conn, DbPool};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

pub struct Orchestrator {
    pub(crate) pool: DbPool,
    pub(crate) config: Arc<Config>,
    pub(crate) tools: Arc<dyn MediaTools>,
    pub(crate) dispatcher: Arc<dyn JobDispatcher>,
    pub(crate) events: Arc<dyn EngineEvents>,
    pub(crate) processes: ProcessRegistry,
}

impl Orchestrator {
    pub fn new(
        pool: DbPool,
        config: Arc<Config>,
        tools: Arc<dyn MediaTools>,
        dispatcher: Arc<dyn JobDispatcher>,
        events: Arc<dyn EngineEvents>,
    ) -> Self {
        Self {
            pool,
            config,
            tools,
            dispatcher,
            events,
            processes: ProcessRegistry::new(),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    pub(crate) async fn submit(&self, encoding: &Encoding) -> Result<()> {
        self.dispatcher
            .submit(QueuedJob {
                encoding_id: encoding.id,
                priority: encoding.priority,
            })
            .await
    }

    /// Stop and clean up after records that were deleted from the database.
    ///
    /// Live records have their process terminated; finished outputs are
    /// removed unless they sit at `keep`. Chunk groups left without any
    /// record are dropped along with their scratch files.
    pub(crate) fn discard_records(&self, records: &[Encoding], keep: Option<&Path>) {
        let mut groups = BTreeSet::new();
        for record in records {
            if record.status.is_live() {
                self.processes.terminate(record.id, record.pid);
            }
            if let Some(output) = record.output_path.as_deref().map(Path::new) {
                if Some(output) != keep {
                    remove_file_logged(output);
                }
            }
            if let Some(key) = record.chunk_group_key.as_deref().filter(|_| record.chunk) {
                groups.insert(key.to_string());
            }
        }
        for key in groups {
            if let Err(e) = self.cleanup_group_if_idle(&key) {
                tracing::warn!(group = %key, error = %e, "chunk group cleanup failed");
            }
        }
    }

    /// Drop a chunk group once no chunk record references it.
    pub(crate) fn cleanup_group_if_idle(&self, group_key: &str) -> Result<bool> {
        {
            let conn = get_conn(&self.pool)?;
            if encodings::count_group_chunks(&conn, group_key)? > 0 {
                return Ok(false);
            }
            chunk_groups::delete_group(&conn, group_key)?;
        }
        let dir = paths::group_dir(&self.config.chunks_dir(), group_key);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to remove chunk scratch");
            }
        }
        tracing::debug!(group = %group_key, "chunk group cleaned up");
        Ok(true)
    }
}

pub(crate) fn remove_file_logged(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove output"),
    }
}
