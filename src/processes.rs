//! Live encoder processes, keyed by job record.

use dashmap::DashMap;
use reelforge_common::EncodingId;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct Handle {
    pid: Option<u32>,
    token: CancellationToken,
}

/// Tracks which job records currently own an external process so that
/// cancellation, trim and supersession can stop them.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    handles: DashMap<EncodingId, Handle>,
}

/// A job tracked in a [`ProcessRegistry`] for as long as this lives.
#[derive(Debug)]
pub struct Registration<'a> {
    registry: &'a ProcessRegistry,
    id: EncodingId,
    token: CancellationToken,
}

impl Registration<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a job. The registration's token fires when the job
    /// must stop; dropping the registration stops tracking it, including
    /// when the run is abandoned mid-flight.
    pub fn register(&self, id: EncodingId) -> Registration<'_> {
        let token = CancellationToken::new();
        self.handles.insert(
            id,
            Handle {
                pid: None,
                token: token.clone(),
            },
        );
        Registration {
            registry: self,
            id,
            token,
        }
    }

    pub fn set_pid(&self, id: EncodingId, pid: Option<u32>) {
        if let Some(mut handle) = self.handles.get_mut(&id) {
            handle.pid = pid;
        }
    }

    pub fn remove(&self, id: EncodingId) {
        self.handles.remove(&id);
    }

    pub fn is_tracked(&self, id: EncodingId) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop the process owned by `id`.
    ///
    /// Jobs run by this process are cancelled through their token and killed
    /// by their worker. `recorded_pid` covers processes started by another
    /// engine instance, which only left their pid in the job record; it is
    /// signalled only while its command line still names the job, since the
    /// pid may have been reused.
    pub fn terminate(&self, id: EncodingId, recorded_pid: Option<u32>) -> bool {
        if let Some((_, handle)) = self.handles.remove(&id) {
            tracing::info!(encoding_id = %id, pid = ?handle.pid, "cancelling encoder");
            handle.token.cancel();
            return true;
        }
        match recorded_pid {
            Some(pid) => kill_pid(id, pid),
            None => false,
        }
    }
}

/// True when `pid` is still an encoder started for `id`.
///
/// Encoder arguments always carry the job's scratch directory, whose name
/// embeds the encoding id.
#[cfg(target_os = "linux")]
fn runs_job(id: EncodingId, pid: u32) -> bool {
    let Ok(raw) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
        return false;
    };
    let needle = id.to_string();
    raw.split(|b| *b == 0)
        .any(|arg| String::from_utf8_lossy(arg).contains(&needle))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn runs_job(_id: EncodingId, _pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn kill_pid(id: EncodingId, pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if !runs_job(id, pid) {
        tracing::debug!(encoding_id = %id, pid, "recorded pid no longer runs this job");
        return false;
    }
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => {
            tracing::info!(encoding_id = %id, pid, "killed encoder by pid");
            true
        }
        Err(e) => {
            tracing::debug!(encoding_id = %id, pid, error = %e, "encoder pid not killable");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_pid(id: EncodingId, pid: u32) -> bool {
    tracing::warn!(encoding_id = %id, pid, "killing by pid is unsupported on this platform");
    false
}
