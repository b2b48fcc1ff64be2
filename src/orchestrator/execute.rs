//! Running a single job record.

use super::failure::{classify_av, classify_run, FailureKind};
use super::{paths, remove_file_logged, Orchestrator};
use crate::media_tools::EncoderRun;
use reelforge_av::{build_commands, BuildRequest, EncoderCommand, Workspace};
use reelforge_common::{EncodingId, EncodingStatus, Result};
use reelforge_db::get_conn;
use reelforge_db::models::{EncodeProfile, Encoding, Media};
use reelforge_db::queries::encodings::{CreateOutcome, NewEncoding};
use reelforge_db::queries::{chunk_groups, encodings, media, profiles};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

struct Executed {
    output: PathBuf,
    logs: String,
}

enum JobFailure {
    /// The record was cancelled or superseded while running.
    Cancelled,
    Failed { kind: FailureKind, logs: String },
}

impl JobFailure {
    fn failed(kind: FailureKind, logs: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            logs: logs.into(),
        }
    }

    fn tool(err: &reelforge_av::Error, logs: &str) -> Self {
        Self::failed(classify_av(err), append_log(logs, &err.to_string()))
    }
}

fn append_log(logs: &str, line: &str) -> String {
    if logs.is_empty() {
        line.to_string()
    } else {
        format!("{logs}\n{line}")
    }
}

impl Orchestrator {
    /// Run one job record to completion.
    ///
    /// Records that are gone or no longer pending are skipped. The outcome
    /// is written to the record; follow-up work (retry, fan-in, status,
    /// packaging, trims) runs before this returns.
    pub async fn run_encoding(&self, id: EncodingId) -> Result<()> {
        let (encoding, media, profile) = {
            let conn = get_conn(&self.pool)?;
            let Some(encoding) = encodings::get_encoding(&conn, id)? else {
                tracing::debug!(encoding_id = %id, "job record gone before start");
                return Ok(());
            };
            if encoding.status != EncodingStatus::Pending {
                tracing::debug!(encoding_id = %id, status = %encoding.status, "job not pending, skipping");
                return Ok(());
            }
            let media = media::require_media(&conn, encoding.media_id)?;
            let profile = profiles::require_profile(&conn, encoding.profile_id)?;
            (encoding, media, profile)
        };

        // Tracked before the claim so a kill racing the claim is not lost.
        let registration = self.processes.register(id);
        {
            let conn = get_conn(&self.pool)?;
            if !encodings::mark_running(&conn, id)? {
                return Ok(());
            }
        }

        tracing::info!(
            encoding_id = %id,
            media_id = %media.id,
            profile = %profile.name,
            chunk = encoding.chunk,
            retries = encoding.retries,
            "encoding started"
        );
        self.refresh_status(media.id)?;

        let started = Instant::now();
        let result = self
            .execute(&encoding, &media, &profile, registration.token())
            .await;
        drop(registration);
        let run_time = started.elapsed().as_secs_f64();

        match result {
            Ok(done) => {
                self.on_job_success(&encoding, &profile, done, run_time)
                    .await
            }
            Err(JobFailure::Cancelled) => {
                tracing::info!(encoding_id = %id, "encoding cancelled");
                Ok(())
            }
            Err(JobFailure::Failed { kind, logs }) => {
                self.on_job_failure(&encoding, &profile, kind, &logs, run_time)
                    .await
            }
        }
    }

    async fn execute(
        &self,
        encoding: &Encoding,
        media: &Media,
        profile: &EncodeProfile,
        token: &CancellationToken,
    ) -> std::result::Result<Executed, JobFailure> {
        let ffmpeg = self
            .tools
            .ffmpeg()
            .map_err(|e| JobFailure::tool(&e, ""))?;

        let input = PathBuf::from(
            encoding
                .chunk_source_path
                .as_deref()
                .unwrap_or(&media.source_path),
        );
        let destination = self.output_path_for(encoding, media, profile);

        let mut info = media.media_info.clone();
        let timeout = if encoding.chunk {
            info.duration_secs = self.segment_duration(encoding, media, &input).await;
            self.config.timeouts.chunk()
        } else {
            self.config.timeouts.encode()
        };

        let prefix = format!("encode-{}-", encoding.id);
        let workspace = Workspace::new_in(&self.config.work_dir(), &prefix)
            .map_err(|e| JobFailure::tool(&e, ""))?;
        let file_name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("output.{}", profile.extension));
        let produced = workspace.temp_file(&file_name);
        let pass_log = workspace.temp_file("passlog");

        let settings = self.config.build_settings();
        let commands = build_commands(&BuildRequest {
            ffmpeg: &ffmpeg,
            input: &input,
            media_info: &info,
            resolution: profile.resolution,
            codec: profile.codec.as_str(),
            output: &produced,
            pass_log: &pass_log,
            is_chunk: encoding.chunk,
            settings: &settings,
        })
        .map_err(|e| JobFailure::failed(FailureKind::Permanent, e.to_string()))?;
        if commands.is_empty() {
            return Err(JobFailure::failed(
                FailureKind::Permanent,
                format!(
                    "profile {} does not apply to a {}p source",
                    profile.name, info.height
                ),
            ));
        }

        let rendered = commands
            .iter()
            .map(EncoderCommand::display)
            .collect::<Vec<_>>()
            .join("\n");
        self.with_conn(|conn| encodings::set_commands(conn, encoding.id, &rendered));

        let deadline = tokio::time::Instant::now() + timeout;
        let mut logs = String::new();
        for (index, cmd) in commands.iter().enumerate() {
            let tail = self
                .run_pass(
                    encoding.id,
                    cmd,
                    index,
                    commands.len(),
                    info.duration_secs,
                    deadline,
                    timeout,
                    token,
                )
                .await
                .map_err(|failure| match failure {
                    JobFailure::Failed { kind, logs: tail } => {
                        JobFailure::failed(kind, append_log(&logs, &tail))
                    }
                    cancelled => cancelled,
                })?;
            logs = append_log(&logs, &tail);
        }

        if !produced.exists() {
            return Err(JobFailure::failed(
                FailureKind::Transient,
                append_log(&logs, "encoder exited cleanly but wrote no output"),
            ));
        }

        let output = workspace
            .finalize(&produced, &destination)
            .map_err(|e| JobFailure::tool(&e, &logs))?;
        Ok(Executed { output, logs })
    }

    /// Run one encoder command under the job's watchdog and cancellation.
    #[allow(clippy::too_many_arguments)]
    async fn run_pass(
        &self,
        id: EncodingId,
        cmd: &EncoderCommand,
        index: usize,
        passes: usize,
        duration_secs: f64,
        deadline: tokio::time::Instant,
        timeout: Duration,
        token: &CancellationToken,
    ) -> std::result::Result<String, JobFailure> {
        let mut run: Box<dyn EncoderRun> = self.tools.spawn_encoder(cmd).map_err(|e| {
            JobFailure::failed(classify_run(&e), e.to_string())
        })?;
        let pid = run.pid();
        self.processes.set_pid(id, pid);
        self.with_conn(|conn| encodings::set_pid(conn, id, pid));

        let mut reported = -1.0_f64;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    run.kill().await;
                    return Err(JobFailure::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    run.kill().await;
                    tracing::warn!(encoding_id = %id, kind = FailureKind::Timeout.as_str(), "encoder exceeded its time limit");
                    return Err(JobFailure::failed(
                        FailureKind::Timeout,
                        format!("killed after exceeding {}s", timeout.as_secs()),
                    ));
                }
                next = run.next_progress() => match next {
                    Ok(Some(progress)) => {
                        let fraction = if duration_secs > 0.0 {
                            (progress.elapsed_secs / duration_secs).clamp(0.0, 1.0)
                        } else {
                            0.0
                        };
                        let percent = ((index as f64 + fraction) / passes as f64 * 100.0).floor();
                        if percent > reported {
                            reported = percent;
                            self.with_conn(|conn| encodings::update_progress(conn, id, percent));
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        run.kill().await;
                        return Err(JobFailure::failed(classify_run(&e), e.to_string()));
                    }
                },
            }
        }

        let finished = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(JobFailure::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(JobFailure::failed(
                    FailureKind::Timeout,
                    format!("killed after exceeding {}s", timeout.as_secs()),
                ));
            }
            finished = run.finish() => finished,
        };

        match finished {
            Ok(log) => Ok(log.tail),
            Err(e) => {
                let kind = classify_run(&e);
                Err(JobFailure::failed(kind, e.to_string()))
            }
        }
    }

    /// Length of the segment a chunk encodes. Probed when possible,
    /// otherwise derived from the segment's place in its group.
    async fn segment_duration(&self, encoding: &Encoding, media: &Media, input: &Path) -> f64 {
        match self.tools.probe(input).await {
            Ok(probed) if probed.duration_secs > 0.0 => return probed.duration_secs,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(encoding_id = %encoding.id, error = %e, "segment probe failed, estimating duration");
            }
        }
        let index = encoding.chunk_group_key.as_deref().and_then(|key| {
            let conn = get_conn(&self.pool).ok()?;
            let group = chunk_groups::get_group(&conn, key).ok()??;
            group
                .segments
                .iter()
                .position(|s| Some(s.as_str()) == encoding.chunk_source_path.as_deref())
        });
        segment_span(
            media.media_info.duration_secs,
            self.config.encoding.chunk_duration_secs as f64,
            index,
        )
    }

    /// Where a record's finished output belongs.
    fn output_path_for(&self, encoding: &Encoding, media: &Media, profile: &EncodeProfile) -> PathBuf {
        match (&encoding.chunk_group_key, &encoding.chunk_source_path) {
            (Some(key), Some(segment)) if encoding.chunk => paths::chunk_output_path(
                &self.config.chunks_dir(),
                key,
                profile,
                Path::new(segment),
            ),
            _ => paths::rendition_path(&self.config.storage.media_root, profile, media),
        }
    }

    /// Best-effort bookkeeping write; failures are logged, not propagated.
    fn with_conn<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> Result<T>) {
        let outcome = get_conn(&self.pool).and_then(|conn| f(&*conn));
        if let Err(e) = outcome {
            tracing::warn!(error = %e, "job bookkeeping write failed");
        }
    }

    async fn on_job_success(
        &self,
        encoding: &Encoding,
        profile: &EncodeProfile,
        done: Executed,
        run_time: f64,
    ) -> Result<()> {
        let output = done.output.to_string_lossy().into_owned();
        let recorded = {
            let conn = get_conn(&self.pool)?;
            encodings::complete_success(&conn, encoding.id, &output, &done.logs, run_time)?
        };
        if !recorded {
            tracing::warn!(encoding_id = %encoding.id, "record removed while encoding, discarding output");
            remove_file_logged(&done.output);
            return Ok(());
        }

        tracing::info!(
            encoding_id = %encoding.id,
            media_id = %encoding.media_id,
            profile = %profile.name,
            chunk = encoding.chunk,
            run_time_secs = run_time,
            "encoding finished"
        );

        match encoding.chunk_group_key.as_deref().filter(|_| encoding.chunk) {
            Some(key) => self.try_finalize_group(key, profile).await,
            None => self.after_rendition(encoding.media_id, profile).await,
        }
    }

    async fn on_job_failure(
        &self,
        encoding: &Encoding,
        profile: &EncodeProfile,
        kind: FailureKind,
        logs: &str,
        run_time: f64,
    ) -> Result<()> {
        let recorded = {
            let conn = get_conn(&self.pool)?;
            encodings::complete_fail(&conn, encoding.id, logs, run_time)?
        };
        if !recorded {
            tracing::debug!(encoding_id = %encoding.id, "record removed while encoding");
            return Ok(());
        }

        if kind == FailureKind::ResourceExhausted {
            tracing::error!(
                encoding_id = %encoding.id,
                media_id = %encoding.media_id,
                profile = %profile.name,
                kind = kind.as_str(),
                "encoding failed, out of resources"
            );
        } else {
            tracing::warn!(
                encoding_id = %encoding.id,
                media_id = %encoding.media_id,
                profile = %profile.name,
                kind = kind.as_str(),
                retries = encoding.retries,
                "encoding failed"
            );
        }

        if kind.is_retryable() && encoding.retries < self.config.encoding.retry_ceiling {
            self.retry(encoding).await?;
        } else if let Some(key) = encoding.chunk_group_key.as_deref().filter(|_| encoding.chunk) {
            self.fail_group(key, profile, encoding.media_id, logs).await?;
        }

        self.refresh_status(encoding.media_id)?;
        Ok(())
    }

    /// Queue a fresh record for a failed one.
    pub(crate) async fn retry(&self, failed: &Encoding) -> Result<()> {
        let new = NewEncoding {
            media_id: failed.media_id,
            profile_id: failed.profile_id,
            chunk: failed.chunk,
            chunk_group_key: failed.chunk_group_key.clone(),
            chunk_source_path: failed.chunk_source_path.clone(),
            retries: failed.retries + 1,
            priority: failed.priority,
        };
        let outcome = {
            let conn = get_conn(&self.pool)?;
            let outcome = encodings::create_encoding(&conn, &new, false)?;
            if failed.chunk && matches!(outcome, CreateOutcome::Created { .. }) {
                encodings::delete_encoding(&conn, failed.id)?;
            }
            outcome
        };

        match outcome {
            CreateOutcome::Created {
                encoding,
                superseded,
            } => {
                tracing::info!(
                    encoding_id = %encoding.id,
                    previous = %failed.id,
                    attempt = encoding.retries,
                    "retrying encoding"
                );
                self.discard_records(&superseded, None);
                self.submit(&encoding).await
            }
            CreateOutcome::Duplicate { existing } => {
                tracing::debug!(previous = %failed.id, %existing, "retry not needed");
                Ok(())
            }
        }
    }
}

/// Duration of segment `index` when a `total`-second source is cut every
/// `chunk_secs`. The last segment holds the remainder.
fn segment_span(total: f64, chunk_secs: f64, index: Option<usize>) -> f64 {
    match index {
        Some(i) => (total - i as f64 * chunk_secs).clamp(0.0, chunk_secs),
        None => total.min(chunk_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_segment_holds_the_remainder() {
        assert_eq!(segment_span(601.0, 300.0, Some(0)), 300.0);
        assert_eq!(segment_span(601.0, 300.0, Some(1)), 300.0);
        assert_eq!(segment_span(601.0, 300.0, Some(2)), 1.0);
    }

    #[test]
    fn unknown_position_caps_at_chunk_length() {
        assert_eq!(segment_span(900.0, 300.0, None), 300.0);
        assert_eq!(segment_span(120.0, 300.0, None), 120.0);
    }
}
