//! Trimming.
//!
//! A trim keeps the given time ranges of a media. The source and every
//! finished primary-family rendition are cut losslessly; anything that
//! cannot be cut is dropped and re-derived through the normal encode path.
//! A trim request stays `running` until a primary rendition of its target
//! exists, which may only happen after the re-dispatched encodes finish.

use crate::orchestrator::{paths, remove_file_logged, EncodeRequest, Orchestrator};
use reelforge_av::Workspace;
use reelforge_common::{
    EncodingStatus, Error, MediaId, Result, TimeRange, TrimAction, TrimRequestId, TrimStatus,
};
use reelforge_db::get_conn;
use reelforge_db::models::{EncodeProfile, Encoding, Media, TrimRequest};
use reelforge_db::queries::encodings::FinalEncoding;
use reelforge_db::queries::{encodings, media, profiles, trim_requests};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mp4")
        .to_string()
}

impl Orchestrator {
    /// Trim a media to `ranges`.
    ///
    /// `create_segments` with several ranges creates one child request per
    /// range, each producing its own media; the parent succeeds once all
    /// children are dispatched.
    pub async fn trim(
        &self,
        media_id: MediaId,
        ranges: Vec<TimeRange>,
        action: TrimAction,
    ) -> Result<TrimRequest> {
        if ranges.is_empty() {
            return Err(Error::invalid_input("trim needs at least one time range"));
        }

        let request = {
            let conn = get_conn(&self.pool)?;
            let media = media::require_media(&conn, media_id)?;
            if let Some(range) = ranges
                .iter()
                .find(|r| media.duration_secs > 0.0 && r.start >= media.duration_secs)
            {
                return Err(Error::invalid_input(format!(
                    "range {range} starts after the end of the media ({:.3}s)",
                    media.duration_secs
                )));
            }
            trim_requests::insert_trim_request(&conn, media_id, None, action, &ranges)?
        };
        tracing::info!(trim_id = %request.id, %media_id, %action, ranges = ranges.len(), "trim requested");

        if action == TrimAction::CreateSegments && ranges.len() > 1 {
            {
                let conn = get_conn(&self.pool)?;
                trim_requests::transition(&conn, request.id, TrimStatus::Initial, TrimStatus::Running)?;
            }
            for (index, range) in ranges.iter().enumerate() {
                let child = {
                    let conn = get_conn(&self.pool)?;
                    trim_requests::insert_trim_request(
                        &conn,
                        media_id,
                        Some(request.id),
                        TrimAction::CreateSegments,
                        &[*range],
                    )?
                };
                if let Err(e) = self.run_trim(&child, Some(index + 1)).await {
                    tracing::warn!(trim_id = %child.id, parent = %request.id, error = %e, "trim segment failed");
                }
            }
            let conn = get_conn(&self.pool)?;
            trim_requests::transition(&conn, request.id, TrimStatus::Running, TrimStatus::Success)?;
        } else {
            self.run_trim(&request, None).await?;
        }

        self.reload_trim(request.id)
    }

    fn reload_trim(&self, id: TrimRequestId) -> Result<TrimRequest> {
        let conn = get_conn(&self.pool)?;
        trim_requests::get_trim_request(&conn, id)?
            .ok_or_else(|| Error::not_found(format!("trim request {id}")))
    }

    /// Run one single-path trim, marking the request failed on error.
    async fn run_trim(&self, request: &TrimRequest, part: Option<usize>) -> Result<()> {
        let result = self.process_trim(request, part).await;
        if let Err(e) = &result {
            tracing::warn!(trim_id = %request.id, error = %e, "trim failed");
            let conn = get_conn(&self.pool)?;
            if !trim_requests::transition(&conn, request.id, TrimStatus::Running, TrimStatus::Fail)? {
                trim_requests::transition(&conn, request.id, TrimStatus::Initial, TrimStatus::Fail)?;
            }
        }
        result
    }

    async fn process_trim(&self, request: &TrimRequest, part: Option<usize>) -> Result<()> {
        let (source, by_profile) = {
            let conn = get_conn(&self.pool)?;
            if !trim_requests::transition(&conn, request.id, TrimStatus::Initial, TrimStatus::Running)? {
                return Err(Error::conflict(format!("trim request {} already started", request.id)));
            }
            let source = media::require_media(&conn, request.media_id)?;
            let by_profile: HashMap<_, _> = profiles::list_profiles(&conn)?
                .into_iter()
                .map(|p| (p.id, p))
                .collect();
            (source, by_profile)
        };

        let replace = request.action == TrimAction::Replace;
        let target = if replace {
            self.stop_unfinished(source.id)?;
            source.clone()
        } else {
            self.clone_for_trim(&source, part)?
        };
        {
            let conn = get_conn(&self.pool)?;
            trim_requests::set_target_media(&conn, request.id, target.id)?;
        }

        let source_input = PathBuf::from(&source.source_path);
        let source_dest = PathBuf::from(&target.source_path);
        self.cut_into(&source_input, &request.ranges, &source_dest)
            .await?;

        let info = match self.tools.probe(&source_dest).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(media_id = %target.id, error = %e, "probing trimmed source failed");
                let mut info = target.media_info.clone();
                info.duration_secs = request.ranges.iter().map(TimeRange::duration).sum();
                info
            }
        };
        {
            let conn = get_conn(&self.pool)?;
            media::update_source(&conn, target.id, &source_dest.to_string_lossy(), &info)?;
        }

        let renditions = {
            let conn = get_conn(&self.pool)?;
            encodings::list_renditions(&conn, source.id)?
        };
        for rendition in renditions
            .iter()
            .filter(|r| r.status == EncodingStatus::Success)
        {
            let Some(profile) = by_profile.get(&rendition.profile_id) else {
                continue;
            };
            self.trim_rendition(rendition, profile, &target, &request.ranges, replace)
                .await?;
        }

        if replace {
            self.clear_packaging(target.id)?;
        }

        let report = self.encode(EncodeRequest::new(target.id)).await?;
        tracing::info!(
            trim_id = %request.id,
            media_id = %target.id,
            queued = report.queued.len(),
            "trim re-dispatched missing renditions"
        );

        if self.has_primary_rendition(target.id)? {
            let manifest = match self.package_media(target.id).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::warn!(media_id = %target.id, error = %e, "packaging trimmed media failed");
                    None
                }
            };
            self.events
                .on_primary_rendition_ready(target.id, manifest.as_deref());
            self.complete_outstanding_trims(target.id)?;
        }
        Ok(())
    }

    /// Cut one finished rendition. Primary renditions that cut cleanly are
    /// kept (or copied onto a clone); everything else is dropped so it can
    /// be re-encoded from the trimmed source.
    async fn trim_rendition(
        &self,
        rendition: &Encoding,
        profile: &EncodeProfile,
        target: &Media,
        ranges: &[TimeRange],
        replace: bool,
    ) -> Result<()> {
        let Some(input) = rendition.output_path.as_deref().map(PathBuf::from) else {
            return Ok(());
        };

        let cut = if profile.codec.container().is_packaged() {
            let dest = if replace {
                input.clone()
            } else {
                paths::rendition_path(&self.config.storage.media_root, profile, target)
            };
            match self.cut_into(&input, ranges, &dest).await {
                Ok(()) => Some(dest),
                Err(e) => {
                    tracing::warn!(encoding_id = %rendition.id, profile = %profile.name, error = %e, "lossless cut failed, rendition will be re-encoded");
                    None
                }
            }
        } else {
            None
        };

        match (cut, replace) {
            (Some(_), true) => {}
            (Some(dest), false) => {
                let conn = get_conn(&self.pool)?;
                encodings::insert_final(
                    &conn,
                    &FinalEncoding {
                        media_id: target.id,
                        profile_id: profile.id,
                        status: EncodingStatus::Success,
                        output_path: Some(dest.to_string_lossy().into_owned()),
                        logs: format!("trimmed from {}", rendition.id),
                        total_run_time_secs: 0.0,
                        chunk_group_key: None,
                    },
                )?;
            }
            (None, true) => {
                {
                    let conn = get_conn(&self.pool)?;
                    encodings::delete_encoding(&conn, rendition.id)?;
                }
                remove_file_logged(&input);
            }
            (None, false) => {}
        }
        Ok(())
    }

    /// Losslessly cut `input` down to `ranges`, replacing `dest`.
    async fn cut_into(&self, input: &Path, ranges: &[TimeRange], dest: &Path) -> Result<()> {
        let workspace = Workspace::new_in(&self.config.work_dir(), "trim-")?;
        let staged = workspace.temp_file(&format!("cut.{}", extension_of(input)));
        self.tools
            .cut(input, ranges, &staged, &workspace, self.config.timeouts.cut())
            .await?;
        workspace.finalize(&staged, dest)?;
        Ok(())
    }

    /// Kill and delete every unfinished job of a media, along with chunk
    /// records whose group can no longer complete.
    fn stop_unfinished(&self, media_id: MediaId) -> Result<()> {
        let doomed: Vec<Encoding> = {
            let conn = get_conn(&self.pool)?;
            encodings::list_for_media(&conn, media_id)?
                .into_iter()
                .filter(|e| e.status.is_live() || e.chunk)
                .collect()
        };

        for record in doomed.iter().filter(|r| r.status.is_live()) {
            self.processes.terminate(record.id, record.pid);
        }

        let mut groups = BTreeSet::new();
        {
            let conn = get_conn(&self.pool)?;
            for record in &doomed {
                encodings::delete_encoding(&conn, record.id)?;
                if let Some(key) = &record.chunk_group_key {
                    groups.insert(key.clone());
                }
            }
        }
        for record in &doomed {
            if let Some(output) = &record.output_path {
                remove_file_logged(Path::new(output));
            }
        }
        for key in groups {
            self.cleanup_group_if_idle(&key)?;
        }

        if !doomed.is_empty() {
            tracing::info!(%media_id, removed = doomed.len(), "unfinished jobs stopped for trim");
        }
        self.refresh_status(media_id)?;
        Ok(())
    }

    fn clone_for_trim(&self, source: &Media, part: Option<usize>) -> Result<Media> {
        let uid = uuid::Uuid::new_v4().simple().to_string();
        let title = match part {
            Some(n) => format!("{} (part {n})", source.title),
            None => format!("{} (trimmed)", source.title),
        };
        let source_path = paths::source_path(
            &self.config.storage.media_root,
            &source.owner,
            &uid,
            &extension_of(Path::new(&source.source_path)),
        );
        let conn = get_conn(&self.pool)?;
        let clone = media::clone_media(
            &conn,
            source,
            &uid,
            &title,
            &source_path.to_string_lossy(),
        )?;
        tracing::info!(media_id = %clone.id, from = %source.id, "media cloned for trim");
        Ok(clone)
    }

    fn has_primary_rendition(&self, media_id: MediaId) -> Result<bool> {
        let conn = get_conn(&self.pool)?;
        let by_profile: HashMap<_, _> = profiles::list_profiles(&conn)?
            .into_iter()
            .map(|p| (p.id, p.codec.container()))
            .collect();
        Ok(encodings::list_renditions(&conn, media_id)?
            .iter()
            .filter(|e| e.status == EncodingStatus::Success)
            .any(|e| by_profile.get(&e.profile_id).is_some_and(|c| c.is_packaged())))
    }

    /// Mark running trim requests targeting `media_id` as done once a
    /// primary rendition exists. Each request transitions exactly once.
    pub(crate) fn complete_outstanding_trims(&self, media_id: MediaId) -> Result<usize> {
        let outstanding = {
            let conn = get_conn(&self.pool)?;
            trim_requests::list_outstanding_for_target(&conn, media_id)?
        };
        if outstanding.is_empty() || !self.has_primary_rendition(media_id)? {
            return Ok(0);
        }

        let conn = get_conn(&self.pool)?;
        let mut completed = 0;
        for request in outstanding {
            if trim_requests::transition(&conn, request.id, TrimStatus::Running, TrimStatus::Success)? {
                tracing::info!(trim_id = %request.id, %media_id, "trim complete");
                completed += 1;
            }
        }
        Ok(completed)
    }
}
