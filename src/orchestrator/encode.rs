//! Fan-out: turn an encode request into job records.

use super::{paths, Orchestrator};
use crate::dispatcher::priority_for;
use reelforge_av::builder::{fps_row, target_bitrate, target_fps};
use reelforge_av::BuildSettings;
use reelforge_common::{EncodingId, MediaId, ProfileId, Result};
use reelforge_db::get_conn;
use reelforge_db::models::{EncodeProfile, Media};
use reelforge_db::queries::{chunk_groups, encodings, media, profiles};
use reelforge_db::queries::encodings::{CreateOutcome, NewEncoding};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub media_id: MediaId,
    /// Explicit profiles; `None` means every active profile.
    pub profiles: Option<Vec<ProfileId>>,
    /// Replace existing records for the selected pairs.
    pub force: bool,
    /// Overrides the configured chunking switch.
    pub allow_chunking: Option<bool>,
}

impl EncodeRequest {
    pub fn new(media_id: MediaId) -> Self {
        Self {
            media_id,
            profiles: None,
            force: false,
            allow_chunking: None,
        }
    }

    pub fn profiles(mut self, ids: Vec<ProfileId>) -> Self {
        self.profiles = Some(ids);
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn allow_chunking(mut self, allow: bool) -> Self {
        self.allow_chunking = Some(allow);
        self
    }
}

/// Why a profile produced no job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The profile would upscale the source and is not a minimum resolution.
    Upscale,
    /// No bitrate is defined for this codec, frame rate and resolution.
    Unsupported,
    /// A pending, running or successful record already covers the pair.
    Occupied(EncodingId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeMode {
    /// Nothing needed encoding.
    Idle,
    SingleShot,
    Chunked { group_key: String, segments: usize },
}

#[derive(Debug, Clone)]
pub struct EncodeReport {
    pub mode: EncodeMode,
    pub queued: Vec<EncodingId>,
    pub skipped: Vec<(ProfileId, SkipReason)>,
}

/// Whether `profile` may be encoded from `media`, and if not, why.
///
/// Mirrors the command builder's fail-closed rules so that no record is
/// created for a job whose commands would come out empty.
pub fn applicability(
    media: &Media,
    profile: &EncodeProfile,
    settings: &BuildSettings,
) -> Option<SkipReason> {
    if media.height < profile.resolution
        && !settings.minimum_resolutions.contains(&profile.resolution)
    {
        return Some(SkipReason::Upscale);
    }
    let fps = target_fps(media.media_info.frame_rate);
    if target_bitrate(profile.codec, fps_row(fps), profile.resolution).is_none() {
        return Some(SkipReason::Unsupported);
    }
    None
}

impl Orchestrator {
    /// Create and dispatch job records for a media.
    ///
    /// Sources longer than the chunking threshold are segmented once and
    /// every selected profile gets one chunk job per segment. If segmenting
    /// fails the media is encoded single-shot instead.
    pub async fn encode(&self, req: EncodeRequest) -> Result<EncodeReport> {
        let (media, candidates) = {
            let conn = get_conn(&self.pool)?;
            let media = media::require_media(&conn, req.media_id)?;
            let candidates = match &req.profiles {
                Some(ids) => ids
                    .iter()
                    .map(|id| profiles::require_profile(&conn, *id))
                    .collect::<Result<Vec<_>>>()?,
                None => profiles::list_active_profiles(&conn)?,
            };
            (media, candidates)
        };

        let settings = self.config.build_settings();
        let mut report = EncodeReport {
            mode: EncodeMode::Idle,
            queued: Vec::new(),
            skipped: Vec::new(),
        };

        let mut selected = Vec::with_capacity(candidates.len());
        for profile in candidates {
            match applicability(&media, &profile, &settings) {
                Some(reason) => {
                    tracing::debug!(media_id = %media.id, profile = %profile.name, ?reason, "profile skipped");
                    report.skipped.push((profile.id, reason));
                }
                None => selected.push(profile),
            }
        }

        if req.force {
            for profile in &selected {
                let removed = {
                    let conn = get_conn(&self.pool)?;
                    encodings::delete_for_pair(&conn, media.id, profile.id)?
                };
                if !removed.is_empty() {
                    tracing::info!(media_id = %media.id, profile = %profile.name, removed = removed.len(), "forced re-encode replaces records");
                }
                self.discard_records(&removed, None);
            }
        } else {
            let conn = get_conn(&self.pool)?;
            let mut free = Vec::with_capacity(selected.len());
            for profile in selected {
                match encodings::find_occupying(&conn, media.id, profile.id)? {
                    Some(existing) => report
                        .skipped
                        .push((profile.id, SkipReason::Occupied(existing.id))),
                    None => free.push(profile),
                }
            }
            selected = free;
        }

        selected.sort_by_key(|p| (p.resolution, p.codec.as_str()));

        if !selected.is_empty() {
            let chunking = req
                .allow_chunking
                .unwrap_or(self.config.encoding.allow_chunking);
            let mut chunked = false;

            if chunking && media.duration_secs > self.config.encoding.chunking_threshold_secs {
                match self.segment_source(&media).await {
                    Ok((group_key, segments)) => {
                        for profile in &selected {
                            for segment in &segments {
                                let new = NewEncoding {
                                    media_id: media.id,
                                    profile_id: profile.id,
                                    chunk: true,
                                    chunk_group_key: Some(group_key.clone()),
                                    chunk_source_path: Some(segment.clone()),
                                    retries: 0,
                                    priority: priority_for(profile.resolution),
                                };
                                self.create_and_submit(&new, req.force, &mut report).await?;
                            }
                        }
                        tracing::info!(
                            media_id = %media.id,
                            group = %group_key,
                            segments = segments.len(),
                            profiles = selected.len(),
                            "chunked encode dispatched"
                        );
                        report.mode = EncodeMode::Chunked {
                            segments: segments.len(),
                            group_key,
                        };
                        chunked = true;
                    }
                    Err(e) => {
                        tracing::warn!(media_id = %media.id, error = %e, "segmenting failed, encoding single-shot");
                    }
                }
            }

            if !chunked {
                for profile in &selected {
                    let new = NewEncoding {
                        media_id: media.id,
                        profile_id: profile.id,
                        chunk: false,
                        chunk_group_key: None,
                        chunk_source_path: None,
                        retries: 0,
                        priority: priority_for(profile.resolution),
                    };
                    self.create_and_submit(&new, req.force, &mut report).await?;
                }
                tracing::info!(media_id = %media.id, jobs = report.queued.len(), "single-shot encode dispatched");
                report.mode = EncodeMode::SingleShot;
            }
        }

        self.refresh_status(media.id)?;
        Ok(report)
    }

    async fn create_and_submit(
        &self,
        new: &NewEncoding,
        force: bool,
        report: &mut EncodeReport,
    ) -> Result<()> {
        let outcome = {
            let conn = get_conn(&self.pool)?;
            encodings::create_encoding(&conn, new, force)?
        };
        match outcome {
            CreateOutcome::Created {
                encoding,
                superseded,
            } => {
                self.discard_records(&superseded, None);
                self.submit(&encoding).await?;
                report.queued.push(encoding.id);
            }
            CreateOutcome::Duplicate { existing } => {
                tracing::debug!(media_id = %new.media_id, %existing, "duplicate job dropped");
                report
                    .skipped
                    .push((new.profile_id, SkipReason::Occupied(existing)));
            }
        }
        Ok(())
    }

    /// Split the source into segments and record the group.
    async fn segment_source(&self, media: &Media) -> Result<(String, Vec<String>)> {
        let group_key = uuid::Uuid::new_v4().to_string();
        let chunks_root = self.config.chunks_dir();
        let out_dir = paths::segments_dir(&chunks_root, &group_key);

        let segments = match self
            .tools
            .segment(
                Path::new(&media.source_path),
                &out_dir,
                self.config.encoding.chunk_duration_secs,
                self.config.timeouts.segment(),
            )
            .await
        {
            Ok(segments) => segments,
            Err(e) => {
                let _ = std::fs::remove_dir_all(paths::group_dir(&chunks_root, &group_key));
                return Err(e.into());
            }
        };

        let segments: Vec<String> = segments
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let conn = get_conn(&self.pool)?;
        chunk_groups::insert_group(&conn, &group_key, media.id, &segments)?;
        Ok((group_key, segments))
    }
}
