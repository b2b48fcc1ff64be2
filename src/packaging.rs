//! Adaptive-streaming packaging.
//!
//! Every successful primary-family rendition of a media is packaged into
//! one multi-rendition HLS tree at a stable per-media directory. Packaging
//! always writes to a scratch directory first; the scratch tree becomes the
//! stable directory when none exists, and is merged over it otherwise, so
//! concurrent runs never expose a half-written tree.

use crate::orchestrator::{paths, Orchestrator};
use reelforge_av::actions::{merge_into, MANIFEST_NAME};
use reelforge_common::{EncodingStatus, MediaId, Result};
use reelforge_db::get_conn;
use reelforge_db::queries::{encodings, media, profiles};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

impl Orchestrator {
    /// Package a media's primary renditions.
    ///
    /// Returns the manifest path, or `None` when packaging is disabled, the
    /// packager is missing, or no primary rendition exists yet. The stored
    /// manifest path is only written when it changes.
    pub async fn package_media(&self, media_id: MediaId) -> Result<Option<PathBuf>> {
        if !self.config.packaging.enabled {
            return Ok(None);
        }
        if !self.tools.packager_available() {
            tracing::debug!(%media_id, "packager unavailable, skipping packaging");
            return Ok(None);
        }

        let (media, inputs) = {
            let conn = get_conn(&self.pool)?;
            let media = media::require_media(&conn, media_id)?;
            let by_id: HashMap<_, _> = profiles::list_profiles(&conn)?
                .into_iter()
                .map(|p| (p.id, p))
                .collect();

            let mut ranked: Vec<(u32, PathBuf)> = encodings::list_renditions(&conn, media_id)?
                .into_iter()
                .filter(|e| e.status == EncodingStatus::Success)
                .filter_map(|e| {
                    let profile = by_id.get(&e.profile_id)?;
                    if !profile.codec.container().is_packaged() {
                        return None;
                    }
                    let output = PathBuf::from(e.output_path?);
                    output.exists().then_some((profile.resolution, output))
                })
                .collect();
            ranked.sort();
            (media, ranked.into_iter().map(|(_, p)| p).collect::<Vec<_>>())
        };

        if inputs.is_empty() {
            return Ok(None);
        }

        let stable = paths::hls_dir(&self.config.storage.hls_dir, &media);
        let scratch = self.config.storage.hls_dir.join(format!(
            ".{}-{}",
            media.uid,
            uuid::Uuid::new_v4().simple()
        ));

        let packaged = self
            .tools
            .package(
                &inputs,
                &scratch,
                self.config.packaging.segment_duration_secs,
                self.config.timeouts.package(),
            )
            .await;
        if let Err(e) = packaged {
            let _ = std::fs::remove_dir_all(&scratch);
            return Err(e.into());
        }

        let installed = install(&scratch, &stable);
        let _ = std::fs::remove_dir_all(&scratch);
        installed?;

        let manifest = stable.join(MANIFEST_NAME);
        let changed = {
            let conn = get_conn(&self.pool)?;
            media::set_manifest_path(&conn, media_id, Some(&manifest.to_string_lossy()))?
        };
        tracing::info!(
            %media_id,
            renditions = inputs.len(),
            manifest = %manifest.display(),
            changed,
            "media packaged"
        );
        Ok(Some(manifest))
    }

    /// Remove a media's streaming directory and forget its manifest.
    pub(crate) fn clear_packaging(&self, media_id: MediaId) -> Result<()> {
        let media = {
            let conn = get_conn(&self.pool)?;
            let media = media::require_media(&conn, media_id)?;
            media::set_manifest_path(&conn, media_id, None)?;
            media
        };
        let stable = paths::hls_dir(&self.config.storage.hls_dir, &media);
        match std::fs::remove_dir_all(&stable) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Make `scratch` the content of `stable`.
fn install(scratch: &Path, stable: &Path) -> Result<()> {
    if !stable.exists() && std::fs::rename(scratch, stable).is_ok() {
        return Ok(());
    }
    merge_into(scratch, stable)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn install_renames_when_stable_missing() {
        let root = tempfile::tempdir().unwrap();
        let scratch = root.path().join(".a-1");
        fs::create_dir_all(scratch.join("v0")).unwrap();
        fs::write(scratch.join(MANIFEST_NAME), "#EXTM3U\n").unwrap();
        let stable = root.path().join("a");

        install(&scratch, &stable).unwrap();

        assert!(stable.join(MANIFEST_NAME).exists());
        assert!(stable.join("v0").is_dir());
        assert!(!scratch.exists());
    }

    #[test]
    fn install_merges_over_existing_tree() {
        let root = tempfile::tempdir().unwrap();
        let stable = root.path().join("a");
        fs::create_dir_all(&stable).unwrap();
        fs::write(stable.join(MANIFEST_NAME), "old").unwrap();
        fs::write(stable.join("keep.ts"), "k").unwrap();

        let scratch = root.path().join(".a-2");
        fs::create_dir_all(&scratch).unwrap();
        fs::write(scratch.join(MANIFEST_NAME), "new").unwrap();

        install(&scratch, &stable).unwrap();

        assert_eq!(fs::read_to_string(stable.join(MANIFEST_NAME)).unwrap(), "new");
        assert!(stable.join("keep.ts").exists());
    }
}
