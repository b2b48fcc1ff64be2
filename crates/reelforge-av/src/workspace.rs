//! Scratch workspaces for encoder and cut operations.
//!
//! A [`Workspace`] is a temporary directory inside the configured temp area.
//! Tools write into it; [`Workspace::finalize`] moves the finished file to
//! its destination. Dropping the workspace deletes whatever is left, so a
//! failed or killed job never leaves partial output behind.

use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::{Error, Result};

pub struct Workspace {
    temp_dir: TempDir,
}

impl Workspace {
    /// Create a workspace directory under `root`, creating `root` if needed.
    pub fn new_in(root: &Path, prefix: &str) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let temp_dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(root)
            .map_err(Error::Io)?;
        Ok(Self { temp_dir })
    }

    /// Path to the temporary directory.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Path for a named file inside the workspace.
    pub fn temp_file(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Move `produced` (a file inside this workspace) to `dest`, replacing
    /// any existing file, then delete the workspace.
    ///
    /// Rename is tried first; across filesystems the file is copied next to
    /// `dest` and renamed over it so readers never observe a partial file.
    pub fn finalize(self, produced: &Path, dest: &Path) -> Result<PathBuf> {
        if !produced.exists() {
            return Err(Error::file_not_found(produced));
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if std::fs::rename(produced, dest).is_err() {
            let staging = dest.with_extension("partial");
            std::fs::copy(produced, &staging)?;
            if let Err(e) = std::fs::rename(&staging, dest) {
                let _ = std::fs::remove_file(&staging);
                return Err(Error::Io(e));
            }
        }

        Ok(dest.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn workspace_lives_under_root() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::new_in(&root.path().join("scratch"), "enc-").unwrap();
        assert!(ws.path().starts_with(root.path()));
        let tf = ws.temp_file("pass.log");
        assert!(tf.starts_with(ws.path()));
    }

    #[test]
    fn finalize_replaces_destination() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("out").join("video.mp4");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, b"old").unwrap();

        let ws = Workspace::new_in(root.path(), "enc-").unwrap();
        let produced = ws.temp_file("video.mp4");
        fs::write(&produced, b"new").unwrap();
        let ws_path = ws.path().to_path_buf();

        let final_path = ws.finalize(&produced, &dest).unwrap();
        assert_eq!(final_path, dest);
        assert_eq!(fs::read(&dest).unwrap(), b"new");
        assert!(!ws_path.exists());
    }

    #[test]
    fn finalize_missing_output_fails() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::new_in(root.path(), "enc-").unwrap();
        let missing = ws.temp_file("nothing.mp4");
        assert!(ws.finalize(&missing, &root.path().join("x.mp4")).is_err());
    }

    #[test]
    fn drop_removes_partial_output() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::new_in(root.path(), "enc-").unwrap();
        fs::write(ws.temp_file("partial.mp4"), b"half").unwrap();
        let path = ws.path().to_path_buf();
        drop(ws);
        assert!(!path.exists());
    }
}
