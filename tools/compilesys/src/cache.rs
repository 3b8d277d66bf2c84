/*!
The durable compilation cache.

Compiled artifacts live at `<root>/<stemcell-id>/<fingerprint>/compiled.tgz`.
Publication is write-then-rename: a worker assembles the fingerprint
directory next to its final location and renames it into place, so a
reader either sees the complete artifact or nothing.
*/

use crate::error;
use crate::Result;
use log::{debug, info};
use releasesys::ReleaseSet;
use snafu::ResultExt;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const ARTIFACT_NAME: &str = "compiled.tgz";

#[derive(Debug, Clone)]
pub struct CompilationCache {
    root: PathBuf,
    stemcell_dir: PathBuf,
}

impl CompilationCache {
    pub fn new(root: impl Into<PathBuf>, stemcell_id: &str) -> Self {
        let root = root.into();
        let stemcell_dir = root.join(path_safe(stemcell_id));
        Self { root, stemcell_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the compiled artifact for `fingerprint` lives, or will live.
    pub fn artifact_path(&self, fingerprint: &str) -> PathBuf {
        self.stemcell_dir.join(fingerprint).join(ARTIFACT_NAME)
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.artifact_path(fingerprint).is_file()
    }

    /// Publish `artifact` as the compiled output for `fingerprint`.
    ///
    /// The artifact is staged into a dot-prefixed sibling of the final
    /// fingerprint directory and renamed into place, so no reader ever
    /// observes a partial artifact. The staging directory must be on the
    /// same filesystem, which it is by construction.
    pub fn store(&self, fingerprint: &str, artifact: &Path) -> Result<()> {
        let staging = self.stemcell_dir.join(format!(".staging-{}", fingerprint));
        fs::create_dir_all(&staging).context(error::DirectoryCreateSnafu {
            path: staging.clone(),
        })?;
        let staged = staging.join(ARTIFACT_NAME);
        fs::rename(artifact, &staged).or_else(|_| {
            // The worker scratch dir may sit on another filesystem; fall
            // back to copy + remove.
            fs::copy(artifact, &staged)
                .map(|_| ())
                .context(error::FileWriteSnafu {
                    path: staged.clone(),
                })
        })?;

        let target = self.stemcell_dir.join(fingerprint);
        fs::rename(&staging, &target).context(error::FileRenameSnafu {
            old_path: staging,
            new_path: target.clone(),
        })?;
        debug!("Cached compiled package at '{}'", target.display());
        Ok(())
    }

    /// Drop a staging directory left behind by an interrupted worker.
    pub fn discard_staging(&self, fingerprint: &str) {
        let staging = self.stemcell_dir.join(format!(".staging-{}", fingerprint));
        let _ = fs::remove_dir_all(staging);
    }

    pub(crate) fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.stemcell_dir).context(error::DirectoryCreateSnafu {
            path: self.stemcell_dir.clone(),
        })
    }
}

/// Remove every cache entry whose fingerprint is not referenced by the
/// current release set, across all stemcells. Returns what was removed.
pub fn clean_cache(root: impl AsRef<Path>, set: &ReleaseSet) -> Result<Vec<PathBuf>> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let referenced: HashSet<&str> = set
        .releases()
        .iter()
        .flat_map(|r| r.packages.iter().map(|p| p.fingerprint.as_str()))
        .collect();

    let mut removed = Vec::new();
    for stemcell_entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let stemcell_entry = stemcell_entry.context(error::CacheWalkSnafu {
            path: root.to_path_buf(),
        })?;
        if !stemcell_entry.path().is_dir() {
            continue;
        }
        for entry in WalkDir::new(stemcell_entry.path()).min_depth(1).max_depth(1) {
            let entry = entry.context(error::CacheWalkSnafu {
                path: root.to_path_buf(),
            })?;
            let fingerprint = entry.file_name().to_string_lossy();
            if referenced.contains(fingerprint.as_ref()) {
                continue;
            }
            fs::remove_dir_all(entry.path()).context(error::RemoveSnafu {
                path: entry.path().to_path_buf(),
            })?;
            removed.push(entry.path().to_path_buf());
        }
    }
    if !removed.is_empty() {
        info!("Removed {} stale cache entries", removed.len());
    }
    Ok(removed)
}

/// Stemcell identifiers are image names and may carry characters that do
/// not belong in a path component.
fn path_safe(stemcell_id: &str) -> String {
    stemcell_id
        .chars()
        .map(|c| if c == '/' || c == ':' { '-' } else { c })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn artifact_paths_follow_the_layout() {
        let cache = CompilationCache::new("/cache", "registry/stemcell:42");
        assert_eq!(
            cache.artifact_path("abc123"),
            PathBuf::from("/cache/registry-stemcell-42/abc123/compiled.tgz")
        );
    }

    #[test]
    fn store_is_visible_only_when_complete() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CompilationCache::new(dir.path().join("cache"), "stemcell");
        cache.ensure_dirs().unwrap();

        let artifact = dir.path().join("compiled.tgz");
        std::fs::write(&artifact, b"artifact-bytes").unwrap();

        assert!(!cache.contains("abc"));
        cache.store("abc", &artifact).unwrap();
        assert!(cache.contains("abc"));
        assert_eq!(
            std::fs::read(cache.artifact_path("abc")).unwrap(),
            b"artifact-bytes"
        );
    }
}
