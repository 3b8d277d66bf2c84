use anyhow::{Context, Result};
use clap::Parser;
use releasesys::diff::diff_releases;
use releasesys::{LoadSpec, ReleaseSet};
use std::path::PathBuf;

/// Show which job properties and configuration entries were added,
/// deleted, or changed between two releases.
#[derive(Debug, Parser)]
pub(crate) struct Diff {
    /// Exactly two release directories: the old one, then the new one.
    #[clap(long = "release", required = true)]
    pub(crate) releases: Vec<PathBuf>,

    /// Cache directory for compressed package tarballs.
    #[clap(
        long = "tarball-cache",
        env = "FISSILE_TARBALL_CACHE",
        default_value = ".fissile/tarball-cache"
    )]
    pub(crate) tarball_cache: PathBuf,
}

impl Diff {
    pub(crate) fn run(&self) -> Result<()> {
        anyhow::ensure!(
            self.releases.len() == 2,
            "diff needs exactly two --release directories"
        );
        let load = |path: &PathBuf| {
            ReleaseSet::load(&[LoadSpec::new(path, &self.tarball_cache)])
                .with_context(|| format!("Unable to load release '{}'", path.display()))
        };
        let old = load(&self.releases[0])?;
        let new = load(&self.releases[1])?;

        let diff = diff_releases(&old, 0, &new, 0);
        for key in &diff.added {
            println!("added: {}", key);
        }
        for key in &diff.deleted {
            println!("deleted: {}", key);
        }
        for key in &diff.changed {
            println!("changed: {}", key);
        }
        if diff.is_empty() {
            println!("no changes");
        }
        Ok(())
    }
}
