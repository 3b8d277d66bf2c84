use crate::cmd::ReleaseArgs;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

/// Scan the compilation cache and delete every entry whose fingerprint no
/// loaded release references.
#[derive(Debug, Parser)]
pub(crate) struct CleanCache {
    #[clap(flatten)]
    pub(crate) releases: ReleaseArgs,

    /// Compilation cache root.
    #[clap(
        long = "cache-dir",
        env = "FISSILE_CACHE_DIR",
        default_value = ".fissile/compilation"
    )]
    pub(crate) cache_dir: PathBuf,
}

impl CleanCache {
    pub(crate) fn run(&self) -> Result<()> {
        let set = self.releases.load()?;
        let removed = compilesys::clean_cache(&self.cache_dir, &set)
            .context("Unable to clean the compilation cache")?;
        for path in &removed {
            println!("removed: {}", path.display());
        }
        println!("{} entries removed", removed.len());
        Ok(())
    }
}
