use crate::cmd::{ManifestArgs, ReleaseArgs};
use anyhow::{bail, Context, Result};
use clap::Parser;
use compilesys::{CancelToken, CompileOptions, Outcome};
use docker_cli_wrapper::ContainerEngine;
use imagesys::group_packages;
use log::{error, info};
use releasesys::PackageId;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Compile every package the selected instance groups need, across a
/// fixed pool of disposable containers.
#[derive(Debug, Parser)]
pub(crate) struct Compile {
    #[clap(flatten)]
    pub(crate) releases: ReleaseArgs,

    #[clap(flatten)]
    pub(crate) manifest: ManifestArgs,

    /// Base OS image the compilation containers run.
    #[clap(long, env = "FISSILE_STEMCELL")]
    pub(crate) stemcell: String,

    /// Compilation cache root.
    #[clap(
        long = "cache-dir",
        env = "FISSILE_CACHE_DIR",
        default_value = ".fissile/compilation"
    )]
    pub(crate) cache_dir: PathBuf,

    /// Number of concurrent compilation containers; defaults to the
    /// number of CPUs.
    #[clap(long, env = "FISSILE_WORKERS")]
    pub(crate) workers: Option<usize>,

    /// Keep the container of a failed compile around for debugging.
    #[clap(long = "keep-container")]
    pub(crate) keep_container: bool,

    /// Docker network for the compilation containers.
    #[clap(long)]
    pub(crate) network: Option<String>,

    /// Cancel the run after this many seconds.
    #[clap(long = "timeout-secs")]
    pub(crate) timeout_secs: Option<u64>,
}

impl Compile {
    pub(crate) fn run(&self) -> Result<()> {
        let set = self.releases.load()?;
        let (manifest, _opinions) = self.manifest.load(&set)?;
        let groups = manifest.select_instance_groups(&self.manifest.instance_groups)?;

        let roots: Vec<PackageId> = groups
            .iter()
            .flat_map(|group| group_packages(&set, group))
            .collect();

        let engine = ContainerEngine::from_environment()
            .context("Unable to find a container engine")?;
        let mut options = CompileOptions::new(self.stemcell.as_str(), &self.cache_dir);
        if let Some(workers) = self.workers {
            options.workers = workers;
        }
        options.keep_container_on_failure = self.keep_container;
        options.network = self.network.clone();

        let cancel = CancelToken::new();
        if let Some(secs) = self.timeout_secs {
            let watchdog = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_secs(secs));
                watchdog.cancel();
            });
        }

        let report = compilesys::compile(&engine, &set, &roots, &options, &cancel)
            .context("Package compilation failed to run")?;

        let mut failures = 0;
        for package in &report.packages {
            match &package.outcome {
                Outcome::Built => info!("Compiled {}", package.names.join(", ")),
                Outcome::CacheHit => info!("Cache hit for {}", package.names.join(", ")),
                Outcome::Failed { logs } => {
                    failures += 1;
                    error!("Failed to compile {}:\n{}", package.names.join(", "), logs);
                }
                Outcome::DependencyFailed { dependency } => {
                    failures += 1;
                    error!(
                        "Skipped {}: dependency {} failed",
                        package.names.join(", "),
                        dependency
                    );
                }
                Outcome::Cancelled => {
                    failures += 1;
                    error!("Cancelled {}", package.names.join(", "));
                }
            }
        }
        if failures > 0 {
            bail!("{} of {} packages failed", failures, report.packages.len());
        }
        Ok(())
    }
}
