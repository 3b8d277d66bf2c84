mod build_images;
mod clean_cache;
mod compile;
mod diff;
mod validate;

use self::build_images::BuildImages;
use self::clean_cache::CleanCache;
use self::compile::Compile;
use self::diff::Diff;
use self::validate::Validate;
use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use releasesys::{LoadSpec, ReleaseSet};
use rolesys::{Opinions, RoleManifest};
use std::path::PathBuf;

const DEFAULT_LEVEL_FILTER: LevelFilter = LevelFilter::Info;

/// A tool for converting BOSH releases into container images, without a
/// BOSH director anywhere in sight.
#[derive(Debug, Parser)]
#[clap(about, long_about = None, version)]
pub(crate) struct Args {
    /// Logging verbosity: off, error, warn, info, debug, or trace.
    /// When omitted, the RUST_LOG env variable applies.
    #[clap(long = "log-level")]
    pub(crate) log_level: Option<LevelFilter>,

    #[clap(subcommand)]
    pub(crate) subcommand: Subcommand,
}

#[derive(Debug, Parser)]
pub(crate) enum Subcommand {
    /// Cross-check the role manifest and opinions against the releases.
    Validate(Validate),

    /// Compile every package the selected instance groups need.
    Compile(Compile),

    /// Build the packages layer and per-instance-group images.
    BuildImages(BuildImages),

    /// Show what changed between two releases.
    Diff(Diff),

    /// Drop compilation cache entries no loaded release references.
    CleanCache(CleanCache),
}

/// Entrypoint for the `fissile` command line program.
pub(super) fn run(args: Args) -> Result<()> {
    match args.subcommand {
        Subcommand::Validate(validate_args) => validate_args.run(),
        Subcommand::Compile(compile_args) => compile_args.run(),
        Subcommand::BuildImages(build_args) => build_args.run(),
        Subcommand::Diff(diff_args) => diff_args.run(),
        Subcommand::CleanCache(clean_args) => clean_args.run(),
    }
}

/// An explicit `--log-level` wins; otherwise `RUST_LOG` is honored when
/// set, and the built-in default covers the rest.
pub(super) fn init_logger(level: Option<LevelFilter>) {
    match (std::env::var(env_logger::DEFAULT_FILTER_ENV).ok(), level) {
        (Some(_), None) => {
            // No flag given, defer to the environment.
            Builder::from_default_env().init();
        }
        _ => {
            // The filter is scoped to this crate so dependency noise
            // stays out of the output.
            Builder::new()
                .filter(
                    Some(env!("CARGO_CRATE_NAME")),
                    level.unwrap_or(DEFAULT_LEVEL_FILTER),
                )
                .init();
        }
    }
}

/// Release-loading flags shared by every subcommand that reads releases.
#[derive(Debug, Parser)]
pub(crate) struct ReleaseArgs {
    /// Path to a BOSH release directory. Repeat for multiple releases.
    #[clap(long = "release", required = true)]
    pub(crate) releases: Vec<PathBuf>,

    /// Name override, for a dev release directory holding several
    /// indexes. Only valid when a single release is given.
    #[clap(long = "release-name", env = "FISSILE_RELEASE_NAME")]
    pub(crate) release_name: Option<String>,

    /// Version override; defaults to the newest built version.
    /// Only valid when a single release is given.
    #[clap(long = "release-version", env = "FISSILE_RELEASE_VERSION")]
    pub(crate) release_version: Option<String>,

    /// Cache directory for compressed package tarballs.
    #[clap(
        long = "tarball-cache",
        env = "FISSILE_TARBALL_CACHE",
        default_value = ".fissile/tarball-cache"
    )]
    pub(crate) tarball_cache: PathBuf,
}

impl ReleaseArgs {
    pub(crate) fn load(&self) -> Result<ReleaseSet> {
        anyhow::ensure!(
            self.releases.len() == 1
                || (self.release_name.is_none() && self.release_version.is_none()),
            "--release-name and --release-version require a single --release"
        );
        let specs: Vec<LoadSpec> = self
            .releases
            .iter()
            .map(|path| LoadSpec {
                path: path.clone(),
                name: self.release_name.clone(),
                version: self.release_version.clone(),
                cache_dir: self.tarball_cache.clone(),
            })
            .collect();
        ReleaseSet::load(&specs).context("Unable to load releases")
    }
}

/// Role manifest and opinion flags shared by validate/compile/build.
#[derive(Debug, Parser)]
pub(crate) struct ManifestArgs {
    /// Path to the role manifest.
    #[clap(long = "role-manifest", env = "FISSILE_ROLE_MANIFEST")]
    pub(crate) role_manifest: PathBuf,

    /// Path to the light opinions file.
    #[clap(long = "light-opinions", env = "FISSILE_LIGHT_OPINIONS")]
    pub(crate) light_opinions: PathBuf,

    /// Path to the dark opinions file.
    #[clap(long = "dark-opinions", env = "FISSILE_DARK_OPINIONS")]
    pub(crate) dark_opinions: PathBuf,

    /// Restrict the run to the named instance groups. Repeatable;
    /// defaults to every group in the manifest.
    #[clap(long = "instance-group")]
    pub(crate) instance_groups: Vec<String>,
}

impl ManifestArgs {
    pub(crate) fn load(&self, set: &ReleaseSet) -> Result<(RoleManifest, Opinions)> {
        let manifest = RoleManifest::load(&self.role_manifest, set)
            .context("Unable to load the role manifest")?;
        let opinions = Opinions::load(&self.light_opinions, &self.dark_opinions)
            .context("Unable to load opinions")?;
        Ok((manifest, opinions))
    }
}
