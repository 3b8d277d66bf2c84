use crate::cmd::{ManifestArgs, ReleaseArgs};
use anyhow::{bail, Context, Result};
use clap::Parser;
use log::warn;
use std::path::PathBuf;

/// Cross-check the role manifest, the opinion pair, and every loaded job
/// property schema, reporting every offense at once.
#[derive(Debug, Parser)]
pub(crate) struct Validate {
    #[clap(flatten)]
    pub(crate) releases: ReleaseArgs,

    #[clap(flatten)]
    pub(crate) manifest: ManifestArgs,

    /// Optional dotenv-style defaults file whose keys must all be
    /// declared manifest variables.
    #[clap(long = "env-defaults", env = "FISSILE_ENV_DEFAULTS")]
    pub(crate) env_defaults: Option<PathBuf>,
}

impl Validate {
    pub(crate) fn run(&self) -> Result<()> {
        let set = self.releases.load()?;
        let (manifest, opinions) = self.manifest.load(&set)?;
        let env_defaults = self
            .env_defaults
            .as_ref()
            .map(rolesys::load_env_defaults)
            .transpose()
            .context("Unable to load env defaults")?;

        let report = rolesys::validator::validate(&manifest, &set, &opinions, env_defaults.as_ref());
        for warning in &report.warnings {
            warn!("{}", warning);
        }
        if !report.is_ok() {
            for issue in &report.errors {
                eprintln!("{}", issue);
            }
            bail!("Validation failed with {} errors", report.errors.len());
        }
        println!("Validation passed");
        Ok(())
    }
}
