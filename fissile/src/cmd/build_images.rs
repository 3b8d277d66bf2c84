use crate::cmd::{ManifestArgs, ReleaseArgs};
use anyhow::{bail, Context, Result};
use clap::Parser;
use compilesys::CancelToken;
use docker_cli_wrapper::ContainerEngine;
use imagesys::PlanOptions;
use log::info;
use std::path::PathBuf;

/// Build the shared packages-layer image and one image per selected
/// instance group. Compilation must have run first; the planner refuses
/// to proceed when a compiled artifact is missing.
#[derive(Debug, Parser)]
pub(crate) struct BuildImages {
    #[clap(flatten)]
    pub(crate) releases: ReleaseArgs,

    #[clap(flatten)]
    pub(crate) manifest: ManifestArgs,

    /// Base OS image for the packages layer.
    #[clap(long, env = "FISSILE_STEMCELL")]
    pub(crate) stemcell: String,

    /// Compilation cache root holding the compiled artifacts.
    #[clap(
        long = "cache-dir",
        env = "FISSILE_CACHE_DIR",
        default_value = ".fissile/compilation"
    )]
    pub(crate) cache_dir: PathBuf,

    /// Registry prefix for image names, e.g. `registry.example.com:5000`.
    #[clap(long, env = "FISSILE_REGISTRY", default_value = "")]
    pub(crate) registry: String,

    /// Organization segment of image names.
    #[clap(long, env = "FISSILE_ORGANIZATION", default_value = "")]
    pub(crate) organization: String,

    /// Repository prefix of image names.
    #[clap(long, env = "FISSILE_REPOSITORY", default_value = "fissile")]
    pub(crate) repository: String,

    /// Build images even when their names already exist.
    #[clap(long)]
    pub(crate) force: bool,

    /// Write tar snapshots here instead of building live images.
    #[clap(long = "output-dir", env = "FISSILE_OUTPUT_DIR")]
    pub(crate) output_dir: Option<PathBuf>,

    /// Extra suffix appended to every instance-group image tag.
    #[clap(long = "tag-extra", env = "FISSILE_TAG_EXTRA")]
    pub(crate) tag_extra: Option<String>,
}

impl BuildImages {
    pub(crate) fn run(&self) -> Result<()> {
        let set = self.releases.load()?;
        let (manifest, opinions) = self.manifest.load(&set)?;
        let groups = manifest.select_instance_groups(&self.manifest.instance_groups)?;

        // Refuse to bake images out of a composition that does not
        // validate.
        let report = rolesys::validator::validate(&manifest, &set, &opinions, None);
        if !report.is_ok() {
            for issue in &report.errors {
                eprintln!("{}", issue);
            }
            bail!("Validation failed with {} errors", report.errors.len());
        }

        let engine = ContainerEngine::from_environment()
            .context("Unable to find a container engine")?;
        let options = PlanOptions {
            registry: self.registry.clone(),
            organization: self.organization.clone(),
            repository: self.repository.clone(),
            stemcell: self.stemcell.clone(),
            cache_root: self.cache_dir.clone(),
            force: self.force,
            output_dir: self.output_dir.clone(),
            tag_extra: self.tag_extra.clone(),
        };

        let images = imagesys::plan(
            &engine,
            &set,
            &manifest,
            &groups,
            &opinions,
            &options,
            &CancelToken::new(),
        )
        .context("Image build failed")?;

        for image in &images {
            match (&image.output, image.built) {
                (Some(path), _) => info!("Wrote {} to {}", image.name, path.display()),
                (None, true) => info!("Built {}", image.name),
                (None, false) => info!("Skipped {} (already present)", image.name),
            }
        }
        Ok(())
    }
}
