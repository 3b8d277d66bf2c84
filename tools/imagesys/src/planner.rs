/*!
Drives the container engine to produce the final images.

Each run builds one shared packages-layer image and then one image per
selected instance group layered on top of it, in that order. Builds go
through a tar stream whose first entry is the Dockerfile; in no-runtime
mode the stream is written to disk as `<output>/<image-name>.tar` instead
of being handed to the engine.
*/

use crate::dev_version::{group_packages, instance_group_dev_version, packages_layer_version};
use crate::error;
use crate::naming::{instance_group_image_name, packages_layer_image_name, sanitized};
use crate::Result;
use compilesys::{CancelToken, CompilationCache};
use docker_cli_wrapper::ContainerEngine;
use log::{debug, info};
use releasesys::{PackageId, ReleaseSet};
use rolesys::{resolver, InstanceGroup, Opinions, RoleManifest};
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Where job configuration lands inside every instance-group image; the
/// start-time renderer reads it from there.
const CONFIG_IMAGE_DIR: &str = "/opt/fissile/config";

/// Where compiled packages land inside the packages-layer image.
const PACKAGES_IMAGE_DIR: &str = "/var/vcap/packages";

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub registry: String,
    pub organization: String,
    pub repository: String,
    /// Base OS image for the packages layer.
    pub stemcell: String,
    /// Compilation cache root holding the compiled artifacts.
    pub cache_root: PathBuf,
    /// Build even when the image name already exists.
    pub force: bool,
    /// No-runtime mode: write tar snapshots here instead of building.
    pub output_dir: Option<PathBuf>,
    /// Extra tag suffix for instance-group images.
    pub tag_extra: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageKind {
    PackagesLayer,
    InstanceGroup { group: String },
}

/// One planned image: what it is called, and whether this run actually
/// produced it or found it already present.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub name: String,
    pub kind: ImageKind,
    pub built: bool,
    /// The tar snapshot path, in no-runtime mode.
    pub output: Option<PathBuf>,
}

/// Produce the packages layer and every selected group image. The
/// packages layer is built strictly before any group image, since the
/// group Dockerfiles start `FROM` it.
pub fn plan(
    engine: &ContainerEngine,
    set: &ReleaseSet,
    manifest: &RoleManifest,
    groups: &[&InstanceGroup],
    opinions: &Opinions,
    options: &PlanOptions,
    cancel: &CancelToken,
) -> Result<Vec<BuiltImage>> {
    let cache = CompilationCache::new(&options.cache_root, &options.stemcell);
    let mut images = Vec::with_capacity(groups.len() + 1);

    let layer_version = packages_layer_version(set, groups, &options.stemcell);
    let layer_name = packages_layer_image_name(
        &options.registry,
        &options.organization,
        &options.repository,
        &layer_version,
    );
    let layer_context = || packages_layer_context(set, groups, &cache, options);
    images.push(produce(
        engine,
        options,
        cancel,
        layer_name.clone(),
        ImageKind::PackagesLayer,
        layer_context,
    )?);

    for group in groups {
        let dev_version = instance_group_dev_version(set, group, opinions, &options.stemcell);
        let image_name = instance_group_image_name(
            &options.registry,
            &options.organization,
            &options.repository,
            &group.name,
            &dev_version,
            options.tag_extra.as_deref(),
        );
        let context = || instance_group_context(set, manifest, group, opinions, &layer_name);
        images.push(produce(
            engine,
            options,
            cancel,
            image_name,
            ImageKind::InstanceGroup {
                group: group.name.clone(),
            },
            context,
        )?);
    }

    Ok(images)
}

/// Build (or skip, or snapshot) one image. The context is assembled
/// lazily so a skipped image costs nothing.
fn produce(
    engine: &ContainerEngine,
    options: &PlanOptions,
    cancel: &CancelToken,
    name: String,
    kind: ImageKind,
    context: impl FnOnce() -> Result<Vec<u8>>,
) -> Result<BuiltImage> {
    ensure!(!cancel.is_cancelled(), error::CancelledSnafu);

    if let Some(output_dir) = &options.output_dir {
        let tar = context()?;
        fs::create_dir_all(output_dir).context(error::FileWriteSnafu {
            path: output_dir.clone(),
        })?;
        let path = output_dir.join(format!("{}.tar", sanitized(&name)));
        fs::write(&path, tar).context(error::FileWriteSnafu { path: path.clone() })?;
        info!("Wrote image snapshot '{}'", path.display());
        return Ok(BuiltImage {
            name,
            kind,
            built: true,
            output: Some(path),
        });
    }

    if !options.force && engine.has_image(&name).context(error::EngineSnafu)? {
        debug!("Image '{}' already exists, skipping build", name);
        return Ok(BuiltImage {
            name,
            kind,
            built: false,
            output: None,
        });
    }

    info!("Building image '{}'", name);
    let tar = context()?;
    engine
        .build_image_from_tar(&name, tar)
        .context(error::ImageBuildSnafu { name: name.clone() })?;
    Ok(BuiltImage {
        name,
        kind,
        built: true,
        output: None,
    })
}

/// The packages-layer build context: the Dockerfile, then every compiled
/// package artifact. `ADD` unpacks each tarball into the image's package
/// tree.
fn packages_layer_context(
    set: &ReleaseSet,
    groups: &[&InstanceGroup],
    cache: &CompilationCache,
    options: &PlanOptions,
) -> Result<Vec<u8>> {
    // One entry per package name; identical names across releases share
    // an upstream and a fingerprint in practice, and the first wins
    // deterministically here.
    let mut packages: BTreeMap<String, PackageId> = BTreeMap::new();
    for group in groups {
        for id in group_packages(set, group) {
            packages.entry(set.package(id).name.clone()).or_insert(id);
        }
    }

    let mut dockerfile = format!("FROM {}\n", options.stemcell);
    for name in packages.keys() {
        dockerfile.push_str(&format!(
            "ADD packages/{name}.tgz {PACKAGES_IMAGE_DIR}/{name}/\n"
        ));
    }

    let mut builder = tar::Builder::new(Vec::new());
    append_entry(&mut builder, "Dockerfile", dockerfile.as_bytes())?;
    for (name, id) in &packages {
        let package = set.package(*id);
        let artifact = cache.artifact_path(&package.fingerprint);
        ensure!(
            artifact.is_file(),
            error::ArtifactMissingSnafu {
                name: package.name.clone(),
                path: artifact.clone(),
            }
        );
        let bytes = fs::read(&artifact).context(error::FileReadSnafu {
            path: artifact.clone(),
        })?;
        append_entry(&mut builder, &format!("packages/{}.tgz", name), &bytes)?;
    }
    builder.into_inner().context(error::TarAssemblySnafu)
}

/// The per-group build context: a Dockerfile `FROM` the packages layer,
/// plus the resolved configuration JSON for every job in the group.
fn instance_group_context(
    set: &ReleaseSet,
    manifest: &RoleManifest,
    group: &InstanceGroup,
    opinions: &Opinions,
    layer_name: &str,
) -> Result<Vec<u8>> {
    let dockerfile = format!(
        "FROM {layer_name}\nLABEL instance_group=\"{}\"\nCOPY config {CONFIG_IMAGE_DIR}/\n",
        group.name
    );

    let mut builder = tar::Builder::new(Vec::new());
    let mut configs = Vec::with_capacity(group.jobs.len());
    for reference in &group.jobs {
        let config = resolver::job_config(set, manifest, group, reference.job_id, opinions)
            .and_then(|value| resolver::canonical_json_bytes(&value))
            .context(error::ConfigResolveSnafu {
                job: reference.job_name.clone(),
            })?;
        configs.push((format!("config/{}.json", reference.job_name), config));
    }
    append_entry(&mut builder, "Dockerfile", dockerfile.as_bytes())?;
    for (path, bytes) in &configs {
        append_entry(&mut builder, path, bytes)?;
    }
    builder.into_inner().context(error::TarAssemblySnafu)
}

/// Append one file entry with normalized metadata, so the stream depends
/// only on its contents.
fn append_entry(
    builder: &mut tar::Builder<Vec<u8>>,
    path: &str,
    bytes: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    builder
        .append_data(&mut header, path, bytes)
        .context(error::TarAssemblySnafu)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support;
    use docker_cli_wrapper::{ContainerEngineImpl, ContainerRun, ImageInfo, RunSpec};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct MockEngine {
        existing: HashSet<String>,
        builds: Mutex<Vec<(String, Vec<(String, Vec<u8>)>)>>,
    }

    impl MockEngine {
        fn build_names(&self) -> Vec<String> {
            self.builds
                .lock()
                .unwrap()
                .iter()
                .map(|(name, _)| name.clone())
                .collect()
        }

        fn entries_of(&self, name: &str) -> HashMap<String, Vec<u8>> {
            self.builds
                .lock()
                .unwrap()
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, entries)| entries.iter().cloned().collect())
                .unwrap_or_default()
        }
    }

    fn parse_tar(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut archive = tar::Archive::new(bytes);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().to_string_lossy().into_owned();
                let mut content = Vec::new();
                std::io::Read::read_to_end(&mut entry, &mut content).unwrap();
                (path, content)
            })
            .collect()
    }

    #[derive(Debug)]
    struct SharedMockEngine(std::sync::Arc<MockEngine>);

    impl ContainerEngineImpl for SharedMockEngine {
        fn has_image(&self, name: &str) -> docker_cli_wrapper::Result<bool> {
            Ok(self.0.existing.contains(name))
        }

        fn find_image(&self, name: &str) -> docker_cli_wrapper::Result<Option<ImageInfo>> {
            Ok(self.0.existing.contains(name).then(|| ImageInfo {
                id: "sha256:0".to_string(),
                size: 0,
            }))
        }

        fn build_image_from_tar(
            &self,
            name: &str,
            tar: Vec<u8>,
        ) -> docker_cli_wrapper::Result<()> {
            self.0
                .builds
                .lock()
                .unwrap()
                .push((name.to_string(), parse_tar(&tar)));
            Ok(())
        }

        fn run_container(&self, _spec: &RunSpec) -> docker_cli_wrapper::Result<ContainerRun> {
            Ok(ContainerRun {
                exit_code: 0,
                logs: String::new(),
            })
        }

        fn remove_container(&self, _name_or_id: &str) -> docker_cli_wrapper::Result<()> {
            Ok(())
        }

        fn remove_volume(&self, _name: &str) -> docker_cli_wrapper::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        set: releasesys::ReleaseSet,
        manifest: RoleManifest,
        opinions: Opinions,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let set = test_support::release_set();
        let manifest = test_support::manifest(&set);
        let opinions = test_support::opinions("properties: {}", "properties: {}");

        // Pre-compiled artifacts for every package.
        let cache = CompilationCache::new(dir.path().join("cache"), "stemcell:1");
        for release in set.releases() {
            for package in &release.packages {
                let artifact = cache.artifact_path(&package.fingerprint);
                fs::create_dir_all(artifact.parent().unwrap()).unwrap();
                fs::write(&artifact, package.name.as_bytes()).unwrap();
            }
        }

        Fixture {
            dir,
            set,
            manifest,
            opinions,
        }
    }

    fn options(fixture: &Fixture) -> PlanOptions {
        PlanOptions {
            registry: "r.io".to_string(),
            organization: "acme".to_string(),
            repository: "scf".to_string(),
            stemcell: "stemcell:1".to_string(),
            cache_root: fixture.dir.path().join("cache"),
            force: false,
            output_dir: None,
            tag_extra: None,
        }
    }

    #[test]
    fn packages_layer_builds_before_group_images() {
        let fixture = fixture();
        let engine = std::sync::Arc::new(MockEngine::default());
        let groups: Vec<_> = fixture.manifest.instance_groups.iter().collect();

        let images = plan(
            &ContainerEngine::new(Box::new(SharedMockEngine(std::sync::Arc::clone(&engine)))),
            &fixture.set,
            &fixture.manifest,
            &groups,
            &fixture.opinions,
            &options(&fixture),
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(images.len(), 2);
        assert_eq!(images[0].kind, ImageKind::PackagesLayer);
        let builds = engine.build_names();
        assert_eq!(builds.len(), 2);
        assert_eq!(builds[0], images[0].name);
        assert!(builds[0].contains("scf-role-packages:"));

        // The group image layers on the packages image.
        let entries = engine.entries_of(&builds[1]);
        let dockerfile = String::from_utf8(entries["Dockerfile"].clone()).unwrap();
        assert!(dockerfile.starts_with(&format!("FROM {}\n", builds[0])));
    }

    #[test]
    fn the_dockerfile_is_the_first_tar_entry() {
        let fixture = fixture();
        let engine = std::sync::Arc::new(MockEngine::default());
        let groups: Vec<_> = fixture.manifest.instance_groups.iter().collect();

        plan(
            &ContainerEngine::new(Box::new(SharedMockEngine(std::sync::Arc::clone(&engine)))),
            &fixture.set,
            &fixture.manifest,
            &groups,
            &fixture.opinions,
            &options(&fixture),
            &CancelToken::new(),
        )
        .unwrap();

        for (_, entries) in engine.builds.lock().unwrap().iter() {
            assert_eq!(entries[0].0, "Dockerfile");
        }
    }

    #[test]
    fn group_context_carries_job_config_json() {
        let fixture = fixture();
        let engine = std::sync::Arc::new(MockEngine::default());
        let groups: Vec<_> = fixture.manifest.instance_groups.iter().collect();

        plan(
            &ContainerEngine::new(Box::new(SharedMockEngine(std::sync::Arc::clone(&engine)))),
            &fixture.set,
            &fixture.manifest,
            &groups,
            &fixture.opinions,
            &options(&fixture),
            &CancelToken::new(),
        )
        .unwrap();

        let group_image = engine.build_names().remove(1);
        let entries = engine.entries_of(&group_image);
        let config = String::from_utf8(entries["config/web.json"].clone()).unwrap();
        assert!(config.contains(r#""properties""#));
        assert!(config.contains(r#""port":80"#));
    }

    #[test]
    fn existing_images_are_skipped_unless_forced() {
        let fixture = fixture();
        let groups: Vec<_> = fixture.manifest.instance_groups.iter().collect();
        let options_plain = options(&fixture);

        // First run to learn the names.
        let probe = std::sync::Arc::new(MockEngine::default());
        let images = plan(
            &ContainerEngine::new(Box::new(SharedMockEngine(std::sync::Arc::clone(&probe)))),
            &fixture.set,
            &fixture.manifest,
            &groups,
            &fixture.opinions,
            &options_plain,
            &CancelToken::new(),
        )
        .unwrap();

        let engine = std::sync::Arc::new(MockEngine {
            existing: images.iter().map(|i| i.name.clone()).collect(),
            ..Default::default()
        });
        let images = plan(
            &ContainerEngine::new(Box::new(SharedMockEngine(std::sync::Arc::clone(&engine)))),
            &fixture.set,
            &fixture.manifest,
            &groups,
            &fixture.opinions,
            &options_plain,
            &CancelToken::new(),
        )
        .unwrap();
        assert!(images.iter().all(|i| !i.built));
        assert!(engine.build_names().is_empty());

        let forced = PlanOptions {
            force: true,
            ..options_plain
        };
        let images = plan(
            &ContainerEngine::new(Box::new(SharedMockEngine(std::sync::Arc::clone(&engine)))),
            &fixture.set,
            &fixture.manifest,
            &groups,
            &fixture.opinions,
            &forced,
            &CancelToken::new(),
        )
        .unwrap();
        assert!(images.iter().all(|i| i.built));
        assert_eq!(engine.build_names().len(), 2);
    }

    #[test]
    fn no_runtime_mode_writes_tar_snapshots() {
        let fixture = fixture();
        let engine = std::sync::Arc::new(MockEngine::default());
        let groups: Vec<_> = fixture.manifest.instance_groups.iter().collect();
        let output_dir = fixture.dir.path().join("out");
        let with_output = PlanOptions {
            output_dir: Some(output_dir.clone()),
            ..options(&fixture)
        };

        let images = plan(
            &ContainerEngine::new(Box::new(SharedMockEngine(std::sync::Arc::clone(&engine)))),
            &fixture.set,
            &fixture.manifest,
            &groups,
            &fixture.opinions,
            &with_output,
            &CancelToken::new(),
        )
        .unwrap();

        assert!(engine.build_names().is_empty(), "no engine builds");
        for image in &images {
            let path = image.output.as_ref().unwrap();
            assert!(path.is_file(), "{}", path.display());
            let entries = parse_tar(&fs::read(path).unwrap());
            assert_eq!(entries[0].0, "Dockerfile");
        }
    }

    #[test]
    fn cancelled_plan_builds_nothing() {
        let fixture = fixture();
        let engine = std::sync::Arc::new(MockEngine::default());
        let groups: Vec<_> = fixture.manifest.instance_groups.iter().collect();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = plan(
            &ContainerEngine::new(Box::new(SharedMockEngine(std::sync::Arc::clone(&engine)))),
            &fixture.set,
            &fixture.manifest,
            &groups,
            &fixture.opinions,
            &options(&fixture),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, crate::Error::Cancelled), "{err}");
        assert!(engine.build_names().is_empty());
    }
}
