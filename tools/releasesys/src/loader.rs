/*!
On-disk release parsing.

Handles the two layouts a release directory can have: a "final" release
(`release.MF` at the root) and a "dev" release (an index under
`dev_releases/<name>/` naming one manifest per built version). Both funnel
into the same manifest structures once the manifest path is known.
*/

use crate::error;
use crate::release::{
    Job, JobId, Package, PackageId, Release, ReleaseManifest, ReleaseSet, SpecProperty, Template,
};
use crate::Result;
use canonical_hash::to_canonical_value;
use flate2::read::GzDecoder;
use log::{debug, info};
use serde::Deserialize;
use sha1::{Digest, Sha1};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

const FINAL_MANIFEST: &str = "release.MF";
const DEV_RELEASES_DIR: &str = "dev_releases";

/// The two on-disk layouts a release directory can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    Final,
    Dev,
}

/// Instructions for loading one release into a [`ReleaseSet`].
#[derive(Debug, Clone)]
pub struct LoadSpec {
    /// Release directory.
    pub path: PathBuf,
    /// Override for the release name; needed when `dev_releases/` holds
    /// more than one index.
    pub name: Option<String>,
    /// Override for the version; defaults to the newest built version.
    pub version: Option<String>,
    /// Cache directory for compressed package tarballs.
    pub cache_dir: PathBuf,
}

impl LoadSpec {
    pub fn new(path: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            name: None,
            version: None,
            cache_dir: cache_dir.into(),
        }
    }
}

impl ReleaseSet {
    /// Load one or more releases and link them into a single graph.
    ///
    /// All packages and jobs are present and non-nil on return, every
    /// dependency edge resolves to a loaded package, and the edge set is
    /// acyclic.
    pub fn load(specs: &[LoadSpec]) -> Result<ReleaseSet> {
        let mut set = ReleaseSet::default();
        let mut package_deps: Vec<Vec<Vec<String>>> = Vec::new();
        let mut job_packages: Vec<Vec<Vec<String>>> = Vec::new();

        for spec in specs {
            let (release, deps, jobs) = load_one(spec, set.releases.len())?;
            set.releases.push(release);
            package_deps.push(deps);
            job_packages.push(jobs);
        }

        set.check_unique_names()?;
        link_packages(&mut set, &package_deps)?;
        link_jobs(&mut set, &job_packages)?;
        set.check_acyclic()?;

        for r in set.releases() {
            info!(
                "Loaded release {}/{} ({} jobs, {} packages)",
                r.name,
                r.version,
                r.jobs.len(),
                r.packages.len()
            );
        }
        Ok(set)
    }
}

/// Resolve declared package dependency names into edges. A package may
/// depend on a package from a sibling release in the set; its own release
/// wins when names collide.
fn link_packages(set: &mut ReleaseSet, package_deps: &[Vec<Vec<String>>]) -> Result<()> {
    let mut resolved: Vec<(PackageId, Vec<PackageId>)> = Vec::new();
    for (release, deps_per_package) in package_deps.iter().enumerate() {
        for (package, dep_names) in deps_per_package.iter().enumerate() {
            let id = PackageId { release, package };
            let mut edges = Vec::with_capacity(dep_names.len());
            for name in dep_names {
                let dep = set.resolve_package(release, name).with_context(|| {
                    error::DependencyMissingSnafu {
                        package: set.package(id).name.clone(),
                        dependency: name.clone(),
                    }
                })?;
                edges.push(dep);
            }
            resolved.push((id, edges));
        }
    }
    for (id, edges) in resolved {
        set.releases[id.release].packages[id.package].dependencies = edges;
    }
    Ok(())
}

/// Resolve each job's required package names within its own release.
fn link_jobs(set: &mut ReleaseSet, job_packages: &[Vec<Vec<String>>]) -> Result<()> {
    let mut resolved: Vec<(JobId, Vec<PackageId>)> = Vec::new();
    for (release, packages_per_job) in job_packages.iter().enumerate() {
        for (job, package_names) in packages_per_job.iter().enumerate() {
            let id = JobId { release, job };
            let mut edges = Vec::with_capacity(package_names.len());
            for name in package_names {
                let package =
                    set.releases[release]
                        .find_package(name)
                        .with_context(|| error::JobPackageMissingSnafu {
                            job: set.job(id).name.clone(),
                            package: name.clone(),
                            release: set.releases[release].name.clone(),
                        })?;
                edges.push(PackageId { release, package });
            }
            resolved.push((id, edges));
        }
    }
    for (id, edges) in resolved {
        set.releases[id.release].jobs[id.job].packages = edges;
    }
    Ok(())
}

/// Load a single release directory. Returns the release plus the declared
/// dependency names, which are linked once every release is in the set.
#[allow(clippy::type_complexity)]
fn load_one(
    spec: &LoadSpec,
    release_index: usize,
) -> Result<(Release, Vec<Vec<String>>, Vec<Vec<String>>)> {
    ensure!(
        spec.path.is_dir(),
        error::ReleaseMissingSnafu {
            path: spec.path.clone()
        }
    );

    let kind = detect_kind(&spec.path)?;
    let manifest_path = match kind {
        ReleaseKind::Final => spec.path.join(FINAL_MANIFEST),
        ReleaseKind::Dev => dev_manifest_path(spec)?,
    };
    debug!(
        "Loading {:?} release manifest '{}'",
        kind,
        manifest_path.display()
    );

    let manifest_text = fs::read_to_string(&manifest_path).context(error::FileReadSnafu {
        path: manifest_path.clone(),
    })?;
    let manifest: ReleaseManifest =
        serde_yaml::from_str(&manifest_text).context(error::ManifestParseSnafu {
            path: manifest_path.clone(),
        })?;

    let mut packages = Vec::with_capacity(manifest.packages.len());
    let mut package_deps = Vec::with_capacity(manifest.packages.len());
    for entry in &manifest.packages {
        let tarball = locate_tarball(spec, kind, &entry.name, &entry.sha1)?;
        let computed = file_sha1(&tarball)?;
        ensure!(
            computed == entry.sha1,
            error::IntegritySnafu {
                name: entry.name.clone(),
                recorded: entry.sha1.clone(),
                computed,
            }
        );
        packages.push(Package {
            name: entry.name.clone(),
            version: entry.version.clone(),
            fingerprint: entry.sha1.clone(),
            path: tarball,
            dependencies: Vec::new(),
            release: release_index,
        });
        package_deps.push(entry.dependencies.clone());
    }

    let mut jobs = Vec::with_capacity(manifest.jobs.len());
    let mut job_packages = Vec::with_capacity(manifest.jobs.len());
    let mut configs = BTreeMap::new();
    for entry in &manifest.jobs {
        let (job, packages) = load_job(spec, release_index, &entry.name, &entry.version)?;
        for p in &job.properties {
            if !p.description.is_empty() {
                configs
                    .entry(p.name.clone())
                    .or_insert_with(|| p.description.clone());
            }
        }
        jobs.push(job);
        job_packages.push(packages);
    }

    let release = Release {
        name: spec.name.clone().unwrap_or(manifest.name),
        version: spec.version.clone().unwrap_or(manifest.version),
        commit_hash: manifest.commit_hash,
        uncommitted_changes: manifest.uncommitted_changes,
        path: spec.path.clone(),
        tarball_cache: spec.cache_dir.clone(),
        jobs,
        packages,
        license_files: load_license_files(&spec.path)?,
        configs,
    };
    Ok((release, package_deps, job_packages))
}

fn detect_kind(path: &Path) -> Result<ReleaseKind> {
    let has_final = path.join(FINAL_MANIFEST).is_file()
        && path.join("jobs").is_dir()
        && path.join("packages").is_dir();
    let has_dev = path.join(DEV_RELEASES_DIR).is_dir();
    if has_dev {
        Ok(ReleaseKind::Dev)
    } else if has_final {
        Ok(ReleaseKind::Final)
    } else {
        error::ReleaseLayoutUnknownSnafu {
            path: path.to_path_buf(),
        }
        .fail()
    }
}

/// The shape of `dev_releases/<name>/index.yml`.
#[derive(Debug, Deserialize)]
struct DevIndex {
    #[serde(default)]
    builds: BTreeMap<String, DevBuild>,
}

#[derive(Debug, Deserialize)]
struct DevBuild {
    version: String,
}

fn dev_manifest_path(spec: &LoadSpec) -> Result<PathBuf> {
    let dev_dir = spec.path.join(DEV_RELEASES_DIR);
    let name = match &spec.name {
        Some(name) => name.clone(),
        None => sole_subdirectory(&dev_dir)?,
    };
    let index_path = dev_dir.join(&name).join("index.yml");
    let index_text = fs::read_to_string(&index_path).context(error::FileReadSnafu {
        path: index_path.clone(),
    })?;
    let index: DevIndex = serde_yaml::from_str(&index_text).context(error::ManifestParseSnafu {
        path: index_path.clone(),
    })?;

    let version = match &spec.version {
        Some(version) => version.clone(),
        None => index
            .builds
            .values()
            .map(|b| b.version.clone())
            .max_by(|a, b| compare_dev_versions(a, b))
            .context(error::ManifestInvalidSnafu {
                path: index_path.clone(),
                reason: "index lists no builds".to_string(),
            })?,
    };
    Ok(dev_dir.join(&name).join(format!("{}-{}.yml", name, version)))
}

fn sole_subdirectory(dir: &Path) -> Result<String> {
    let mut names = Vec::new();
    let entries = fs::read_dir(dir).context(error::FileReadSnafu {
        path: dir.to_path_buf(),
    })?;
    for entry in entries {
        let entry = entry.context(error::FileReadSnafu {
            path: dir.to_path_buf(),
        })?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    ensure!(
        names.len() == 1,
        error::ManifestInvalidSnafu {
            path: dir.to_path_buf(),
            reason: format!(
                "expected exactly one dev release index, found {}; pass a release name",
                names.len()
            ),
        }
    );
    Ok(names.remove(0))
}

/// Order dev versions like `0+dev.9` and `0+dev.10` by comparing digit
/// runs numerically and everything else lexicographically.
pub(crate) fn compare_dev_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let chunks = |s: &str| {
        let mut out: Vec<(bool, String)> = Vec::new();
        for c in s.chars() {
            let digit = c.is_ascii_digit();
            match out.last_mut() {
                Some((d, chunk)) if *d == digit => chunk.push(c),
                _ => out.push((digit, c.to_string())),
            }
        }
        out
    };
    let (a_chunks, b_chunks) = (chunks(a), chunks(b));
    for (x, y) in a_chunks.iter().zip(b_chunks.iter()) {
        let ord = match (x.0, y.0) {
            (true, true) => {
                let (xn, yn) = (x.1.parse::<u64>(), y.1.parse::<u64>());
                match (xn, yn) {
                    (Ok(xn), Ok(yn)) => xn.cmp(&yn),
                    _ => x.1.cmp(&y.1),
                }
            }
            _ => x.1.cmp(&y.1),
        };
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    a_chunks.len().cmp(&b_chunks.len())
}

/// Final releases keep tarballs under `packages/`; dev releases keep them
/// in the shared cache directory keyed by digest, with `packages/` as the
/// fallback for releases assembled by hand.
fn locate_tarball(spec: &LoadSpec, kind: ReleaseKind, name: &str, sha1: &str) -> Result<PathBuf> {
    let local = spec.path.join("packages").join(format!("{}.tgz", name));
    let candidate = match kind {
        ReleaseKind::Final => local,
        ReleaseKind::Dev => {
            let cached = spec.cache_dir.join(sha1);
            if cached.is_file() {
                cached
            } else {
                local
            }
        }
    };
    ensure!(
        candidate.is_file(),
        error::TarballMissingSnafu {
            name: name.to_string(),
            path: candidate,
        }
    );
    Ok(candidate)
}

fn file_sha1(path: &Path) -> Result<String> {
    let mut f = File::open(path).context(error::FileReadSnafu {
        path: path.to_path_buf(),
    })?;
    let mut hasher = Sha1::new();
    io::copy(&mut f, &mut hasher).context(error::FileReadSnafu {
        path: path.to_path_buf(),
    })?;
    Ok(hex::encode(hasher.finalize()))
}

/// The shape of `jobs/<name>/job.MF`.
#[derive(Debug, Deserialize)]
struct JobSpec {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    templates: BTreeMap<String, String>,
    #[serde(default)]
    packages: Vec<String>,
    #[serde(default)]
    properties: BTreeMap<String, Option<PropertySpec>>,
}

#[derive(Debug, Default, Deserialize)]
struct PropertySpec {
    #[serde(default)]
    description: String,
    #[serde(default)]
    default: Option<serde_yaml::Value>,
}

fn load_job(
    spec: &LoadSpec,
    release_index: usize,
    name: &str,
    version: &str,
) -> Result<(Job, Vec<String>)> {
    let job_dir = spec.path.join("jobs").join(name);
    let spec_path = job_dir.join("job.MF");
    let spec_text = fs::read_to_string(&spec_path).context(error::FileReadSnafu {
        path: spec_path.clone(),
    })?;
    let job_spec: JobSpec = serde_yaml::from_str(&spec_text).context(error::ManifestParseSnafu {
        path: spec_path.clone(),
    })?;
    ensure!(
        job_spec.name == name,
        error::ManifestInvalidSnafu {
            path: spec_path.clone(),
            reason: format!("spec names job '{}', directory is '{}'", job_spec.name, name),
        }
    );

    let mut templates = Vec::with_capacity(job_spec.templates.len());
    for (source, destination) in &job_spec.templates {
        let template_path = job_dir.join("templates").join(source);
        let content = fs::read_to_string(&template_path).context(error::FileReadSnafu {
            path: template_path.clone(),
        })?;
        templates.push(Template {
            source: source.clone(),
            destination: destination.clone(),
            content,
        });
    }

    let mut properties = Vec::with_capacity(job_spec.properties.len());
    for (property_name, property) in &job_spec.properties {
        let property = property.as_ref();
        let default = match property.and_then(|p| p.default.as_ref()) {
            Some(value) => to_canonical_value(value).context(error::PropertyEncodingSnafu {
                name: property_name.clone(),
            })?,
            None => serde_json::Value::Null,
        };
        properties.push(SpecProperty {
            name: property_name.clone(),
            description: property.map(|p| p.description.clone()).unwrap_or_default(),
            default,
        });
    }

    let fingerprint = Job::compute_fingerprint(&templates, &properties, &job_spec.packages);
    let version = if version.is_empty() {
        fingerprint.clone()
    } else {
        version.to_string()
    };

    Ok((
        Job {
            name: name.to_string(),
            version,
            description: job_spec.description,
            fingerprint,
            templates,
            properties,
            packages: Vec::new(),
            release: release_index,
        },
        job_spec.packages,
    ))
}

const LICENSE_PREFIXES: [&str; 2] = ["LICENSE", "NOTICE"];

/// Pull license and notice files out of any top-level tarball, e.g. the
/// `license.tgz` shipped with final releases.
fn load_license_files(release_path: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let entries = fs::read_dir(release_path).context(error::FileReadSnafu {
        path: release_path.to_path_buf(),
    })?;
    for entry in entries {
        let entry = entry.context(error::FileReadSnafu {
            path: release_path.to_path_buf(),
        })?;
        let path = entry.path();
        if !path.is_file() || path.extension().map_or(true, |e| e != "tgz") {
            continue;
        }
        let f = File::open(&path).context(error::ArchiveReadSnafu { path: path.clone() })?;
        let mut archive = tar::Archive::new(GzDecoder::new(f));
        let archive_entries = archive
            .entries()
            .context(error::ArchiveReadSnafu { path: path.clone() })?;
        for archive_entry in archive_entries {
            let mut archive_entry =
                archive_entry.context(error::ArchiveReadSnafu { path: path.clone() })?;
            let entry_path = archive_entry
                .path()
                .context(error::ArchiveReadSnafu { path: path.clone() })?
                .into_owned();
            let matches = entry_path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| {
                    let upper = n.to_uppercase();
                    LICENSE_PREFIXES.iter().any(|p| upper.starts_with(p))
                })
                .unwrap_or(false);
            if !matches {
                continue;
            }
            let mut content = Vec::new();
            io::Read::read_to_end(&mut archive_entry, &mut content)
                .context(error::ArchiveReadSnafu { path: path.clone() })?;
            files.insert(entry_path.to_string_lossy().into_owned(), content);
        }
    }
    Ok(files)
}
