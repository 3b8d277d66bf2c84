use crate::error::{self, Error};
use crate::Result;
use canonical_hash::Encoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ensure;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Index of a package within a [`ReleaseSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId {
    pub release: usize,
    pub package: usize,
}

/// Index of a job within a [`ReleaseSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId {
    pub release: usize,
    pub job: usize,
}

/// One unpacked BOSH release.
///
/// The release owns its jobs and packages; everything that needs to point
/// back at the parent or sideways at a sibling does so through an index,
/// so the graph serializes by name and never by object.
#[derive(Debug)]
pub struct Release {
    pub name: String,
    pub version: String,
    pub commit_hash: String,
    pub uncommitted_changes: bool,
    /// Directory the release was loaded from.
    pub path: PathBuf,
    /// Cache directory for compressed package tarballs (dev releases).
    pub tarball_cache: PathBuf,
    pub jobs: Vec<Job>,
    pub packages: Vec<Package>,
    /// License and notice files found in top-level archives, keyed by the
    /// path they had inside their archive.
    pub license_files: BTreeMap<String, Vec<u8>>,
    /// Free-form configuration entries attached to the release, used by
    /// the release diff (`name -> description`).
    pub configs: BTreeMap<String, String>,
}

impl Release {
    pub fn find_package(&self, name: &str) -> Option<usize> {
        self.packages.iter().position(|p| p.name == name)
    }

    pub fn find_job(&self, name: &str) -> Option<usize> {
        self.jobs.iter().position(|j| j.name == name)
    }
}

/// A compiled dependency of one or more jobs; a node in the compilation
/// DAG.
#[derive(Debug)]
pub struct Package {
    pub name: String,
    pub version: String,
    /// SHA-1 of the tarball contents, verified at load time.
    pub fingerprint: String,
    /// Path to the source tarball.
    pub path: PathBuf,
    /// Resolved dependency edges. Acyclic by construction.
    pub dependencies: Vec<PackageId>,
    /// Index of the owning release within the set.
    pub release: usize,
}

/// A long-running or one-shot process, supplied with templates and a
/// property schema.
#[derive(Debug)]
pub struct Job {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Computed over template contents, properties, and required packages.
    pub fingerprint: String,
    pub templates: Vec<Template>,
    pub properties: Vec<SpecProperty>,
    /// Packages the job requires at runtime.
    pub packages: Vec<PackageId>,
    /// Index of the owning release within the set.
    pub release: usize,
}

impl Job {
    /// The job fingerprint: ordered template contents, then the sorted
    /// property list with each default, then the sorted required package
    /// names. File metadata never participates, so touching a template
    /// without changing it leaves the fingerprint alone.
    pub(crate) fn compute_fingerprint(
        templates: &[Template],
        properties: &[SpecProperty],
        package_names: &[String],
    ) -> String {
        let mut enc = Encoder::new();
        enc.seq(templates.len());
        for t in templates {
            enc.str(&t.source).str(&t.destination).str(&t.content);
        }

        let mut sorted_properties: Vec<&SpecProperty> = properties.iter().collect();
        sorted_properties.sort_by(|a, b| a.name.cmp(&b.name));
        enc.map(sorted_properties.len());
        for p in sorted_properties {
            enc.str(&p.name).value(&p.default);
        }

        let mut names: Vec<&String> = package_names.iter().collect();
        names.sort();
        enc.seq(names.len());
        for name in names {
            enc.str(name);
        }
        enc.finish()
    }
}

/// A template shipped with a job: rendered inside the container at start
/// time, from `source` (inside the job) to `destination` (inside the
/// container).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Template {
    pub source: String,
    pub destination: String,
    pub content: String,
}

/// One dotted-name property declared by a job spec, with its default.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecProperty {
    pub name: String,
    pub description: String,
    /// Default value; `Value::Null` both for explicit nils and for
    /// properties declared without a default.
    pub default: Value,
}

/// A set of releases loaded together. Dependency edges may cross release
/// boundaries, so graph traversal lives here rather than on [`Release`].
#[derive(Debug, Default)]
pub struct ReleaseSet {
    pub(crate) releases: Vec<Release>,
}

impl ReleaseSet {
    /// Assemble a set from already-built releases, running the same
    /// uniqueness and acyclicity checks as the loader.
    pub fn from_releases(releases: Vec<Release>) -> Result<Self> {
        let set = ReleaseSet { releases };
        set.check_unique_names()?;
        set.check_acyclic()?;
        Ok(set)
    }

    pub fn releases(&self) -> &[Release] {
        &self.releases
    }

    /// Mutable access, for callers that adjust loaded data in place.
    pub fn releases_mut(&mut self) -> &mut [Release] {
        &mut self.releases
    }

    pub fn release(&self, idx: usize) -> &Release {
        &self.releases[idx]
    }

    pub fn package(&self, id: PackageId) -> &Package {
        &self.releases[id.release].packages[id.package]
    }

    pub fn job(&self, id: JobId) -> &Job {
        &self.releases[id.release].jobs[id.job]
    }

    pub fn find_release(&self, name: &str) -> Option<usize> {
        self.releases.iter().position(|r| r.name == name)
    }

    pub fn find_job(&self, release_name: &str, job_name: &str) -> Option<JobId> {
        let release = self.find_release(release_name)?;
        let job = self.releases[release].find_job(job_name)?;
        Some(JobId { release, job })
    }

    /// Look up a package by name, preferring the given release.
    pub(crate) fn resolve_package(&self, home: usize, name: &str) -> Option<PackageId> {
        if let Some(package) = self.releases[home].find_package(name) {
            return Some(PackageId {
                release: home,
                package,
            });
        }
        self.releases.iter().enumerate().find_map(|(release, r)| {
            r.find_package(name).map(|package| PackageId { release, package })
        })
    }

    /// Every package reachable from `roots` through dependency edges, in
    /// an order where dependencies precede their dependents. Deterministic
    /// for a given set: roots are visited in sorted order.
    pub fn package_closure(&self, roots: &[PackageId]) -> Vec<PackageId> {
        let mut roots: Vec<PackageId> = roots.to_vec();
        roots.sort();
        roots.dedup();

        let mut order = Vec::new();
        let mut visited = std::collections::HashSet::new();
        for root in roots {
            self.visit(root, &mut visited, &mut order);
        }
        order
    }

    fn visit(
        &self,
        id: PackageId,
        visited: &mut std::collections::HashSet<PackageId>,
        order: &mut Vec<PackageId>,
    ) {
        if !visited.insert(id) {
            return;
        }
        // Load-time cycle checking makes unbounded recursion impossible.
        for dep in &self.package(id).dependencies {
            self.visit(*dep, visited, order);
        }
        order.push(id);
    }

    /// Verify that dependency traversal reaches a fixed point, i.e. the
    /// edge set is acyclic. Runs once after linking.
    pub(crate) fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        fn walk(
            set: &ReleaseSet,
            id: PackageId,
            marks: &mut std::collections::HashMap<PackageId, Mark>,
            chain: &mut Vec<String>,
        ) -> Result<()> {
            match marks.get(&id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::InProgress) => {
                    let mut cycle = chain.clone();
                    cycle.push(set.package(id).name.clone());
                    return error::DependencyCycleSnafu { chain: cycle }.fail();
                }
                None => {}
            }
            marks.insert(id, Mark::InProgress);
            chain.push(set.package(id).name.clone());
            for dep in &set.package(id).dependencies {
                walk(set, *dep, marks, chain)?;
            }
            chain.pop();
            marks.insert(id, Mark::Done);
            Ok(())
        }

        let mut marks = std::collections::HashMap::new();
        for (release, r) in self.releases.iter().enumerate() {
            for package in 0..r.packages.len() {
                walk(
                    self,
                    PackageId { release, package },
                    &mut marks,
                    &mut Vec::new(),
                )?;
            }
        }
        Ok(())
    }

    pub(crate) fn check_unique_names(&self) -> Result<()> {
        for r in &self.releases {
            let mut names = std::collections::HashSet::new();
            for p in &r.packages {
                ensure!(
                    names.insert(&p.name),
                    error::ManifestInvalidSnafu {
                        path: r.path.clone(),
                        reason: format!("duplicate package name '{}'", p.name),
                    }
                );
            }
            let mut names = std::collections::HashSet::new();
            for j in &r.jobs {
                ensure!(
                    names.insert(&j.name),
                    error::ManifestInvalidSnafu {
                        path: r.path.clone(),
                        reason: format!("duplicate job name '{}'", j.name),
                    }
                );
            }
        }
        Ok(())
    }

    /// The serializable release manifest, for round-tripping a loaded
    /// release back to `release.MF` form. Parents are emitted by name.
    pub fn manifest(&self, release: usize) -> ReleaseManifest {
        let r = &self.releases[release];
        ReleaseManifest {
            name: r.name.clone(),
            version: r.version.clone(),
            commit_hash: r.commit_hash.clone(),
            uncommitted_changes: r.uncommitted_changes,
            jobs: r
                .jobs
                .iter()
                .map(|j| JobEntry {
                    name: j.name.clone(),
                    version: j.version.clone(),
                    fingerprint: j.fingerprint.clone(),
                })
                .collect(),
            packages: r
                .packages
                .iter()
                .map(|p| PackageEntry {
                    name: p.name.clone(),
                    version: p.version.clone(),
                    sha1: p.fingerprint.clone(),
                    dependencies: p
                        .dependencies
                        .iter()
                        .map(|d| self.package(*d).name.clone())
                        .collect(),
                })
                .collect(),
        }
    }
}

/// The shape of `release.MF`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReleaseManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub commit_hash: String,
    #[serde(default)]
    pub uncommitted_changes: bool,
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
    #[serde(default)]
    pub packages: Vec<PackageEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JobEntry {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PackageEntry {
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub sha1: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Error {
    /// Whether this error reports a dependency cycle. Convenience for
    /// callers that distinguish cycle failures from parse failures.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Error::DependencyCycle { .. })
    }
}
