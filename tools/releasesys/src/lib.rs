/*!
BOSH release loading.

A BOSH software release is a self-contained directory describing jobs
(processes to run), packages (their compiled dependencies, forming a
directed acyclic graph), and default configuration properties. This crate
parses that on-disk layout into a fully linked in-memory graph: a
[`ReleaseSet`] owning one or more [`Release`]s, each owning its [`Job`]s
and [`Package`]s, with all cross-references expressed as typed indices.

Package tarball digests are verified against the recorded fingerprints at
load time, job fingerprints are computed from their canonical inputs, and
the package dependency graph is checked for cycles before the set is
handed to callers.
*/

pub mod diff;
mod error;
/// Builders for on-disk release fixtures, test builds only.
#[cfg(test)]
pub(crate) mod fixtures;
mod loader;
mod release;

pub use error::Error;
pub use loader::{LoadSpec, ReleaseKind};
pub use release::{
    Job, JobEntry, JobId, Package, PackageEntry, PackageId, Release, ReleaseManifest, ReleaseSet,
    SpecProperty, Template,
};

pub type Result<T> = std::result::Result<T, error::Error>;
