use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Release not found at '{}'", path.display()))]
    ReleaseMissing { path: PathBuf },

    #[snafu(display(
        "'{}' is neither a final release (release.MF) nor a dev release (dev_releases/)",
        path.display()
    ))]
    ReleaseLayoutUnknown { path: PathBuf },

    #[snafu(display("Failed to read '{}': {}", path.display(), source))]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse manifest '{}': {}", path.display(), source))]
    ManifestParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("Manifest '{}' is invalid: {}", path.display(), reason))]
    ManifestInvalid { path: PathBuf, reason: String },

    #[snafu(display(
        "Package '{}' tarball digest mismatch: recorded {}, computed {}",
        name,
        recorded,
        computed
    ))]
    Integrity {
        name: String,
        recorded: String,
        computed: String,
    },

    #[snafu(display("Package '{}' has no tarball at '{}'", name, path.display()))]
    TarballMissing { name: String, path: PathBuf },

    #[snafu(display("Package dependency cycle: {}", chain.join(" -> ")))]
    DependencyCycle { chain: Vec<String> },

    #[snafu(display(
        "Package '{}' depends on '{}', which is not part of any loaded release",
        package,
        dependency
    ))]
    DependencyMissing { package: String, dependency: String },

    #[snafu(display("Job '{}' requires package '{}', which is not in release '{}'", job, package, release))]
    JobPackageMissing {
        job: String,
        package: String,
        release: String,
    },

    #[snafu(display("Failed to read archive '{}': {}", path.display(), source))]
    ArchiveRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Property default for '{}' cannot be encoded: {}", name, source))]
    PropertyEncoding {
        name: String,
        source: canonical_hash::Error,
    },
}
