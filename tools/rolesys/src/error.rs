use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to read '{}': {}", path.display(), source))]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse '{}': {}", path.display(), source))]
    ManifestParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("Manifest '{}' is invalid: {}", path.display(), reason))]
    ManifestInvalid { path: PathBuf, reason: String },

    #[snafu(display(
        "Instance group '{}' references job '{}' in release '{}', which is not loaded",
        group,
        job,
        release
    ))]
    JobNotFound {
        group: String,
        release: String,
        job: String,
    },

    #[snafu(display("Failed to read env defaults '{}': {}", path.display(), source))]
    EnvDefaults {
        path: PathBuf,
        source: dotenvy::Error,
    },

    #[snafu(display("Value at '{}' cannot be encoded: {}", path, source))]
    ValueEncoding {
        path: String,
        source: canonical_hash::Error,
    },

    #[snafu(display(
        "Type mismatch at '{}': cannot descend into {} to set '{}'",
        parent,
        found,
        path
    ))]
    TypeMismatch {
        path: String,
        parent: String,
        found: String,
    },

    #[snafu(display("Failed to serialize job configuration: {}", source))]
    ConfigSerialize { source: serde_json::Error },
}
