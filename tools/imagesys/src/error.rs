use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display(
        "Package '{}' has no compiled artifact at '{}'; run the compile step first",
        name,
        path.display()
    ))]
    ArtifactMissing { name: String, path: PathBuf },

    #[snafu(display("Failed to read '{}': {}", path.display(), source))]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to write '{}': {}", path.display(), source))]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to assemble build context: {}", source))]
    TarAssembly { source: std::io::Error },

    #[snafu(display("Failed to build image '{}': {}", name, source))]
    ImageBuild {
        name: String,
        source: docker_cli_wrapper::error::Error,
    },

    #[snafu(display("Container engine failure: {}", source))]
    Engine {
        source: docker_cli_wrapper::error::Error,
    },

    #[snafu(display("Failed to resolve configuration for job '{}': {}", job, source))]
    ConfigResolve { job: String, source: rolesys::Error },

    #[snafu(display("Image build cancelled"))]
    Cancelled,
}
