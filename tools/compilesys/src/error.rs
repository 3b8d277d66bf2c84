use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to create directory '{}': {}", path.display(), source))]
    DirectoryCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to create scratch directory under '{}': {}", path.display(), source))]
    ScratchCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to write '{}': {}", path.display(), source))]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to rename '{}' to '{}': {}", old_path.display(), new_path.display(), source))]
    FileRename {
        old_path: PathBuf,
        new_path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to remove '{}': {}", path.display(), source))]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to walk compilation cache '{}': {}", path.display(), source))]
    CacheWalk {
        path: PathBuf,
        source: walkdir::Error,
    },

    #[snafu(display("Container engine failure: {}", source))]
    Engine {
        source: docker_cli_wrapper::error::Error,
    },

    #[snafu(display("Worker pool panicked"))]
    WorkerPanic,
}
