/*!
Thin wrapper around a commandline container engine, limited to the handful
of operations the build pipeline needs: image existence and inspection,
building an image from a tar stream, running a disposable container with
bind mounts, and removing containers and volumes.

The engine is abstracted behind a trait so that the compilation scheduler
and the image planner can be exercised against a mock in tests. The only
shipped implementation drives the `docker` CLI; `podman` is accepted as a
drop-in since it understands the same verbs.
*/

use snafu::ResultExt;
use std::env;
use std::fmt::Debug;
use std::path::PathBuf;
use which::which;

mod cli;
mod docker;

use cli::CommandLine;
use docker::DockerCLI;

#[derive(Debug)]
pub struct ContainerEngine {
    engine_impl: Box<dyn ContainerEngineImpl>,
}

impl ContainerEngine {
    /// Resolve an engine from an explicit tool name, failing when the
    /// named binary cannot be found on `$PATH` or when the name is not
    /// one we know how to drive.
    fn from_tool_name(tool_name: &str) -> Result<Self> {
        let engine_impl: Box<dyn ContainerEngineImpl> = match tool_name {
            tool @ ("docker" | "podman") => Box::new(DockerCLI {
                cli: CommandLine {
                    path: which(tool).context(error::NotFoundSnafu { name: tool })?,
                },
            }),
            _ => return error::UnsupportedSnafu { name: tool_name }.fail(),
        };

        Ok(Self { engine_impl })
    }

    /// Probe `$PATH` for a usable engine: `docker` wins when both are
    /// installed, `podman` is the fallback.
    fn from_unix_search_path() -> Result<Self> {
        let path = which("docker")
            .or_else(|_| which("podman"))
            .context(error::NoneFoundSnafu)?;
        Ok(Self {
            engine_impl: Box::new(DockerCLI {
                cli: CommandLine { path },
            }),
        })
    }

    /// Pick the engine for this process. `FISSILE_CONTAINER_TOOL` pins
    /// the choice to `docker` or `podman` when set; without it, whatever
    /// `$PATH` offers is used.
    pub fn from_environment() -> Result<Self> {
        if let Ok(name) = env::var("FISSILE_CONTAINER_TOOL") {
            Self::from_tool_name(&name)
        } else {
            Self::from_unix_search_path()
        }
    }

    pub fn new(engine_impl: Box<dyn ContainerEngineImpl>) -> Self {
        Self { engine_impl }
    }

    /// Whether an image with the given name is present in the local index.
    pub fn has_image(&self, name: &str) -> Result<bool> {
        self.engine_impl.has_image(name)
    }

    /// Look up an image's id and size, if it is present.
    pub fn find_image(&self, name: &str) -> Result<Option<ImageInfo>> {
        self.engine_impl.find_image(name)
    }

    /// Build an image from an in-memory tar stream whose first entry is
    /// expected to be the Dockerfile.
    pub fn build_image_from_tar(&self, name: &str, tar: Vec<u8>) -> Result<()> {
        self.engine_impl.build_image_from_tar(name, tar)
    }

    /// Run a container to completion, returning its exit code and combined
    /// output. The container is not removed; callers own its lifecycle.
    pub fn run_container(&self, spec: &RunSpec) -> Result<ContainerRun> {
        self.engine_impl.run_container(spec)
    }

    /// Force-remove a container by name or id. Removing a container that
    /// is already gone is not an error.
    pub fn remove_container(&self, name_or_id: &str) -> Result<()> {
        self.engine_impl.remove_container(name_or_id)
    }

    /// Remove a named volume.
    pub fn remove_volume(&self, name: &str) -> Result<()> {
        self.engine_impl.remove_volume(name)
    }
}

pub trait ContainerEngineImpl: Debug + Send + Sync + 'static {
    fn has_image(&self, name: &str) -> Result<bool>;
    fn find_image(&self, name: &str) -> Result<Option<ImageInfo>>;
    fn build_image_from_tar(&self, name: &str, tar: Vec<u8>) -> Result<()>;
    fn run_container(&self, spec: &RunSpec) -> Result<ContainerRun>;
    fn remove_container(&self, name_or_id: &str) -> Result<()>;
    fn remove_volume(&self, name: &str) -> Result<()>;
}

/// A bind mount handed to `run_container`.
#[derive(Debug, Clone)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    pub fn read_write(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }
}

/// Everything needed to run a disposable container.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub image: String,
    /// Optional fixed name, so the container can be force-removed by a
    /// canceller that never saw its id.
    pub name: Option<String>,
    pub command: Vec<String>,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub network: Option<String>,
    /// `uid:gid` to run as, typically matching the invoking user so that
    /// files written to a read-write mount are owned by the caller.
    pub user: Option<String>,
}

/// The observable result of a finished container.
#[derive(Debug, Clone)]
pub struct ContainerRun {
    pub exit_code: i64,
    /// Combined stdout and stderr, in arrival order.
    pub logs: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub size: u64,
}

pub type Result<T> = std::result::Result<T, error::Error>;

pub mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Snafu, Debug)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to execute container tool, {message}: {source}"))]
        CommandFailed {
            message: String,
            source: std::io::Error,
        },

        #[snafu(display("Failed to parse '{program} image inspect' output: {output}", program = program.display()))]
        InspectParse { program: PathBuf, output: String },

        #[snafu(display(
            "Unable to find a supported container tool, please install docker or podman: {}",
            source
        ))]
        NoneFound { source: which::Error },

        #[snafu(display(
            "Unable to find a container tool by name '{}' in current environment",
            name
        ))]
        NotFound { name: String, source: which::Error },

        #[snafu(display("Failed to run operation with container tool: {message}\n command: {} {}", program.display(), args.join(" ")))]
        OperationFailed {
            message: String,
            program: PathBuf,
            args: Vec<String>,
        },

        #[snafu(display("Unsupported container tool '{}'", name))]
        Unsupported { name: String },
    }
}
