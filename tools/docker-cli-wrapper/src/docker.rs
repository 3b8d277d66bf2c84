use crate::cli::CommandLine;
use crate::{error, ContainerEngineImpl, ContainerRun, ImageInfo, Mount, Result, RunSpec};
use log::{debug, trace};
use snafu::ensure;

#[derive(Debug)]
pub(crate) struct DockerCLI {
    pub(crate) cli: CommandLine,
}

impl ContainerEngineImpl for DockerCLI {
    fn has_image(&self, name: &str) -> Result<bool> {
        let output = self.cli.run_unchecked(
            &["image", "inspect", "--format", "{{.Id}}", name],
            None,
            format!("failed to inspect image '{name}'"),
        )?;
        Ok(output.status.success())
    }

    fn find_image(&self, name: &str) -> Result<Option<ImageInfo>> {
        let output = self.cli.run_unchecked(
            &["image", "inspect", "--format", "{{.Id}} {{.Size}}", name],
            None,
            format!("failed to inspect image '{name}'"),
        )?;
        if !output.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut fields = stdout.split_whitespace();
        let (id, size) = (fields.next(), fields.next().and_then(|s| s.parse().ok()));
        match (id, size) {
            (Some(id), Some(size)) => Ok(Some(ImageInfo {
                id: id.to_string(),
                size,
            })),
            _ => error::InspectParseSnafu {
                program: self.cli.path.clone(),
                output: stdout.to_string(),
            }
            .fail(),
        }
    }

    fn build_image_from_tar(&self, name: &str, tar: Vec<u8>) -> Result<()> {
        debug!("Building image '{}' from tar stream", name);
        let args = ["build", "--tag", name, "-"];
        let output = self.cli.run_unchecked(
            &args,
            Some(tar),
            format!("failed to build image '{name}'"),
        )?;
        ensure!(
            output.status.success(),
            error::OperationFailedSnafu {
                message: String::from_utf8_lossy(&output.stdout),
                program: self.cli.path.clone(),
                args: args.iter().map(|x| x.to_string()).collect::<Vec<_>>()
            }
        );
        Ok(())
    }

    fn run_container(&self, spec: &RunSpec) -> Result<ContainerRun> {
        let mut args: Vec<String> = vec!["run".into()];
        if let Some(name) = &spec.name {
            args.push("--name".into());
            args.push(name.clone());
        }
        if let Some(network) = &spec.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        if let Some(user) = &spec.user {
            args.push("--user".into());
            args.push(user.clone());
        }
        for Mount {
            host,
            container,
            read_only,
        } in &spec.mounts
        {
            args.push("--volume".into());
            let suffix = if *read_only { ":ro" } else { "" };
            args.push(format!("{}:{}{}", host.display(), container, suffix));
        }
        for (key, value) in &spec.env {
            args.push("--env".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        trace!("docker {}", args.join(" "));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.cli.run_unchecked(
            &arg_refs,
            None,
            format!("failed to run container from '{}'", spec.image),
        )?;

        Ok(ContainerRun {
            exit_code: output.status.code().unwrap_or(-1) as i64,
            logs: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }

    fn remove_container(&self, name_or_id: &str) -> Result<()> {
        // `rm --force` on a missing container is not an error we care about.
        let _ = self.cli.run_unchecked(
            &["rm", "--force", "--volumes", name_or_id],
            None,
            format!("failed to remove container '{name_or_id}'"),
        )?;
        Ok(())
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        self.cli.output(
            &["volume", "rm", "--force", name],
            format!("failed to remove volume '{name}'"),
        )?;
        Ok(())
    }
}
