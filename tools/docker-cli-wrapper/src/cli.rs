use duct::cmd;
use snafu::{ensure, ResultExt};
use std::path::PathBuf;
use std::process::Output;

use crate::{error, Result};

#[derive(Debug)]
pub(crate) struct CommandLine {
    pub(crate) path: PathBuf,
}

impl CommandLine {
    /// Run the tool and fail if it exits non-zero.
    pub(crate) fn output(&self, args: &[&str], error_msg: String) -> Result<Vec<u8>> {
        let output = self.run_unchecked(args, None, error_msg.clone())?;
        ensure!(
            output.status.success(),
            error::OperationFailedSnafu {
                message: String::from_utf8_lossy(&output.stdout),
                program: self.path.clone(),
                args: args.iter().map(|x| x.to_string()).collect::<Vec<_>>()
            }
        );
        Ok(output.stdout)
    }

    /// Run the tool, capturing combined stdout/stderr without treating a
    /// non-zero exit as a failure. Container exit codes are data here.
    pub(crate) fn run_unchecked(
        &self,
        args: &[&str],
        stdin: Option<Vec<u8>>,
        error_msg: String,
    ) -> Result<Output> {
        let mut expression = cmd(&self.path, args);
        if let Some(bytes) = stdin {
            expression = expression.stdin_bytes(bytes);
        }
        expression
            .stderr_to_stdout()
            .stdout_capture()
            .unchecked()
            .run()
            .context(error::CommandFailedSnafu { message: error_msg })
    }
}
