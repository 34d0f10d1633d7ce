use std::process::{Command, Stdio};

use log::debug;

use crate::error::ProbeError;

/// Runs a platform tool to completion and returns its stdout.
pub(crate) fn run_tool(program: &str, args: &[&str]) -> Result<Vec<u8>, ProbeError> {
    debug!("Running {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| ProbeError::Spawn {
            program: program.to_string(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(ProbeError::ToolFailed {
            program: program.to_string(),
            status: output.status.code().unwrap_or(-1),
        });
    }

    Ok(output.stdout)
}
