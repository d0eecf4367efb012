use crate::context::CallContext;
use crate::error::{Result, VoiceError};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::debug;

/// Runs an external tool to completion under `ctx`.
///
/// The child is killed if the context is cancelled first. Spawn failures and
/// non-zero exits are mapped through `fail`, with stderr folded into the message.
pub async fn run_tool<F>(ctx: &CallContext, mut command: Command, fail: F) -> Result<Output>
where
    F: Fn(String) -> VoiceError,
{
    let program = command.as_std().get_program().to_string_lossy().into_owned();
    debug!(program = %program, "running tool");

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|e| fail(format!("{program}: {e}")))?;
    let output = ctx
        .run(async { Ok(child.wait_with_output().await?) })
        .await?;

    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(fail(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}
