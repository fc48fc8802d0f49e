use crate::prelude::*;
use crate::{fatal, Result};
use std::process::Stdio;

/// Runs the program to completion and returns its stdout. Non-zero exit
/// status is reported as an error.
pub(crate) async fn run(program: &str, args: &[&str]) -> Result<Vec<u8>> {
    let display_args = shlex::try_join(args.iter().copied()).fatal_ctx(|| {
        format!("Couldn't run program that contains a nul byte: {program:?} {args:?}")
    })?;

    let display_cmd = format!("{program} {display_args}");
    debug!(
        cmd = %display_cmd,
        "Running program"
    );

    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .fatal_ctx(|| format!("Invocation failed. Command:\n`{display_cmd}`"))?;

    let status = output.status;

    if !status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(fatal!(
            "{program} invocation failed with status {status}. Command:\n{display_cmd}\n\
            Stderr:\n{stderr}"
        ));
    }

    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    #[cfg(unix)]
    async fn captures_stdout_and_status() {
        let stdout = run("sh", &["-c", "printf hello"]).await.unwrap();
        assert_eq!(stdout, b"hello");

        let err = run("sh", &["-c", "echo oops >&2; exit 3"]).await.unwrap_err();
        assert!(err.to_string().contains("oops"), "{err}");
    }
}
