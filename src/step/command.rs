//! Shell command execution for `run` steps and install/build commands

use crate::error::{RiggerError, RiggerResult};
use crate::step::CellContext;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::debug;

/// Max number of output lines kept in command failure messages.
const ERROR_TAIL_LINES: usize = 30;

/// Executes an opaque command on behalf of a cell
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &str,
        ctx: &CellContext,
        env: &BTreeMap<String, String>,
    ) -> RiggerResult<()>;
}

/// Runs commands through the platform shell (`sh -c` / `cmd /C`)
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        command: &str,
        ctx: &CellContext,
        env: &BTreeMap<String, String>,
    ) -> RiggerResult<()> {
        debug!("[{}] $ {}", ctx.cell.id, command);

        let mut child = shell(command)
            .current_dir(&ctx.cell_dir)
            .envs(&ctx.env)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out step drops this future; the process must not outlive it.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RiggerError::command_failed(command, e))?;

        let cell = ctx.cell.id.clone();
        let output = stream_child_output(&mut child, &|line: &str| debug!("[{}] {}", cell, line)).await;

        let status = child
            .wait()
            .await
            .map_err(|e| RiggerError::command_failed(command, e))?;

        if status.success() {
            return Ok(());
        }

        Err(RiggerError::CommandExit {
            command: command.to_string(),
            code: status.code(),
            output: error_tail(&output),
        })
    }
}

fn shell(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Last `ERROR_TAIL_LINES` lines of combined output
fn error_tail(lines: &[String]) -> String {
    let start = lines.len().saturating_sub(ERROR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Stream stdout+stderr from a child process, calling `on_line` for each line.
///
/// Returns all collected output lines for error reporting.
async fn stream_child_output(
    child: &mut Child,
    on_line: &(dyn Fn(&str) + Send + Sync),
) -> Vec<String> {
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Vec::new();
    };

    let mut stdout_reader = BufReader::new(stdout).lines();
    let mut stderr_reader = BufReader::new(stderr).lines();

    let mut all_output = Vec::new();
    let mut stdout_done = false;
    let mut stderr_done = false;

    while !stdout_done || !stderr_done {
        tokio::select! {
            line = stdout_reader.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(line)) => {
                        on_line(&line);
                        all_output.push(line);
                    }
                    _ => stdout_done = true,
                }
            }
            line = stderr_reader.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => {
                        on_line(&line);
                        all_output.push(line);
                    }
                    _ => stderr_done = true,
                }
            }
        }
    }

    all_output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{Binding, Cell};
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> CellContext {
        let cell = Cell::new(
            0,
            Binding::new(vec![("os".to_string(), "linux".to_string())]),
        );
        let cell_dir = dir.path().join("cell");
        std::fs::create_dir_all(&cell_dir).unwrap();
        CellContext::new(cell, dir.path().to_path_buf(), cell_dir, &BTreeMap::new())
    }

    #[test]
    fn error_tail_keeps_last_lines() {
        let lines: Vec<String> = (0..100).map(|i| format!("line {i}")).collect();
        let tail = error_tail(&lines);
        assert!(tail.starts_with("line 70"));
        assert!(tail.ends_with("line 99"));
        assert_eq!(error_tail(&lines[..2]), "line 0\nline 1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_with_cell_env_in_cell_dir() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let extra = BTreeMap::from([("GREETING".to_string(), "hi".to_string())]);

        ShellRunner
            .run("echo \"$RIGGER_OS $GREETING\" > out.txt", &ctx, &extra)
            .await
            .unwrap();

        let written = std::fs::read_to_string(ctx.cell_dir.join("out.txt")).unwrap();
        assert_eq!(written.trim(), "linux hi");
        assert!(!dir.path().join("out.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_output_tail() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let err = ShellRunner
            .run("echo compiling; echo broken >&2; exit 3", &ctx, &BTreeMap::new())
            .await
            .unwrap_err();

        match err {
            RiggerError::CommandExit { code, output, .. } => {
                assert_eq!(code, Some(3));
                assert!(output.contains("compiling"));
                assert!(output.contains("broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
