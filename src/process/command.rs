// src/process/command.rs

//! Plain (non-daemon) command execution with output capture.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use crate::errors::ProcessError;
use crate::process::{CommandResult, ProcessRunner, SpawnOptions, StdioMode, TaskKey};
use crate::project::targets::StdioSelector;

/// One line of child output, tagged with its stream.
#[derive(Debug, Clone)]
pub(crate) struct OutputLine {
    pub source: StdioSelector,
    pub text: String,
}

/// Build the platform shell command for a task invocation.
///
/// Environment: parent env, then `FORCE_COLOR=2`, then caller overrides.
pub(crate) fn shell_command(command: &str, opts: &SpawnOptions) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    };

    cmd.current_dir(&opts.cwd);
    cmd.env("FORCE_COLOR", "2");
    cmd.envs(&opts.env);
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    cmd
}

impl ProcessRunner {
    /// Run a single shell command to completion.
    ///
    /// Exit code 0 resolves to a [`CommandResult`]; anything else raises
    /// [`ProcessError::Exit`] carrying the captured output.
    pub async fn run_command(
        &self,
        key: &TaskKey,
        command: &str,
        opts: &SpawnOptions,
    ) -> Result<CommandResult, ProcessError> {
        info!(
            workspace = %key.workspace,
            target = %key.target,
            cmd = %command,
            "starting command"
        );

        let capture = matches!(opts.stdio, StdioMode::Capture);
        let mut shell = shell_command(command, opts);
        if capture {
            shell.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            shell.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }

        let mut child = shell.spawn().map_err(|e| ProcessError::Spawn(e.to_string()))?;
        let cancel = Arc::new(Notify::new());
        let _registration = self.register(key, child.id(), Arc::clone(&cancel));

        let collector = capture.then(|| spawn_collector(&mut child));

        let started = Instant::now();
        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| ProcessError::Io(e.to_string()))?,
            _ = cancel.notified() => {
                let _ = child.start_kill();
                child.wait().await.map_err(|e| ProcessError::Io(e.to_string()))?
            }
        };

        let (stdout, stderr, all) = match collector {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Default::default(),
        };

        let code = status.code().unwrap_or(-1);
        let result = CommandResult {
            command: command.to_string(),
            exit_code: code,
            stdout,
            stderr,
            all,
            took_ms: started.elapsed().as_millis() as u64,
        };

        debug!(
            workspace = %key.workspace,
            target = %key.target,
            exit_code = code,
            took_ms = result.took_ms,
            "command exited"
        );

        if status.success() {
            Ok(result)
        } else {
            Err(ProcessError::Exit { code, result })
        }
    }
}

/// Drain both stdio pipes concurrently, preserving arrival order in the
/// combined stream.
fn spawn_collector(child: &mut Child) -> tokio::task::JoinHandle<(String, String, String)> {
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<OutputLine>();

    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, StdioSelector::Stdout, line_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, StdioSelector::Stderr, line_tx.clone());
    }
    drop(line_tx);

    tokio::spawn(async move {
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut all = String::new();
        while let Some(line) = line_rx.recv().await {
            let buffer = match line.source {
                StdioSelector::Stderr => &mut stderr,
                _ => &mut stdout,
            };
            buffer.push_str(&line.text);
            buffer.push('\n');
            all.push_str(&line.text);
            all.push('\n');
        }
        (stdout, stderr, all)
    })
}

/// Forward lines from one pipe into the given sink until EOF.
pub(crate) fn spawn_line_reader<R, F>(pipe: R, source: StdioSelector, sink: F)
where
    R: AsyncRead + Unpin + Send + 'static,
    F: LineSink + Send + 'static,
{
    tokio::spawn(async move {
        let reader = BufReader::new(pipe);
        let mut lines = reader.lines();
        while let Ok(Some(text)) = lines.next_line().await {
            if !sink.push(OutputLine { source, text }) {
                // Sink gone; keep draining so the pipe never backs up.
                while let Ok(Some(_)) = lines.next_line().await {}
                break;
            }
        }
    });
}

/// Anything lines can be forwarded into; `push` returns false once the
/// receiving side is gone.
pub(crate) trait LineSink {
    fn push(&self, line: OutputLine) -> bool;
}

impl LineSink for mpsc::UnboundedSender<OutputLine> {
    fn push(&self, line: OutputLine) -> bool {
        self.send(line).is_ok()
    }
}

impl LineSink for tokio::sync::broadcast::Sender<OutputLine> {
    fn push(&self, line: OutputLine) -> bool {
        // A broadcast with no subscribers still counts as alive; daemons
        // subscribe and unsubscribe as conditions resolve.
        self.send(line).is_ok() || self.receiver_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(dir: &std::path::Path) -> SpawnOptions {
        SpawnOptions {
            cwd: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new();
        let key = TaskKey::new("ws", "build");

        let result = runner
            .run_command(&key, "echo hello", &opts(dir.path()))
            .await
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.all, "hello\n");
        assert_eq!(runner.in_flight(&key), 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error_with_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new();
        let key = TaskKey::new("ws", "build");

        let err = runner
            .run_command(&key, "echo oops >&2; exit 3", &opts(dir.path()))
            .await
            .unwrap_err();

        match err {
            ProcessError::Exit { code, result } => {
                assert_eq!(code, 3);
                assert_eq!(result.stderr, "oops\n");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn environment_carries_force_color_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new();
        let key = TaskKey::new("ws", "env");

        let mut options = opts(dir.path());
        options.env.insert("EXTRA".to_string(), "1".to_string());

        let result = runner
            .run_command(&key, "echo $FORCE_COLOR-$EXTRA", &options)
            .await
            .unwrap();
        assert_eq!(result.stdout, "2-1\n");
    }
}
