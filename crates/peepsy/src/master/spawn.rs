//! Worker process spawning.
//!
//! `WorkerSpawner` is the extension seam: the default implementation launches
//! a real child process with piped stdio; tests and embedders substitute one
//! that runs workers in-process over an in-memory channel.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::config::{SpawnOptions, WorkerScript, MAX_CONCURRENCY_ENV};
use crate::error::{Error, Result};

/// How a worker process ended.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Control over a spawned worker's lifetime: forcible kill and exit
/// collection.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Forcibly terminate the worker (SIGKILL or equivalent). Best effort.
    fn kill(&mut self);

    /// Wait for the worker to exit and report how it ended.
    async fn wait(&mut self) -> ExitInfo;
}

/// A freshly spawned worker: its channel halves and process handle.
pub struct SpawnedWorker {
    pub pid: u32,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub handle: Box<dyn ProcessHandle>,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(
        &self,
        target: &str,
        script: &WorkerScript,
        options: &SpawnOptions,
    ) -> Result<SpawnedWorker>;
}

/// Default spawner: runs the worker script as a child process, channel over
/// its stdin/stdout.
pub struct ProcessSpawner;

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &self,
        target: &str,
        script: &WorkerScript,
        options: &SpawnOptions,
    ) -> Result<SpawnedWorker> {
        let mut command = Command::new(&script.program);
        command
            .args(&script.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in &script.env {
            command.env(key, value);
        }
        if let Some(cap) = options.max_concurrency {
            command.env(MAX_CONCURRENCY_ENV, cap.to_string());
        }

        let mut child = command.spawn().map_err(|e| {
            Error::process(format!(
                "failed to spawn worker {} ({}): {}",
                target,
                script.program.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::process(format!("worker {}: stdin not captured", target)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::process(format!("worker {}: stdout not captured", target)))?;
        let pid = child.id().unwrap_or(0);

        tracing::debug!(%target, pid, program = %script.program.display(), "spawned worker process");

        Ok(SpawnedWorker {
            pid,
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            handle: Box::new(ChildHandle { child }),
        })
    }
}

struct ChildHandle {
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(error = %e, "failed to kill worker process");
        }
    }

    async fn wait(&mut self) -> ExitInfo {
        match self.child.wait().await {
            Ok(status) => ExitInfo {
                code: status.code(),
                signal: exit_signal(&status),
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to collect worker exit status");
                ExitInfo::default()
            }
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
