use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::coord_error::CoordError;
use crate::error::{Error, Result};

/// What to launch for an agent.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

/// Handle to a launched agent process. Platform signal semantics stay
/// behind this seam; the graceful path is a shutdown message over the bus,
/// followed by `terminate`/`force_kill` once the grace period lapses.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;
    /// Exit code if the process has exited, without blocking.
    async fn try_wait(&mut self) -> Result<Option<i32>>;
    /// Request the process stop.
    async fn terminate(&mut self) -> Result<()>;
    /// Kill and reap the process.
    async fn force_kill(&mut self) -> Result<()>;
}

/// Seam for creating agent processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>>;
}

/// `tokio::process` launcher.
pub struct TokioProcessLauncher;

#[async_trait]
impl ProcessLauncher for TokioProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let child = command
            .spawn()
            .map_err(|e| Error::CoordError(CoordError::ProcessError(e.to_string())))?;
        debug!("launched {} (pid {:?})", spec.command, child.id());
        Ok(Box::new(TokioProcessHandle { child }))
    }
}

struct TokioProcessHandle {
    child: Child,
}

#[async_trait]
impl ProcessHandle for TokioProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn try_wait(&mut self) -> Result<Option<i32>> {
        let status = self
            .child
            .try_wait()
            .map_err(|e| Error::CoordError(CoordError::ProcessError(e.to_string())))?;
        Ok(status.map(|s| s.code().unwrap_or(-1)))
    }

    async fn terminate(&mut self) -> Result<()> {
        self.child
            .start_kill()
            .map_err(|e| Error::CoordError(CoordError::ProcessError(e.to_string())))
    }

    async fn force_kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .await
            .map_err(|e| Error::CoordError(CoordError::ProcessError(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_launch_and_wait() {
        let launcher = TokioProcessLauncher;
        let mut handle = launcher
            .launch(&LaunchSpec {
                command: "true".into(),
                args: vec![],
                env: HashMap::new(),
                working_dir: None,
            })
            .await
            .unwrap();

        // Poll until the short-lived process exits.
        let mut exit = None;
        for _ in 0..50 {
            exit = handle.try_wait().await.unwrap();
            if exit.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(exit, Some(0));
    }

    #[tokio::test]
    async fn test_force_kill() {
        let launcher = TokioProcessLauncher;
        let mut handle = launcher
            .launch(&LaunchSpec {
                command: "sleep".into(),
                args: vec!["60".into()],
                env: HashMap::new(),
                working_dir: None,
            })
            .await
            .unwrap();

        assert!(handle.pid().is_some());
        handle.force_kill().await.unwrap();
        let exit = handle.try_wait().await.unwrap();
        assert!(exit.is_some());
    }
}
