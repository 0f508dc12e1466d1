use std::path::PathBuf;
use std::process::ExitStatus;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Produces the base `kubeadm join ...` command for an authorized caller.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue_join_token(&self) -> Result<Vec<u8>, IssuerError>;
}

/// Creates a fresh bootstrap token through the `kubeadm` CLI.
#[derive(Debug, Clone)]
pub struct KubeadmIssuer {
    program: PathBuf,
    kubeconfig: Option<PathBuf>,
}

impl KubeadmIssuer {
    pub fn new(program: impl Into<PathBuf>, kubeconfig: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            kubeconfig,
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "token".to_owned(),
            "create".to_owned(),
            "--print-join-command".to_owned(),
        ];
        if let Some(path) = &self.kubeconfig {
            args.push("--kubeconfig".to_owned());
            args.push(path.display().to_string());
        }
        args
    }
}

impl Default for KubeadmIssuer {
    fn default() -> Self {
        Self::new("kubeadm", None)
    }
}

#[async_trait]
impl TokenIssuer for KubeadmIssuer {
    async fn issue_join_token(&self) -> Result<Vec<u8>, IssuerError> {
        let program = self.program.display().to_string();
        debug!(%program, kubeconfig = ?self.kubeconfig, "creating bootstrap token");

        let output = Command::new(&self.program)
            .args(self.args())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| IssuerError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(IssuerError::Failed {
                program,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(output.stdout)
    }
}
