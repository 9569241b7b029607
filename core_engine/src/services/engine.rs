//! Data plane control.
//!
//! The actual tunnel (OpenVPN daemon, WireGuard interface) lives outside this
//! process. Services describe what they want as a [`TunnelSpec`] and a
//! [`TunnelEngine`] brings it up and down.

use async_trait::async_trait;
use shared_utils::config::EngineSettings;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Tunnel command failed: {0}")]
    Command(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Named tunnel plus the parameters the data plane needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelSpec {
    pub name: String,
    pub params: Vec<(String, String)>,
}

impl TunnelSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait]
pub trait TunnelEngine: Send + Sync {
    async fn up(&self, spec: &TunnelSpec) -> EngineResult<()>;

    async fn down(&self, spec: &TunnelSpec) -> EngineResult<()>;
}

/// Runs configured commands.
///
/// The spec is passed in the environment as `MESHTUNNEL_TUNNEL_NAME` and one
/// upper-cased `MESHTUNNEL_<KEY>` variable per parameter. An empty command
/// is a no-op, so a node without a data plane still runs sessions.
#[derive(Debug, Clone, Default)]
pub struct CommandEngine {
    up_command: Vec<String>,
    down_command: Vec<String>,
}

impl CommandEngine {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            up_command: settings.up_command.clone(),
            down_command: settings.down_command.clone(),
        }
    }

    async fn run(&self, argv: &[String], spec: &TunnelSpec) -> EngineResult<()> {
        let Some((program, args)) = argv.split_first() else {
            debug!(tunnel = %spec.name, "No engine command configured");
            return Ok(());
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .env("MESHTUNNEL_TUNNEL_NAME", &spec.name)
            .kill_on_drop(true);
        for (key, value) in &spec.params {
            command.env(format!("MESHTUNNEL_{}", key.to_uppercase()), value);
        }

        let status = command.status().await?;
        if !status.success() {
            return Err(EngineError::Command(format!(
                "{} exited with {} for tunnel {}",
                program, status, spec.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelEngine for CommandEngine {
    async fn up(&self, spec: &TunnelSpec) -> EngineResult<()> {
        self.run(&self.up_command, spec).await?;
        info!(tunnel = %spec.name, "Tunnel up");
        Ok(())
    }

    async fn down(&self, spec: &TunnelSpec) -> EngineResult<()> {
        self.run(&self.down_command, spec).await?;
        info!(tunnel = %spec.name, "Tunnel down");
        Ok(())
    }
}
