//! Idle action invocation.
//!
//! Ends the session once the watchdog fires by spawning the configured
//! command.

use std::process::Stdio;

use anyhow::Context;
use anyhow::Result;
use tokio::process::Command;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;

use crate::config::Config;

/// Command run when the session goes idle.
#[derive(Debug, Clone)]
pub struct IdleAction {
    /// Program followed by its arguments. `None` only logs.
    command: Option<Vec<String>>,

    /// Dry run mode.
    dry_run: bool,
}

impl IdleAction {
    /// Create an idle action from config.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.idle_command.clone(), config.dry_run)
    }

    /// Create an idle action. An empty command is rejected.
    pub fn new(command: Option<Vec<String>>, dry_run: bool) -> Result<Self> {
        if let Some(ref argv) = command
            && argv.first().is_none_or(String::is_empty)
        {
            anyhow::bail!("idle_command must name a program");
        }

        match command {
            Some(ref argv) => info!("Idle command: {}", argv.join(" ")),
            None => info!("No idle command configured; idle sessions are only logged"),
        }

        Ok(Self { command, dry_run })
    }

    /// End the idle session.
    pub async fn run(&self) -> Result<()> {
        let Some((program, args)) = self.command.as_ref().and_then(|c| c.split_first()) else {
            info!("Session idle; no idle command configured");
            return Ok(());
        };

        if self.dry_run {
            info!("[DRY RUN] Would execute: {} {}", program, args.join(" "));
            return Ok(());
        }

        debug!("Running idle command: {} {}", program, args.join(" "));

        let result = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn idle command: {program}"))?
            .wait_with_output()
            .await
            .context("Failed to wait for idle command")?;

        if result.status.success() {
            trace!("Idle command succeeded");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&result.stderr);
            error!(
                "Idle command failed (exit code {:?}): {}",
                result.status.code(),
                stderr.trim()
            );
            anyhow::bail!("Idle command exited with code {:?}", result.status.code())
        }
    }
}
