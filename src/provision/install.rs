// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Operating system installation.
//!
//! Installation is opaque and all-or-nothing. Any failure aborts the run, and
//! the remedy is an operator-driven retry starting from disk preparation.

use crate::{
    config::Settings,
    host::{Host, HostError, Invocation},
    path::rooted,
};

use std::path::PathBuf;
use tracing::{info, instrument};

/// Invokes the operating system installer against the mounted target.
pub struct Installer<'a, H>
where
    H: Host + ?Sized,
{
    settings: &'a Settings,
    host: &'a H,
}

impl<'a, H> Installer<'a, H>
where
    H: Host + ?Sized,
{
    /// Construct new installer.
    pub fn new(settings: &'a Settings, host: &'a H) -> Self {
        Self { settings, host }
    }

    fn marker(&self) -> PathBuf {
        rooted(
            &self.settings.plan.settings.mount_root,
            &self.settings.plan.install.installed_marker,
        )
    }

    fn hardware_config(&self) -> PathBuf {
        self.settings
            .plan
            .settings
            .config_dir
            .join(&self.settings.plan.install.hardware_config)
    }

    /// Check if the target already carries an installed system.
    pub fn is_done(&self) -> bool {
        self.marker().exists()
    }

    /// Describe what [`Self::apply`] would do.
    pub fn plan(&self) -> Vec<String> {
        let install = &self.settings.plan.install;
        [&install.generate, &install.install]
            .into_iter()
            .map(|argv| argv.join(" "))
            .collect()
    }

    /// Generate hardware descriptors if needed, then install.
    ///
    /// # Errors
    ///
    /// - Return [`InstallError::EmptyCommand`] if a command is not configured.
    /// - Return [`InstallError::Tool`] if generation or installation fails.
    #[instrument(skip(self), level = "debug")]
    pub fn apply(&self) -> Result<()> {
        let install = &self.settings.plan.install;
        if self.hardware_config().exists() {
            info!("keep hardware descriptor {}", self.hardware_config().display());
        } else {
            info!("generate hardware descriptor");
            self.host.exec(&command("generate", &install.generate)?)?;
        }

        info!("install operating system, this takes a while");
        self.host
            .exec_interactive(&command("install", &install.install)?)?;
        info!("installation finished");

        Ok(())
    }

    /// Re-apply configuration after fragments changed.
    ///
    /// # Errors
    ///
    /// - Return [`InstallError::Tool`] if re-application fails.
    #[instrument(skip(self), level = "debug")]
    pub fn reapply(&self) -> Result<()> {
        info!("re-apply configuration");
        self.host
            .exec_interactive(&command("reapply", &self.settings.plan.install.reapply)?)?;
        Ok(())
    }

    /// Rebuild running system from its configuration.
    ///
    /// # Errors
    ///
    /// - Return [`InstallError::Tool`] if the rebuild fails.
    pub fn rebuild(&self) -> Result<()> {
        self.host
            .exec_interactive(&command("rebuild", &self.settings.plan.install.rebuild)?)?;
        Ok(())
    }
}

fn command(what: &'static str, argv: &[String]) -> Result<Invocation> {
    Invocation::from_argv(argv).ok_or(InstallError::EmptyCommand(what))
}

/// Installation error types.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// Command vector in the host plan is empty.
    #[error("no {0} command configured")]
    EmptyCommand(&'static str),

    /// Installer tool failed.
    #[error(transparent)]
    Tool(#[from] HostError),
}

/// Friendly result alias :3
pub type Result<T, E = InstallError> = std::result::Result<T, E>;
