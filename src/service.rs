// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Day-to-day service helpers.
//!
//! Thin pass-through to the host's service manager and container runtime for
//! an already provisioned machine.

use crate::{
    config::{ServiceDescriptor, Settings},
    host::{Host, HostError, Invocation},
    provision::{
        install::{InstallError, Installer},
        verify::{self, ServiceStatus},
    },
};

use tracing::{info, instrument};

/// Service helpers bound to a host plan.
pub struct ServiceManager<'a, H>
where
    H: Host + ?Sized,
{
    settings: &'a Settings,
    host: &'a H,
}

impl<'a, H> ServiceManager<'a, H>
where
    H: Host + ?Sized,
{
    /// Construct new service manager.
    pub fn new(settings: &'a Settings, host: &'a H) -> Self {
        Self { settings, host }
    }

    fn lookup(&self, name: &str) -> Result<&'a ServiceDescriptor> {
        self.settings
            .plan
            .service(name)
            .ok_or_else(|| ServiceError::UnknownService(name.into()))
    }

    /// Check every unit once and log a report.
    pub fn status(&self) -> Vec<ServiceStatus> {
        let statuses = verify::verify(self.settings, self.host);
        verify::report(&statuses);
        statuses
    }

    /// Restart target service.
    ///
    /// # Errors
    ///
    /// - Return [`ServiceError::UnknownService`] if plan does not declare it.
    /// - Return [`ServiceError::Tool`] if the service manager fails.
    #[instrument(skip(self), level = "debug")]
    pub fn restart(&self, name: &str) -> Result<()> {
        let service = self.lookup(name)?;
        let cmd = Invocation::new("systemctl").arg("restart").arg(service.unit());
        self.host.exec(&cmd)?;
        info!("restarted {}", service.unit());
        Ok(())
    }

    /// Follow log of target service until interrupted.
    ///
    /// # Errors
    ///
    /// - Return [`ServiceError::UnknownService`] if plan does not declare it.
    /// - Return [`ServiceError::Tool`] if the journal cannot be read.
    pub fn logs(&self, name: &str) -> Result<()> {
        let service = self.lookup(name)?;
        let cmd = Invocation::new("journalctl")
            .arg("-u")
            .arg(service.unit())
            .arg("-f");
        self.host.exec_interactive(&cmd)?;
        Ok(())
    }

    /// Pull every container image, then rebuild the system.
    ///
    /// # Errors
    ///
    /// - Return [`ServiceError::Tool`] if an image cannot be pulled.
    /// - Return [`ServiceError::Rebuild`] if the rebuild fails.
    #[instrument(skip(self), level = "debug")]
    pub fn update(&self) -> Result<()> {
        for service in &self.settings.plan.services {
            info!("pull {}", service.image);
            let cmd = Invocation::new("podman").arg("pull").arg(&service.image);
            self.host.exec(&cmd)?;
        }

        info!("rebuild system");
        Installer::new(self.settings, self.host).rebuild()?;
        Ok(())
    }
}

/// Service helper error types.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Plan declares no such service.
    #[error("unknown service {0:?}")]
    UnknownService(String),

    /// Service manager or container runtime failed.
    #[error(transparent)]
    Tool(#[from] HostError),

    /// System rebuild failed.
    #[error(transparent)]
    Rebuild(#[from] InstallError),
}

/// Friendly result alias :3
pub type Result<T, E = ServiceError> = std::result::Result<T, E>;
