// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Provisioning sequence.
//!
//! Provisioning a home-lab machine is a fixed, strictly ordered sequence of
//! named __steps__. No step begins before its predecessor completes:
//!
//! 1. [`Step::Preflight`] verifies the environment.
//! 2. [`Step::Disks`] partitions, formats, labels, and mounts block devices.
//! 3. [`Step::Materialize`] renders configuration fragments.
//! 4. [`Step::Secrets`] collects credentials from the operator.
//! 5. [`Step::Install`] installs the operating system.
//! 6. [`Step::Tunnels`] creates tunnels and routes hostnames to them.
//! 7. [`Step::Models`] pulls inference models, if the plan asks for it.
//! 8. [`Step::Verify`] reports the health of every service.
//!
//! # Resumption
//!
//! Every step that changes the machine has an "already done" predicate that
//! inspects its target artifact, e.g., a by-label link, a rendered fragment, a
//! secret file. A step whose artifact exists is skipped, so re-running the
//! whole sequence after a failure picks up where the last run stopped.
//! Nothing is ever rolled back.
//!
//! # Domain
//!
//! Before rendering, a plan that still carries the placeholder domain gets a
//! real one from the operator. Every later step sees the answer.
//!
//! # Dry Run
//!
//! Preflight and verification are read-only, so they always execute. Every
//! other step only logs what it would do.

pub mod disk;
pub mod install;
pub mod materialize;
pub mod models;
pub mod preflight;
pub mod secrets;
pub mod tunnel;
pub mod verify;

use crate::{
    config::{HostPlan, Settings},
    host::Host,
    prompt::Prompter,
    provision::{
        disk::{DiskError, DiskProvisioner},
        install::{InstallError, Installer},
        materialize::{ConfigMaterializer, MaterializeError},
        models::{ModelError, ModelWarmup},
        preflight::PreflightError,
        secrets::{SecretCollector, SecretError},
        tunnel::{TunnelBootstrapper, TunnelError},
        verify::ServiceStatus,
    },
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    sync::Arc,
};
use tracing::{info, instrument};

/// Named step of the provisioning sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Step {
    Preflight,
    Disks,
    Materialize,
    Secrets,
    Install,
    Tunnels,
    Models,
    Verify,
}

impl Step {
    /// Ordered steps that target plan runs.
    pub fn sequence(plan: &HostPlan) -> Vec<Step> {
        let mut steps = vec![
            Step::Preflight,
            Step::Disks,
            Step::Materialize,
            Step::Secrets,
            Step::Install,
            Step::Tunnels,
        ];
        if plan.models.pull_on_provision {
            steps.push(Step::Models);
        }
        steps.push(Step::Verify);
        steps
    }

    /// Check if step never changes the machine.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Step::Preflight | Step::Verify)
    }
}

impl Display for Step {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Step::Preflight => "preflight",
            Step::Disks => "disks",
            Step::Materialize => "materialize",
            Step::Secrets => "secrets",
            Step::Install => "install",
            Step::Tunnels => "tunnels",
            Step::Models => "models",
            Step::Verify => "verify",
        };
        fmt.pad(name)
    }
}

/// What happened to a step during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Read-only step executed.
    Passed,

    /// Step changed the machine.
    Applied,

    /// Target artifact already existed.
    Skipped,

    /// Dry run, with the actions the step would take.
    Planned(Vec<String>),
}

impl Display for Outcome {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Outcome::Passed => fmt.write_str("passed"),
            Outcome::Applied => fmt.write_str("applied"),
            Outcome::Skipped => fmt.write_str("skipped, already done"),
            Outcome::Planned(actions) => write!(fmt, "planned {} action(s)", actions.len()),
        }
    }
}

/// Result of a complete provisioning run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    pub steps: Vec<(Step, Outcome)>,
    pub services: Vec<ServiceStatus>,
}

impl Report {
    /// Outcome of target step, if it ran.
    pub fn outcome(&self, step: Step) -> Option<&Outcome> {
        self.steps
            .iter()
            .find(|(entry, _)| *entry == step)
            .map(|(_, outcome)| outcome)
    }

    /// Number of services that failed verification.
    pub fn unhealthy(&self) -> usize {
        self.services.iter().filter(|status| !status.healthy).count()
    }
}

/// Drives the provisioning sequence.
pub struct Provisioner<'a, H, P>
where
    H: Host + ?Sized + 'static,
    P: Prompter + ?Sized,
{
    settings: Settings,
    host: Arc<H>,
    prompter: &'a P,
}

impl<'a, H, P> Provisioner<'a, H, P>
where
    H: Host + ?Sized + 'static,
    P: Prompter + ?Sized,
{
    /// Construct new provisioner.
    pub fn new(settings: &Settings, host: Arc<H>, prompter: &'a P) -> Self {
        Self {
            settings: settings.clone(),
            host,
            prompter,
        }
    }

    /// Run every step in order.
    ///
    /// Stops at the first failed step. Steps completed before it are left in
    /// place.
    ///
    /// # Errors
    ///
    /// - Return [`ProvisionError`] of the first step that failed.
    #[instrument(skip(self), level = "debug")]
    pub async fn run(&mut self) -> Result<Report> {
        let mut report = Report::default();
        if self.settings.options.dry_run {
            info!("dry run, nothing will be changed");
        }

        for step in Step::sequence(&self.settings.plan) {
            info!("step {step}");
            let outcome = self.run_step(step, &mut report).await?;
            info!("step {step}: {outcome}");
            report.steps.push((step, outcome));
        }

        Ok(report)
    }

    async fn run_step(&mut self, step: Step, report: &mut Report) -> Result<Outcome> {
        match step {
            Step::Preflight => {
                preflight::check(&self.settings, &*self.host)?;
                return Ok(Outcome::Passed);
            }
            Step::Materialize => {
                let domain =
                    ConfigMaterializer::new(&self.settings, self.prompter).resolve_domain()?;
                if let Some(domain) = domain {
                    info!("use domain {domain}");
                    self.settings.plan.settings.domain = domain;
                }
            }
            Step::Verify => {
                report.services = verify::verify(&self.settings, &*self.host);
                verify::report(&report.services);
                return Ok(Outcome::Passed);
            }
            _ => {}
        }

        if self.is_done(step) {
            // INVARIANT: Secret permissions are re-applied even when nothing is collected.
            if step == Step::Secrets && !self.settings.options.dry_run {
                SecretCollector::new(&self.settings, self.prompter).collect()?;
            }
            return Ok(Outcome::Skipped);
        }

        if self.settings.options.dry_run {
            let actions = self.plan(step);
            for action in &actions {
                info!("[dry-run] {action}");
            }
            return Ok(Outcome::Planned(actions));
        }

        self.apply(step).await?;
        Ok(Outcome::Applied)
    }

    /// Check if target step's artifact already exists.
    pub fn is_done(&self, step: Step) -> bool {
        let host = &*self.host;
        match step {
            Step::Preflight | Step::Verify => false,
            Step::Disks => DiskProvisioner::new(&self.settings, host, self.prompter).is_done(),
            Step::Materialize => ConfigMaterializer::new(&self.settings, self.prompter).is_done(),
            Step::Secrets => SecretCollector::new(&self.settings, self.prompter).is_done(),
            Step::Install => Installer::new(&self.settings, host).is_done(),
            Step::Tunnels => TunnelBootstrapper::new(&self.settings, host, self.prompter).is_done(),
            Step::Models => ModelWarmup::new(&self.settings, Arc::clone(&self.host)).is_done(),
        }
    }

    /// Describe the actions target step would take.
    pub fn plan(&self, step: Step) -> Vec<String> {
        let host = &*self.host;
        match step {
            Step::Preflight | Step::Verify => Vec::new(),
            Step::Disks => DiskProvisioner::new(&self.settings, host, self.prompter).plan(),
            Step::Materialize => ConfigMaterializer::new(&self.settings, self.prompter).plan(),
            Step::Secrets => SecretCollector::new(&self.settings, self.prompter).plan(),
            Step::Install => Installer::new(&self.settings, host).plan(),
            Step::Tunnels => TunnelBootstrapper::new(&self.settings, host, self.prompter).plan(),
            Step::Models => ModelWarmup::new(&self.settings, Arc::clone(&self.host)).plan(),
        }
    }

    async fn apply(&self, step: Step) -> Result<()> {
        let host = &*self.host;
        match step {
            Step::Preflight | Step::Verify => {}
            Step::Disks => DiskProvisioner::new(&self.settings, host, self.prompter).apply()?,
            Step::Materialize => ConfigMaterializer::new(&self.settings, self.prompter).apply()?,
            Step::Secrets => {
                let collected = SecretCollector::new(&self.settings, self.prompter).collect()?;
                info!("collected {} secret(s)", collected.len());
            }
            Step::Install => Installer::new(&self.settings, host).apply()?,
            Step::Tunnels => {
                let tunnels = TunnelBootstrapper::new(&self.settings, host, self.prompter).apply()?;
                for tunnel in tunnels {
                    info!("tunnel {} is {}", tunnel.name, tunnel.id);
                }
            }
            Step::Models => ModelWarmup::new(&self.settings, Arc::clone(&self.host)).apply().await?,
        }

        Ok(())
    }
}

/// Broad class of a provisioning failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Machine is not in a state to provision, retrying will not help.
    Precondition,

    /// External effect did not show up in time.
    Readiness,

    /// Operator input failed or was withheld.
    OperatorInput,

    /// External tool exited non-zero.
    ExternalTool,
}

/// Provisioning error types.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("preflight failed")]
    Preflight(#[from] PreflightError),

    #[error("disk preparation failed")]
    Disk(#[from] DiskError),

    #[error("configuration materialization failed")]
    Materialize(#[from] MaterializeError),

    #[error("secret collection failed")]
    Secret(#[from] SecretError),

    #[error("installation failed")]
    Install(#[from] InstallError),

    #[error("tunnel bootstrap failed")]
    Tunnel(#[from] TunnelError),

    #[error("model warm-up failed")]
    Model(#[from] ModelError),
}

impl ProvisionError {
    /// Classify failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Preflight(_) => FailureKind::Precondition,
            Self::Disk(DiskError::NotConfirmed | DiskError::Prompt(_)) => FailureKind::OperatorInput,
            Self::Disk(DiskError::LabelTimeout(_)) => FailureKind::Readiness,
            Self::Disk(DiskError::LabelsMissing(_)) => FailureKind::Precondition,
            Self::Materialize(MaterializeError::Prompt(_)) => FailureKind::OperatorInput,
            Self::Secret(SecretError::Prompt(_)) => FailureKind::OperatorInput,
            Self::Tunnel(TunnelError::Prompt(_) | TunnelError::LoginIncomplete(_)) => {
                FailureKind::OperatorInput
            }
            Self::Model(ModelError::NotReady(_)) => FailureKind::Readiness,
            _ => FailureKind::ExternalTool,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;
