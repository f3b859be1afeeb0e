// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Service verification.
//!
//! One non-blocking status check per unit, rendered as a pass/fail report.
//! This is a diagnostic, never a gate: a failing service does not fail the
//! run.

use crate::{
    config::Settings,
    host::{Host, Invocation},
};

use std::fmt::{Display, Formatter, Result as FmtResult};
use tracing::{info, warn};

/// Outcome of one status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub unit: String,
    pub healthy: bool,
    pub detail: String,
}

impl Display for ServiceStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self.healthy {
            true => write!(fmt, "[PASS] {} ({})", self.name, self.unit),
            false => write!(fmt, "[FAIL] {} ({}): {}", self.name, self.unit, self.detail),
        }
    }
}

/// Check container runtime, every service, and every tunnel client.
pub fn verify<H>(settings: &Settings, host: &H) -> Vec<ServiceStatus>
where
    H: Host + ?Sized,
{
    let plan = &settings.plan;
    let mut units = vec![("container-runtime".to_string(), plan.settings.runtime_unit.clone())];
    units.extend(
        plan.services
            .iter()
            .map(|service| (service.name.clone(), service.unit())),
    );
    units.extend(
        plan.tunnels
            .iter()
            .map(|tunnel| (format!("tunnel {}", tunnel.name), tunnel.unit())),
    );

    units
        .into_iter()
        .map(|(name, unit)| check_unit(host, name, unit))
        .collect()
}

/// Log report, one line per status.
///
/// Returns number of failed checks.
pub fn report(statuses: &[ServiceStatus]) -> usize {
    let mut failed = 0;
    for status in statuses {
        if status.healthy {
            info!("{status}");
        } else {
            failed += 1;
            warn!("{status}");
        }
    }

    match failed {
        0 => info!("all {} services healthy", statuses.len()),
        n => warn!("{n} of {} services unhealthy", statuses.len()),
    }

    failed
}

fn check_unit<H>(host: &H, name: String, unit: String) -> ServiceStatus
where
    H: Host + ?Sized,
{
    let cmd = Invocation::new("systemctl").arg("is-active").arg(&unit);
    match host.exec(&cmd) {
        Ok(output) => ServiceStatus {
            name,
            unit,
            healthy: true,
            detail: output.trim().into(),
        },
        Err(err) => {
            let detail = match err.message().trim() {
                "" => err.to_string(),
                message => message.trim_start_matches("stdout: ").to_string(),
            };
            ServiceStatus {
                name,
                unit,
                healthy: false,
                detail,
            }
        }
    }
}
