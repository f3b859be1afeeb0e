// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Preflight checks.
//!
//! Verify the environment before anything destructive happens: the expected
//! installer environment, network reachability, and presence and size of
//! every target block device. Nothing here has side effects.

use crate::{
    config::Settings,
    host::{Host, HostError, Invocation},
    provision::disk::disks,
};

use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

const GIB: u64 = 1024 * 1024 * 1024;

/// Run every preflight check.
///
/// Fails fast on the first failed check.
///
/// # Errors
///
/// - Return [`PreflightError::OsMarkerMissing`] if not running in the
///   expected installer environment.
/// - Return [`PreflightError::Unreachable`] if the probe host does not answer.
/// - Return [`PreflightError::NotBlockDevice`] if a target device is missing.
/// - Return [`PreflightError::TooSmall`] if a target device is undersized.
#[instrument(skip_all, level = "debug")]
pub fn check<H>(settings: &Settings, host: &H) -> Result<()>
where
    H: Host + ?Sized,
{
    let plan = &settings.plan;

    let marker = &plan.settings.os_marker;
    if !marker.exists() {
        return Err(PreflightError::OsMarkerMissing(marker.clone()));
    }
    debug!("found OS marker {}", marker.display());

    let probe = Invocation::new("ping").args(["-c", "1", "-W", "5"]).arg(&plan.settings.probe_host);
    host.exec(&probe).map_err(|err| PreflightError::Unreachable {
        host: plan.settings.probe_host.clone(),
        source: err,
    })?;
    debug!("{} is reachable", plan.settings.probe_host);

    for disk in disks(&plan.devices) {
        if !host.is_block_device(&disk.path) {
            return Err(PreflightError::NotBlockDevice(disk.path));
        }

        let minimum = plan.devices.min_size_gib;
        if minimum == 0 {
            continue;
        }

        let size = device_size(host, &disk.path)?;
        if size < minimum.saturating_mul(GIB) {
            return Err(PreflightError::TooSmall {
                path: disk.path,
                size_gib: size / GIB,
                minimum_gib: minimum,
            });
        }
    }

    info!("preflight checks passed");
    Ok(())
}

fn device_size<H>(host: &H, path: &Path) -> Result<u64>
where
    H: Host + ?Sized,
{
    let cmd = Invocation::new("lsblk").arg("-bdno").arg("SIZE").arg(path);
    let output = host.exec(&cmd)?;
    output
        .trim()
        .parse::<u64>()
        .map_err(|_| PreflightError::UnknownSize {
            path: path.to_path_buf(),
            output: output.trim().into(),
        })
}

/// Preflight error types.
#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    /// Not running where provisioning is expected to run.
    #[error("OS marker {0:?} is missing, refusing to run outside the installer environment")]
    OsMarkerMissing(PathBuf),

    /// Network probe failed.
    #[error("network probe to {host} failed")]
    Unreachable {
        host: String,
        #[source]
        source: HostError,
    },

    /// Expected device is absent or not a block device.
    #[error("{0:?} is not a block device")]
    NotBlockDevice(PathBuf),

    /// Device is smaller than the configured minimum.
    #[error("{path:?} holds {size_gib} GiB, need at least {minimum_gib} GiB")]
    TooSmall {
        path: PathBuf,
        size_gib: u64,
        minimum_gib: u64,
    },

    /// Device size query printed nonsense.
    #[error("cannot determine size of {path:?} from {output:?}")]
    UnknownSize { path: PathBuf, output: String },

    /// Device size query failed.
    #[error(transparent)]
    Tool(#[from] HostError),
}

/// Friendly result alias :3
pub type Result<T, E = PreflightError> = std::result::Result<T, E>;
