// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Disk preparation.
//!
//! Partitions, formats, labels, and mounts the three block devices of the
//! host. The system device receives an EFI partition and a root partition,
//! each storage device receives one partition spanning the whole disk.
//!
//! # Labels
//!
//! Every volume is addressed through its filesystem label, never through its
//! enumeration-order device name. The label used when formatting and the
//! label used when mounting both come from the same [`Volume`], so they
//! cannot drift apart. Label registration happens asynchronously in the
//! device manager after `mkfs` returns, so the provisioner re-scans and then
//! polls for each by-label link with a hard deadline.
//!
//! # Idempotence
//!
//! A device whose by-label links already resolve to its own partitions is
//! considered provisioned and left alone. With the skip-destructive option
//! nothing is ever partitioned or formatted, the existing volumes are only
//! mounted.

use crate::{
    config::{DeviceLayout, DeviceRole, Filesystem, Settings},
    host::{Host, HostError, Invocation},
    path::rooted,
    poll::{wait_until, PollError},
    prompt::{PromptError, Prompter},
};

use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Exact answer the operator must type before anything gets erased.
pub const CONFIRM_TOKEN: &str = "ERASE";

/// One physical disk and the volumes carved out of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    pub path: PathBuf,
    pub volumes: Vec<Volume>,
}

/// Filesystem placed on one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub role: DeviceRole,
    pub disk: PathBuf,
    pub number: u8,
    pub label: String,
    pub filesystem: Filesystem,
}

impl Volume {
    /// Device path of the partition.
    pub fn partition(&self) -> PathBuf {
        partition_path(&self.disk, self.number)
    }
}

/// Determine device path of partition `number` on `disk`.
///
/// Disks whose name ends in a digit, e.g., `/dev/nvme0n1`, separate the
/// partition number with a `p`.
pub fn partition_path(disk: impl AsRef<Path>, number: u8) -> PathBuf {
    let disk = disk.as_ref().to_string_lossy();
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{disk}p{number}"))
    } else {
        PathBuf::from(format!("{disk}{number}"))
    }
}

/// Expand device layout into its disks and volumes.
pub fn disks(layout: &DeviceLayout) -> Vec<Disk> {
    let volume = |role: DeviceRole, disk: &Path, number: u8| Volume {
        role,
        disk: disk.to_path_buf(),
        number,
        label: layout.labels.get(role).to_string(),
        filesystem: layout.filesystem(role),
    };

    vec![
        Disk {
            path: layout.system.clone(),
            volumes: vec![
                volume(DeviceRole::Boot, &layout.system, 1),
                volume(DeviceRole::Root, &layout.system, 2),
            ],
        },
        Disk {
            path: layout.storage_a.clone(),
            volumes: vec![volume(DeviceRole::BulkStorageA, &layout.storage_a, 1)],
        },
        Disk {
            path: layout.storage_b.clone(),
            volumes: vec![volume(DeviceRole::BulkStorageB, &layout.storage_b, 1)],
        },
    ]
}

/// Commands that write a fresh GPT and partitions to a disk.
pub fn partition_commands(disk: &Disk, boot_size: &str) -> Vec<Invocation> {
    let mut commands = vec![Invocation::new("sgdisk").arg("--zap-all").arg(&disk.path)];
    for volume in &disk.volumes {
        let n = volume.number;
        let (size, typecode) = match volume.role {
            DeviceRole::Boot => (format!("+{boot_size}"), "ef00"),
            _ => ("0".to_string(), "8300"),
        };
        commands.push(
            Invocation::new("sgdisk")
                .arg("-n")
                .arg(format!("{n}:0:{size}"))
                .arg("-t")
                .arg(format!("{n}:{typecode}"))
                .arg("-c")
                .arg(format!("{n}:{}", volume.role))
                .arg(&disk.path),
        );
    }
    commands.push(Invocation::new("partprobe").arg(&disk.path));

    commands
}

/// Command that formats a volume with its label.
pub fn format_command(volume: &Volume) -> Invocation {
    let partition = volume.partition();
    match volume.filesystem {
        Filesystem::Vfat => Invocation::new("mkfs.fat")
            .args(["-F", "32", "-n"])
            .arg(&volume.label)
            .arg(partition),
        Filesystem::Ext4 => Invocation::new("mkfs.ext4")
            .args(["-F", "-L"])
            .arg(&volume.label)
            .arg(partition),
        Filesystem::Xfs => Invocation::new("mkfs.xfs")
            .args(["-f", "-L"])
            .arg(&volume.label)
            .arg(partition),
    }
}

/// Commands that make the device manager re-read block device metadata.
pub fn rescan_commands() -> Vec<Invocation> {
    vec![
        Invocation::new("udevadm").args(["trigger", "--subsystem-match=block"]),
        Invocation::new("udevadm").args(["settle", "--timeout=10"]),
    ]
}

/// Partitions, formats, and mounts block devices.
#[derive(Debug)]
pub struct DiskProvisioner<'a, H, P>
where
    H: Host + ?Sized,
    P: Prompter + ?Sized,
{
    settings: &'a Settings,
    host: &'a H,
    prompter: &'a P,
}

impl<'a, H, P> DiskProvisioner<'a, H, P>
where
    H: Host + ?Sized,
    P: Prompter + ?Sized,
{
    /// Construct new disk provisioner.
    pub fn new(settings: &'a Settings, host: &'a H, prompter: &'a P) -> Self {
        Self {
            settings,
            host,
            prompter,
        }
    }

    fn label_link(&self, label: &str) -> PathBuf {
        self.settings.plan.settings.by_label_dir.join(label)
    }

    /// Check that a volume's by-label link resolves to its own partition.
    pub fn label_resolves(&self, volume: &Volume) -> bool {
        let link = fs::canonicalize(self.label_link(&volume.label));
        let partition = fs::canonicalize(volume.partition());
        matches!((link, partition), (Ok(link), Ok(partition)) if link == partition)
    }

    /// Check if every volume on a disk already carries its label.
    pub fn is_provisioned(&self, disk: &Disk) -> bool {
        disk.volumes.iter().all(|volume| self.label_resolves(volume))
    }

    /// Check if every disk is provisioned and mounted.
    pub fn is_done(&self) -> bool {
        disks(&self.settings.plan.devices)
            .iter()
            .all(|disk| self.is_provisioned(disk))
            && self
                .mount_targets()
                .iter()
                .all(|(_, target)| self.is_mounted(target))
    }

    fn is_mounted(&self, target: &Path) -> bool {
        let probe = Invocation::new("mountpoint").arg("-q").arg(target);
        self.host.exec(&probe).is_ok()
    }

    /// Describe what [`Self::apply`] would do.
    pub fn plan(&self) -> Vec<String> {
        let devices = &self.settings.plan.devices;
        let mut plan = Vec::new();
        let pending = disks(devices)
            .into_iter()
            .filter(|disk| !self.settings.options.skip_destructive && !self.is_provisioned(disk));
        for disk in pending {
            plan.extend(
                partition_commands(&disk, &devices.boot_size)
                    .iter()
                    .map(ToString::to_string),
            );
            plan.extend(disk.volumes.iter().map(|v| format_command(v).to_string()));
        }

        plan.extend(self.mount_commands().iter().map(ToString::to_string));
        plan
    }

    /// Provision every disk that needs it, then mount everything.
    ///
    /// # Errors
    ///
    /// - Return [`DiskError::NotConfirmed`] if the operator did not type the
    ///   confirmation token.
    /// - Return [`DiskError::Tool`] if a partitioning, formatting, or
    ///   mounting command fails.
    /// - Return [`DiskError::LabelTimeout`] if a label never registers.
    /// - Return [`DiskError::LabelMismatch`] if a label points at the wrong
    ///   partition.
    /// - Return [`DiskError::LabelsMissing`] if destructive steps are skipped
    ///   but volumes are not provisioned.
    #[instrument(skip(self), level = "debug")]
    pub fn apply(&self) -> Result<()> {
        self.unmount_stale();

        let devices = &self.settings.plan.devices;
        let pending = disks(devices)
            .into_iter()
            .filter(|disk| {
                let done = self.is_provisioned(disk);
                if done {
                    info!("{} already provisioned, leaving it alone", disk.path.display());
                }
                !done
            })
            .collect::<Vec<_>>();

        if !pending.is_empty() {
            if self.settings.options.skip_destructive {
                let labels = pending
                    .iter()
                    .flat_map(|disk| disk.volumes.iter().map(|v| v.label.clone()))
                    .collect::<Vec<_>>();
                return Err(DiskError::LabelsMissing(labels));
            }

            self.confirm(&pending)?;
            for disk in &pending {
                self.provision(disk)?;
            }
        }

        self.mount_all()
    }

    fn confirm(&self, pending: &[Disk]) -> Result<()> {
        if self.settings.options.force_noninteractive {
            warn!("non-interactive override given, erasing without confirmation");
            return Ok(());
        }

        let targets = pending
            .iter()
            .map(|disk| disk.path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        warn!("all data on {targets} will be destroyed");
        let answer = self
            .prompter
            .read_line(&format!("type {CONFIRM_TOKEN} to continue"))?;
        if answer.trim() != CONFIRM_TOKEN {
            return Err(DiskError::NotConfirmed);
        }

        Ok(())
    }

    #[instrument(skip(self, disk), fields(disk = %disk.path.display()), level = "debug")]
    fn provision(&self, disk: &Disk) -> Result<()> {
        info!("partition {}", disk.path.display());
        for cmd in partition_commands(disk, &self.settings.plan.devices.boot_size) {
            self.host.exec(&cmd)?;
        }

        for volume in &disk.volumes {
            info!(
                "format {} as {} labeled {:?}",
                volume.partition().display(),
                volume.filesystem,
                volume.label
            );
            self.host.exec(&format_command(volume))?;
        }

        for cmd in rescan_commands() {
            self.host.exec(&cmd)?;
        }

        let options = &self.settings.options;
        for volume in &disk.volumes {
            let link = self.label_link(&volume.label);
            wait_until(
                format!("label {:?}", volume.label),
                options.label_timeout,
                options.poll_interval,
                || link.exists(),
            )?;

            if !self.label_resolves(volume) {
                return Err(DiskError::LabelMismatch {
                    label: volume.label.clone(),
                    expected: volume.partition(),
                });
            }
        }

        Ok(())
    }

    // INVARIANT: Best-effort. Nothing mounted is the common case.
    fn unmount_stale(&self) {
        let root = &self.settings.plan.settings.mount_root;
        let cmd = Invocation::new("umount").arg("-R").arg(root);
        match self.host.exec(&cmd) {
            Ok(_) => info!("unmounted stale mounts under {}", root.display()),
            Err(err) if err.message().contains("not mounted") => {
                debug!("nothing mounted under {}", root.display())
            }
            Err(err) => warn!("could not unmount {}: {err}", root.display()),
        }
    }

    fn mount_targets(&self) -> Vec<(Volume, PathBuf)> {
        let root = &self.settings.plan.settings.mount_root;
        let mut volumes = disks(&self.settings.plan.devices)
            .into_iter()
            .flat_map(|disk| disk.volumes)
            .collect::<Vec<_>>();
        volumes.sort_by_key(|volume| volume.role.mount_rank());
        volumes
            .into_iter()
            .map(|volume| {
                let target = rooted(root, volume.role.mount_point());
                (volume, target)
            })
            .collect()
    }

    fn mount_command(&self, volume: &Volume, target: &Path) -> Invocation {
        Invocation::new("mount")
            .arg(self.label_link(&volume.label))
            .arg(target)
    }

    fn mount_commands(&self) -> Vec<Invocation> {
        self.mount_targets()
            .iter()
            .map(|(volume, target)| self.mount_command(volume, target))
            .collect()
    }

    fn mount_all(&self) -> Result<()> {
        for (volume, target) in self.mount_targets() {
            if self.is_mounted(&target) {
                debug!("{} already mounted", target.display());
                continue;
            }

            mkdirp::mkdirp(&target).map_err(|err| DiskError::MountPoint {
                source: err,
                path: target.clone(),
            })?;
            info!("mount {:?} at {}", volume.label, target.display());
            self.host.exec(&self.mount_command(&volume, &target))?;
        }

        Ok(())
    }
}

/// Disk preparation error types.
#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    /// Operator did not confirm destruction.
    #[error("destructive action not confirmed, expected {CONFIRM_TOKEN:?}")]
    NotConfirmed,

    /// Confirmation prompt failed.
    #[error(transparent)]
    Prompt(#[from] PromptError),

    /// Partitioning, formatting, or mounting tool failed.
    #[error(transparent)]
    Tool(#[from] HostError),

    /// Label never showed up.
    #[error(transparent)]
    LabelTimeout(#[from] PollError),

    /// Label shows up, but for another partition.
    #[error("label {label:?} does not resolve to {expected:?}")]
    LabelMismatch { label: String, expected: PathBuf },

    /// Destructive steps skipped, but volumes are missing.
    #[error("destructive steps skipped, but labels {0:?} are missing")]
    LabelsMissing(Vec<String>),

    /// Mount point cannot be created.
    #[error("failed to create mount point {path:?}")]
    MountPoint {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = DiskError> = std::result::Result<T, E>;
