// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the __host plan__, the one document describing the
//! machine Oxilab provisions: which disks to use and how to label them,
//! where configuration templates come from, which containers run, which
//! secrets to collect, and which tunnels to bootstrap. File I/O is left to the
//! caller to figure out.
//!
//! Runtime switches that are not part of the machine description, e.g.,
//! dry-run, live in [`RunOptions`]. Both are bundled into [`Settings`], which
//! is built once at start-up and handed to every provisioning step.

use crate::path::expand;

use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Everything a provisioning step needs to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Machine description.
    pub plan: HostPlan,

    /// Runtime switches.
    pub options: RunOptions,
}

impl Settings {
    /// Construct new settings, validating the host plan.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError`] if the host plan is inconsistent.
    pub fn new(plan: HostPlan, options: RunOptions) -> Result<Self> {
        plan.validate()?;
        Ok(Self { plan, options })
    }
}

/// Runtime switches for a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Report what would happen without touching anything.
    pub dry_run: bool,

    /// Never partition or format, only mount what already exists.
    pub skip_destructive: bool,

    /// Never ask the operator; destructive steps proceed unconfirmed.
    pub force_noninteractive: bool,

    /// How long to wait for filesystem labels to register.
    pub label_timeout: Duration,

    /// Delay between readiness probes.
    pub poll_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            skip_destructive: false,
            force_noninteractive: false,
            label_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Values taken from the environment that override the host plan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Overrides {
    pub system_device: Option<PathBuf>,
    pub storage_a_device: Option<PathBuf>,
    pub storage_b_device: Option<PathBuf>,
    pub template_url: Option<String>,
    pub domain: Option<String>,
}

/// Host plan layout.
///
/// # General Layout
///
/// A host plan is composed of a handful of tables: general settings, device
/// layout, template source, installation commands, and model warm-up. These
/// are followed by arrays of services, secrets, and tunnels.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HostPlan {
    /// General settings.
    pub settings: PlanSettings,

    /// Block devices to provision.
    pub devices: DeviceLayout,

    /// Where configuration fragments come from.
    pub template: TemplateSource,

    /// Operating system installation commands.
    pub install: InstallSettings,

    /// Inference server warm-up.
    pub models: ModelSettings,

    /// Containers the installed host runs.
    #[serde(rename = "service")]
    pub services: Vec<ServiceDescriptor>,

    /// Credentials to collect from the operator.
    #[serde(rename = "secret")]
    pub secrets: Vec<SecretSpec>,

    /// Tunnels to bootstrap with the tunneling provider.
    #[serde(rename = "tunnel")]
    pub tunnels: Vec<TunnelSpec>,
}

impl HostPlan {
    /// Apply environment overrides.
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(path) = overrides.system_device {
            self.devices.system = path;
        }

        if let Some(path) = overrides.storage_a_device {
            self.devices.storage_a = path;
        }

        if let Some(path) = overrides.storage_b_device {
            self.devices.storage_b = path;
        }

        if let Some(url) = overrides.template_url {
            self.template.url = Some(url);
        }

        if let Some(domain) = overrides.domain {
            self.settings.domain = domain;
        }
    }

    /// Check plan for internal consistency.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::DuplicateLabel`] if two roles share a label.
    /// - Return [`ConfigError::InvalidLabel`] if a label is empty or too long
    ///   for its filesystem.
    /// - Return [`ConfigError::DuplicateTunnel`] if two tunnels share a name.
    /// - Return [`ConfigError::EmptyIngress`] if a tunnel exposes nothing.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for role in DeviceRole::ALL {
            let label = self.devices.labels.get(role);
            let filesystem = self.devices.filesystem(role);
            if label.is_empty() || label.len() > filesystem.max_label_len() {
                return Err(ConfigError::InvalidLabel {
                    label: label.into(),
                    filesystem,
                });
            }

            if !seen.insert(label) {
                return Err(ConfigError::DuplicateLabel(label.into()));
            }
        }

        let mut seen = HashSet::new();
        for tunnel in &self.tunnels {
            if !seen.insert(tunnel.name.as_str()) {
                return Err(ConfigError::DuplicateTunnel(tunnel.name.clone()));
            }

            if tunnel.ingress.is_empty() {
                return Err(ConfigError::EmptyIngress(tunnel.name.clone()));
            }
        }

        Ok(())
    }

    /// Find service by name.
    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|service| service.name == name)
    }
}

impl Default for HostPlan {
    fn default() -> Self {
        Self {
            settings: PlanSettings::default(),
            devices: DeviceLayout::default(),
            template: TemplateSource::default(),
            install: InstallSettings::default(),
            models: ModelSettings::default(),
            services: vec![
                ServiceDescriptor {
                    name: "ollama".into(),
                    image: "docker.io/ollama/ollama:latest".into(),
                    ports: vec!["127.0.0.1:11434:11434".into()],
                    volumes: vec!["/srv/storage/ollama:/root/.ollama".into()],
                    start: StartPolicy::Auto,
                    unit: None,
                },
                ServiceDescriptor {
                    name: "open-webui".into(),
                    image: "ghcr.io/open-webui/open-webui:main".into(),
                    ports: vec!["127.0.0.1:3000:8080".into()],
                    volumes: vec!["/srv/storage/open-webui:/app/backend/data".into()],
                    start: StartPolicy::Auto,
                    unit: None,
                },
                ServiceDescriptor {
                    name: "nextcloud".into(),
                    image: "docker.io/library/nextcloud:stable".into(),
                    ports: vec!["127.0.0.1:8080:80".into()],
                    volumes: vec!["/srv/storage/nextcloud:/var/www/html".into()],
                    start: StartPolicy::Auto,
                    unit: None,
                },
            ],
            secrets: vec![
                SecretSpec {
                    name: "nextcloud-admin-pass".into(),
                    confirm: true,
                },
                SecretSpec {
                    name: "nextcloud-db-pass".into(),
                    confirm: true,
                },
                SecretSpec {
                    name: "open-webui-secret-key".into(),
                    confirm: false,
                },
            ],
            tunnels: vec![TunnelSpec {
                name: "homelab".into(),
                fragment: PathBuf::from("services/cloudflared.nix"),
                placeholder: None,
                unit: None,
                ingress: vec![
                    IngressRule {
                        hostname: "chat.yourdomain.com".into(),
                        port: 3000,
                    },
                    IngressRule {
                        hostname: "cloud.yourdomain.com".into(),
                        port: 8080,
                    },
                ],
            }],
        }
    }
}

impl FromStr for HostPlan {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut plan: HostPlan = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        let settings = &mut plan.settings;
        for path in [
            &mut settings.mount_root,
            &mut settings.by_label_dir,
            &mut settings.os_marker,
            &mut settings.secrets_dir,
            &mut settings.config_dir,
            &mut settings.cloudflared_dir,
            &mut settings.cache_dir,
        ] {
            *path = expand(&*path)?;
        }

        if let Some(local) = plan.template.local.as_mut() {
            *local = expand(&*local)?;
        }

        Ok(plan)
    }
}

impl Display for HostPlan {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// General host settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlanSettings {
    /// Externally visible domain name.
    pub domain: String,

    /// Domain token used in templates, replaced by [`Self::domain`].
    pub placeholder_domain: String,

    /// Where the target root filesystem gets mounted.
    pub mount_root: PathBuf,

    /// Directory where the device manager publishes label symlinks.
    pub by_label_dir: PathBuf,

    /// File whose presence identifies the expected installer environment.
    pub os_marker: PathBuf,

    /// Host probed to establish network reachability.
    pub probe_host: String,

    /// Root-only directory holding one file per secret.
    pub secrets_dir: PathBuf,

    /// Directory that receives rendered configuration fragments.
    pub config_dir: PathBuf,

    /// Tunnel provider's local credential cache.
    pub cloudflared_dir: PathBuf,

    /// Scratch space for fetched templates.
    pub cache_dir: PathBuf,

    /// Service manager unit of the container runtime.
    pub runtime_unit: String,
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            domain: "yourdomain.com".into(),
            placeholder_domain: "yourdomain.com".into(),
            mount_root: PathBuf::from("/mnt"),
            by_label_dir: PathBuf::from("/dev/disk/by-label"),
            os_marker: PathBuf::from("/etc/NIXOS"),
            probe_host: "1.1.1.1".into(),
            secrets_dir: PathBuf::from("/mnt/etc/secrets"),
            config_dir: PathBuf::from("/mnt/etc/nixos"),
            cloudflared_dir: PathBuf::from("/root/.cloudflared"),
            cache_dir: PathBuf::from("/tmp/oxilab"),
            runtime_unit: "podman.service".into(),
        }
    }
}

/// Role a volume plays on the provisioned host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceRole {
    Boot,
    Root,
    BulkStorageA,
    BulkStorageB,
}

impl DeviceRole {
    /// Every role, in partitioning order.
    pub const ALL: [DeviceRole; 4] = [
        DeviceRole::Boot,
        DeviceRole::Root,
        DeviceRole::BulkStorageA,
        DeviceRole::BulkStorageB,
    ];

    /// Mount point relative to the target root.
    pub fn mount_point(&self) -> &'static Path {
        match self {
            Self::Boot => Path::new("boot"),
            Self::Root => Path::new(""),
            Self::BulkStorageA => Path::new("srv/storage"),
            Self::BulkStorageB => Path::new("srv/backup"),
        }
    }

    /// Position in mount order.
    ///
    /// Root comes first, because every other mount point lives beneath it.
    pub fn mount_rank(&self) -> u8 {
        match self {
            Self::Root => 0,
            Self::Boot => 1,
            Self::BulkStorageA => 2,
            Self::BulkStorageB => 3,
        }
    }
}

impl Display for DeviceRole {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(match self {
            Self::Boot => "boot",
            Self::Root => "root",
            Self::BulkStorageA => "bulk-storage-a",
            Self::BulkStorageB => "bulk-storage-b",
        })
    }
}

/// Filesystem types the provisioner knows how to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Filesystem {
    Vfat,
    Ext4,
    Xfs,
}

impl Filesystem {
    /// Longest label the filesystem accepts.
    pub fn max_label_len(&self) -> usize {
        match self {
            Self::Vfat => 11,
            Self::Ext4 => 16,
            Self::Xfs => 12,
        }
    }
}

impl Display for Filesystem {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(match self {
            Self::Vfat => "vfat",
            Self::Ext4 => "ext4",
            Self::Xfs => "xfs",
        })
    }
}

/// Block device layout.
///
/// The system device carries an EFI partition and the root partition. Each
/// storage device carries one partition spanning the whole disk.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceLayout {
    /// Device receiving boot and root partitions.
    pub system: PathBuf,

    /// First bulk storage device.
    pub storage_a: PathBuf,

    /// Second bulk storage device.
    pub storage_b: PathBuf,

    /// Size of the EFI partition in `sgdisk` notation.
    pub boot_size: String,

    /// Smallest acceptable device size.
    pub min_size_gib: u64,

    /// Root filesystem type.
    pub root_filesystem: Filesystem,

    /// Bulk storage filesystem type.
    pub storage_filesystem: Filesystem,

    /// Filesystem label per role.
    pub labels: VolumeLabels,
}

impl DeviceLayout {
    /// Filesystem used for target role.
    pub fn filesystem(&self, role: DeviceRole) -> Filesystem {
        match role {
            DeviceRole::Boot => Filesystem::Vfat,
            DeviceRole::Root => self.root_filesystem,
            DeviceRole::BulkStorageA | DeviceRole::BulkStorageB => self.storage_filesystem,
        }
    }
}

impl Default for DeviceLayout {
    fn default() -> Self {
        Self {
            system: PathBuf::from("/dev/nvme0n1"),
            storage_a: PathBuf::from("/dev/sda"),
            storage_b: PathBuf::from("/dev/sdb"),
            boot_size: "1G".into(),
            min_size_gib: 16,
            root_filesystem: Filesystem::Ext4,
            storage_filesystem: Filesystem::Ext4,
            labels: VolumeLabels::default(),
        }
    }
}

/// Filesystem labels for each device role.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VolumeLabels {
    pub boot: String,
    pub root: String,
    pub storage_a: String,
    pub storage_b: String,
}

impl VolumeLabels {
    /// Label for target role.
    pub fn get(&self, role: DeviceRole) -> &str {
        match role {
            DeviceRole::Boot => self.boot.as_str(),
            DeviceRole::Root => self.root.as_str(),
            DeviceRole::BulkStorageA => self.storage_a.as_str(),
            DeviceRole::BulkStorageB => self.storage_b.as_str(),
        }
    }
}

impl Default for VolumeLabels {
    fn default() -> Self {
        Self {
            boot: "BOOT".into(),
            root: "nixos".into(),
            storage_a: "storage".into(),
            storage_b: "backup".into(),
        }
    }
}

/// Source of configuration templates.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TemplateSource {
    /// Remote Git repository holding the templates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Branch to check out instead of the default branch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Local directory used when the remote cannot be fetched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<PathBuf>,

    /// Glob patterns, relative to the template root, of fragments to copy.
    pub fragments: Vec<String>,
}

impl Default for TemplateSource {
    fn default() -> Self {
        Self {
            url: None,
            branch: None,
            local: None,
            fragments: vec!["configuration.nix".into(), "services/*.nix".into()],
        }
    }
}

/// Operating system installation commands.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InstallSettings {
    /// Generates hardware descriptors for the mounted target.
    pub generate: Vec<String>,

    /// Hardware descriptor produced by [`Self::generate`], relative to the
    /// configuration directory.
    pub hardware_config: PathBuf,

    /// Installs the operating system onto the mounted target.
    pub install: Vec<String>,

    /// Re-applies configuration after fragments change.
    pub reapply: Vec<String>,

    /// Rebuilds the running, installed system.
    pub rebuild: Vec<String>,

    /// File, relative to the mount root, present once installation succeeded.
    pub installed_marker: PathBuf,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            generate: argv(["nixos-generate-config", "--root", "/mnt"]),
            hardware_config: PathBuf::from("hardware-configuration.nix"),
            install: argv(["nixos-install", "--root", "/mnt", "--no-root-passwd"]),
            reapply: argv([
                "nixos-install",
                "--root",
                "/mnt",
                "--no-root-passwd",
                "--no-bootloader",
            ]),
            rebuild: argv(["nixos-rebuild", "switch"]),
            installed_marker: PathBuf::from("etc/NIXOS"),
        }
    }
}

/// Inference server warm-up settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Base URL of the inference server.
    pub endpoint: String,

    /// Models to download.
    pub models: Vec<String>,

    /// Seconds to wait for the endpoint to answer.
    pub timeout_secs: u64,

    /// Run warm-up as part of provisioning.
    pub pull_on_provision: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434".into(),
            models: vec!["llama3.2".into(), "nomic-embed-text".into()],
            timeout_secs: 120,
            pull_on_provision: false,
        }
    }
}

/// When a service starts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPolicy {
    #[default]
    Auto,
    Manual,
}

/// Container the installed host runs.
#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ServiceDescriptor {
    /// Name of the service.
    pub name: String,

    /// Container image reference.
    pub image: String,

    /// Port bindings in `[address:]host:container` form.
    #[serde(default)]
    pub ports: Vec<String>,

    /// Volume bindings in `host:container` form.
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Start policy.
    #[serde(default)]
    pub start: StartPolicy,

    /// Service manager unit, defaults to `podman-<name>.service`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl ServiceDescriptor {
    /// Service manager unit running the container.
    pub fn unit(&self) -> String {
        self.unit
            .clone()
            .unwrap_or_else(|| format!("podman-{}.service", self.name))
    }
}

/// Credential collected from the operator.
#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct SecretSpec {
    /// Name of the secret, also its file name.
    pub name: String,

    /// Require the value be entered twice.
    #[serde(default)]
    pub confirm: bool,
}

/// Tunnel to bootstrap.
#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct TunnelSpec {
    /// Name of the tunnel at the provider.
    pub name: String,

    /// Configuration fragment consuming the tunnel identifier, relative to
    /// the configuration directory.
    pub fragment: PathBuf,

    /// Token in the fragment replaced by the tunnel identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,

    /// Service manager unit running the tunnel client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Hostname to local port mapping.
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
}

impl TunnelSpec {
    /// Token in the fragment replaced by the tunnel identifier.
    ///
    /// Defaults to `TUNNEL_ID_<NAME>`.
    pub fn placeholder(&self) -> String {
        self.placeholder.clone().unwrap_or_else(|| {
            format!("TUNNEL_ID_{}", self.name.to_uppercase().replace('-', "_"))
        })
    }

    /// Service manager unit running the tunnel client.
    pub fn unit(&self) -> String {
        self.unit
            .clone()
            .unwrap_or_else(|| format!("cloudflared-tunnel-{}.service", self.name))
    }
}

/// Public hostname forwarded to a local port.
#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct IngressRule {
    pub hostname: String,
    pub port: u16,
}

fn argv<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] crate::path::PathError),

    /// Two device roles share one label.
    #[error("filesystem label {0:?} is used by more than one device role")]
    DuplicateLabel(String),

    /// Label cannot be applied to its filesystem.
    #[error("filesystem label {label:?} is empty or too long for {filesystem}")]
    InvalidLabel {
        label: String,
        filesystem: Filesystem,
    },

    /// Two tunnels share one name.
    #[error("tunnel {0:?} is declared more than once")]
    DuplicateTunnel(String),

    /// Tunnel without any ingress rule.
    #[error("tunnel {0:?} has no ingress rules")]
    EmptyIngress(String),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;
