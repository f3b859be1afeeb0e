// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

mod integration;

use anyhow::Result;
use oxilab::{
    config::{HostPlan, RunOptions, Settings},
    host::{Host, HostError, Invocation, Result as HostResult},
};
use std::{
    fs,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

/// Fake machine that records every command it is asked to run.
///
/// Commands are matched by prefix against their display form. The first
/// matching rule decides the outcome. Unmatched commands succeed silently.
#[derive(Debug, Default)]
pub(crate) struct MockHost {
    calls: Mutex<Vec<String>>,
    rules: Vec<(String, std::result::Result<String, String>)>,
    writes: Vec<(String, PathBuf, String)>,
    block_devices: Vec<PathBuf>,
    by_label_dir: Option<PathBuf>,
}

impl MockHost {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Print output for commands starting with prefix.
    pub(crate) fn respond(mut self, prefix: impl Into<String>, output: impl Into<String>) -> Self {
        self.rules.push((prefix.into(), Ok(output.into())));
        self
    }

    /// Fail commands starting with prefix.
    pub(crate) fn fail(mut self, prefix: impl Into<String>, message: impl Into<String>) -> Self {
        self.rules.push((prefix.into(), Err(message.into())));
        self
    }

    /// Write file whenever a command starting with prefix runs.
    pub(crate) fn writes(
        mut self,
        prefix: impl Into<String>,
        path: impl Into<PathBuf>,
        contents: impl Into<String>,
    ) -> Self {
        self.writes.push((prefix.into(), path.into(), contents.into()));
        self
    }

    pub(crate) fn block_devices(mut self, paths: &[&str]) -> Self {
        self.block_devices = paths.iter().map(PathBuf::from).collect();
        self
    }

    /// Publish a by-label link whenever a filesystem is created.
    pub(crate) fn register_labels(mut self, by_label_dir: impl Into<PathBuf>) -> Self {
        self.by_label_dir = Some(by_label_dir.into());
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn register_label(&self, dir: &Path, cmd: &Invocation) -> std::io::Result<()> {
        let args = cmd
            .arguments()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        let label = args
            .iter()
            .position(|arg| arg == "-n" || arg == "-L")
            .and_then(|idx| args.get(idx + 1));
        let (Some(label), Some(partition)) = (label, args.last()) else {
            return Ok(());
        };

        let partition = PathBuf::from(partition);
        if let Some(parent) = partition.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&partition, "")?;

        fs::create_dir_all(dir)?;
        let link = dir.join(label);
        let _ = fs::remove_file(&link);
        symlink(std::env::current_dir()?.join(&partition), link)
    }
}

impl Host for MockHost {
    fn exec(&self, cmd: &Invocation) -> HostResult<String> {
        let line = cmd.to_string();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line.clone());
        }

        if let Some(dir) = &self.by_label_dir {
            if cmd.program().to_string_lossy().starts_with("mkfs") {
                self.register_label(dir, cmd).map_err(|err| HostError::Failed {
                    command: line.clone(),
                    message: err.to_string(),
                })?;
            }
        }

        for (prefix, path, contents) in &self.writes {
            if line.starts_with(prefix.as_str()) {
                if let Some(parent) = path.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                let _ = fs::write(path, contents);
            }
        }

        match self.rules.iter().find(|(prefix, _)| line.starts_with(prefix.as_str())) {
            Some((_, Ok(output))) => Ok(output.clone()),
            Some((_, Err(message))) => Err(HostError::Failed {
                command: line,
                message: message.clone(),
            }),
            None => Ok(String::new()),
        }
    }

    fn exec_interactive(&self, cmd: &Invocation) -> HostResult<()> {
        self.exec(cmd).map(|_| ())
    }

    fn is_block_device(&self, path: &Path) -> bool {
        self.block_devices.iter().any(|device| device == path)
    }
}

pub(crate) const DEVICES: [&str; 3] = ["dev/nvme0n1", "dev/sda", "dev/sdb"];

/// Home-lab plan rooted in the current directory.
pub(crate) fn lab_plan() -> HostPlan {
    let mut plan = HostPlan::default();
    let settings = &mut plan.settings;
    settings.domain = "example.com".into();
    settings.mount_root = PathBuf::from("mnt");
    settings.by_label_dir = PathBuf::from("dev/disk/by-label");
    settings.os_marker = PathBuf::from("etc/NIXOS");
    settings.secrets_dir = PathBuf::from("mnt/etc/secrets");
    settings.config_dir = PathBuf::from("mnt/etc/nixos");
    settings.cloudflared_dir = PathBuf::from("root/.cloudflared");
    settings.cache_dir = PathBuf::from("tmp/oxilab");

    plan.devices.system = PathBuf::from(DEVICES[0]);
    plan.devices.storage_a = PathBuf::from(DEVICES[1]);
    plan.devices.storage_b = PathBuf::from(DEVICES[2]);
    plan.devices.min_size_gib = 0;

    plan.template.local = Some(PathBuf::from("template"));
    plan
}

pub(crate) fn lab_settings(plan: HostPlan, options: RunOptions) -> Result<Settings> {
    let options = RunOptions {
        label_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
        ..options
    };
    Ok(Settings::new(plan, options)?)
}

/// Lay out configuration templates referencing the placeholder domain.
pub(crate) fn write_templates(root: impl AsRef<Path>) -> Result<()> {
    let root = root.as_ref();
    fs::create_dir_all(root.join("services"))?;
    fs::write(
        root.join("configuration.nix"),
        "{ networking.domain = \"yourdomain.com\"; }\n",
    )?;
    fs::write(
        root.join("services/nextcloud.nix"),
        "{ services.nextcloud.hostName = \"cloud.yourdomain.com\"; }\n",
    )?;
    fs::write(
        root.join("services/ollama.nix"),
        "{ virtualisation.oci-containers.containers.ollama.image = \"ollama\"; }\n",
    )?;
    fs::write(
        root.join("services/cloudflared.nix"),
        "{ services.cloudflared.tunnels.\"TUNNEL_ID_HOMELAB\".ingress = {\n  \
         \"chat.yourdomain.com\" = \"http://localhost:3000\";\n}; }\n",
    )?;
    Ok(())
}
