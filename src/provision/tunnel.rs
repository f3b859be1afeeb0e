// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Tunnel bootstrapping.
//!
//! Creates named tunnels with the tunneling provider's command-line tool,
//! moves each tunnel's credential file into secret storage, writes the
//! provider-assigned identifiers into the already rendered tunnel fragments,
//! and routes every public hostname to its tunnel.
//!
//! # Tunnel Record
//!
//! Identifiers are only ever printed once, by the create command. They are
//! kept in a small TOML record next to the credential files, so an
//! interrupted run can still finish rewriting fragments later.

use crate::{
    config::{Settings, TunnelSpec},
    host::{Host, HostError, Invocation},
    prompt::{PromptError, Prompter},
    provision::{
        install::{InstallError, Installer},
        materialize::render,
        secrets::{SECRET_DIR_MODE, SECRET_MODE},
    },
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, Permissions},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::LazyLock,
};
use tracing::{debug, info, instrument};

static TUNNEL_ID: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
});

/// Extract the provider-assigned identifier from create command output.
///
/// Takes the first UUID-shaped token.
///
/// # Errors
///
/// - Return [`TunnelError::NoIdentifier`] if output holds no such token.
pub fn extract_tunnel_id(output: &str) -> Result<String> {
    let pattern = TUNNEL_ID.as_ref().map_err(|err| TunnelError::Pattern(err.clone()))?;
    pattern
        .find(output)
        .map(|token| token.as_str().to_lowercase())
        .ok_or_else(|| TunnelError::NoIdentifier(output.trim().into()))
}

/// Bootstrapped tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub name: String,
    pub id: String,
    pub credentials: PathBuf,
    pub ingress: Vec<(String, u16)>,
}

/// Identifiers of created tunnels, keyed by tunnel name.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TunnelRecord {
    #[serde(default)]
    pub tunnels: BTreeMap<String, String>,
}

impl TunnelRecord {
    /// Load record, or start empty if there is none yet.
    ///
    /// # Errors
    ///
    /// - Return [`TunnelError::RecordParse`] if the record cannot be parsed.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(data) => toml::de::from_str(&data).map_err(TunnelError::RecordParse),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Persist record.
    ///
    /// # Errors
    ///
    /// - Return [`TunnelError::Io`] if the record cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = toml::ser::to_string_pretty(self).map_err(TunnelError::RecordWrite)?;
        fs::write(path, data).map_err(|err| TunnelError::io(err, path))?;
        fs::set_permissions(path, Permissions::from_mode(SECRET_MODE))
            .map_err(|err| TunnelError::io(err, path))
    }
}

/// Creates tunnels and wires them into the host configuration.
pub struct TunnelBootstrapper<'a, H, P>
where
    H: Host + ?Sized,
    P: Prompter + ?Sized,
{
    settings: &'a Settings,
    host: &'a H,
    prompter: &'a P,
}

impl<'a, H, P> TunnelBootstrapper<'a, H, P>
where
    H: Host + ?Sized,
    P: Prompter + ?Sized,
{
    /// Construct new tunnel bootstrapper.
    pub fn new(settings: &'a Settings, host: &'a H, prompter: &'a P) -> Self {
        Self {
            settings,
            host,
            prompter,
        }
    }

    fn store(&self) -> PathBuf {
        self.settings.plan.settings.secrets_dir.join("cloudflared")
    }

    fn record_path(&self) -> PathBuf {
        self.store().join("tunnels.toml")
    }

    /// Path of the credential file of target tunnel.
    pub fn credentials_of(&self, name: &str) -> PathBuf {
        self.store().join(format!("{name}.json"))
    }

    fn certificate(&self) -> PathBuf {
        self.settings.plan.settings.cloudflared_dir.join("cert.pem")
    }

    fn fragment_of(&self, spec: &TunnelSpec) -> PathBuf {
        self.settings.plan.settings.config_dir.join(&spec.fragment)
    }

    fn hostnames_of(&self, spec: &TunnelSpec) -> Vec<(String, u16)> {
        let settings = &self.settings.plan.settings;
        spec.ingress
            .iter()
            .map(|rule| {
                let hostname = render(&rule.hostname, &settings.placeholder_domain, &settings.domain);
                (hostname, rule.port)
            })
            .collect()
    }

    fn fragment_pending(&self, spec: &TunnelSpec) -> bool {
        fs::read_to_string(self.fragment_of(spec))
            .map(|content| content.contains(&spec.placeholder()))
            .unwrap_or(true)
    }

    /// Check if every tunnel is created and wired in.
    pub fn is_done(&self) -> bool {
        let Ok(record) = TunnelRecord::load(&self.record_path()) else {
            return false;
        };

        self.settings.plan.tunnels.iter().all(|spec| {
            record.tunnels.contains_key(&spec.name)
                && self.credentials_of(&spec.name).is_file()
                && !self.fragment_pending(spec)
        })
    }

    /// Describe what [`Self::apply`] would do.
    pub fn plan(&self) -> Vec<String> {
        let mut plan = vec![format!(
            "cloudflared tunnel login (unless {} exists)",
            self.certificate().display()
        )];
        for spec in &self.settings.plan.tunnels {
            plan.push(create_command(&spec.name).to_string());
            plan.push(format!(
                "copy credentials to {}",
                self.credentials_of(&spec.name).display()
            ));
            plan.push(format!(
                "replace {} in {}",
                spec.placeholder(),
                self.fragment_of(spec).display()
            ));
            for (hostname, _) in self.hostnames_of(spec) {
                plan.push(route_command(&spec.name, &hostname).to_string());
            }
        }
        plan.push(self.settings.plan.install.reapply.join(" "));

        plan
    }

    /// Log in if needed, then create, record, wire, and route every tunnel.
    ///
    /// # Errors
    ///
    /// - Return [`TunnelError::LoginIncomplete`] if no origin certificate
    ///   exists after login.
    /// - Return [`TunnelError::NoIdentifier`] if tunnel creation printed no
    ///   identifier.
    /// - Return [`TunnelError::Tool`] if the provider tool fails.
    /// - Return [`TunnelError::MissingCredentials`] if the provider did not
    ///   leave a credential file behind.
    /// - Return [`TunnelError::Reapply`] if configuration re-application
    ///   fails.
    #[instrument(skip(self), level = "debug")]
    pub fn apply(&self) -> Result<Vec<Tunnel>> {
        let store = self.store();
        mkdirp::mkdirp(&store).map_err(|err| TunnelError::io(err, &store))?;
        fs::set_permissions(&store, Permissions::from_mode(SECRET_DIR_MODE))
            .map_err(|err| TunnelError::io(err, &store))?;

        let mut record = TunnelRecord::load(&self.record_path())?;
        let needs_create = self
            .settings
            .plan
            .tunnels
            .iter()
            .any(|spec| !record.tunnels.contains_key(&spec.name));
        if needs_create {
            self.login()?;
        }

        let mut tunnels = Vec::new();
        let mut changed = false;
        for spec in &self.settings.plan.tunnels {
            let credentials = self.credentials_of(&spec.name);
            let id = match record.tunnels.get(&spec.name) {
                Some(id) if credentials.is_file() => {
                    debug!("tunnel {} already exists as {id}", spec.name);
                    id.clone()
                }
                _ => {
                    let id = self.create(spec)?;
                    record.tunnels.insert(spec.name.clone(), id.clone());
                    record.save(&self.record_path())?;
                    id
                }
            };

            changed |= self.rewrite_fragment(spec, &id)?;
            for (hostname, _) in self.hostnames_of(spec) {
                info!("route {hostname} to tunnel {}", spec.name);
                self.host.exec(&route_command(&spec.name, &hostname))?;
            }

            tunnels.push(Tunnel {
                name: spec.name.clone(),
                id,
                credentials,
                ingress: self.hostnames_of(spec),
            });
        }

        if changed {
            Installer::new(self.settings, self.host).reapply()?;
        }

        Ok(tunnels)
    }

    fn login(&self) -> Result<()> {
        let cert = self.certificate();
        if cert.is_file() {
            debug!("origin certificate {} present", cert.display());
            return Ok(());
        }

        info!("log in to the tunnel provider through the browser");
        self.host
            .exec_interactive(&Invocation::new("cloudflared").args(["tunnel", "login"]))?;
        self.prompter
            .acknowledge("finish the browser login, then continue")?;

        if !cert.is_file() {
            return Err(TunnelError::LoginIncomplete(cert));
        }

        Ok(())
    }

    fn create(&self, spec: &TunnelSpec) -> Result<String> {
        info!("create tunnel {}", spec.name);
        let output = self.host.exec(&create_command(&spec.name))?;
        let id = extract_tunnel_id(&output)?;
        info!("tunnel {} has identifier {id}", spec.name);

        let cached = self
            .settings
            .plan
            .settings
            .cloudflared_dir
            .join(format!("{id}.json"));
        if !cached.is_file() {
            return Err(TunnelError::MissingCredentials(cached));
        }

        let credentials = self.credentials_of(&spec.name);
        fs::copy(&cached, &credentials).map_err(|err| TunnelError::io(err, &credentials))?;
        fs::set_permissions(&credentials, Permissions::from_mode(SECRET_MODE))
            .map_err(|err| TunnelError::io(err, &credentials))?;

        Ok(id)
    }

    fn rewrite_fragment(&self, spec: &TunnelSpec, id: &str) -> Result<bool> {
        let fragment = self.fragment_of(spec);
        let content =
            fs::read_to_string(&fragment).map_err(|err| TunnelError::io(err, &fragment))?;
        let placeholder = spec.placeholder();
        if !content.contains(&placeholder) {
            return Ok(false);
        }

        fs::write(&fragment, content.replace(&placeholder, id))
            .map_err(|err| TunnelError::io(err, &fragment))?;
        info!("wrote tunnel {} identifier into {}", spec.name, fragment.display());

        Ok(true)
    }
}

fn create_command(name: &str) -> Invocation {
    Invocation::new("cloudflared").args(["tunnel", "create"]).arg(name)
}

fn route_command(name: &str, hostname: &str) -> Invocation {
    Invocation::new("cloudflared")
        .args(["tunnel", "route", "dns", "--overwrite-dns"])
        .arg(name)
        .arg(hostname)
}

/// Tunnel bootstrapping error types.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Create command printed no identifier.
    #[error("tunnel creation printed no identifier, check provider login: {0:?}")]
    NoIdentifier(String),

    /// Browser login did not leave a certificate behind.
    #[error("provider login incomplete, {0:?} is missing")]
    LoginIncomplete(PathBuf),

    /// Provider did not write the tunnel's credential file.
    #[error("tunnel credential file {0:?} is missing")]
    MissingCredentials(PathBuf),

    /// Provider tool failed.
    #[error(transparent)]
    Tool(#[from] HostError),

    /// Operator input failed.
    #[error(transparent)]
    Prompt(#[from] PromptError),

    /// Tunnel record cannot be parsed.
    #[error(transparent)]
    RecordParse(toml::de::Error),

    /// Tunnel record cannot be serialized.
    #[error(transparent)]
    RecordWrite(toml::ser::Error),

    /// Configuration re-application failed.
    #[error(transparent)]
    Reapply(#[from] InstallError),

    /// Identifier pattern failed to compile.
    #[error(transparent)]
    Pattern(regex::Error),

    /// File I/O failed.
    #[error("failed to access {path:?}")]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

impl TunnelError {
    fn io(source: std::io::Error, path: impl AsRef<Path>) -> Self {
        Self::Io {
            source,
            path: path.as_ref().to_path_buf(),
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = TunnelError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn extract_tunnel_id_from_create_output() -> anyhow::Result<()> {
        let output = indoc! {"
            Tunnel credentials written to /root/.cloudflared/6ff42ae2-765d-4adf-8112-31c55c1551ef.json.
            Created tunnel homelab with id 6ff42ae2-765d-4adf-8112-31c55c1551ef
        "};
        let id = extract_tunnel_id(output)?;
        assert_eq!(id, "6ff42ae2-765d-4adf-8112-31c55c1551ef");
        assert_eq!(id.len(), 36);
        Ok(())
    }

    #[test]
    fn extract_tunnel_id_normalizes_case() -> anyhow::Result<()> {
        let id = extract_tunnel_id("id 6FF42AE2-765D-4ADF-8112-31C55C1551EF")?;
        assert_eq!(id, "6ff42ae2-765d-4adf-8112-31c55c1551ef");
        Ok(())
    }

    #[test]
    fn extract_tunnel_id_without_token_fails() {
        let result = extract_tunnel_id("error: you must log in first\n");
        assert!(matches!(result, Err(TunnelError::NoIdentifier(output)) if output.contains("log in")));
    }

    #[test]
    fn extract_tunnel_id_ignores_short_tokens() {
        let result = extract_tunnel_id("6ff42ae2-765d-4adf-8112-31c55c15");
        assert!(matches!(result, Err(TunnelError::NoIdentifier(_))));
    }
}
