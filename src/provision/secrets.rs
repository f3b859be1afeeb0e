// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Secret collection.
//!
//! Gathers credentials from the operator and stores each one in its own file
//! beneath a directory only the privileged account can enter. Secrets are
//! created once and never rotated here.
//!
//! Entry is retried without limit: an empty value, or a confirmation that
//! does not match, simply asks again. A value is never defaulted.

use crate::{
    config::{SecretSpec, Settings},
    prompt::{PromptError, Prompter},
};

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    fs::{self, OpenOptions, Permissions},
    io::Write,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};
use tracing::{info, instrument, warn};

/// Permission mode of every secret file.
pub const SECRET_MODE: u32 = 0o600;

/// Permission mode of the secret directory.
pub const SECRET_DIR_MODE: u32 = 0o700;

/// Credential collected from the operator.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub value: String,
    pub path: PathBuf,
}

impl Debug for Secret {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("Secret")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .field("path", &self.path)
            .finish()
    }
}

/// Prompt until the operator supplies an acceptable value.
///
/// # Errors
///
/// - Return [`SecretError::Prompt`] if input cannot be read at all.
pub fn prompt_secret<P>(prompter: &P, spec: &SecretSpec) -> Result<String>
where
    P: Prompter + ?Sized,
{
    loop {
        let value = prompter.read_secret(&spec.name, &format!("enter {}", spec.name))?;
        if value.is_empty() {
            warn!("{} cannot be empty", spec.name);
            continue;
        }

        if !spec.confirm {
            return Ok(value);
        }

        let again = prompter.read_secret(&spec.name, &format!("confirm {}", spec.name))?;
        if again == value {
            return Ok(value);
        }

        warn!("entries for {} do not match, try again", spec.name);
    }
}

/// Collects and persists secrets.
pub struct SecretCollector<'a, P>
where
    P: Prompter + ?Sized,
{
    settings: &'a Settings,
    prompter: &'a P,
}

impl<'a, P> SecretCollector<'a, P>
where
    P: Prompter + ?Sized,
{
    /// Construct new secret collector.
    pub fn new(settings: &'a Settings, prompter: &'a P) -> Self {
        Self { settings, prompter }
    }

    /// Path of the file holding target secret.
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.settings.plan.settings.secrets_dir.join(name)
    }

    /// Check if every secret file exists and holds something.
    pub fn is_done(&self) -> bool {
        self.settings
            .plan
            .secrets
            .iter()
            .all(|spec| is_present(&self.path_of(&spec.name)))
    }

    /// Describe what [`Self::collect`] would do.
    pub fn plan(&self) -> Vec<String> {
        self.settings
            .plan
            .secrets
            .iter()
            .map(|spec| {
                format!(
                    "collect {} into {} (mode {SECRET_MODE:o})",
                    spec.name,
                    self.path_of(&spec.name).display()
                )
            })
            .collect()
    }

    /// Collect every missing secret, then lock down every secret file.
    ///
    /// Returns the secrets collected during this call. Secrets already on
    /// disk are left untouched.
    ///
    /// # Errors
    ///
    /// - Return [`SecretError::Prompt`] if operator input fails.
    /// - Return [`SecretError::Io`] if a secret cannot be written or its
    ///   permissions cannot be set.
    #[instrument(skip(self), level = "debug")]
    pub fn collect(&self) -> Result<Vec<Secret>> {
        let dir = &self.settings.plan.settings.secrets_dir;
        mkdirp::mkdirp(dir).map_err(|err| SecretError::io(err, dir))?;
        fs::set_permissions(dir, Permissions::from_mode(SECRET_DIR_MODE))
            .map_err(|err| SecretError::io(err, dir))?;

        let mut collected = Vec::new();
        for spec in &self.settings.plan.secrets {
            let path = self.path_of(&spec.name);
            if is_present(&path) {
                info!("secret {} already stored", spec.name);
                continue;
            }

            let value = prompt_secret(self.prompter, spec)?;
            write_secret(&path, &value)?;
            info!("stored secret {} at {}", spec.name, path.display());
            collected.push(Secret {
                name: spec.name.clone(),
                value,
                path,
            });
        }

        // INVARIANT: Final pass over every file, not just the ones written now.
        for spec in &self.settings.plan.secrets {
            let path = self.path_of(&spec.name);
            fs::set_permissions(&path, Permissions::from_mode(SECRET_MODE))
                .map_err(|err| SecretError::io(err, &path))?;
        }

        Ok(collected)
    }
}

fn is_present(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

/// Write value to a file readable only by its owner.
///
/// # Errors
///
/// - Return [`SecretError::Io`] if the file cannot be written.
pub fn write_secret(path: &Path, value: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(SECRET_MODE)
        .open(path)
        .map_err(|err| SecretError::io(err, path))?;
    file.write_all(value.as_bytes())
        .map_err(|err| SecretError::io(err, path))?;

    Ok(())
}

/// Secret collection error types.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// Operator input failed.
    #[error(transparent)]
    Prompt(#[from] PromptError),

    /// Secret storage failed.
    #[error("failed to store secret at {path:?}")]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

impl SecretError {
    fn io(source: std::io::Error, path: impl AsRef<Path>) -> Self {
        Self::Io {
            source,
            path: path.as_ref().to_path_buf(),
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = SecretError> = std::result::Result<T, E>;
