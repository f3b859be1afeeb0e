// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for external files that need to be
//! interacted with, or managed in some way.

use std::path::{Path, PathBuf};

/// Determine default absolute path to the host plan file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/oxilab/plan.toml` as the
/// default absolute path for a host plan. Does not check if the path returned
/// actually exists.
///
/// # Errors
///
/// - Return [`PathError::NoWayHome`] if home directory path cannot be
///   determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_plan_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("oxilab").join("plan.toml"))
        .ok_or(PathError::NoWayHome)
}

/// Perform shell expansion on a path.
///
/// Expands leading tildes and environment variables, e.g., `~/.cloudflared`
/// or `$HOME/.cloudflared`.
///
/// # Errors
///
/// - Return [`PathError::ShellExpansion`] if a referenced variable is unset.
pub fn expand(path: impl AsRef<Path>) -> Result<PathBuf> {
    let raw = path.as_ref().to_string_lossy();
    let expanded = shellexpand::full(raw.as_ref())?;
    Ok(PathBuf::from(expanded.into_owned()))
}

/// Join a possibly absolute path beneath a root directory.
///
/// `rooted("/mnt", "/etc/nixos")` yields `/mnt/etc/nixos`, unlike
/// [`Path::join`] which would discard the root.
pub fn rooted(root: impl AsRef<Path>, path: impl AsRef<Path>) -> PathBuf {
    let relative = path
        .as_ref()
        .strip_prefix("/")
        .unwrap_or_else(|_| path.as_ref());
    root.as_ref().join(relative)
}

/// Path resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    /// No way to determine user's home directory.
    #[error("cannot determine absolute path to user's home directory")]
    NoWayHome,

    /// Failed to perform shell expansion on a path.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

/// Friendly result alias :3
pub type Result<T, E = PathError> = std::result::Result<T, E>;
