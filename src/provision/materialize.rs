// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration materialization.
//!
//! Copies the named configuration fragments of a template into the target
//! configuration directory, replacing the placeholder domain with the real
//! one on the way.
//!
//! # Template Sources
//!
//! Templates normally live in a remote Git repository that gets cloned into a
//! cache directory. A clone left over from an earlier run is reused as is. If
//! the remote cannot be fetched, a local directory is used instead. Without a
//! local fallback the operator is asked to place the fragments into the
//! target directory by hand, and the placeholder substitution is then applied
//! to those files in place.
//!
//! # Domain
//!
//! A plan whose domain still equals the placeholder names no real domain.
//! The operator is asked for one before anything gets rendered.

use crate::{
    config::Settings,
    prompt::{PromptError, Prompter},
};

use auth_git2::{GitAuthenticator, Prompter as GitPrompter};
use git2::{build::RepoBuilder, Config, FetchOptions, RemoteCallbacks, Repository};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use std::{
    fs::{read_to_string, write},
    path::{Path, PathBuf},
    time,
};
use tracing::{debug, info, instrument, warn};

/// Replace every occurrence of the placeholder domain.
pub fn render(content: &str, placeholder: &str, domain: &str) -> String {
    if placeholder.is_empty() {
        return content.to_string();
    }

    content.replace(placeholder, domain)
}

/// Renders configuration fragments into the target directory.
pub struct ConfigMaterializer<'a, P>
where
    P: Prompter + ?Sized,
{
    settings: &'a Settings,
    prompter: &'a P,
}

impl<'a, P> ConfigMaterializer<'a, P>
where
    P: Prompter + ?Sized,
{
    /// Construct new configuration materializer.
    pub fn new(settings: &'a Settings, prompter: &'a P) -> Self {
        Self { settings, prompter }
    }

    fn placeholder(&self) -> &str {
        let settings = &self.settings.plan.settings;
        // INVARIANT: A placeholder equal to the domain means nothing to do.
        if settings.placeholder_domain == settings.domain {
            ""
        } else {
            settings.placeholder_domain.as_str()
        }
    }

    /// Ask the operator for the real domain if the plan lacks one.
    ///
    /// Returns [`None`] if the plan already names a domain other than the
    /// placeholder. Otherwise asks until the answer is non-empty and differs
    /// from the placeholder.
    ///
    /// # Errors
    ///
    /// - Return [`MaterializeError::Prompt`] if the operator cannot be asked.
    pub fn resolve_domain(&self) -> Result<Option<String>> {
        let settings = &self.settings.plan.settings;
        if settings.domain != settings.placeholder_domain {
            return Ok(None);
        }

        warn!("no domain given, templates still use {:?}", settings.placeholder_domain);
        loop {
            let answer = self.prompter.read_line("domain name of this host")?;
            let answer = answer.trim();
            if answer.is_empty() || answer == settings.placeholder_domain {
                warn!("domain must be non-empty and differ from {:?}", settings.placeholder_domain);
                continue;
            }

            return Ok(Some(answer.to_string()));
        }
    }

    fn cached_clone(&self) -> PathBuf {
        self.settings.plan.settings.cache_dir.join("template")
    }

    /// Check if every fragment is rendered.
    ///
    /// Fragments are discovered in the target directory, so only a target
    /// holding at least one match per pattern and no placeholder counts.
    pub fn is_done(&self) -> bool {
        let target = &self.settings.plan.settings.config_dir;
        let placeholder = self.placeholder();
        let Ok(fragments) = resolve_fragments(target, &self.settings.plan.template.fragments) else {
            return false;
        };

        fragments.iter().all(|fragment| match read_to_string(target.join(fragment)) {
            Ok(content) => placeholder.is_empty() || !content.contains(placeholder),
            Err(_) => false,
        })
    }

    /// Describe what [`Self::apply`] would do.
    pub fn plan(&self) -> Vec<String> {
        let template = &self.settings.plan.template;
        let settings = &self.settings.plan.settings;
        let mut plan = Vec::new();
        match (&template.url, &template.local) {
            (Some(url), _) => plan.push(format!(
                "fetch templates from {url} into {}",
                self.cached_clone().display()
            )),
            (None, Some(local)) => plan.push(format!("use templates in {}", local.display())),
            (None, None) => plan.push("ask operator to place templates by hand".into()),
        }

        for pattern in &template.fragments {
            plan.push(format!(
                "copy {pattern} into {} replacing {:?} with {:?}",
                settings.config_dir.display(),
                settings.placeholder_domain,
                settings.domain
            ));
        }

        plan
    }

    /// Copy and render every fragment.
    ///
    /// # Errors
    ///
    /// - Return [`MaterializeError::MissingFragment`] if a fragment pattern
    ///   matches nothing.
    /// - Return [`MaterializeError::Prompt`] if the operator did not
    ///   acknowledge manual placement.
    /// - Return [`MaterializeError::Read`] or [`MaterializeError::Write`] on
    ///   file I/O failure.
    #[instrument(skip(self), level = "debug")]
    pub fn apply(&self) -> Result<()> {
        let target = self.settings.plan.settings.config_dir.clone();
        let patterns = &self.settings.plan.template.fragments;
        mkdirp::mkdirp(&target).map_err(|err| MaterializeError::Write {
            source: err,
            path: target.clone(),
        })?;

        let fragments = match self.source()? {
            Some(source) => {
                let fragments = resolve_fragments(&source, patterns)?;
                for fragment in &fragments {
                    self.copy(&source.join(fragment), &target.join(fragment))?;
                }
                fragments
            }
            None => {
                let fragments = resolve_fragments(&target, patterns)?;
                for fragment in &fragments {
                    let path = target.join(fragment);
                    self.copy(&path, &path)?;
                }
                fragments
            }
        };

        info!(
            "rendered {} fragment(s) into {} for {}",
            fragments.len(),
            target.display(),
            self.settings.plan.settings.domain
        );
        Ok(())
    }

    /// Determine directory holding templates.
    ///
    /// Returns [`None`] if the operator placed the files by hand.
    fn source(&self) -> Result<Option<PathBuf>> {
        let template = &self.settings.plan.template;
        if let Some(url) = &template.url {
            let dest = self.cached_clone();
            if Repository::open(&dest).is_ok() {
                info!("reuse template clone at {}", dest.display());
                return Ok(Some(dest));
            }

            match fetch_template(url, template.branch.as_deref(), &dest, ProgressBar::new(0)) {
                Ok(()) => return Ok(Some(dest)),
                Err(err) => {
                    warn!("cannot fetch templates from {url}: {err}");
                    // INVARIANT: Never leave a half-cloned template behind.
                    if let Err(err) = std::fs::remove_dir_all(&dest) {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            warn!("cannot remove partial clone at {}: {err}", dest.display());
                        }
                    }
                }
            }
        }

        if let Some(local) = &template.local {
            if local.is_dir() {
                info!("use local templates at {}", local.display());
                return Ok(Some(local.clone()));
            }
            warn!("local template directory {} does not exist", local.display());
        }

        let target = &self.settings.plan.settings.config_dir;
        warn!("no template source available");
        self.prompter.acknowledge(&format!(
            "place {} into {} by hand, then continue",
            template.fragments.join(", "),
            target.display()
        ))?;

        Ok(None)
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        let content = read_to_string(from).map_err(|err| MaterializeError::Read {
            source: err,
            path: from.to_path_buf(),
        })?;
        let rendered = render(
            &content,
            self.placeholder(),
            &self.settings.plan.settings.domain,
        );

        if let Some(parent) = to.parent() {
            mkdirp::mkdirp(parent).map_err(|err| MaterializeError::Write {
                source: err,
                path: parent.to_path_buf(),
            })?;
        }

        write(to, rendered.as_bytes()).map_err(|err| MaterializeError::Write {
            source: err,
            path: to.to_path_buf(),
        })?;
        debug!("rendered {}", to.display());

        Ok(())
    }
}

/// Expand fragment glob patterns relative to a root directory.
///
/// Returns paths relative to the root, sorted.
///
/// # Errors
///
/// - Return [`MaterializeError::MissingFragment`] if a pattern matches no
///   file.
/// - Return [`MaterializeError::Pattern`] if a pattern is malformed.
pub fn resolve_fragments(root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut fragments = Vec::new();
    for pattern in patterns {
        let full = root.join(pattern);
        let mut matched = glob::glob(full.to_string_lossy().as_ref())?
            .filter_map(std::result::Result::ok)
            .filter(|path| path.is_file())
            .filter_map(|path| path.strip_prefix(root).ok().map(Path::to_path_buf))
            .collect::<Vec<_>>();

        if matched.is_empty() {
            return Err(MaterializeError::MissingFragment {
                pattern: pattern.clone(),
                root: root.to_path_buf(),
            });
        }

        fragments.append(&mut matched);
    }

    fragments.sort();
    fragments.dedup();
    Ok(fragments)
}

/// Clone template repository.
///
/// The progress of the clone is displayed through a progress bar. If the
/// remote requires credentials, the user is prompted for them and the
/// progress bar is suspended for the input.
///
/// # Errors
///
/// - Return [`MaterializeError::Git2`] if libgit2 operations fail.
pub fn fetch_template(
    url: &str,
    branch: Option<&str>,
    dest: &Path,
    bar: ProgressBar,
) -> Result<()> {
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
    )?
    .progress_chars("-Cco.");
    bar.set_style(style);
    bar.set_message(url.to_string());
    bar.enable_steady_tick(time::Duration::from_millis(100));

    let prompter = IndicatifPrompter::new(bar);
    let authenticator = GitAuthenticator::default().set_prompter(prompter.clone());
    let config = Config::open_default()?;

    let mut throttle = time::Instant::now();
    let mut rc = RemoteCallbacks::new();
    rc.credentials(authenticator.credentials(&config));
    rc.transfer_progress(|progress| {
        if throttle.elapsed() > time::Duration::from_millis(10) {
            throttle = time::Instant::now();
            prompter.bar.set_length(progress.total_objects() as u64);
            prompter.bar.set_position(progress.received_objects() as u64);
        }
        true
    });

    let mut fo = FetchOptions::new();
    fo.remote_callbacks(rc);
    let mut builder = RepoBuilder::new();
    builder.fetch_options(fo);
    if let Some(branch) = branch {
        builder.branch(branch);
    }

    let result = builder.clone(url, dest);
    prompter.bar.finish_and_clear();
    result?;
    info!("fetched templates from {url}");

    Ok(())
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    pub(crate) bar: ProgressBar,
}

impl IndicatifPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl GitPrompter for IndicatifPrompter {
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| -> Option<(String, String)> {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| {
            Password::new("passphrase")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}

/// Configuration materialization error types.
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    /// Fragment pattern matched nothing.
    #[error("no fragment matches {pattern:?} under {root:?}")]
    MissingFragment { pattern: String, root: PathBuf },

    /// Fragment pattern is malformed.
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    /// Fragment cannot be read.
    #[error("failed to read {path:?}")]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Fragment cannot be written.
    #[error("failed to write {path:?}")]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Operator did not complete manual placement.
    #[error(transparent)]
    Prompt(#[from] PromptError),

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = MaterializeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[test]
    fn render_replaces_every_placeholder() {
        let content = indoc! {r#"
            services.nextcloud.hostName = "cloud.yourdomain.com";
            trusted_domains = [ "yourdomain.com" ];
        "#};
        let expect = indoc! {r#"
            services.nextcloud.hostName = "cloud.example.com";
            trusted_domains = [ "example.com" ];
        "#};
        assert_eq!(render(content, "yourdomain.com", "example.com"), expect);
    }

    #[test]
    fn render_with_empty_placeholder_is_identity() {
        assert_eq!(render("abc", "", "example.com"), "abc");
    }

    #[sealed_test]
    fn resolve_fragments_expands_globs() -> anyhow::Result<()> {
        mkdirp::mkdirp("tpl/services")?;
        write("tpl/configuration.nix", "{}")?;
        write("tpl/services/ollama.nix", "{}")?;
        write("tpl/services/nextcloud.nix", "{}")?;
        write("tpl/README.md", "")?;

        let result = resolve_fragments(
            Path::new("tpl"),
            &["configuration.nix".into(), "services/*.nix".into()],
        )?;
        let expect = vec![
            PathBuf::from("configuration.nix"),
            PathBuf::from("services/nextcloud.nix"),
            PathBuf::from("services/ollama.nix"),
        ];
        assert_eq!(result, expect);

        let result = resolve_fragments(Path::new("tpl"), &["missing.nix".into()]);
        assert!(matches!(result, Err(MaterializeError::MissingFragment { .. })));

        Ok(())
    }
}
