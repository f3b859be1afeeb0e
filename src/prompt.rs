// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Operator input.
//!
//! Provisioning blocks on the operator in three places: secret entry,
//! destructive-action confirmation, and acknowledgement of manual work (a
//! browser login, hand-placed configuration files). All three go through the
//! [`Prompter`] trait so a run can be driven interactively, from the
//! environment, or from a canned script.

use inquire::{Confirm, Password, PasswordDisplayMode, Text};
use std::{collections::VecDeque, sync::Mutex};

/// Source of operator input.
pub trait Prompter {
    /// Read a secret value without echoing it.
    fn read_secret(&self, name: &str, message: &str) -> Result<String>;

    /// Read one line of plain text.
    fn read_line(&self, message: &str) -> Result<String>;

    /// Block until the operator acknowledges a manual step.
    fn acknowledge(&self, message: &str) -> Result<()>;
}

/// Interactive prompts on the current terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct InquirePrompter;

impl Prompter for InquirePrompter {
    fn read_secret(&self, _name: &str, message: &str) -> Result<String> {
        Ok(Password::new(message)
            .without_confirmation()
            .with_display_mode(PasswordDisplayMode::Hidden)
            .prompt()?)
    }

    fn read_line(&self, message: &str) -> Result<String> {
        Ok(Text::new(message).prompt()?)
    }

    fn acknowledge(&self, message: &str) -> Result<()> {
        match Confirm::new(message).with_default(true).prompt()? {
            true => Ok(()),
            false => Err(PromptError::Declined(message.into())),
        }
    }
}

/// Non-interactive input taken from the environment.
///
/// Secrets are read from `OXILAB_SECRET_<NAME>`, where `<NAME>` is the
/// secret name upper-cased with dashes turned into underscores. Anything that
/// needs a human fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvPrompter;

impl EnvPrompter {
    /// Environment variable holding target secret.
    pub fn secret_var(name: &str) -> String {
        format!("OXILAB_SECRET_{}", name.to_uppercase().replace(['-', '.'], "_"))
    }
}

impl Prompter for EnvPrompter {
    fn read_secret(&self, name: &str, _message: &str) -> Result<String> {
        let var = Self::secret_var(name);
        // INVARIANT: Empty means unset, retrying would never see another value.
        match std::env::var(&var) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Err(PromptError::MissingEnv(var)),
        }
    }

    fn read_line(&self, message: &str) -> Result<String> {
        Err(PromptError::NonInteractive(message.into()))
    }

    fn acknowledge(&self, message: &str) -> Result<()> {
        Err(PromptError::NonInteractive(message.into()))
    }
}

/// Canned operator answers, consumed in order.
///
/// Secrets, lines, and acknowledgements share one queue. An acknowledgement
/// consumes one entry regardless of its content.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<String>>,
}

impl ScriptedPrompter {
    /// Construct new scripted prompter.
    pub fn new(answers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
        }
    }

    /// Number of answers not yet consumed.
    pub fn remaining(&self) -> usize {
        self.answers.lock().map(|answers| answers.len()).unwrap_or(0)
    }

    fn next(&self, message: &str) -> Result<String> {
        self.answers
            .lock()
            .ok()
            .and_then(|mut answers| answers.pop_front())
            .ok_or_else(|| PromptError::Exhausted(message.into()))
    }
}

impl Prompter for ScriptedPrompter {
    fn read_secret(&self, _name: &str, message: &str) -> Result<String> {
        self.next(message)
    }

    fn read_line(&self, message: &str) -> Result<String> {
        self.next(message)
    }

    fn acknowledge(&self, message: &str) -> Result<()> {
        self.next(message).map(|_| ())
    }
}

/// Operator input error types.
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    /// Terminal prompt failed or was interrupted.
    #[error(transparent)]
    Inquire(#[from] inquire::InquireError),

    /// Operator declined to continue.
    #[error("operator declined: {0}")]
    Declined(String),

    /// Input was needed but the run is non-interactive.
    #[error("operator input required in non-interactive mode: {0}")]
    NonInteractive(String),

    /// Secret was not supplied through the environment.
    #[error("environment variable {0} is not set or empty")]
    MissingEnv(String),

    /// Scripted answers ran out.
    #[error("no scripted answer left for: {0}")]
    Exhausted(String),
}

/// Friendly result alias :3
pub type Result<T, E = PromptError> = std::result::Result<T, E>;
