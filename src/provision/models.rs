// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Inference model warm-up.
//!
//! Waits for the local inference server to answer, then downloads every
//! configured model. Downloads run concurrently on the blocking pool and
//! share nothing, so the only synchronization is joining them at the end.

use crate::{
    config::Settings,
    host::{Host, HostError, Invocation},
    poll::{wait_until, PollError},
};

use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};

fn tags_command(endpoint: &str) -> Invocation {
    Invocation::new("curl")
        .args(["-sf", "--max-time", "5"])
        .arg(format!("{}/api/tags", endpoint.trim_end_matches('/')))
}

fn pull_command(endpoint: &str, model: &str) -> Invocation {
    Invocation::new("curl")
        .args(["-sf", "-X", "POST"])
        .arg(format!("{}/api/pull", endpoint.trim_end_matches('/')))
        .arg("-d")
        .arg(json!({ "name": model, "stream": false }).to_string())
}

/// Model listing answered by the inference server.
#[derive(Debug, Default, Deserialize)]
struct Tags {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// Check if a model listing names target model.
///
/// Listings name models with an explicit tag, e.g., `llama3.2:latest`, so a
/// bare name matches any tag of it. A listing that does not parse names
/// nothing.
pub fn lists_model(listing: &str, model: &str) -> bool {
    let tags = match serde_json::from_str::<Tags>(listing) {
        Ok(tags) => tags,
        Err(err) => {
            debug!("cannot parse model listing: {err}");
            Tags::default()
        }
    };

    tags.models.iter().any(|entry| {
        entry.name == model
            || (!model.contains(':')
                && entry
                    .name
                    .split_once(':')
                    .is_some_and(|(base, _)| base == model))
    })
}

/// Pulls inference models once the server answers.
pub struct ModelWarmup<H>
where
    H: Host + ?Sized + 'static,
{
    settings: Settings,
    host: Arc<H>,
}

impl<H> ModelWarmup<H>
where
    H: Host + ?Sized + 'static,
{
    /// Construct new model warm-up.
    pub fn new(settings: &Settings, host: Arc<H>) -> Self {
        Self {
            settings: settings.clone(),
            host,
        }
    }

    fn endpoint(&self) -> &str {
        self.settings.plan.models.endpoint.as_str()
    }

    fn missing(&self) -> Vec<String> {
        let listing = self.host.exec(&tags_command(self.endpoint())).unwrap_or_default();
        self.settings
            .plan
            .models
            .models
            .iter()
            .filter(|model| !lists_model(&listing, model))
            .cloned()
            .collect()
    }

    /// Check if the server already lists every model.
    pub fn is_done(&self) -> bool {
        self.missing().is_empty()
    }

    /// Describe what [`Self::apply`] would do.
    pub fn plan(&self) -> Vec<String> {
        let mut plan = vec![format!("wait for {}", tags_command(self.endpoint()))];
        plan.extend(
            self.settings
                .plan
                .models
                .models
                .iter()
                .map(|model| pull_command(self.endpoint(), model).to_string()),
        );
        plan
    }

    /// Wait for the server, then pull every missing model concurrently.
    ///
    /// # Errors
    ///
    /// - Return [`ModelError::NotReady`] if the server never answers.
    /// - Return [`ModelError::Pull`] if any download fails. Other downloads
    ///   still run to completion.
    #[instrument(skip(self), level = "debug")]
    pub async fn apply(&self) -> Result<()> {
        let timeout = Duration::from_secs(self.settings.plan.models.timeout_secs);
        let interval = self.settings.options.poll_interval;
        let host = Arc::clone(&self.host);
        let probe = tags_command(self.endpoint());
        let endpoint = self.endpoint().to_string();
        tokio::task::spawn_blocking(move || {
            wait_until(format!("inference server at {endpoint}"), timeout, interval, || {
                host.exec(&probe).is_ok()
            })
        })
        .await??;

        let missing = self.missing();
        if missing.is_empty() {
            info!("every model already present");
            return Ok(());
        }

        let pulls = missing.into_iter().map(|model| {
            let host = Arc::clone(&self.host);
            let cmd = pull_command(self.endpoint(), &model);
            info!("pull model {model}");
            async move {
                let result = tokio::task::spawn_blocking(move || host.exec(&cmd)).await;
                (model, result)
            }
        });

        let mut failure = None;
        for (model, result) in join_all(pulls).await {
            match result {
                Ok(Ok(_)) => info!("model {model} ready"),
                Ok(Err(err)) => {
                    warn!("model {model} failed to download: {err}");
                    failure.get_or_insert(ModelError::Pull { model, source: err });
                }
                Err(err) => {
                    failure.get_or_insert(ModelError::Join(err));
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Model warm-up error types.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Inference server never answered.
    #[error(transparent)]
    NotReady(#[from] PollError),

    /// Model download failed.
    #[error("failed to pull model {model}")]
    Pull {
        model: String,
        #[source]
        source: HostError,
    },

    /// Background task panicked or was cancelled.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// Friendly result alias :3
pub type Result<T, E = ModelError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    const LISTING: &str = r#"{"models":[{"name":"llama3.2:latest"},{"name":"nomic-embed-text:v1.5"}]}"#;

    #[test_case("llama3.2", true; "bare name matches latest")]
    #[test_case("llama3.2:latest", true; "exact tag")]
    #[test_case("nomic-embed-text", true; "bare name matches other tag")]
    #[test_case("llama3.2:1b", false; "different tag")]
    #[test_case("llama3", false; "prefix of other model")]
    #[test]
    fn listing_lookup(model: &str, expect: bool) {
        assert_eq!(lists_model(LISTING, model), expect);
    }

    #[test]
    fn listing_ignores_fields_other_than_name() {
        let listing = r#"{"models":[{
            "name":"llama3.2:latest",
            "model":"llama3.2:latest",
            "details":{"family":"llama","families":["llama"]}
        }]}"#;
        assert!(!lists_model(listing, "llama"));
        assert!(lists_model(listing, "llama3.2"));
    }

    #[test]
    fn garbled_listing_names_nothing() {
        assert!(!lists_model("llama3.2:latest", "llama3.2"));
        assert!(!lists_model("", "llama3.2"));
    }

    #[test]
    fn pull_command_posts_model_name() {
        let cmd = pull_command("http://127.0.0.1:11434/", "llama3.2");
        assert_eq!(
            cmd.to_string(),
            r#"curl -sf -X POST http://127.0.0.1:11434/api/pull -d {"name":"llama3.2","stream":false}"#
        );

        let cmd = pull_command("http://127.0.0.1:11434", r#"odd"name"#);
        assert!(cmd.to_string().ends_with(r#"-d {"name":"odd\"name","stream":false}"#));
    }
}
