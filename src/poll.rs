// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Bounded polling.
//!
//! Waiting on an asynchronous external effect, e.g., a filesystem label
//! showing up under `/dev/disk/by-label`, or an HTTP endpoint starting to
//! answer, is always a poll with a fixed interval and a hard deadline. Running
//! out of time is fatal for the caller.

use indicatif::{ProgressBar, ProgressStyle};
use std::{
    thread,
    time::{Duration, Instant},
};
use tracing::debug;

/// Poll probe until it succeeds or timeout elapses.
///
/// The probe runs once immediately, then once per interval. A spinner is
/// drawn while waiting if standard error is a terminal.
///
/// # Errors
///
/// - Return [`PollError::Timeout`] if probe never succeeded in time.
pub fn wait_until<F>(
    what: impl AsRef<str>,
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed}]") {
        bar.set_style(style);
    }
    bar.set_message(format!("waiting for {}", what.as_ref()));
    bar.enable_steady_tick(Duration::from_millis(100));

    let mut attempts = 0_u32;
    loop {
        attempts += 1;
        if probe() {
            bar.finish_and_clear();
            debug!("{} ready after {attempts} attempt(s)", what.as_ref());
            return Ok(());
        }

        if start.elapsed() >= timeout {
            bar.finish_and_clear();
            return Err(PollError::Timeout {
                what: what.as_ref().into(),
                timeout,
                attempts,
            });
        }

        thread::sleep(interval.min(timeout.saturating_sub(start.elapsed())));
    }
}

/// Polling error types.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// Probe did not succeed before the deadline.
    #[error("timed out after {timeout:?} waiting for {what} ({attempts} attempts)")]
    Timeout {
        what: String,
        timeout: Duration,
        attempts: u32,
    },
}

/// Friendly result alias :3
pub type Result<T, E = PollError> = std::result::Result<T, E>;
