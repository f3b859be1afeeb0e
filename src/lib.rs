// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Home-lab machine provisioner.
//!
//! Oxilab turns a bare machine booted into an installer environment into a
//! running home-lab host: it partitions and labels disks, renders the host
//! configuration from a template, collects secrets, installs the operating
//! system, bootstraps tunnels, and reports on the services that came up.
//!
//! Everything the machine should look like is described by a single
//! [`config::HostPlan`]. Every external effect goes through the
//! [`host::Host`] trait, and every operator interaction goes through the
//! [`prompt::Prompter`] trait, so the whole sequence in [`provision`] can be
//! exercised without touching real hardware.

pub mod config;
pub mod host;
pub mod path;
pub mod poll;
pub mod prompt;
pub mod provision;
pub mod service;
