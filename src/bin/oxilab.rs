// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use oxilab::{
    config::{HostPlan, Overrides, RunOptions, Settings},
    host::SystemHost,
    path::{default_plan_path, expand},
    prompt::{EnvPrompter, InquirePrompter, Prompter},
    provision::{models::ModelWarmup, Provisioner},
    service::ServiceManager,
};

use anyhow::{Context, Result};
use clap::{builder::FalseyValueParser, Args, Parser, Subcommand};
use std::{fs, path::PathBuf, process::exit, sync::Arc, time::Duration};
use tracing::{error, info, Event, Subscriber};
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    prelude::*,
    registry::LookupSpan,
    EnvFilter,
};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  oxilab [options]\n  oxilab [options] <oxilab-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(flatten)]
    pub options: GlobalOptions,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let settings = self.options.settings()?;
        match self.command {
            None => run_provision(&settings, self.options.force_noninteractive).await,
            Some(Command::Status) => run_status(&settings),
            Some(Command::Restart(opts)) => run_restart(&settings, opts),
            Some(Command::Logs(opts)) => run_logs(&settings, opts),
            Some(Command::Update) => run_update(&settings),
            Some(Command::PullModels) => run_pull_models(&settings).await,
            Some(Command::Plan) => run_plan(&settings),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Show health of every service.
    #[command(override_usage = "oxilab status")]
    Status,

    /// Restart a service.
    #[command(override_usage = "oxilab restart <service>")]
    Restart(ServiceOptions),

    /// Follow log of a service.
    #[command(override_usage = "oxilab logs <service>")]
    Logs(ServiceOptions),

    /// Pull every container image and rebuild the system.
    #[command(override_usage = "oxilab update")]
    Update,

    /// Download every configured inference model.
    #[command(override_usage = "oxilab pull-models")]
    PullModels,

    /// Print effective host plan.
    #[command(override_usage = "oxilab plan")]
    Plan,
}

#[derive(Args, Clone, Debug)]
struct GlobalOptions {
    /// Path to host plan.
    #[arg(short, long, global = true, env = "OXILAB_PLAN", value_name = "path")]
    pub plan: Option<PathBuf>,

    /// Device holding the boot and root partitions.
    #[arg(long, global = true, env = "OXILAB_SYSTEM_DEVICE", value_name = "path")]
    pub system_device: Option<PathBuf>,

    /// Device of the first bulk storage volume.
    #[arg(long, global = true, env = "OXILAB_STORAGE_A_DEVICE", value_name = "path")]
    pub storage_a_device: Option<PathBuf>,

    /// Device of the second bulk storage volume.
    #[arg(long, global = true, env = "OXILAB_STORAGE_B_DEVICE", value_name = "path")]
    pub storage_b_device: Option<PathBuf>,

    /// URL of configuration template repository.
    #[arg(long, global = true, env = "OXILAB_TEMPLATE_URL", value_name = "url")]
    pub template_url: Option<String>,

    /// Externally visible domain name.
    #[arg(long, global = true, env = "OXILAB_DOMAIN", value_name = "domain")]
    pub domain: Option<String>,

    /// Report what would happen without changing anything.
    #[arg(long, global = true, env = "OXILAB_DRY_RUN", value_parser = FalseyValueParser::new())]
    pub dry_run: bool,

    /// Never partition or format existing devices.
    #[arg(long, global = true, env = "OXILAB_SKIP_DESTRUCTIVE", value_parser = FalseyValueParser::new())]
    pub skip_destructive: bool,

    /// Never prompt, proceed with destructive steps unconfirmed.
    #[arg(
        long = "noninteractive",
        global = true,
        env = "OXILAB_NONINTERACTIVE",
        value_parser = FalseyValueParser::new()
    )]
    pub force_noninteractive: bool,

    /// Seconds to wait for filesystem labels to register.
    #[arg(long, global = true, env = "OXILAB_LABEL_TIMEOUT", value_name = "secs")]
    pub label_timeout: Option<u64>,
}

impl GlobalOptions {
    fn settings(&self) -> Result<Settings> {
        let path = match &self.plan {
            Some(path) => Some(expand(path)?),
            None => default_plan_path().ok().filter(|path| path.exists()),
        };

        let mut plan = match path {
            Some(path) => {
                info!("load host plan {}", path.display());
                let data = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read host plan {path:?}"))?;
                data.parse::<HostPlan>()
                    .with_context(|| format!("invalid host plan {path:?}"))?
            }
            None => {
                info!("no host plan found, use built-in plan");
                HostPlan::default()
            }
        };

        plan.apply(Overrides {
            system_device: self.system_device.clone(),
            storage_a_device: self.storage_a_device.clone(),
            storage_b_device: self.storage_b_device.clone(),
            template_url: self.template_url.clone(),
            domain: self.domain.clone(),
        });

        let mut options = RunOptions {
            dry_run: self.dry_run,
            skip_destructive: self.skip_destructive,
            force_noninteractive: self.force_noninteractive,
            ..Default::default()
        };
        if let Some(secs) = self.label_timeout {
            options.label_timeout = Duration::from_secs(secs);
        }

        Ok(Settings::new(plan, options)?)
    }
}

#[derive(Args, Clone, Debug)]
struct ServiceOptions {
    /// Name of service as declared in the host plan.
    #[arg(required = true, value_name = "service")]
    pub service: String,
}

/// Log events as `[LEVEL] message` lines.
struct Bracketed;

impl<S, N> FormatEvent<S, N> for Bracketed
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        write!(writer, "[{}] ", event.metadata().level())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .event_format(Bracketed)
        .with_writer(std::io::stdout);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

async fn run_provision(settings: &Settings, noninteractive: bool) -> Result<()> {
    let prompter: Box<dyn Prompter> = match noninteractive {
        true => Box::new(EnvPrompter),
        false => Box::new(InquirePrompter),
    };

    let report = Provisioner::new(settings, Arc::new(SystemHost), prompter.as_ref())
        .run()
        .await?;
    for (step, outcome) in &report.steps {
        info!("{step:<12} {outcome}");
    }
    info!("provisioning finished");

    Ok(())
}

fn run_status(settings: &Settings) -> Result<()> {
    ServiceManager::new(settings, &SystemHost).status();
    Ok(())
}

fn run_restart(settings: &Settings, opts: ServiceOptions) -> Result<()> {
    ServiceManager::new(settings, &SystemHost).restart(&opts.service)?;
    Ok(())
}

fn run_logs(settings: &Settings, opts: ServiceOptions) -> Result<()> {
    ServiceManager::new(settings, &SystemHost).logs(&opts.service)?;
    Ok(())
}

fn run_update(settings: &Settings) -> Result<()> {
    ServiceManager::new(settings, &SystemHost).update()?;
    Ok(())
}

async fn run_pull_models(settings: &Settings) -> Result<()> {
    ModelWarmup::new(settings, Arc::new(SystemHost)).apply().await?;
    Ok(())
}

fn run_plan(settings: &Settings) -> Result<()> {
    print!("{}", settings.plan);
    Ok(())
}
