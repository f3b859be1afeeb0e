// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{lab_plan, lab_settings, write_templates, MockHost, DEVICES};

use anyhow::Result;
use oxilab::{
    config::RunOptions,
    prompt::{EnvPrompter, PromptError, ScriptedPrompter},
    provision::{
        disk::{disks, DiskError, DiskProvisioner},
        materialize::{ConfigMaterializer, MaterializeError},
        models::{ModelError, ModelWarmup},
        preflight::{self, PreflightError},
        tunnel::{TunnelBootstrapper, TunnelError, TunnelRecord},
        FailureKind, Outcome, ProvisionError, Provisioner, Step,
    },
    service::{ServiceError, ServiceManager},
};
use pretty_assertions::assert_eq;
use sealed_test::prelude::*;
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::Path,
    sync::Arc,
};

const TUNNEL_ID: &str = "6ff42ae2-765d-4adf-8112-31c55c1551ef";

fn noninteractive() -> RunOptions {
    RunOptions {
        force_noninteractive: true,
        ..Default::default()
    }
}

fn disk_host() -> MockHost {
    MockHost::new()
        .register_labels("dev/disk/by-label")
        .fail("mountpoint", "")
        .fail("umount", "umount: mnt: not mounted.")
}

#[sealed_test]
fn disks_publish_labels_for_every_role() -> Result<()> {
    let settings = lab_settings(lab_plan(), noninteractive())?;
    let host = disk_host();
    let prompter = ScriptedPrompter::default();
    DiskProvisioner::new(&settings, &host, &prompter).apply()?;

    for volume in disks(&settings.plan.devices).iter().flat_map(|disk| &disk.volumes) {
        let link = fs::canonicalize(Path::new("dev/disk/by-label").join(&volume.label))?;
        assert_eq!(link, fs::canonicalize(volume.partition())?);
    }

    assert_eq!(host.count("sgdisk --zap-all"), 3);
    assert_eq!(host.count("mkfs."), 4);
    let mounts = host
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("mount "))
        .collect::<Vec<_>>();
    assert_eq!(mounts.len(), 4);
    assert!(mounts[0].starts_with("mount dev/disk/by-label/nixos"));

    Ok(())
}

#[sealed_test]
fn rerun_with_skip_destructive_leaves_disks_alone() -> Result<()> {
    let prompter = ScriptedPrompter::default();
    let settings = lab_settings(lab_plan(), noninteractive())?;
    DiskProvisioner::new(&settings, &disk_host(), &prompter).apply()?;

    let options = RunOptions {
        skip_destructive: true,
        ..noninteractive()
    };
    let settings = lab_settings(lab_plan(), options)?;
    let host = disk_host();
    DiskProvisioner::new(&settings, &host, &prompter).apply()?;

    assert_eq!(host.count("sgdisk"), 0);
    assert_eq!(host.count("mkfs"), 0);
    assert_eq!(host.count("mount "), 4);

    Ok(())
}

#[sealed_test]
fn skip_destructive_refuses_to_invent_labels() -> Result<()> {
    let options = RunOptions {
        skip_destructive: true,
        ..noninteractive()
    };
    let settings = lab_settings(lab_plan(), options)?;
    let host = disk_host();
    let prompter = ScriptedPrompter::default();
    let result = DiskProvisioner::new(&settings, &host, &prompter).apply();

    assert!(matches!(result, Err(DiskError::LabelsMissing(labels)) if labels.len() == 4));
    assert_eq!(host.count("sgdisk"), 0);

    Ok(())
}

#[sealed_test]
fn erase_requires_exact_confirmation() -> Result<()> {
    let settings = lab_settings(lab_plan(), RunOptions::default())?;
    let host = disk_host();

    let prompter = ScriptedPrompter::new(["erase"]);
    let result = DiskProvisioner::new(&settings, &host, &prompter).apply();
    assert!(matches!(result, Err(DiskError::NotConfirmed)));
    assert_eq!(host.count("sgdisk"), 0);

    let prompter = ScriptedPrompter::new(["ERASE"]);
    DiskProvisioner::new(&settings, &host, &prompter).apply()?;
    assert_eq!(host.count("sgdisk --zap-all"), 3);

    Ok(())
}

#[sealed_test]
fn labels_that_never_appear_time_out_before_mounting() -> Result<()> {
    fs::create_dir_all("etc")?;
    fs::write("etc/NIXOS", "")?;
    let settings = lab_settings(lab_plan(), noninteractive())?;
    let host = Arc::new(
        MockHost::new()
            .block_devices(&DEVICES)
            .fail("mountpoint", ""),
    );
    let prompter = ScriptedPrompter::default();
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(Provisioner::new(&settings, host.clone(), &prompter).run());

    let Err(err) = result else {
        panic!("disk step succeeded without labels");
    };
    assert!(matches!(err, ProvisionError::Disk(DiskError::LabelTimeout(_))));
    assert_eq!(err.kind(), FailureKind::Readiness);
    assert_eq!(host.count("ping"), 1);
    assert_eq!(host.count("sgdisk --zap-all"), 1);
    assert_eq!(host.count("mkfs."), 2);
    assert_eq!(host.count("mount "), 0);
    assert_eq!(host.count("nixos-install"), 0);
    assert!(!Path::new("mnt/etc/nixos").exists());

    Ok(())
}

#[sealed_test]
fn failed_partitioning_stops_before_formatting() -> Result<()> {
    let settings = lab_settings(lab_plan(), noninteractive())?;
    let host = MockHost::new()
        .fail("mountpoint", "")
        .fail("sgdisk -n", "Could not create partition 1 from 34 to 2097185");
    let prompter = ScriptedPrompter::default();
    let result = DiskProvisioner::new(&settings, &host, &prompter).apply();

    let Err(err) = result else {
        panic!("disk step succeeded with failing partitioner");
    };
    assert!(matches!(err, DiskError::Tool(_)));
    assert_eq!(ProvisionError::from(err).kind(), FailureKind::ExternalTool);
    assert_eq!(host.count("sgdisk -n"), 1);
    assert_eq!(host.count("mkfs"), 0);
    assert_eq!(host.count("mount "), 0);

    Ok(())
}

#[sealed_test]
fn materializer_replaces_placeholder_domain() -> Result<()> {
    write_templates("template")?;
    let settings = lab_settings(lab_plan(), RunOptions::default())?;
    let prompter = ScriptedPrompter::default();
    let materializer = ConfigMaterializer::new(&settings, &prompter);
    assert!(!materializer.is_done());
    materializer.apply()?;

    for fragment in ["configuration.nix", "services/nextcloud.nix", "services/cloudflared.nix"] {
        let original = fs::read_to_string(Path::new("template").join(fragment))?;
        let rendered = fs::read_to_string(Path::new("mnt/etc/nixos").join(fragment))?;
        assert!(original.contains("yourdomain.com"));
        assert_eq!(rendered.matches("yourdomain.com").count(), 0);
        assert!(rendered.contains("example.com"));
    }

    let untouched = fs::read_to_string("mnt/etc/nixos/services/ollama.nix")?;
    assert_eq!(untouched, fs::read_to_string("template/services/ollama.nix")?);
    assert!(materializer.is_done());

    Ok(())
}

#[sealed_test]
fn materializer_waits_for_manual_placement() -> Result<()> {
    let mut plan = lab_plan();
    plan.template.local = None;
    let settings = lab_settings(plan, RunOptions::default())?;

    write_templates("mnt/etc/nixos")?;
    let prompter = ScriptedPrompter::new(["done"]);
    ConfigMaterializer::new(&settings, &prompter).apply()?;
    assert_eq!(prompter.remaining(), 0);

    let rendered = fs::read_to_string("mnt/etc/nixos/configuration.nix")?;
    assert_eq!(rendered, "{ networking.domain = \"example.com\"; }\n");

    Ok(())
}

#[sealed_test]
fn unreachable_remote_falls_back_without_partial_clone() -> Result<()> {
    write_templates("template")?;
    let mut plan = lab_plan();
    plan.template.url = Some("no/such/remote".into());
    let settings = lab_settings(plan, RunOptions::default())?;
    let prompter = ScriptedPrompter::default();
    ConfigMaterializer::new(&settings, &prompter).apply()?;

    assert!(!Path::new("tmp/oxilab/template").exists());
    let rendered = fs::read_to_string("mnt/etc/nixos/configuration.nix")?;
    assert_eq!(rendered, "{ networking.domain = \"example.com\"; }\n");
    assert_eq!(prompter.remaining(), 0);

    Ok(())
}

fn placeholder_plan() -> oxilab::config::HostPlan {
    let mut plan = lab_plan();
    plan.settings.domain = plan.settings.placeholder_domain.clone();
    plan
}

#[sealed_test]
fn operator_supplies_domain_when_plan_has_none() -> Result<()> {
    fs::create_dir_all("etc")?;
    fs::write("etc/NIXOS", "")?;
    write_templates("template")?;
    fs::create_dir_all("root/.cloudflared")?;
    fs::write("root/.cloudflared/cert.pem", "cert")?;

    let settings = lab_settings(placeholder_plan(), RunOptions::default())?;
    let host = Arc::new(lab_host());
    let prompter = ScriptedPrompter::new([
        "ERASE",
        "",
        "yourdomain.com",
        "lab.example.org",
        "admin",
        "admin",
        "db",
        "db",
        "key",
    ]);
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(Provisioner::new(&settings, host.clone(), &prompter).run())?;
    assert_eq!(prompter.remaining(), 0);

    let rendered = fs::read_to_string("mnt/etc/nixos/configuration.nix")?;
    assert_eq!(rendered, "{ networking.domain = \"lab.example.org\"; }\n");
    assert_eq!(
        host.count("cloudflared tunnel route dns --overwrite-dns homelab chat.lab.example.org"),
        1
    );
    assert_eq!(host.count("cloudflared tunnel route dns --overwrite-dns homelab chat.yourdomain"), 0);

    Ok(())
}

#[sealed_test]
fn noninteractive_run_without_domain_is_fatal() -> Result<()> {
    fs::create_dir_all("etc")?;
    fs::write("etc/NIXOS", "")?;
    write_templates("template")?;

    let settings = lab_settings(placeholder_plan(), noninteractive())?;
    let host = Arc::new(lab_host());
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(Provisioner::new(&settings, host.clone(), &EnvPrompter).run());

    let Err(err) = result else {
        panic!("provisioned without a domain");
    };
    assert!(matches!(
        err,
        ProvisionError::Materialize(MaterializeError::Prompt(PromptError::NonInteractive(_)))
    ));
    assert_eq!(err.kind(), FailureKind::OperatorInput);
    assert!(!Path::new("mnt/etc/nixos/configuration.nix").exists());
    assert_eq!(host.count("cloudflared"), 0);

    Ok(())
}

fn tunnel_host() -> MockHost {
    MockHost::new()
        .respond(
            "cloudflared tunnel create homelab",
            format!(
                "Tunnel credentials written to /root/.cloudflared/{TUNNEL_ID}.json.\n\
                 Created tunnel homelab with id {TUNNEL_ID}\n"
            ),
        )
        .writes(
            "cloudflared tunnel create homelab",
            format!("root/.cloudflared/{TUNNEL_ID}.json"),
            "{\"TunnelSecret\":\"c2VjcmV0\"}",
        )
}

fn prepare_tunnel_fragment() -> Result<()> {
    write_templates("mnt/etc/nixos")?;
    fs::create_dir_all("root/.cloudflared")?;
    fs::write("root/.cloudflared/cert.pem", "cert")?;
    Ok(())
}

#[sealed_test]
fn tunnel_identifier_is_extracted_and_wired_in() -> Result<()> {
    prepare_tunnel_fragment()?;
    let settings = lab_settings(lab_plan(), RunOptions::default())?;
    let host = tunnel_host();
    let prompter = ScriptedPrompter::default();
    let bootstrapper = TunnelBootstrapper::new(&settings, &host, &prompter);

    let tunnels = bootstrapper.apply()?;
    assert_eq!(tunnels.len(), 1);
    assert_eq!(tunnels[0].id, TUNNEL_ID);
    assert_eq!(tunnels[0].id.len(), 36);

    let credentials = bootstrapper.credentials_of("homelab");
    let mode = fs::metadata(&credentials)?.permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);

    let fragment = fs::read_to_string("mnt/etc/nixos/services/cloudflared.nix")?;
    assert!(fragment.contains(TUNNEL_ID));
    assert!(!fragment.contains("TUNNEL_ID_HOMELAB"));

    assert_eq!(host.count("cloudflared tunnel login"), 0);
    assert_eq!(
        host.count("cloudflared tunnel route dns --overwrite-dns homelab chat.example.com"),
        1
    );
    assert_eq!(
        host.count("cloudflared tunnel route dns --overwrite-dns homelab cloud.example.com"),
        1
    );
    assert_eq!(host.count("nixos-install"), 1);
    assert!(bootstrapper.is_done());

    let host = tunnel_host();
    TunnelBootstrapper::new(&settings, &host, &prompter).apply()?;
    assert_eq!(host.count("cloudflared tunnel create"), 0);
    assert_eq!(host.count("nixos-install"), 0);

    Ok(())
}

#[sealed_test]
fn tunnel_without_identifier_is_fatal() -> Result<()> {
    prepare_tunnel_fragment()?;
    let settings = lab_settings(lab_plan(), RunOptions::default())?;
    let host = MockHost::new().respond(
        "cloudflared tunnel create",
        "Error: you need to login first\n",
    );
    let prompter = ScriptedPrompter::default();
    let bootstrapper = TunnelBootstrapper::new(&settings, &host, &prompter);

    let result = bootstrapper.apply();
    assert!(matches!(result, Err(TunnelError::NoIdentifier(_))));
    assert!(!bootstrapper.credentials_of("homelab").exists());
    let record = TunnelRecord::load(Path::new("mnt/etc/secrets/cloudflared/tunnels.toml"))?;
    assert!(record.tunnels.is_empty());
    assert_eq!(host.count("cloudflared tunnel route"), 0);
    assert_eq!(host.count("nixos-install"), 0);

    Ok(())
}

fn lab_host() -> MockHost {
    tunnel_host()
        .register_labels("dev/disk/by-label")
        .block_devices(&DEVICES)
        .fail("mountpoint", "")
        .writes("nixos-install --root", "mnt/etc/NIXOS", "")
}

#[sealed_test]
fn dry_run_changes_nothing_but_runs_preflight() -> Result<()> {
    fs::create_dir_all("etc")?;
    fs::write("etc/NIXOS", "")?;
    write_templates("template")?;

    let options = RunOptions {
        dry_run: true,
        ..Default::default()
    };
    let settings = lab_settings(lab_plan(), options)?;
    let host = Arc::new(lab_host());
    let prompter = ScriptedPrompter::default();
    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(Provisioner::new(&settings, host.clone(), &prompter).run())?;

    assert_eq!(report.outcome(Step::Preflight), Some(&Outcome::Passed));
    assert_eq!(host.count("ping -c 1 -W 5 1.1.1.1"), 1);
    for destructive in ["sgdisk", "mkfs", "nixos-install", "cloudflared tunnel", "mount ", "umount"] {
        assert_eq!(host.count(destructive), 0, "{destructive} ran during dry run");
    }

    for step in [Step::Disks, Step::Materialize, Step::Secrets, Step::Install, Step::Tunnels] {
        assert!(
            matches!(report.outcome(step), Some(Outcome::Planned(actions)) if !actions.is_empty()),
            "{step} was not planned"
        );
    }
    assert_eq!(report.outcome(Step::Verify), Some(&Outcome::Passed));
    assert_eq!(report.services.len(), 5);
    assert!(!Path::new("mnt").exists());
    assert!(!Path::new("dev").exists());

    Ok(())
}

#[sealed_test]
fn full_run_then_rerun_skips_finished_steps() -> Result<()> {
    fs::create_dir_all("etc")?;
    fs::write("etc/NIXOS", "")?;
    write_templates("template")?;
    fs::create_dir_all("root/.cloudflared")?;
    fs::write("root/.cloudflared/cert.pem", "cert")?;

    let settings = lab_settings(lab_plan(), RunOptions::default())?;
    let runtime = tokio::runtime::Runtime::new()?;

    let host = Arc::new(lab_host());
    let prompter = ScriptedPrompter::new(["ERASE", "admin", "admin", "db", "db", "key"]);
    let report = runtime.block_on(Provisioner::new(&settings, host.clone(), &prompter).run())?;
    assert_eq!(prompter.remaining(), 0);
    for step in [Step::Disks, Step::Materialize, Step::Secrets, Step::Install, Step::Tunnels] {
        assert_eq!(report.outcome(step), Some(&Outcome::Applied), "{step}");
    }
    assert_eq!(fs::read_to_string("mnt/etc/secrets/nextcloud-db-pass")?, "db");
    assert_eq!(report.unhealthy(), 0);

    let host = Arc::new(lab_host());
    let prompter = ScriptedPrompter::default();
    let report = runtime.block_on(Provisioner::new(&settings, host.clone(), &prompter).run())?;
    for step in [Step::Materialize, Step::Secrets, Step::Install, Step::Tunnels] {
        assert_eq!(report.outcome(step), Some(&Outcome::Skipped), "{step}");
    }
    assert_eq!(host.count("sgdisk"), 0);
    assert_eq!(host.count("mkfs"), 0);
    assert_eq!(host.count("nixos-install"), 0);
    assert_eq!(host.count("cloudflared tunnel create"), 0);

    Ok(())
}

#[sealed_test]
fn preflight_requires_os_marker() -> Result<()> {
    let settings = lab_settings(lab_plan(), RunOptions::default())?;
    let host = Arc::new(lab_host());
    let prompter = ScriptedPrompter::default();
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(Provisioner::new(&settings, host.clone(), &prompter).run());

    assert!(matches!(
        result,
        Err(ProvisionError::Preflight(PreflightError::OsMarkerMissing(_)))
    ));
    assert_eq!(host.calls(), Vec::<String>::new());

    Ok(())
}

#[sealed_test]
fn preflight_requires_network_and_devices() -> Result<()> {
    fs::create_dir_all("etc")?;
    fs::write("etc/NIXOS", "")?;
    let settings = lab_settings(lab_plan(), RunOptions::default())?;

    let host = MockHost::new()
        .block_devices(&DEVICES)
        .fail("ping", "Network is unreachable");
    let result = preflight::check(&settings, &host);
    assert!(matches!(result, Err(PreflightError::Unreachable { .. })));

    let host = MockHost::new().block_devices(&DEVICES[..2]);
    let result = preflight::check(&settings, &host);
    assert!(matches!(result, Err(PreflightError::NotBlockDevice(path)) if path == Path::new("dev/sdb")));

    let mut plan = lab_plan();
    plan.devices.min_size_gib = 16;
    let settings = lab_settings(plan, RunOptions::default())?;
    let host = MockHost::new()
        .block_devices(&DEVICES)
        .respond("lsblk", "8589934592\n");
    let result = preflight::check(&settings, &host);
    assert!(matches!(
        result,
        Err(PreflightError::TooSmall { size_gib: 8, minimum_gib: 16, .. })
    ));

    let mut plan = lab_plan();
    plan.devices.min_size_gib = u64::MAX;
    let settings = lab_settings(plan, RunOptions::default())?;
    let result = preflight::check(&settings, &host);
    assert!(matches!(
        result,
        Err(PreflightError::TooSmall { minimum_gib: u64::MAX, .. })
    ));

    Ok(())
}

const LISTING: &str = r#"{"models":[{"name":"llama3.2:latest"}]}"#;

#[tokio::test]
async fn models_pull_only_what_is_missing() -> Result<()> {
    let settings = lab_settings(lab_plan(), RunOptions::default())?;
    let host = Arc::new(MockHost::new().respond("curl -sf --max-time 5", LISTING));
    let warmup = ModelWarmup::new(&settings, host.clone());
    assert!(!warmup.is_done());
    warmup.apply().await?;

    let pulls = host
        .calls()
        .into_iter()
        .filter(|call| call.contains("/api/pull"))
        .collect::<Vec<_>>();
    assert_eq!(pulls.len(), 1);
    assert!(pulls[0].contains(r#""name":"nomic-embed-text""#));

    Ok(())
}

#[tokio::test]
async fn models_fail_when_a_download_fails() -> Result<()> {
    let mut plan = lab_plan();
    plan.models.models = vec!["mistral".into(), "phi3".into()];
    let settings = lab_settings(plan, RunOptions::default())?;
    let host = Arc::new(
        MockHost::new()
            .respond("curl -sf --max-time 5", LISTING)
            .fail("curl -sf -X POST", "curl: (22) The requested URL returned error: 500"),
    );
    let result = ModelWarmup::new(&settings, host.clone()).apply().await;

    assert!(matches!(result, Err(ModelError::Pull { .. })));
    assert_eq!(host.count("curl -sf -X POST"), 2);

    Ok(())
}

#[tokio::test]
async fn models_time_out_when_server_never_answers() -> Result<()> {
    let mut plan = lab_plan();
    plan.models.timeout_secs = 0;
    let settings = lab_settings(plan, RunOptions::default())?;
    let host = Arc::new(MockHost::new().fail("curl", "curl: (7) Failed to connect"));
    let result = ModelWarmup::new(&settings, host.clone()).apply().await;

    assert!(matches!(result, Err(ModelError::NotReady(_))));
    assert_eq!(host.count("curl -sf -X POST"), 0);

    Ok(())
}

#[test]
fn service_helpers_pass_through() -> Result<()> {
    let settings = lab_settings(lab_plan(), RunOptions::default())?;
    let host = MockHost::new().fail("systemctl is-active podman-nextcloud", "inactive");
    let manager = ServiceManager::new(&settings, &host);

    manager.restart("ollama")?;
    assert_eq!(host.count("systemctl restart podman-ollama.service"), 1);

    let result = manager.restart("jellyfin");
    assert!(matches!(result, Err(ServiceError::UnknownService(name)) if name == "jellyfin"));

    manager.logs("open-webui")?;
    assert_eq!(host.count("journalctl -u podman-open-webui.service -f"), 1);

    let statuses = manager.status();
    let failed = statuses
        .iter()
        .filter(|status| !status.healthy)
        .map(|status| status.to_string())
        .collect::<Vec<_>>();
    assert_eq!(
        failed,
        vec!["[FAIL] nextcloud (podman-nextcloud.service): inactive".to_string()]
    );

    manager.update()?;
    assert_eq!(host.count("podman pull"), 3);
    assert_eq!(host.calls().last().map(String::as_str), Some("nixos-rebuild switch"));

    Ok(())
}
