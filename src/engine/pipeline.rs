//! The per-deployment state machine: admit, fetch, build, run, verify,
//! publish. Each stage persists its own state before/after its one
//! external side effect, so a crash between stages leaves the deployment
//! row describing exactly how far it got.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::driver::{ContainerDriver, ResourceLimits};
use crate::error::{Error, Result};
use crate::model::{App, Deployment, Status};
use crate::quota::QuotaGate;
use crate::router::RouterBinding;
use crate::source::{deployment_workdir, SourceFetcher};
use crate::store::{DeploymentUpdate, StateStore};

use super::{EngineCtx, DEFAULT_CPU_SHARES, VERIFY_GRACE_PERIOD, LOG_FLUSH_INTERVAL};

/// Everything a single pipeline run needs, threaded through each stage
/// instead of read back from the store repeatedly.
pub(super) struct Run {
    pub app: App,
    pub deployment: Deployment,
}

#[instrument(skip_all, fields(app_id = %run.app.id, deployment_id = %run.deployment.id))]
pub(super) async fn admit(ctx: &EngineCtx, run: &Run) -> Result<()> {
    let plan = ctx
        .store
        .get_user(&run.app.owner_id)
        .await?
        .map(|u| u.plan)
        .unwrap_or_default();
    let limits = ctx.quota.limits_for(plan);

    // The app row already exists (it was created together with this
    // deployment's first sibling), so it always counts as one of the
    // owner's apps; only apps *beyond* this one count against the cap.
    // This re-check exists to catch the race the control surface's
    // advisory check can't close: this one is authoritative, the
    // API-layer check is advisory only.
    let count = ctx.store.count_apps_by_owner(&run.app.owner_id).await?;
    if count.saturating_sub(1) >= limits.max_apps {
        return Err(Error::Quota(format!(
            "plan allows at most {} apps for this owner",
            limits.max_apps
        )));
    }

    Ok(())
}

#[instrument(skip_all, fields(app_id = %run.app.id, deployment_id = %run.deployment.id))]
pub(super) async fn fetch(ctx: &EngineCtx, run: &Run) -> Result<PathBuf> {
    let workdir = deployment_workdir(&ctx.config.workroot, &run.app.id, run.deployment.id);

    ctx.fetcher
        .clone_repo(&run.app.repo_url, &run.app.branch, &workdir)
        .await?;
    ctx.fetcher.validate_recipe(&workdir).await?;
    let notes = ctx.fetcher.normalize_recipe(&workdir).await?;
    for note in &notes {
        info!(note, "applied recipe normalization");
    }

    Ok(workdir)
}

/// Builds `image_ref = app-<app_id>-<deployment_id>` and streams the build
/// log into `build_log`, flushing on a tick and once more on completion.
#[instrument(skip_all, fields(app_id = %run.app.id, deployment_id = %run.deployment.id))]
pub(super) async fn build(ctx: &EngineCtx, run: &Run, workdir: &Path) -> Result<String> {
    let image_ref = format!("app-{}-{}", run.app.id, run.deployment.id);
    ctx.store
        .update_deployment(DeploymentUpdate::new(run.deployment.id).image_ref(image_ref.as_str()))
        .await?;

    let buffer = Arc::new(StdMutex::new(String::new()));
    let (done_tx, mut done_rx) = watch::channel(false);

    let flusher = {
        let buffer = Arc::clone(&buffer);
        let store = Arc::clone(&ctx.store);
        let deployment_id = run.deployment.id;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LOG_FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = buffer.lock().unwrap().clone();
                        let _ = store
                            .update_deployment(
                                DeploymentUpdate::new(deployment_id).build_log(snapshot),
                            )
                            .await;
                    }
                    _ = done_rx.changed() => break,
                }
            }
        })
    };

    let mut on_log = {
        let buffer = Arc::clone(&buffer);
        move |line: String| {
            let mut buf = buffer.lock().unwrap();
            buf.push_str(&line);
        }
    };

    let build_result = ctx
        .driver
        .build_image(workdir, &image_ref, &mut on_log)
        .await;

    let _ = done_tx.send(true);
    let _ = flusher.await;

    let final_log = buffer.lock().unwrap().clone();
    ctx.store
        .update_deployment(DeploymentUpdate::new(run.deployment.id).build_log(final_log))
        .await?;

    build_result?;
    Ok(image_ref)
}

pub(super) struct Started {
    pub container_ref: String,
    pub subdomain: String,
    pub host_port: u16,
}

/// Computes resource caps from the owner's plan, assigns a subdomain and
/// host port, and starts the new container. Does *not* touch any prior
/// Running deployment's container — that GC runs only after this one
/// reaches Running (swap-then-reap), so the app is never observably down.
#[instrument(skip_all, fields(app_id = %run.app.id, deployment_id = %run.deployment.id))]
pub(super) async fn run_stage(
    ctx: &EngineCtx,
    run: &Run,
    workdir: &Path,
    image_ref: &str,
) -> Result<Started> {
    let plan = ctx
        .store
        .get_user(&run.app.owner_id)
        .await?
        .map(|u| u.plan)
        .unwrap_or_default();
    let plan_limits = ctx.quota.limits_for(plan);
    let limits = ResourceLimits {
        memory_mb: plan_limits.max_ram_mb,
        cpu_shares: DEFAULT_CPU_SHARES,
        disk_gb: plan_limits.max_disk_gb,
    };

    let container_port = ctx.fetcher.detect_port(workdir).await?;
    let host_port = allocate_host_port(run.deployment.id);
    let subdomain = run.app.slug.clone();
    let container_name = format!("app-{}-{}", run.app.id, run.deployment.id);

    let env_vars = ctx.store.list_env_vars(&run.app.id).await?;
    let env: Vec<(String, String)> = env_vars.into_iter().map(|e| (e.key, e.value)).collect();

    let container_ref = ctx
        .driver
        .run_container(
            image_ref,
            &container_name,
            container_port,
            host_port,
            &env,
            limits,
        )
        .await?;

    ctx.store
        .update_deployment(
            DeploymentUpdate::new(run.deployment.id)
                .container_ref(container_ref.as_str())
                .subdomain(subdomain.as_str()),
        )
        .await?;

    Ok(Started {
        container_ref,
        subdomain,
        host_port,
    })
}

/// Deterministic, collision-free-by-construction host port in the
/// ephemeral range, keyed off the deployment id — the same way image and
/// container names are partitioned by `app-<app_id>-<deployment_id>`,
/// extended to the port a single engine host hands out.
fn allocate_host_port(deployment_id: i64) -> u16 {
    const BASE: u32 = 20_000;
    const RANGE: u32 = 10_000;
    (BASE + (deployment_id as u32 % RANGE)) as u16
}

/// Reads back the caps the runtime actually applied and probes for an
/// early exit within a short grace window.
#[instrument(skip_all, fields(app_id = %run.app.id, deployment_id = %run.deployment.id))]
pub(super) async fn verify(ctx: &EngineCtx, run: &Run, started: &Started) -> Result<()> {
    let actual = ctx.driver.get_resource_limits(&started.container_ref).await?;
    let plan = ctx
        .store
        .get_user(&run.app.owner_id)
        .await?
        .map(|u| u.plan)
        .unwrap_or_default();
    let requested = ctx.quota.limits_for(plan);
    if actual.memory_mb < requested.max_ram_mb {
        warn!(
            requested_mb = requested.max_ram_mb,
            actual_mb = actual.memory_mb,
            "runtime did not honor the full memory cap"
        );
    }

    tokio::time::sleep(VERIFY_GRACE_PERIOD).await;

    if !ctx.driver.is_running(&started.container_ref).await? {
        let logs = ctx
            .driver
            .get_logs(&started.container_ref, 200)
            .await
            .unwrap_or_default();
        ctx.store
            .update_deployment(DeploymentUpdate::new(run.deployment.id).runtime_log(logs))
            .await?;
        return Err(Error::Runtime(
            "container exited during the verify grace window".to_string(),
        ));
    }

    Ok(())
}

/// Binds the subdomain, flips both the deployment and app to Running, and
/// cleans the clone directory.
#[instrument(skip_all, fields(app_id = %run.app.id, deployment_id = %run.deployment.id))]
pub(super) async fn publish(ctx: &EngineCtx, run: &Run, started: &Started, workdir: &Path) -> Result<()> {
    ctx.router
        .bind(&started.subdomain, &run.app.id, started.host_port)
        .await?;

    ctx.store
        .update_deployment(DeploymentUpdate::new(run.deployment.id).status(Status::Running))
        .await?;
    ctx.store
        .update_app_status(&run.app.id, Status::Running)
        .await?;

    let _ = tokio::fs::remove_dir_all(workdir).await;

    Ok(())
}
