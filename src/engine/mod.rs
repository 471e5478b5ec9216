//! The Deployment Engine — the background control loop that drives each
//! deployment through acquire → clone → validate → build → run → verify
//! → publish, with at-most-one-in-flight-per-app semantics and
//! container/image GC.
//!
//! A `tokio::sync::Semaphore`-bounded admission loop claims pending
//! deployments and spawns one `tokio::task` per pipeline. No separate
//! queue/run channel pair is needed: the "build" step is the Driver's
//! own `BuildImage` call rather than an in-process build, so claim and
//! spawn collapse into a single loop.

mod pipeline;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::driver::ContainerDriver;
use crate::error::Result;
use crate::model::{Deployment, Status};
use crate::quota::QuotaGate;
use crate::router::RouterBinding;
use crate::source::{deployment_workdir, SourceFetcher};
use crate::store::{DeploymentUpdate, StateStore};

use self::pipeline::Run;

/// Docker's own default when a container isn't given an explicit share;
/// `PlanLimits` carries memory/disk tiers but not CPU (see DESIGN.md),
/// so every container gets the same share and relies on memory/disk caps
/// to differentiate plans.
const DEFAULT_CPU_SHARES: u32 = 512;

/// Grace window Verify waits before declaring an early exit; kept well
/// inside `Config::run_timeout` instead of configurable on its own.
const VERIFY_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// How often the build-log sink flushes its in-memory buffer to the
/// store while a build is in progress.
const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Shared, cheaply-cloned handles every pipeline stage needs. Kept as a
/// plain struct (not the Engine itself) so pipeline stages borrow only
/// what they use.
pub(crate) struct EngineCtx {
    store: Arc<dyn StateStore>,
    fetcher: Arc<dyn SourceFetcher>,
    driver: Arc<dyn ContainerDriver>,
    router: Arc<dyn RouterBinding>,
    quota: Arc<dyn QuotaGate>,
    config: Config,
}

pub struct Engine {
    ctx: Arc<EngineCtx>,
    semaphore: Arc<Semaphore>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn StateStore>,
        fetcher: Arc<dyn SourceFetcher>,
        driver: Arc<dyn ContainerDriver>,
        router: Arc<dyn RouterBinding>,
        quota: Arc<dyn QuotaGate>,
        config: Config,
    ) -> Arc<Self> {
        let max_in_flight = config.max_in_flight;
        Arc::new(Self {
            ctx: Arc::new(EngineCtx {
                store,
                fetcher,
                driver,
                router,
                quota,
                config,
            }),
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
        })
    }

    /// Start-up reconciliation: deployments left in `Building` when the
    /// previous process died are marked `Failed` with reason "orphaned"
    /// rather than resumed.
    #[instrument(skip(self))]
    pub async fn reconcile_orphans(&self) -> Result<()> {
        let orphaned = self.ctx.store.mark_orphaned_building_as_failed().await?;
        for d in &orphaned {
            warn!(deployment_id = d.id, app_id = %d.app_id, "marked orphaned deployment as failed");
        }
        Ok(())
    }

    /// Runs the control loop until `shutdown` is cancelled. Never panics
    /// on a single bad tick — transient store errors are logged and the
    /// loop backs off for one poll interval before retrying.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if let Err(err) = self.reconcile_orphans().await {
            error!(%err, "failed start-up reconciliation");
        }

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.ctx.config.poll_interval()) => {}
                        _ = shutdown.cancelled() => break,
                    }
                    continue;
                }
            };

            match self.ctx.store.claim_next_pending().await {
                Ok(Some(deployment)) => {
                    let ctx = Arc::clone(&self.ctx);
                    let token = shutdown.child_token();
                    tokio::spawn(async move {
                        let _permit = permit;
                        process_deployment(ctx, deployment, token).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.ctx.config.poll_interval()) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                Err(err) => {
                    error!(%err, "failed to claim next pending deployment");
                    drop(permit);
                    tokio::time::sleep(self.ctx.config.poll_interval()).await;
                }
            }
        }

        info!("engine control loop stopped");
    }

    /// Deletes an app and reclaims its external resources. Idempotent:
    /// calling this on an app that is already gone is a no-op success.
    pub async fn delete_app(&self, app_id: &str) -> Result<()> {
        delete_app(&self.ctx, app_id).await
    }
}

/// Drives one deployment through the full pipeline, converting the first
/// stage error into a terminal `Failed` status on both the deployment
/// and its app. Cancellation leaves the deployment in whatever state it
/// last persisted — the next engine start reconciles it via
/// `reconcile_orphans`.
#[instrument(skip(ctx, token), fields(deployment_id = deployment.id, app_id = %deployment.app_id))]
async fn process_deployment(ctx: Arc<EngineCtx>, deployment: Deployment, token: CancellationToken) {
    let app = match ctx.store.get_app(&deployment.app_id).await {
        Ok(Some(app)) => app,
        Ok(None) => {
            error!("deployment's app vanished mid-pipeline");
            return;
        }
        Err(err) => {
            error!(%err, "failed to load app for deployment");
            return;
        }
    };

    let run = Run { app, deployment };

    if let Err(err) = drive(&ctx, &run, &token).await {
        fail(&ctx, &run, &err).await;
    }
}

/// Races `fut` against `budget`, converting an expired deadline into the
/// error the caller would see from the stage itself. Every external call
/// in the pipeline carries a deadline this way.
async fn with_deadline<T>(
    budget: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
    timed_out: impl FnOnce(Duration) -> crate::error::Error,
) -> Result<T> {
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(timed_out(budget)),
    }
}

/// Runs admit → fetch → build → run → verify → publish → GC in order,
/// bailing out (without marking anything failed) the moment `token` is
/// cancelled between stages.
async fn drive(ctx: &Arc<EngineCtx>, run: &Run, token: &CancellationToken) -> Result<()> {
    pipeline::admit(ctx, run).await?;
    if token.is_cancelled() {
        return Ok(());
    }

    // Fetch and Build share the build budget, the largest one configured;
    // a stuck git clone is as much a build-stage problem as a stuck
    // docker build.
    let workdir = with_deadline(ctx.config.build_timeout(), pipeline::fetch(ctx, run), |d| {
        crate::error::Error::TransientInfra(format!("fetch exceeded its {d:?} deadline"))
    })
    .await?;
    if token.is_cancelled() {
        return Ok(());
    }

    let image_ref = with_deadline(
        ctx.config.build_timeout(),
        pipeline::build(ctx, run, &workdir),
        |d| crate::error::Error::Build(format!("build exceeded its {d:?} deadline")),
    )
    .await?;
    if token.is_cancelled() {
        return Ok(());
    }

    let started = with_deadline(
        ctx.config.run_timeout(),
        pipeline::run_stage(ctx, run, &workdir, &image_ref),
        |d| crate::error::Error::Runtime(format!("run exceeded its {d:?} deadline")),
    )
    .await?;
    if token.is_cancelled() {
        return Ok(());
    }

    with_deadline(
        ctx.config.run_timeout(),
        pipeline::verify(ctx, run, &started),
        |d| crate::error::Error::Runtime(format!("verify exceeded its {d:?} deadline")),
    )
    .await?;
    if token.is_cancelled() {
        return Ok(());
    }

    pipeline::publish(ctx, run, &started, &workdir).await?;

    gc_previous_deployment(Arc::clone(ctx), run.app.id.clone(), run.deployment.id);

    Ok(())
}

/// Persists a stage error as the deployment's terminal state, reclaims any
/// container the Run stage already started, marks the app's aggregate
/// status, and removes the clone directory. Every stage's failure funnels
/// through this one path since they all get the same treatment.
async fn fail(ctx: &Arc<EngineCtx>, run: &Run, err: &crate::error::Error) {
    warn!(app_id = %run.app.id, deployment_id = run.deployment.id, %err, "deployment failed");

    // Verify can fail after Run has already persisted a container_ref; the
    // in-memory `run.deployment` predates that write, so re-read the row to
    // find out whether a container needs reclaiming.
    let container_ref = match ctx.store.get_deployment(run.deployment.id).await {
        Ok(Some(d)) => d.container_ref,
        Ok(None) => None,
        Err(store_err) => {
            error!(%store_err, "failed to re-read deployment before reclaiming its container");
            None
        }
    };
    if let Some(container_ref) = container_ref {
        if let Err(err) = ctx
            .driver
            .stop(&container_ref, ctx.config.stop_timeout_secs as u32)
            .await
        {
            warn!(%err, deployment_id = run.deployment.id, "fail: stop failed");
        }
        if let Err(err) = ctx.driver.remove(&container_ref).await {
            warn!(%err, deployment_id = run.deployment.id, "fail: remove failed");
        }
    }

    let update = DeploymentUpdate::new(run.deployment.id)
        .status(Status::Failed)
        .error_message(err.to_string());
    if let Err(store_err) = ctx.store.update_deployment(update).await {
        error!(%store_err, "failed to persist deployment failure");
    }
    if let Err(store_err) = ctx.store.update_app_status(&run.app.id, Status::Failed).await {
        error!(%store_err, "failed to persist app failure status");
    }

    let workdir = deployment_workdir(&ctx.config.workroot, &run.app.id, run.deployment.id);
    let _ = tokio::fs::remove_dir_all(&workdir).await;
}

/// Post-success GC: stops, removes, and un-images every *other*
/// deployment of this app still marked Running. Runs after
/// the new deployment is already Running (swap-then-reap — see
/// DESIGN.md), never before, so the app is never observably down. Spawned
/// detached: failures here are logged, not fatal to the deployment that
/// triggered them.
fn gc_previous_deployment(ctx: Arc<EngineCtx>, app_id: String, new_deployment_id: i64) {
    tokio::spawn(async move {
        let siblings = match ctx.store.list_deployments_by_app(&app_id).await {
            Ok(s) => s,
            Err(err) => {
                error!(%err, app_id, "post-publish GC: failed to list sibling deployments");
                return;
            }
        };

        for sibling in siblings
            .into_iter()
            .filter(|d| d.id != new_deployment_id && d.status == Status::Running)
        {
            // The sibling's subdomain is the app's slug, which the new
            // deployment's publish() step already rebound to itself — unbinding
            // it here would tear down the route we just switched traffic onto.
            if let Some(container_ref) = &sibling.container_ref {
                if let Err(err) = ctx
                    .driver
                    .stop(container_ref, ctx.config.stop_timeout_secs as u32)
                    .await
                {
                    warn!(%err, deployment_id = sibling.id, "post-publish GC: stop failed");
                }
                if let Err(err) = ctx.driver.remove(container_ref).await {
                    warn!(%err, deployment_id = sibling.id, "post-publish GC: remove failed");
                }
            }
            if let Some(image_ref) = &sibling.image_ref {
                if let Err(err) = ctx.driver.remove_image(image_ref).await {
                    warn!(%err, deployment_id = sibling.id, "post-publish GC: remove_image failed");
                }
            }

            let update = DeploymentUpdate::new(sibling.id).status(Status::Stopped);
            if let Err(err) = ctx.store.update_deployment(update).await {
                error!(%err, deployment_id = sibling.id, "post-publish GC: failed to mark stopped");
            }
        }
    });
}

/// Stops, removes, and un-images every deployment of `app_id`, best
/// effort, then deletes the app row (which cascades deployments and env
/// vars). The row deletion is the only step that must not be partial;
/// everything before it is cleanup and tolerates individual failures.
async fn delete_app(ctx: &Arc<EngineCtx>, app_id: &str) -> Result<()> {
    let Some(_app) = ctx.store.get_app(app_id).await? else {
        return Ok(());
    };

    let deployments = ctx.store.list_deployments_by_app(app_id).await?;

    for d in &deployments {
        if let Some(subdomain) = &d.subdomain {
            if let Err(err) = ctx.router.unbind(subdomain).await {
                warn!(%err, deployment_id = d.id, "delete_app: unbind failed");
            }
        }
        if let Some(container_ref) = &d.container_ref {
            if let Err(err) = ctx
                .driver
                .stop(container_ref, ctx.config.stop_timeout_secs as u32)
                .await
            {
                warn!(%err, deployment_id = d.id, "delete_app: stop failed");
            }
            if let Err(err) = ctx.driver.remove(container_ref).await {
                warn!(%err, deployment_id = d.id, "delete_app: remove failed");
            }
        }
    }

    for d in &deployments {
        let Some(image_ref) = &d.image_ref else {
            continue;
        };
        match ctx.driver.remove_image(image_ref).await {
            Ok(()) => {}
            Err(err) if err.kind() == "orphan" => {
                // InUse — the container backing it may have only just
                // been removed above; retry once after a short delay.
                tokio::time::sleep(Duration::from_millis(500)).await;
                if let Err(err) = ctx.driver.remove_image(image_ref).await {
                    warn!(%err, deployment_id = d.id, "delete_app: remove_image failed after retry");
                }
            }
            Err(err) => warn!(%err, deployment_id = d.id, "delete_app: remove_image failed"),
        }
    }

    for d in &deployments {
        let workdir = deployment_workdir(&ctx.config.workroot, app_id, d.id);
        let _ = tokio::fs::remove_dir_all(&workdir).await;
    }

    ctx.store.delete_app(app_id).await?;
    Ok(())
}
