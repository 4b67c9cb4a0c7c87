//! The reconcile loop. Passes are driven by a fixed interval and by
//! container lifecycle triggers; each pass assembles desired state, reads
//! the mesh, diffs, and applies. Pass failures are absorbed; the loop only
//! exits on shutdown.

pub(crate) mod apply;
pub(crate) mod cleanup;
pub(crate) mod desired;
pub(crate) mod diff;
pub(crate) mod trigger;

pub use apply::ApplySummary;
pub use cleanup::{CleanupSummary, cleanup_managed_services};
pub use trigger::{pump_events, trigger_channel};

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::state::SharedContext;
use crate::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Converged,
    Applied,
    Partial,
    RuntimeUnavailable,
    MeshUnavailable,
    Interrupted,
}

impl PassOutcome {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            PassOutcome::Converged => "converged",
            PassOutcome::Applied => "applied",
            PassOutcome::Partial => "partial",
            PassOutcome::RuntimeUnavailable => "runtime_unavailable",
            PassOutcome::MeshUnavailable => "mesh_unavailable",
            PassOutcome::Interrupted => "interrupted",
        }
    }
}

pub async fn reconcile_loop(
    ctx: SharedContext,
    mut triggers: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(ctx.cfg.reconcile_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // The first tick fires immediately, which is the startup pass.
        let reason = tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => "interval",
            maybe_trigger = triggers.recv() => match maybe_trigger {
                Some(()) => "event",
                None => break,
            },
        };

        let outcome = run_pass(&ctx, &shutdown).await;
        debug!(reason, outcome = outcome.label(), "reconcile pass finished");
        if outcome == PassOutcome::Interrupted {
            break;
        }
    }

    debug!("reconcile loop stopped");
}

pub async fn run_pass(ctx: &SharedContext, shutdown: &watch::Receiver<bool>) -> PassOutcome {
    let started = Instant::now();
    let outcome = execute_pass(ctx, shutdown).await;
    telemetry::record_reconcile_result(outcome.label());
    telemetry::record_reconcile_duration(outcome.label(), started.elapsed());
    outcome
}

async fn execute_pass(ctx: &SharedContext, shutdown: &watch::Receiver<bool>) -> PassOutcome {
    if *shutdown.borrow() {
        return PassOutcome::Interrupted;
    }

    let desired = match desired::build_desired(
        &ctx.runtime,
        &ctx.cfg.default_tags,
        Duration::from_millis(ctx.cfg.probe_timeout_ms),
    )
    .await
    {
        Ok(desired) => desired,
        Err(error) => {
            warn!(%error, "skipping pass; container runtime unavailable");
            return PassOutcome::RuntimeUnavailable;
        }
    };
    telemetry::record_managed_services(desired.len());

    if *shutdown.borrow() {
        return PassOutcome::Interrupted;
    }

    let serve = match ctx.mesh.serve_status().await {
        Ok(serve) => serve,
        Err(error) => {
            warn!(%error, "skipping pass; serve status unavailable");
            return PassOutcome::MeshUnavailable;
        }
    };
    let funnel = match ctx.mesh.funnel_status().await {
        Ok(funnel) => funnel,
        Err(error) => {
            warn!(%error, "skipping pass; funnel status unavailable");
            return PassOutcome::MeshUnavailable;
        }
    };

    let current = diff::managed_records(&serve, &funnel);
    let plan = diff::diff(&desired, &current);
    if plan.is_empty() {
        debug!(services = desired.len(), "mesh already converged");
        return PassOutcome::Converged;
    }

    info!(
        create = plan.create.len(),
        update = plan.update.len(),
        delete = plan.delete.len(),
        "applying service changes"
    );
    let summary = apply::apply_diff(&ctx.mesh, ctx.api.as_ref(), &desired, &plan, shutdown).await;
    if summary.interrupted {
        return PassOutcome::Interrupted;
    }
    if summary.failed > 0 {
        info!(
            changed = summary.changed(),
            failed = summary.failed,
            "pass applied with failures"
        );
        return PassOutcome::Partial;
    }

    info!(
        created = summary.created,
        updated = summary.updated,
        deleted = summary.deleted,
        "pass applied"
    );
    PassOutcome::Applied
}
