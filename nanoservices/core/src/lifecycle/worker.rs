use std::sync::Arc;

use parrot_utils::error::Error;
use parrot_utils::ParrotResult;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::{Assignment, AssignmentTable, CoordinationBackend, OwnershipGuard};
use crate::config::{LifecycleConfig, RouteConfig};
use crate::lifecycle::state::ProcessorStateMachine;
use crate::model::{DesiredState, LifecycleState, NodeId, ProcessorDefinition};
use crate::route::{RouteEngine, RouteHandle, RouteProgress};
use crate::sinks::SinkResolver;
use crate::sources::SourceProvider;
use crate::store::Registry;

/// Everything a worker needs, shared by all workers of one node.
pub struct WorkerContext {
    pub node: NodeId,
    pub registry: Arc<Registry>,
    pub backend: Arc<dyn CoordinationBackend>,
    pub sources: Arc<dyn SourceProvider>,
    pub sinks: SinkResolver,
    pub lifecycle: LifecycleConfig,
    pub route: RouteConfig,
}

struct RunningEngine {
    handle: RouteHandle,
    guard: OwnershipGuard,
    progress: watch::Receiver<RouteProgress>,
    started_at: Instant,
    /// The engine task has ended and its handle must be collected.
    ended: bool,
}

enum Pass {
    Continue,
    Exit,
}

/// Reconciliation loop for one processor owned by this node.
///
/// The worker lives while this node is the recorded owner. It wakes on its
/// tick, on assignment changes, on registry changes and on engine progress,
/// and on each pass brings the processor's runtime state in line with the
/// definition.
pub struct ProcessorWorker {
    processor_id: String,
    ctx: Arc<WorkerContext>,
    machine: ProcessorStateMachine,
    engine: Option<RunningEngine>,
}

impl ProcessorWorker {
    pub async fn new(processor_id: &str, ctx: Arc<WorkerContext>) -> ParrotResult<Self> {
        let generation = ctx
            .registry
            .get(processor_id)
            .await?
            .map(|def| def.restart_generation)
            .unwrap_or_default();
        let machine = ProcessorStateMachine::resume(
            processor_id,
            ctx.node.clone(),
            generation,
            ctx.registry.clone(),
        )
        .await?;
        Ok(Self { processor_id: processor_id.to_string(), ctx, machine, engine: None })
    }

    pub fn state(&self) -> LifecycleState {
        self.machine.state()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> String {
        let mut ticker = tokio::time::interval(self.ctx.lifecycle.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut assignments = self.ctx.backend.subscribe_assignments();
        let mut revisions = self.ctx.registry.subscribe();

        loop {
            let table = assignments.borrow_and_update().clone();
            match self.reconcile(&table).await {
                Ok(Pass::Continue) => {}
                Ok(Pass::Exit) => break,
                Err(e) => warn!(processor = %self.processor_id, error = %e, "reconciliation pass failed"),
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = assignments.changed() => if changed.is_err() { break },
                changed = revisions.changed() => if changed.is_err() { break },
                _ = engine_event(&mut self.engine) => {}
                _ = shutdown.changed() => break,
            }
        }

        if let Err(e) = self.halt().await {
            warn!(processor = %self.processor_id, error = %e, "failed to stop processor cleanly");
        }
        debug!(processor = %self.processor_id, "worker exited");
        self.processor_id
    }

    /// One reconciliation pass against the latest assignment table.
    async fn reconcile(&mut self, table: &AssignmentTable) -> ParrotResult<Pass> {
        let owned = table.owner(&self.processor_id).filter(|a| a.node_id == self.ctx.node).cloned();
        if let Some(engine) = &self.engine {
            match &owned {
                Some(assignment) => engine.guard.observe(assignment.epoch),
                None => engine.guard.revoke(),
            }
        }

        self.collect_engine().await?;

        let Some(assignment) = owned else {
            info!(processor = %self.processor_id, node = %self.ctx.node, "no longer the recorded owner");
            self.halt().await?;
            return Ok(Pass::Exit);
        };
        let Some(def) = self.ctx.registry.get(&self.processor_id).await? else {
            self.halt().await?;
            return Ok(Pass::Exit);
        };

        if def.desired_state != DesiredState::Running {
            self.halt().await?;
            self.machine.report().await?;
            return Ok(Pass::Continue);
        }

        if def.restart_generation != self.machine.generation() {
            info!(processor = %self.processor_id, generation = def.restart_generation, "restart requested");
            if self.machine.state() != LifecycleState::Stopping {
                self.machine.transition(LifecycleState::Stopping).await?;
            }
            self.stop_engine().await;
            self.machine.set_generation(def.restart_generation);
            self.start(&def, &assignment).await?;
            return Ok(Pass::Continue);
        }

        match self.machine.state() {
            LifecycleState::Created | LifecycleState::Stopped => self.start(&def, &assignment).await?,
            LifecycleState::Starting | LifecycleState::Running | LifecycleState::Stopping
                if self.engine.is_none() =>
            {
                // left over from an earlier run of this node
                self.halt().await?;
                self.start(&def, &assignment).await?;
            }
            LifecycleState::Starting => self.promote_when_healthy().await?,
            LifecycleState::Running | LifecycleState::Stopping | LifecycleState::Error => {
                self.machine.report().await?
            }
        }
        Ok(Pass::Continue)
    }

    /// STARTING with a bounded number of immediate attempts; exhausting them
    /// moves the processor to ERROR.
    async fn start(&mut self, def: &ProcessorDefinition, assignment: &Assignment) -> ParrotResult<()> {
        self.machine.transition(LifecycleState::Starting).await?;
        let attempts = self.ctx.lifecycle.start_attempts.max(1);
        let mut failure = None;
        for attempt in 1..=attempts {
            match self.launch(def, assignment).await {
                Ok(engine) => {
                    self.engine = Some(engine);
                    return Ok(());
                }
                Err(e) => {
                    warn!(processor = %self.processor_id, attempt, attempts, error = %e, "start attempt failed");
                    failure = Some(e);
                }
            }
        }
        let cause = failure.unwrap_or_else(|| Error::sink("processor failed to start"));
        self.machine.fail(&cause).await
    }

    async fn launch(&self, def: &ProcessorDefinition, assignment: &Assignment) -> ParrotResult<RunningEngine> {
        let dialect = self.ctx.sinks.resolve(&def.sink.dialect)?;
        let database = &def.sink.database;
        if !dialect.database_exists(database).await? {
            info!(processor = %def.id, database = %database, sink = dialect.name(), "creating sink database");
            dialect.create_database(database).await?;
        }

        let after = self.ctx.registry.last_offset(&def.id).await?;
        let stream = self.ctx.sources.open(&def.source, after).await?;
        info!(
            processor = %def.id,
            source = self.ctx.sources.name(),
            topic = %def.source.topic,
            after = ?after.map(|o| o.0),
            "opened change stream"
        );

        let guard = OwnershipGuard::new(&def.id, assignment.epoch);
        let handle = RouteEngine::new(
            def.id.clone(),
            database.clone(),
            dialect,
            self.ctx.registry.clone(),
            guard.clone(),
            self.ctx.route.clone(),
        )
        .spawn(stream);
        let progress = handle.progress();
        Ok(RunningEngine { handle, guard, progress, started_at: Instant::now(), ended: false })
    }

    /// STARTING -> RUNNING after the first applied batch, or once the grace
    /// period has passed without an error.
    async fn promote_when_healthy(&mut self) -> ParrotResult<()> {
        let Some(engine) = &self.engine else {
            return Ok(());
        };
        let applied = engine.progress.borrow().batches_applied > 0;
        if applied || engine.started_at.elapsed() >= self.ctx.lifecycle.grace_period {
            self.machine.transition(LifecycleState::Running).await?;
        }
        Ok(())
    }

    /// Settle an engine that ended on its own.
    async fn collect_engine(&mut self) -> ParrotResult<()> {
        let finished = self.engine.as_ref().is_some_and(|e| e.ended || e.handle.is_finished());
        if !finished {
            return Ok(());
        }
        let Some(mut engine) = self.engine.take() else {
            return Ok(());
        };
        match engine.handle.wait().await {
            Err(Error::Fenced { expected, actual, .. }) => {
                info!(processor = %self.processor_id, expected, actual, "route engine fenced");
                self.machine.transition(LifecycleState::Stopping).await?;
                self.machine.transition(LifecycleState::Stopped).await
            }
            Err(e) => self.machine.fail(&e).await,
            Ok(()) => {
                if self.machine.state() != LifecycleState::Stopping {
                    self.machine.transition(LifecycleState::Stopping).await?;
                }
                self.machine.transition(LifecycleState::Stopped).await
            }
        }
    }

    /// Drain the engine and settle in STOPPED. ERROR and never-started
    /// processors are left as they are.
    async fn halt(&mut self) -> ParrotResult<()> {
        let state = self.machine.state();
        let active = matches!(
            state,
            LifecycleState::Starting | LifecycleState::Running | LifecycleState::Stopping
        );
        if !active && self.engine.is_none() {
            return Ok(());
        }
        if state != LifecycleState::Stopping {
            self.machine.transition(LifecycleState::Stopping).await?;
        }
        self.stop_engine().await;
        self.machine.transition(LifecycleState::Stopped).await
    }

    async fn stop_engine(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        let last_offset = engine.progress.borrow().last_offset;
        match engine.handle.stop(self.ctx.lifecycle.drain_timeout).await {
            Ok(()) | Err(Error::Fenced { .. }) => {}
            Err(e) => warn!(processor = %self.processor_id, error = %e, "route engine failed while draining"),
        }
        info!(
            processor = %self.processor_id,
            last_offset = ?last_offset.map(|o| o.0),
            "route engine stopped"
        );
    }
}

/// Resolves when the engine reports progress or ends; never while idle.
async fn engine_event(engine: &mut Option<RunningEngine>) {
    match engine {
        Some(running) if !running.ended => {
            if running.progress.changed().await.is_err() {
                running.ended = true;
            }
        }
        _ => std::future::pending().await,
    }
}
