use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parrot_utils::error::Error;
use parrot_utils::{ChangeEvent, ChangeStream, ParrotResult, SourceOffset};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cluster::OwnershipGuard;
use crate::config::RouteConfig;
use crate::metrics;
use crate::sinks::SinkDialect;
use crate::store::Registry;

/// What an engine has durably done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteProgress {
    pub batches_applied: u64,
    pub events_applied: u64,
    pub last_offset: Option<SourceOffset>,
}

/// Relays one processor's change stream into its sink.
///
/// Events are batched up to `max_batch_size` or until `max_fill` has passed
/// since the first event of the batch. Each batch is applied in source order,
/// then its last offset is committed, so a restart replays at most the batch
/// that was in flight.
pub struct RouteEngine {
    processor_id: String,
    database: String,
    dialect: Arc<dyn SinkDialect>,
    registry: Arc<Registry>,
    guard: OwnershipGuard,
    config: RouteConfig,
}

impl RouteEngine {
    pub fn new(
        processor_id: impl Into<String>,
        database: impl Into<String>,
        dialect: Arc<dyn SinkDialect>,
        registry: Arc<Registry>,
        guard: OwnershipGuard,
        config: RouteConfig,
    ) -> Self {
        Self {
            processor_id: processor_id.into(),
            database: database.into(),
            dialect,
            registry,
            guard,
            config,
        }
    }

    pub fn spawn(self, stream: ChangeStream) -> RouteHandle {
        let run_id = Uuid::new_v4().to_string();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (progress_tx, progress_rx) = watch::channel(RouteProgress::default());
        tracing::info!(
            processor = %self.processor_id,
            run = %run_id,
            sink = self.dialect.name(),
            epoch = self.guard.epoch(),
            "route engine started"
        );
        let task = tokio::spawn(self.run(run_id.clone(), stream, stop_rx, progress_tx));
        RouteHandle { run_id, stop: stop_tx, progress: progress_rx, task: Some(task) }
    }

    async fn run(
        self,
        run_id: String,
        mut stream: ChangeStream,
        mut stop: watch::Receiver<bool>,
        progress: watch::Sender<RouteProgress>,
    ) -> ParrotResult<()> {
        let max_batch = self.config.max_batch_size.max(1);
        let mut batch: Vec<ChangeEvent> = Vec::with_capacity(max_batch);
        let mut flush_at: Option<Instant> = None;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break Ok(()),
                _ = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    flush_at = None;
                    if let Err(e) = self.apply(std::mem::take(&mut batch), &progress).await {
                        break Err(e);
                    }
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        batch.push(event);
                        if flush_at.is_none() {
                            flush_at = Some(Instant::now() + self.config.max_fill);
                        }
                        if batch.len() >= max_batch {
                            flush_at = None;
                            if let Err(e) = self.apply(std::mem::take(&mut batch), &progress).await {
                                break Err(e);
                            }
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Err(Error::Transport(format!(
                        "change stream for processor '{}' ended",
                        self.processor_id
                    ))),
                },
            }
        };

        // drain what was already read, unless the engine is failing anyway
        let outcome = match outcome {
            Ok(()) if !batch.is_empty() => self.apply(std::mem::take(&mut batch), &progress).await,
            other => other,
        };
        match &outcome {
            Ok(()) => tracing::info!(processor = %self.processor_id, run = %run_id, "route engine drained"),
            Err(e) => tracing::error!(processor = %self.processor_id, run = %run_id, error = %e, "route engine failed"),
        }
        outcome
    }

    async fn apply(&self, batch: Vec<ChangeEvent>, progress: &watch::Sender<RouteProgress>) -> ParrotResult<()> {
        let Some(last_offset) = batch.last().map(|e| e.offset) else {
            return Ok(());
        };
        self.guard.check()?;

        let started = std::time::Instant::now();
        let applied = match self.dialect.apply(&self.database, &batch).await {
            Ok(applied) => applied,
            Err(e) => {
                metrics::inc_sink_error(&self.processor_id);
                return Err(e);
            }
        };
        metrics::observe_batch_duration(&self.processor_id, started.elapsed().as_secs_f64() * 1000.0);
        metrics::add_events_applied(&self.processor_id, applied);

        self.registry.commit_offset(&self.processor_id, last_offset).await?;
        progress.send_modify(|p| {
            p.batches_applied += 1;
            p.events_applied += applied as u64;
            p.last_offset = Some(last_offset);
        });
        tracing::debug!(processor = %self.processor_id, events = applied, offset = %last_offset, "batch applied");
        Ok(())
    }
}

/// Owner's side of a running engine. Dropping it aborts the engine.
pub struct RouteHandle {
    run_id: String,
    stop: watch::Sender<bool>,
    progress: watch::Receiver<RouteProgress>,
    task: Option<JoinHandle<ParrotResult<()>>>,
}

impl RouteHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn progress(&self) -> watch::Receiver<RouteProgress> {
        self.progress.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the engine to end on its own and return how it ended.
    pub async fn wait(&mut self) -> ParrotResult<()> {
        match self.task.take() {
            Some(task) => joined(task.await),
            None => Ok(()),
        }
    }

    /// Ask the engine to drain. If it has not finished within `drain_timeout`
    /// it is aborted and its in-flight batch abandoned.
    pub async fn stop(mut self, drain_timeout: Duration) -> ParrotResult<()> {
        let _ = self.stop.send(true);
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };
        match tokio::time::timeout(drain_timeout, &mut task).await {
            Ok(result) => joined(result),
            Err(_) => {
                tracing::warn!(run = %self.run_id, "route engine did not drain in time, aborting");
                task.abort();
                Ok(())
            }
        }
    }
}

impl Drop for RouteHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn joined(result: Result<ParrotResult<()>, tokio::task::JoinError>) -> ParrotResult<()> {
    match result {
        Ok(outcome) => outcome,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(Error::sink(format!("route engine task failed: {e}"))),
    }
}
