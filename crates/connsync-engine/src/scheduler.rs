//! Periodic pipeline scheduler
//!
//! Every tick the scheduler picks the enabled pipelines whose last successful
//! run is older than their sync interval and runs them, at most
//! `max_concurrent_runs` at a time. Each run gets its own source, destination
//! and runner; only the checkpoint store and run ledger are shared.
//!
//! A pipeline that failed with a non-retryable error is parked until the
//! process restarts. Retryable failures do not move the last successful run,
//! so the pipeline is simply due again on the next tick.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use connsync_common::{EndUser, ErrorKind};

use crate::checkpoint::CheckpointStore;
use crate::config::{Config, PipelineConfig, SchedulerConfig};
use crate::destination::Destination;
use crate::ledger::{RunLedger, RunRecord};
use crate::runner::{RunResult, Runner, RunnerConfig, SyncInstance};
use crate::source::Source;

/// Source and destination built for one run
pub struct BuiltPipeline {
    pub source: Box<dyn Source>,
    pub destination: Box<dyn Destination>,
}

/// Turns pipeline configuration into connector values
#[async_trait]
pub trait PipelineFactory: Send + Sync {
    async fn build(&self, pipeline: &PipelineConfig) -> anyhow::Result<BuiltPipeline>;
}

pub struct Scheduler {
    config: SchedulerConfig,
    runner_config: RunnerConfig,
    pipelines: Vec<PipelineConfig>,
    factory: Arc<dyn PipelineFactory>,
    store: Arc<dyn CheckpointStore>,
    ledger: Arc<dyn RunLedger>,
    parked: Mutex<HashSet<String>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        config: &Config,
        factory: Arc<dyn PipelineFactory>,
        store: Arc<dyn CheckpointStore>,
        ledger: Arc<dyn RunLedger>,
    ) -> Self {
        Self {
            config: config.scheduler.clone(),
            runner_config: config.runner.clone(),
            pipelines: config.pipelines.clone(),
            factory,
            store,
            ledger,
            parked: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop scheduling and cancel in-flight runs when `token` fires
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn parked(&self) -> MutexGuard<'_, HashSet<String>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_parked(&self, pipeline_id: &str) -> bool {
        self.parked().contains(pipeline_id)
    }

    /// Enabled, unparked pipelines whose last success is older than their
    /// interval as of `now`
    pub async fn due_pipelines(&self, now: DateTime<Utc>) -> Vec<&PipelineConfig> {
        let mut due = Vec::new();

        for pipeline in &self.pipelines {
            if !pipeline.enabled || self.is_parked(&pipeline.id) {
                continue;
            }

            let last = match self.ledger.last_success(&pipeline.id).await {
                Ok(last) => last,
                Err(err) => {
                    warn!(pipeline = %pipeline.id, error = %err, "Skipping pipeline, run ledger unavailable");
                    continue;
                },
            };

            let interval = chrono::Duration::from_std(pipeline.sync_interval(&self.config))
                .unwrap_or(chrono::Duration::MAX);
            let is_due = match last {
                None => true,
                Some(last) => now.signed_duration_since(last) >= interval,
            };

            if is_due {
                due.push(pipeline);
            }
        }

        due
    }

    /// Run every due pipeline once. Returns the outcome per pipeline id.
    pub async fn tick(&self) -> Vec<(String, RunResult)> {
        let due = self.due_pipelines(Utc::now()).await;
        if due.is_empty() {
            debug!("No pipelines due");
            return Vec::new();
        }

        info!(due = due.len(), max_concurrent = self.config.max_concurrent_runs, "Scheduling sync runs");

        let outcomes = Mutex::new(Vec::with_capacity(due.len()));
        futures::stream::iter(due)
            .for_each_concurrent(self.config.max_concurrent_runs, |pipeline| {
                let outcomes = &outcomes;
                async move {
                    let result = self.run_pipeline(pipeline).await;
                    outcomes
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((pipeline.id.clone(), result));
                }
            })
            .await;

        outcomes.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build and run one pipeline, then record the outcome
    pub async fn run_pipeline(&self, pipeline: &PipelineConfig) -> RunResult {
        let started_at = Utc::now();

        let result = match self.factory.build(pipeline).await {
            Ok(BuiltPipeline {
                source,
                mut destination,
            }) => {
                let instance = SyncInstance::new(
                    pipeline.id.clone(),
                    pipeline.end_user_id.clone().map(EndUser::new),
                );
                let runner = Runner::new(self.runner_config.clone())
                    .with_cancellation(self.cancel.child_token());

                runner
                    .run(&instance, source.as_ref(), destination.as_mut(), self.store.as_ref())
                    .await
            },
            Err(err) => {
                error!(pipeline = %pipeline.id, error = %err, "Failed to build pipeline");
                RunResult {
                    error: Some(ErrorKind::FatalConfiguration),
                    error_message: Some(format!("{:#}", err)),
                    ..RunResult::default()
                }
            },
        };

        if let Some(kind) = result.error {
            if !kind.is_retryable() {
                warn!(pipeline = %pipeline.id, kind = %kind, "Parking pipeline after non-retryable failure");
                self.parked().insert(pipeline.id.clone());
            }
        }

        let record = RunRecord::new(pipeline.id.clone(), started_at, Utc::now(), result.clone());
        if let Err(err) = self.ledger.record(&record).await {
            warn!(pipeline = %pipeline.id, error = %err, "Failed to record run");
        }

        result
    }

    /// Tick until cancelled
    pub async fn run_forever(&self) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            pipelines = self.pipelines.len(),
            tick_secs = self.config.tick_interval_secs,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let outcomes = self.tick().await;
                    let failed = outcomes.iter().filter(|(_, r)| !r.is_success()).count();
                    if !outcomes.is_empty() {
                        info!(runs = outcomes.len(), failed, "Scheduler tick finished");
                    }
                },
            }
        }

        info!("Scheduler stopped");
    }
}
