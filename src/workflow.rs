//! Workflow engine
//!
//! Sequences PRECHECK -> RUN -> PROBE -> COLLECT -> REPORT against a
//! `TestBackend`. Each stage ends as SUCCESS, WARNING (advisory, the run goes
//! on) or ERROR (the run stops). The state is published on a watch channel
//! after every transition so callers can follow progress.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::TestBackend;
use crate::config::ProbeConfig;
use crate::consistency::{self, PrecheckSummary};
use crate::error::{BackendError, BackendResult, EngineError};
use crate::models::{CollectResult, ProbeSnapshot};
use crate::probe::ProbeCoordinator;
use crate::report::{self, Report};

// ============ State ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    #[default]
    Idle,
    Precheck,
    Run,
    Probe,
    Collect,
    Report,
    Completed,
    Error,
    Aborted,
}

impl Stage {
    /// Working stages in execution order
    pub const SEQUENCE: [Stage; 5] = [
        Stage::Precheck,
        Stage::Run,
        Stage::Probe,
        Stage::Collect,
        Stage::Report,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Precheck => "precheck",
            Stage::Run => "run",
            Stage::Probe => "probe",
            Stage::Collect => "collect",
            Stage::Report => "report",
            Stage::Completed => "completed",
            Stage::Error => "error",
            Stage::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Error | Stage::Aborted)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub status: StageStatus,
    pub message: String,
}

/// Everything a caller can observe about a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowState {
    pub run_id: Option<Uuid>,
    pub config: Option<String>,
    pub stage: Stage,
    pub stage_status: BTreeMap<Stage, StageReport>,
    pub last_error: Option<String>,
    /// Stages entered so far, in order, terminal stage included
    pub history: Vec<Stage>,
    pub precheck: Option<PrecheckSummary>,
    pub probe: Option<ProbeSnapshot>,
    pub collect: Option<CollectResult>,
    pub report: Option<Report>,
}

impl WorkflowState {
    pub fn status_of(&self, stage: Stage) -> Option<StageStatus> {
        self.stage_status.get(&stage).map(|r| r.status)
    }

    pub fn message_of(&self, stage: Stage) -> Option<&str> {
        self.stage_status.get(&stage).map(|r| r.message.as_str())
    }

    pub fn is_running(&self) -> bool {
        self.stage != Stage::Idle && !self.stage.is_terminal()
    }

    /// `in_flight` is the stage that was cut short, if any
    fn mark_aborted(&mut self, in_flight: Option<Stage>) {
        if let Some(stage) = in_flight {
            self.stage_status.insert(stage, StageReport {
                status: StageStatus::Error,
                message: "aborted".to_string(),
            });
        }
        self.last_error = Some("workflow aborted".to_string());
        self.stage = Stage::Aborted;
        self.history.push(Stage::Aborted);
    }
}

/// Per-run context handed to every stage handler
pub struct WorkflowContext {
    pub run_id: Uuid,
    pub config: String,
    pub cancel: CancellationToken,
}

// ============ Stage outcomes ============

/// A stage that finished and lets the run go on
struct StageOutcome {
    status: StageStatus,
    message: String,
}

impl StageOutcome {
    fn success(message: impl Into<String>) -> Self {
        Self { status: StageStatus::Success, message: message.into() }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self { status: StageStatus::Warning, message: message.into() }
    }
}

/// A stage that stops the run
enum StageFailure {
    Fatal(String),
    Aborted,
}

impl From<BackendError> for StageFailure {
    fn from(e: BackendError) -> Self {
        if e.is_cancelled() {
            StageFailure::Aborted
        } else {
            StageFailure::Fatal(e.to_string())
        }
    }
}

type StageResult = Result<StageOutcome, StageFailure>;

// ============ Engine ============

pub struct WorkflowEngine {
    backend: Arc<dyn TestBackend>,
    probe: ProbeConfig,
    state: Arc<watch::Sender<WorkflowState>>,
    active: Arc<Mutex<Option<CancellationToken>>>,
}

/// Claim on the engine for one run.
///
/// Dropping it cancels the run's token, settles a run that never reached a
/// terminal stage as ABORTED, then frees the in-progress slot.
struct ActiveRun {
    ctx: WorkflowContext,
    slot: Arc<Mutex<Option<CancellationToken>>>,
    state: Arc<watch::Sender<WorkflowState>>,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.ctx.cancel.cancel();

        let run_id = self.ctx.run_id;
        self.state.send_if_modified(|s| {
            if s.run_id != Some(run_id) || s.stage.is_terminal() {
                return false;
            }
            warn!("Workflow {} dropped during {}", run_id, s.stage);
            let in_flight = s.is_running().then_some(s.stage);
            s.mark_aborted(in_flight);
            true
        });

        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

impl WorkflowEngine {
    pub fn new(backend: Arc<dyn TestBackend>, probe: ProbeConfig) -> Self {
        let (state, _) = watch::channel(WorkflowState::default());
        Self {
            backend,
            probe,
            state: Arc::new(state),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Receive every state published from now on
    pub fn subscribe(&self) -> watch::Receiver<WorkflowState> {
        self.state.subscribe()
    }

    /// Current state
    pub fn state(&self) -> WorkflowState {
        self.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Signal the in-flight run to stop. Returns false when nothing is running.
    pub fn abort(&self) -> bool {
        let slot = match self.active.lock() {
            Ok(slot) => slot,
            Err(_) => return false,
        };
        match slot.as_ref() {
            Some(token) => {
                info!("Abort requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run the full workflow for `config`.
    ///
    /// Stage failures never surface as `Err`; inspect the returned state. The
    /// only error is `Busy`, when another run is still in flight.
    pub async fn run(&self, config: &str) -> Result<WorkflowState, EngineError> {
        let active = self.begin(config)?;
        Ok(self.execute(active).await)
    }

    /// Claim the engine and run the workflow on its own task.
    ///
    /// `Busy` is returned before anything is spawned, so a caller that gets
    /// `Ok` knows the run is really underway.
    pub fn start(self: &Arc<Self>, config: &str) -> Result<JoinHandle<WorkflowState>, EngineError> {
        let active = self.begin(config)?;
        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move { engine.execute(active).await }))
    }

    /// Fetch and aggregate a precheck outside of a workflow run
    pub async fn precheck(&self, config: &str, cancel: &CancellationToken) -> BackendResult<PrecheckSummary> {
        let payload = self.backend.precheck(config, cancel).await?;
        Ok(consistency::summarize(payload.records))
    }

    fn begin(&self, config: &str) -> Result<ActiveRun, EngineError> {
        let cancel = CancellationToken::new();
        {
            let mut slot = self.active.lock().map_err(|_| EngineError::Busy)?;
            if slot.is_some() {
                warn!("Refusing to start a workflow while another one is running");
                return Err(EngineError::Busy);
            }
            *slot = Some(cancel.clone());
        }

        let ctx = WorkflowContext {
            run_id: Uuid::new_v4(),
            config: config.to_string(),
            cancel,
        };
        self.reset(&ctx);

        Ok(ActiveRun {
            ctx,
            slot: Arc::clone(&self.active),
            state: Arc::clone(&self.state),
        })
    }

    async fn execute(&self, active: ActiveRun) -> WorkflowState {
        let ctx = &active.ctx;
        info!("Starting workflow {} for config {}", ctx.run_id, ctx.config);

        self.drive(ctx).await;

        let state = self.state();
        info!("Workflow {} finished: {}", ctx.run_id, state.stage);
        state
    }

    fn reset(&self, ctx: &WorkflowContext) {
        let stage_status = Stage::SEQUENCE
            .iter()
            .map(|s| (*s, StageReport { status: StageStatus::Pending, message: String::new() }))
            .collect();

        self.state.send_replace(WorkflowState {
            run_id: Some(ctx.run_id),
            config: Some(ctx.config.clone()),
            stage: Stage::Idle,
            stage_status,
            ..WorkflowState::default()
        });
    }

    async fn drive(&self, ctx: &WorkflowContext) {
        for stage in Stage::SEQUENCE {
            if ctx.cancel.is_cancelled() {
                self.finish_aborted(None);
                return;
            }

            self.enter(stage);

            let result = match stage {
                Stage::Precheck => self.precheck_stage(ctx).await,
                Stage::Run => self.run_stage(ctx).await,
                Stage::Probe => self.probe_stage(ctx).await,
                Stage::Collect => self.collect_stage(ctx).await,
                Stage::Report => self.report_stage(ctx).await,
                _ => unreachable!("not a working stage"),
            };

            match result {
                Ok(outcome) => self.settle(stage, outcome),
                Err(StageFailure::Fatal(message)) => {
                    self.finish_error(stage, message);
                    return;
                }
                Err(StageFailure::Aborted) => {
                    self.finish_aborted(Some(stage));
                    return;
                }
            }
        }

        self.state.send_modify(|s| {
            s.stage = Stage::Completed;
            s.history.push(Stage::Completed);
        });
    }

    // ============ Transitions ============

    fn enter(&self, stage: Stage) {
        info!("Entering stage {}", stage);
        self.state.send_modify(|s| {
            s.stage = stage;
            s.history.push(stage);
            s.stage_status.insert(stage, StageReport {
                status: StageStatus::Running,
                message: format!("{} in progress", stage),
            });
        });
    }

    fn update_message(&self, stage: Stage, message: String) {
        self.state.send_modify(|s| {
            if let Some(report) = s.stage_status.get_mut(&stage) {
                report.message = message;
            }
        });
    }

    fn settle(&self, stage: Stage, outcome: StageOutcome) {
        match outcome.status {
            StageStatus::Warning => warn!("Stage {} finished with warning: {}", stage, outcome.message),
            _ => info!("Stage {} finished: {}", stage, outcome.message),
        }
        self.state.send_modify(|s| {
            s.stage_status.insert(stage, StageReport {
                status: outcome.status,
                message: outcome.message,
            });
        });
    }

    fn finish_error(&self, stage: Stage, message: String) {
        error!("Stage {} failed: {}", stage, message);
        self.state.send_modify(|s| {
            s.stage_status.insert(stage, StageReport {
                status: StageStatus::Error,
                message: message.clone(),
            });
            s.last_error = Some(format!("{} failed: {}", stage, message));
            s.stage = Stage::Error;
            s.history.push(Stage::Error);
        });
    }

    /// `stage` is the stage that was in flight, if any
    fn finish_aborted(&self, stage: Option<Stage>) {
        warn!("Workflow aborted{}", stage.map(|s| format!(" during {}", s)).unwrap_or_default());
        self.state.send_modify(|s| s.mark_aborted(stage));
    }

    // ============ Stages ============

    /// Hardware anomalies end the stage as WARNING, never ERROR.
    async fn precheck_stage(&self, ctx: &WorkflowContext) -> StageResult {
        let payload = self.backend.precheck(&ctx.config, &ctx.cancel).await?;
        let summary = consistency::summarize(payload.records);

        let outcome = if summary.check_passed {
            StageOutcome::success(format!(
                "precheck passed: {} device(s) healthy",
                summary.healthy_count
            ))
        } else {
            StageOutcome::warning(format!(
                "precheck found issues: {}",
                summary.findings().join("; ")
            ))
        };

        self.state.send_modify(|s| s.precheck = Some(summary));
        Ok(outcome)
    }

    async fn run_stage(&self, ctx: &WorkflowContext) -> StageResult {
        let outcome = self.backend.run(&ctx.config, &ctx.cancel).await?;
        if !outcome.success {
            let reason = outcome.error
                .or_else(|| Some(outcome.message).filter(|m| !m.is_empty()))
                .unwrap_or_else(|| "test run failed".to_string());
            return Err(StageFailure::Fatal(reason));
        }

        let message = if outcome.message.is_empty() {
            "test started".to_string()
        } else {
            outcome.message
        };
        Ok(StageOutcome::success(message))
    }

    /// Timeouts and per-host errors are advisory; whatever reports exist are still collected.
    async fn probe_stage(&self, ctx: &WorkflowContext) -> StageResult {
        let coordinator = ProbeCoordinator::from_config(self.backend.clone(), &self.probe);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = AbortOnDropHandle::new(coordinator.spawn(ctx.config.clone(), ctx.cancel.clone(), tx));

        while let Some(snapshot) = rx.recv().await {
            self.update_message(Stage::Probe, format!("probing... {}", snapshot.progress_line()));
            self.state.send_modify(|s| s.probe = Some(snapshot));
        }

        let outcome = match handle.await {
            Ok(result) => result?,
            Err(e) => return Err(StageFailure::Fatal(format!("probe task failed: {}", e))),
        };

        if !outcome.completed {
            return Ok(StageOutcome::warning(format!(
                "probe timed out after {} attempt(s) ({}), continuing",
                outcome.attempts,
                outcome.snapshot.progress_line()
            )));
        }

        if outcome.snapshot.error_hosts > 0 {
            return Ok(StageOutcome::warning(format!(
                "{} host(s) reported errors, continuing",
                outcome.snapshot.error_hosts
            )));
        }

        Ok(StageOutcome::success("all test processes completed"))
    }

    async fn collect_stage(&self, ctx: &WorkflowContext) -> StageResult {
        let result = self.backend.collect(&ctx.config, &ctx.cancel).await?;
        if !result.success {
            let reason = result.error
                .clone()
                .unwrap_or_else(|| "report collection failed".to_string());
            self.state.send_modify(|s| s.collect = Some(result));
            return Err(StageFailure::Fatal(reason));
        }

        let message = format!(
            "collected {} report file(s) from {} host(s)",
            result.total_files(),
            result.collected_file_counts.len()
        );
        self.state.send_modify(|s| s.collect = Some(result));
        Ok(StageOutcome::success(message))
    }

    async fn report_stage(&self, ctx: &WorkflowContext) -> StageResult {
        let raw = self.backend.report(&ctx.config, &ctx.cancel).await?;
        let report = report::aggregate(&raw).map_err(|e| StageFailure::Fatal(e.to_string()))?;

        let message = match &report {
            Report::Traditional(summary) => format!(
                "{} stream: {} client and {} server record(s), {} outside tolerance",
                raw.stream_type,
                summary.client_records.len(),
                summary.server_records.len(),
                summary.failed_count
            ),
            Report::PeerToPeer(summary) => format!(
                "p2p stream: {} pair(s), average {:.2} Gbps",
                summary.total_pairs, summary.average_speed_across_pairs
            ),
        };

        self.state.send_modify(|s| s.report = Some(report));
        Ok(StageOutcome::success(message))
    }
}
