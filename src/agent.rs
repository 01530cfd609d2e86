use std::path::Path;
use std::time::{Duration, Instant};

use image::RgbaImage;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::brain::DecisionClient;
use crate::config::AgentConfig;
use crate::error::DeviceError;
use crate::grid::PixelPoint;
use crate::hands::DeviceControl;
use crate::logger::{EventSink, TaskEvent};
use crate::overlay::GridOverlay;
use crate::protocol::{
    Action, Decision, DecisionRequest, ScrollDirection, build_request, parse_decision,
};
use crate::types::{
    AbortReason, EncodedImage, HistoryEntry, RunOutcome, RunSummary, StepResult, StepTimes,
};

const SWIPE_DURATION_MS: u32 = 300;

/// Where the orchestrator is within the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Idle,
    Capturing,
    Annotating,
    Deciding,
    Executing,
    Recording,
}

enum StepFlow {
    Continue,
    Done,
}

#[derive(Default)]
struct RunState {
    history: Vec<HistoryEntry>,
    results: Vec<StepResult>,
    step_times: Vec<Duration>,
}

/// Drives capture, decide, act until the model reports completion or the
/// run is aborted.
pub struct Agent<D, C, S> {
    config: AgentConfig,
    overlay: GridOverlay,
    device: D,
    client: C,
    sink: S,
    phase: StepPhase,
}

impl<D, C, S> Agent<D, C, S>
where
    D: DeviceControl,
    C: DecisionClient,
    S: EventSink,
{
    pub fn new(config: &AgentConfig, device: D, client: C, sink: S) -> Self {
        Self {
            config: config.clone(),
            overlay: GridOverlay::new(config),
            device,
            client,
            sink,
            phase: StepPhase::Idle,
        }
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn enter(&mut self, phase: StepPhase) {
        debug!("{:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Runs `task` to a terminal state. Always returns a summary, including
    /// the history gathered before any failure or interruption.
    pub async fn run(&mut self, task: &str, cancel: &CancellationToken) -> RunSummary {
        let started = Instant::now();
        let max_steps = self.config.agent.max_steps;
        self.sink.record(TaskEvent::TaskStart {
            task: task.to_string(),
            config: serde_json::to_value(&self.config).unwrap_or(Value::Null),
        });
        info!("task: {}", task);

        let mut state = RunState::default();
        let outcome = loop {
            if cancel.is_cancelled() {
                break RunOutcome::Aborted(AbortReason::UserInterrupt);
            }
            if state.results.len() >= max_steps {
                warn!("reached maximum steps ({}) without completion", max_steps);
                break RunOutcome::Aborted(AbortReason::MaxStepsReached);
            }

            let step = state.results.len() + 1;
            let step_started = Instant::now();
            let mut result = StepResult::started(step);
            let flow = self.step(task, step, &mut state, &mut result, cancel).await;
            self.enter(StepPhase::Idle);

            match flow {
                Ok(flow) => {
                    let elapsed = step_started.elapsed();
                    result.success = true;
                    state.step_times.push(elapsed);
                    state.results.push(result);
                    self.sink.record(TaskEvent::StepComplete {
                        step,
                        total_time: elapsed.as_secs_f64(),
                    });

                    match flow {
                        StepFlow::Done => {
                            info!("task marked complete");
                            break RunOutcome::Done;
                        }
                        StepFlow::Continue if step >= max_steps => {}
                        StepFlow::Continue => {
                            if !pause(self.config.step_delay(), cancel).await {
                                break RunOutcome::Aborted(AbortReason::UserInterrupt);
                            }
                        }
                    }
                }
                Err(reason) => {
                    result.fail(&reason);
                    state.results.push(result);
                    break RunOutcome::Aborted(reason);
                }
            }
        };

        self.finish(task, outcome, state, started.elapsed())
    }

    async fn step(
        &mut self,
        task: &str,
        step: usize,
        state: &mut RunState,
        result: &mut StepResult,
        cancel: &CancellationToken,
    ) -> Result<StepFlow, AbortReason> {
        let max_steps = self.config.agent.max_steps;
        let save = self.config.agent.save_screenshots;
        self.sink.record(TaskEvent::StepStart { step });
        info!("Step {}/{}", step, max_steps);

        // 1. Capture
        self.enter(StepPhase::Capturing);
        let raw = match self.device.capture().await {
            Ok(raw) => raw,
            Err(e) => return Err(self.abort(step, AbortReason::CaptureFailed(e.to_string()))),
        };

        // 2. Annotate
        self.enter(StepPhase::Annotating);
        let (annotated, encoded) = match self.overlay.process(&raw) {
            Ok(processed) => processed,
            Err(e) => {
                let reason = AbortReason::CaptureFailed(format!("cannot encode screenshot: {e}"));
                return Err(self.abort(step, reason));
            }
        };
        if save {
            self.persist(&annotated, step, "annotated");
        }

        // 3. Decide
        self.enter(StepPhase::Deciding);
        let request = build_request(task, encoded, &state.history);
        let decided = Instant::now();
        let decision = self.decide(&request, step, cancel).await?;
        result.decision_time = decided.elapsed();
        result.decision = Some(decision.clone());
        info!("Action: {}", decision.action);
        if let Some(explain) = &decision.explain {
            info!("Explain: {}", explain);
        }
        if let Some(summary) = &decision.summary {
            info!("Summary: {}", summary);
        }

        // 4. Execute
        self.enter(StepPhase::Executing);
        let executed = Instant::now();
        let target = self.execute(&decision, step, cancel).await?;
        result.execution_time = executed.elapsed();
        self.sink.record(TaskEvent::ActionExecution {
            step,
            decision: decision.clone(),
            execution_time: result.execution_time.as_secs_f64(),
        });

        // 5. Record
        self.enter(StepPhase::Recording);
        let marked = self.marked_screenshot(&annotated, &decision, step, save);
        match target {
            Some(point) => info!(
                "Step {}/{} done. Action: {} → {}",
                step, max_steps, decision.action, point
            ),
            None => info!("Step {}/{} done. Action: {}", step, max_steps, decision.action),
        }

        let complete = decision.action.is_complete();
        state.history.push(HistoryEntry { decision, marked });
        Ok(if complete { StepFlow::Done } else { StepFlow::Continue })
    }

    /// Asks the client until a reply validates or the attempt budget runs out.
    async fn decide(
        &mut self,
        request: &DecisionRequest,
        step: usize,
        cancel: &CancellationToken,
    ) -> Result<Decision, AbortReason> {
        let attempts = self.config.retry.decision_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(AbortReason::UserInterrupt);
            }
            let started = Instant::now();
            let raw = match self.client.request_decision(request).await {
                Ok(raw) => raw,
                Err(e) => return Err(self.abort(step, AbortReason::DecisionFailed(e.to_string()))),
            };

            match parse_decision(&raw.text, &self.config.grid) {
                Ok(decision) => {
                    self.sink.record(TaskEvent::LlmResponse {
                        step,
                        decision: decision.clone(),
                        inference_time: started.elapsed().as_secs_f64(),
                        tokens: raw.usage,
                    });
                    return Ok(decision);
                }
                Err(e) => {
                    warn!("invalid decision (attempt {}/{}): {}", attempt, attempts, e);
                    self.sink.record(TaskEvent::Error {
                        step,
                        error: e.to_string(),
                    });
                    last_error = e.to_string();
                }
            }
        }

        Err(self.abort(step, AbortReason::DecisionFailed(last_error)))
    }

    /// Performs the decision on the device, retrying transient failures.
    /// Returns the tapped pixel for `CLICK`.
    async fn execute(
        &mut self,
        decision: &Decision,
        step: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<PixelPoint>, AbortReason> {
        let target = match &decision.action {
            Action::Click { grid } => match self.config.grid.to_pixel(grid) {
                Ok(point) => Some(point),
                Err(e) => return Err(self.abort(step, AbortReason::ExecutionFailed(e.to_string()))),
            },
            _ => None,
        };

        let attempts = self.config.retry.action_attempts.max(1);
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(AbortReason::UserInterrupt);
            }
            match self.perform(&decision.action, target).await {
                Ok(()) => return Ok(target),
                Err(e) if attempt < attempts => {
                    warn!("action failed (attempt {}/{}): {}", attempt, attempts, e);
                    if !pause(self.config.retry.action_backoff(), cancel).await {
                        return Err(AbortReason::UserInterrupt);
                    }
                }
                Err(e) => {
                    error!("action failed after {} attempts: {}", attempts, e);
                    return Err(self.abort(step, AbortReason::ExecutionFailed(e.to_string())));
                }
            }
        }
        Ok(target)
    }

    async fn perform(
        &mut self,
        action: &Action,
        target: Option<PixelPoint>,
    ) -> Result<(), DeviceError> {
        match action {
            Action::Click { .. } => {
                if let Some(point) = target {
                    self.device.tap(point.x, point.y).await?;
                }
            }
            Action::Type { value, clear_first } => {
                if *clear_first {
                    self.device.clear_focused_field().await?;
                }
                self.device.type_text(value).await?;
            }
            Action::Scroll { direction } => {
                let grid = &self.config.grid;
                let (x, y1, y2) = scroll_path(grid.width(), grid.height(), *direction);
                self.device.swipe(x, y1, x, y2, SWIPE_DURATION_MS).await?;
            }
            Action::Awake { package } => self.device.launch_package(package).await?,
            Action::Complete => {}
        }
        Ok(())
    }

    /// Marks the executed action, persists it and encodes it for the next step.
    fn marked_screenshot(
        &mut self,
        annotated: &RgbaImage,
        decision: &Decision,
        step: usize,
        save: bool,
    ) -> Option<EncodedImage> {
        if !matches!(
            decision.action,
            Action::Click { .. } | Action::Type { .. } | Action::Awake { .. }
        ) {
            return None;
        }
        let marked = self.overlay.mark_action(annotated, decision);
        if save {
            self.persist(&marked, step, "marked");
        }
        match self.overlay.encode(&marked) {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                warn!("cannot encode marked screenshot: {}", e);
                None
            }
        }
    }

    fn persist(&mut self, image: &RgbaImage, step: usize, kind: &str) {
        if let Some(path) = self.sink.save_image(image, step, kind) {
            self.sink.record(TaskEvent::Screenshot {
                step,
                kind: kind.to_string(),
                path,
            });
        }
    }

    /// Records the failure against `step` and hands the reason back.
    fn abort(&mut self, step: usize, reason: AbortReason) -> AbortReason {
        error!("step {} failed: {}", step, reason);
        self.sink.record(TaskEvent::Error {
            step,
            error: reason.to_string(),
        });
        reason
    }

    fn finish(
        &mut self,
        task: &str,
        outcome: RunOutcome,
        state: RunState,
        elapsed: Duration,
    ) -> RunSummary {
        let steps = state.results.len();
        if outcome == RunOutcome::Aborted(AbortReason::UserInterrupt) {
            warn!("task interrupted by user after {} steps", steps);
            self.sink.record(TaskEvent::TaskInterrupted {
                step: steps,
                reason: AbortReason::UserInterrupt.to_string(),
            });
        }

        let success = outcome == RunOutcome::Done
            && state
                .history
                .last()
                .is_some_and(|entry| entry.decision.action.is_complete());
        let usage = self.client.usage();
        let cost_usd = usage.cost(&self.config.model.pricing);
        self.sink.record(TaskEvent::TaskComplete {
            success,
            total_steps: steps,
            total_time: elapsed.as_secs_f64(),
            total_cost: cost_usd,
        });

        let step_times = StepTimes::from_samples(&state.step_times);
        info!("Execution summary");
        info!("  status: {}", if success { "success" } else { "failed" });
        if let RunOutcome::Aborted(reason) = &outcome {
            info!("  reason: {}", reason);
        }
        info!("  steps: {}/{}", steps, self.config.agent.max_steps);
        info!("  total time: {:.2}s", elapsed.as_secs_f64());
        if let Some(times) = &step_times {
            info!(
                "  step time: avg {:.2}s, fastest {:.2}s, slowest {:.2}s",
                times.average.as_secs_f64(),
                times.fastest.as_secs_f64(),
                times.slowest.as_secs_f64()
            );
        }
        info!(
            "  tokens: {} ({} in, {} out), cost ${:.4}",
            usage.total(),
            usage.input_tokens,
            usage.output_tokens,
            cost_usd
        );

        RunSummary {
            task: task.to_string(),
            outcome,
            success,
            steps,
            elapsed,
            step_times,
            usage,
            cost_usd,
            history: state.history,
            results: state.results,
            log_file: self.sink.log_file().map(Path::to_path_buf),
        }
    }
}

/// Centre-column swipe between 70% and 30% of the screen height.
fn scroll_path(width: u32, height: u32, direction: ScrollDirection) -> (i32, i32, i32) {
    let x = (width / 2) as i32;
    let low = (height as u64 * 7 / 10) as i32;
    let high = (height as u64 * 3 / 10) as i32;
    match direction {
        ScrollDirection::Down => (x, low, high),
        ScrollDirection::Up => (x, high, low),
    }
}

/// Sleeps for `duration`; `false` if cancelled first.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
