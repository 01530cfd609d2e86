use std::collections::VecDeque;
use std::path::PathBuf;

use async_trait::async_trait;
use image::{DynamicImage, Rgba, RgbaImage};
use tokio_util::sync::CancellationToken;

use gridpilot::brain::{DecisionClient, RawResponse};
use gridpilot::config::AgentConfig;
use gridpilot::error::{DecisionError, DeviceError};
use gridpilot::hands::DeviceControl;
use gridpilot::logger::{EventSink, TaskEvent};
use gridpilot::protocol::{Action, DecisionRequest};
use gridpilot::types::{AbortReason, RunOutcome, TokenUsage};
use gridpilot::{Agent, GridSpec};

struct FakeDevice {
    calls: Vec<String>,
    fail_capture: bool,
    /// Number of upcoming gestures that fail before one succeeds.
    failing_actions: usize,
    cancel_on_tap: Option<CancellationToken>,
}

impl FakeDevice {
    fn new() -> Self {
        Self {
            calls: Vec::new(),
            fail_capture: false,
            failing_actions: 0,
            cancel_on_tap: None,
        }
    }

    fn gesture(&mut self, call: String) -> Result<(), DeviceError> {
        self.calls.push(call.clone());
        if self.failing_actions > 0 {
            self.failing_actions -= 1;
            return Err(DeviceError::Command {
                command: call,
                stderr: "device offline".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceControl for FakeDevice {
    async fn capture(&mut self) -> Result<DynamicImage, DeviceError> {
        self.calls.push("capture".to_string());
        if self.fail_capture {
            return Err(DeviceError::CaptureFailed("screen off".to_string()));
        }
        Ok(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            270,
            600,
            Rgba([230, 230, 230, 255]),
        )))
    }

    async fn tap(&mut self, x: i32, y: i32) -> Result<(), DeviceError> {
        if let Some(cancel) = &self.cancel_on_tap {
            cancel.cancel();
        }
        self.gesture(format!("tap {x} {y}"))
    }

    async fn swipe(
        &mut self,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u32,
    ) -> Result<(), DeviceError> {
        self.gesture(format!("swipe {x1} {y1} {x2} {y2} {duration_ms}"))
    }

    async fn type_text(&mut self, value: &str) -> Result<(), DeviceError> {
        self.gesture(format!("type {value}"))
    }

    async fn launch_package(&mut self, package: &str) -> Result<(), DeviceError> {
        self.gesture(format!("launch {package}"))
    }

    async fn clear_focused_field(&mut self) -> Result<(), DeviceError> {
        self.gesture("clear".to_string())
    }
}

struct ScriptedClient {
    replies: VecDeque<String>,
    requests: Vec<DecisionRequest>,
    usage: TokenUsage,
}

impl ScriptedClient {
    fn new(replies: &[&str]) -> Self {
        Self {
            replies: replies.iter().map(|r| r.to_string()).collect(),
            requests: Vec::new(),
            usage: TokenUsage::default(),
        }
    }
}

#[async_trait]
impl DecisionClient for ScriptedClient {
    async fn request_decision(
        &mut self,
        request: &DecisionRequest,
    ) -> Result<RawResponse, DecisionError> {
        self.requests.push(request.clone());
        let text = self.replies.pop_front().ok_or(DecisionError::EmptyResponse)?;
        let usage = TokenUsage {
            input_tokens: 1000,
            output_tokens: 100,
        };
        self.usage.add(usage);
        Ok(RawResponse { text, usage })
    }

    fn usage(&self) -> TokenUsage {
        self.usage
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Vec<TaskEvent>,
    images: Vec<(usize, String)>,
}

impl RecordingSink {
    fn count(&self, pred: impl Fn(&TaskEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn record(&mut self, event: TaskEvent) {
        self.events.push(event);
    }

    fn save_image(&mut self, _image: &RgbaImage, step: usize, kind: &str) -> Option<PathBuf> {
        self.images.push((step, kind.to_string()));
        Some(PathBuf::from(format!("step{step:02}_{kind}.jpg")))
    }
}

const CLICK_E5: &str =
    r#"{"action":"CLICK","grid":"E5","explain":"open search","summary":"home screen"}"#;
const TYPE_LATTE: &str = r#"{"action":"TYPE","value":"latte","explain":"enter query"}"#;
const SCROLL_DOWN: &str = r#"{"action":"SCROLL","value":"down","explain":"look further"}"#;
const COMPLETE: &str = r#"{"action":"COMPLETE","explain":"done","summary":"order placed"}"#;

fn config() -> AgentConfig {
    let mut config = AgentConfig::new(GridSpec::new(10, 20, 1080, 2400).unwrap());
    config.agent.delay_after_action = 0.0;
    config.agent.max_steps = 10;
    config.encode.target_size = 64;
    config.retry.action_backoff_ms = 0;
    config
}

type TestAgent = Agent<FakeDevice, ScriptedClient, RecordingSink>;

fn agent(config: &AgentConfig, device: FakeDevice, replies: &[&str]) -> TestAgent {
    Agent::new(config, device, ScriptedClient::new(replies), RecordingSink::default())
}

#[tokio::test]
async fn complete_ends_run_successfully() {
    let config = config();
    let mut agent = agent(&config, FakeDevice::new(), &[CLICK_E5, TYPE_LATTE, COMPLETE]);

    let summary = agent.run("order a latte", &CancellationToken::new()).await;

    assert_eq!(summary.outcome, RunOutcome::Done);
    assert!(summary.success);
    assert_eq!(summary.steps, 3);
    assert_eq!(summary.history.len(), 3);
    assert!(summary.history[2].decision.action.is_complete());
    assert_eq!(summary.usage.total(), 3300);
    assert!((summary.cost_usd - summary.usage.cost(&config.model.pricing)).abs() < 1e-12);

    let gestures: Vec<&str> = agent
        .device()
        .calls
        .iter()
        .map(String::as_str)
        .filter(|c| *c != "capture")
        .collect();
    assert_eq!(gestures, vec!["tap 486 540", "type latte"]);

    let sink = agent.sink();
    assert!(matches!(sink.events.first(), Some(TaskEvent::TaskStart { .. })));
    assert!(matches!(
        sink.events.last(),
        Some(TaskEvent::TaskComplete { success: true, total_steps: 3, .. })
    ));
    assert_eq!(sink.count(|e| matches!(e, TaskEvent::StepComplete { .. })), 3);
    assert_eq!(sink.count(|e| matches!(e, TaskEvent::LlmResponse { .. })), 3);
}

#[tokio::test]
async fn step_limit_aborts_without_success() {
    let mut config = config();
    config.agent.max_steps = 2;
    let mut agent = agent(&config, FakeDevice::new(), &[SCROLL_DOWN, SCROLL_DOWN, SCROLL_DOWN]);

    let summary = agent.run("find the bottom", &CancellationToken::new()).await;

    assert_eq!(summary.outcome, RunOutcome::Aborted(AbortReason::MaxStepsReached));
    assert!(!summary.success);
    assert_eq!(summary.steps, 2);
    assert_eq!(agent.client().requests.len(), 2);
    let swipes = agent
        .device()
        .calls
        .iter()
        .filter(|c| *c == "swipe 540 1680 540 720 300")
        .count();
    assert_eq!(swipes, 2);
}

#[tokio::test]
async fn capture_failure_aborts_immediately() {
    let mut device = FakeDevice::new();
    device.fail_capture = true;
    let mut agent = agent(&config(), device, &[CLICK_E5]);

    let summary = agent.run("anything", &CancellationToken::new()).await;

    assert!(matches!(
        summary.outcome,
        RunOutcome::Aborted(AbortReason::CaptureFailed(_))
    ));
    assert_eq!(summary.steps, 1);
    assert!(summary.history.is_empty());
    assert_eq!(agent.device().calls, vec!["capture".to_string()]);
    assert!(agent.client().requests.is_empty());
    assert_eq!(agent.sink().count(|e| matches!(e, TaskEvent::Error { step: 1, .. })), 1);
}

#[tokio::test]
async fn invalid_replies_are_retried() {
    let config = config();
    let replies = ["I think you should tap E5", CLICK_E5, COMPLETE];
    let mut agent = agent(&config, FakeDevice::new(), &replies);

    let summary = agent.run("search", &CancellationToken::new()).await;

    assert!(summary.success);
    assert_eq!(summary.steps, 2);
    assert_eq!(agent.client().requests.len(), 3);
    assert!(summary.results[0].success);
}

#[tokio::test]
async fn exhausted_validation_aborts_with_last_error() {
    let replies = [
        "not json",
        r#"{"action":"SCROLL","value":"left"}"#,
        r#"{"action":"CLICK","grid":"Z99"}"#,
    ];
    let mut agent = agent(&config(), FakeDevice::new(), &replies);

    let summary = agent.run("search", &CancellationToken::new()).await;

    match &summary.outcome {
        RunOutcome::Aborted(AbortReason::DecisionFailed(message)) => {
            assert!(message.contains("Z99"))
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!summary.success);
    assert_eq!(agent.client().requests.len(), 3);
    assert!(summary.history.is_empty());
    assert_eq!(summary.results.len(), 1);
    assert!(summary.results[0].error.is_some());
}

#[tokio::test]
async fn transient_action_failure_is_retried() {
    let mut device = FakeDevice::new();
    device.failing_actions = 1;
    let mut agent = agent(&config(), device, &[CLICK_E5, COMPLETE]);

    let summary = agent.run("search", &CancellationToken::new()).await;

    assert!(summary.success);
    let taps = agent.device().calls.iter().filter(|c| c.starts_with("tap")).count();
    assert_eq!(taps, 2);
}

#[tokio::test]
async fn persistent_action_failure_aborts() {
    let mut device = FakeDevice::new();
    device.failing_actions = usize::MAX;
    let awake = r#"{"action":"AWAKE","value":"com.android.settings"}"#;
    let mut agent = agent(&config(), device, &[awake]);

    let summary = agent.run("open settings", &CancellationToken::new()).await;

    assert!(matches!(
        summary.outcome,
        RunOutcome::Aborted(AbortReason::ExecutionFailed(_))
    ));
    let launches = agent
        .device()
        .calls
        .iter()
        .filter(|c| *c == "launch com.android.settings")
        .count();
    assert_eq!(launches, 2);
    assert!(summary.history.is_empty());
    assert_eq!(agent.sink().count(|e| matches!(e, TaskEvent::Error { .. })), 1);
}

#[tokio::test]
async fn clear_first_clears_before_typing() {
    let reply = r#"{"action":"TYPE","value":"new name","clear_first":true}"#;
    let mut agent = agent(&config(), FakeDevice::new(), &[reply, COMPLETE]);

    agent.run("rename", &CancellationToken::new()).await;

    let gestures: Vec<&str> = agent
        .device()
        .calls
        .iter()
        .map(String::as_str)
        .filter(|c| *c != "capture")
        .collect();
    assert_eq!(gestures, vec!["clear", "type new name"]);
}

#[tokio::test]
async fn interrupt_keeps_partial_history() {
    let cancel = CancellationToken::new();
    let mut device = FakeDevice::new();
    device.cancel_on_tap = Some(cancel.clone());
    let mut agent = agent(&config(), device, &[CLICK_E5, COMPLETE]);

    let summary = agent.run("search", &cancel).await;

    assert!(summary.is_interrupted());
    assert!(!summary.success);
    assert_eq!(summary.history.len(), 1);
    assert!(matches!(summary.history[0].decision.action, Action::Click { .. }));
    assert_eq!(agent.client().requests.len(), 1);
    assert_eq!(agent.sink().count(|e| matches!(e, TaskEvent::TaskInterrupted { .. })), 1);
}

#[tokio::test]
async fn cancelled_before_start_runs_no_steps() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut agent = agent(&config(), FakeDevice::new(), &[CLICK_E5]);

    let summary = agent.run("search", &cancel).await;

    assert!(summary.is_interrupted());
    assert_eq!(summary.steps, 0);
    assert!(agent.device().calls.is_empty());
}

#[tokio::test]
async fn marked_screenshot_goes_to_next_step() {
    let replies = [CLICK_E5, SCROLL_DOWN, TYPE_LATTE, COMPLETE];
    let mut agent = agent(&config(), FakeDevice::new(), &replies);

    let summary = agent.run("order a latte", &CancellationToken::new()).await;
    assert!(summary.success);

    let requests = &agent.client().requests;
    assert_eq!(requests.len(), 4);
    assert!(requests[0].previous.is_none());

    let click_marked = summary.history[0].marked.as_ref().unwrap();
    assert_eq!(requests[1].previous.as_ref(), Some(click_marked));
    assert_ne!(requests[1].previous.as_ref(), Some(&requests[1].screenshot));
    assert!(requests[1].context.contains("1. CLICK E5 - open search"));

    assert!(summary.history[1].marked.is_none());
    assert!(requests[2].previous.is_none());
    assert_eq!(requests[3].previous.as_ref(), summary.history[2].marked.as_ref());

    let images = &agent.sink().images;
    assert!(images.contains(&(1, "annotated".to_string())));
    assert!(images.contains(&(1, "marked".to_string())));
    assert!(!images.contains(&(2, "marked".to_string())));
    assert!(images.contains(&(3, "marked".to_string())));
}

#[tokio::test]
async fn screenshots_not_saved_when_disabled() {
    let mut config = config();
    config.agent.save_screenshots = false;
    let mut agent = agent(&config, FakeDevice::new(), &[CLICK_E5, COMPLETE]);

    let summary = agent.run("search", &CancellationToken::new()).await;

    assert!(summary.success);
    assert!(agent.sink().images.is_empty());
    assert!(summary.history[0].marked.is_some());
}
