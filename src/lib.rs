//! Grid-grounded Android GUI automation: a labelled grid is drawn over each
//! screenshot, a vision model answers with a cell label, and the device is
//! driven over ADB.

pub mod agent;
pub mod brain;
pub mod config;
pub mod error;
pub mod grid;
pub mod hands;
pub mod logger;
pub mod overlay;
pub mod protocol;
pub mod types;

pub use agent::{Agent, StepPhase};
pub use brain::{AnthropicClient, DecisionClient, RawResponse};
pub use config::{AgentConfig, FileConfig};
pub use grid::{GridLabel, GridSpec, PixelPoint};
pub use hands::{AdbDevice, DeviceControl, DeviceInfo};
pub use logger::{EventSink, NullSink, TaskEvent, TaskLogger};
pub use overlay::GridOverlay;
pub use protocol::{Action, Decision, ScrollDirection};
pub use types::{AbortReason, RunOutcome, RunSummary, TokenUsage};
