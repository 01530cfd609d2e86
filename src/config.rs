use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::grid::{GridSpec, MAX_COLUMNS};
use crate::types::Pricing;

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_steps: usize,
    /// Seconds to wait after each action before the next capture.
    pub delay_after_action: f64,
    pub verbose: bool,
    pub save_screenshots: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: 20,
            delay_after_action: 2.0,
            verbose: false,
            save_screenshots: true,
        }
    }
}

/// How the grid and its labels are drawn. Colours are RGB / RGBA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayStyle {
    pub line_color: [u8; 3],
    pub line_width: u32,
    pub label_size: u32,
    pub label_color: [u8; 3],
    pub label_bg_color: [u8; 4],
    pub show_inner_labels: bool,
    pub inner_label_interval: u32,
    pub inner_label_opacity: u8,
    /// TrueType font for labels; the built-in bitmap font is used when unset.
    pub font_path: Option<PathBuf>,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            line_color: [255, 0, 0],
            line_width: 3,
            label_size: 32,
            label_color: [255, 255, 0],
            label_bg_color: [0, 0, 0, 180],
            show_inner_labels: true,
            inner_label_interval: 3,
            inner_label_opacity: 128,
            font_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeSettings {
    /// Edge of the square image sent to the model.
    pub target_size: u32,
    pub quality: u8,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            target_size: 1568,
            quality: 85,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub api_url: String,
    pub pricing: Pricing,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model: "claude-opus-4-5-20251101".to_string(),
            max_tokens: 2048,
            temperature: 0.1,
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
            pricing: Pricing::default(),
        }
    }
}

/// Attempt budgets for every retried boundary of a step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Calls to the model before an invalid decision aborts the run.
    pub decision_attempts: u32,
    /// Transport attempts inside the decision client.
    pub transport_attempts: u32,
    pub transport_backoff_ms: u64,
    /// Device action attempts before the run aborts.
    pub action_attempts: u32,
    pub action_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            decision_attempts: 3,
            transport_attempts: 3,
            transport_backoff_ms: 1000,
            action_attempts: 2,
            action_backoff_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn action_backoff(&self) -> Duration {
        Duration::from_millis(self.action_backoff_ms)
    }

    pub fn transport_backoff(&self) -> Duration {
        Duration::from_millis(self.transport_backoff_ms)
    }
}

/// `device:` section: which phone to drive and how to reach it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub serial: Option<String>,
    /// Local copy of the yadb helper, pushed when the phone lacks it.
    pub yadb_path: Option<PathBuf>,
}

/// `grid:` section of the config file: optional fixed density plus drawing style.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSection {
    pub cols: Option<u32>,
    pub rows: Option<u32>,
    #[serde(flatten)]
    pub style: OverlayStyle,
}

/// Shape of `config.yaml`. Every section and field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub agent: AgentSettings,
    pub device: DeviceSettings,
    pub grid: GridSection,
    pub claude: ModelSettings,
    pub encode: EncodeSettings,
    pub retry: RetryPolicy,
}

impl FileConfig {
    /// Read `path`, or `config.yaml` in the working directory when it exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    debug!("no {} found, using defaults", DEFAULT_CONFIG_FILE);
                    return Ok(Self::default());
                }
                default
            }
        };

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_yaml(&text)?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: FileConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let agent = &self.agent;
        check(
            (1..=100).contains(&agent.max_steps),
            format!("agent.max_steps must be 1-100, got {}", agent.max_steps),
        )?;
        check(
            (0.0..=10.0).contains(&agent.delay_after_action),
            format!(
                "agent.delay_after_action must be 0-10 seconds, got {}",
                agent.delay_after_action
            ),
        )?;

        let grid = &self.grid;
        if let Some(cols) = grid.cols {
            check(
                (5..=MAX_COLUMNS).contains(&cols),
                format!("grid.cols must be 5-{MAX_COLUMNS}, got {cols}"),
            )?;
        }
        if let Some(rows) = grid.rows {
            check(
                (10..=50).contains(&rows),
                format!("grid.rows must be 10-50, got {rows}"),
            )?;
        }

        let style = &grid.style;
        check(
            (1..=10).contains(&style.line_width),
            format!("grid.line_width must be 1-10, got {}", style.line_width),
        )?;
        check(
            (8..=128).contains(&style.label_size),
            format!("grid.label_size must be 8-128, got {}", style.label_size),
        )?;
        check(
            (1..=10).contains(&style.inner_label_interval),
            format!(
                "grid.inner_label_interval must be 1-10, got {}",
                style.inner_label_interval
            ),
        )?;
        check(
            style.inner_label_opacity >= 50,
            format!(
                "grid.inner_label_opacity must be 50-255, got {}",
                style.inner_label_opacity
            ),
        )?;

        check(
            (1..=100).contains(&self.encode.quality),
            format!("encode.quality must be 1-100, got {}", self.encode.quality),
        )?;
        check(
            self.encode.target_size >= 64,
            format!("encode.target_size must be at least 64, got {}", self.encode.target_size),
        )?;

        let retry = &self.retry;
        check(
            retry.decision_attempts >= 1
                && retry.action_attempts >= 1
                && retry.transport_attempts >= 1,
            "retry attempts must be at least 1".to_string(),
        )?;
        Ok(())
    }

    /// Fix the grid against the detected screen and freeze the bundle.
    pub fn resolve(
        self,
        screen_width: u32,
        screen_height: u32,
    ) -> Result<AgentConfig, ConfigError> {
        self.validate()?;
        let (grid, grid_source) = match (self.grid.cols, self.grid.rows) {
            (Some(cols), Some(rows)) => (
                GridSpec::new(cols, rows, screen_width, screen_height)?,
                GridSource::Custom,
            ),
            _ => (GridSpec::auto(screen_width, screen_height)?, GridSource::Auto),
        };
        Ok(AgentConfig {
            grid,
            grid_source,
            agent: self.agent,
            style: self.grid.style,
            encode: self.encode,
            model: self.claude,
            retry: self.retry,
        })
    }
}

fn check(ok: bool, message: String) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Invalid(message))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GridSource {
    Custom,
    Auto,
}

/// Immutable configuration for one run, resolved before the run starts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentConfig {
    pub grid: GridSpec,
    pub grid_source: GridSource,
    pub agent: AgentSettings,
    pub style: OverlayStyle,
    pub encode: EncodeSettings,
    pub model: ModelSettings,
    pub retry: RetryPolicy,
}

impl AgentConfig {
    /// Defaults everywhere except the grid.
    pub fn new(grid: GridSpec) -> Self {
        Self {
            grid,
            grid_source: GridSource::Custom,
            agent: AgentSettings::default(),
            style: OverlayStyle::default(),
            encode: EncodeSettings::default(),
            model: ModelSettings::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_secs_f64(self.agent.delay_after_action.max(0.0))
    }
}
