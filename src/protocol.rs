use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::grid::{GridLabel, GridSpec};
use crate::types::{EncodedImage, HistoryEntry};

/// How many trailing history entries are summarised for the model.
pub const HISTORY_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

impl ScrollDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
        }
    }
}

/// One device action the model may ask for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "UPPERCASE")]
pub enum Action {
    Click {
        grid: GridLabel,
    },
    Type {
        value: String,
        #[serde(default)]
        clear_first: bool,
    },
    Scroll {
        #[serde(rename = "value")]
        direction: ScrollDirection,
    },
    Awake {
        #[serde(rename = "value")]
        package: String,
    },
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Click,
    Type,
    Scroll,
    Awake,
    Complete,
}

impl ActionKind {
    pub const ALL: [ActionKind; 5] = [
        ActionKind::Click,
        ActionKind::Type,
        ActionKind::Scroll,
        ActionKind::Awake,
        ActionKind::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Click => "CLICK",
            ActionKind::Type => "TYPE",
            ActionKind::Scroll => "SCROLL",
            ActionKind::Awake => "AWAKE",
            ActionKind::Complete => "COMPLETE",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(tag))
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Click { .. } => ActionKind::Click,
            Action::Type { .. } => ActionKind::Type,
            Action::Scroll { .. } => ActionKind::Scroll,
            Action::Awake { .. } => ActionKind::Awake,
            Action::Complete => ActionKind::Complete,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Action::Complete)
    }
}

/// `CLICK E5`, `TYPE "latte"`, `SCROLL down`, `AWAKE com.example`, `COMPLETE`.
impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Click { grid } => write!(f, "CLICK {grid}"),
            Action::Type { value, .. } => write!(f, "TYPE \"{value}\""),
            Action::Scroll { direction } => write!(f, "SCROLL {}", direction.as_str()),
            Action::Awake { package } => write!(f, "AWAKE {package}"),
            Action::Complete => f.write_str("COMPLETE"),
        }
    }
}

/// A validated model decision: the action plus its reasoning and progress note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(flatten)]
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Decision {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            explain: None,
            summary: None,
        }
    }

    pub fn explained(mut self, explain: impl Into<String>) -> Self {
        self.explain = Some(explain.into());
        self
    }

    pub fn summarized(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn explain(&self) -> &str {
        self.explain.as_deref().unwrap_or("")
    }
}

/// Everything the decision client needs for one call.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub task: String,
    pub screenshot: EncodedImage,
    /// Marked screenshot of the previous step, if it produced one.
    pub previous: Option<EncodedImage>,
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StuckWarning {
    RepeatedClick(GridLabel),
    RepeatedExplain,
}

impl StuckWarning {
    fn render(&self) -> String {
        match self {
            StuckWarning::RepeatedClick(grid) => format!(
                "⚠️ **Warning**: The last 2 CLICK actions both targeted grid position '{grid}'!\n\
                 The UI probably changed after the first click, so study the current screenshot.\n\
                 Do NOT click the same position again unless you are sure it is needed.\n\n"
            ),
            StuckWarning::RepeatedExplain => concat!(
                "⚠️ **Warning**: The last 3 actions had the same explanation. ",
                "You might be stuck!\n",
                "Consider pressing the back button (top-left, grid A1-B3) ",
                "or trying a different approach.\n\n",
            )
            .to_string(),
        }
    }
}

/// Advisory signals for the model when recent history is not making progress.
pub fn stuck_warnings(history: &[HistoryEntry]) -> Vec<StuckWarning> {
    let mut warnings = Vec::new();

    if let [.., a, b] = history {
        if let (Action::Click { grid: first }, Action::Click { grid: second }) =
            (&a.decision.action, &b.decision.action)
        {
            if first == second {
                warnings.push(StuckWarning::RepeatedClick(*first));
            }
        }
    }

    if let [.., a, b, c] = history {
        let explain = a.decision.explain();
        if explain == b.decision.explain() && explain == c.decision.explain() {
            warnings.push(StuckWarning::RepeatedExplain);
        }
    }

    warnings
}

/// Text part of a request: the goal, recent actions and any stuck warnings.
pub fn build_context(task: &str, history: &[HistoryEntry]) -> String {
    let mut message = format!("**User Goal:** {task}\n\n");

    if !history.is_empty() {
        message.push_str("**Previous Actions:**\n");
        let start = history.len().saturating_sub(HISTORY_WINDOW);
        for (i, entry) in history[start..].iter().enumerate() {
            let _ = writeln!(
                message,
                "{}. {} - {}",
                i + 1,
                entry.decision.action,
                entry.decision.explain()
            );
        }
        message.push('\n');

        for warning in stuck_warnings(history) {
            message.push_str(&warning.render());
        }
    }

    message.push_str("**What is the next action?** (Output JSON only)");
    message
}

pub fn build_request(
    task: &str,
    screenshot: EncodedImage,
    history: &[HistoryEntry],
) -> DecisionRequest {
    DecisionRequest {
        task: task.to_string(),
        screenshot,
        previous: history.last().and_then(|entry| entry.marked.clone()),
        context: build_context(task, history),
    }
}

/// Validate raw model text into a [`Decision`].
pub fn parse_decision(raw: &str, spec: &GridSpec) -> Result<Decision, ProtocolError> {
    let cleaned = strip_code_fence(raw);
    let value: Value = serde_json::from_str(cleaned)
        .map_err(|e| ProtocolError::MalformedResponse(format!("{e}: {cleaned}")))?;
    let Value::Object(obj) = value else {
        return Err(ProtocolError::MalformedResponse(format!(
            "expected a JSON object, got: {cleaned}"
        )));
    };

    let tag = match obj.get("action") {
        Some(Value::String(tag)) => tag.as_str(),
        Some(other) => return Err(ProtocolError::UnknownActionType(other.to_string())),
        None => {
            return Err(ProtocolError::MissingField {
                action: "response".to_string(),
                field: "action".to_string(),
            });
        }
    };
    let kind =
        ActionKind::from_tag(tag).ok_or_else(|| ProtocolError::UnknownActionType(tag.to_string()))?;

    let action = match kind {
        ActionKind::Click => {
            let grid = required_str(&obj, kind, "grid")?;
            Action::Click {
                grid: spec.parse(grid)?,
            }
        }
        ActionKind::Type => Action::Type {
            value: required_str(&obj, kind, "value")?.to_string(),
            clear_first: obj
                .get("clear_first")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        ActionKind::Scroll => {
            let direction = match required_str(&obj, kind, "value")? {
                "up" => ScrollDirection::Up,
                "down" => ScrollDirection::Down,
                other => return Err(ProtocolError::InvalidScrollDirection(other.to_string())),
            };
            Action::Scroll { direction }
        }
        ActionKind::Awake => Action::Awake {
            package: required_str(&obj, kind, "value")?.trim().to_string(),
        },
        ActionKind::Complete => Action::Complete,
    };

    Ok(Decision {
        action,
        explain: optional_str(&obj, "explain"),
        summary: optional_str(&obj, "summary"),
    })
}

fn required_str<'a>(
    obj: &'a Map<String, Value>,
    kind: ActionKind,
    field: &str,
) -> Result<&'a str, ProtocolError> {
    match obj.get(field) {
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(other) => Err(ProtocolError::MalformedResponse(format!(
            "{kind} field '{field}' must be a string, got {other}"
        ))),
        None => Err(ProtocolError::MissingField {
            action: kind.to_string(),
            field: field.to_string(),
        }),
    }
}

fn optional_str(obj: &Map<String, Value>, field: &str) -> Option<String> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the fence line (it may carry a language tag) and the closing fence.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().trim_end_matches("```").trim()
}

/// Instructions sent as the system prompt, sized to the active grid.
pub fn system_prompt(spec: &GridSpec) -> String {
    let cols = spec.cols();
    let rows = spec.rows();
    let last = spec.last_letter();
    format!(
        r#"You are an Android GUI automation expert using a grid-based coordinate system.

**Grid System:**
- The screen is divided into a {cols}x{rows} grid
- Columns: A-{last} (left to right)
- Rows: 1-{rows} (top to bottom)
- Cells are labeled on the screenshot (e.g. "A1", "{last}{rows}")

**Your Task:**
Study the screenshot and decide the single next action that moves toward the user's goal.

**Available Actions:**
1. CLICK - tap the center of a grid cell
   {{"action": "CLICK", "grid": "E5", "explain": "Tap the search box", "summary": "On the home page, about to search."}}
2. TYPE - type text into the focused input field
   {{"action": "TYPE", "value": "Luckin Coffee", "explain": "Enter the store name", "summary": "Search box is active."}}
   Add "clear_first": true to clear existing text before typing.
3. SCROLL - scroll the screen, value must be "up" or "down"
   {{"action": "SCROLL", "value": "down", "explain": "Look further down the menu", "summary": "In the menu, looking for the item."}}
4. AWAKE - launch an app by package name
   {{"action": "AWAKE", "value": "com.sankuai.meituan", "explain": "Open the app", "summary": "First step: launch the app."}}
5. COMPLETE - the goal has been reached
   {{"action": "COMPLETE", "explain": "The order is placed", "summary": "Task finished."}}

**Output Format:**
- action: CLICK/TYPE/SCROLL/AWAKE/COMPLETE
- explain: one sentence on why this action
- summary: one sentence on overall progress
- grid: required for CLICK
- value: required for TYPE, SCROLL and AWAKE

**Language:** "explain" and "summary" MUST use the same language as the user's task.

**Guidelines:**
1. Use the grid labels drawn on the screenshot; never invent coordinates.
2. If a previous-step screenshot is shown, its marker is the action just executed. Compare it
   with the current screenshot to confirm the action worked.
3. If you are on the wrong page, look for a back button (usually top-left, A1-B3).
4. Do not repeat an action that did not work; try a different approach.
5. Output ONLY one JSON object, no markdown."#
    )
}
