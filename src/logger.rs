use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::overlay::save_jpeg;
use crate::protocol::Decision;
use crate::types::TokenUsage;

const IMAGE_QUALITY: u8 = 85;

/// One structured record of what the agent did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskStart {
        task: String,
        config: Value,
    },
    StepStart {
        step: usize,
    },
    Screenshot {
        step: usize,
        kind: String,
        path: PathBuf,
    },
    LlmResponse {
        step: usize,
        decision: Decision,
        inference_time: f64,
        tokens: TokenUsage,
    },
    ActionExecution {
        step: usize,
        decision: Decision,
        execution_time: f64,
    },
    StepComplete {
        step: usize,
        total_time: f64,
    },
    Error {
        step: usize,
        error: String,
    },
    TaskInterrupted {
        step: usize,
        reason: String,
    },
    TaskComplete {
        success: bool,
        total_steps: usize,
        total_time: f64,
        total_cost: f64,
    },
}

/// Receives run events. Failures to persist are logged, never raised.
pub trait EventSink: Send {
    fn record(&mut self, event: TaskEvent);

    /// Persist `image` for `step`; `None` when images are not kept.
    fn save_image(&mut self, image: &RgbaImage, step: usize, kind: &str) -> Option<PathBuf>;

    fn log_file(&self) -> Option<&Path> {
        None
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&mut self, _event: TaskEvent) {}

    fn save_image(&mut self, _image: &RgbaImage, _step: usize, _kind: &str) -> Option<PathBuf> {
        None
    }
}

#[derive(Serialize)]
struct Record<'a> {
    session_id: &'a str,
    timestamp: String,
    #[serde(flatten)]
    event: &'a TaskEvent,
}

/// A line read back from the log file.
#[derive(Debug, Clone, Deserialize)]
pub struct LogEntry {
    pub session_id: String,
    pub timestamp: String,
    pub event_type: String,
    pub data: Value,
}

impl LogEntry {
    pub fn event(&self) -> Option<TaskEvent> {
        let value = serde_json::json!({ "event_type": self.event_type, "data": self.data });
        serde_json::from_value(value).ok()
    }
}

/// Totals recovered from a session log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogSummary {
    pub session_id: String,
    pub task: String,
    pub total_steps: usize,
    pub success: bool,
    pub total_time: f64,
    pub total_cost: f64,
    pub avg_step_time: f64,
    pub total_tokens: u64,
}

/// Appends events as JSON lines and keeps screenshots next to them.
pub struct TaskLogger {
    session_id: String,
    log_file: PathBuf,
    image_dir: PathBuf,
}

impl TaskLogger {
    /// Logs go to `<base>/logs`, images to `<base>/images`.
    pub fn new(base_dir: &Path) -> io::Result<Self> {
        Self::with_session(base_dir, Uuid::new_v4().to_string())
    }

    pub fn with_session(base_dir: &Path, session_id: String) -> io::Result<Self> {
        let log_dir = base_dir.join("logs");
        let image_dir = base_dir.join("images");
        fs::create_dir_all(&log_dir)?;
        fs::create_dir_all(&image_dir)?;

        let log_file = log_dir.join(format!("{session_id}.jsonl"));
        info!("logging to {}", log_file.display());
        Ok(Self {
            session_id,
            log_file,
            image_dir,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    fn append(&self, event: &TaskEvent) -> io::Result<()> {
        let record = Record {
            session_id: &self.session_id,
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            event,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?;
        file.write_all(line.as_bytes())
    }

    pub fn read_logs(&self) -> io::Result<Vec<LogEntry>> {
        if !self.log_file.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.log_file)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    /// `None` when nothing has been logged yet.
    pub fn summary(&self) -> io::Result<Option<LogSummary>> {
        let events: Vec<TaskEvent> = self.read_logs()?.iter().filter_map(LogEntry::event).collect();
        if events.is_empty() {
            return Ok(None);
        }

        let mut summary = LogSummary {
            session_id: self.session_id.clone(),
            task: "Unknown".to_string(),
            total_steps: 0,
            success: false,
            total_time: 0.0,
            total_cost: 0.0,
            avg_step_time: 0.0,
            total_tokens: 0,
        };
        let mut step_time = 0.0;
        let mut started = false;
        let mut finished = false;
        for event in &events {
            match event {
                TaskEvent::TaskStart { task, .. } if !started => {
                    summary.task = task.clone();
                    started = true;
                }
                TaskEvent::StepComplete { total_time, .. } => {
                    summary.total_steps += 1;
                    step_time += total_time;
                }
                TaskEvent::LlmResponse { tokens, .. } => summary.total_tokens += tokens.total(),
                TaskEvent::TaskComplete {
                    success,
                    total_time,
                    total_cost,
                    ..
                } if !finished => {
                    summary.success = *success;
                    summary.total_time = *total_time;
                    summary.total_cost = *total_cost;
                    finished = true;
                }
                _ => {}
            }
        }
        if summary.total_steps > 0 {
            summary.avg_step_time = step_time / summary.total_steps as f64;
        }
        Ok(Some(summary))
    }
}

impl EventSink for TaskLogger {
    fn record(&mut self, event: TaskEvent) {
        if let Err(e) = self.append(&event) {
            warn!("cannot write log {}: {}", self.log_file.display(), e);
        }
    }

    fn save_image(&mut self, image: &RgbaImage, step: usize, kind: &str) -> Option<PathBuf> {
        let path = self
            .image_dir
            .join(format!("{}_step{:02}_{}.jpg", self.session_id, step, kind));
        match save_jpeg(image, &path, IMAGE_QUALITY) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("cannot save {}: {}", path.display(), e);
                None
            }
        }
    }

    fn log_file(&self) -> Option<&Path> {
        Some(&self.log_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridLabel;
    use crate::protocol::Action;
    use image::Rgba;

    fn click() -> Decision {
        Decision::new(Action::Click {
            grid: GridLabel::new(4, 5),
        })
        .explained("tap search")
    }

    #[test]
    fn events_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = TaskLogger::with_session(dir.path(), "s1".to_string()).unwrap();
        logger.record(TaskEvent::TaskStart {
            task: "open settings".to_string(),
            config: serde_json::json!({ "max_steps": 5 }),
        });
        logger.record(TaskEvent::StepStart { step: 1 });

        let path = dir.path().join("logs").join("s1.jsonl");
        assert_eq!(logger.log_file(), Some(path.as_path()));
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);

        let first: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["session_id"], "s1");
        assert_eq!(first["event_type"], "task_start");
        assert_eq!(first["data"]["task"], "open settings");
        assert!(first["timestamp"].is_string());
    }

    #[test]
    fn read_logs_restores_typed_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = TaskLogger::new(dir.path()).unwrap();
        let event = TaskEvent::LlmResponse {
            step: 2,
            decision: click(),
            inference_time: 1.5,
            tokens: TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
            },
        };
        logger.record(event.clone());

        let entries = logger.read_logs().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session_id, logger.session_id());
        assert_eq!(entries[0].data["decision"]["action"], "CLICK");
        assert_eq!(entries[0].data["decision"]["grid"], "E5");
        assert_eq!(entries[0].event(), Some(event));
    }

    #[test]
    fn summary_totals() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = TaskLogger::new(dir.path()).unwrap();
        assert_eq!(logger.summary().unwrap(), None);

        logger.record(TaskEvent::TaskStart {
            task: "send a message".to_string(),
            config: Value::Null,
        });
        for (step, secs) in [(1, 2.0), (2, 4.0)] {
            logger.record(TaskEvent::LlmResponse {
                step,
                decision: click(),
                inference_time: 1.0,
                tokens: TokenUsage {
                    input_tokens: 1000,
                    output_tokens: 50,
                },
            });
            logger.record(TaskEvent::StepComplete {
                step,
                total_time: secs,
            });
        }
        logger.record(TaskEvent::TaskComplete {
            success: true,
            total_steps: 2,
            total_time: 6.5,
            total_cost: 0.0125,
        });

        let summary = logger.summary().unwrap().unwrap();
        assert_eq!(summary.task, "send a message");
        assert_eq!(summary.total_steps, 2);
        assert!(summary.success);
        assert_eq!(summary.total_tokens, 2100);
        assert!((summary.avg_step_time - 3.0).abs() < 1e-9);
        assert!((summary.total_time - 6.5).abs() < 1e-9);
    }

    #[test]
    fn images_named_by_session_step_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = TaskLogger::with_session(dir.path(), "abc".to_string()).unwrap();
        let image = RgbaImage::from_pixel(32, 48, Rgba([10, 20, 30, 255]));

        let path = logger.save_image(&image, 3, "annotated").unwrap();
        assert_eq!(path, dir.path().join("images").join("abc_step03_annotated.jpg"));
        let saved = image::open(&path).unwrap();
        assert_eq!((saved.width(), saved.height()), (32, 48));
    }

    #[test]
    fn null_sink_keeps_nothing() {
        let mut sink = NullSink;
        sink.record(TaskEvent::StepStart { step: 1 });
        let image = RgbaImage::new(4, 4);
        assert!(sink.save_image(&image, 1, "screenshot").is_none());
        assert!(sink.log_file().is_none());
    }
}
