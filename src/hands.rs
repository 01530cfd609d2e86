use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use image::DynamicImage;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::DeviceError;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const KEY_TIMEOUT: Duration = Duration::from_secs(2);
const KEY_PAUSE: Duration = Duration::from_millis(200);
const LAUNCH_PAUSE: Duration = Duration::from_millis(500);
const PUSH_TIMEOUT: Duration = Duration::from_secs(30);

const YADB_PATH: &str = "/data/local/tmp/yadb";
const KEYCODE_CTRL_LEFT: &str = "113";
const KEYCODE_A: &str = "29";
const KEYCODE_DEL: &str = "67";

/// Primitive gestures and reads on the controlled device.
#[async_trait]
pub trait DeviceControl: Send {
    async fn capture(&mut self) -> Result<DynamicImage, DeviceError>;
    async fn tap(&mut self, x: i32, y: i32) -> Result<(), DeviceError>;
    async fn swipe(
        &mut self,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u32,
    ) -> Result<(), DeviceError>;
    async fn type_text(&mut self, value: &str) -> Result<(), DeviceError>;
    async fn launch_package(&mut self, package: &str) -> Result<(), DeviceError>;
    async fn clear_focused_field(&mut self) -> Result<(), DeviceError>;
}

/// What `connect` learned about the attached device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial: Option<String>,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub yadb: bool,
}

/// A phone reached through the `adb` command line tool.
pub struct AdbDevice {
    serial: Option<String>,
    yadb: bool,
    yadb_source: Option<PathBuf>,
}

impl AdbDevice {
    /// No I/O happens until `connect`.
    pub fn new(serial: Option<String>) -> Self {
        Self {
            serial,
            yadb: false,
            yadb_source: None,
        }
    }

    /// Push this local yadb build during `connect` when the device has none.
    pub fn with_yadb_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.yadb_source = Some(path.into());
        self
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    pub async fn connect(&mut self) -> Result<DeviceInfo, DeviceError> {
        // 1. adb itself
        self.run_host(&["version"], PROBE_TIMEOUT).await?;

        // 2. an attached device
        let listing = self.run_host(&["devices"], PROBE_TIMEOUT).await?;
        let devices = parse_device_list(&String::from_utf8_lossy(&listing));
        match &self.serial {
            Some(serial) if !devices.iter().any(|d| d == serial) => {
                return Err(DeviceError::NoDevice);
            }
            None if devices.is_empty() => return Err(DeviceError::NoDevice),
            _ => {}
        }
        info!("adb devices: {}", devices.join(", "));

        // 3. screen size and model
        let size = self.shell_output(&["wm", "size"], PROBE_TIMEOUT).await?;
        let (width, height) = parse_wm_size(&size).ok_or_else(|| DeviceError::Command {
            command: "wm size".to_string(),
            stderr: format!("unexpected output: {}", size.trim()),
        })?;
        let name = self.device_name().await;

        // 4. optional keyboard helper for non-ASCII text
        self.yadb = self.probe_yadb().await;
        if !self.yadb && self.yadb_source.is_some() {
            match self.install_yadb().await {
                Ok(()) => self.yadb = self.probe_yadb().await,
                Err(e) => warn!("could not install yadb: {}", e),
            }
        }

        info!("connected to {} ({}x{}), yadb: {}", name, width, height, self.yadb);
        Ok(DeviceInfo {
            serial: self.serial.clone(),
            name,
            width,
            height,
            yadb: self.yadb,
        })
    }

    async fn device_name(&self) -> String {
        let manufacturer = self
            .shell_output(&["getprop", "ro.product.manufacturer"], PROBE_TIMEOUT)
            .await
            .unwrap_or_default();
        let model = self
            .shell_output(&["getprop", "ro.product.model"], PROBE_TIMEOUT)
            .await
            .unwrap_or_default();
        let name = format!("{} {}", manufacturer.trim(), model.trim());
        match name.trim() {
            "" => "Unknown device".to_string(),
            name => name.to_string(),
        }
    }

    async fn probe_yadb(&self) -> bool {
        match self.shell_output(&["md5sum", YADB_PATH], PROBE_TIMEOUT).await {
            Ok(out) if out.contains(YADB_PATH) => true,
            Ok(_) => false,
            Err(e) => {
                debug!("yadb probe failed: {}", e);
                false
            }
        }
    }

    async fn install_yadb(&self) -> Result<(), DeviceError> {
        let Some(source) = self.yadb_source.as_deref() else {
            return Ok(());
        };
        let local = push_source(source)?;
        info!("pushing {} to {}", local, YADB_PATH);
        self.run_host(&["push", &local, YADB_PATH], PUSH_TIMEOUT).await?;
        Ok(())
    }

    async fn shell(&self, args: &[&str], timeout: Duration) -> Result<(), DeviceError> {
        self.shell_output(args, timeout).await.map(drop)
    }

    async fn shell_output(&self, args: &[&str], timeout: Duration) -> Result<String, DeviceError> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        let out = self.run_host(&full, timeout).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Runs `adb [-s serial] <args>` and returns stdout.
    async fn run_host(&self, args: &[&str], timeout: Duration) -> Result<Vec<u8>, DeviceError> {
        let mut cmd = Command::new("adb");
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let line = args.join(" ");
        debug!("adb {}", line);

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Err(_) => return Err(DeviceError::Timeout(line)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DeviceError::NotFound);
            }
            Ok(result) => result?,
        };
        if !output.status.success() {
            return Err(DeviceError::Command {
                command: line,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl DeviceControl for AdbDevice {
    async fn capture(&mut self) -> Result<DynamicImage, DeviceError> {
        let png = self
            .run_host(&["exec-out", "screencap", "-p"], COMMAND_TIMEOUT)
            .await
            .map_err(|e| DeviceError::CaptureFailed(e.to_string()))?;
        if png.is_empty() {
            return Err(DeviceError::CaptureFailed("empty screencap output".to_string()));
        }
        Ok(image::load_from_memory(&png)?)
    }

    async fn tap(&mut self, x: i32, y: i32) -> Result<(), DeviceError> {
        info!("adb shell input tap {} {}", x, y);
        self.shell(&["input", "tap", &x.to_string(), &y.to_string()], COMMAND_TIMEOUT)
            .await
    }

    async fn swipe(
        &mut self,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u32,
    ) -> Result<(), DeviceError> {
        let args = [x1, y1, x2, y2].map(|v| v.to_string());
        info!("adb shell input swipe {} {}", args.join(" "), duration_ms);
        self.shell(
            &[
                "input",
                "swipe",
                &args[0],
                &args[1],
                &args[2],
                &args[3],
                &duration_ms.to_string(),
            ],
            COMMAND_TIMEOUT,
        )
        .await
    }

    async fn type_text(&mut self, value: &str) -> Result<(), DeviceError> {
        if self.yadb {
            info!("yadb keyboard input: {:?}", value);
            let quoted = format!("\"{}\"", yadb_text(value));
            return self
                .shell(
                    &[
                        "app_process",
                        "-Djava.class.path=/data/local/tmp/yadb",
                        "/data/local/tmp",
                        "com.ysbing.yadb.Main",
                        "-keyboard",
                        &quoted,
                    ],
                    COMMAND_TIMEOUT,
                )
                .await;
        }
        if !value.is_ascii() {
            warn!("input text without yadb may drop non-ASCII characters");
        }
        info!("adb shell input text {:?}", value);
        self.shell(&["input", "text", &input_text_escape(value)], COMMAND_TIMEOUT)
            .await
    }

    async fn launch_package(&mut self, package: &str) -> Result<(), DeviceError> {
        info!("restarting {}", package);
        self.shell(&["am", "force-stop", package], COMMAND_TIMEOUT).await?;
        tokio::time::sleep(LAUNCH_PAUSE).await;
        self.shell(
            &["monkey", "-p", package, "-c", "android.intent.category.LAUNCHER", "1"],
            COMMAND_TIMEOUT,
        )
        .await
    }

    async fn clear_focused_field(&mut self) -> Result<(), DeviceError> {
        info!("clearing text field: Ctrl+A, DEL");
        self.shell(&["input", "keycombination", KEYCODE_CTRL_LEFT, KEYCODE_A], KEY_TIMEOUT)
            .await?;
        tokio::time::sleep(KEY_PAUSE).await;
        self.shell(&["input", "keyevent", KEYCODE_DEL], KEY_TIMEOUT).await?;
        tokio::time::sleep(KEY_PAUSE).await;
        Ok(())
    }
}

/// Serials of devices in the `device` state from `adb devices` output.
fn parse_device_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Screen size from `wm size`, preferring an override over the physical size.
fn parse_wm_size(output: &str) -> Option<(u32, u32)> {
    let mut physical = None;
    let mut overridden = None;
    for line in output.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let Some((w, h)) = value.trim().split_once('x') else {
            continue;
        };
        let (Ok(w), Ok(h)) = (w.trim().parse(), h.trim().parse()) else {
            continue;
        };
        if label.contains("Override") {
            overridden = Some((w, h));
        } else {
            physical = Some((w, h));
        }
    }
    overridden.or(physical)
}

/// Local path handed to `adb push`; it must name an existing file.
fn push_source(path: &Path) -> Result<String, DeviceError> {
    if !std::fs::metadata(path)?.is_file() {
        return Err(DeviceError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not a file", path.display()),
        )));
    }
    Ok(path.display().to_string())
}

fn yadb_text(value: &str) -> String {
    value.replace(['\n', '\t'], " ")
}

/// `input text` treats spaces as argument separators; `%s` is its space.
fn input_text_escape(value: &str) -> String {
    value.replace(' ', "%s").replace('\'', "\\'")
}
