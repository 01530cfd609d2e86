use gridpilot::config::{AgentConfig, GridSource};
use gridpilot::logger::{EventSink, TaskLogger};
use gridpilot::{DeviceInfo, RunOutcome, RunSummary};

const RULE: &str = "============================================================";

/// What the run is about to do, printed once before the first step.
pub fn print_banner(task: &str, device: &DeviceInfo, config: &AgentConfig, logger: &TaskLogger) {
    let grid = &config.grid;
    let source = match config.grid_source {
        GridSource::Custom => "custom",
        GridSource::Auto => "auto",
    };

    println!("{RULE}");
    println!("Grid Agent");
    println!("{RULE}");
    println!("Task:    {task}");
    println!("Device:  {} ({}x{})", device.name, device.width, device.height);
    println!(
        "Grid:    {}x{} ({}), cells {:.1}x{:.1}px, columns A-{}",
        grid.cols(),
        grid.rows(),
        source,
        grid.cell_width(),
        grid.cell_height(),
        grid.last_letter()
    );
    println!("Model:   {}", config.model.model);
    println!("Input:   {}", if device.yadb { "yadb keyboard" } else { "adb input text" });
    if let Some(path) = logger.log_file() {
        println!("Log:     {}", path.display());
    }
    println!("{RULE}");
}

pub fn print_summary(summary: &RunSummary, logger: &TaskLogger) {
    println!();
    println!("{RULE}");
    println!("Execution Summary");
    println!("{RULE}");
    let status = match &summary.outcome {
        _ if summary.success => "SUCCESS".to_string(),
        RunOutcome::Aborted(reason) => format!("FAILED ({reason})"),
        RunOutcome::Done => "FAILED".to_string(),
    };
    println!("Status:      {status}");
    println!("Steps:       {}", summary.steps);
    println!("Total time:  {:.2}s", summary.elapsed.as_secs_f64());
    if let Some(times) = &summary.step_times {
        println!("Avg step:    {:.2}s", times.average.as_secs_f64());
    }
    println!(
        "Tokens:      {} ({} in / {} out)",
        summary.usage.total(),
        summary.usage.input_tokens,
        summary.usage.output_tokens
    );
    println!("Cost:        ${:.4}", summary.cost_usd);

    if !summary.history.is_empty() {
        println!();
        println!("Actions:");
        for (i, entry) in summary.history.iter().enumerate() {
            println!("  {}. {} - {}", i + 1, entry.decision.action, entry.decision.explain());
        }
    }

    if let Some(path) = &summary.log_file {
        println!();
        println!("Log:         {}", path.display());
        println!("Images:      {}", logger.image_dir().display());
    }
    println!("{RULE}");
}
