// UI layer: console output for the operator. Everything here is a thin
// wrapper over `crossterm`, `dialoguer` and `indicatif` so the pipeline
// modules stay free of terminal concerns.

use crate::upload::UploadReport;
use anyhow::Result;
use crossterm::{cursor, execute, terminal};
use dialoguer::Input;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{stdout, IsTerminal};
use std::time::Duration;

/// Clear the terminal before a run. Ignored when stdout is not a terminal.
pub fn clear_console() {
    if !stdout().is_terminal() {
        return;
    }
    let _ = execute!(stdout(), terminal::Clear(terminal::ClearType::All), cursor::MoveTo(0, 0));
}

fn style(template: &str, fallback: ProgressStyle) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or(fallback)
}

/// Spinner shown while a blocking step runs. Call `finish_with_message`
/// (or drop it) when the step is over.
pub fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(style("{spinner} {msg}", ProgressStyle::default_spinner()));
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

/// Progress bar counting uploaded chunks.
pub fn upload_progress(chunks: usize) -> ProgressBar {
    let bar = ProgressBar::new(chunks as u64);
    bar.set_style(style(
        "{spinner} [{elapsed_precise}] [{bar:40}] {pos}/{len} chunks",
        ProgressStyle::default_bar(),
    ));
    bar
}

/// Show the device verification URL and block until the user confirms the
/// device was approved in the browser.
pub fn wait_for_device_approval(verification_uri: &str) -> Result<()> {
    println!("Please authenticate with Anaplan using this URL in an incognito browser:");
    println!("  {verification_uri}");
    let _: String = Input::new()
        .with_prompt("Press Enter to continue")
        .allow_empty(true)
        .interact_text()?;
    Ok(())
}

pub fn print_upload_report(report: &UploadReport) {
    let total = report.remote.declared_chunk_count;
    if report.is_success() {
        println!(
            "Uploaded {total} chunk(s) to '{}' (file id {})",
            report.target_name, report.remote.file_id
        );
        return;
    }
    let failed = report.failures().count();
    println!(
        "Upload of '{}' failed: {failed} of {total} chunk(s) did not upload",
        report.target_name
    );
    for r in report.failures() {
        println!(
            "  chunk {}: {}",
            r.sequence_index,
            r.error.as_deref().unwrap_or("unknown error")
        );
    }
}
