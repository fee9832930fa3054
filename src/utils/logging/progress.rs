//! Progress reporting for long-running stages
//!
//! Thin wrappers around indicatif so every bar in the crate shares one style.
//! Bars are hidden unless progress output was requested.

use indicatif::{ProgressBar, ProgressStyle};

/// Default style for the run-level progress bar
pub const DEFAULT_MAIN_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({per_sec}) {msg}";

/// Default style for a per-stage progress bar
pub const DEFAULT_STAGE_TEMPLATE: &str =
    "{spinner} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}";

fn styled(length: u64, template: &str, description: Option<&str>, visible: bool) -> ProgressBar {
    let pb = if visible {
        ProgressBar::new(length)
    } else {
        ProgressBar::hidden()
    };
    pb.set_length(length);
    if let Ok(style) = ProgressStyle::default_bar().template(template) {
        pb.set_style(style.progress_chars("#>-"));
    }
    if let Some(desc) = description {
        pb.set_message(desc.to_string());
    }
    pb
}

/// Create the run-level progress bar
///
/// # Arguments
/// * `length` - Number of stages
/// * `description` - Optional initial message
/// * `visible` - Draw to the terminal; otherwise the bar is hidden
#[must_use]
pub fn create_main_progress_bar(
    length: u64,
    description: Option<&str>,
    visible: bool,
) -> ProgressBar {
    styled(length, DEFAULT_MAIN_TEMPLATE, description, visible)
}

/// Create a progress bar for the work units of one stage
#[must_use]
pub fn create_stage_progress_bar(length: u64, stage: &str, visible: bool) -> ProgressBar {
    styled(length, DEFAULT_STAGE_TEMPLATE, Some(stage), visible)
}

/// Finish a progress bar with a completion message
pub fn finish_progress_bar(pb: &ProgressBar, message: Option<&str>) {
    if let Some(msg) = message {
        pb.finish_with_message(msg.to_string());
    } else {
        pb.finish();
    }
}
