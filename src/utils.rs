//! # Utility Functions and Helper Module
//!
//! Formatting and table helpers shared by the live report and the final
//! summary.
//!
//! - **Formatting**: human-readable durations, latencies and rates
//! - **Display Helpers**: fixed-width table rows and a progress indicator
//!
//! ## Usage Examples
//!
//! ```rust
//! use chat_rampup::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
//! assert_eq!(format_millis(12.346), "12.35ms");
//! assert_eq!(format_rate(3.2), "3.20 msg/s");
//! ```

use std::time::Duration;

/// Format a duration for display
///
/// Sub-second values are shown in milliseconds, values under a minute in
/// seconds with one decimal, and longer values in compound form.
///
/// ## Examples
///
/// ```rust
/// # use chat_rampup::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
/// assert_eq!(format_duration(Duration::from_millis(2500)), "2.5s");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ms = duration.as_millis();

    if total_ms < 1_000 {
        format!("{}ms", total_ms)
    } else if total_ms < 60_000 {
        format!("{:.1}s", duration.as_secs_f64())
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format seconds as a duration, e.g. for elapsed and remaining times
pub fn format_secs(secs: f64) -> String {
    format_duration(Duration::from_secs_f64(secs.max(0.0)))
}

/// Format a latency given in milliseconds with two decimals
pub fn format_millis(ms: f64) -> String {
    format!("{:.2}ms", ms)
}

/// Format a message rate
pub fn format_rate(per_second: f64) -> String {
    format!("{:.2} msg/s", per_second)
}

/// Render one table row with fixed column widths
///
/// Content wider than its column is not truncated; it pushes the rest of
/// the row to the right.
///
/// ```rust
/// # use chat_rampup::utils::format_table_row;
/// assert_eq!(format_table_row(&["a", "bb"], &[3, 4]), "| a   | bb   |");
/// ```
pub fn format_table_row(columns: &[&str], widths: &[usize]) -> String {
    let mut row = String::from("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        row.push_str(&format!(" {:width$} |", column, width = width));
    }
    row
}

/// Render a separator line matching [`format_table_row`]
///
/// ```rust
/// # use chat_rampup::utils::format_table_separator;
/// assert_eq!(format_table_separator(&[3, 4]), "+-----+------+");
/// ```
pub fn format_table_separator(widths: &[usize]) -> String {
    let mut line = String::from("+");
    for &width in widths {
        line.push_str(&"-".repeat(width + 2));
        line.push('+');
    }
    line
}

/// Create a progress bar-like indicator
///
/// A zero total renders as complete; progress is capped at 100%.
///
/// ```rust
/// # use chat_rampup::utils::create_progress_indicator;
/// assert_eq!(create_progress_indicator(0, 100, 10), "░░░░░░░░░░");
/// assert_eq!(create_progress_indicator(50, 100, 10), "█████░░░░░");
/// assert_eq!(create_progress_indicator(150, 100, 10), "██████████");
/// ```
pub fn create_progress_indicator(current: usize, total: usize, width: usize) -> String {
    if total == 0 {
        return "█".repeat(width);
    }

    let progress = (current as f64 / total as f64).min(1.0);
    let filled = ((progress * width as f64) as usize).min(width);
    let empty = width - filled;

    format!("{}{}", "█".repeat(filled), "░".repeat(empty))
}
