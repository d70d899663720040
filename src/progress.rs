//! Progress reporting for walks and copies
//!
//! Provides real-time progress display using indicatif progress bars.

use crate::copy::TreeCopyStats;
use crate::dispatch::DispatchStats;
use crate::replicate::ReplicateStats;
use crate::walker::WalkStats;
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

/// Progress reporter that displays walk and copy status
pub struct ProgressReporter {
    bar: ProgressBar,
    started: Instant,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        if let Ok(spinner) = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
        {
            bar.set_style(spinner.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }

        bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            bar,
            started: Instant::now(),
        }
    }

    /// Show walk counters
    pub fn update_walk(&self, walk: &WalkStats) {
        let rate = per_second(walk.entries, self.started.elapsed());
        self.bar.set_message(format!(
            "Dirs: {} | Entries: {} | Files: {} | Size: {} | Rate: {:.0}/s",
            format_number(walk.dirs_listed),
            format_number(walk.entries),
            format_number(walk.files),
            format_size(walk.bytes, BINARY),
            rate,
        ));
    }

    /// Show walk and copy counters together
    pub fn update_copy(&self, walk: &WalkStats, copy: &DispatchStats) {
        let elapsed = self.started.elapsed();
        self.bar.set_message(format!(
            "Walked: {} | Copied: {} ({}) | Skipped: {} | Failed: {} | {}/s",
            format_number(walk.entries),
            format_number(copy.ok),
            format_size(copy.bytes, BINARY),
            format_number(copy.skipped),
            format_number(copy.failed + copy.fatal),
            format_size(per_second(copy.bytes, elapsed) as u64, BINARY),
        ));
    }

    /// Set a status message
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish the progress display with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Finish and clear the progress display
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn per_second(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| {
            chunk
                .iter()
                .rev()
                .map(|&b| b as char)
                .collect::<String>()
        })
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print a summary of a walk
pub fn print_walk_summary(walk: &WalkStats, duration: Duration) {
    println!();
    println!("{}", style("Walk Complete").green().bold());
    println!("{}", style("─".repeat(50)).dim());
    print_walk_lines(walk, duration);
    println!();
}

/// Print a summary of a copy
pub fn print_copy_summary(
    walk: &WalkStats,
    copy: &DispatchStats,
    tree: &TreeCopyStats,
    duration: Duration,
    interrupted: bool,
) {
    let title = if interrupted {
        style("Copy Interrupted").yellow().bold()
    } else {
        style("Copy Complete").green().bold()
    };

    println!();
    println!("{}", title);
    println!("{}", style("─".repeat(50)).dim());
    print_walk_lines(walk, duration);
    println!(
        "  {} {} ({})",
        style("Copied:").bold(),
        format_number(copy.ok),
        format_size(copy.bytes, BINARY)
    );
    if tree.symlinks_created > 0 {
        println!("  {} {}", style("Symlinks:").bold(), format_number(tree.symlinks_created));
    }
    let skipped = copy.skipped + tree.skipped;
    if skipped > 0 {
        println!(
            "  {} {} ({})",
            style("Up to date:").bold(),
            format_number(skipped),
            format_size(tree.skipped_bytes, BINARY)
        );
    }
    let failed = copy.failed + copy.fatal + copy.busy + tree.failures;
    if failed > 0 {
        println!("  {} {}", style("Failed:").red().bold(), format_number(failed));
    }
    println!(
        "  {} {}/s",
        style("Throughput:").bold(),
        format_size(per_second(copy.bytes, duration) as u64, BINARY)
    );
    println!();
}

/// Print a summary of a replicate run
pub fn print_replicate_summary(
    walk: &WalkStats,
    rep: &ReplicateStats,
    duration: Duration,
    interrupted: bool,
) {
    let title = if interrupted {
        style("Replicate Interrupted").yellow().bold()
    } else {
        style("Replicate Complete").green().bold()
    };

    println!();
    println!("{}", title);
    println!("{}", style("─".repeat(50)).dim());
    print_walk_lines(walk, duration);
    println!(
        "  {} {} ({})",
        style("Replicated:").bold(),
        format_number(rep.ok_files),
        format_size(rep.ok_bytes, BINARY)
    );
    if rep.skipped_files > 0 {
        println!(
            "  {} {} ({})",
            style("Skipped:").bold(),
            format_number(rep.skipped_files),
            format_size(rep.skipped_bytes, BINARY)
        );
    }
    let removed = rep.removed + rep.deferred_removed;
    if removed > 0 {
        println!("  {} {}", style("Removed:").bold(), format_number(removed));
    }
    if rep.failures() > 0 {
        println!(
            "  {} {} ({})",
            style("Failed:").red().bold(),
            format_number(rep.failures()),
            format_size(rep.failed_bytes, BINARY)
        );
    }
    if rep.limit_reached {
        println!("  {}", style("Stopped at the byte limit").yellow());
    }
    println!(
        "  {} {}/s",
        style("Throughput:").bold(),
        format_size(per_second(rep.ok_bytes, duration) as u64, BINARY)
    );
    println!();
}

fn print_walk_lines(walk: &WalkStats, duration: Duration) {
    let duration_secs = duration.as_secs_f64();
    println!(
        "  {} {}",
        style("Directories:").bold(),
        format_number(walk.dirs_listed)
    );
    println!("  {} {}", style("Files:").bold(), format_number(walk.files));
    println!("  {} {}", style("Total Size:").bold(), format_size(walk.bytes, BINARY));
    println!(
        "  {} {:.1}s ({:.0} entries/sec)",
        style("Duration:").bold(),
        duration_secs,
        per_second(walk.entries, duration)
    );
    if walk.skipped > 0 {
        println!(
            "  {} {}",
            style("Unreadable dirs:").yellow().bold(),
            format_number(walk.skipped)
        );
    }
    if walk.errors > 0 {
        println!(
            "  {} {}",
            style("Errors:").yellow().bold(),
            format_number(walk.errors)
        );
    }
}

/// Print a header at the start of a run
pub fn print_header(src: &str, dst: Option<&str>, workers: usize) {
    println!();
    println!(
        "{} {}",
        style("bulkmove").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Source:").bold(), src);
    if let Some(dst) = dst {
        println!("  {} {}", style("Destination:").bold(), dst);
    }
    println!("  {} {}", style("Workers:").bold(), workers);
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
        assert_eq!(format_number(1234567890), "1,234,567,890");
    }

    #[test]
    fn test_per_second() {
        assert_eq!(per_second(100, Duration::ZERO), 0.0);
        assert_eq!(per_second(100, Duration::from_secs(4)), 25.0);
    }
}
