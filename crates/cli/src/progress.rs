//! Cargo-style progress output for vsync
//!
//! Displays progress in the familiar cargo format:
//! ```text
//!    Scanning 18211 entries, 1.02 GiB
//!     Scanned 20480 files, 1311 dirs (1.20 GiB) in 3.21s
//!     Changed 120 upserted, 4 removed
//!       Clock [laptop:7]
//! ```

use std::io::Write as _;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use vsync_core::{ChangeAction, ChangeRecord, JobOutcome, ScanReport};

/// Status verbs for cargo-style output (right-aligned to 12 chars)
struct Status;

impl Status {
    const SCANNING: &str = "Scanning";
    const SCANNED: &str = "Scanned";
    const CHANGED: &str = "Changed";
    const CLOCK: &str = "Clock";
    const UPSERTED: &str = "Upserted";
    const REMOVED: &str = "Removed";
    const WATCHING: &str = "Watching";
}

/// Shared draw target so log lines and spinners do not overwrite each other.
pub fn multi() -> &'static MultiProgress {
    static MULTI: OnceLock<MultiProgress> = OnceLock::new();
    MULTI.get_or_init(MultiProgress::new)
}

/// `tracing` writer that prints above any active spinner.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProgressWriter;

impl std::io::Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        multi().suspend(|| std::io::stderr().write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        multi().suspend(|| std::io::stderr().flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for ProgressWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

/// Print a cargo-style status line
pub fn print_status(status: &str, message: &str) {
    let style = console::Style::new().green().bold();
    let line = format!("{:>12} {}", style.apply_to(status), message);
    multi().suspend(|| {
        let _ = writeln!(console::Term::stderr(), "{line}");
    });
}

fn print_warning(status: &str, message: &str) {
    let style = console::Style::new().yellow().bold();
    let line = format!("{:>12} {}", style.apply_to(status), message);
    multi().suspend(|| {
        let _ = writeln!(console::Term::stderr(), "{line}");
    });
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed.as_secs() >= 1 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}

/// Progress tracker for one scan job
pub struct ScanProgress {
    start: Instant,
    spinner: ProgressBar,
}

impl ScanProgress {
    pub fn new() -> Self {
        let spinner = multi().add(ProgressBar::new_spinner());
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg:>12} {prefix}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message(Status::SCANNING);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self {
            start: Instant::now(),
            spinner,
        }
    }

    /// Refresh the spinner from a running report
    pub fn update(&self, report: &ScanReport) {
        let size = humansize::format_size(report.total_size, humansize::BINARY);
        self.spinner
            .set_prefix(format!("{} entries, {size}", report.entries()));
    }

    /// Clear the spinner without a summary
    pub fn clear(&self) {
        self.spinner.finish_and_clear();
    }

    /// Clear the spinner and print the job summary
    pub fn finish(&self, outcome: &JobOutcome) {
        self.spinner.finish_and_clear();
        let elapsed = format_elapsed(self.start.elapsed());

        if outcome.cancelled {
            print_warning("Cancelled", &format!("after {elapsed}"));
        } else if let Some(error) = &outcome.error {
            print_warning("Failed", &format!("{error} after {elapsed}"));
        } else if let Some(report) = &outcome.report {
            let size = humansize::format_size(report.total_size, humansize::BINARY);
            print_status(
                Status::SCANNED,
                &format!(
                    "{} files, {} dirs, {} links ({size}) in {elapsed}",
                    report.files, report.directories, report.soft_links
                ),
            );
            print_status(
                Status::CHANGED,
                &format!("{} upserted, {} removed", report.upserted, report.removed),
            );
            if report.errors > 0 || report.ignored > 0 {
                print_warning(
                    "Skipped",
                    &format!("{} ignored, {} unreadable", report.ignored, report.errors),
                );
            }
        }
        print_status(Status::CLOCK, &outcome.clock.to_string());
    }
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// One line per committed change while watching
pub fn change(record: &ChangeRecord) {
    let path = record.path.display();
    match (record.action, &record.entry) {
        (ChangeAction::Upsert, Some(entry)) => {
            print_status(Status::UPSERTED, &format!("{path} ({})", entry.kind.label()));
        }
        (ChangeAction::Upsert, None) => print_status(Status::UPSERTED, &path.to_string()),
        (ChangeAction::Remove, _) => print_status(Status::REMOVED, &path.to_string()),
    }
}

pub fn watching(root: &std::path::Path) {
    print_status(
        Status::WATCHING,
        &format!("{} (Ctrl+C to stop)", root.display()),
    );
}
