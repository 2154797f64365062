//! Console output formatting with ANSI color support.
//!
//! Provides styled terminal output with automatic TTY detection
//! and respect for the NO_COLOR environment variable.

use crate::orchestrator::ProgressInfo;
use crate::report::{Report, SegmentOutcome};
use std::io::{self, IsTerminal, Write};

/// ANSI style codes for terminal formatting.
#[derive(Debug, Clone, Copy)]
pub enum Style {
    Bold,
    Dim,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    Gray,
}

impl Style {
    /// Returns the ANSI escape code for this style.
    fn code(self) -> &'static str {
        match self {
            Style::Bold => "1",
            Style::Dim => "2",
            Style::Red => "31",
            Style::Green => "32",
            Style::Yellow => "33",
            Style::Blue => "34",
            Style::Magenta => "35",
            Style::Cyan => "36",
            Style::Gray => "90",
        }
    }
}

const RESET: &str = "\x1b[0m";

/// Console output handler with color support detection.
#[derive(Debug)]
pub struct Console {
    colors_enabled: bool,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    /// Creates a new Console instance, detecting color support.
    ///
    /// Colors are disabled if:
    /// - The `NO_COLOR` environment variable is set
    /// - stdout is not a terminal (TTY)
    pub fn new() -> Self {
        let colors_enabled = std::env::var("NO_COLOR").is_err() && io::stdout().is_terminal();

        Self { colors_enabled }
    }

    /// Creates a Console with colors explicitly enabled or disabled.
    pub fn with_colors(enabled: bool) -> Self {
        Self {
            colors_enabled: enabled,
        }
    }

    /// Applies ANSI styles to text if colors are enabled.
    pub fn style(&self, text: &str, styles: &[Style]) -> String {
        if !self.colors_enabled || styles.is_empty() {
            return text.to_string();
        }

        let codes: Vec<&str> = styles.iter().map(|s| s.code()).collect();
        format!("\x1b[{}m{}{}", codes.join(";"), text, RESET)
    }

    /// Creates a colored label like `[INFO]`.
    pub fn label(&self, label: &str, color: Style) -> String {
        let styled = self.style(label, &[color, Style::Bold]);
        format!("[{}]", styled)
    }

    /// Prints an info message with blue `[INFO]` label.
    pub fn info(&self, message: &str) {
        println!("{} {}", self.label("INFO", Style::Blue), message);
    }

    /// Prints a success message with green `[OK]` label.
    pub fn success(&self, message: &str) {
        println!("{} {}", self.label("OK", Style::Green), message);
    }

    /// Prints a warning message with yellow `[WARN]` label.
    pub fn warning(&self, message: &str) {
        println!("{} {}", self.label("WARN", Style::Yellow), message);
    }

    /// Prints an error message with red `[ERROR]` label.
    pub fn error(&self, message: &str) {
        eprintln!("{} {}", self.label("ERROR", Style::Red), message);
    }

    /// Prints a step message with cyan `[STEP]` label.
    pub fn step(&self, message: &str) {
        println!("{} {}", self.label("STEP", Style::Cyan), message);
    }

    /// Prints a section header in magenta bold.
    pub fn section(&self, message: &str) {
        println!();
        println!("{}", self.style(message, &[Style::Magenta, Style::Bold]));
    }

    /// Returns text styled as muted (dim gray).
    pub fn muted(&self, text: &str) -> String {
        self.style(text, &[Style::Gray, Style::Dim])
    }

    /// Clears the current line (for progress updates).
    pub fn clear_line(&self) {
        if self.colors_enabled {
            print!("\r\x1b[2K");
            let _ = io::stdout().flush();
        }
    }

    /// Prints a progress update on the same line.
    pub fn progress_update(&self, message: &str) {
        self.clear_line();
        print!("{} {}", self.label("..", Style::Cyan), message);
        let _ = io::stdout().flush();
    }

    /// Formats a count with styling.
    pub fn count(&self, n: usize) -> String {
        self.style(&n.to_string(), &[Style::Green, Style::Bold])
    }

    /// Formats a `[done/total]` counter.
    pub fn counter(&self, done: usize, total: usize) -> String {
        self.style(&format!("[{}/{}]", done, total), &[Style::Cyan, Style::Bold])
    }

    /// Prints a one-line update for a finished segment.
    pub fn segment_progress(&self, info: &ProgressInfo) {
        let file = info
            .document
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let status = match &info.outcome {
            SegmentOutcome::Translated => self.style("translated", &[Style::Green]),
            SegmentOutcome::Cached => self.style("cached", &[Style::Blue]),
            SegmentOutcome::Failed { kind, .. } => self.style(&kind.to_string(), &[Style::Red]),
            SegmentOutcome::Cancelled => self.style("cancelled", &[Style::Yellow]),
        };
        self.progress_update(&format!(
            "{} {} {} {}",
            self.counter(info.completed, info.total),
            file,
            self.muted(&info.segment_id),
            status
        ));
        if info.completed == info.total {
            println!();
        }
    }

    /// Prints the summary of a translation run.
    pub fn report(&self, report: &Report) {
        let totals = &report.totals;
        self.section("Summary");
        self.info(&format!(
            "{} segments: {} translated, {} cached, {} failed, {} cancelled in {:.1}s",
            self.count(totals.attempted),
            totals.succeeded,
            totals.cached,
            totals.failed,
            totals.cancelled,
            report.elapsed.as_secs_f64()
        ));

        for document in report.documents.iter().filter(|d| d.error.is_some()) {
            self.error(&format!(
                "{}: {}",
                document.path.display(),
                document.error.as_deref().unwrap_or_default()
            ));
        }
        for (document, segment) in report.failures() {
            if let SegmentOutcome::Failed { kind, message } = &segment.outcome {
                self.warning(&format!(
                    "{} {} {}: {}",
                    document.path.display(),
                    segment.segment_id,
                    kind,
                    message
                ));
            }
        }

        if report.is_clean() && totals.cancelled == 0 {
            self.success("All segments translated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_style_disabled() {
        let console = Console::with_colors(false);
        assert_eq!(console.style("hello", &[Style::Red]), "hello");
    }

    #[test]
    fn test_style_enabled() {
        let console = Console::with_colors(true);
        let styled = console.style("hello", &[Style::Red]);
        assert!(styled.contains("\x1b[31m"));
        assert!(styled.contains("hello"));
        assert!(styled.contains(RESET));
    }

    #[test]
    fn test_multiple_styles() {
        let console = Console::with_colors(true);
        let styled = console.style("hello", &[Style::Bold, Style::Red]);
        assert!(styled.contains("1;31"));
    }

    #[test]
    fn test_counter_plain() {
        let console = Console::with_colors(false);
        assert_eq!(console.counter(3, 10), "[3/10]");
        assert_eq!(console.muted("abc"), "abc");
    }

    #[test]
    fn test_label() {
        let console = Console::with_colors(false);
        assert_eq!(console.label("INFO", Style::Blue), "[INFO]");
    }
}
