use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{HumanCount, ProgressBar, ProgressStyle};
use patchfleet_core::{ExecutionResult, FleetReport, Outcome};
use patchfleet_resolver::{ComplianceReport, ResolvedBuild};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputStyle {
    Plain,
    Rich,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum UiMode {
    Plain,
    Interactive,
}

#[derive(Copy, Clone, Debug)]
pub struct TerminalRenderer {
    style: OutputStyle,
    mode: UiMode,
}

pub struct TerminalProgress {
    style: OutputStyle,
    label: String,
    total: u64,
    current: u64,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

pub fn resolve_output_style(stdout_is_tty: bool, _stderr_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub fn current_output_style() -> OutputStyle {
    resolve_output_style(
        std::io::stdout().is_terminal(),
        std::io::stderr().is_terminal(),
    )
}

impl TerminalRenderer {
    pub fn from_style(style: OutputStyle) -> Self {
        Self {
            style,
            mode: ui_mode_from_style(style),
        }
    }

    pub fn current() -> Self {
        Self::from_style(current_output_style())
    }

    pub fn style(self) -> OutputStyle {
        self.style
    }

    pub fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub fn print_warning(self, message: &str) {
        match self.style {
            OutputStyle::Plain => eprintln!("warning: {message}"),
            OutputStyle::Rich => eprintln!("{}", render_status_line(self.style, "warn", message)),
        }
    }

    pub fn print_error(self, message: &str) {
        match self.style {
            OutputStyle::Plain => eprintln!("error: {message}"),
            OutputStyle::Rich => eprintln!(
                "{}",
                colorize(error_style(), &render_status_line(self.style, "error", message))
            ),
        }
    }

    pub fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.mode, title) {
            println!();
            let rendered = match self.style {
                OutputStyle::Plain => line,
                OutputStyle::Rich => colorize(section_style(), &line),
            };
            println!("{rendered}");
        }
    }

    pub fn start_progress(self, label: &str, total: u64) -> TerminalProgress {
        let progress_bar = (self.style == OutputStyle::Rich).then(|| {
            let bar = ProgressBar::new(total.max(1));
            if let Ok(template) = ProgressStyle::with_template(
                "{spinner:.green} {msg} {wide_bar:.green/white} {pos}/{len} results ({elapsed})",
            ) {
                bar.set_style(template.tick_chars(spinner_frames(label)).progress_chars("#>."));
            }
            bar.set_message(label.to_string());
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        });

        TerminalProgress {
            style: self.style,
            label: label.to_string(),
            total,
            current: 0,
            progress_bar,
            started_at: Instant::now(),
        }
    }

    pub fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }
}

impl TerminalProgress {
    pub fn inc(&mut self) {
        self.current = (self.current + 1).min(self.total);
        if let Some(progress_bar) = &self.progress_bar {
            progress_bar.set_position(self.current);
        }
    }

    /// Prints above the bar so it is not overdrawn.
    pub fn println(&self, line: &str) {
        match &self.progress_bar {
            Some(progress_bar) => progress_bar.println(line),
            None => println!("{line}"),
        }
    }

    pub fn finish_success(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };

        progress_bar.finish_and_clear();
        if let Some(line) = render_finish_line(
            self.style,
            &self.label,
            self.current,
            self.total,
            self.started_at.elapsed(),
        ) {
            println!("{line}");
        }
    }
}

pub fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("[{}] {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "OK",
        "warn" => "WARN",
        "error" => "ERR",
        "skip" => "SKIP",
        "what-if" => "WHAT-IF",
        _ => "INFO",
    }
}

pub fn outcome_status(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Succeeded | Outcome::UpToDate => "ok",
        Outcome::Failed => "error",
        Outcome::Skipped => "skip",
        Outcome::DryRun => "what-if",
    }
}

/// One line per result: `host KB target level outcome [error] notes`.
pub fn format_result_line(result: &ExecutionResult, style: OutputStyle) -> String {
    let mut message = match &result.action {
        Some(action) => format!(
            "{}: {} {} ({}) {}",
            result.computer_name,
            action.kb_label(),
            action.target_version,
            action.level_label(),
            result.outcome.as_str()
        ),
        None => format!("{}: {}", result.computer_name, result.outcome.as_str()),
    };
    if let Some(kind) = result.error {
        message.push_str(&format!(" [{kind}]"));
    }
    if let Some(action) = &result.action {
        if action.restarted {
            message.push_str(" restarted");
        } else if action.restart_required {
            message.push_str(" restart-required");
        }
    }
    if !result.notes.is_empty() {
        message.push_str(" - ");
        message.push_str(&result.notes.join("; "));
    }

    let line = render_status_line(style, outcome_status(result.outcome), &message);
    match (style, result.outcome) {
        (OutputStyle::Rich, Outcome::Failed) => colorize(error_style(), &line),
        (OutputStyle::Rich, Outcome::Succeeded) => colorize(success_style(), &line),
        _ => line,
    }
}

pub fn format_update_summary_line(report: &FleetReport) -> String {
    let mut counts = [0_usize; 5];
    for result in report.results() {
        let slot = match result.outcome {
            Outcome::Succeeded => 0,
            Outcome::UpToDate => 1,
            Outcome::DryRun => 2,
            Outcome::Skipped => 3,
            Outcome::Failed => 4,
        };
        counts[slot] += 1;
    }
    format!(
        "update summary: hosts={} succeeded={} up-to-date={} what-if={} skipped={} failed={}",
        report.hosts().count(),
        counts[0],
        counts[1],
        counts[2],
        counts[3],
        counts[4]
    )
}

pub fn format_resolved_lines(query: &str, resolved: &ResolvedBuild) -> Vec<String> {
    let kbs = if resolved.kb_list.is_empty() {
        "-".to_string()
    } else {
        resolved
            .kb_list
            .iter()
            .map(|kb| format!("KB{kb}"))
            .collect::<Vec<_>>()
            .join(",")
    };
    let mut lines = vec![format!(
        "{query}: build={} release={} level={} kb={} match={} latest={}",
        resolved.version,
        resolved.release_name.as_deref().unwrap_or("-"),
        resolved.level_label(),
        kbs,
        resolved.match_type.as_str(),
        resolved.is_latest
    )];
    if let Some(supported_until) = resolved.supported_until {
        lines.push(format!("  supported until {}", supported_until.format("%Y-%m-%d")));
    }
    if resolved.retired {
        lines.push("  retired".to_string());
    }
    lines
}

pub fn format_compliance_lines(report: &ComplianceReport) -> Vec<String> {
    let target_level = match (&report.target.service_pack, &report.target.cumulative_update) {
        (Some(sp), Some(cu)) => format!("{sp}{cu}"),
        (Some(sp), None) => sp.clone(),
        _ => "-".to_string(),
    };
    vec![
        format!(
            "installed: {} ({})",
            report.installed_version,
            report
                .installed
                .as_ref()
                .map_or_else(|| "unknown level".to_string(), ResolvedBuild::level_label)
        ),
        format!("target: {} ({target_level})", report.target.version),
        format!("compliant: {}", report.compliant),
    ]
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}.{:01}s", elapsed.subsec_millis() / 100)
    }
}

fn spinner_frames(label: &str) -> &'static str {
    match label {
        "update" => "<^>v ",
        "download" => "-=~* ",
        _ => "|/-\\ ",
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn success_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::Green.into()))
}

fn error_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightRed.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn ui_mode_from_style(style: OutputStyle) -> UiMode {
    match style {
        OutputStyle::Plain => UiMode::Plain,
        OutputStyle::Rich => UiMode::Interactive,
    }
}

fn render_section_header(mode: UiMode, title: &str) -> Option<String> {
    match mode {
        UiMode::Plain => None,
        UiMode::Interactive => Some(format!("== {title} ==")),
    }
}

/// `update: 12/12 results in 3.2s`, printed once the bar is cleared.
fn render_finish_line(
    style: OutputStyle,
    label: &str,
    current: u64,
    total: u64,
    elapsed: Duration,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }
    let line = format!(
        "{label}: {}/{} results in {}",
        HumanCount(current),
        HumanCount(total),
        format_elapsed(elapsed)
    );
    Some(colorize(section_style(), &line))
}
