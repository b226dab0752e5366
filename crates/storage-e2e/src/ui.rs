//! Console output for the runner.

use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use storage_e2e::runner::Progress;
use storage_e2e::{Outcome, RunReport, Scenario, ScenarioReport};

pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

pub fn print_scenario_table(scenarios: &[Scenario]) {
    println!(
        "{:<34} {:<7} {}",
        "ID".bold(),
        "CASE".bold(),
        "TITLE".bold()
    );
    for scenario in scenarios {
        println!(
            "{:<34} {:<7} {}",
            scenario.id.cyan(),
            scenario.case_label(),
            scenario.title
        );
    }
}

/// Spinner shown while a scenario runs.
pub fn spinner(message: String) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Spinner while a scenario runs, replaced by its outcome line.
#[derive(Default)]
pub struct ConsoleProgress {
    spinner: Option<ProgressBar>,
}

impl Progress for ConsoleProgress {
    fn started(&mut self, scenario: &Scenario) {
        self.spinner = Some(spinner(format!("{} {}", scenario.id, scenario.title)));
    }

    fn finished(&mut self, report: &ScenarioReport) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
        print_outcome(
            &report.id,
            report.status,
            report.duration_secs,
            report.error.as_deref(),
        );
    }
}

pub fn print_outcome(id: &str, outcome: Outcome, duration_secs: f64, error: Option<&str>) {
    let elapsed = format!("({duration_secs:.1}s)").bright_black();
    match outcome {
        Outcome::Passed => println!("{} {} {elapsed}", "✓".green().bold(), id.green()),
        Outcome::Skipped => println!(
            "{} {} {elapsed} {}",
            "⚠".yellow().bold(),
            id.yellow(),
            error.unwrap_or_default().bright_black()
        ),
        Outcome::Failed => {
            println!("{} {} {elapsed}", "✗".red().bold(), id.red());
            if let Some(error) = error {
                println!("    {}", error.red());
            }
        }
    }
}

pub fn print_summary(report: &RunReport) {
    print_section("Summary");
    for scenario in &report.scenarios {
        print_outcome(
            &scenario.id,
            scenario.status,
            scenario.duration_secs,
            scenario.error.as_deref(),
        );
    }
    println!();
    println!(
        "{} passed, {} failed, {} skipped",
        report.passed().to_string().green().bold(),
        report.failed().to_string().red().bold(),
        report.skipped().to_string().yellow().bold()
    );
}
