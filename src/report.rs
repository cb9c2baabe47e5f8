use crate::matcher::canonical_string;
use crate::t_args;
use crate::types::{CaseOutcome, CaseStatus, RunSummary, TestCase};
use colored::Colorize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputKind {
    /// One line per case, plus failure details in verbose mode.
    #[default]
    Normal,
    /// Failing cases only.
    Terse,
    /// Summary line only.
    Final,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOptions {
    pub kind: OutputKind,
    pub verbose: bool,
    pub hide_passes: bool,
    pub hide_fails: bool,
    pub silent: bool,
}

/// Prints progress lines as outcomes arrive. Holds the expected values so
/// verbose failure reports can show them next to the actual output.
#[derive(Debug, Default)]
pub struct Reporter {
    opts: ReportOptions,
    expected: Vec<Vec<Value>>, // by case position
}

impl Reporter {
    pub fn new(opts: ReportOptions, cases: &[TestCase]) -> Self {
        let expected = if opts.verbose {
            cases
                .iter()
                .map(|c| c.expected.alternatives().to_vec())
                .collect()
        } else {
            Vec::new()
        };
        Self { opts, expected }
    }

    fn shows(&self, outcome: &CaseOutcome) -> bool {
        if self.opts.silent || self.opts.kind == OutputKind::Final {
            return false;
        }
        if outcome.passed() {
            !self.opts.hide_passes && self.opts.kind != OutputKind::Terse
        } else {
            !self.opts.hide_fails
        }
    }

    /// Text for one finished case, or `None` when the options hide it.
    pub fn render_case(&self, outcome: &CaseOutcome, done: usize, total: usize) -> Option<String> {
        if !self.shows(outcome) {
            return None;
        }
        let mut out = render_case_line(outcome, done, total);
        if self.opts.verbose && !outcome.passed() {
            out.push_str(&self.render_details(outcome));
        }
        Some(out)
    }

    pub fn case(&self, outcome: &CaseOutcome, done: usize, total: usize) {
        if let Some(text) = self.render_case(outcome, done, total) {
            print!("{text}");
        }
    }

    pub fn finish(&self, summary: &RunSummary) {
        if !self.opts.silent {
            println!();
            println!("{}", render_summary(summary));
        }
    }

    fn render_details(&self, outcome: &CaseOutcome) -> String {
        let mut out = String::new();
        if let CaseStatus::Failed(stage) = outcome.status {
            out.push_str(&format!("  {} {}\n", "stage     :".bold(), stage));
        }
        if let Some(actual) = &outcome.actual {
            out.push_str(&format!("  {} {}\n", "actual    :".bold(), canonical_string(actual)));
        }
        if let Some(alts) = outcome.index.checked_sub(1).and_then(|i| self.expected.get(i)) {
            for alt in alts {
                out.push_str(&format!("  {} {}\n", "expected  :".bold(), canonical_string(alt)));
            }
        }
        if let Some(diag) = &outcome.diagnostic {
            let mut lines = diag.lines();
            if let Some(first) = lines.next() {
                out.push_str(&format!("  {} {}\n", "diagnostic:".bold(), first.red()));
            }
            for line in lines {
                out.push_str(&format!("              {}\n", line.red()));
            }
        }
        out
    }
}

/// `[3/120] Running test 'basic, root'    OK`
pub fn render_case_line(outcome: &CaseOutcome, done: usize, total: usize) -> String {
    let status = if outcome.passed() {
        "OK".green().bold()
    } else {
        "FAILED".red().bold()
    };
    format!(
        "{}\n",
        t_args!("case-line",
            "done" => done,
            "total" => total,
            "name" => &outcome.name,
            "status" => status
        )
    )
}

pub fn render_summary(summary: &RunSummary) -> String {
    t_args!("summary", "total" => summary.total, "passed" => summary.passed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Expected, Stage};
    use indexmap::IndexSet;
    use serde_json::json;
    use std::time::Duration;

    fn outcome(name: &str, status: CaseStatus) -> CaseOutcome {
        CaseOutcome {
            index: 1,
            name: name.into(),
            status,
            actual: Some(json!([2])),
            diagnostic: Some("line one\nline two".into()),
            elapsed: Duration::ZERO,
        }
    }

    fn plain() {
        colored::control::set_override(false);
    }

    #[test]
    fn case_line_format() {
        plain();
        let line = render_case_line(&outcome("basic, root", CaseStatus::Passed), 3, 120);
        assert_eq!(line, "[3/120] Running test 'basic, root'    OK\n");
        let line = render_case_line(&outcome("x", CaseStatus::Failed(Stage::Run)), 1, 1);
        assert_eq!(line, "[1/1] Running test 'x'    FAILED\n");
    }

    #[test]
    fn summary_format() {
        let mut summary = RunSummary::default();
        summary.record(outcome("a", CaseStatus::Passed));
        summary.record(outcome("b", CaseStatus::Failed(Stage::Build)));
        assert_eq!(render_summary(&summary), "Total tests: 2 Passed: 1");
    }

    #[test]
    fn hiding_and_terse_output() {
        let pass = outcome("a", CaseStatus::Passed);
        let fail = outcome("b", CaseStatus::Failed(Stage::Validate));

        let terse = Reporter::new(
            ReportOptions {
                kind: OutputKind::Terse,
                ..Default::default()
            },
            &[],
        );
        assert!(terse.render_case(&pass, 1, 2).is_none());
        assert!(terse.render_case(&fail, 2, 2).is_some());

        let no_fails = Reporter::new(
            ReportOptions {
                hide_fails: true,
                ..Default::default()
            },
            &[],
        );
        assert!(no_fails.render_case(&pass, 1, 2).is_some());
        assert!(no_fails.render_case(&fail, 2, 2).is_none());

        let fin = Reporter::new(
            ReportOptions {
                kind: OutputKind::Final,
                ..Default::default()
            },
            &[],
        );
        assert!(fin.render_case(&fail, 2, 2).is_none());
    }

    #[test]
    fn verbose_failure_shows_everything() {
        plain();
        let case = TestCase {
            name: "b".into(),
            selector: "$".into(),
            document: json!([]),
            expected: Expected::AnyOf(vec![json!([1]), json!([3])]),
            tags: IndexSet::new(),
        };
        let reporter = Reporter::new(
            ReportOptions {
                verbose: true,
                ..Default::default()
            },
            &[case],
        );
        let text = reporter
            .render_case(&outcome("b", CaseStatus::Failed(Stage::Validate)), 1, 1)
            .unwrap();
        assert!(text.contains("stage     : validate"));
        assert!(text.contains("actual    : [2]"));
        assert!(text.contains("expected  : [1]"));
        assert!(text.contains("expected  : [3]"));
        assert!(text.contains("diagnostic: line one"));
        assert!(text.contains("line two"));
    }
}
