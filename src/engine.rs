use crate::backend::{CancelToken, Captured, StageError, Toolchain};
use crate::matcher::{self, MatchMode};
use crate::t;
use crate::types::{CaseOutcome, CaseStatus, Expected, RunSummary, Stage, TestCase};
use rayon::prelude::*;
use std::sync::mpsc;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Worker threads; 1 runs the cases strictly one after another.
    pub jobs: usize,
    pub mode: MatchMode,
    pub cancel: CancelToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            mode: MatchMode::Exact,
            cancel: CancelToken::default(),
        }
    }
}

struct Pipeline<'a, T: ?Sized> {
    toolchain: &'a T,
    case: &'a TestCase,
    index: usize,
    mode: MatchMode,
    started: Instant,
}

impl<T: Toolchain + ?Sized> Pipeline<'_, T> {
    fn outcome(
        &self,
        status: CaseStatus,
        actual: Option<serde_json::Value>,
        diagnostic: Option<String>,
    ) -> CaseOutcome {
        CaseOutcome {
            index: self.index,
            name: self.case.name.clone(),
            status,
            actual,
            diagnostic,
            elapsed: self.started.elapsed(),
        }
    }

    fn fail(&self, stage: Stage, diagnostic: String) -> CaseOutcome {
        debug!(case = %self.case.name, %stage, "stage failed");
        self.outcome(CaseStatus::Failed(stage), None, Some(diagnostic))
    }

    fn execute(&self) -> CaseOutcome {
        let generated = self.toolchain.generate(&self.case.selector);
        if matches!(self.case.expected, Expected::Rejected) {
            return self.expect_rejection(generated);
        }
        let source = match generated {
            Ok(out) => out.stdout,
            Err(e) => return self.fail(Stage::Generate, e.diagnostic()),
        };

        // Dropped on every return below, which removes the build artifacts
        let workdir = match self.toolchain.workdir_root() {
            Some(root) => tempfile::Builder::new().prefix("cts-").tempdir_in(root),
            None => tempfile::Builder::new().prefix("cts-").tempdir(),
        };
        let workdir = match workdir {
            Ok(dir) => dir,
            Err(e) => return self.fail(Stage::Build, e.to_string()),
        };
        let program = match self.toolchain.build(&source, workdir.path()) {
            Ok(p) => p,
            Err(e) => return self.fail(Stage::Build, e.diagnostic()),
        };

        let document = match serde_json::to_vec(&self.case.document) {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(Stage::Run, e.to_string()),
        };
        let output = match self.toolchain.run(&program, &document) {
            Ok(out) => out,
            Err(e) => return self.fail(Stage::Run, e.diagnostic()),
        };

        let stderr = Some(output.stderr).filter(|s| !s.trim().is_empty());
        let actual: serde_json::Value = match serde_json::from_slice(&output.stdout) {
            Ok(v) => v,
            Err(e) => {
                let raw = String::from_utf8_lossy(&output.stdout);
                let mut diag = format!("{}: {e}\n{}", t!("engine-output-not-json"), raw.trim_end());
                if let Some(err) = &stderr {
                    diag.push('\n');
                    diag.push_str(err.trim_end());
                }
                return self.fail(Stage::Validate, diag);
            }
        };
        if matcher::matches(&actual, &self.case.expected, self.mode) {
            self.outcome(CaseStatus::Passed, Some(actual), stderr)
        } else {
            let diag = stderr.unwrap_or_else(|| t!("engine-output-mismatch"));
            self.outcome(CaseStatus::Failed(Stage::Validate), Some(actual), Some(diag))
        }
    }

    // The compiler has to refuse the selector by exiting non-zero on its own.
    // Not being able to run it at all is still a failure.
    fn expect_rejection(&self, generated: Result<Captured, StageError>) -> CaseOutcome {
        match generated {
            Err(e) if e.is_exit_failure() => {
                self.outcome(CaseStatus::Passed, None, Some(e.diagnostic()))
            }
            Err(e) => self.fail(Stage::Generate, e.diagnostic()),
            Ok(_) => self.fail(Stage::Generate, t!("engine-selector-accepted")),
        }
    }
}

/// Drive one case through generate, build, run and validate. Never fails:
/// every problem ends up in the returned outcome.
pub fn run_case<T: Toolchain + ?Sized>(
    toolchain: &T,
    case: &TestCase,
    index: usize,
    mode: MatchMode,
) -> CaseOutcome {
    Pipeline {
        toolchain,
        case,
        index,
        mode,
        started: Instant::now(),
    }
    .execute()
}

/// Run every case and aggregate the outcomes. `on_outcome` is called on the
/// calling thread, once per finished case, with the number of cases finished
/// so far; it is the only writer of progress output.
///
/// The summary lists outcomes in case order, whatever order they finished in.
/// Cases that had not started when `opts.cancel` fired are left out.
pub fn run_cases<T, F>(
    toolchain: &T,
    cases: &[TestCase],
    opts: &RunOptions,
    mut on_outcome: F,
) -> RunSummary
where
    T: Toolchain + ?Sized,
    F: FnMut(&CaseOutcome, usize, usize),
{
    let total = cases.len();
    let mut outcomes = Vec::with_capacity(total);

    let pool = if opts.jobs > 1 {
        match rayon::ThreadPoolBuilder::new().num_threads(opts.jobs).build() {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!(error = %e, "could not start worker pool, running serially");
                None
            }
        }
    } else {
        None
    };

    match pool {
        None => {
            for (i, case) in cases.iter().enumerate() {
                if opts.cancel.is_cancelled() {
                    break;
                }
                let outcome = run_case(toolchain, case, i + 1, opts.mode);
                on_outcome(&outcome, outcomes.len() + 1, total);
                outcomes.push(outcome);
            }
        }
        Some(pool) => {
            let (tx, rx) = mpsc::channel();
            std::thread::scope(|s| {
                s.spawn(move || {
                    pool.install(|| {
                        cases
                            .par_iter()
                            .enumerate()
                            .for_each_with(tx, |tx, (i, case)| {
                                if opts.cancel.is_cancelled() {
                                    return;
                                }
                                // The receiver only goes away if the caller panicked
                                let _ = tx.send(run_case(toolchain, case, i + 1, opts.mode));
                            });
                    });
                });
                for outcome in rx {
                    on_outcome(&outcome, outcomes.len() + 1, total);
                    outcomes.push(outcome);
                }
            });
        }
    }

    outcomes.sort_by_key(|o| o.index);
    let mut summary = RunSummary::default();
    for outcome in outcomes {
        summary.record(outcome);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tag;
    use indexmap::IndexSet;
    use serde_json::{Value, json};
    use std::path::{Path, PathBuf};

    /// Echoes the selector as "source" and prints it back as the program output.
    struct Echo;

    impl Toolchain for Echo {
        fn generate(&self, selector: &str) -> Result<Captured, StageError> {
            Ok(Captured {
                stdout: selector.as_bytes().to_vec(),
                stderr: String::new(),
            })
        }
        fn build(&self, source: &[u8], workdir: &Path) -> Result<PathBuf, StageError> {
            let p = workdir.join("prog");
            std::fs::write(&p, source)?;
            Ok(p)
        }
        fn run(&self, program: &Path, _document: &[u8]) -> Result<Captured, StageError> {
            Ok(Captured {
                stdout: std::fs::read(program)?,
                stderr: String::new(),
            })
        }
        fn validate(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn case(name: &str, selector: &str, expected: Expected) -> TestCase {
        TestCase {
            name: name.into(),
            selector: selector.into(),
            document: json!({}),
            expected,
            tags: IndexSet::<Tag>::new(),
        }
    }

    #[test]
    fn output_is_validated() {
        let expect = |v: Value| Expected::One(v);
        let ok = run_case(&Echo, &case("a", "[1]", expect(json!([1]))), 1, MatchMode::Exact);
        assert_eq!(ok.status, CaseStatus::Passed);
        assert_eq!(ok.actual, Some(json!([1])));

        let wrong = run_case(&Echo, &case("b", "[2]", expect(json!([1]))), 2, MatchMode::Exact);
        assert_eq!(wrong.status, CaseStatus::Failed(Stage::Validate));
        assert_eq!(wrong.actual, Some(json!([2])));

        let garbage = case("c", "not json", expect(json!([])));
        let garbage = run_case(&Echo, &garbage, 3, MatchMode::Exact);
        assert_eq!(garbage.status, CaseStatus::Failed(Stage::Validate));
        assert!(garbage.actual.is_none());
        assert!(garbage.diagnostic.unwrap().contains("not json"));
    }

    #[test]
    fn accepted_invalid_selector_fails_at_generate() {
        let out = run_case(&Echo, &case("inv", "$[", Expected::Rejected), 1, MatchMode::Exact);
        assert_eq!(out.status, CaseStatus::Failed(Stage::Generate));
    }

    #[test]
    fn summary_is_in_case_order_for_any_job_count() {
        let cases: Vec<TestCase> = (0..20)
            .map(|i| {
                let expected = if i % 3 == 0 { json!([0]) } else { json!([i]) };
                case(&format!("case {i}"), &format!("[{i}]"), Expected::One(expected))
            })
            .collect();
        for jobs in [1, 4] {
            let opts = RunOptions {
                jobs,
                ..RunOptions::default()
            };
            let mut seen = Vec::new();
            let summary = run_cases(&Echo, &cases, &opts, |o, done, total| {
                assert_eq!(total, 20);
                seen.push((done, o.index));
            });
            assert_eq!(summary.total, 20);
            // i = 0 passes ([0] == [0]); other multiples of 3 do not
            assert_eq!(summary.passed, 20 - 6);
            assert_eq!(summary.failed, 6);
            let order: Vec<usize> = summary.cases.iter().map(|o| o.index).collect();
            assert_eq!(order, (1..=20).collect::<Vec<_>>());
            let dones: Vec<usize> = seen.iter().map(|(d, _)| *d).collect();
            assert_eq!(dones, (1..=20).collect::<Vec<_>>());
        }
    }

    #[test]
    fn cancelled_run_starts_nothing() {
        let opts = RunOptions::default();
        opts.cancel.cancel();
        let cases = vec![case("a", "[1]", Expected::One(json!([1])))];
        let summary = run_cases(&Echo, &cases, &opts, |_, _, _| panic!("nothing should run"));
        assert_eq!(summary.total, 0);
    }

    #[test]
    fn empty_case_list_is_fine() {
        let summary = run_cases(&Echo, &[], &RunOptions::default(), |_, _, _| {});
        assert_eq!(summary.total, 0);
        assert_eq!(summary.passed, 0);
        assert!(summary.all_passed());
    }
}
