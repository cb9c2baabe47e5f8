use indexmap::IndexSet;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Category marker attached to a case while loading.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tag {
    InvalidSelector,
    Functions,
    Filters,
    Operators,
    Custom(String),
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::InvalidSelector => f.write_str("invalid selector"),
            Tag::Functions => f.write_str("uses functions"),
            Tag::Filters => f.write_str("uses filters"),
            Tag::Operators => f.write_str("uses operators"),
            Tag::Custom(s) => f.write_str(s),
        }
    }
}

/// What a case accepts as a correct answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Expected {
    /// Exactly one accepted result (`result` in the manifest).
    One(Value),
    /// Any of several results (`results`); never empty.
    AnyOf(Vec<Value>),
    /// The compiler has to refuse the selector (`invalid_selector`).
    Rejected,
}

impl Expected {
    /// Accepted values in manifest order. Empty for `Rejected`.
    pub fn alternatives(&self) -> &[Value] {
        match self {
            Expected::One(v) => std::slice::from_ref(v),
            Expected::AnyOf(vs) => vs,
            Expected::Rejected => &[],
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestCase {
    pub name: String,
    pub selector: String,
    pub document: Value,
    pub expected: Expected,
    pub tags: IndexSet<Tag>,
}

impl TestCase {
    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }
}

#[derive(Debug, Clone)]
pub struct TestSuite {
    pub name: String,
    pub cases: Vec<TestCase>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Generate,
    Build,
    Run,
    Validate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Generate => "generate",
            Stage::Build => "build",
            Stage::Run => "run",
            Stage::Validate => "validate",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseStatus {
    Passed,
    Failed(Stage),
}

impl CaseStatus {
    pub fn passed(self) -> bool {
        matches!(self, CaseStatus::Passed)
    }

    pub fn failed_stage(self) -> Option<Stage> {
        match self {
            CaseStatus::Passed => None,
            CaseStatus::Failed(stage) => Some(stage),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaseOutcome {
    pub index: usize, // 1-based position in the executed sequence
    pub name: String,
    pub status: CaseStatus,
    pub actual: Option<Value>,
    pub diagnostic: Option<String>,
    pub elapsed: Duration,
}

impl CaseOutcome {
    pub fn passed(&self) -> bool {
        self.status.passed()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total: usize,  // Cases that were executed
    pub passed: usize, // Outcomes with status Passed
    pub failed: usize,
    pub cases: Vec<CaseOutcome>,
}

impl RunSummary {
    /// Single entry point for aggregation so the counters stay in sync with `cases`.
    pub fn record(&mut self, outcome: CaseOutcome) {
        self.total += 1;
        if outcome.passed() {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.cases.push(outcome);
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}
