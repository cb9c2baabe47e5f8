use crate::types::{Tag, TestCase};
use regex::Regex;
use serde::Deserialize;

/// Named exclusion sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// Skips invalid selectors, functions, filters and operators.
    #[default]
    Minimal,
    /// Skips invalid selectors and functions only.
    Broad,
    /// Skips nothing.
    All,
}

const MINIMAL_TAGS: &[Tag] = &[
    Tag::InvalidSelector,
    Tag::Functions,
    Tag::Filters,
    Tag::Operators,
];
const BROAD_TAGS: &[Tag] = &[Tag::InvalidSelector, Tag::Functions];

impl Preset {
    pub fn tags(self) -> &'static [Tag] {
        match self {
            Preset::Minimal => MINIMAL_TAGS,
            Preset::Broad => BROAD_TAGS,
            Preset::All => &[],
        }
    }
}

#[derive(Debug, Clone)]
pub enum Exclusion {
    Tag(Tag),
    NameContains(String),
    NameMatches(Regex),
}

impl Exclusion {
    pub fn excludes(&self, case: &TestCase) -> bool {
        match self {
            Exclusion::Tag(tag) => case.has_tag(tag),
            Exclusion::NameContains(s) => case.name.contains(s.as_str()),
            Exclusion::NameMatches(re) => re.is_match(&case.name),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    rules: Vec<Exclusion>,
}

impl ExclusionSet {
    pub fn from_preset(preset: Preset) -> Self {
        Self {
            rules: preset.tags().iter().cloned().map(Exclusion::Tag).collect(),
        }
    }

    pub fn push(&mut self, rule: Exclusion) {
        self.rules.push(rule);
    }

    pub fn with(mut self, rule: Exclusion) -> Self {
        self.push(rule);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn excludes(&self, case: &TestCase) -> bool {
        self.rules.iter().any(|r| r.excludes(case))
    }
}

/// Drop excluded cases, keeping the rest in their original order.
pub fn filter_cases(cases: &[TestCase], exclusions: &ExclusionSet) -> Vec<TestCase> {
    cases
        .iter()
        .filter(|c| !exclusions.excludes(c))
        .cloned()
        .collect()
}

/// Narrow the executed sequence to what `-t/--test` asked for: a 1-based
/// number, an exact name, or otherwise every case whose name contains the text.
pub fn select_cases(cases: &[TestCase], selection: &str) -> Option<Vec<TestCase>> {
    let selection = selection.trim();
    if let Ok(n) = selection.parse::<usize>() {
        return (n >= 1 && n <= cases.len()).then(|| vec![cases[n - 1].clone()]);
    }
    let exact: Vec<TestCase> = cases
        .iter()
        .filter(|c| c.name == selection)
        .cloned()
        .collect();
    if !exact.is_empty() {
        return Some(exact);
    }
    let partial: Vec<TestCase> = cases
        .iter()
        .filter(|c| c.name.contains(selection))
        .cloned()
        .collect();
    (!partial.is_empty()).then_some(partial)
}
