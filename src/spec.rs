use crate::types::{Expected, Tag, TestCase, TestSuite};
use indexmap::IndexSet;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read manifest {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest {} is not valid JSON: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("case {case} in {} has no '{field}'", path.display())]
    MissingField {
        path: PathBuf,
        case: String,
        field: &'static str,
    },
    #[error("case {case} in {} has an empty 'results' list", path.display())]
    EmptyResults { path: PathBuf, case: String },
    #[error("case {case} in {}: '{field}' must be {expected}", path.display())]
    WrongType {
        path: PathBuf,
        case: String,
        field: &'static str,
        expected: &'static str,
    },
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
}

// Cases stay as raw maps: `"document": null` and `"result": null` are legal
// and must not collapse into "field absent".
#[derive(Debug, Deserialize)]
struct RawManifest {
    tests: Vec<Map<String, Value>>,
}

/// Load every manifest named by `paths`. Directories are searched for
/// `*.json` files in file-name order.
pub fn load_suites(paths: &[PathBuf]) -> Result<Vec<TestSuite>, LoadError> {
    let mut files = Vec::new();
    for p in paths {
        if p.is_dir() {
            for entry in WalkDir::new(p).sort_by_file_name() {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type().is_file() && path.extension().is_some_and(|e| e == "json") {
                    files.push(path.to_path_buf());
                }
            }
        } else {
            files.push(p.clone());
        }
    }
    files.iter().map(|f| load_suite(f)).collect()
}

/// Read a single manifest: a top-level object with a `tests` array.
pub fn load_suite(path: &Path) -> Result<TestSuite, LoadError> {
    let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: RawManifest = serde_json::from_str(&content).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let cases = raw
        .tests
        .into_iter()
        .enumerate()
        .map(|(idx, obj)| parse_case(path, idx, obj))
        .collect::<Result<Vec<_>, _>>()?;
    debug!(file = %path.display(), cases = cases.len(), "loaded manifest");
    Ok(TestSuite {
        name: path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "suite".to_string()),
        cases,
    })
}

fn parse_case(path: &Path, idx: usize, mut obj: Map<String, Value>) -> Result<TestCase, LoadError> {
    // Cases without a name are reported by position
    let mut label = format!("#{}", idx + 1);
    let missing = |label: &str, field| LoadError::MissingField {
        path: path.to_path_buf(),
        case: label.to_string(),
        field,
    };
    let wrong_type = |label: &str, field, expected| LoadError::WrongType {
        path: path.to_path_buf(),
        case: label.to_string(),
        field,
        expected,
    };

    let name = match obj.remove("name") {
        Some(Value::String(s)) => s,
        Some(_) => return Err(wrong_type(&label, "name", "a string")),
        None => return Err(missing(&label, "name")),
    };
    label = format!("'{name}'");
    let selector = match obj.remove("selector") {
        Some(Value::String(s)) => s,
        Some(_) => return Err(wrong_type(&label, "selector", "a string")),
        None => return Err(missing(&label, "selector")),
    };
    let invalid = match obj.remove("invalid_selector") {
        None => false,
        Some(Value::Bool(b)) => b,
        Some(_) => return Err(wrong_type(&label, "invalid_selector", "a boolean")),
    };
    let explicit_tags: Vec<String> = match obj.remove("tags") {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(wrong_type(&label, "tags", "a list of strings")),
            })
            .collect::<Result<_, _>>()?,
        Some(_) => return Err(wrong_type(&label, "tags", "a list of strings")),
    };

    let (document, expected) = if invalid {
        (obj.remove("document").unwrap_or(Value::Null), Expected::Rejected)
    } else {
        let document = obj
            .remove("document")
            .ok_or_else(|| missing(&label, "document"))?;
        let expected = match (obj.remove("result"), obj.remove("results")) {
            (Some(v), _) => Expected::One(v),
            (None, Some(Value::Array(vs))) if vs.is_empty() => {
                return Err(LoadError::EmptyResults {
                    path: path.to_path_buf(),
                    case: label,
                });
            }
            (None, Some(Value::Array(vs))) => Expected::AnyOf(vs),
            (None, Some(_)) => return Err(wrong_type(&label, "results", "a list")),
            (None, None) => return Err(missing(&label, "result")),
        };
        (document, expected)
    };

    let tags = derive_tags(&name, invalid, explicit_tags);
    Ok(TestCase {
        name,
        selector,
        document,
        expected,
        tags,
    })
}

/// Category markers for a case, from its name and manifest flags.
pub fn derive_tags(name: &str, invalid: bool, explicit: Vec<String>) -> IndexSet<Tag> {
    let mut tags = IndexSet::new();
    if invalid {
        tags.insert(Tag::InvalidSelector);
    }
    if name.contains("functions") {
        tags.insert(Tag::Functions);
    }
    if name.contains("filter") {
        tags.insert(Tag::Filters);
    }
    if name.contains("operators") {
        tags.insert(Tag::Operators);
    }
    tags.extend(explicit.into_iter().map(Tag::Custom));
    tags
}
