#![allow(dead_code)]

use cts_runner::backend::{Captured, StageError, Toolchain};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Mutex;

pub fn exit_status(code: i32) -> ExitStatus {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(code << 8)
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::ExitStatusExt;
        ExitStatus::from_raw(code as u32)
    }
}

fn failed(cmd: &str, stderr: &str) -> StageError {
    StageError::Failed {
        cmd: cmd.into(),
        status: exit_status(1),
        stderr: stderr.into(),
    }
}

/// Understands `$` and `$.name`. The "program" it builds is the member name
/// written to a file; running it looks the name up in the document.
///
/// A few selectors trigger failures in later stages: `$.build_error`,
/// `$.crash` and `$.garbage`.
#[derive(Default)]
pub struct MockToolchain {
    /// Emit `null` instead of `[]` for absent members.
    pub null_for_missing: bool,
    pub workdirs: Mutex<Vec<PathBuf>>,
}

impl Toolchain for MockToolchain {
    fn generate(&self, selector: &str) -> Result<Captured, StageError> {
        let member = match selector {
            "$" => "",
            s => s
                .strip_prefix("$.")
                .filter(|m| !m.is_empty())
                .ok_or_else(|| failed("jsonpath-compiler", "syntax error"))?,
        };
        Ok(Captured {
            stdout: member.as_bytes().to_vec(),
            stderr: String::new(),
        })
    }

    fn build(&self, source: &[u8], workdir: &Path) -> Result<PathBuf, StageError> {
        self.workdirs.lock().unwrap().push(workdir.to_path_buf());
        if source == b"build_error" {
            return Err(failed("c++", "prog.cpp:1:1: error: expected unqualified-id"));
        }
        let program = workdir.join("prog");
        fs::write(&program, source)?;
        Ok(program)
    }

    fn run(&self, program: &Path, document: &[u8]) -> Result<Captured, StageError> {
        let member = fs::read_to_string(program)?;
        let doc: Value = serde_json::from_slice(document).map_err(std::io::Error::other)?;
        let stdout = match member.as_str() {
            "crash" => return Err(failed("prog", "Segmentation fault")),
            "garbage" => b"{\"unterminated\": ".to_vec(),
            "" => doc.to_string().into_bytes(),
            m => match doc.get(m) {
                Some(v) => v.to_string().into_bytes(),
                None if self.null_for_missing => b"null".to_vec(),
                None => b"[]".to_vec(),
            },
        };
        Ok(Captured {
            stdout,
            stderr: String::new(),
        })
    }

    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
