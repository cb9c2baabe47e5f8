use crate::config::{HarnessConfig, StageTimeouts};
use crate::{t, t_args};
use anyhow::{Result, anyhow};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;
use wait_timeout::ChildExt;

/// How often a waiting stage looks at the cancellation flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// File name of the generated source inside a case directory.
pub const SOURCE_FILE: &str = "prog.cpp";

/// Shared flag that aborts in-flight subprocesses (operator interrupt).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("cannot start '{cmd}': {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("'{cmd}' timed out after {limit:?}")]
    Timeout { cmd: String, limit: Duration },
    #[error("'{cmd}' was cancelled")]
    Cancelled { cmd: String },
    #[error("'{cmd}' exited with {status}")]
    Failed {
        cmd: String,
        status: ExitStatus,
        stderr: String,
    },
}

impl StageError {
    /// Text worth showing to the user: the captured stderr if the process
    /// produced any, the error itself otherwise.
    pub fn diagnostic(&self) -> String {
        match self {
            StageError::Failed { stderr, .. } if !stderr.trim().is_empty() => {
                format!("{self}\n{}", stderr.trim_end())
            }
            _ => self.to_string(),
        }
    }

    /// True when the process ran to completion and reported failure itself.
    pub fn is_exit_failure(&self) -> bool {
        matches!(self, StageError::Failed { .. })
    }
}

/// Output of a subprocess that exited successfully.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// The three external collaborators of a case pipeline.
pub trait Toolchain: Send + Sync {
    /// Compile `selector` into program source.
    fn generate(&self, selector: &str) -> Result<Captured, StageError>;
    /// Build `source` inside `workdir` and return the executable's path.
    fn build(&self, source: &[u8], workdir: &Path) -> Result<PathBuf, StageError>;
    /// Run a built program with `document` on stdin.
    fn run(&self, program: &Path, document: &[u8]) -> Result<Captured, StageError>;
    /// Parent directory for per-case build directories.
    fn workdir_root(&self) -> Option<&Path> {
        None
    }
    /// Fail fast on configuration errors before any case runs.
    fn validate(&self) -> Result<()>;
}

/// Runs the configured selector compiler, C++ toolchain and generated
/// programs as subprocesses.
#[derive(Debug, Clone)]
pub struct ExternalToolchain {
    pub compiler: Vec<String>,
    pub cxx: String,
    pub std: String,
    pub simdjson: Option<PathBuf>,
    pub support_lib: PathBuf,
    pub extra_flags: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub timeouts: StageTimeouts,
    pub cancel: CancelToken,
}

impl ExternalToolchain {
    pub fn new(cfg: &HarnessConfig, cancel: CancelToken) -> Self {
        Self {
            compiler: cfg.compiler.clone(),
            cxx: cfg.cxx.clone(),
            std: cfg.std.clone(),
            simdjson: cfg.simdjson.clone(),
            support_lib: cfg.support_lib.clone(),
            extra_flags: cfg.extra_flags.clone(),
            workdir: cfg.workdir.clone(),
            timeouts: cfg.timeouts.clone(),
            cancel,
        }
    }

    /// Copy the support library (and its header, if there is one) into `workdir`.
    fn stage_support_lib(&self, workdir: &Path) -> Result<String, StageError> {
        let file_name = self
            .support_lib
            .file_name()
            .ok_or_else(|| io::Error::other(t!("backend-support-lib-not-file")))?;
        fs::copy(&self.support_lib, workdir.join(file_name))?;
        let header = self.support_lib.with_extension("h");
        if let Some(header_name) = header.file_name() {
            if header.is_file() {
                fs::copy(&header, workdir.join(header_name))?;
            }
        }
        Ok(file_name.to_string_lossy().into_owned())
    }

    fn build_command(&self, support_file: &str, output: &Path) -> Command {
        let mut cmd = Command::new(&self.cxx);
        cmd.arg(SOURCE_FILE)
            .arg(support_file)
            .arg(format!("-std={}", self.std));
        if let Some(prefix) = &self.simdjson {
            cmd.arg(format!("-I{}", prefix.join("include").display()))
                .arg(format!("-L{}", prefix.join("lib").display()));
        }
        cmd.arg("-lsimdjson").args(&self.extra_flags).arg("-o").arg(output);
        cmd
    }
}

impl Toolchain for ExternalToolchain {
    fn generate(&self, selector: &str) -> Result<Captured, StageError> {
        let (program, args) = self
            .compiler
            .split_first()
            .ok_or_else(|| io::Error::other(t!("config-empty-compiler")))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        run_process(
            cmd,
            selector.as_bytes().to_vec(),
            self.timeouts.generate(),
            &self.cancel,
        )
    }

    fn build(&self, source: &[u8], workdir: &Path) -> Result<PathBuf, StageError> {
        fs::write(workdir.join(SOURCE_FILE), source)?;
        let support_file = self.stage_support_lib(workdir)?;
        let output = workdir.join(format!("prog{}", std::env::consts::EXE_SUFFIX));
        let mut cmd = self.build_command(&support_file, &output);
        cmd.current_dir(workdir);
        run_process(cmd, Vec::new(), self.timeouts.build(), &self.cancel)?;
        Ok(output)
    }

    fn run(&self, program: &Path, document: &[u8]) -> Result<Captured, StageError> {
        let mut cmd = Command::new(program);
        if let Some(dir) = program.parent() {
            cmd.current_dir(dir);
        }
        run_process(cmd, document.to_vec(), self.timeouts.run(), &self.cancel)
    }

    fn workdir_root(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    fn validate(&self) -> Result<()> {
        let compiler = self
            .compiler
            .first()
            .ok_or_else(|| anyhow!(t!("config-empty-compiler")))?;
        for cmd in [compiler, &self.cxx] {
            which::which(cmd).map_err(
                |e| anyhow!(t_args!("backend-command-not-found", "cmd" => cmd, "error" => e)),
            )?;
        }
        if !self.support_lib.is_file() {
            return Err(anyhow!(t_args!(
                "backend-support-lib-missing",
                "file" => self.support_lib.display()
            )));
        }
        if let Some(dir) = &self.workdir {
            fs::create_dir_all(dir).map_err(|e| {
                anyhow!(t_args!("backend-workdir-failed", "dir" => dir.display(), "error" => e))
            })?;
        }
        Ok(())
    }
}

/// Run `cmd` with `input` on stdin, collecting stdout and stderr. The child is
/// killed when `limit` expires or `cancel` fires.
pub fn run_process(
    mut cmd: Command,
    input: Vec<u8>,
    limit: Duration,
    cancel: &CancelToken,
) -> Result<Captured, StageError> {
    let name = cmd.get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // A group of its own, so a kill also reaches wrappers' children
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
    debug!(cmd = %name, "spawning");
    let mut child = cmd.spawn().map_err(|source| StageError::Spawn {
        cmd: name.clone(),
        source,
    })?;

    // Pipes are drained on their own threads so a chatty child cannot block
    // on a full pipe while we wait for it.
    let stdin = child.stdin.take();
    let writer = thread::spawn(move || -> io::Result<()> {
        if let Some(mut stdin) = stdin {
            match stdin.write_all(&input) {
                // The child may exit without reading its input
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                other => other?,
            }
        }
        Ok(())
    });
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_reader = thread::spawn(move || read_pipe(stdout));
    let err_reader = thread::spawn(move || read_pipe(stderr));

    // On timeout or cancel the pipe threads are not joined: a descendant that
    // left the process group may still hold the pipes open.
    let status = wait_with_limit(&mut child, &name, limit, cancel)?;

    let written = join_pipe(writer);
    let stdout = join_pipe(out_reader);
    let stderr = join_pipe(err_reader);
    written?;
    let stdout = stdout?;
    let stderr = String::from_utf8_lossy(&stderr?).into_owned();
    debug!(cmd = %name, %status, bytes = stdout.len(), "finished");
    if !status.success() {
        return Err(StageError::Failed {
            cmd: name,
            status,
            stderr,
        });
    }
    Ok(Captured { stdout, stderr })
}

fn wait_with_limit(
    child: &mut Child,
    name: &str,
    limit: Duration,
    cancel: &CancelToken,
) -> Result<ExitStatus, StageError> {
    let deadline = Instant::now() + limit;
    loop {
        if cancel.is_cancelled() {
            kill(child);
            return Err(StageError::Cancelled {
                cmd: name.to_string(),
            });
        }
        let now = Instant::now();
        if now >= deadline {
            kill(child);
            return Err(StageError::Timeout {
                cmd: name.to_string(),
                limit,
            });
        }
        if let Some(status) = child.wait_timeout((deadline - now).min(POLL_INTERVAL))? {
            return Ok(status);
        }
    }
}

fn kill(child: &mut Child) {
    #[cfg(unix)]
    if let Ok(pid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: plain signal delivery; a negative pid addresses the group
        // created for this child in `run_process`.
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn read_pipe<R: Read>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf)?;
    }
    Ok(buf)
}

fn join_pipe<T>(handle: thread::JoinHandle<io::Result<T>>) -> io::Result<T> {
    handle
        .join()
        .map_err(|_| io::Error::other(t!("backend-pipe-thread-panicked")))?
}
