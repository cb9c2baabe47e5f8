use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use colored::control::set_override as set_color_override;
use cts_runner::backend::{CancelToken, ExternalToolchain, Toolchain};
use cts_runner::config::HarnessConfig;
use cts_runner::engine::{RunOptions, run_cases};
use cts_runner::filter::{Preset, filter_cases, select_cases};
use cts_runner::i18n;
use cts_runner::matcher::MatchMode;
use cts_runner::report::{OutputKind, ReportOptions, Reporter};
use cts_runner::spec::load_suites;
use cts_runner::types::TestCase;
use cts_runner::{t, t_args};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Exit status for configuration and manifest errors.
const EXIT_SETUP_ERROR: u8 = 2;
/// Exit status after Ctrl-C, as shells report for SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PresetOpt {
    Minimal,
    Broad,
    All,
}

impl From<PresetOpt> for Preset {
    fn from(v: PresetOpt) -> Self {
        match v {
            PresetOpt::Minimal => Preset::Minimal,
            PresetOpt::Broad => Preset::Broad,
            PresetOpt::All => Preset::All,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Normal,
    Terse,
    Final,
}

impl From<OutputFormat> for OutputKind {
    fn from(v: OutputFormat) -> Self {
        match v {
            OutputFormat::Normal => OutputKind::Normal,
            OutputFormat::Terse => OutputKind::Terse,
            OutputFormat::Final => OutputKind::Final,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(version, about = t!("cli-about"))]
struct Cli {
    // One or more manifests, or directories holding them
    #[arg(
        value_name = "MANIFEST",
        default_value = "jsonpath-compliance-test-suite/cts.json",
        help = t!("cli-manifests")
    )]
    manifests: Vec<PathBuf>,

    #[arg(long, value_name = "FILE", help = t!("cli-config"))]
    config: Option<PathBuf>,

    // Selector compiler command line, split on whitespace
    #[arg(long, value_name = "CMD", help = t!("cli-compiler"))]
    compiler: Option<String>,

    #[arg(long, value_name = "CMD", help = t!("cli-cxx"))]
    cxx: Option<String>,

    #[arg(long = "std", value_name = "STD", help = t!("cli-std"))]
    cxx_std: Option<String>,

    #[arg(long, value_name = "DIR", help = t!("cli-simdjson"))]
    simdjson: Option<PathBuf>,

    #[arg(long = "support-lib", value_name = "FILE", help = t!("cli-support-lib"))]
    support_lib: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = t!("cli-workdir"))]
    workdir: Option<PathBuf>,

    #[arg(long = "run-timeout", value_name = "SECS", help = t!("cli-run-timeout"))]
    run_timeout: Option<u64>,

    #[arg(long, value_enum, help = t!("cli-preset"))]
    preset: Option<PresetOpt>,

    #[arg(short = 'x', long = "exclude", value_name = "TEXT", help = t!("cli-exclude"))]
    exclude: Vec<String>,

    #[arg(long = "exclude-pattern", value_name = "REGEX", help = t!("cli-exclude-pattern"))]
    exclude_patterns: Vec<String>,

    #[arg(long = "ignore-order", help = t!("cli-ignore-order"))]
    ignore_order: bool,

    // -t/--test: number (1..N), exact name or part of a name; "list" prints the cases
    #[arg(short = 't', long = "test", value_name = "TEST", help = t!("cli-test"))]
    test: Option<String>,

    #[arg(short = 'j', long = "jobs", value_name = "N", help = t!("cli-jobs"))]
    jobs: Option<usize>,

    #[arg(long = "serial", conflicts_with = "jobs", help = t!("cli-serial"))]
    serial: bool,

    #[arg(short = 'q', long = "silent", help = t!("cli-silent"))]
    silent: bool,

    #[arg(short = 'v', long = "verbose", help = t!("cli-verbose"))]
    verbose: bool,

    #[arg(long = "no-color", help = t!("cli-no-color"))]
    no_color: bool,

    #[arg(
        short = 'f',
        long = "hide-fails",
        conflicts_with = "hide_passes",
        help = t!("cli-hide-fails")
    )]
    hide_fails: bool,

    #[arg(
        short = 'p',
        long = "hide-passes",
        conflicts_with = "hide_fails",
        help = t!("cli-hide-passes")
    )]
    hide_passes: bool,

    #[arg(
        short = 'o',
        long = "output",
        value_enum,
        default_value = "normal",
        help = t!("cli-output")
    )]
    output: OutputFormat,

    #[arg(long = "no-fail-exit", help = t!("cli-no-fail-exit"))]
    no_fail_exit: bool,
}

impl Cli {
    /// CLI flags win over the config file.
    fn apply(&self, cfg: &mut HarnessConfig) -> Result<()> {
        if let Some(cmd) = &self.compiler {
            cfg.compiler = cmd.split_whitespace().map(str::to_string).collect();
            if cfg.compiler.is_empty() {
                anyhow::bail!(t!("config-empty-compiler"));
            }
        }
        if let Some(cxx) = &self.cxx {
            cfg.cxx = cxx.clone();
        }
        if let Some(std) = &self.cxx_std {
            cfg.std = std.clone();
        }
        if let Some(dir) = &self.simdjson {
            cfg.simdjson = Some(dir.clone());
        }
        if let Some(lib) = &self.support_lib {
            cfg.support_lib = lib.clone();
        }
        if let Some(dir) = &self.workdir {
            cfg.workdir = Some(dir.clone());
        }
        if let Some(secs) = self.run_timeout {
            cfg.timeouts.run = secs;
        }
        if let Some(preset) = self.preset {
            cfg.preset = preset.into();
        }
        cfg.exclude.extend(self.exclude.iter().cloned());
        cfg.exclude_patterns.extend(self.exclude_patterns.iter().cloned());
        if self.ignore_order {
            cfg.match_mode = MatchMode::IgnoreOrder;
        }
        if self.serial {
            cfg.jobs = Some(1);
        } else if let Some(n) = self.jobs {
            cfg.jobs = Some(n);
        }
        Ok(())
    }
}

fn display_path(path: &Path) -> String {
    match std::fs::canonicalize(path) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => path.display().to_string(),
    }
}

fn resolve_command(cmd: &str) -> String {
    match which::which(cmd) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => cmd.to_string(),
    }
}

fn list_cases(cases: &[TestCase]) {
    println!("{}", t!("available-tests"));
    for (idx, case) in cases.iter().enumerate() {
        println!(
            "  {}",
            t_args!("test-list-item", "index" => (idx + 1), "name" => &case.name)
        );
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    i18n::init();
    let cli = Cli::parse();

    // -v shows INFO, RUST_LOG still overrides either way
    let default_filter = if cli.verbose {
        "cts_runner=info"
    } else {
        "cts_runner=warn"
    };
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if cli.no_color {
        set_color_override(false);
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_SETUP_ERROR)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut cfg = HarnessConfig::load(cli.config.as_deref())?;
    cli.apply(&mut cfg)?;
    let exclusions = cfg.exclusions()?;

    let suites = load_suites(&cli.manifests)?;
    let all: Vec<TestCase> = suites.into_iter().flat_map(|s| s.cases).collect();
    let mut cases = filter_cases(&all, &exclusions);
    info!(
        "{}",
        t_args!("info-filtered", "loaded" => all.len(), "kept" => cases.len())
    );

    if let Some(sel) = &cli.test {
        let trimmed = sel.trim();
        if trimmed == "0" || trimmed.eq_ignore_ascii_case("list") {
            list_cases(&cases);
            return Ok(ExitCode::SUCCESS);
        }
        match select_cases(&cases, trimmed) {
            Some(selected) => cases = selected,
            None => {
                error!("{}", t_args!("error-test-not-found", "test" => trimmed));
                list_cases(&cases);
                return Ok(ExitCode::from(EXIT_SETUP_ERROR));
            }
        }
    }

    let cancel = CancelToken::default();
    let toolchain = ExternalToolchain::new(&cfg, cancel.clone());
    toolchain
        .validate()
        .with_context(|| t!("error-validation-failed"))?;

    if cli.verbose && !cli.silent {
        info!(
            "{}",
            t_args!("info-version",
                "name" => env!("CARGO_PKG_NAME"),
                "version" => env!("CARGO_PKG_VERSION")
            )
        );
        let compiler = cfg.compiler.first().map(String::as_str).unwrap_or_default();
        info!("{}", t_args!("info-compiler", "cmd" => resolve_command(compiler)));
        info!("{}", t_args!("info-cxx", "cmd" => resolve_command(&cfg.cxx)));
        info!(
            "{}",
            t_args!("info-support-lib", "path" => display_path(&cfg.support_lib))
        );
        info!(
            "{}",
            t_args!("info-starting-tests", "count" => cases.len(), "jobs" => cfg.jobs())
        );
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("{}", t!("warn-interrupted"));
                cancel.cancel();
            }
        });
    }

    let opts = RunOptions {
        jobs: cfg.jobs(),
        mode: cfg.match_mode,
        cancel: cancel.clone(),
    };
    let report_opts = ReportOptions {
        kind: cli.output.into(),
        verbose: cli.verbose,
        hide_passes: cli.hide_passes,
        hide_fails: cli.hide_fails,
        silent: cli.silent,
    };
    let reporter = Reporter::new(report_opts, &cases);

    // Subprocess waits block, so the whole run lives on a blocking thread
    let (summary, reporter) = tokio::task::spawn_blocking(move || {
        let summary = run_cases(&toolchain, &cases, &opts, |outcome, done, total| {
            reporter.case(outcome, done, total)
        });
        (summary, reporter)
    })
    .await
    .context(t!("error-runner-crashed"))?;

    reporter.finish(&summary);
    info!(
        "{}",
        t_args!("info-all-finished",
            "total" => summary.total,
            "passed" => summary.passed,
            "failed" => summary.failed
        )
    );

    if cancel.is_cancelled() {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    if !summary.all_passed() && !cli.no_fail_exit {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "cts-runner",
            "cts.json",
            "--compiler",
            "target/release/jsonpath-compiler --standalone",
            "--preset",
            "broad",
            "-x",
            "slice",
            "--serial",
            "--ignore-order",
            "--run-timeout",
            "2",
        ]);
        let mut cfg = HarnessConfig::default();
        cli.apply(&mut cfg).unwrap();
        assert_eq!(cfg.compiler, ["target/release/jsonpath-compiler", "--standalone"]);
        assert_eq!(cfg.preset, Preset::Broad);
        assert_eq!(cfg.exclude, ["slice"]);
        assert_eq!(cfg.jobs(), 1);
        assert_eq!(cfg.match_mode, MatchMode::IgnoreOrder);
        assert_eq!(cfg.timeouts.run, 2);
    }

    #[test]
    fn default_manifest_path() {
        let cli = Cli::parse_from(["cts-runner"]);
        assert_eq!(
            cli.manifests,
            [PathBuf::from("jsonpath-compliance-test-suite/cts.json")]
        );
    }

    #[test]
    fn bad_exclude_pattern_is_caught_by_config() {
        let cli = Cli::parse_from(["cts-runner", "--exclude-pattern", "("]);
        let mut cfg = HarnessConfig::default();
        cli.apply(&mut cfg).unwrap();
        assert!(cfg.exclusions().is_err());
    }
}
