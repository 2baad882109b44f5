//! monoci - local/CI-parity validation for monorepos
//!
//! ## Commands
//!
//! - `run` (default): discover, plan and validate packages
//! - `detect`: list discovered packages
//! - `changes`: show changed paths and the packages they affect

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{error, info, warn, Level};

use monoci_ci::{
    find_on_path, AbortReason, CiGate, CiPipeline, ProcessRunner, Shutdown, EXIT_FAILURE,
    EXIT_INTERRUPTED, EXIT_SUCCESS,
};
use monoci_core::config::DEFAULT_BASE_REF;
use monoci_core::{
    plan, ChangeAnalyzer, CliOverrides, Ecosystem, ExecutionPlan, FileConfig, GitChangeSource,
    ImpactReason, MonociError, PackageRegistry, RunConfig,
};

#[derive(Parser, Debug)]
#[command(name = "monoci")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run monorepo quality gates locally, the way CI does", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Repository root to scan
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate packages (the default when no command is given)
    Run(RunArgs),

    /// List discovered packages
    Detect {
        /// Only list packages of this ecosystem (pixi, poetry, cargo, npm, pip)
        #[arg(long)]
        ecosystem: Option<String>,

        #[arg(long, value_enum, default_value_t = OutputFormat::List)]
        format: OutputFormat,
    },

    /// Show paths changed since a base ref and the packages they affect
    Changes {
        #[arg(long, env = "MONOCI_BASE_REF", default_value = DEFAULT_BASE_REF)]
        base_ref: String,

        #[arg(long, value_enum, default_value_t = OutputFormat::List)]
        format: OutputFormat,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    List,
    Json,
}

#[derive(Args, Debug, Clone, Default)]
struct RunArgs {
    /// Validation tier: essential, extended or full
    #[arg(long, env = "MONOCI_TIER")]
    tier: Option<String>,

    /// Maximum packages per batch (0 = number of CPUs)
    #[arg(short, long, env = "MONOCI_JOBS")]
    jobs: Option<usize>,

    /// Run deeper packages first (default)
    #[arg(long, overrides_with = "no_dependency_order")]
    dependency_order: bool,

    /// Keep discovery order
    #[arg(long, overrides_with = "dependency_order")]
    no_dependency_order: bool,

    /// Stop starting new batches after a failure
    #[arg(long, overrides_with = "continue_on_error")]
    fail_fast: bool,

    /// Run every batch regardless of failures (default)
    #[arg(long, overrides_with = "fail_fast")]
    continue_on_error: bool,

    /// Only validate packages affected by changes since --base-ref
    #[arg(long, overrides_with = "all")]
    changed_only: bool,

    /// Validate every package (default)
    #[arg(long, overrides_with = "changed_only")]
    all: bool,

    /// Base ref for --changed-only
    #[arg(long, env = "MONOCI_BASE_REF")]
    base_ref: Option<String>,

    /// Only packages whose path or name matches (repeatable)
    #[arg(long, value_name = "PATTERN")]
    include: Vec<String>,

    /// Skip packages whose path or name matches (repeatable)
    #[arg(long, value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Per-package timeout
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Timeout for the whole run
    #[arg(long, value_name = "SECONDS")]
    total_timeout: Option<u64>,

    /// Write a JSON report (default)
    #[arg(long, overrides_with = "no_reports")]
    reports: bool,

    #[arg(long, overrides_with = "reports")]
    no_reports: bool,

    /// Where reports are written
    #[arg(long, env = "MONOCI_REPORTS_DIR")]
    reports_dir: Option<PathBuf>,

    /// Print the plan without executing anything
    #[arg(long)]
    dry_run: bool,
}

/// `Some(true)` for `--flag`, `Some(false)` for `--no-flag`, `None` otherwise.
fn toggle(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (_, true) => Some(false),
        (true, _) => Some(true),
        _ => None,
    }
}

impl RunArgs {
    fn overrides(self) -> CliOverrides {
        CliOverrides {
            tier: self.tier,
            jobs: self.jobs,
            dependency_order: toggle(self.dependency_order, self.no_dependency_order),
            fail_fast: toggle(self.fail_fast, self.continue_on_error),
            changed_only: toggle(self.changed_only, self.all),
            base_ref: self.base_ref,
            include: self.include,
            exclude: self.exclude,
            timeout_secs: self.timeout,
            total_timeout_secs: self.total_timeout,
            reports: toggle(self.reports, self.no_reports),
            reports_dir: self.reports_dir,
            dry_run: self.dry_run,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    monoci_core::init_tracing(cli.json_logs, level);

    let command = match cli.command {
        Some(command) => command,
        None => Commands::Run(cli.run),
    };

    let result = match command {
        Commands::Run(args) => cmd_run(&cli.root, args).await,
        Commands::Detect { ecosystem, format } => {
            cmd_detect(&cli.root, ecosystem.as_deref(), format)
        }
        Commands::Changes { base_ref, format } => cmd_changes(&cli.root, &base_ref, format),
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "monoci failed");
            eprintln!("Error: {e:#}");
            exit_code_for(&e)
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Exit code for an error that ended the run early.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<MonociError>()
        .map(MonociError::exit_code)
        .unwrap_or(EXIT_FAILURE)
}

async fn cmd_run(root: &Path, args: RunArgs) -> Result<i32> {
    let root = std::fs::canonicalize(root).map_err(|e| {
        MonociError::Configuration(format!("cannot open root {}: {e}", root.display()))
    })?;
    let file = FileConfig::load(&root)?;
    let config = RunConfig::resolve(root, args.overrides(), file)?;

    let discovery = PackageRegistry::new(&config.root)
        .with_skip_dirs(config.skip_dirs.iter().cloned())
        .discover()?;
    for unsupported in &discovery.unsupported {
        warn!(
            path = %unsupported.path.display(),
            kind = %unsupported.kind,
            "Unsupported project type; not validated"
        );
    }
    for warning in &discovery.warnings {
        warn!("{warning}");
    }
    info!(count = discovery.packages.len(), "Discovered packages");

    let mut packages = discovery.packages;
    if config.changed_only {
        let analyzer = ChangeAnalyzer::new(GitChangeSource::new(&config.root))
            .with_global_patterns(&config.global_impact)?;
        let impact = analyzer.affected_packages(&config.base_ref, &packages);
        packages = impact.packages;
    }
    let packages = config.filter.apply(packages);

    let plan = plan(packages, config.jobs, config.dependency_order).map_err(MonociError::from)?;

    if plan.is_empty() {
        println!("No packages to validate.");
        return Ok(EXIT_SUCCESS);
    }

    if config.dry_run {
        print_plan(&plan, &config);
        return Ok(EXIT_SUCCESS);
    }

    preflight(&plan, &config)?;

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut count = 0;
            while tokio::signal::ctrl_c().await.is_ok() {
                count += 1;
                if on_interrupt(&shutdown, count) {
                    eprintln!("Interrupted again; exiting without waiting for packages");
                    std::process::exit(EXIT_INTERRUPTED);
                }
            }
        });
    }

    let executor = CiPipeline::executor(&config, Arc::new(ProcessRunner::new()));
    let (policy, context) = CiPipeline::settings(&config);

    println!(
        "Running {} tier on {} packages ({} batches, {} jobs)",
        config.tier,
        plan.package_count(),
        plan.batches.len(),
        config.jobs
    );
    let report = CiPipeline::run(&executor, &plan, &policy, &shutdown, context).await;

    print!("{}", report.render_summary());
    let verdict = CiGate::evaluate(&report);
    if verdict.passed {
        println!("\n✓ {}", verdict.message);
    } else {
        println!("\n✗ {}", verdict.message);
        for violation in &verdict.violations {
            println!("  - {violation}");
        }
    }

    if config.reports {
        match report.persist(&config.reports_dir) {
            Ok(path) => println!("Report: {}", path.display()),
            Err(e) => error!(error = %format!("{e:#}"), "Failed to write report"),
        }
    }

    Ok(CiGate::exit_code(&report))
}

/// Handle the `count`th interrupt. The first cancels the run gracefully;
/// returns `true` when the process should exit immediately.
fn on_interrupt(shutdown: &Shutdown, count: usize) -> bool {
    if count == 1 {
        warn!("Interrupt received; stopping running packages (press Ctrl-C again to force exit)");
        shutdown.trigger(AbortReason::Interrupted);
        return false;
    }
    true
}

/// Fail with exit 2 when a program the plan needs is not on `PATH`.
fn preflight(plan: &ExecutionPlan, config: &RunConfig) -> Result<()> {
    let mut needed: BTreeMap<String, String> = BTreeMap::new();
    for package in plan.packages() {
        for op in config.tier.operations() {
            if let Some(program) = package.command(op).and_then(|c| c.program()) {
                needed
                    .entry(program.to_string())
                    .or_insert_with(|| package.id.to_string());
            }
        }
    }

    for (tool, needed_by) in needed {
        if find_on_path(&tool).is_none() {
            return Err(MonociError::MissingTool { tool, needed_by }.into());
        }
    }
    Ok(())
}

fn print_plan(plan: &ExecutionPlan, config: &RunConfig) {
    println!(
        "Plan: {} packages in {} batches (tier {}, jobs {}, dependency order {})",
        plan.package_count(),
        plan.batches.len(),
        config.tier,
        plan.max_parallelism,
        if plan.dependency_ordered { "on" } else { "off" }
    );
    for batch in &plan.batches {
        println!("Batch {}:", batch.index + 1);
        for package in &batch.packages {
            let ops: Vec<&str> = config
                .tier
                .operations()
                .iter()
                .copied()
                .filter(|op| package.command(op).is_some())
                .collect();
            println!(
                "  {:<40} {:<7} {}",
                package.id.as_str(),
                package.ecosystem.name(),
                ops.join(", ")
            );
        }
    }
    println!("Plan digest: {}", plan.digest());
}

fn cmd_detect(root: &Path, ecosystem: Option<&str>, format: OutputFormat) -> Result<i32> {
    let mut registry = PackageRegistry::new(root);
    if let Some(name) = ecosystem {
        let eco = Ecosystem::parse(name).ok_or_else(|| {
            MonociError::Configuration(format!("unknown ecosystem '{name}'"))
        })?;
        registry = registry.with_ecosystems([eco]);
    }
    if let Some(file) = FileConfig::load(root)? {
        registry = registry.with_skip_dirs(file.skip_dirs);
    }
    let discovery = registry.discover()?;

    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&discovery.packages)
                .context("Failed to serialize packages")?;
            println!("{json}");
        }
        OutputFormat::List => {
            for package in &discovery.packages {
                println!(
                    "{:<40} {:<7} {}{}",
                    package.id.as_str(),
                    package.ecosystem.name(),
                    package.name,
                    if package.has_tests { "" } else { " (no tests)" }
                );
            }
            for unsupported in &discovery.unsupported {
                eprintln!(
                    "unsupported: {} ({})",
                    unsupported.path.display(),
                    unsupported.kind
                );
            }
        }
    }
    Ok(EXIT_SUCCESS)
}

#[derive(Serialize)]
struct ChangesOutput<'a> {
    base_ref: &'a str,
    changed_paths: Vec<&'a str>,
    reason: &'a ImpactReason,
    affected: Vec<&'a str>,
}

fn cmd_changes(root: &Path, base_ref: &str, format: OutputFormat) -> Result<i32> {
    let file = FileConfig::load(root)?.unwrap_or_default();
    let packages = PackageRegistry::new(root)
        .with_skip_dirs(file.skip_dirs)
        .discover()?
        .packages;

    let mut analyzer = ChangeAnalyzer::new(GitChangeSource::new(root));
    if let Some(patterns) = &file.global_impact {
        analyzer = analyzer.with_global_patterns(patterns)?;
    }
    let impact = analyzer.affected_packages(base_ref, &packages);

    let changed: Vec<&str> = impact
        .change_set
        .as_ref()
        .map(|cs| cs.changed_paths.iter().map(String::as_str).collect())
        .unwrap_or_default();
    let affected: Vec<&str> = impact.packages.iter().map(|p| p.id.as_str()).collect();

    match format {
        OutputFormat::Json => {
            let output = ChangesOutput {
                base_ref,
                changed_paths: changed,
                reason: &impact.reason,
                affected,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::List => {
            println!("Changed since {base_ref}: {} paths", changed.len());
            for path in &changed {
                println!("  {path}");
            }
            match &impact.reason {
                ImpactReason::Matched => {}
                ImpactReason::GlobalImpact { path, pattern } => {
                    println!("Global-impact change: {path} matches {pattern}");
                }
                ImpactReason::FallbackAll { error } => {
                    println!("Change detection failed ({error}); all packages affected");
                }
            }
            println!("Affected packages: {}", affected.len());
            for id in &affected {
                println!("  {id}");
            }
        }
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("monoci").chain(args.iter().copied())).unwrap()
    }

    fn write_npm_package(dir: &Path, name: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join("package.json"),
            format!("{{\"name\": \"{name}\", \"scripts\": {{\"test\": \"true\"}}}}"),
        )
        .unwrap();
    }

    #[test]
    fn test_flags_without_subcommand_run() {
        let cli = parse(&["--tier", "full", "--jobs", "3", "--fail-fast", "--dry-run"]);
        assert!(cli.command.is_none());
        let overrides = cli.run.overrides();
        assert_eq!(overrides.tier.as_deref(), Some("full"));
        assert_eq!(overrides.jobs, Some(3));
        assert_eq!(overrides.fail_fast, Some(true));
        assert_eq!(overrides.dependency_order, None);
        assert!(overrides.dry_run);
    }

    #[test]
    fn test_negated_flags() {
        let cli = parse(&[
            "run",
            "--no-dependency-order",
            "--continue-on-error",
            "--all",
            "--no-reports",
        ]);
        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run command");
        };
        let overrides = args.overrides();
        assert_eq!(overrides.dependency_order, Some(false));
        assert_eq!(overrides.fail_fast, Some(false));
        assert_eq!(overrides.changed_only, Some(false));
        assert_eq!(overrides.reports, Some(false));
    }

    #[test]
    fn test_last_toggle_wins() {
        let cli = parse(&["--fail-fast", "--continue-on-error", "--changed-only"]);
        let overrides = cli.run.overrides();
        assert_eq!(overrides.fail_fast, Some(false));
        assert_eq!(overrides.changed_only, Some(true));
    }

    #[test]
    fn test_repeated_patterns() {
        let cli = parse(&["--include", "services/*", "--include", "libs/*", "--exclude", "x"]);
        assert_eq!(cli.run.include, vec!["services/*", "libs/*"]);
        assert_eq!(cli.run.exclude, vec!["x"]);
    }

    #[test]
    fn test_detect_format() {
        let cli = parse(&["detect", "--ecosystem", "npm", "--format", "json"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Detect {
                format: OutputFormat::Json,
                ..
            })
        ));
    }

    #[test]
    fn test_second_interrupt_forces_exit() {
        let shutdown = Shutdown::new();
        assert!(!on_interrupt(&shutdown, 1));
        assert!(shutdown.token().is_cancelled());
        assert_eq!(shutdown.reason(), Some(AbortReason::Interrupted));
        assert!(on_interrupt(&shutdown, 2));
    }

    #[test]
    fn test_exit_code_for_config_errors() {
        let err: anyhow::Error = MonociError::Configuration("bad".into()).into();
        assert_eq!(exit_code_for(&err), 2);
        let err = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&err), EXIT_FAILURE);
    }

    #[tokio::test]
    async fn test_run_without_packages_exits_2() {
        let dir = tempfile::tempdir().unwrap();
        let err = cmd_run(dir.path(), RunArgs::default()).await.unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
    }

    #[tokio::test]
    async fn test_invalid_tier_exits_2() {
        let dir = tempfile::tempdir().unwrap();
        write_npm_package(&dir.path().join("web"), "web");
        let args = RunArgs {
            tier: Some("nightly".into()),
            ..Default::default()
        };
        let err = cmd_run(dir.path(), args).await.unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
    }

    #[tokio::test]
    async fn test_dry_run_executes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_npm_package(&dir.path().join("web"), "web");
        write_npm_package(&dir.path().join("api"), "api");
        let args = RunArgs {
            dry_run: true,
            ..Default::default()
        };
        assert_eq!(cmd_run(dir.path(), args).await.unwrap(), EXIT_SUCCESS);
        assert!(!dir.path().join("reports").exists());
    }

    #[tokio::test]
    async fn test_filter_to_nothing_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        write_npm_package(&dir.path().join("web"), "web");
        let args = RunArgs {
            include: vec!["nomatch".into()],
            ..Default::default()
        };
        assert_eq!(cmd_run(dir.path(), args).await.unwrap(), EXIT_SUCCESS);
    }

    #[test]
    fn test_detect_unknown_ecosystem() {
        let dir = tempfile::tempdir().unwrap();
        write_npm_package(&dir.path().join("web"), "web");
        let err = cmd_detect(dir.path(), Some("maven"), OutputFormat::List).unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
        assert_eq!(
            cmd_detect(dir.path(), Some("npm"), OutputFormat::Json).unwrap(),
            EXIT_SUCCESS
        );
    }
}
