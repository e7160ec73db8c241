//! Command-line entry point (§10.6).
//!
//! Dispatches to the library entry points in [`refactor_bot`], initializes
//! tracing, and is the only place in this crate allowed to call
//! `std::process::exit` or print directly to stdout/stderr for a human
//! reader — library code returns typed results and never prints.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use refactor_bot::backup::BackupManager;
use refactor_bot::config::{Config, HomeDirs};
use refactor_bot::executor::{accept_run, Executor, RunOptions};
use refactor_bot::indexer::{DependencyAnalyzer, SymbolExtractor};
use refactor_bot::planner::Planner;
use refactor_bot::security::format_security_report;
use refactor_bot::util::format_duration;
use refactor_bot::verifier::Verifier;

#[derive(Parser, Debug)]
#[command(author, version, about = "Drives an external coding agent through reversible refactoring batches", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a full refactoring pass against a repository.
    Run(RunArgs),
    /// Generate (and optionally persist) a refactoring plan without running it.
    Plan(PlanArgs),
    /// Run the configured verification commands against a repository.
    Verify(VerifyArgs),
    /// Restore a repository from a prior run's backup.
    Rollback(RollbackArgs),
    /// List available backups, optionally filtered by repository name.
    ListBackups(ListBackupsArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the repository to refactor.
    path: PathBuf,
    /// Path to a config file, overriding the repo's `.refactor-bot.config.json`.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Skip the pre-run backup.
    #[arg(long)]
    skip_backup: bool,
    /// Plan and report, but never apply or verify a patch.
    #[arg(long)]
    dry_run: bool,
    /// Cap the number of batches run, overriding the config.
    #[arg(long)]
    max_batches: Option<u32>,
    /// Skip the post-run security review.
    #[arg(long)]
    skip_security: bool,
}

#[derive(Args, Debug)]
struct PlanArgs {
    /// Path to the repository to plan against.
    path: PathBuf,
    /// Write the generated plan to this file in addition to printing a summary.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Print dependency hotspots and indexing stats alongside the plan.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Path to the repository to verify.
    path: PathBuf,
    /// Run the full (collect-all) suite instead of the fast (fail-fast) one.
    #[arg(long)]
    full: bool,
}

#[derive(Args, Debug)]
struct RollbackArgs {
    /// The run id to restore from, as printed in the run's report.
    run_id: String,
    /// Restore from the tree archive instead of the git bundle.
    #[arg(long)]
    archive: bool,
}

#[derive(Args, Debug)]
struct ListBackupsArgs {
    /// Only list backups for this repository name.
    #[arg(long)]
    repo: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run(args) => run_command(args),
        Commands::Plan(args) => plan_command(args),
        Commands::Verify(args) => verify_command(args),
        Commands::Rollback(args) => rollback_command(args),
        Commands::ListBackups(args) => list_backups_command(args),
    }
}

fn load_config(repo_path: &std::path::Path, config_override: &Option<PathBuf>) -> Result<Config> {
    let config = match config_override {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => Config::load_or_create(repo_path)
            .context("loading repository config")?
            .detect_verifiers(repo_path),
    };
    config.validate().context("validating configuration")?;
    Ok(config)
}

fn run_command(args: RunArgs) -> Result<i32> {
    let config = load_config(&args.path, &args.config)?;
    let home = HomeDirs::discover();
    let options = RunOptions {
        skip_backup: args.skip_backup,
        dry_run: args.dry_run,
        max_batches: args.max_batches,
        skip_security: args.skip_security,
    };

    let executor = Executor::new(config, home);
    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    let outcome = runtime.block_on(executor.run(&args.path, options));

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            let structured = e.to_structured();
            eprintln!("run failed: {structured}");
            if let Some(hint) = e.recovery_suggestion() {
                eprintln!("  hint: {hint}");
            }
            return Ok(1);
        }
    };

    print_report_summary(&outcome.report);

    if let Some(security) = &outcome.report.security {
        println!();
        println!("{}", format_security_report(security));
    }

    if args.dry_run {
        println!("\ndry run: nothing was applied, merged, or cleaned up.");
        return Ok(0);
    }

    let Some(workspace) = outcome.workspace else {
        return Ok(0);
    };

    let blocked = outcome
        .report
        .security
        .as_ref()
        .map(|s| s.has_blocking_issues(true))
        .unwrap_or(false);

    if blocked {
        println!(
            "\nsecurity review found blocking issues; the safety branch at {} was left \
             unmerged. Inspect the findings above, then merge manually if appropriate.",
            outcome.report.worktree_path
        );
        return Ok(0);
    }

    match accept_run(workspace) {
        Ok(_) => println!("\nmerged the safety branch back and cleaned up the workspace."),
        Err(e) => eprintln!("\nwarning: failed to merge the safety branch back: {e}"),
    }

    Ok(0)
}

fn print_report_summary(report: &refactor_bot::executor::ExecutionReport) {
    println!("run {} on {} ({})", report.run_id, report.repo_name, format_duration(report.duration_s));
    println!(
        "batches: {} total, {} completed, {} failed, {} skipped, {} noop",
        report.batches.total, report.batches.completed, report.batches.failed, report.batches.skipped, report.batches.noop
    );
    println!(
        "changes: +{} -{} across {} file(s)",
        report.changes.lines_added,
        report.changes.lines_removed,
        report.changes.files_touched.len()
    );
    if let Some(backup) = &report.backup_path {
        println!("backup: {backup}");
    }
    if let Some(commit) = &report.final_commit {
        println!("final commit: {commit}");
    }
}

fn plan_command(args: PlanArgs) -> Result<i32> {
    let config = load_config(&args.path, &None)?;

    let mut symbols = SymbolExtractor::new(&args.path, &config.scope_excludes).context("indexing symbols")?;
    symbols.index_files().context("indexing symbols")?;
    let deps = DependencyAnalyzer::new(&args.path, &config.scope_excludes)
        .context("analyzing dependencies")?
        .analyze()
        .context("analyzing dependencies")?;

    let mut planner = Planner::new(&args.path, &config, Some(&symbols), Some(&deps));
    let plan = planner.generate_naive_plan();

    println!("generated {} batch(es) for {}", plan.batches.len(), args.path.display());
    for batch in &plan.batches {
        println!("  [{}] {} ({:?})", batch.id, batch.goal, batch.verifier_level);
    }

    if args.verbose {
        println!("\nindex: {} file(s), {} symbol(s)", symbols.files().len(), symbols.symbols().len());
        println!("dependency graph: {} node(s), {} import(s)", deps.node_count(), deps.import_count());
        let hotspots = deps.hotspots(3);
        if hotspots.is_empty() {
            println!("no hotspots (nothing with fan-in >= 3)");
        } else {
            println!("hotspots (fan-in >= 3):");
            for node in hotspots.iter().take(10) {
                println!("  {} (fan_in={}, fan_out={})", node.path, node.fan_in, node.fan_out);
            }
        }
    }

    if let Some(output) = &args.output {
        plan.save(output).with_context(|| format!("writing plan to {}", output.display()))?;
        println!("\nplan written to {}", output.display());
    }

    Ok(0)
}

fn verify_command(args: VerifyArgs) -> Result<i32> {
    let config = load_config(&args.path, &None)?;
    let verifier = Verifier::new(&args.path, &config);

    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    let result = if args.full {
        runtime.block_on(verifier.run_full())
    } else {
        runtime.block_on(verifier.run_fast())
    };

    for command in &result.commands {
        println!("{}", command.summary());
    }
    println!("{}", result.summary());

    Ok(if result.passed() { 0 } else { 1 })
}

fn rollback_command(args: RollbackArgs) -> Result<i32> {
    let home = HomeDirs::discover();
    match refactor_bot::backup::rollback(&home.backups, &args.run_id, !args.archive) {
        Ok(restored_to) => {
            println!("restored run {} to {}", args.run_id, restored_to.display());
            Ok(0)
        }
        Err(e) => {
            eprintln!("rollback failed: {e}");
            Ok(1)
        }
    }
}

fn list_backups_command(args: ListBackupsArgs) -> Result<i32> {
    let home = HomeDirs::discover();
    let backups = BackupManager::list_backups(&home.backups, args.repo.as_deref());
    if backups.is_empty() {
        println!("no backups found");
        return Ok(0);
    }
    for backup in &backups {
        println!("{backup}\n");
    }
    Ok(0)
}
