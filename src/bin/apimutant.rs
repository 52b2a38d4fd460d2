use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use apimutant::mutation::{
    MutationConfig, MutationStatus, ReportFormat, RunSnapshot, discover_mutants, filter_mutants,
    interrupt_flag, latest_incomplete_run, load_run_status, render_run_report, resume_run,
    run_new, summarize,
};

#[derive(Debug, Parser)]
#[command(name = "apimutant")]
#[command(about = "Mutation testing for REST API test suites")]
struct Cli {
    /// YAML or JSON config file; flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// OpenAPI document.
    #[arg(long)]
    schema: Option<PathBuf>,
    /// Run root directory.
    #[arg(long)]
    run_root: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the mutant catalog for the schema.
    Mutants {
        #[command(flatten)]
        common: CommonArgs,
        /// Optional substring filter over mutant ids and labels.
        #[arg(long)]
        filter: Option<String>,
        /// Emit JSON output.
        #[arg(long)]
        json: bool,
    },
    /// Start a mutation run.
    Run {
        #[command(flatten)]
        common: CommonArgs,
        /// Optional substring filter over mutant ids and labels.
        #[arg(long)]
        filter: Option<String>,
        /// Per-mutant suite timeout in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Skip the unmutated baseline run.
        #[arg(long)]
        no_baseline: bool,
        /// Test command, after `--`.
        #[arg(last = true)]
        test_command: Vec<String>,
    },
    /// Resume an interrupted run (the latest compatible one if no id is given).
    ///
    /// Unset options fall back to the values recorded for the run.
    Resume {
        /// Existing run id.
        run_id: Option<String>,
        #[command(flatten)]
        common: CommonArgs,
        /// Per-mutant suite timeout in seconds; defaults to the recorded one.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Test command, after `--`; defaults to the one recorded for the run.
        #[arg(last = true)]
        test_command: Vec<String>,
    },
    /// Show status for run id.
    Status {
        /// Existing run id.
        run_id: String,
        /// Run root directory.
        #[arg(long)]
        run_root: Option<PathBuf>,
    },
    /// Render report for run id.
    Report {
        /// Existing run id.
        run_id: String,
        /// Output format.
        #[arg(long, value_enum, default_value = "md")]
        format: OutputFormat,
        /// Run root directory.
        #[arg(long)]
        run_root: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Markdown
    Md,
    /// JSON
    Json,
    /// JUnit XML
    Junit,
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_env("APIMUTANT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn base_config(path: Option<&PathBuf>) -> Result<MutationConfig> {
    match path {
        Some(path) => MutationConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(MutationConfig::default()),
    }
}

fn apply_common(mut config: MutationConfig, common: CommonArgs) -> MutationConfig {
    if let Some(schema) = common.schema {
        config = config.with_schema_path(schema);
    }
    if let Some(run_root) = common.run_root {
        config = config.with_run_root(run_root);
    }
    config
}

fn print_summary(snapshot: &RunSnapshot) {
    let report = summarize(&snapshot.results());
    let incomplete =
        snapshot.count(MutationStatus::Pending) + snapshot.count(MutationStatus::Running);
    let score = report
        .score
        .map(|s| format!("{:.2}%", s * 100.0))
        .unwrap_or_else(|| "N/A".to_string());
    println!(
        "summary: killed={}, survived={}, errored={}, incomplete={}, mutation_score={}",
        report.killed, report.survived, report.errored, incomplete, score
    );
    if !report.uncalled_endpoints.is_empty() {
        println!("uncalled endpoints: {}", report.uncalled_endpoints.join(", "));
    }
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = base_config(cli.config.as_ref())?;

    match cli.command {
        Command::Mutants {
            common,
            filter,
            json,
        } => {
            let config = apply_common(config, common);
            let filter = filter.or_else(|| config.filter.clone());
            let mutants = filter_mutants(discover_mutants(&config)?, filter.as_deref());
            if json {
                println!("{}", serde_json::to_string_pretty(&mutants)?);
            } else {
                for mutant in &mutants {
                    println!("{}\t{}", mutant.id, mutant.label());
                }
            }
        }
        Command::Run {
            common,
            filter,
            timeout_secs,
            no_baseline,
            test_command,
        } => {
            let mut config = apply_common(config, common);
            if let Some(filter) = filter {
                config = config.with_filter(filter);
            }
            if let Some(timeout_secs) = timeout_secs {
                config = config.with_timeout_secs(timeout_secs);
            }
            if no_baseline {
                config = config.with_baseline(false);
            }
            if !test_command.is_empty() {
                config = config.with_test_command(test_command);
            }

            let runner = config.command_runner()?.with_interrupt(interrupt_flag());
            let mutants = discover_mutants(&config)?;
            let run = run_new(&config, mutants, &runner)?;
            println!("run id: {}", run.run_id);
            println!("run dir: {}", run.run_dir.display());
            print_summary(&run.snapshot);
        }
        Command::Resume {
            run_id,
            common,
            timeout_secs,
            test_command,
        } => {
            let mut config = apply_common(config, common);
            if let Some(timeout_secs) = timeout_secs {
                config = config.with_timeout_secs(timeout_secs);
            }
            if !test_command.is_empty() {
                config = config.with_test_command(test_command);
            }

            let run_id = match run_id {
                Some(run_id) => run_id,
                None => match latest_incomplete_run(&config)? {
                    Some(run_id) => run_id,
                    None => bail!(
                        "no incomplete run under {} matches this configuration",
                        config.run_root.display()
                    ),
                },
            };
            if let Some(recorded) = load_run_status(&config, &run_id)?.info.config {
                if config.test_command.is_empty() {
                    config = config.with_test_command(recorded.test_command);
                }
                if config.timeout_secs.is_none() {
                    if let Some(timeout_secs) = recorded.timeout_secs {
                        config = config.with_timeout_secs(timeout_secs);
                    }
                }
            }

            let runner = config.command_runner()?.with_interrupt(interrupt_flag());
            let run = resume_run(&config, &run_id, &runner)?;
            println!("run id: {}", run.run_id);
            print_summary(&run.snapshot);
        }
        Command::Status { run_id, run_root } => {
            let mut config = config;
            if let Some(run_root) = run_root {
                config = config.with_run_root(run_root);
            }
            let snapshot = load_run_status(&config, &run_id)?;
            println!("run id: {}", snapshot.run_id);
            println!("completed: {}", snapshot.completed);
            println!("interrupted: {}", snapshot.interrupted);
            print_summary(&snapshot);
            for state in snapshot.mutants.values() {
                println!(
                    "{}\t{}\t{}",
                    state.mutant.id,
                    state.status.as_str(),
                    state.mutant.label()
                );
            }
        }
        Command::Report {
            run_id,
            format,
            run_root,
        } => {
            let mut config = config;
            if let Some(run_root) = run_root {
                config = config.with_run_root(run_root);
            }
            let format = match format {
                OutputFormat::Md => ReportFormat::Markdown,
                OutputFormat::Json => ReportFormat::Json,
                OutputFormat::Junit => ReportFormat::Junit,
            };
            println!("{}", render_run_report(&config, &run_id, format)?);
        }
    }

    Ok(())
}
