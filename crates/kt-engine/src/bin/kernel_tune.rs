use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kt_data::{GitHistory, PathMatch, RunLedger};
use kt_engine::{
    install_interrupt_restore, plan_run, run_change_driven, RunReport, SessionManager, TuneConfig,
};
use kt_optimizer::StrategyKind;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kernel-tune", about = "Shared-build compiler flag tuning for a kernel library")]
struct Cli {
    /// JSON configuration file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root of the kernel library checkout.
    #[arg(long)]
    kernel_root: Option<PathBuf>,

    /// Directory for per-kernel databases, logs and results.
    #[arg(long)]
    database: Option<PathBuf>,

    #[arg(long)]
    log_root: Option<PathBuf>,

    #[arg(long)]
    policy: Option<PathBuf>,

    /// Tuning rounds after the baseline round.
    #[arg(long)]
    max_rounds: Option<usize>,

    /// Wall-clock budget in seconds; 0 disables it.
    #[arg(long)]
    time_budget: Option<u64>,

    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    #[arg(long)]
    seed: Option<u64>,

    /// Run `ninja install` after each build.
    #[arg(long, default_value_t = false)]
    install: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Debug)]
enum StrategyArg {
    Random,
    Guided,
}

#[derive(ValueEnum, Clone, Debug)]
enum MatchArg {
    Suffix,
    FileName,
}

impl From<MatchArg> for PathMatch {
    fn from(value: MatchArg) -> PathMatch {
        match value {
            MatchArg::Suffix => PathMatch::Suffix,
            MatchArg::FileName => PathMatch::FileName,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tune the given kernels together.
    Tune {
        #[arg(long = "kernel", value_delimiter = ',', required = true)]
        kernels: Vec<String>,
    },
    /// Show which kernels changed since the last run, without tuning.
    Select {
        #[arg(long)]
        min_batch: Option<usize>,
        #[arg(long, value_enum)]
        match_mode: Option<MatchArg>,
    },
    /// Select changed kernels, tune them and record the run.
    Auto {
        #[arg(long)]
        min_batch: Option<usize>,
        #[arg(long, value_enum)]
        match_mode: Option<MatchArg>,
    },
    /// List the kernels the test runner knows about.
    List,
}

fn load_config(cli: &Cli) -> Result<TuneConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            TuneConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => TuneConfig::default(),
    };
    if let Some(root) = &cli.kernel_root {
        config.kernel_root = root.clone();
    }
    if let Some(database) = &cli.database {
        config = config.with_database_root(database);
    }
    if let Some(log_root) = &cli.log_root {
        config = config.with_log_root(log_root);
    }
    if let Some(policy) = &cli.policy {
        config = config.with_policy_path(policy);
    }
    if let Some(rounds) = cli.max_rounds {
        config = config.with_max_rounds(rounds);
    }
    if let Some(secs) = cli.time_budget {
        config.time_budget_secs = (secs > 0).then_some(secs);
    }
    if let Some(strategy) = &cli.strategy {
        config = config.with_strategy(match strategy {
            StrategyArg::Random => StrategyKind::Random,
            StrategyArg::Guided => StrategyKind::default(),
        });
    }
    if let Some(seed) = cli.seed {
        config = config.with_seed(seed);
        config.selection.seed = seed;
    }
    if cli.install {
        config = config.with_install(true);
    }
    match &cli.command {
        Command::Select { min_batch, match_mode } | Command::Auto { min_batch, match_mode } => {
            if let Some(n) = min_batch {
                config.selection.min_batch_size = *n;
            }
            if let Some(mode) = match_mode {
                config.selection.match_mode = mode.clone().into();
            }
        }
        _ => {}
    }
    config.validate()?;
    Ok(config)
}

fn print_report(report: &RunReport) {
    for (kernel, summary) in &report.outcomes {
        println!(
            "{kernel}: {:?}, best {} cycles, settings {}",
            summary.verdict,
            summary.best_cost,
            summary.final_settings.join(",")
        );
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let manager = SessionManager::from_config(&config)?;

    match cli.command {
        Command::List => {
            for kernel in manager.runner().list()? {
                println!("{kernel}");
            }
        }
        Command::Select { .. } => {
            let ledger = RunLedger::new(&config.log_root)?;
            let history = GitHistory::new(&config.kernel_root);
            let plan = plan_run(&config, history, manager.runner().as_ref(), &ledger)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Command::Tune { kernels } => {
            install_interrupt_restore(manager.store().clone())?;
            let report = manager.spawn(&kernels)?;
            print_report(&report);
        }
        Command::Auto { .. } => {
            install_interrupt_restore(manager.store().clone())?;
            let ledger = RunLedger::new(&config.log_root)?;
            let history = GitHistory::new(&config.kernel_root);
            let run = run_change_driven(&config, history, &manager, &ledger)?;
            info!(run = %run.run.path().display(), "run recorded");
            print_report(&run.report);
        }
    }
    Ok(())
}
