//! Converge CLI entrypoint.
//!
//! This is the main entrypoint for the converge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use converge::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use converge::config::{
    ConfigParser, ConfigValidator, ConvergeConfig, ProviderBackend, StateBackend, find_config_file,
};
use converge::error::{ConvergeError, Result};
use converge::graph::{ResourceGraph, ResourceId};
use converge::planner::CancellationSignal;
use converge::provider::{ProviderRegistry, ProviderSettings, SandboxCloud};
use converge::reconciler::Reconciler;
use converge::state::{STATE_DIR, StateRecord, StateStore, open_store};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            if e.is_validation() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

/// Initializes the logging system on stderr, leaving stdout for command output.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

/// Writes command output to stdout.
#[allow(clippy::print_stdout)]
fn emit(text: &str) {
    print!("{text}");
    if !text.ends_with('\n') {
        println!();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let cancel = CancellationSignal::new();
    watch_interrupt(cancel.clone());

    let ctx = RunContext {
        config_path: cli.config,
        concurrency: cli.concurrency,
        dry_run: cli.dry_run,
        cancel,
        formatter,
    };

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| ExitCode::SUCCESS),
        Commands::Validate { warnings } => cmd_validate(&ctx, warnings).map(|()| ExitCode::SUCCESS),
        Commands::Plan { detailed, refresh } => cmd_plan(&ctx, detailed, refresh).await,
        Commands::Apply {
            yes,
            refresh,
            fail_fast,
        } => cmd_apply(&ctx, yes, refresh, fail_fast).await,
        Commands::Destroy { yes } => cmd_destroy(&ctx, yes).await,
        Commands::Drift => cmd_drift(&ctx).await,
        Commands::State { command } => cmd_state(&ctx, command).await.map(|()| ExitCode::SUCCESS),
    }
}

/// Settings shared by every command.
struct RunContext {
    config_path: Option<PathBuf>,
    concurrency: Option<usize>,
    dry_run: bool,
    cancel: CancellationSignal,
    formatter: OutputFormatter,
}

/// Raises the cancellation signal on Ctrl-C; in-flight calls finish.
fn watch_interrupt(cancel: CancellationSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight actions");
            cancel.cancel();
        }
    });
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new converge project in: {}", path.display());

    let config_path = path.join("converge.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/converge.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let has_env = existing.lines().any(|l| l.trim() == ".env");
        let has_state = existing.contains(STATE_DIR);
        if !has_env || !has_state {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# converge")?;
            if !has_env {
                writeln!(file, ".env")?;
            }
            if !has_state {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized.");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and fill in your settings");
    eprintln!("  2. Edit converge.yaml to describe your cluster");
    eprintln!("  3. Run 'converge validate' to check the configuration");
    eprintln!("  4. Run 'converge plan' to see what will change");
    eprintln!("  5. Run 'converge apply' to converge the backend");

    Ok(())
}

/// Validate configuration and the resource graph.
fn cmd_validate(ctx: &RunContext, show_warnings: bool) -> Result<()> {
    let (config_file, config) = load_config(ctx)?;
    info!("Validating configuration: {}", config_file.display());

    let result = ConfigValidator::new().validate(&config)?;
    let graph = config.to_graph()?;

    eprintln!("Configuration is valid.");
    if show_warnings && !result.warnings.is_empty() {
        eprintln!("\nWarnings:");
        for warning in &result.warnings {
            eprintln!("  - {warning}");
        }
    } else if result.warning_count() > 0 {
        eprintln!("{} warning(s), use --warnings to show them", result.warning_count());
    }

    eprintln!("\nConfiguration summary:");
    eprintln!("  Project: {}", config.qualified_name());
    eprintln!("  Provider: {:?}", config.provider.backend);
    eprintln!("  State: {:?}", config.state.backend);
    eprintln!("  Resources: {}", graph.len());

    Ok(())
}

/// Show the plan.
async fn cmd_plan(ctx: &RunContext, detailed: bool, refresh: bool) -> Result<ExitCode> {
    let (_, config) = load_config(ctx)?;
    let graph = config.to_graph()?;
    let reconciler = build_reconciler(ctx, &config, false).await?.with_refresh(refresh);

    let plan = reconciler.dry_run(&graph).await?;
    emit(&ctx.formatter.format_plan(&plan, detailed));
    Ok(ExitCode::SUCCESS)
}

/// Apply the plan.
async fn cmd_apply(ctx: &RunContext, auto_approve: bool, refresh: bool, fail_fast: bool) -> Result<ExitCode> {
    let (_, config) = load_config(ctx)?;
    let mut graph = config.to_graph()?;
    let reconciler = build_reconciler(ctx, &config, fail_fast).await?.with_refresh(refresh);

    let plan = reconciler.plan(&graph).await?;
    emit(&ctx.formatter.format_plan(&plan, false));

    if ctx.dry_run {
        eprintln!("Dry run: no changes applied.");
        return Ok(ExitCode::SUCCESS);
    }
    if !plan.has_changes() {
        return Ok(ExitCode::SUCCESS);
    }

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", |s| s.eq_ignore_ascii_case("y"))? {
        eprintln!("Apply cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let result = reconciler.apply(plan, &mut graph).await?;
    emit(&ctx.formatter.format_run(&result));

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Destroy every recorded resource.
async fn cmd_destroy(ctx: &RunContext, auto_approve: bool) -> Result<ExitCode> {
    let (_, config) = load_config(ctx)?;
    let reconciler = build_reconciler(ctx, &config, false).await?;

    let plan = reconciler.plan_destroy().await?;
    if plan.is_empty() {
        eprintln!("No recorded resources to destroy.");
        return Ok(ExitCode::SUCCESS);
    }
    emit(&ctx.formatter.format_plan(&plan, false));

    if ctx.dry_run {
        eprintln!("Dry run: nothing destroyed.");
        return Ok(ExitCode::SUCCESS);
    }

    if !auto_approve
        && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", |s| s == "destroy")?
    {
        eprintln!("Destruction cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let result = reconciler.apply(plan, &mut ResourceGraph::new()).await?;
    emit(&ctx.formatter.format_run(&result));

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Check for drift.
async fn cmd_drift(ctx: &RunContext) -> Result<ExitCode> {
    let (_, config) = load_config(ctx)?;
    let reconciler = build_reconciler(ctx, &config, false).await?;

    let report = reconciler.check_drift().await?;
    emit(&ctx.formatter.format_drift(&report));

    Ok(if report.is_converged() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// State management commands.
async fn cmd_state(ctx: &RunContext, command: StateCommands) -> Result<()> {
    let (config_file, config) = load_config(ctx)?;
    let store = build_store(&config, &config_file).await?;

    match command {
        StateCommands::List => {
            let snapshot = store.snapshot().await?;
            emit(&ctx.formatter.format_records(&snapshot));
        }
        StateCommands::Show { resource } => {
            let record = find_record(store.as_ref(), &resource).await?;
            emit(&ctx.formatter.format_record(&record));
        }
        StateCommands::Unlock { lock_id, force } => {
            let current = store.get_lock_info().await?;
            emit(&ctx.formatter.format_lock(current.as_ref()));
            if force {
                store.force_unlock().await?;
                eprintln!("State forcefully unlocked.");
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else if current.is_some() {
                eprintln!("Provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Prompts on stderr and checks the answer.
fn confirm(prompt: &str, accept: impl Fn(&str) -> bool) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(accept(input.trim()))
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Loads `.env`, then the configuration with environment overrides and
/// command-line overrides applied.
fn load_config(ctx: &RunContext) -> Result<(PathBuf, ConvergeConfig)> {
    let config_file = resolve_config_path(ctx.config_path.as_ref())?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;

    let mut config = parser.load_with_env(&config_file)?;
    if let Some(concurrency) = ctx.concurrency {
        debug!("Overriding execution.concurrency from command line");
        config.execution.concurrency = concurrency;
    }

    ConfigValidator::new().validate(&config)?;
    Ok((config_file, config))
}

/// Opens the configured state store, resolving a local path against the
/// configuration directory.
async fn build_store(config: &ConvergeConfig, config_file: &Path) -> Result<Arc<dyn StateStore>> {
    let mut state = config.state.clone();
    if state.backend == StateBackend::Local {
        let base = config_dir(config_file);
        let path = state
            .path
            .as_deref()
            .map_or_else(|| base.join(STATE_DIR), |p| base.join(p));
        state.path = Some(path.display().to_string());
    }
    let store = open_store(&state).await?;
    debug!("Using {} state backend", store.backend_type());
    Ok(Arc::from(store))
}

/// Builds the adapter registry for the configured provider backend.
fn build_registry(config: &ConvergeConfig) -> Result<ProviderRegistry> {
    match config.provider.backend {
        ProviderBackend::Sandbox => {
            warn!("Using the in-process sandbox backend; no real resources are touched");
            let settings = ProviderSettings::from_config(&config.provider, None);
            Ok(ProviderRegistry::sandbox(&Arc::new(SandboxCloud::new(settings))))
        }
        ProviderBackend::Http => {
            let token = ConfigParser::get_api_token().ok();
            if token.is_none() {
                debug!("No API token set, calling the resource API without authentication");
            }
            ProviderRegistry::http(&ProviderSettings::from_config(&config.provider, token))
        }
    }
}

async fn build_reconciler(ctx: &RunContext, config: &ConvergeConfig, fail_fast: bool) -> Result<Reconciler> {
    let config_file = resolve_config_path(ctx.config_path.as_ref())?;
    let store = build_store(config, &config_file).await?;
    let registry = build_registry(config)?;

    let mut execution = config.execution.clone();
    execution.fail_fast |= fail_fast;

    Ok(Reconciler::new(registry, store, execution).with_cancellation(ctx.cancel.clone()))
}

/// Looks a record up by `<kind>/<name>` or by bare logical name.
async fn find_record(store: &dyn StateStore, resource: &str) -> Result<StateRecord> {
    let found = match resource.parse::<ResourceId>() {
        Ok(id) => store.load(&id).await?,
        Err(_) => store.snapshot().await?.find_by_name(resource).cloned(),
    };
    found.ok_or_else(|| ConvergeError::internal(format!("No record for '{resource}'")))
}
