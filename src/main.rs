//! envdeploy CLI entrypoint.
//!
//! This is the main entrypoint for the envdeploy command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use envdeploy::cli::{Cli, Commands, OutputFormatter, StateCommands};
use envdeploy::config::{find_config_file, ConfigParser, ConfigValidator, DeployConfig};
use envdeploy::error::{ConfigError, DeployError, Result};
use envdeploy::orchestrator::{
    DeployOptions, DeployReport, ExecuteOptions, ObservedResource, Orchestrator,
};
use envdeploy::planner::Planner;
use envdeploy::provider::ProviderRegistry;
use envdeploy::state::{LocalStateStore, StateStore};

use clap::Parser;
use tracing::{debug, info, info_span};
use tracing_subscriber::EnvFilter;

/// Selects the JSON log formatter when set to `json`.
const LOG_FORMAT_ENV: &str = "ENVDEPLOY_LOG_FORMAT";

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("InternalError: failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence unless `--verbose` is given.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let globals = Globals {
        config: cli.config,
        state_dir: cli.state_dir,
    };

    match cli.command {
        Commands::Deploy {
            environment,
            version,
            force,
            parallel,
            timeout,
            no_rollback,
            no_backup,
        } => {
            let args = DeployArgs {
                version,
                force,
                parallel,
                timeout,
                no_rollback,
                no_backup,
            };
            cmd_deploy(&globals, &environment, args, &formatter).await
        }
        Commands::Plan { environment } => cmd_plan(&globals, &environment, &formatter).await,
        Commands::Status {
            environment,
            refresh,
        } => cmd_status(&globals, environment.as_deref(), refresh, &formatter).await,
        Commands::Validate { environment } => {
            cmd_validate(&globals, environment.as_deref(), &formatter).await
        }
        Commands::List => cmd_list(&globals, &formatter),
        Commands::State { command } => cmd_state(&globals, command, &formatter).await,
    }
}

/// Global options shared by every command.
struct Globals {
    config: Option<PathBuf>,
    state_dir: Option<PathBuf>,
}

/// Options of the deploy command.
struct DeployArgs {
    version: Option<String>,
    force: bool,
    parallel: Option<usize>,
    timeout: Option<Duration>,
    no_rollback: bool,
    no_backup: bool,
}

/// Loaded configuration with its state store and providers.
struct Context {
    config: DeployConfig,
    store: LocalStateStore,
    registry: ProviderRegistry,
}

/// Plan, confirm and apply.
async fn cmd_deploy(
    globals: &Globals,
    name: &str,
    args: DeployArgs,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ctx = open(globals)?;
    let outcome = deploy(&ctx, name, args, formatter).await;
    shutdown(&ctx.registry).await;

    let Some(report) = outcome? else {
        return Ok(());
    };
    emit(&formatter.format_report(&report))?;

    match &report.failure {
        Some(failure) if !report.succeeded() => Err(failure.to_provider_error().into()),
        _ => Ok(()),
    }
}

/// Returns `None` when there is nothing to do or the operator declined.
async fn deploy(
    ctx: &Context,
    name: &str,
    args: DeployArgs,
    formatter: &OutputFormatter,
) -> Result<Option<DeployReport>> {
    let environment = ctx.config.environment(name)?;
    let orchestrator = Orchestrator::new(&ctx.store, &ctx.registry)
        .with_span(info_span!("envdeploy", command = "deploy", environment = name));

    let plan = orchestrator.plan(name, &environment.resources).await?;
    emit(&formatter.format_plan(&plan))?;

    if plan.is_empty() {
        return Ok(None);
    }

    if !args.force && !confirm(&format!("Deploy these changes to '{name}'?"))? {
        eprintln!("Deploy cancelled.");
        return Ok(None);
    }

    let defaults = &ctx.config.defaults;
    let mut execute =
        ExecuteOptions::default().with_parallelism(args.parallel.unwrap_or(defaults.parallel));
    if let Some(timeout) = args
        .timeout
        .or_else(|| defaults.timeout_secs.map(Duration::from_secs))
    {
        execute = execute.with_timeout(timeout);
    }
    if let Some(version) = args.version {
        execute = execute.with_version(version);
    }

    let options = DeployOptions::default()
        .with_execute(execute)
        .with_auto_rollback(!args.no_rollback)
        .with_backup(defaults.backup && !args.no_backup);

    orchestrator.apply(plan.confirm(), &options).await.map(Some)
}

/// Show the plan for an environment.
async fn cmd_plan(globals: &Globals, name: &str, formatter: &OutputFormatter) -> Result<()> {
    let ctx = open(globals)?;
    let environment = ctx.config.environment(name)?;
    let orchestrator = Orchestrator::new(&ctx.store, &ctx.registry)
        .with_span(info_span!("envdeploy", command = "plan", environment = name));

    let plan = orchestrator.plan(name, &environment.resources).await;
    shutdown(&ctx.registry).await;

    emit(&formatter.format_plan(&plan?))
}

/// Show recorded state.
async fn cmd_status(
    globals: &Globals,
    name: Option<&str>,
    refresh: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ctx = open(globals)?;
    let orchestrator = Orchestrator::new(&ctx.store, &ctx.registry);

    if refresh {
        let names = match name {
            Some(name) => vec![name.to_string()],
            None => ctx.store.list_environments().await?,
        };
        let observed = observe(&orchestrator, &names).await;
        shutdown(&ctx.registry).await;
        for (name, resources) in names.iter().zip(observed?) {
            emit(&formatter.format_observed(name, &resources))?;
        }
        return Ok(());
    }

    if let Some(name) = name {
        let state = orchestrator.status(name).await?;
        return emit(&formatter.format_state(&state));
    }

    let mut states = Vec::new();
    for name in ctx.store.list_environments().await? {
        states.push(orchestrator.status(&name).await?);
    }
    emit(&formatter.format_states(&states))
}

/// Observes each environment in turn.
async fn observe(orchestrator: &Orchestrator<'_>, names: &[String]) -> Result<Vec<Vec<ObservedResource>>> {
    let mut observed = Vec::with_capacity(names.len());
    for name in names {
        observed.push(orchestrator.observe(name).await?);
    }
    Ok(observed)
}

/// Validate configuration, dependency graphs and provider schemas.
async fn cmd_validate(globals: &Globals, name: Option<&str>, formatter: &OutputFormatter) -> Result<()> {
    let (parser, config) = load_config(globals)?;

    let result = ConfigValidator::new().check(&config, name);
    emit(&formatter.format_validation(&result))?;
    if let Some(first) = result.errors.first() {
        return Err(ConfigError::validation(first.message.clone(), first.field.clone()).into());
    }

    let ctx = build_context(globals, &parser, config)?;
    let names: Vec<String> = name.map_or_else(
        || ctx.config.environment_names().into_iter().map(String::from).collect(),
        |name| vec![name.to_string()],
    );

    let checked = validate_environments(&ctx, &names).await;
    shutdown(&ctx.registry).await;

    checked
}

/// Checks dependency graphs and provider schemas without touching state.
async fn validate_environments(ctx: &Context, names: &[String]) -> Result<()> {
    let planner = Planner::new();
    for name in names {
        let environment = ctx.config.environment(name)?;
        planner.validate(name, &environment.resources, &ctx.registry).await?;
        info!(environment = %name, resources = environment.resources.len(), "Environment is valid");
    }
    Ok(())
}

/// List configured environments.
fn cmd_list(globals: &Globals, formatter: &OutputFormatter) -> Result<()> {
    let (_, config) = load_config(globals)?;
    ConfigValidator::new().validate(&config)?;
    emit(&formatter.format_environments(&config))
}

/// State management commands.
async fn cmd_state(globals: &Globals, command: StateCommands, formatter: &OutputFormatter) -> Result<()> {
    let ctx = open(globals)?;

    match command {
        StateCommands::Show { environment } => {
            let state = ctx.store.load(&environment).await?;
            emit(&formatter.format_state(&state))
        }
        StateCommands::Unlock { environment, force } => {
            let Some(lock) = ctx.store.lock_info(&environment).await? else {
                return emit(&formatter.format_unlock(&environment, None));
            };

            let stale = lock.is_stale(stale_after(&ctx.config));
            if !force && !stale {
                return Err(DeployError::LockConflict {
                    environment,
                    holder: lock.holder,
                    process: lock.process,
                    since: lock.time.to_rfc3339(),
                    stale,
                });
            }

            let released = ctx.store.force_unlock(&environment).await?;
            emit(&formatter.format_unlock(&environment, released.as_ref()))
        }
        StateCommands::Backup { environment, dest } => {
            let path = ctx.store.backup(&environment, dest.as_deref()).await?;
            emit(&formatter.format_backup(&environment, &path))
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads the configuration file and `.env` next to it.
fn load_config(globals: &Globals) -> Result<(ConfigParser, DeployConfig)> {
    let config_file = resolve_config_path(globals.config.as_ref())?;
    debug!("Loading configuration from: {}", config_file.display());

    let base_dir = config_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let parser = ConfigParser::new().with_base_path(base_dir);
    let config = parser.load_with_env(&config_file)?;

    Ok((parser, config))
}

/// Loads and validates the configuration, then opens state and providers.
fn open(globals: &Globals) -> Result<Context> {
    let (parser, config) = load_config(globals)?;
    ConfigValidator::new().validate(&config)?;
    build_context(globals, &parser, config)
}

fn build_context(globals: &Globals, parser: &ConfigParser, config: DeployConfig) -> Result<Context> {
    let state_dir = globals
        .state_dir
        .clone()
        .unwrap_or_else(|| parser.state_dir(&config));
    let base_dir = parser.base_path().unwrap_or_else(|| Path::new("."));

    let store = LocalStateStore::with_base_dir(state_dir.clone()).with_stale_after(stale_after(&config));
    let registry = ProviderRegistry::from_config(&config.providers, base_dir, &state_dir)?;
    debug!(state_dir = %state_dir.display(), providers = ?registry.names(), "Opened context");

    Ok(Context {
        config,
        store,
        registry,
    })
}

fn stale_after(config: &DeployConfig) -> chrono::Duration {
    let secs = i64::try_from(config.state.lock_stale_after_secs)
        .unwrap_or(i64::MAX)
        .min(i64::from(u32::MAX));
    chrono::Duration::seconds(secs)
}

/// Shuts providers down, logging failures.
async fn shutdown(registry: &ProviderRegistry) {
    if let Err(e) = registry.shutdown_all().await {
        tracing::warn!(error = %e, "Provider shutdown failed");
    }
}

/// Asks for confirmation on stderr.
fn confirm(question: &str) -> Result<bool> {
    eprint!("{question} [y/N]: ");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case("y") || input.trim().eq_ignore_ascii_case("yes"))
}

/// Writes command output to stdout.
fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use envdeploy::cli::OutputFormat;

    #[test]
    fn test_output_format_is_global() {
        let cli = Cli::try_parse_from(["envdeploy", "list", "--output", "yaml"]).expect("parse");
        assert_eq!(cli.output, OutputFormat::Yaml);
    }
}
