use std::env;
use std::fs;
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde_json::Value;

use mirrorbox::protocol::{Action, ActionRecord, ActionStatus, AssistantResponse, SandboxEvent};
use mirrorbox::sandbox::LocalProvider;
use mirrorbox::{ActionExecutor, ActionObserver, BatchReport, EngineConfig};

const APP_NAME: &str = "mirrorbox";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command {
        Command::Apply(cmd) => async_main(ctx, WorkspaceCommand::Apply(cmd)),
        Command::Run(cmd) => async_main(ctx, WorkspaceCommand::Run(cmd)),
        Command::Tree => async_main(ctx, WorkspaceCommand::Tree),
        Command::Summary(cmd) => async_main(ctx, WorkspaceCommand::Summary(cmd)),
        Command::Cat(cmd) => async_main(ctx, WorkspaceCommand::Cat(cmd)),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

/// Commands that need a booted sandbox.
enum WorkspaceCommand {
    Apply(ApplyCommand),
    Run(RunCommand),
    Tree,
    Summary(SummaryCommand),
    Cat(CatCommand),
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: WorkspaceCommand) -> Result<()> {
    let executor = ctx.executor()?;
    let result = match command {
        WorkspaceCommand::Apply(cmd) => handle_apply(&ctx, &executor, cmd).await,
        WorkspaceCommand::Run(cmd) => handle_run(&ctx, &executor, cmd).await,
        WorkspaceCommand::Tree => handle_tree(&ctx, &executor).await,
        WorkspaceCommand::Summary(cmd) => handle_summary(&ctx, &executor, cmd).await,
        WorkspaceCommand::Cat(cmd) => handle_cat(&executor, cmd).await,
    };

    if let Err(e) = executor.teardown().await {
        warn!("Teardown failed: {e}");
    }
    result
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Mirrorbox - sandboxed workspace mirror and assistant action executor.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Override the workspace root directory
    #[arg(long, value_name = "DIR", global = true)]
    root: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply an action list (or assistant response) to the workspace
    Apply(ApplyCommand),
    /// Run one shell command in the workspace
    Run(RunCommand),
    /// Print the mirrored file tree
    Tree,
    /// Print the project summary given to the assistant
    Summary(SummaryCommand),
    /// Print a file from the mirror
    Cat(CatCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ApplyCommand {
    /// JSON file with the actions; reads stdin when omitted
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct RunCommand {
    /// Shell command line
    #[arg(value_name = "COMMAND")]
    command: String,
    /// Working directory inside the workspace
    #[arg(long, value_name = "DIR")]
    cwd: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct SummaryCommand {
    /// Print the prompt context text instead of structured output
    #[arg(long)]
    context: bool,
}

#[derive(Debug, Clone, Args)]
struct CatCommand {
    /// Workspace path, e.g. /src/index.js
    #[arg(value_name = "PATH")]
    path: String,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: EngineConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_config(&paths)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = self.effective_log_level().as_str().to_ascii_lowercase();
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        let file_layer = match self.config.logging.file.as_deref() {
            Some(path) => {
                let path = expand_str_path(path)?;
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("creating log directory {}", parent.display()))?;
                }
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("opening log file {}", path.display()))?;
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
            }
            None => None,
        };

        // Use JSON output if --json flag is set, otherwise pretty format
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(io::stderr),
                )
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(!disable_color)
                        .with_writer(io::stderr),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::from_str(&self.config.logging.level).unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn workspace_root(&self) -> Result<PathBuf> {
        match &self.common.root {
            Some(root) => expand_path(root.clone()),
            None => self
                .config
                .sandbox
                .resolve_root(&self.paths.data_dir)
                .map_err(|e| anyhow!(e)),
        }
    }

    fn executor(&self) -> Result<ActionExecutor> {
        let root = self.workspace_root()?;
        debug!("workspace root: {}", root.display());
        let provider = LocalProvider::new(root, self.config.sandbox.clone());
        Ok(ActionExecutor::with_provider(Arc::new(provider), &self.config))
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }
}

// ============================================================================
// Workspace commands
// ============================================================================

/// Prints status transitions and streams command output.
struct CliObserver {
    json: bool,
}

impl ActionObserver for CliObserver {
    fn on_status(&mut self, record: &ActionRecord) {
        if self.json {
            match serde_json::to_string(record) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("serializing action record: {e}"),
            }
            return;
        }

        let label = record.status.label();
        match &record.message {
            Some(message) if record.status.is_terminal() => {
                println!("[{label}] {} {}: {message}", record.kind(), record.target())
            }
            _ => println!("[{label}] {} {}", record.kind(), record.target()),
        }
    }

    fn on_output(&mut self, chunk: &str) {
        if self.json {
            return;
        }
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(chunk.as_bytes());
        let _ = stdout.flush();
    }
}

async fn handle_apply(
    ctx: &RuntimeContext,
    executor: &ActionExecutor,
    cmd: ApplyCommand,
) -> Result<()> {
    let raw = match &cmd.file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("reading actions from {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("reading actions from stdin")?;
            buffer
        }
    };
    let value: Value = serde_json::from_str(&raw).context("parsing actions as JSON")?;
    let response = AssistantResponse::from_value(value).context("reading assistant response")?;
    if !response.reply.is_empty() && !ctx.common.json {
        println!("{}", response.reply);
    }

    let mut observer = CliObserver {
        json: ctx.common.json,
    };
    let report = {
        let batch = executor.apply_values(&response.actions, &mut observer);
        run_interruptible(executor, batch).await?
    };
    finish_batch(report)
}

async fn handle_run(
    ctx: &RuntimeContext,
    executor: &ActionExecutor,
    cmd: RunCommand,
) -> Result<()> {
    let action = Action::RunCommand {
        command: cmd.command,
        cwd: cmd.cwd,
    };
    let mut observer = CliObserver {
        json: ctx.common.json,
    };
    let report = {
        let batch = executor.apply_actions(vec![action], &mut observer);
        run_interruptible(executor, batch).await?
    };
    finish_batch(report)
}

/// Drive a batch, killing the active command on Ctrl+C instead of aborting.
async fn run_interruptible<F>(executor: &ActionExecutor, batch: F) -> Result<BatchReport>
where
    F: std::future::Future<Output = mirrorbox::EngineResult<BatchReport>>,
{
    let mut events = executor.subscribe_events();
    tokio::pin!(batch);
    loop {
        tokio::select! {
            report = &mut batch => return report.map_err(|e| anyhow!(e.user_message())),
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, killing active command");
                executor.kill_active_process().await;
            }
            event = events.recv() => match event {
                Ok(SandboxEvent::ServerReady { url, .. }) => info!("Dev server ready at {url}"),
                Ok(SandboxEvent::ServerCrash { exit_code, .. }) => {
                    warn!("Dev server crashed with exit code {exit_code}")
                }
                Ok(_) => {}
                Err(e) => debug!("event stream: {e}"),
            }
        }
    }
}

fn finish_batch(report: BatchReport) -> Result<()> {
    if let Some(sync_error) = &report.sync_error {
        warn!("Workspace resync failed: {sync_error}");
    }
    let failed = report
        .records
        .iter()
        .filter(|r| r.status == ActionStatus::Error)
        .count();
    if failed > 0 {
        return Err(anyhow!(
            "{failed} of {} actions failed",
            report.records.len()
        ));
    }
    Ok(())
}

async fn handle_tree(ctx: &RuntimeContext, executor: &ActionExecutor) -> Result<()> {
    let snapshot = executor
        .boot()
        .await
        .map_err(|e| anyhow!(e.user_message()))?;
    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&snapshot.tree).context("serializing tree to JSON")?
        );
    } else {
        print!("{}", snapshot.tree.render());
    }
    Ok(())
}

async fn handle_summary(
    ctx: &RuntimeContext,
    executor: &ActionExecutor,
    cmd: SummaryCommand,
) -> Result<()> {
    executor
        .boot()
        .await
        .map_err(|e| anyhow!(e.user_message()))?;
    if cmd.context {
        println!("{}", executor.context_summary().await);
    } else if ctx.common.json {
        let summary = executor.summary().await;
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serializing summary to JSON")?
        );
    } else {
        let summary = executor.summary().await;
        if summary.dependencies.is_empty() {
            println!("dependencies: none");
        } else {
            println!("dependencies: {}", summary.dependencies.join(", "));
        }
        for file in summary.files {
            println!("{} ({} chars)", file.path, file.size);
        }
    }
    Ok(())
}

async fn handle_cat(executor: &ActionExecutor, cmd: CatCommand) -> Result<()> {
    executor
        .boot()
        .await
        .map_err(|e| anyhow!(e.user_message()))?;
    let content = executor
        .file_content(&cmd.path)
        .await
        .ok_or_else(|| anyhow!("no such file in workspace: {}", cmd.path))?;
    print!("{content}");
    Ok(())
}

// ============================================================================
// Config commands
// ============================================================================

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }
    write_default_config(&ctx.paths.config_file)?;
    info!("wrote {}", ctx.paths.config_file.display());
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => write_default_config(&ctx.paths.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn load_config(paths: &AppPaths) -> Result<EngineConfig> {
    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()
        .with_context(|| format!("loading config from {}", paths.config_file.display()))?;

    built
        .try_deserialize()
        .context("deserializing configuration")
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = EngineConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push_str("# Environment overrides: ");
    buffer.push_str(&env_prefix());
    buffer.push_str("__<SECTION>__<KEY>\n");
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
