//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use smartlab_twin::cli::watch::{self, WatchConfig, build_panels};
use smartlab_twin::core::config::Config;
use smartlab_twin::core::errors::TwinError;
use smartlab_twin::daemon::session::TwinSession;
use smartlab_twin::daemon::signals::SignalHandler;
use smartlab_twin::ingest::actuator::{DEFAULT_PEEK_WAIT, peek_payload, publish_command};
use smartlab_twin::ingest::pipeline::BrokerEndpoint;
use smartlab_twin::logger::activity::{
    ActivityLoggerConfig, ActivityLoggerHandle, spawn_logger,
};
use smartlab_twin::registry::status::{Status, classify};
use smartlab_twin::registry::topics::{ALL_CHOICE, TopicRegistry, topic_label};
use smartlab_twin::selection::channel::SelectionChannel;
use smartlab_twin::store::export::export_all_to_flat_file;
use smartlab_twin::store::sqlite::ReadingStore;

/// SmartLab digital twin: MQTT sensor ingestion, dual SQLite persistence and
/// the shared selection channel.
#[derive(Debug, Parser)]
#[command(
    name = "sltwin",
    author,
    version,
    about = "SmartLab digital twin - sensor ingestion and selection channel",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the ingestion session until SIGINT/SIGTERM.
    Run,
    /// Publish a selection to the shared selection file.
    Select(SelectArgs),
    /// Show the current shared selection.
    Selection,
    /// Follow the selection in the terminal with live values.
    Watch(WatchArgs),
    /// Show stored readings of one topic.
    Query(QueryArgs),
    /// Export a store to CSV.
    Export(ExportArgs),
    /// List topic groups and their choices.
    Groups(GroupsArgs),
    /// Publish a command payload to an actuator topic.
    Actuate(ActuateArgs),
    /// Show the current payload of a topic.
    Peek(PeekArgs),
    /// View configuration state.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct SelectArgs {
    /// Group to choose from (defaults to the configured default group).
    #[arg(long, short, value_name = "GROUP")]
    group: Option<String>,
    /// `all` or one topic of the group.
    #[arg(default_value = ALL_CHOICE, value_name = "CHOICE")]
    choice: String,
    /// Publish these exact topics instead of a group choice.
    #[arg(long = "topic", value_name = "TOPIC", conflicts_with_all = ["group", "choice"])]
    topics: Vec<String>,
    /// Resolve against the actuator groups instead of the sensor groups.
    #[arg(long)]
    actuators: bool,
}

#[derive(Debug, Clone, Args)]
struct WatchArgs {
    /// Refresh interval (defaults to the selection poll interval).
    #[arg(long, value_name = "MILLISECONDS")]
    refresh_ms: Option<u64>,
}

#[derive(Debug, Clone, Args)]
struct QueryArgs {
    /// Topic to read.
    #[arg(value_name = "TOPIC")]
    topic: String,
    /// Most recent rows to show (0 shows all).
    #[arg(long, short = 'n', default_value_t = 20)]
    limit: u32,
    /// Read the history store instead of the live store.
    #[arg(long)]
    history: bool,
}

#[derive(Debug, Clone, Args)]
struct ExportArgs {
    /// Destination CSV file.
    #[arg(value_name = "PATH")]
    destination: PathBuf,
    /// Export the live store instead of the history store.
    #[arg(long)]
    live: bool,
}

#[derive(Debug, Clone, Args)]
struct GroupsArgs {
    /// Show the choices of a single group.
    #[arg(value_name = "GROUP")]
    group: Option<String>,
    /// List actuator groups instead of sensor groups.
    #[arg(long)]
    actuators: bool,
}

#[derive(Debug, Clone, Args)]
struct ActuateArgs {
    /// Actuator topic.
    #[arg(value_name = "TOPIC")]
    topic: String,
    /// Payload to publish.
    #[arg(value_name = "PAYLOAD")]
    payload: String,
}

#[derive(Debug, Clone, Args)]
struct PeekArgs {
    /// Topic to listen on.
    #[arg(value_name = "TOPIC")]
    topic: String,
    /// How long to wait for a message after connecting.
    #[arg(long, value_name = "MILLISECONDS")]
    wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the config file path.
    Path,
    /// Print the effective configuration.
    Show,
    /// Validate the configuration.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
        }
    }
}

impl From<TwinError> for CliError {
    fn from(err: TwinError) -> Self {
        match err {
            TwinError::InvalidConfig { .. }
            | TwinError::MissingConfig { .. }
            | TwinError::ConfigParse { .. }
            | TwinError::UnknownGroup { .. }
            | TwinError::UnknownTopic { .. } => Self::User(err.to_string()),
            _ => Self::Runtime(err.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Run => run_session(cli),
        Command::Select(args) => run_select(cli, args),
        Command::Selection => run_selection(cli),
        Command::Watch(args) => run_watch(cli, args),
        Command::Query(args) => run_query(cli, args),
        Command::Export(args) => run_export(cli, args),
        Command::Groups(args) => run_groups(cli, args),
        Command::Actuate(args) => run_actuate(cli, args),
        Command::Peek(args) => run_peek(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Ok(Config::load(cli.config.as_deref())?)
}

/// Run `body` with an activity logger writing to the configured log, then
/// flush it. One-shot commands log their side effects the same way the
/// session does.
fn with_activity_logger<T>(
    config: &Config,
    body: impl FnOnce(&ActivityLoggerHandle) -> Result<T, CliError>,
) -> Result<T, CliError> {
    let (logger, join) = spawn_logger(ActivityLoggerConfig::for_path(
        &config.paths.activity_log,
    ))?;
    let result = body(&logger);
    logger.shutdown();
    if join.join().is_err() {
        eprintln!("[SLT-CLI] activity logger thread panicked");
    }
    result
}

fn registry_for(config: &Config, actuators: bool) -> Result<TopicRegistry, CliError> {
    let registry = if actuators {
        TopicRegistry::actuators_from_config(&config.topics)?
    } else {
        TopicRegistry::sensors_from_config(&config.topics)?
    };
    Ok(registry)
}

// ──────────────────── run ────────────────────

fn run_session(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let signals = SignalHandler::new();
    let mut session = TwinSession::init(config, signals)?;
    let summary = session.run()?;

    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                println!(
                    "Session ended after {}s: {} readings accepted ({} live rows cleared at start).",
                    summary.uptime_secs, summary.readings_accepted, summary.live_rows_cleared
                );
                for report in &summary.pipelines {
                    println!(
                        "  {:<10} received={} accepted={} dropped={} observer_failures={} reconnects={}",
                        report.name,
                        report.stats.received,
                        report.stats.accepted,
                        report.stats.decode_errors,
                        report.stats.observer_failures,
                        report.stats.reconnects,
                    );
                }
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "run",
                "summary": serde_json::to_value(&summary)?,
            });
            write_json_line(&payload)?;
        }
    }

    if summary.clean {
        Ok(())
    } else {
        Err(CliError::Runtime("shutdown did not complete cleanly".to_string()))
    }
}

// ──────────────────── selection ────────────────────

fn resolve_select_topics(
    registry: &TopicRegistry,
    args: &SelectArgs,
) -> Result<Vec<String>, CliError> {
    if !args.topics.is_empty() {
        if let Some(unknown) = args.topics.iter().find(|t| !registry.contains(t)) {
            return Err(TwinError::UnknownTopic {
                topic: unknown.clone(),
            }
            .into());
        }
        return Ok(args.topics.clone());
    }
    let group = match &args.group {
        Some(group) => group.clone(),
        None => registry
            .default_group()
            .map(str::to_string)
            .ok_or_else(|| {
                CliError::User("no --group given and no default group configured".to_string())
            })?,
    };
    Ok(registry.resolve_selection(&group, &args.choice)?)
}

fn run_select(cli: &Cli, args: &SelectArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let registry = registry_for(&config, args.actuators)?;
    let topics = resolve_select_topics(&registry, args)?;

    with_activity_logger(&config, |logger| {
        let channel = SelectionChannel::new(
            &config.paths.selection_file,
            config.selection.mode,
            logger.clone(),
        );
        channel.publish_selection(&topics)?;
        Ok(())
    })?;

    let entities = registry.entities_for_selection(&topics);
    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                println!(
                    "Published {} topic(s) to {}",
                    topics.len(),
                    config.paths.selection_file.display()
                );
                for topic in &topics {
                    println!("  {}", topic_label(topic));
                }
                if cli.verbose && !entities.is_empty() {
                    println!("  Linked entities: {}", entities.join(", "));
                }
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "select",
                "path": config.paths.selection_file.to_string_lossy(),
                "topics": topics,
                "entities": entities,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_selection(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let registry = registry_for(&config, false)?;
    let channel = SelectionChannel::new(
        &config.paths.selection_file,
        config.selection.mode,
        ActivityLoggerHandle::disabled(),
    );
    let current = channel.try_read_selection()?;
    let topics = current.clone().unwrap_or_default();
    let entities = registry.entities_for_selection(&topics);

    match output_mode(cli) {
        OutputMode::Human => match current {
            None => println!(
                "No selection published yet ({} does not exist).",
                config.paths.selection_file.display()
            ),
            Some(topics) if topics.is_empty() => println!("Selection is empty."),
            Some(topics) => {
                println!("Current selection ({}):", topics.len());
                for topic in &topics {
                    println!("  {topic}");
                }
                if cli.verbose && !entities.is_empty() {
                    println!("  Linked entities: {}", entities.join(", "));
                }
            }
        },
        OutputMode::Json => {
            let payload = json!({
                "command": "selection",
                "path": config.paths.selection_file.to_string_lossy(),
                "exists": current.is_some(),
                "topics": topics,
                "entities": entities,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_watch(cli: &Cli, args: &WatchArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let registry = registry_for(&config, false)?;
    let mut watch_config = WatchConfig::from_config(&config, registry);
    if let Some(ms) = args.refresh_ms {
        watch_config.refresh = Duration::from_millis(ms.max(50));
    }

    match output_mode(cli) {
        OutputMode::Human if io::stdout().is_terminal() => Ok(watch::run(&watch_config)?),
        _ => {
            // Not a terminal: one JSON snapshot of the current panels.
            let channel = SelectionChannel::new(
                &watch_config.selection_file,
                watch_config.selection_mode,
                ActivityLoggerHandle::disabled(),
            );
            let selection = channel.read_selection();
            let store = ReadingStore::open(&watch_config.live_db).ok();
            let panels = build_panels(store.as_ref(), &selection, &watch_config.thresholds);
            let panels: Vec<Value> = panels
                .iter()
                .map(|p| {
                    json!({
                        "topic": p.topic,
                        "label": topic_label(&p.topic),
                        "latest": p.latest(),
                        "latest_at": p.latest_at,
                        "status": p.status,
                        "values": p.values,
                    })
                })
                .collect();
            write_json_line(&json!({
                "command": "watch",
                "selection": selection,
                "panels": panels,
            }))
        }
    }
}

// ──────────────────── stores ────────────────────

fn open_existing_store(path: &std::path::Path) -> Result<ReadingStore, CliError> {
    if !path.exists() {
        return Err(CliError::User(format!(
            "store {} does not exist; run `sltwin run` first",
            path.display()
        )));
    }
    let store = ReadingStore::open(path)?;
    store.ensure_schema()?;
    Ok(store)
}

fn status_colored(status: Status) -> String {
    let label = status.label();
    match status {
        Status::Occupied | Status::High => label.red().to_string(),
        Status::Low => label.blue().to_string(),
        Status::Normal | Status::Unoccupied => label.green().to_string(),
        Status::NoData | Status::Unknown => label.dimmed().to_string(),
    }
}

fn run_query(cli: &Cli, args: &QueryArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let path = if args.history {
        &config.paths.history_db
    } else {
        &config.paths.live_db
    };
    let store = open_existing_store(path)?;
    let rows = if args.limit == 0 {
        store.read_by_topic(&args.topic)?
    } else {
        store.recent_by_topic(&args.topic, args.limit)?
    };
    let status = classify(
        &args.topic,
        rows.last().map(|r| r.value),
        &config.status,
    );

    match output_mode(cli) {
        OutputMode::Human => {
            println!(
                "{} ({} rows, {})",
                topic_label(&args.topic).bold(),
                rows.len(),
                status_colored(status)
            );
            for row in &rows {
                println!("  {:>8}  {}  {}", row.id, row.timestamp, row.value);
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "query",
                "store": path.to_string_lossy(),
                "topic": args.topic,
                "status": status,
                "rows": rows,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_export(cli: &Cli, args: &ExportArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let source = if args.live {
        &config.paths.live_db
    } else {
        &config.paths.history_db
    };
    let store = open_existing_store(source)?;
    let summary = export_all_to_flat_file(&store, &args.destination)?;

    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                println!(
                    "Exported {} rows across {} topics to {}",
                    summary.rows,
                    summary.topics,
                    args.destination.display()
                );
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "export",
                "source": source.to_string_lossy(),
                "destination": args.destination.to_string_lossy(),
                "topics": summary.topics,
                "rows": summary.rows,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ──────────────────── registry ────────────────────

fn run_groups(cli: &Cli, args: &GroupsArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let registry = registry_for(&config, args.actuators)?;

    if let Some(name) = &args.group {
        let options = registry.topic_options(name)?;
        match output_mode(cli) {
            OutputMode::Human => {
                println!("{}:", name.bold());
                for option in &options {
                    if option == ALL_CHOICE {
                        println!("  {option}");
                    } else {
                        println!("  {}  ({option})", topic_label(option));
                    }
                }
            }
            OutputMode::Json => {
                write_json_line(&json!({
                    "command": "groups",
                    "group": name,
                    "options": options,
                }))?;
            }
        }
        return Ok(());
    }

    match output_mode(cli) {
        OutputMode::Human => {
            for group in registry.groups() {
                let suffix = if group.offers_all { "" } else { " (no \"all\")" };
                println!("{:<12} {} topics{suffix}", group.name.bold(), group.topics.len());
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "groups",
                "groups": serde_json::to_value(registry.groups())?,
            }))?;
        }
    }
    Ok(())
}

// ──────────────────── actuators ────────────────────

fn run_actuate(cli: &Cli, args: &ActuateArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let registry = registry_for(&config, true)?;
    if !registry.contains(&args.topic) {
        return Err(TwinError::UnknownTopic {
            topic: args.topic.clone(),
        }
        .into());
    }
    let broker = BrokerEndpoint::from_config(&config.broker);
    with_activity_logger(&config, |logger| {
        Ok(publish_command(&broker, &args.topic, &args.payload, logger)?)
    })?;

    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                println!("Published {:?} to {}", args.payload, topic_label(&args.topic));
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "actuate",
                "broker": broker.label(),
                "topic": args.topic,
                "payload": args.payload,
            }))?;
        }
    }
    Ok(())
}

fn run_peek(cli: &Cli, args: &PeekArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let broker = BrokerEndpoint::from_config(&config.broker);
    let wait = args.wait_ms.map_or(DEFAULT_PEEK_WAIT, Duration::from_millis);
    let payload = peek_payload(&broker, &args.topic, wait)?;

    match output_mode(cli) {
        OutputMode::Human => match &payload {
            Some(payload) => println!("{payload}"),
            None => println!("(no message on {} within {}ms)", args.topic, wait.as_millis()),
        },
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "peek",
                "topic": args.topic,
                "payload": payload,
            }))?;
        }
    }
    Ok(())
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Internal(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Broker: {}", config.broker_label());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("Configuration is INVALID: {e}"),
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ──────────────────── output ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("SLT_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
