//! craftrack: runs local game servers and translates their logs.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, and drives the event loop that prints relayed server
//! output and reacts to Ctrl-C.

mod config;
mod events;
mod instance;
mod output;
mod registry;
mod relay;
mod rules;
mod supervisor;
#[cfg(test)]
mod testing;
mod translate;
mod watch;

use std::collections::HashSet;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use crate::config::{load_config, Config, DEFAULT_CONFIG_FILE};
use crate::events::Event;
use crate::instance::{Instance, InstanceStore};
use crate::output::{Printer, StreamKind};
use crate::rules::{default_editor, RuleFile};
use crate::supervisor::{Supervisor, SupervisorOptions};
use crate::translate::{Rule, Translator};

const EVENT_BUFFER: usize = 1024;
const INPUT_BUFFER: usize = 64;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "craftrack",
    version,
    about = "Run local game servers with translated console output",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to craftrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any craftrack.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Directory holding the rule file and instance store.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start one or more servers and relay their output until they exit.
    Start(StartArgs),
    /// Manage configured server instances.
    #[command(subcommand)]
    Instances(InstanceCommand),
    /// Inspect or edit the translation rule file.
    #[command(subcommand)]
    Rules(RulesCommand),
    /// Translate a single log line with the current rules.
    Translate {
        /// The line to translate.
        line: String,
    },
}

#[derive(Debug, Args)]
struct StartArgs {
    /// Instance ids to start.
    #[arg(required = true)]
    ids: Vec<String>,
    /// Instance that receives standard input (defaults to the first id).
    #[arg(long)]
    attach: Option<String>,
    /// Do not forward standard input to any server.
    #[arg(long, conflicts_with = "attach")]
    no_input: bool,
    /// Java runtime to use for this run, overriding instance and config.
    #[arg(long)]
    java: Option<PathBuf>,
    /// Prepend elapsed time to each line.
    #[arg(long)]
    timestamp: bool,
    /// Remove ANSI escape codes from server output before translating.
    #[arg(long)]
    strip_ansi: bool,
    /// Do not reload rules when the rule file changes.
    #[arg(long)]
    no_watch: bool,
    /// Force-kill a stopped server after this many milliseconds (0 = never).
    #[arg(long)]
    stop_grace_ms: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum InstanceCommand {
    /// List configured instances.
    List,
    /// Register a server jar as a new instance.
    Add {
        /// Path to the server jar.
        path: PathBuf,
        /// Instance id (default: next free server-N).
        #[arg(long)]
        id: Option<String>,
        /// Display name (default: the jar's directory name).
        #[arg(long)]
        name: Option<String>,
        /// Java runtime for this instance.
        #[arg(long)]
        java: Option<String>,
        /// Heap size in MB.
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        memory: Option<u32>,
        /// Extra arguments appended after `nogui`.
        #[arg(long, allow_hyphen_values = true)]
        args: Option<String>,
        /// Server type label (e.g. paper, vanilla).
        #[arg(long = "type")]
        server_type: Option<String>,
        /// Game version label.
        #[arg(long)]
        mc_version: Option<String>,
        /// Server core build label.
        #[arg(long)]
        core_version: Option<String>,
    },
    /// Delete an instance. Server files are left in place.
    Remove { id: String },
    /// Change an instance's display name.
    Rename { id: String, name: String },
    /// Set an instance's Java runtime ("" falls back to the global default).
    Java { id: String, path: String },
    /// Set an instance's extra arguments.
    Args {
        id: String,
        #[arg(allow_hyphen_values = true)]
        args: String,
    },
    /// Set an instance's heap size in MB.
    Memory {
        id: String,
        #[arg(value_parser = clap::value_parser!(u32).range(1..))]
        mb: u32,
    },
}

#[derive(Debug, Subcommand)]
enum RulesCommand {
    /// Print the rule file.
    Show,
    /// Compile every rule and report the ones that are malformed.
    Check,
    /// Overwrite the rule file with the default rules.
    Reset,
    /// Open the rule file in an editor, then validate it.
    Edit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("craftrack=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_settings(&cli)?;
    match cli.command {
        Commands::Start(args) => run_start(&config, args).await,
        Commands::Instances(command) => run_instances(&config, command),
        Commands::Rules(command) => run_rules(&config, command),
        Commands::Translate { line } => {
            let rules = open_rule_file(&config)?;
            let translator = Translator::from_file(&rules)?;
            println!("{}", translator.translate(&line));
            Ok(())
        }
    }
}

fn load_settings(cli: &Cli) -> Result<Config> {
    let mut config = if cli.no_config {
        Config::default()
    } else {
        let path = cli.config.clone().or_else(|| {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            default.exists().then_some(default)
        });
        match path {
            Some(path) => load_config(&path)?,
            None => Config::default(),
        }
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.to_string_lossy().into_owned());
    }
    Ok(config)
}

fn open_rule_file(config: &Config) -> Result<RuleFile> {
    let rules = RuleFile::new(config.rules_path());
    if rules.ensure_exists()? {
        tracing::info!(path = %rules.path().display(), "created rule file with default rules");
    }
    Ok(rules)
}

async fn run_start(config: &Config, args: StartArgs) -> Result<()> {
    let attach = attach_target(&args)?;
    let rules = open_rule_file(config)?;
    let translator = Arc::new(Translator::from_file(&rules)?);
    tracing::info!(rules = translator.snapshot().len(), "translation rules loaded");
    let instances = Arc::new(InstanceStore::open(&config.instances_path())?);

    let options = SupervisorOptions {
        default_runtime: config.default_runtime(),
        strip_ansi: args.strip_ansi || config.strip_ansi.unwrap_or(false),
        stop_grace: Duration::from_millis(
            args.stop_grace_ms.or(config.stop_grace_ms).unwrap_or(0),
        ),
    };
    let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
    let supervisor = Arc::new(Supervisor::new(
        instances,
        translator.clone(),
        event_tx.clone(),
        options,
    ));

    if !args.no_watch && config.watch_rules.unwrap_or(true) {
        watch::spawn_rules_watcher(rules, translator, event_tx.clone());
    }
    spawn_signal_listener(event_tx);
    let mut input = attach.as_ref().map(|_| spawn_stdin_listener());

    let mut starts = JoinSet::new();
    for id in unique_ids(&args.ids) {
        let supervisor = supervisor.clone();
        let runtime = args.java.clone();
        let mut input = if attach.as_deref() == Some(id.as_str()) {
            input.take()
        } else {
            None
        };
        starts.spawn(async move {
            let result = supervisor
                .start(&id, runtime.as_deref(), input.as_mut())
                .await;
            (id, result)
        });
    }

    let printer = Printer::new(args.timestamp || config.timestamp.unwrap_or(false));
    let total = starts.len();
    let mut failed = 0;
    let mut shutdown_requests = 0;
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                if let Event::Shutdown = event {
                    begin_shutdown(&supervisor, &mut shutdown_requests);
                } else {
                    print_event(&printer, &event);
                }
            }
            joined = starts.join_next() => match joined {
                Some(Ok((_, Ok(report)))) => {
                    if !report.success() {
                        tracing::warn!(instance = %report.id, code = ?report.code, "server exited abnormally");
                    }
                }
                Some(Ok((id, Err(err)))) => {
                    failed += 1;
                    tracing::error!(instance = %id, error = %err, "failed to start server");
                }
                Some(Err(err)) => {
                    failed += 1;
                    tracing::error!(error = %err, "server task failed");
                }
                None => break,
            }
        }
    }

    // Exit notices are queued before each start returns.
    while let Ok(event) = event_rx.try_recv() {
        print_event(&printer, &event);
    }

    if failed > 0 {
        bail!("{} of {} servers failed to start", failed, total);
    }
    Ok(())
}

fn attach_target(args: &StartArgs) -> Result<Option<String>> {
    if args.no_input {
        return Ok(None);
    }
    match &args.attach {
        Some(id) if !args.ids.contains(id) => {
            bail!("--attach {} is not one of the instances being started", id)
        }
        Some(id) => Ok(Some(id.clone())),
        None => Ok(args.ids.first().cloned()),
    }
}

fn unique_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(ids.len());
    for id in ids {
        if seen.insert(id.as_str()) {
            unique.push(id.clone());
        } else {
            tracing::warn!(instance = %id, "instance listed more than once, starting it once");
        }
    }
    unique
}

fn begin_shutdown(supervisor: &Arc<Supervisor>, requests: &mut usize) {
    let registry = supervisor.registry();
    if registry.is_empty() {
        // Nothing to stop yet; the next Ctrl-C is treated as the first.
        tracing::info!("no servers running");
        return;
    }
    *requests += 1;
    if *requests == 1 {
        tracing::info!(servers = registry.len(), "stopping all servers (Ctrl-C again to kill)");
        // Stop reports through the event channel, so it must not block the loop draining it.
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            supervisor.stop_all().await;
        });
        return;
    }
    for id in supervisor.running() {
        if let Some(handle) = registry.lookup(&id) {
            tracing::warn!(instance = %id, "killing server");
            handle.request_kill();
        }
    }
}

fn print_event(printer: &Printer, event: &Event) {
    let Some(line) = render_event(printer, event) else {
        return;
    };
    match target_stream(event) {
        StreamKind::Stderr => eprintln!("{}", line),
        StreamKind::Stdout => println!("{}", line),
    }
}

/// Server stderr stays on stderr; everything else, notices included, goes to stdout.
fn target_stream(event: &Event) -> StreamKind {
    match event {
        Event::ServerOutput { stream, .. } => *stream,
        _ => StreamKind::Stdout,
    }
}

fn render_event(printer: &Printer, event: &Event) -> Option<String> {
    let line = match event {
        Event::ServerStarting { name, command, .. } => {
            printer.format_notice(name, &format!("starting: {}", command))
        }
        Event::ServerStarted { name, pid, .. } => match pid {
            Some(pid) => printer.format_notice(name, &format!("started (pid {})", pid)),
            None => printer.format_notice(name, "started"),
        },
        Event::ServerOutput { name, line, .. } => printer.format_line(name, line),
        Event::ServerSignalled { name, .. } => printer.format_notice(name, "sent stop signal"),
        Event::ServerExited { name, code, .. } => match code {
            Some(code) => printer.format_notice(name, &format!("process ended with code {}", code)),
            None => printer.format_notice(name, "process terminated by signal"),
        },
        Event::RulesReloaded { rules } => {
            tracing::info!(rules, "translation rules reloaded");
            return None;
        }
        Event::Shutdown => return None,
    };
    Some(line)
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            loop {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if result.is_err() {
                            return;
                        }
                    }
                    _ = sigterm.recv() => {}
                }
                if tx.send(Event::Shutdown).await.is_err() {
                    return;
                }
            }
        }
        #[cfg(not(unix))]
        {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(Event::Shutdown).await.is_err() {
                    return;
                }
            }
        }
    });
}

fn spawn_stdin_listener() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(INPUT_BUFFER);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn run_instances(config: &Config, command: InstanceCommand) -> Result<()> {
    let mut store = InstanceStore::open(&config.instances_path())?;
    match command {
        InstanceCommand::List => {
            if store.is_empty() {
                println!("no instances; add one with `craftrack instances add <jar>`");
                return Ok(());
            }
            println!("{} instance(s)", store.len());
            println!("{:<12} {:<20} {:>7}  {:<24} PATH", "ID", "NAME", "MEMORY", "JAVA");
            for instance in store.list_all() {
                let java = if instance.java_path.is_empty() {
                    "(default)"
                } else {
                    instance.java_path.as_str()
                };
                println!(
                    "{:<12} {:<20} {:>6}M  {:<24} {}",
                    instance.id,
                    instance.name,
                    instance.memory,
                    java,
                    instance.path.display()
                );
            }
        }
        InstanceCommand::Add {
            path,
            id,
            name,
            java,
            memory,
            args,
            server_type,
            mc_version,
            core_version,
        } => {
            let id = id.unwrap_or_else(|| store.next_id());
            if store.get(&id).is_some() {
                bail!("instance {} already exists", id);
            }
            let name = name.unwrap_or_else(|| default_name(&path, &id));
            let mut instance = Instance::new(&id, name, path, memory.unwrap_or(config.default_memory()));
            instance.java_path = java.unwrap_or_default();
            instance.jvm_args = args.unwrap_or_default();
            instance.server_type = server_type.unwrap_or_default();
            instance.mc_version = mc_version.unwrap_or_default();
            instance.core_version = core_version.unwrap_or_default();
            if !instance.path.exists() {
                tracing::warn!(path = %instance.path.display(), "server jar does not exist yet");
            }
            store.put(instance)?;
            println!("added {}", id);
        }
        InstanceCommand::Remove { id } => {
            if store.delete(&id)?.is_none() {
                bail!("no instance with id {}", id);
            }
            println!("removed {}", id);
        }
        InstanceCommand::Rename { id, name } => {
            update_instance(&mut store, &id, |instance| instance.name = name)?;
        }
        InstanceCommand::Java { id, path } => {
            update_instance(&mut store, &id, |instance| {
                instance.java_path = path.trim().to_string()
            })?;
        }
        InstanceCommand::Args { id, args } => {
            update_instance(&mut store, &id, |instance| instance.jvm_args = args)?;
        }
        InstanceCommand::Memory { id, mb } => {
            update_instance(&mut store, &id, |instance| instance.memory = mb)?;
        }
    }
    Ok(())
}

fn update_instance(
    store: &mut InstanceStore,
    id: &str,
    apply: impl FnOnce(&mut Instance),
) -> Result<()> {
    let mut instance = store
        .get(id)
        .cloned()
        .ok_or_else(|| anyhow!("no instance with id {}", id))?;
    apply(&mut instance);
    instance.touch();
    store
        .put(instance)
        .with_context(|| format!("failed to update {}", id))?;
    println!("updated {}", id);
    Ok(())
}

fn default_name(path: &Path, id: &str) -> String {
    path.parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| id.to_string())
}

fn run_rules(config: &Config, command: RulesCommand) -> Result<()> {
    let rules = RuleFile::new(config.rules_path());
    match command {
        RulesCommand::Show => {
            let rules = open_rule_file(config)?;
            print!("{}", rules.read_raw()?);
        }
        RulesCommand::Check => {
            let rules = open_rule_file(config)?;
            check_rules(&rules)?;
        }
        RulesCommand::Reset => {
            rules.restore_default()?;
            println!("restored default rules in {}", rules.path().display());
        }
        RulesCommand::Edit => {
            let rules = open_rule_file(config)?;
            let editor = config.editor.clone().unwrap_or_else(default_editor);
            rules.edit(&editor)?;
            check_rules(&rules)?;
        }
    }
    Ok(())
}

fn check_rules(rules: &RuleFile) -> Result<()> {
    let raw = rules.load()?;
    let mut invalid = 0;
    for rule in &raw {
        if let Err(err) = Rule::compile(rule) {
            invalid += 1;
            println!("invalid: {}#{}\n  {}", rule.pattern, rule.template, err);
        }
    }
    println!(
        "{}: {} rules, {} invalid",
        rules.path().display(),
        raw.len(),
        invalid
    );
    if invalid > 0 {
        bail!("{} malformed rule(s) will be skipped", invalid);
    }
    Ok(())
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
