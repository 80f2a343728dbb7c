use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use gantry::config::Config;
use gantry::notify::{CommandNotifier, LogNotifier, Notifier};
use gantry::orchestration::{
    BatchDispatcher, BatchResult, CloseOutcome, ConvoyOptions, ConvoyStatus, ConvoyTracker,
    DispatchOptions, StepAdvance, StepExecutor, StrandedConvoy,
};
use gantry::session::{SessionManager, TmuxSessions};
use gantry::store::{BdStore, StoreClient};
use gantry::tmux::Tmux;
use gantry::workers::GitWorkerPool;
use gantry::{glog, Error, Result};

/// Gantry - dispatch work items to agent workers and track them to completion
#[derive(Parser, Debug)]
#[command(name = "gantry")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    GANTRY_DEBUG=1       Enable debug logging (alternative to --debug)\n    GANTRY_LOG_STDERR=1  Mirror log lines to stderr")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.gantry/gantry.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Dispatch work items to fresh workers in a pool
    Sling {
        /// Work item ids
        #[arg(required = true)]
        items: Vec<String>,

        /// Target worker pool
        #[arg(long, short = 'p')]
        pool: String,

        /// Skip domain, status and live-session checks
        #[arg(long, short = 'f')]
        force: bool,

        /// Maximum live sessions in the pool (0 = unlimited)
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Do not create tracking convoys
        #[arg(long)]
        no_convoy: bool,

        /// Instantiate this formula for every item
        #[arg(long)]
        formula: Option<String>,

        /// Show what would happen without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Allow items from other domains
        #[arg(long)]
        no_domain_guard: bool,
    },

    /// Convoy tracking
    #[command(subcommand)]
    Convoy(ConvoyCommand),

    /// Work group steps
    #[command(subcommand)]
    Step(StepCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConvoyCommand {
    /// Create a convoy tracking the given items
    Create {
        title: String,
        items: Vec<String>,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        notify: Option<String>,
        /// Caller manages the lifecycle; never auto-closed or reopened
        #[arg(long)]
        owned: bool,
        #[arg(long)]
        allow_empty: bool,
    },
    /// Track more items, reopening a closed convoy
    Add {
        convoy: String,
        #[arg(required = true)]
        items: Vec<String>,
    },
    /// Show tracked items and progress
    Status { convoy: String },
    /// List open convoys
    List,
    /// Close convoys whose tracked items are all done
    Check {
        /// Check one convoy instead of all open ones
        convoy: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Close a convoy explicitly
    Close {
        convoy: String,
        #[arg(long, default_value = "closed manually")]
        reason: String,
        /// Close even if tracked items are still open
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// Open convoys with items waiting for a worker
    Stranded,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum StepCommand {
    /// Steps of a group that can start now
    Ready {
        group: String,
        /// Also print every step in dependency order
        #[arg(long)]
        all: bool,
    },
    /// Close a step and advance its group
    Done {
        step: String,
        #[arg(long)]
        dry_run: bool,
    },
}

struct Engine {
    config: Config,
    store: Arc<dyn StoreClient>,
    sessions: Arc<dyn SessionManager>,
    notifier: Arc<dyn Notifier>,
}

impl Engine {
    fn load() -> Result<Self> {
        let config = Config::load()?;
        let store = BdStore::from_config(&config.store);
        if !store.is_available() {
            return Err(Error::Validation(format!(
                "store binary '{}' not found in PATH",
                config.store.binary
            )));
        }
        let notifier: Arc<dyn Notifier> = match &config.notify.command {
            Some(command) => Arc::new(CommandNotifier::new(command.clone())?),
            None => Arc::new(LogNotifier),
        };
        Ok(Self {
            sessions: Arc::new(TmuxSessions::new(&config.sessions.prefix)),
            store: Arc::new(store),
            notifier,
            config,
        })
    }

    fn tracker(&self) -> ConvoyTracker {
        ConvoyTracker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.sessions),
            Arc::clone(&self.notifier),
            &self.config.tracker,
        )
    }

    fn dispatcher(&self) -> Result<BatchDispatcher> {
        let workers = Arc::new(GitWorkerPool::new(self.config.clone())?);
        let actor = std::env::var("GANTRY_ACTOR").unwrap_or_else(|_| "gantry".to_string());
        Ok(BatchDispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.sessions),
            workers,
            Arc::clone(&self.notifier),
            self.config.clone(),
        )?
        .with_actor(actor))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    gantry::log::init_with_debug(cli.debug);
    glog!("gantry {:?}", cli.command);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let engine = Engine::load()?;
    let json = cli.json;
    match cli.command {
        Command::Sling {
            items,
            pool,
            force,
            max_concurrent,
            no_convoy,
            formula,
            dry_run,
            no_domain_guard,
        } => {
            if !dry_run && !Tmux::is_available() {
                return Err(Error::Validation("tmux is not available".to_string()));
            }
            let mut opts = DispatchOptions::from_config(&engine.config.dispatch);
            opts.force = force;
            opts.dry_run = dry_run;
            opts.formula = formula;
            if let Some(max) = max_concurrent {
                opts.max_concurrent = max;
            }
            if no_convoy {
                opts.auto_convoy = false;
            }
            if no_domain_guard {
                opts.cross_domain_guard = false;
            }
            let result = engine.dispatcher()?.dispatch(&items, &pool, &opts).await?;
            emit(json, &result, print_batch)
        }
        Command::Convoy(cmd) => run_convoy(&engine, cmd, json).await,
        Command::Step(cmd) => run_step(&engine, cmd, json).await,
    }
}

async fn run_convoy(engine: &Engine, cmd: ConvoyCommand, json: bool) -> Result<()> {
    let tracker = engine.tracker();
    match cmd {
        ConvoyCommand::Create {
            title,
            items,
            owner,
            notify,
            owned,
            allow_empty,
        } => {
            let options = ConvoyOptions {
                owner,
                notify,
                owned,
                allow_empty,
            };
            let convoy = tracker.create(&title, &items, options).await?;
            emit(json, &convoy, |c| {
                println!("Created convoy {} tracking {} items", c.id, items.len())
            })
        }
        ConvoyCommand::Add { convoy, items } => {
            let added = tracker.add(&convoy, &items).await?;
            emit(json, &added, |a| {
                println!("Added {} items to {}", a.added, convoy);
                if a.reopened {
                    println!("Convoy {} reopened", convoy);
                }
            })
        }
        ConvoyCommand::Status { convoy } => {
            let status = tracker.status(&convoy).await?;
            emit(json, &status, print_convoy_status)
        }
        ConvoyCommand::List => {
            let open = tracker.list_open().await?;
            emit(json, &open, |convoys| {
                if convoys.is_empty() {
                    println!("No open convoys");
                }
                for c in convoys {
                    println!("  {}  {}", c.id, c.title);
                }
            })
        }
        ConvoyCommand::Check { convoy, dry_run } => match convoy {
            Some(id) => {
                let outcome = tracker.check_and_close(&id, dry_run).await?;
                emit(json, &outcome, |o| println!("{}: {}", id, describe_close(o)))
            }
            None => {
                let checks = tracker.check_all(dry_run).await?;
                emit(json, &checks, |checks| {
                    for check in checks {
                        println!("{}: {}", check.convoy_id, describe_close(&check.outcome));
                    }
                })
            }
        },
        ConvoyCommand::Close {
            convoy,
            reason,
            force,
        } => {
            let outcome = tracker.close(&convoy, &reason, force).await?;
            emit(json, &outcome, |o| println!("{}: {}", convoy, describe_close(o)))
        }
        ConvoyCommand::Stranded => {
            let stranded = tracker.stranded().await?;
            emit(json, &stranded, print_stranded)
        }
    }
}

async fn run_step(engine: &Engine, cmd: StepCommand, json: bool) -> Result<()> {
    let executor = StepExecutor::new(Arc::clone(&engine.store));
    match cmd {
        StepCommand::Ready { group, all } => {
            let level = executor.ready_level(&group).await?;
            if json {
                return emit(json, &level, |_| {});
            }
            if level.all_complete {
                println!("Group {} is complete", group);
            } else if level.ready.is_empty() {
                println!("Group {}: no step ready (waiting)", group);
            } else {
                println!("Group {}: {} ready", group, level.ready.len());
                for item in &level.ready {
                    println!("  {}  {}", item.id, item.title);
                }
            }
            if all {
                println!();
                for node in executor.group_order(&group).await? {
                    let status = node.status.map(|s| s.to_string()).unwrap_or_default();
                    println!("  {:<12} {}  {}", status, node.id, node.title);
                }
            }
            Ok(())
        }
        StepCommand::Done { step, dry_run } => {
            let advance = if dry_run {
                executor.preview_complete(&step).await?
            } else {
                executor.complete_step(&step).await?
            };
            emit(json, &advance, print_advance)
        }
    }
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

fn print_batch(result: &BatchResult) {
    let mode = if result.dry_run { " (dry run)" } else { "" };
    println!(
        "Batch {}{}: {} dispatched, {} failed",
        &result.batch_id[..8.min(result.batch_id.len())],
        mode,
        result.succeeded,
        result.failed
    );
    for o in &result.outcomes {
        let mark = if o.success { "ok  " } else { "FAIL" };
        let worker = o.worker_name.as_deref().unwrap_or("-");
        print!("  {} {} -> {}", mark, o.item_id, worker);
        if let Some(convoy) = &o.convoy_id {
            print!("  convoy {}", convoy);
        }
        if let Some(molecule) = &o.molecule_id {
            print!("  molecule {}", molecule);
        }
        println!();
        if let Some(err) = &o.error_message {
            println!("       {}", err);
        }
    }
}

fn print_convoy_status(status: &ConvoyStatus) {
    println!(
        "{}  {}  [{}] {}/{} done{}",
        status.id,
        status.title,
        status.status,
        status.completed_count,
        status.total_count,
        if status.owned { " (owned)" } else { "" }
    );
    for t in &status.tracked_items {
        let mut flags = Vec::new();
        if t.blocked {
            flags.push("blocked");
        }
        if t.stale {
            flags.push("stale");
        }
        println!(
            "  {:<12} {}  {}  {}{}",
            t.status,
            t.id,
            t.title,
            t.assignee.as_deref().unwrap_or(""),
            if flags.is_empty() {
                String::new()
            } else {
                format!(" ({})", flags.join(", "))
            }
        );
    }
}

fn print_stranded(stranded: &Vec<StrandedConvoy>) {
    if stranded.is_empty() {
        println!("No stranded convoys");
        return;
    }
    for s in stranded {
        println!("{}  {}  {} ready", s.id, s.title, s.ready_count);
        for id in &s.ready_item_ids {
            println!("  {}", id);
        }
    }
}

fn print_advance(advance: &StepAdvance) {
    match advance {
        StepAdvance::GroupComplete { group_id } => println!("Group {} complete", group_id),
        StepAdvance::Continue { group_id, next } => {
            println!("Group {}: continue with {} ({})", group_id, next.id, next.title)
        }
        StepAdvance::FanOut { group_id, ready } => {
            println!("Group {}: {} steps now in progress", group_id, ready.len());
            for item in ready {
                println!("  {}  {}", item.id, item.title);
            }
        }
        StepAdvance::Blocked { group_id } => {
            println!("Group {}: blocked, nothing ready yet", group_id)
        }
    }
}

fn describe_close(outcome: &CloseOutcome) -> String {
    match outcome {
        CloseOutcome::AlreadyClosed => "already closed".to_string(),
        CloseOutcome::StillOpen { open_count } => format!("{} items still open", open_count),
        CloseOutcome::Owned { .. } => "complete, owned by caller (left open)".to_string(),
        CloseOutcome::WouldClose { reason } => format!("would close ({})", reason),
        CloseOutcome::Closed { reason, notified } => {
            if notified.is_empty() {
                format!("closed ({})", reason)
            } else {
                format!("closed ({}), notified {}", reason, notified.join(", "))
            }
        }
    }
}
