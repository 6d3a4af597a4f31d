//! CLI for process-set store operations

use anyhow::Context;
use clap::{Parser, Subcommand};
use psetkv::common::{format_ranks, parse_rank_list, Config};
use psetkv::kvs::{KvStore, NotificationListener, SetDefinition, SocketNotifier};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "psetkv")]
#[command(about = "Shared-memory process-set store CLI")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Group identifier (overrides config)
    #[arg(long)]
    group: Option<String>,

    /// Rank of this process (overrides config)
    #[arg(long)]
    rank: Option<u32>,

    /// Directory of the notification sockets (overrides config)
    #[arg(long)]
    notify_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the shared store for a group
    Init {
        /// Number of processes in the group
        #[arg(long)]
        world_size: Option<u32>,

        /// Set-definition file (`name lower upper` per line)
        #[arg(long)]
        sets: Option<PathBuf>,

        /// Inline set, `name:lower-upper` (repeatable)
        #[arg(long = "set", value_parser = parse_set_arg)]
        set: Vec<SetDefinition>,
    },

    /// Dump every entry
    Show {
        #[arg(long)]
        json: bool,
    },

    /// Print the members of a set
    Get {
        key: String,

        #[arg(long)]
        json: bool,
    },

    /// Replace the members of a set
    Put {
        key: String,

        /// Ranks, e.g. `0,2,4-7`
        ranks: String,
    },

    /// Append a rank to a set
    Add { key: String, rank: u32 },

    /// Remove the member at a position
    Del { key: String, index: usize },

    /// Wait for changes to a set
    Watch {
        key: String,

        /// Stop after this many changes
        #[arg(long, default_value = "1")]
        count: usize,
    },

    /// Append newly joined ranks to mpi://WORLD
    GrowWorld { count: u32 },

    /// Print the global version
    Version,

    /// List set names
    Sets {
        /// Only sets containing this rank
        #[arg(long)]
        local: bool,
    },

    /// Remove the store and all its regions
    Destroy,
}

fn parse_set_arg(s: &str) -> Result<SetDefinition, String> {
    let (name, range) = s
        .split_once(':')
        .ok_or_else(|| format!("expected name:lower-upper, got {:?}", s))?;
    SetDefinition::parse_line(&format!("{} {}", name, range)).map_err(|e| e.to_string())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(group) = cli.group {
        config.group = group;
    }
    if let Some(rank) = cli.rank {
        config.rank = rank;
    }
    if let Some(dir) = cli.notify_dir {
        config.notify_dir = dir;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let group = config.group_id()?;
    let rank = config.rank;
    let notify_dir = config.notify_dir.clone();
    let notifier = || SocketNotifier::new(notify_dir.clone());
    let attach = || -> anyhow::Result<KvStore<SocketNotifier>> {
        KvStore::attach(group.clone(), rank, notifier()?)
            .with_context(|| format!("attach to group {}", group))
    };

    match cli.command {
        Commands::Init {
            world_size,
            sets,
            set,
        } => {
            if let Some(world_size) = world_size {
                config.world_size = world_size;
            }
            if sets.is_some() {
                config.set_file = sets;
            }
            config.sets.extend(set);
            config.validate()?;

            let definitions = config.set_definitions()?;
            let store = KvStore::initialize(
                group.clone(),
                rank,
                config.world_size,
                &definitions,
                notifier()?,
            )?;
            println!("Initialized group {}", group);
            println!("  World size: {}", config.world_size);
            println!("  Slots: {}", store.capacity());
            println!("  Sets: {}", store.global_set_count());
            store.detach();
        }

        Commands::Show { json } => {
            let mut store = attach()?;
            let entries = store.snapshot()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("Group {} (global version {})", group, store.global_version()?);
                for e in entries {
                    println!(
                        "  [{}] {} v{} gen {} ranks({}/{}): {} pending({}/{}): {}",
                        e.slot,
                        if e.key.is_empty() { "<empty>" } else { e.key.as_str() },
                        e.version,
                        e.generation,
                        e.ranks.len(),
                        e.ranks_capacity,
                        format_ranks(&e.ranks),
                        e.pending.len(),
                        e.updates_capacity,
                        format_ranks(&e.pending)
                    );
                }
            }
        }

        Commands::Get { key, json } => {
            let mut store = attach()?;
            let membership = store.get(&key)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&membership)?);
            } else {
                println!("{} v{}: {}", key, membership.version, format_ranks(&membership.ranks));
            }
        }

        Commands::Put { key, ranks } => {
            let ranks = parse_rank_list(&ranks)?;
            let version = attach()?.put(&key, &ranks)?;
            println!("{} v{}", key, version);
        }

        Commands::Add { key, rank } => {
            let version = attach()?.add(&key, rank)?;
            println!("{} v{}", key, version);
        }

        Commands::Del { key, index } => {
            let version = attach()?.del(&key, index)?;
            println!("{} v{}", key, version);
        }

        Commands::Watch { key, count } => {
            let mut listener = NotificationListener::bind(&notify_dir, rank)?;
            let mut store = attach()?;
            for _ in 0..count {
                let membership = store.get(&key)?;
                let slot = membership
                    .slot
                    .with_context(|| format!("{} cannot be watched", key))?;
                store.subscribe(slot)?;
                listener.wait_for(slot)?;
                let membership = store.get(&key)?;
                println!("{} v{}: {}", key, membership.version, format_ranks(&membership.ranks));
            }
        }

        Commands::GrowWorld { count } => {
            let version = attach()?.add_to_world(count)?;
            println!("mpi://WORLD v{}", version);
        }

        Commands::Version => {
            println!("{}", attach()?.global_version()?);
        }

        Commands::Sets { local } => {
            let mut store = attach()?;
            let names = if local {
                store.local_set_names()?
            } else {
                store.set_names()?
            };
            for name in names {
                println!("{}", name);
            }
        }

        Commands::Destroy => {
            attach()?.destroy()?;
            println!("Destroyed group {}", group);
        }
    }

    Ok(())
}
