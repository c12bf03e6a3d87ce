//! VolGuard CLI - Volume Use-Lock Command Line Interface
//!
//! This binary provides operator commands for policies, volume metadata,
//! and the distributed use locks that guard mounts and snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use volguard_common::{
    Config, HolderId, LockClass, UseRecord, VolumeId,
    config::{LockConfig, StoreConfig},
};
use volguard_lock::{ExecError, ExecOptions, UseFilter, UseLockManager};
use volguard_meta::{MetadataClient, Policy, VolumeMeta};
use volguard_store::EtcdLeaseStore;

/// Wait for the lock timed out before acquisition (EX_TEMPFAIL).
const EXIT_WAIT_TIMEOUT: i32 = 75;
/// The lease was lost while the command was running (EX_SOFTWARE).
const EXIT_LEASE_LOST: i32 = 70;
/// Interrupted while waiting; no store state was touched.
const EXIT_INTERRUPTED: i32 = 130;
/// The wrapped command could not be started.
const EXIT_SPAWN_FAILED: i32 = 127;

#[derive(Parser, Debug)]
#[command(name = "volguard")]
#[command(about = "VolGuard volume use-lock CLI")]
#[command(version)]
struct Args {
    /// etcd endpoints
    #[arg(
        long = "etcd",
        env = "VOLGUARD_ETCD",
        value_delimiter = ',',
        default_value = "http://localhost:2379"
    )]
    etcd: Vec<String>,

    /// Key prefix used for namespacing
    #[arg(long, env = "VOLGUARD_PREFIX", default_value = "/volguard")]
    prefix: String,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage policies
    Policy {
        #[command(subcommand)]
        action: PolicyCommands,
    },
    /// Manage volume metadata
    Volume {
        #[command(subcommand)]
        action: VolumeCommands,
    },
    /// Manage uses (hosts consuming volumes)
    Use {
        #[command(subcommand)]
        action: UseCommands,
    },
}

#[derive(Subcommand, Debug)]
enum PolicyCommands {
    /// Upload a policy; accepts JSON on stdin
    Upload {
        /// Policy name
        name: String,
    },
    /// Show a policy as JSON
    Get {
        /// Policy name
        name: String,
    },
    /// List all policies
    List,
    /// Delete a policy; its volumes and history are unaffected
    Delete {
        /// Policy name
        name: String,
    },
    /// Historical policy revisions
    History {
        #[command(subcommand)]
        action: PolicyHistoryCommands,
    },
}

#[derive(Subcommand, Debug)]
enum PolicyHistoryCommands {
    /// List all revisions of a policy
    List {
        /// Policy name
        name: String,
    },
    /// Show a single revision of a policy
    Get {
        /// Policy name
        name: String,
        /// Revision id
        revision: u64,
    },
}

#[derive(Subcommand, Debug)]
enum VolumeCommands {
    /// Record a volume under a policy
    Create {
        /// Volume as policy/volume
        volume: String,
        /// Volume size (e.g. 10G, 1T, 500M)
        #[arg(short, long, default_value = "10G")]
        size: String,
        /// key=value creation options; override the policy's options
        #[arg(long = "opt")]
        opts: Vec<String>,
    },
    /// Show volume metadata as JSON
    Get {
        /// Volume as policy/volume
        volume: String,
    },
    /// List volumes of one policy
    List {
        /// Policy name
        policy: String,
    },
    /// List volumes across all policies
    ListAll,
    /// Remove volume metadata
    Remove {
        /// Volume as policy/volume
        volume: String,
        /// Remove even while use locks are held
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum UseCommands {
    /// List use locks
    List {
        /// List snapshot locks instead of mount locks
        #[arg(long)]
        snapshots: bool,
    },
    /// Show one use lock
    Get {
        /// Volume as policy/volume
        volume: String,
        /// Show the snapshot lock instead of the mount lock
        #[arg(long)]
        snapshot: bool,
    },
    /// Forcefully remove a use lock; corrects stuck or failed hosts
    ForceRemove {
        /// Volume as policy/volume
        volume: String,
        /// Remove the snapshot lock instead of the mount lock
        #[arg(long)]
        snapshot: bool,
    },
    /// Wait until the volume's locks free, take them, and run a command
    Exec {
        /// Volume as policy/volume
        volume: String,
        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Lease TTL in seconds; defaults to the policy's setting
        #[arg(long)]
        ttl: Option<u64>,
        /// Command to run while holding the lock
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

/// Parse a human-readable size string (e.g. "10G", "1T", "500M") into bytes.
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num, multiplier) = if let Some(n) = s.strip_suffix('T') {
        (n, 1024 * 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else {
        // Assume bytes if no suffix
        (s, 1)
    };
    let value: u64 = num
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid size: '{s}'"))?;
    Ok(value * multiplier)
}

/// Format bytes as a human-readable size string.
fn format_size(bytes: u64) -> String {
    const TIB: u64 = 1024 * 1024 * 1024 * 1024;
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;

    if bytes >= TIB {
        format!("{:.1} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn parse_opts(opts: &[String]) -> Result<HashMap<String, String>> {
    opts.iter()
        .map(|opt| {
            opt.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow::anyhow!("Invalid option '{opt}', expected key=value"))
        })
        .collect()
}

fn class_flag(snapshot: bool) -> LockClass {
    if snapshot {
        LockClass::Snapshot
    } else {
        LockClass::Mount
    }
}

fn print_use_table(records: &[UseRecord]) {
    if records.is_empty() {
        println!("No uses found");
        return;
    }
    println!(
        "{:<30} {:<10} {:<25} {:<20} {:<8}",
        "VOLUME", "CLASS", "HOLDER", "ACQUIRED", "TTL"
    );
    println!("{}", "-".repeat(96));
    for record in records {
        println!(
            "{:<30} {:<10} {:<25} {:<20} {:<8}",
            record.volume.to_string(),
            record.class.to_string(),
            record.holder.to_string(),
            record.acquired_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            format!("{}s", record.ttl_secs),
        );
    }
}

fn print_use_record(record: &UseRecord) {
    println!("Use: {} ({})", record.volume, record.class);
    println!("Holder:      {}", record.holder);
    println!("Acquired At: {}", record.acquired_at.to_rfc3339());
    println!("Lease:       {}", record.lease);
    println!("TTL:         {}s", record.ttl_secs);
}

async fn read_policy_stdin() -> Result<Policy> {
    let mut raw = String::new();
    tokio::io::stdin()
        .read_to_string(&mut raw)
        .await
        .context("reading stdin")?;
    serde_json::from_str(&raw).context("parsing policy JSON from stdin")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let code = run(args).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run(args: Args) -> Result<i32> {
    let config = Config {
        store: StoreConfig {
            endpoints: args.etcd.clone(),
            prefix: args.prefix.clone(),
        },
        lock: LockConfig::default(),
    };
    let store = Arc::new(
        EtcdLeaseStore::connect(&config.store.endpoints)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to store: {e}"))?,
    );
    let meta = MetadataClient::new(
        Arc::clone(&store),
        config.store.prefix.clone(),
        config.lock.default_ttl(),
    );
    let manager = UseLockManager::new(
        Arc::clone(&store),
        config.store.prefix.clone(),
        HolderId::local(),
    );

    match args.command {
        Commands::Policy { action } => match action {
            PolicyCommands::Upload { name } => {
                let policy = read_policy_stdin().await?;
                let revision = meta.upload_policy(&name, &policy).await?;
                println!("Policy '{name}' uploaded (revision {revision})");
            }
            PolicyCommands::Get { name } => {
                let policy = meta.get_policy(&name).await?;
                println!("{}", serde_json::to_string_pretty(&policy)?);
            }
            PolicyCommands::List => {
                for name in meta.list_policies().await? {
                    println!("{name}");
                }
            }
            PolicyCommands::Delete { name } => {
                meta.delete_policy(&name).await?;
                println!("Policy '{name}' deleted");
            }
            PolicyCommands::History { action } => match action {
                PolicyHistoryCommands::List { name } => {
                    for revision in meta.policy_revisions(&name).await? {
                        println!("{revision}");
                    }
                }
                PolicyHistoryCommands::Get { name, revision } => {
                    let policy = meta.get_policy_revision(&name, revision).await?;
                    println!("{}", serde_json::to_string_pretty(&policy)?);
                }
            },
        },
        Commands::Volume { action } => match action {
            VolumeCommands::Create { volume, size, opts } => {
                let volume: VolumeId = volume.parse()?;
                // Creation options come from the policy, overridden per-call
                let policy = meta.get_policy(&volume.policy).await?;
                let mut record = VolumeMeta::new(volume.clone(), parse_size(&size)?);
                record.options = policy.options;
                record.options.extend(parse_opts(&opts)?);
                meta.create_volume(&record).await?;
                println!("Volume {volume} created ({})", format_size(record.size_bytes));
            }
            VolumeCommands::Get { volume } => {
                let record = meta.get_volume(&volume.parse()?).await?;
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
            VolumeCommands::List { policy } => {
                for record in meta.list_volumes(&policy).await? {
                    println!("{}", record.volume);
                }
            }
            VolumeCommands::ListAll => {
                for record in meta.list_all_volumes().await? {
                    println!("{}", record.volume);
                }
            }
            VolumeCommands::Remove { volume, force } => {
                let volume: VolumeId = volume.parse()?;
                meta.remove_volume(&volume, force).await?;
                println!("Volume {volume} removed");
            }
        },
        Commands::Use { action } => match action {
            UseCommands::List { snapshots } => {
                let records = manager
                    .list(&UseFilter {
                        class: Some(class_flag(snapshots)),
                        ..Default::default()
                    })
                    .await?;
                print_use_table(&records);
            }
            UseCommands::Get { volume, snapshot } => {
                let record = manager
                    .get(&volume.parse()?, class_flag(snapshot))
                    .await?;
                print_use_record(&record);
            }
            UseCommands::ForceRemove { volume, snapshot } => {
                let volume: VolumeId = volume.parse()?;
                let class = class_flag(snapshot);
                manager.force_release(&volume, class).await?;
                println!("Use {volume} ({class}) force-removed");
            }
            UseCommands::Exec {
                volume,
                timeout,
                ttl,
                command,
            } => {
                let volume: VolumeId = volume.parse()?;
                if !meta.volume_exists(&volume).await? {
                    anyhow::bail!("Volume not found: {volume}");
                }
                let ttl = match ttl {
                    Some(secs) => Duration::from_secs(secs),
                    None => meta.default_lock_ttl(&volume.policy).await?,
                };
                return exec_command(&manager, &volume, ttl, timeout, &config.lock, command).await;
            }
        },
    }

    Ok(0)
}

/// Run a command under the volume's mount lock. The mount lock's
/// cross-class guard means both lock classes are free at acquisition.
async fn exec_command(
    manager: &UseLockManager<EtcdLeaseStore>,
    volume: &VolumeId,
    ttl: Duration,
    timeout: Option<u64>,
    lock_config: &LockConfig,
    command: Vec<String>,
) -> Result<i32> {
    let (program, rest) = command
        .split_first()
        .map(|(p, r)| (p.clone(), r.to_vec()))
        .context("no command given")?;

    let options = ExecOptions {
        ttl,
        wait_timeout: timeout.map(Duration::from_secs),
        poll_interval: lock_config.poll_interval(),
    };
    let cancel = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    let result = manager
        .wait_then_exec(volume, LockClass::Mount, options, cancel, move || async move {
            tokio::process::Command::new(&program)
                .args(&rest)
                .kill_on_drop(true)
                .status()
                .await
        })
        .await;

    Ok(match result {
        Ok(Ok(status)) => status.code().unwrap_or(1),
        Ok(Err(e)) => {
            eprintln!("{}", volguard_common::UseError::ActionFailed(e.to_string()));
            EXIT_SPAWN_FAILED
        }
        Err(ExecError::WaitTimeout) => {
            eprintln!("Timed out waiting for use lock on {volume}");
            EXIT_WAIT_TIMEOUT
        }
        Err(ExecError::Cancelled) => {
            eprintln!("Interrupted while waiting for use lock on {volume}");
            EXIT_INTERRUPTED
        }
        Err(ExecError::LeaseLost) => {
            eprintln!("Use lease on {volume} was lost; command aborted");
            EXIT_LEASE_LOST
        }
        Err(e) => return Err(e.into()),
    })
}
