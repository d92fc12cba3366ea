use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use leapfrog::modules::config::{default_runtime_dir, DaemonConfig};
use leapfrog::modules::constants::{DEFAULT_INSTANCE, TAKEOVER_SOCKET_ENV};
use leapfrog::modules::daemon::{
    restart, run_daemon, successor_args, BindRequest, DaemonExit, DaemonOptions, MountRequest,
};
use leapfrog::modules::error::{HelperError, TakeoverError};
use leapfrog::modules::instance::InstanceManager;
use leapfrog::modules::privhelper::{restrict_helper, HelperListener, HelperPolicy};
use log::{error, info, LevelFilter};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a daemon instance
    Daemon {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Instance name
        #[arg(short, long)]
        instance: Option<String>,
        /// Base directory for instance state
        #[arg(long)]
        runtime_dir: Option<PathBuf>,
        /// Allow mounts under this directory (repeatable)
        #[arg(long = "mount-root")]
        mount_roots: Vec<PathBuf>,
        /// Mount PATH with session KIND (fuse or nfs) at startup (repeatable)
        #[arg(short, long = "mount", value_name = "PATH:KIND")]
        mounts: Vec<MountRequest>,
        /// Bind SOURCE onto TARGET inside a mount (repeatable)
        #[arg(short, long = "bind", value_name = "SOURCE:TARGET")]
        binds: Vec<BindRequest>,
        /// Take over the mounts of the daemon listening on this socket
        #[arg(short, long)]
        takeover: Option<PathBuf>,
        /// Use a standalone helper at this socket instead of forking one
        #[arg(long)]
        helper_socket: Option<PathBuf>,
        /// Log file for the daemon and its helper
        #[arg(long)]
        log_file: Option<PathBuf>,
        /// Detach from the terminal
        #[arg(short, long)]
        daemonize: bool,
    },
    /// Replace a running instance with a new process without unmounting
    Restart {
        /// Instance name
        #[arg(short, long, default_value = DEFAULT_INSTANCE)]
        instance: String,
        /// Base directory for instance state
        #[arg(long)]
        runtime_dir: Option<PathBuf>,
        /// Seconds to wait for the old process to exit
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
    /// Manage daemon instances
    Instances {
        /// List all instances
        #[arg(short = 'l', long = "list")]
        list: bool,
        /// Stop an instance
        #[arg(short = 'k', long = "kill")]
        kill: bool,
        /// Remove records of instances that are no longer running
        #[arg(short = 'p', long = "purge")]
        purge: bool,
        /// Base directory for instance state
        #[arg(long)]
        runtime_dir: Option<PathBuf>,
        /// Instance name (required for kill and show operations)
        name: Option<String>,
    },
    /// Run a standalone privileged helper on a socket
    Helper {
        /// Socket to listen on
        #[arg(short, long)]
        socket: PathBuf,
        /// Allow mounts under this directory (repeatable)
        #[arg(long = "mount-root", required = true)]
        mount_roots: Vec<PathBuf>,
        /// Accept daemons running as this uid (repeatable)
        #[arg(long = "allow-uid")]
        allow_uids: Vec<u32>,
    },
}

const EXIT_FAILURE: u8 = 1;
const EXIT_TAKEOVER_FAILED: u8 = 2;
const EXIT_HELPER_UNAVAILABLE: u8 = 3;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new().filter_level(log_level).init();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<TakeoverError>().is_some() {
        EXIT_TAKEOVER_FAILED
    } else if let Some(HelperError::Unavailable { .. }) = err.downcast_ref::<HelperError>() {
        EXIT_HELPER_UNAVAILABLE
    } else {
        EXIT_FAILURE
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Daemon {
            config,
            instance,
            runtime_dir,
            mount_roots,
            mounts,
            binds,
            takeover,
            helper_socket,
            log_file,
            daemonize,
        } => {
            let mut config = DaemonConfig::load_or_default(config.as_deref())?;
            if let Some(instance) = instance {
                config.instance = instance;
            }
            if let Some(runtime_dir) = runtime_dir {
                config.runtime_dir = runtime_dir;
            }
            config.mount_roots.extend(mount_roots);
            if helper_socket.is_some() {
                config.helper_socket = helper_socket;
            }
            if log_file.is_some() {
                config.log_file = log_file;
            }
            let takeover =
                takeover.or_else(|| std::env::var_os(TAKEOVER_SOCKET_ENV).map(PathBuf::from));

            info!("Starting leapfrog instance {}...", config.instance);
            let options = DaemonOptions {
                config,
                mounts,
                binds,
                takeover,
                daemonize,
                args: successor_args(std::env::args().skip(1)),
            };
            match run_daemon(options)? {
                DaemonExit::Stopped { unmounted } => {
                    info!("stopped after unmounting {} mounts", unmounted)
                }
                DaemonExit::HandedOff(handoff) => {
                    info!("exiting; {} mounts live on", handoff.mounts.len())
                }
            }
        }
        Commands::Restart {
            instance,
            runtime_dir,
            timeout,
        } => {
            let manager = InstanceManager::new(&runtime_dir.unwrap_or_else(default_runtime_dir))?;
            let pid = restart(&manager, &instance, Duration::from_secs(timeout))?;
            println!("Instance {} now served by pid {}", instance, pid);
        }
        Commands::Instances {
            list,
            kill,
            purge,
            runtime_dir,
            name,
        } => {
            let manager = InstanceManager::new(&runtime_dir.unwrap_or_else(default_runtime_dir))?;
            match (list, kill, purge, name) {
                (true, _, _, _) => {
                    println!("Instances:");
                    for record in manager.list()? {
                        let status = if record.is_running() { "running" } else { "stale" };
                        println!("{} ({})", record.name, status);
                        println!("  PID: {}", record.pid);
                        println!("  Generation: {}", record.generation);
                        println!("  Mounts: {}", record.mounts.len());
                        println!();
                    }
                }
                (_, true, _, Some(name)) => {
                    manager.kill(&name)?;
                    println!("Instance {} signalled to stop", name);
                }
                (_, _, true, _) => {
                    let removed = manager.purge()?;
                    println!("Purged {} stale instances", removed);
                }
                (_, _, _, Some(name)) => match manager.get(&name)? {
                    Some(record) => {
                        println!("Instance Details:");
                        println!("Name: {}", record.name);
                        println!("ID: {}", record.generation_id);
                        println!("PID: {}", record.pid);
                        println!("Generation: {}", record.generation);
                        println!("Takeover socket: {}", record.takeover_socket.display());
                        println!("\nMounts:");
                        for (path, kind) in &record.mounts {
                            println!("  {} ({})", path.display(), kind);
                        }
                    }
                    None => println!("Instance not found: {}", name),
                },
                _ => bail!("Invalid command. Use --help for usage information."),
            }
        }
        Commands::Helper {
            socket,
            mount_roots,
            allow_uids,
        } => {
            let listener = HelperListener::bind(&socket, HelperPolicy::new(&mount_roots), allow_uids)?;
            restrict_helper()?;
            listener.serve_forever()?;
        }
    }

    Ok(())
}
