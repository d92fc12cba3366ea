//! The daemon process: startup order, serving loop, shutdown and handoff.
//!
//! Startup runs in a fixed order. The process optionally detaches, forks
//! its privileged helper while still single-threaded, drops privileges,
//! and only then starts threads and the tokio runtime.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use libc::{SIGINT, SIGTERM};
use log::{debug, error, info, warn};
use nix::sys::stat;
use nix::unistd::{self, fork, ForkResult};
use signal_hook::iterator::Signals;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::config::DaemonConfig;
use super::constants::{
    ACCEPT_POLL_INTERVAL, HELPER_PING_INTERVAL, PID_FILE_NAME, RESTART_POLL_INTERVAL,
    TAKEOVER_SOCKET_ENV,
};
use super::error::HelperError;
use super::hooks::{MemorySessionLayer, RegistryService, SessionLayer};
use super::instance::{process_exists, InstanceManager, InstanceRecord};
use super::paths;
use super::privhelper::protocol::NfsServer;
use super::privhelper::{
    drop_privileges, spawn_helper, Credentials, ForkedConnector, HelperClient, HelperConnector,
    HelperPolicy, MountOptions, SocketConnector,
};
use super::registry::{MountInfo, MountRegistry, SessionKind};
use super::supervisor::Deadline;
use super::takeover::{Handoff, TakeoverClient, TakeoverListener, TakeoverServer};

/// A Unix daemon process manager.
///
/// Detaches the process from its terminal with the classic double fork.
pub struct Daemon {
    pid_file: Option<PathBuf>,
    work_dir: PathBuf,
}

impl Daemon {
    /// Creates a new daemon instance.
    ///
    /// # Arguments
    ///
    /// * `pid_file` - Where to write the daemon's process ID, if anywhere
    /// * `work_dir` - Working directory for the daemon process
    pub fn new(pid_file: Option<PathBuf>, work_dir: PathBuf) -> Self {
        Self { pid_file, work_dir }
    }

    /// Detaches the current process.
    ///
    /// Only the grandchild returns; both parents exit with status 0.
    ///
    /// # Returns
    ///
    /// * `Ok(())` in the detached process
    /// * `Err` if any step of the detach failed
    pub fn start(&self) -> Result<()> {
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child: _ }) => std::process::exit(0),
            Ok(ForkResult::Child) => {
                unistd::setsid()?;

                // Second fork: prevent reacquiring a terminal
                match unsafe { fork() } {
                    Ok(ForkResult::Parent { child: _ }) => std::process::exit(0),
                    Ok(ForkResult::Child) => {
                        stat::umask(stat::Mode::from_bits_truncate(0o022));
                        std::env::set_current_dir(&self.work_dir)?;
                        self.close_file_descriptors()?;
                        self.write_pid_file()?;
                        info!("daemon detached (pid {})", std::process::id());
                        Ok(())
                    }
                    Err(err) => {
                        error!("Second fork failed: {}", err);
                        Err(err.into())
                    }
                }
            }
            Err(err) => {
                error!("First fork failed: {}", err);
                Err(err.into())
            }
        }
    }

    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file {
            let mut file = File::create(pid_file)?;
            writeln!(file, "{}", std::process::id())?;
        }
        Ok(())
    }

    fn close_file_descriptors(&self) -> Result<()> {
        let null_file = File::open("/dev/null")?;
        let null_fd = null_file.as_raw_fd();
        for fd in 0..3 {
            unistd::dup2(null_fd, fd)?;
        }
        Ok(())
    }
}

/// An initial mount given as `PATH:KIND`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub path: PathBuf,
    pub kind: SessionKind,
}

impl FromStr for MountRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, kind) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected PATH:KIND, got {:?}", s))?;
        if path.is_empty() {
            return Err(format!("missing mount path in {:?}", s));
        }
        Ok(Self {
            path: PathBuf::from(path),
            kind: kind.parse()?,
        })
    }
}

/// A bind mount given as `SOURCE:TARGET`; the target must lie inside one
/// of the daemon's mounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub source: PathBuf,
    pub target: PathBuf,
}

impl FromStr for BindRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((source, target)) if !source.is_empty() && !target.is_empty() => Ok(Self {
                source: PathBuf::from(source),
                target: PathBuf::from(target),
            }),
            _ => Err(format!("expected SOURCE:TARGET, got {:?}", s)),
        }
    }
}

/// Everything `run_daemon` needs.
#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub config: DaemonConfig,
    pub mounts: Vec<MountRequest>,
    pub binds: Vec<BindRequest>,
    /// Predecessor's takeover socket
    pub takeover: Option<PathBuf>,
    pub daemonize: bool,
    /// Command-line arguments a successor is started with
    pub args: Vec<String>,
}

/// Something the serving loop reacts to.
#[derive(Debug)]
pub enum DaemonEvent {
    Signal(i32),
    HandedOff(Handoff),
}

/// How a daemon stopped serving.
#[derive(Debug, PartialEq, Eq)]
pub enum DaemonExit {
    /// Shut down and unmounted this many mounts
    Stopped { unmounted: usize },
    /// A successor owns the mounts
    HandedOff(Handoff),
}

/// One running daemon generation.
pub struct MountDaemon {
    config: DaemonConfig,
    registry: MountRegistry,
    service: Arc<RegistryService>,
    sessions: Arc<MemorySessionLayer>,
    helper: Arc<HelperClient>,
    instances: InstanceManager,
    generation: u32,
    server: Option<Arc<TakeoverServer>>,
    listener: Option<TakeoverListener>,
    events_tx: UnboundedSender<DaemonEvent>,
    events_rx: Option<UnboundedReceiver<DaemonEvent>>,
}

impl MountDaemon {
    /// Creates a daemon with no mounts yet.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated daemon configuration
    /// * `helper` - Connected privileged helper client
    pub fn new(config: DaemonConfig, helper: Arc<HelperClient>) -> Result<Self> {
        let instances = InstanceManager::new(&config.runtime_dir)?;
        let registry = MountRegistry::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            service: Arc::new(RegistryService::new(registry.clone())),
            sessions: Arc::new(MemorySessionLayer::new()),
            registry,
            config,
            helper,
            instances,
            generation: 0,
            server: None,
            listener: None,
            events_tx,
            events_rx: Some(events_rx),
        })
    }

    pub fn registry(&self) -> &MountRegistry {
        &self.registry
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Sender the serving loop listens on.
    pub fn notifier(&self) -> UnboundedSender<DaemonEvent> {
        self.events_tx.clone()
    }

    /// Takes over every mount of the predecessor listening on `socket`.
    ///
    /// # Returns
    ///
    /// The number of inherited mounts. A failed takeover leaves the
    /// predecessor serving and this daemon empty.
    pub fn take_over(&mut self, socket: &Path) -> Result<usize> {
        let predecessor = self.instances.get(&self.config.instance)?;
        let client = TakeoverClient::new(
            self.registry.clone(),
            self.service.clone(),
            self.sessions.clone(),
        )
        .with_helper(self.helper.clone())
        .with_timeout(self.config.takeover_timeout());

        let count = client.take_over(socket)?;
        self.generation = predecessor.map(|r| r.generation + 1).unwrap_or(1);
        info!(
            "instance {} generation {} took over {} mounts",
            self.config.instance, self.generation, count
        );
        Ok(count)
    }

    /// Mounts a new session through the helper and starts serving it.
    pub fn mount(&self, request: &MountRequest) -> Result<()> {
        let path = paths::normalize(&request.path)?;

        // NFS sessions are served from a loopback socket owned by the daemon.
        let (options, nfs_socket) = match request.kind {
            SessionKind::Fuse => (MountOptions::default(), None),
            SessionKind::Nfs => {
                let listener = TcpListener::bind(("127.0.0.1", 0))
                    .context("binding loopback NFS socket")?;
                let port = listener.local_addr()?.port();
                let options = MountOptions {
                    nfs_server: Some(NfsServer {
                        addr: "127.0.0.1".to_string(),
                        nfsd_port: port,
                        mountd_port: port,
                    }),
                    ..MountOptions::default()
                };
                (options, Some(listener))
            }
        };

        let handle = match (self.helper.mount(&path, request.kind, options)?, nfs_socket) {
            (Some(handle), _) => handle,
            (None, Some(listener)) => OwnedFd::from(listener),
            (None, None) => return Err(HelperError::MissingHandle.into()),
        };
        self.registry
            .insert(MountInfo::new(path.clone(), request.kind, handle))?;
        if let Some(Err(e)) = self
            .registry
            .with_mount(&path, |info| self.sessions.attach_session(info))
        {
            return Err(e.context(format!("attaching session for {:?}", path)));
        }
        info!("serving {} mount at {:?}", request.kind, path);
        Ok(())
    }

    /// Layers a bind mount inside one of this daemon's mounts.
    pub fn bind(&self, request: &BindRequest) -> Result<()> {
        let target = paths::normalize(&request.target)?;
        let owner = self
            .registry
            .paths()
            .into_iter()
            .filter(|mount| target.starts_with(mount) && &target != mount)
            .max_by_key(|mount| mount.components().count())
            .ok_or_else(|| anyhow!("bind target {:?} is not inside a mount", target))?;

        self.helper.bind_mount(&request.source, &target)?;
        self.registry
            .with_mount(&owner, |info| info.metadata.bind_mounts.push(target.clone()));
        info!("bound {:?} onto {:?}", request.source, target);
        Ok(())
    }

    /// Publishes the instance record and starts accepting successors.
    ///
    /// # Arguments
    ///
    /// * `args` - Command line a successor should be started with
    pub fn publish(&mut self, args: Vec<String>) -> Result<()> {
        let socket = self.config.takeover_socket();
        let mut record =
            InstanceRecord::for_current_process(&self.config.instance, socket.clone(), self.generation);
        record.args = args;
        record.mounts = self.registry.kinds();
        self.instances.register(&record)?;

        let server = Arc::new(
            TakeoverServer::new(
                self.registry.clone(),
                self.service.clone(),
                self.sessions.clone(),
            )
            .with_helper(self.helper.clone())
            .with_ack_timeout(self.config.ack_timeout()),
        );
        let events = self.events_tx.clone();
        let listener = TakeoverListener::spawn(&socket, server.clone(), move |handoff| {
            if events.send(DaemonEvent::HandedOff(handoff)).is_err() {
                warn!("handoff committed after the serving loop exited");
            }
        })?;
        self.server = Some(server);
        self.listener = Some(listener);
        Ok(())
    }

    /// Applies one event.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(exit))` once the daemon is done serving
    /// * `Ok(None)` to keep serving, e.g. while a takeover is in flight
    pub fn handle_event(&mut self, event: DaemonEvent) -> Result<Option<DaemonExit>> {
        match event {
            DaemonEvent::HandedOff(handoff) => Ok(Some(self.handed_off(handoff))),
            DaemonEvent::Signal(signal) => {
                info!("received signal {}, shutting down", signal);
                self.try_stop()
            }
        }
    }

    fn handed_off(&mut self, handoff: Handoff) -> DaemonExit {
        if let Some(listener) = self.listener.take() {
            listener.stop();
        }
        info!(
            "handed {} mounts to the next generation (protocol v{})",
            handoff.mounts.len(),
            handoff.version
        );
        self.helper.disconnect();
        DaemonExit::HandedOff(handoff)
    }

    /// Shuts down unless a takeover holds the attempt slot.
    fn try_stop(&mut self) -> Result<Option<DaemonExit>> {
        if let Some(server) = &self.server {
            if !server.try_begin() {
                info!("takeover in progress; stopping once it settles");
                return Ok(None);
            }
        }
        let unmounted = self.shutdown()?;
        Ok(Some(DaemonExit::Stopped { unmounted }))
    }

    /// Stops accepting successors, unmounts everything and removes the
    /// instance record if it is still ours.
    pub fn shutdown(&mut self) -> Result<usize> {
        if let Some(listener) = self.listener.take() {
            listener.stop();
        }

        let mut unmounted = 0;
        for path in self.registry.paths() {
            if let Err(e) = self.sessions.detach_session(&path) {
                warn!("detaching {:?}: {:#}", path, e);
            }
            match self.helper.unmount(&path, true) {
                Ok(true) => unmounted += 1,
                Ok(false) => warn!("{:?} was no longer mounted", path),
                Err(e) => error!("failed to unmount {:?}: {}", path, e),
            }
            // Dropping the entry closes the session handle.
            if let Err(e) = self.registry.remove(&path) {
                debug!("{}", e);
            }
        }

        self.instances
            .remove_if_owner(&self.config.instance, std::process::id() as i32)?;
        self.helper.disconnect();
        info!("unmounted {} mounts", unmounted);
        Ok(unmounted)
    }

    /// Serves until a signal or a committed takeover.
    pub fn run(mut self) -> Result<DaemonExit> {
        let events = self
            .events_rx
            .take()
            .ok_or_else(|| anyhow!("daemon is already running"))?;
        forward_signals(self.events_tx.clone())?;
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.event_loop(events))
    }

    async fn event_loop(
        &mut self,
        mut events: UnboundedReceiver<DaemonEvent>,
    ) -> Result<DaemonExit> {
        let mut health = tokio::time::interval(HELPER_PING_INTERVAL);
        health.tick().await;
        let mut stopping = false;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(DaemonEvent::Signal(signal)) => {
                        info!("received signal {}, shutting down", signal);
                        stopping = true;
                    }
                    Some(event) => {
                        if let Some(exit) = self.handle_event(event)? {
                            return Ok(exit);
                        }
                    }
                    None => stopping = true,
                },
                _ = health.tick() => {
                    let helper = self.helper.clone();
                    match tokio::task::spawn_blocking(move || helper.ping()).await {
                        Ok(Ok(())) => debug!("helper answered ping"),
                        Ok(Err(e)) => error!("privileged helper check failed: {}", e),
                        Err(e) => error!("helper check panicked: {}", e),
                    }
                }
            }

            if stopping {
                if let Some(exit) = self.try_stop()? {
                    return Ok(exit);
                }
                tokio::time::sleep(ACCEPT_POLL_INTERVAL).await;
            }
        }
    }
}

fn forward_signals(events: UnboundedSender<DaemonEvent>) -> Result<()> {
    let mut signals = Signals::new(&[SIGINT, SIGTERM])?;
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                if events.send(DaemonEvent::Signal(signal)).is_err() {
                    break;
                }
            }
        })?;
    Ok(())
}

/// Picks how to reach the helper: a standalone socket when configured,
/// otherwise a forked child. Forking drops this process's privileges.
fn helper_connector(config: &DaemonConfig) -> Result<Box<dyn HelperConnector>> {
    if let Some(socket) = &config.helper_socket {
        return Ok(Box::new(SocketConnector::new(socket.clone())));
    }
    if !unistd::geteuid().is_root() {
        return Err(HelperError::Unavailable {
            attempts: 0,
            last: "not running as root and no helper socket configured".to_string(),
        }
        .into());
    }
    let owner = Credentials::invoking_user();
    let (process, channel) = spawn_helper(HelperPolicy::new(&config.mount_roots), owner)?;
    drop_privileges(owner)?;
    Ok(Box::new(ForkedConnector::new(process, channel)))
}

fn open_log_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {:?}", path))
}

/// Starts a daemon and serves until it stops or hands off.
pub fn run_daemon(options: DaemonOptions) -> Result<DaemonExit> {
    let config = options.config;
    config.validate()?;
    fs::create_dir_all(config.instance_dir())?;

    if options.daemonize {
        // A successor must not overwrite the pid file its predecessor still owns.
        let pid_file = match options.takeover {
            Some(_) => None,
            None => Some(config.instance_dir().join(PID_FILE_NAME)),
        };
        Daemon::new(pid_file, PathBuf::from("/")).start()?;
    }

    let log_file = config.log_file.as_deref().map(open_log_file).transpose()?;
    if let (Some(file), true) = (&log_file, options.daemonize) {
        unistd::dup2(file.as_raw_fd(), libc::STDERR_FILENO)?;
    }

    let connector = helper_connector(&config)?;
    info!("connecting to privileged helper via {}", connector.describe());
    let helper = Arc::new(HelperClient::connect(
        connector,
        config.helper_backoff(),
        config.helper_timeout(),
    )?);
    if let Some(file) = &log_file {
        helper.set_log_file(&OwnedFd::from(file.try_clone()?))?;
    }
    helper.set_daemon_timeout(config.helper_timeout())?;

    let mut daemon = MountDaemon::new(config, helper)?;
    match &options.takeover {
        Some(socket) => {
            daemon.take_over(socket)?;
        }
        None => {
            let started = options
                .mounts
                .iter()
                .try_for_each(|request| daemon.mount(request))
                .and_then(|()| options.binds.iter().try_for_each(|b| daemon.bind(b)));
            if let Err(e) = started {
                error!("startup failed: {:#}", e);
                daemon.shutdown()?;
                return Err(e);
            }
        }
    }

    daemon.publish(options.args)?;
    daemon.run()
}

/// Drops `--takeover <path>` from a daemon command line so the record can
/// start successors with it.
pub fn successor_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut kept = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--takeover" {
            args.next();
        } else if !arg.starts_with("--takeover=") {
            kept.push(arg);
        }
    }
    kept
}

/// Starts a successor for a running instance and waits for the old
/// process to exit.
///
/// # Arguments
///
/// * `instances` - Where the instance's record lives
/// * `name` - Instance to restart
/// * `timeout` - How long to wait for the predecessor to exit
///
/// # Returns
///
/// The successor's process ID.
pub fn restart(instances: &InstanceManager, name: &str, timeout: Duration) -> Result<u32> {
    let record = instances
        .get(name)?
        .ok_or_else(|| anyhow!("instance not found: {}", name))?;
    if !record.is_running() {
        bail!("instance {} (pid {}) is not running", name, record.pid);
    }

    let exe = std::env::current_exe()?;
    let mut child = Command::new(exe)
        .args(&record.args)
        .env(TAKEOVER_SOCKET_ENV, &record.takeover_socket)
        .spawn()
        .context("starting successor")?;
    info!(
        "started successor {} for instance {} (predecessor pid {})",
        child.id(),
        name,
        record.pid
    );

    let deadline = Deadline::after(timeout);
    let mut detached = false;
    while process_exists(record.pid) {
        if deadline.expired() {
            bail!(
                "predecessor {} still running after {:?}",
                record.pid,
                timeout
            );
        }
        if !detached {
            if let Some(status) = child.try_wait()? {
                // A daemonizing successor's launcher exits 0 right away.
                if !status.success() {
                    bail!("successor exited with {} before taking over", status);
                }
                detached = true;
            }
        }
        thread::sleep(RESTART_POLL_INTERVAL);
    }
    info!("instance {} restarted", name);
    Ok(child.id())
}
