use std::time::Duration;

// Privileged helper protocol
pub const HELPER_PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_HELPER_TIMEOUT: Duration = Duration::from_secs(30);
pub const HELPER_RETRY_ATTEMPTS: u32 = 4;
pub const HELPER_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(100);
pub const HELPER_RETRY_MAX_DELAY: Duration = Duration::from_secs(2);
/// How often a running daemon checks that its helper still answers.
pub const HELPER_PING_INTERVAL: Duration = Duration::from_secs(30);

// Takeover protocol
/// One `Batch` frame with a single final acknowledgement.
pub const TAKEOVER_VERSION_BATCH: u32 = 1;
/// One `Entry` frame per mount, each acknowledged before the next is sent.
pub const TAKEOVER_VERSION_PER_ENTRY: u32 = 2;
pub const SUPPORTED_TAKEOVER_VERSIONS: &[u32] = &[TAKEOVER_VERSION_BATCH, TAKEOVER_VERSION_PER_ENTRY];
pub const DEFAULT_TAKEOVER_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(20);
/// How often the incoming daemon repeats `Ready` while waiting for `Commit`.
pub const READY_RESEND_INTERVAL: Duration = Duration::from_secs(2);
/// Poll interval of the non-blocking takeover accept loop.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

// Framing
pub const FRAME_HEADER_LEN: usize = 4;
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Upper bound on handles attached to a single frame (Linux `SCM_MAX_FD`).
pub const MAX_HANDLES_PER_FRAME: usize = 253;

// Instance layout
pub const RUNTIME_SUBDIR: &str = "leapfrog";
pub const DEFAULT_INSTANCE: &str = "default";
pub const TAKEOVER_SOCKET_NAME: &str = "takeover.sock";
pub const PID_FILE_NAME: &str = "pid";
pub const INSTANCE_RECORD_NAME: &str = "instance.json";
pub const TAKEOVER_SOCKET_ENV: &str = "LEAPFROG_TAKEOVER_SOCKET";
pub const RESTART_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Largest timeout a configuration file may ask for.
pub const MAX_CONFIG_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

// FUSE mount parameters
pub const FUSE_DEVICE: &str = "/dev/fuse";
pub const FUSE_ROOT_MODE: u32 = 0o40000;
pub const FUSE_FS_NAME: &str = "leapfrog";
