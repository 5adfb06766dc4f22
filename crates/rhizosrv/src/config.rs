use clap::Parser;
use rhizo_common::Endpoint;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for `--workers`.
pub const MAX_WORKERS: usize = 200;

/// Upper bound for `--max-transfers`.
pub const MAX_TRANSFERS_LIMIT: usize = 1024;

/// CLI arguments for the server.
#[derive(Parser, Debug, Clone)]
#[command(name = "rhizosrv")]
#[command(about = "Serve a directory to rhizofs clients")]
#[command(version)]
pub struct Args {
    /// Endpoint to listen on: ipc://<path>, tcp://<host>:<port> or vmci://<cid>:<port>.
    #[arg(env = "RHIZOSRV_ENDPOINT")]
    pub endpoint: Endpoint,
    /// Directory to serve.
    #[arg(env = "RHIZOSRV_DIRECTORY")]
    pub directory: PathBuf,
    /// Require encrypted sessions.
    #[arg(short = 'e', long, env = "RHIZOSRV_ENCRYPT")]
    pub encrypt: bool,
    /// Key pair to use: reads <name> and <name>.secret.
    #[arg(short = 'k', long, env = "RHIZOSRV_KEYFILE")]
    pub keyfile: Option<PathBuf>,
    /// Without --keyfile, write the generated public key to this file.
    #[arg(short = 'P', long, env = "RHIZOSRV_PUBKEYFILE")]
    pub pubkeyfile: Option<PathBuf>,
    /// Only accept clients whose public key is listed in this file.
    #[arg(short = 'a', long, env = "RHIZOSRV_AUTHORIZED_KEYS")]
    pub authorized_keys: Option<PathBuf>,
    /// Maximum number of requests dispatched concurrently.
    #[arg(short = 'n', long, default_value = "5", env = "RHIZOSRV_WORKERS")]
    pub workers: usize,
    /// Maximum concurrent sessions.
    #[arg(long, default_value = "256", env = "RHIZOSRV_MAX_SESSIONS")]
    pub max_sessions: usize,
    /// Handshake timeout in seconds.
    #[arg(long, default_value = "10", env = "RHIZOSRV_HANDSHAKE_TIMEOUT")]
    pub handshake_timeout_secs: u64,
    /// Close sessions without traffic for this many seconds.
    #[arg(long, default_value = "600", env = "RHIZOSRV_IDLE_TIMEOUT")]
    pub idle_timeout_secs: u64,
    /// Abort uploads without a chunk for this many seconds.
    #[arg(long, default_value = "120", env = "RHIZOSRV_TRANSFER_TIMEOUT")]
    pub transfer_timeout_secs: u64,
    /// Maximum uploads one session may have open at once.
    #[arg(long, default_value = "16", env = "RHIZOSRV_MAX_TRANSFERS")]
    pub max_transfers: usize,
    /// On shutdown, wait this long for sessions to finish.
    #[arg(long, default_value = "30", env = "RHIZOSRV_DRAIN_TIMEOUT")]
    pub drain_timeout_secs: u64,
    /// Write the process id to this file while running.
    #[arg(short = 'p', long, env = "RHIZOSRV_PIDFILE")]
    pub pidfile: Option<PathBuf>,
    /// Append log output to this file instead of stderr.
    #[arg(short = 'l', long, env = "RHIZOSRV_LOG_FILE")]
    pub log_file: Option<PathBuf>,
    /// Refuse every modification with ROFS.
    #[arg(long, env = "RHIZOSRV_READ_ONLY")]
    pub read_only: bool,
    /// Serve Prometheus metrics and health checks on this address.
    #[arg(long, env = "RHIZOSRV_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Endpoint to listen on.
    pub endpoint: Endpoint,
    /// Directory to serve.
    pub directory: PathBuf,
    /// Require encrypted sessions.
    pub encrypt: bool,
    /// Key pair name.
    pub keyfile: Option<PathBuf>,
    /// Where to write a generated public key.
    pub pubkeyfile: Option<PathBuf>,
    /// Allowlist file.
    pub authorized_keys: Option<PathBuf>,
    /// Concurrently dispatched requests.
    pub workers: usize,
    /// Concurrent sessions.
    pub max_sessions: usize,
    /// Handshake timeout in seconds.
    pub handshake_timeout_secs: u64,
    /// Session idle timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Upload idle timeout in seconds.
    pub transfer_timeout_secs: u64,
    /// Open uploads per session.
    pub max_transfers: usize,
    /// Shutdown drain timeout in seconds.
    pub drain_timeout_secs: u64,
    /// Pidfile path.
    pub pidfile: Option<PathBuf>,
    /// Log file path.
    pub log_file: Option<PathBuf>,
    /// Serve read-only.
    pub read_only: bool,
    /// Metrics listen address.
    pub metrics_addr: Option<SocketAddr>,
}

impl ServerConfig {
    /// Defaults for serving `directory` on `endpoint`, as the CLI would.
    #[must_use]
    pub fn new(endpoint: Endpoint, directory: impl Into<PathBuf>) -> Self {
        Self {
            endpoint,
            directory: directory.into(),
            encrypt: false,
            keyfile: None,
            pubkeyfile: None,
            authorized_keys: None,
            workers: 5,
            max_sessions: 256,
            handshake_timeout_secs: 10,
            idle_timeout_secs: 600,
            transfer_timeout_secs: 120,
            max_transfers: 16,
            drain_timeout_secs: 30,
            pidfile: None,
            log_file: None,
            read_only: false,
            metrics_addr: None,
        }
    }

    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be greater than 0".to_string());
        }
        if self.workers > MAX_WORKERS {
            return Err(format!("workers exceeds maximum ({MAX_WORKERS})"));
        }

        if self.max_sessions == 0 {
            return Err("max_sessions must be greater than 0".to_string());
        }
        if self.max_sessions > 100_000 {
            return Err("max_sessions exceeds reasonable limit (100,000)".to_string());
        }

        // Timeouts
        if self.handshake_timeout_secs == 0 {
            return Err("handshake_timeout must be greater than 0".to_string());
        }
        if self.handshake_timeout_secs > 300 {
            return Err("handshake_timeout exceeds reasonable limit (300 seconds)".to_string());
        }
        if self.idle_timeout_secs == 0 {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout_secs > 86_400 {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }
        if self.transfer_timeout_secs == 0 {
            return Err("transfer_timeout must be greater than 0".to_string());
        }
        if self.transfer_timeout_secs > 86_400 {
            return Err("transfer_timeout exceeds reasonable limit (86400 seconds)".to_string());
        }
        if self.max_transfers == 0 {
            return Err("max_transfers must be greater than 0".to_string());
        }
        if self.max_transfers > MAX_TRANSFERS_LIMIT {
            return Err(format!("max_transfers exceeds maximum ({MAX_TRANSFERS_LIMIT})"));
        }
        if self.drain_timeout_secs > 3600 {
            return Err("drain_timeout exceeds reasonable limit (3600 seconds)".to_string());
        }

        // Key options only make sense for encrypted sessions
        if !self.encrypt {
            if self.keyfile.is_some() {
                return Err("keyfile requires encrypt".to_string());
            }
            if self.pubkeyfile.is_some() {
                return Err("pubkeyfile requires encrypt".to_string());
            }
            if self.authorized_keys.is_some() {
                return Err("authorized_keys requires encrypt".to_string());
            }
        }
        if self.keyfile.is_some() && self.pubkeyfile.is_some() {
            return Err("pubkeyfile is only used with a generated key pair, not with keyfile".to_string());
        }
        Ok(())
    }

    /// Handshake timeout.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Session idle timeout.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Upload idle timeout.
    #[must_use]
    pub const fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    /// Shutdown drain timeout.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            endpoint: args.endpoint,
            directory: args.directory,
            encrypt: args.encrypt,
            keyfile: args.keyfile,
            pubkeyfile: args.pubkeyfile,
            authorized_keys: args.authorized_keys,
            workers: args.workers,
            max_sessions: args.max_sessions,
            handshake_timeout_secs: args.handshake_timeout_secs,
            idle_timeout_secs: args.idle_timeout_secs,
            transfer_timeout_secs: args.transfer_timeout_secs,
            max_transfers: args.max_transfers,
            drain_timeout_secs: args.drain_timeout_secs,
            pidfile: args.pidfile,
            log_file: args.log_file,
            read_only: args.read_only,
            metrics_addr: args.metrics_addr,
        }
    }
}
