use crate::error::ClientError;
use clap::{Parser, Subcommand};
use rhizo_common::endpoint::Endpoint;
use rhizo_common::keys::{self, PublicKey};
use rhizo_common::session::ClientSecurity;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line tool for a rhizosrv server.
#[derive(Parser)]
#[command(name = "rhizofs", about = "rhizofs client")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Server endpoint override (`ipc://`, `tcp://`, `vmci://`).
    #[arg(short = 'e', long, global = true)]
    pub endpoint: Option<String>,

    /// Expected server public key (Base58 or key file); enables encryption.
    #[arg(short = 'p', long, global = true)]
    pub server_key: Option<String>,

    /// This client's key pair name, for servers with an allowlist.
    #[arg(short = 'k', long, global = true)]
    pub keypair: Option<PathBuf>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available subcommands. Paths are relative to the served root.
#[derive(Subcommand)]
pub enum Commands {
    /// Check that the server answers.
    Ping,
    /// Show attributes of a path.
    Stat {
        /// Path to inspect.
        path: String,
    },
    /// List a directory.
    Ls {
        /// Directory to list.
        #[arg(default_value = "/")]
        path: String,
    },
    /// Create a directory.
    Mkdir {
        /// Directory to create.
        path: String,
        /// Permission bits, octal.
        #[arg(short, long, default_value = "755", value_parser = parse_octal)]
        mode: u32,
    },
    /// Remove an empty directory.
    Rmdir {
        /// Directory to remove.
        path: String,
    },
    /// Remove a file or symlink.
    Rm {
        /// Path to remove.
        path: String,
    },
    /// Rename or move a path.
    Mv {
        /// Existing path.
        from: String,
        /// New path.
        to: String,
    },
    /// Create a hard link, or a symlink with `-s`.
    Ln {
        /// Create a symbolic link.
        #[arg(short, long)]
        symbolic: bool,
        /// Existing file, or the symlink content with `-s`.
        target: String,
        /// Name of the new link.
        link: String,
    },
    /// Print the content of a symlink.
    Readlink {
        /// Symlink to read.
        path: String,
    },
    /// Set the length of a file.
    Truncate {
        /// File to resize.
        path: String,
        /// New length in bytes.
        size: u64,
    },
    /// Set permission bits.
    Chmod {
        /// Permission bits, octal.
        #[arg(value_parser = parse_octal)]
        mode: u32,
        /// Path to change.
        path: String,
    },
    /// Create a file or update its times.
    Touch {
        /// File to touch.
        path: String,
    },
    /// Show filesystem statistics.
    Statfs,
    /// Download a remote file.
    Get {
        /// Remote file.
        remote: String,
        /// Local destination; stdout when omitted.
        local: Option<PathBuf>,
    },
    /// Upload a local file.
    Put {
        /// Local file, or `-` for stdin.
        local: PathBuf,
        /// Remote destination.
        remote: String,
        /// Permission bits, octal.
        #[arg(short, long, default_value = "644", value_parser = parse_octal)]
        mode: u32,
    },
}

fn parse_octal(text: &str) -> Result<u32, String> {
    u32::from_str_radix(text.trim_start_matches("0o"), 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| format!("invalid mode {text:?}: expected octal permission bits"))
}

/// Client settings loaded from defaults, file and environment.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Server endpoint URI (`ipc://`, `tcp://` or `vmci://`).
    pub endpoint: String,
    /// Require an encrypted session.
    pub encrypt: bool,
    /// Expected server public key: Base58 text or a path to a key file.
    pub server_public_key: Option<String>,
    /// Name of this client's key pair (`<name>` and `<name>.secret`).
    /// Without one the client connects anonymously.
    pub keypair: Option<PathBuf>,
    /// Connection timeouts.
    pub timeouts: TimeoutConfig,
}

/// Connection timeouts.
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    /// TCP/ipc connect timeout, in seconds.
    pub connect_s: u64,
    /// Connect plus handshake deadline, in seconds.
    pub handshake_s: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_s: 10,
            handshake_s: 30,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "tcp://127.0.0.1:1234".to_string(),
            encrypt: false,
            server_public_key: None,
            keypair: None,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Settings for `endpoint` with everything else at its default.
    #[must_use]
    pub fn for_endpoint(endpoint: &Endpoint) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            ..Self::default()
        }
    }

    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint.is_empty() {
            return Err("endpoint must not be empty".to_string());
        }
        Endpoint::parse(&self.endpoint).map_err(|e| format!("endpoint: {e}"))?;

        if self.encrypt && self.server_public_key.is_none() {
            return Err("encrypt requires server_public_key".to_string());
        }
        if !self.encrypt && self.keypair.is_some() {
            return Err("keypair requires encrypt".to_string());
        }

        if self.timeouts.connect_s == 0 {
            return Err("timeouts.connect_s must be greater than 0".to_string());
        }
        if self.timeouts.handshake_s == 0 {
            return Err("timeouts.handshake_s must be greater than 0".to_string());
        }
        Ok(())
    }

    /// The parsed endpoint.
    ///
    /// # Errors
    ///
    /// [`ClientError::Config`] if the URI is malformed.
    pub fn endpoint(&self) -> Result<Endpoint, ClientError> {
        Ok(Endpoint::parse(&self.endpoint)?)
    }

    /// Connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.connect_s)
    }

    /// Resolves keys into session settings.
    ///
    /// # Errors
    ///
    /// [`ClientError::Config`] if a key cannot be parsed or loaded.
    pub fn security(&self) -> Result<ClientSecurity, ClientError> {
        let handshake_timeout = Some(Duration::from_secs(self.timeouts.handshake_s));
        if !self.encrypt {
            return Ok(ClientSecurity {
                handshake_timeout,
                ..ClientSecurity::default()
            });
        }
        let server_key = match &self.server_public_key {
            Some(text) => resolve_public_key(text)?,
            None => return Err(ClientError::Config("encrypt requires server_public_key".into())),
        };
        let keypair = self
            .keypair
            .as_deref()
            .map(keys::load_secret)
            .transpose()?;
        Ok(ClientSecurity {
            server_key: Some(server_key),
            keypair,
            handshake_timeout,
        })
    }
}

/// Accepts a key as Base58 text, falling back to reading it from a file.
fn resolve_public_key(text: &str) -> Result<PublicKey, ClientError> {
    if let Ok(key) = text.trim().parse::<PublicKey>() {
        return Ok(key);
    }
    Ok(keys::load_public(Path::new(text))?)
}

/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let defaults = ClientConfig::default();
    let mut builder = config::Config::builder()
        .set_default("endpoint", defaults.endpoint.as_str())?
        .set_default("encrypt", defaults.encrypt)?
        .set_default("timeouts.connect_s", defaults.timeouts.connect_s as i64)?
        .set_default("timeouts.handshake_s", defaults.timeouts.handshake_s as i64)?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else if let Some(config_path) = dirs::config_dir()
        .map(|d| d.join("rhizofs").join("config.toml"))
        .filter(|p| p.exists())
    {
        builder = builder.add_source(config::File::from(config_path));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RHIZOFS")
            .prefix_separator("_")
            .separator("__"),
    );

    let settings = builder.build()?;
    let config: ClientConfig = settings.try_deserialize()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::field_reassign_with_default)]
    use super::*;
    use rhizo_common::keys::KeyPair;
    use tempfile::TempDir;

    #[test]
    fn default_config_passes_validation() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn load_config_with_missing_file_returns_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/rhizofs.toml"))).unwrap();
        assert_eq!(config.endpoint, "tcp://127.0.0.1:1234");
        assert!(!config.encrypt);
        assert_eq!(config.timeouts.handshake_s, 30);
    }

    #[test]
    fn load_config_reads_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "endpoint = \"ipc:///run/rhizo.sock\"\n[timeouts]\nconnect_s = 3\n",
        )
        .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.endpoint, "ipc:///run/rhizo.sock");
        assert_eq!(config.timeouts.connect_s, 3);
        assert_eq!(config.timeouts.handshake_s, 30);
    }

    #[test]
    fn validate_rejects_bad_endpoint() {
        let mut config = ClientConfig::default();
        config.endpoint = "udp://host:1".to_string();
        assert!(config.validate().unwrap_err().contains("endpoint"));
    }

    #[test]
    fn validate_requires_server_key_for_encryption() {
        let mut config = ClientConfig::default();
        config.encrypt = true;
        assert!(config.validate().unwrap_err().contains("server_public_key"));
    }

    #[test]
    fn validate_rejects_keypair_without_encryption() {
        let mut config = ClientConfig::default();
        config.keypair = Some(PathBuf::from("me"));
        assert!(config.validate().unwrap_err().contains("keypair"));
    }

    #[test]
    fn validate_rejects_zero_timeouts() {
        let mut config = ClientConfig::default();
        config.timeouts.connect_s = 0;
        assert!(config.validate().unwrap_err().contains("connect_s"));
    }

    #[test]
    fn security_accepts_inline_and_file_keys() {
        let server = KeyPair::generate().public();
        let mut config = ClientConfig::default();
        config.encrypt = true;
        config.server_public_key = Some(server.to_string());
        assert_eq!(config.security().unwrap().server_key, Some(server));

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server");
        keys::write_public(&path, &server).unwrap();
        config.server_public_key = Some(path.display().to_string());
        assert_eq!(config.security().unwrap().server_key, Some(server));
    }

    #[test]
    fn octal_modes_parse() {
        assert_eq!(parse_octal("644"), Ok(0o644));
        assert_eq!(parse_octal("0o1777"), Ok(0o1777));
        assert!(parse_octal("999").is_err());
        assert!(parse_octal("17777").is_err());
    }

    #[test]
    fn cli_parses_symbolic_link() {
        let cli = Cli::try_parse_from(["rhizofs", "ln", "-s", "target", "/link"]).unwrap();
        match cli.command {
            Commands::Ln { symbolic, target, link } => {
                assert!(symbolic);
                assert_eq!(target, "target");
                assert_eq!(link, "/link");
            }
            _ => panic!("expected ln"),
        }
    }

    #[test]
    fn plaintext_security_has_no_keys() {
        let security = ClientConfig::default().security().unwrap();
        assert!(security.server_key.is_none());
        assert!(security.keypair.is_none());
        assert_eq!(security.handshake_timeout, Some(Duration::from_secs(30)));
    }
}
