//! Long-term key material and the authorized-keys allowlist.
//!
//! A principal is identified by an Ed25519 public key. Key pairs live in
//! two files side by side:
//!
//! - `<name>`: the public key, Base58, safe to distribute
//! - `<name>.secret`: the 32-byte secret seed, Base58, mode 0600
//!
//! Sessions never use the Ed25519 keys directly; [`KeyPair::noise_keypair`]
//! and [`PublicKey::to_x25519`] map them onto Curve25519 for the Noise
//! handshake.

use crate::base58::{self, KeyDecodeError, KEY_LEN};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;
use zeroize::Zeroizing;

const SECRET_FILE_PERMS: u32 = 0o600;
const PUBLIC_FILE_PERMS: u32 = 0o644;

/// Suffix appended to a key name to form the secret file path.
pub const SECRET_SUFFIX: &str = ".secret";

/// Errors raised while reading or writing key files.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Underlying filesystem error.
    #[error("{path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// OS error.
        source: std::io::Error,
    },
    /// The secret file is readable by group or others.
    #[error("{path}: permissions {mode:o} are too open, expected 0600")]
    Permissions {
        /// Secret file.
        path: PathBuf,
        /// Offending mode bits.
        mode: u32,
    },
    /// The file does not contain a valid Base58 key.
    #[error("{path}: {source}")]
    Decode {
        /// File involved.
        path: PathBuf,
        /// Decoding failure.
        source: KeyDecodeError,
    },
    /// The 32 bytes are not a valid Ed25519 public key.
    #[error("not a valid ed25519 public key")]
    InvalidKey,
    /// A key pair was requested but the secret half does not exist.
    #[error("secret key file {0} not found")]
    MissingSecret(PathBuf),
    /// The public file does not match the secret file beside it.
    #[error("{0} does not match its secret key")]
    Mismatch(PathBuf),
    /// Refused to overwrite an existing key file.
    #[error("{0} already exists")]
    AlreadyExists(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> KeyError + '_ {
    move |source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A distributable Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    /// Validates 32 bytes as an Ed25519 point.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidKey`] for bytes that are not a curve point.
    pub fn from_bytes(bytes: &[u8; KEY_LEN]) -> Result<Self, KeyError> {
        VerifyingKey::from_bytes(bytes).map_err(|_| KeyError::InvalidKey)?;
        Ok(Self(*bytes))
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// The Curve25519 public key used as the Noise static key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidKey`] if the bytes are not a curve point.
    pub fn to_x25519(&self) -> Result<[u8; KEY_LEN], KeyError> {
        let vk = VerifyingKey::from_bytes(&self.0).map_err(|_| KeyError::InvalidKey)?;
        Ok(vk.to_montgomery().to_bytes())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base58::encode(&self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = base58::decode_key(s).map_err(|source| KeyError::Decode {
            path: PathBuf::new(),
            source,
        })?;
        Self::from_bytes(&bytes)
    }
}

/// A public/secret pair belonging to one principal.
///
/// The secret is zeroized on drop.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generates a fresh pair from the OS random source.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuilds a pair from its 32-byte secret seed.
    #[must_use]
    pub fn from_secret_bytes(secret: &[u8; KEY_LEN]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// The public half.
    #[must_use]
    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    /// The secret seed. Never send this anywhere.
    #[must_use]
    pub fn secret_bytes(&self) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Curve25519 static key pair for Noise, via the birational map.
    #[must_use]
    pub fn noise_keypair(&self) -> snow::Keypair {
        snow::Keypair {
            private: self.signing.to_scalar_bytes().to_vec(),
            public: self.signing.verifying_key().to_montgomery().to_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

/// Path of the secret file that pairs with public file `name`.
#[must_use]
pub fn secret_path(name: &Path) -> PathBuf {
    let mut s = name.as_os_str().to_owned();
    s.push(SECRET_SUFFIX);
    PathBuf::from(s)
}

/// Generates a pair and writes `<name>` and `<name>.secret`.
///
/// # Errors
///
/// Returns [`KeyError::AlreadyExists`] if either file exists and `force`
/// is false, or [`KeyError::Io`] on write failure.
pub fn generate_files(name: &Path, force: bool) -> Result<KeyPair, KeyError> {
    let secret = secret_path(name);
    if !force {
        for path in [name, secret.as_path()] {
            if path.exists() {
                return Err(KeyError::AlreadyExists(path.to_path_buf()));
            }
        }
    }
    if let Some(parent) = name.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let pair = KeyPair::generate();
    write_secret(&secret, &pair)?;
    write_public(name, &pair.public())?;
    Ok(pair)
}

/// Writes a secret file with mode 0600.
///
/// # Errors
///
/// Returns [`KeyError::Io`] on failure.
pub fn write_secret(path: &Path, pair: &KeyPair) -> Result<(), KeyError> {
    let text = Zeroizing::new(format!("{}\n", base58::encode(&pair.secret_bytes()[..])));
    // Create file with restrictive permissions atomically
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(SECRET_FILE_PERMS)
        .open(path)
        .map_err(io_err(path))?;
    file.write_all(text.as_bytes()).map_err(io_err(path))?;
    // An existing file keeps its old mode on open.
    fs::set_permissions(path, fs::Permissions::from_mode(SECRET_FILE_PERMS))
        .map_err(io_err(path))
}

/// Writes a public key file.
///
/// # Errors
///
/// Returns [`KeyError::Io`] on failure.
pub fn write_public(path: &Path, key: &PublicKey) -> Result<(), KeyError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(PUBLIC_FILE_PERMS)
        .open(path)
        .map_err(io_err(path))?;
    writeln!(file, "{key}").map_err(io_err(path))
}

fn read_key_file(path: &Path) -> Result<[u8; KEY_LEN], KeyError> {
    let text = Zeroizing::new(fs::read_to_string(path).map_err(io_err(path))?);
    base58::decode_key(&text).map_err(|source| KeyError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads a public key file.
///
/// # Errors
///
/// Returns [`KeyError`] if the file is unreadable or malformed.
pub fn load_public(path: &Path) -> Result<PublicKey, KeyError> {
    PublicKey::from_bytes(&read_key_file(path)?)
}

/// Loads the pair named `name` from `<name>.secret`.
///
/// If the public file `<name>` also exists it must match.
///
/// # Errors
///
/// Returns [`KeyError::MissingSecret`] when the secret file is absent,
/// [`KeyError::Permissions`] when it is group/other accessible, and
/// [`KeyError::Mismatch`] when the public file disagrees.
pub fn load_secret(name: &Path) -> Result<KeyPair, KeyError> {
    let secret = secret_path(name);
    let metadata = match fs::metadata(&secret) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(KeyError::MissingSecret(secret));
        }
        Err(e) => return Err(io_err(&secret)(e)),
    };
    let mode = metadata.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(KeyError::Permissions {
            path: secret,
            mode: mode & 0o777,
        });
    }

    let seed = Zeroizing::new(read_key_file(&secret)?);
    let pair = KeyPair::from_secret_bytes(&seed);

    if name.exists() && load_public(name)? != pair.public() {
        return Err(KeyError::Mismatch(name.to_path_buf()));
    }
    Ok(pair)
}

/// An ordered set of public keys permitted to complete a handshake.
///
/// An empty set disables authorization. A set loaded from a file that had
/// entries but no usable key is *deny-all* rather than empty, so a broken
/// allowlist never silently opens the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizedKeySet {
    keys: Vec<PublicKey>,
    deny_all: bool,
}

impl AuthorizedKeySet {
    /// Builds a set from keys, dropping duplicates but keeping first-seen order.
    #[must_use]
    pub fn new(keys: impl IntoIterator<Item = PublicKey>) -> Self {
        let mut set = Self::default();
        for key in keys {
            set.insert(key);
        }
        set
    }

    /// A set that rejects every peer.
    #[must_use]
    pub const fn deny_all() -> Self {
        Self {
            keys: Vec::new(),
            deny_all: true,
        }
    }

    /// Adds a key if not present.
    pub fn insert(&mut self, key: PublicKey) {
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
    }

    /// True when no authorization should be enforced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && !self.deny_all
    }

    /// Number of usable keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether `key` is allowed.
    #[must_use]
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.keys.contains(key)
    }

    /// Keys in file order.
    pub fn iter(&self) -> impl Iterator<Item = &PublicKey> {
        self.keys.iter()
    }

    /// Parses allowlist text: one Base58 key per line, `#` comments and
    /// blank lines ignored, malformed lines skipped with a warning.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut set = Self::default();
        let mut candidates = 0usize;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            candidates += 1;
            match line.parse::<PublicKey>() {
                Ok(key) => set.insert(key),
                Err(e) => warn!(line = lineno + 1, error = %e, "skipping malformed authorized key"),
            }
        }
        if candidates > 0 && set.keys.is_empty() {
            warn!("authorized keys list has no valid entries; denying all peers");
            set.deny_all = true;
        }
        set
    }
}

/// Loads an allowlist file.
///
/// # Errors
///
/// Returns [`KeyError::Io`] if the file cannot be read.
pub fn load_authorized(path: &Path) -> Result<AuthorizedKeySet, KeyError> {
    let text = fs::read_to_string(path).map_err(io_err(path))?;
    Ok(AuthorizedKeySet::parse(&text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generate_writes_both_files_with_secret_0600() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("server");
        let pair = generate_files(&name, false).unwrap();

        let mode = fs::metadata(secret_path(&name)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(load_public(&name).unwrap(), pair.public());
        let loaded = load_secret(&name).unwrap();
        assert_eq!(loaded.public(), pair.public());
        assert_eq!(*loaded.secret_bytes(), *pair.secret_bytes());
    }

    #[test]
    fn generate_refuses_overwrite_without_force() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("client");
        let first = generate_files(&name, false).unwrap();
        assert!(matches!(
            generate_files(&name, false),
            Err(KeyError::AlreadyExists(_))
        ));
        let second = generate_files(&name, true).unwrap();
        assert_ne!(first.public(), second.public());
    }

    #[test]
    fn secret_path_appends_suffix() {
        assert_eq!(
            secret_path(Path::new("/etc/rhizo/key")),
            PathBuf::from("/etc/rhizo/key.secret")
        );
        assert_eq!(
            secret_path(Path::new("key.pub")),
            PathBuf::from("key.pub.secret")
        );
    }

    #[test]
    fn load_secret_rejects_open_permissions() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("k");
        generate_files(&name, false).unwrap();
        fs::set_permissions(secret_path(&name), fs::Permissions::from_mode(0o644)).unwrap();
        let err = load_secret(&name).unwrap_err();
        assert!(matches!(err, KeyError::Permissions { mode: 0o644, .. }));
    }

    #[test]
    fn load_secret_missing_is_usage_error() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("only-public");
        write_public(&name, &KeyPair::generate().public()).unwrap();
        assert!(load_public(&name).is_ok());
        assert!(matches!(load_secret(&name), Err(KeyError::MissingSecret(_))));
    }

    #[test]
    fn load_secret_detects_mismatched_public() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("k");
        generate_files(&name, false).unwrap();
        write_public(&name, &KeyPair::generate().public()).unwrap();
        assert!(matches!(load_secret(&name), Err(KeyError::Mismatch(_))));
    }

    #[test]
    fn load_public_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad");
        fs::write(&path, "totallywrongkey\n").unwrap();
        assert!(matches!(load_public(&path), Err(KeyError::Decode { .. })));
    }

    #[test]
    fn noise_keypair_matches_public_conversion() {
        let pair = KeyPair::generate();
        let noise = pair.noise_keypair();
        assert_eq!(noise.public, pair.public().to_x25519().unwrap().to_vec());
        assert_eq!(noise.private.len(), 32);
    }

    #[test]
    fn public_key_text_roundtrip() {
        let key = KeyPair::generate().public();
        let parsed: PublicKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn allowlist_parses_keys_comments_and_blanks() {
        let a = KeyPair::generate().public();
        let b = KeyPair::generate().public();
        let text = format!("# team keys\n{a}\n\n  {b}  \nnot-a-key\n{a}\n");
        let set = AuthorizedKeySet::parse(&text);
        assert_eq!(set.len(), 2);
        assert!(!set.is_empty());
        assert!(set.contains(&a) && set.contains(&b));
        assert_eq!(set.iter().copied().collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn allowlist_with_only_invalid_entries_denies_all() {
        let set = AuthorizedKeySet::parse("totallywrongkey\n");
        assert!(!set.is_empty());
        assert_eq!(set.len(), 0);
        assert!(!set.contains(&KeyPair::generate().public()));
    }

    #[test]
    fn empty_allowlist_disables_authorization() {
        assert!(AuthorizedKeySet::parse("").is_empty());
        assert!(AuthorizedKeySet::parse("# nothing yet\n\n").is_empty());
        assert!(!AuthorizedKeySet::deny_all().is_empty());
    }

    #[test]
    fn load_authorized_reads_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("authorized_keys");
        let key = KeyPair::generate().public();
        fs::write(&path, format!("{key}\n")).unwrap();
        let set = load_authorized(&path).unwrap();
        assert!(set.contains(&key));
        assert!(matches!(
            load_authorized(&dir.path().join("missing")),
            Err(KeyError::Io { .. })
        ));
    }
}
