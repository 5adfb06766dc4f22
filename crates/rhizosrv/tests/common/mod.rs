#![allow(dead_code)]

use rhizo_common::auth::policy_for;
use rhizo_common::endpoint::Endpoint;
use rhizo_common::keys::{AuthorizedKeySet, KeyPair, PublicKey};
use rhizo_common::session::{ClientSecurity, ServerSecurity, Session, SessionError};
use rhizo_common::transport::TransportContext;
use rhizofs::Client;
use rhizosrv::config::ServerConfig;
use rhizosrv::error::ServerError;
use rhizosrv::{run_with_shutdown, LocalDir, ServerState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How a test server is set up.
#[derive(Debug, Default)]
pub struct ServerOptions {
    pub encrypt: bool,
    pub allowlist: Option<AuthorizedKeySet>,
    pub ipc: bool,
    pub drain_timeout_secs: u64,
    pub read_only: bool,
}

pub struct TestServer {
    pub endpoint: Endpoint,
    pub state: Arc<ServerState>,
    pub public_key: Option<PublicKey>,
    pub handle: JoinHandle<Result<(), ServerError>>,
    shutdown: watch::Sender<bool>,
    root: TempDir,
    _sockets: TempDir,
}

impl TestServer {
    /// Host path of the served root.
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Host path of `rel` inside the served root.
    pub fn host_path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel.trim_start_matches('/'))
    }

    /// Client settings matching this server, anonymous.
    pub fn client_security(&self) -> ClientSecurity {
        ClientSecurity {
            server_key: self.public_key,
            keypair: None,
            handshake_timeout: Some(Duration::from_secs(5)),
        }
    }

    /// Opens a session with explicit settings.
    pub async fn session(&self, security: &ClientSecurity) -> Result<Session, SessionError> {
        Session::connect(&TransportContext::new(), &self.endpoint, security).await
    }

    /// Connects an anonymous client, panicking on failure.
    pub async fn client(&self) -> Client {
        Client::from_session(self.session(&self.client_security()).await.unwrap())
    }

    /// Connects a client that presents `keypair`.
    pub async fn client_with_key(&self, keypair: &KeyPair) -> Result<Client, SessionError> {
        let mut security = self.client_security();
        security.keypair = Some(keypair.clone());
        self.session(&security).await.map(Client::from_session)
    }

    /// Starts draining.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Waits for the accept loop to return.
    pub async fn join(self) -> Result<(), ServerError> {
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server did not shut down")
            .expect("server task panicked")
    }
}

pub async fn start_server() -> TestServer {
    start_server_with(ServerOptions::default()).await
}

pub async fn start_server_with(options: ServerOptions) -> TestServer {
    let root = TempDir::new().unwrap();
    let sockets = TempDir::new().unwrap();

    let endpoint = if options.ipc {
        Endpoint::ipc(sockets.path().join("rhizo.sock"))
    } else {
        Endpoint::parse("tcp://127.0.0.1:0").unwrap()
    };

    let mut config = ServerConfig::new(endpoint.clone(), root.path());
    config.encrypt = options.encrypt;
    config.read_only = options.read_only;
    config.drain_timeout_secs = options.drain_timeout_secs;
    config.handshake_timeout_secs = 5;
    config.validate().unwrap();

    let (security, public_key) = if options.encrypt {
        let keypair = KeyPair::generate();
        let public = keypair.public();
        (ServerSecurity::encrypted(keypair, policy_for(options.allowlist)), Some(public))
    } else {
        (ServerSecurity::plaintext(), None)
    };

    let tree = LocalDir::new(root.path()).unwrap().with_read_only(options.read_only);
    let state = Arc::new(ServerState::new(Arc::new(tree), security, config));

    let ctx = TransportContext::new();
    let listener = ctx.bind(&endpoint).await.unwrap();
    let endpoint = listener.local_endpoint();

    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_with_shutdown(listener, Arc::clone(&state), shutdown_rx));

    TestServer {
        endpoint,
        state,
        public_key,
        handle,
        shutdown,
        root,
        _sockets: sockets,
    }
}

/// Deterministic test content that is not a repeating short pattern.
pub fn content(len: usize) -> Vec<u8> {
    let mut x: u32 = 0x9E37_79B9;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            (x >> 24) as u8
        })
        .collect()
}
