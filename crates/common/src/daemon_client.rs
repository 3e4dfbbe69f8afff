// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// SSH Tunnel Manager - Daemon Client Module
// Control-channel client shared by front-ends: request/reply correlation,
// daemon auto-start, and connection retries.

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodecError};
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::network::loopback_socket_addr;
use crate::protocol::{
    control_codec, encode_frame, parse_frame, ControlCodec, Reply, Request,
    DEFAULT_CONTROL_PORT, DEFAULT_MAX_LINE_LENGTH,
};
use crate::types::{TunnelSpec, UnlockSecret};

/// Name of the daemon executable, expected next to the front-end binary
pub const DAEMON_BINARY: &str = "ssh-tunnel-daemon";

/// Configuration for reaching (and if needed starting) the daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonClientConfig {
    /// Control host; must be a loopback address
    #[serde(default = "default_daemon_host")]
    pub daemon_host: String,

    /// Control port
    #[serde(default = "default_daemon_port")]
    pub daemon_port: u16,

    /// Delay between connection attempts while the daemon starts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Daemon executable override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_program: Option<PathBuf>,

    /// Where the auto-started daemon writes its log output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_log: Option<PathBuf>,

    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

fn default_daemon_host() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

impl Default for DaemonClientConfig {
    fn default() -> Self {
        Self {
            daemon_host: default_daemon_host(),
            daemon_port: default_daemon_port(),
            retry_delay_ms: default_retry_delay_ms(),
            daemon_program: None,
            daemon_log: None,
            max_line_length: default_max_line_length(),
        }
    }
}

impl DaemonClientConfig {
    pub fn control_addr(&self) -> Result<SocketAddr> {
        loopback_socket_addr(&self.daemon_host, self.daemon_port)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

type ControlFramed = Framed<TcpStream, ControlCodec>;
type ReplySender = oneshot::Sender<Result<Reply>>;

/// Outstanding requests by correlation id; `None` once the connection is gone
type PendingReplies = Arc<Mutex<Option<HashMap<String, ReplySender>>>>;

/// One open control connection.
///
/// Requests may be issued concurrently; each reply is routed to its caller by
/// correlation id. When the connection drops every outstanding request fails
/// with [`Error::ConnectionClosed`].
pub struct DaemonConnection {
    writer: Mutex<SplitSink<ControlFramed, String>>,
    pending: PendingReplies,
    reader: JoinHandle<()>,
}

impl DaemonConnection {
    pub async fn connect(addr: SocketAddr, max_line_length: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let (writer, lines) = Framed::new(stream, control_codec(max_line_length)).split();
        let pending: PendingReplies = Arc::new(Mutex::new(Some(HashMap::new())));
        let reader = tokio::spawn(read_replies(lines, pending.clone()));

        debug!("Connected to daemon at {}", addr);
        Ok(Self {
            writer: Mutex::new(writer),
            pending,
            reader,
        })
    }

    /// Send a request and wait for its reply, whatever its `success` value
    pub async fn send(&self, request: Request) -> Result<Reply> {
        let correlation_id = Uuid::new_v4().to_string();
        let line = encode_frame(&request.into_frame(correlation_id.clone()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        match self.pending.lock().await.as_mut() {
            Some(waiters) => {
                waiters.insert(correlation_id.clone(), reply_tx);
            }
            None => return Err(Error::ConnectionClosed),
        }

        let sent = self.writer.lock().await.send(line).await;
        if let Err(e) = sent {
            if let Some(waiters) = self.pending.lock().await.as_mut() {
                waiters.remove(&correlation_id);
            }
            return Err(codec_error(e));
        }

        reply_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Send a request; a `success: false` reply becomes [`Error::Daemon`]
    pub async fn call(&self, request: Request) -> Result<Reply> {
        self.send(request).await?.into_result()
    }

    pub async fn start_tunnel(&self, profile_name: &str, tunnel: TunnelSpec) -> Result<()> {
        self.call(Request::StartTunnel {
            profile_name: profile_name.to_string(),
            tunnel,
        })
        .await
        .map(|_| ())
    }

    pub async fn stop_tunnel(&self, profile_name: &str, tunnel: TunnelSpec) -> Result<()> {
        self.call(Request::StopTunnel {
            profile_name: profile_name.to_string(),
            tunnel,
        })
        .await
        .map(|_| ())
    }

    pub async fn list_tunnels(&self, profile_name: &str) -> Result<Vec<TunnelSpec>> {
        let reply = self
            .call(Request::ListTunnels {
                profile_name: profile_name.to_string(),
            })
            .await?;
        Ok(reply.tunnels.unwrap_or_default())
    }

    pub async fn list_all_tunnels(&self) -> Result<BTreeMap<String, Vec<TunnelSpec>>> {
        let reply = self.call(Request::ListAllTunnels).await?;
        Ok(reply.profiles.unwrap_or_default())
    }

    pub async fn stop_profile(&self, profile_name: &str) -> Result<()> {
        self.call(Request::StopProfile {
            profile_name: profile_name.to_string(),
        })
        .await
        .map(|_| ())
    }
}

impl Drop for DaemonConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn codec_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::Io(e) => Error::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            Error::Protocol("Request exceeds the maximum line length".to_string())
        }
    }
}

async fn read_replies(mut lines: SplitStream<ControlFramed>, pending: PendingReplies) {
    while let Some(item) = lines.next().await {
        let line = match item {
            Ok(line) => line,
            Err(e) => {
                debug!("Control connection read failed: {}", e);
                break;
            }
        };

        let Some(value) = parse_frame(&line) else {
            debug!("Ignoring malformed reply line");
            continue;
        };
        let reply: Reply = match serde_json::from_value(value) {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Ignoring unrecognised reply: {}", e);
                continue;
            }
        };
        let Some(correlation_id) = reply.correlation_id.clone() else {
            debug!("Ignoring reply without correlationId");
            continue;
        };

        let waiter = pending
            .lock()
            .await
            .as_mut()
            .and_then(|waiters| waiters.remove(&correlation_id));
        match waiter {
            Some(reply_tx) => {
                let _ = reply_tx.send(Ok(reply));
            }
            None => debug!("No pending request for reply {}", correlation_id),
        }
    }

    if let Some(waiters) = pending.lock().await.take() {
        for (_, reply_tx) in waiters {
            let _ = reply_tx.send(Err(Error::ConnectionClosed));
        }
    }
    debug!("Control connection closed");
}

/// Starts a daemon process in the background
pub trait DaemonLauncher: Send + Sync {
    /// Launch the daemon and hand it the unlock secret
    fn launch(&self, secret: &UnlockSecret) -> Result<()>;
}

/// Launches the daemon executable detached from the caller.
/// The secret is written as one line to the child's stdin.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    log_path: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, log_path: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            log_path,
        }
    }

    pub fn from_config(config: &DaemonClientConfig) -> Result<Self> {
        let program = match &config.daemon_program {
            Some(program) => program.clone(),
            None => default_daemon_program()?,
        };
        Ok(Self::new(program, config.daemon_log.clone()))
    }
}

/// The daemon executable next to the current one
pub fn default_daemon_program() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    Ok(exe.with_file_name(format!("{}{}", DAEMON_BINARY, std::env::consts::EXE_SUFFIX)))
}

impl DaemonLauncher for ProcessLauncher {
    fn launch(&self, secret: &UnlockSecret) -> Result<()> {
        let mut command = Command::new(&self.program);
        command.stdin(Stdio::piped()).stdout(Stdio::null());

        match &self.log_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let log = OpenOptions::new().create(true).append(true).open(path)?;
                command.stderr(Stdio::from(log));
            }
            None => {
                command.stderr(Stdio::null());
            }
        }

        // Keep the daemon alive when the terminal's process group is signalled
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::Daemon(format!(
                "Failed to start daemon {}: {}",
                self.program.display(),
                e
            ))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut line = Zeroizing::new(String::with_capacity(secret.len() + 1));
            line.push_str(secret);
            line.push('\n');
            stdin.write_all(line.as_bytes())?;
        }

        info!("Started daemon process (pid {})", child.id());
        Ok(())
    }
}

/// Connects to the daemon, starting it when nothing is listening
pub struct DaemonSupervisor<L> {
    config: DaemonClientConfig,
    launcher: L,
}

impl<L: DaemonLauncher> DaemonSupervisor<L> {
    pub fn new(config: DaemonClientConfig, launcher: L) -> Self {
        Self { config, launcher }
    }

    pub fn config(&self) -> &DaemonClientConfig {
        &self.config
    }

    /// Single attempt, no auto-start
    pub async fn try_connect(&self) -> Result<DaemonConnection> {
        let addr = self.config.control_addr()?;
        DaemonConnection::connect(addr, self.config.max_line_length).await
    }

    /// Connect, launching the daemon after every failed attempt and retrying
    /// at a fixed delay until it answers. A launch that loses the race to a
    /// running daemon exits on its PID file. `unlock` is asked for the secret
    /// at most once.
    pub async fn connect<F>(&self, mut unlock: F) -> Result<DaemonConnection>
    where
        F: FnMut() -> Result<UnlockSecret>,
    {
        let addr = self.config.control_addr()?;
        let mut secret: Option<UnlockSecret> = None;

        loop {
            match DaemonConnection::connect(addr, self.config.max_line_length).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    debug!("Daemon not reachable at {}: {}", addr, e);
                    if secret.is_none() {
                        secret = Some(unlock()?);
                    }
                    if let Some(secret) = &secret {
                        self.launcher.launch(secret)?;
                    }
                    info!("Waiting for daemon to listen on {}", addr);
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn local_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_default_config() {
        let config = DaemonClientConfig::default();
        assert_eq!(config.daemon_port, 31337);
        assert_eq!(config.retry_delay(), Duration::from_secs(2));
        assert_eq!(
            config.control_addr().unwrap(),
            "127.0.0.1:31337".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_config_rejects_remote_host() {
        let config: DaemonClientConfig = toml::from_str("daemon_host = \"10.1.2.3\"").unwrap();
        assert!(config.control_addr().is_err());
    }

    #[tokio::test]
    async fn test_replies_routed_by_correlation_id() {
        let (listener, addr) = local_listener().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();

            let mut requests = Vec::new();
            while requests.len() < 2 {
                let line = lines.next_line().await.unwrap().unwrap();
                requests.push(serde_json::from_str::<serde_json::Value>(&line).unwrap());
            }

            write.write_all(b"not json at all\n").await.unwrap();
            // Answer in reverse order
            for request in requests.iter().rev() {
                let port = if request["profileName"] == "a" { 1 } else { 2 };
                let reply = Reply::ok()
                    .with_tunnels(vec![TunnelSpec::new(port, "db", 5432)])
                    .with_correlation_id(request["correlationId"].as_str().map(String::from));
                let mut line = serde_json::to_string(&reply).unwrap();
                line.push('\n');
                write.write_all(line.as_bytes()).await.unwrap();
            }
            // Hold the connection until the client is done
            let _ = lines.next_line().await;
        });

        let connection = DaemonConnection::connect(addr, DEFAULT_MAX_LINE_LENGTH)
            .await
            .unwrap();
        let (a, b) = tokio::join!(connection.list_tunnels("a"), connection.list_tunnels("b"));
        assert_eq!(a.unwrap()[0].source_port, 1);
        assert_eq!(b.unwrap()[0].source_port, 2);

        drop(connection);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_reply_becomes_error() {
        let (listener, addr) = local_listener().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let request: serde_json::Value = serde_json::from_str(&line).unwrap();
            let reply = Reply::failure("Server ghost not found")
                .with_correlation_id(request["correlationId"].as_str().map(String::from));
            let mut line = serde_json::to_string(&reply).unwrap();
            line.push('\n');
            write.write_all(line.as_bytes()).await.unwrap();
            let _ = lines.next_line().await;
        });

        let connection = DaemonConnection::connect(addr, DEFAULT_MAX_LINE_LENGTH)
            .await
            .unwrap();
        let err = connection.stop_profile("ghost").await.unwrap_err();
        assert_eq!(err.to_string(), "Server ghost not found");
    }

    #[tokio::test]
    async fn test_pending_requests_fail_when_connection_closes() {
        let (listener, addr) = local_listener().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            let _ = lines.next_line().await;
            // Drop without replying
        });

        let connection = DaemonConnection::connect(addr, DEFAULT_MAX_LINE_LENGTH)
            .await
            .unwrap();
        let err = connection.list_all_tunnels().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));

        // Later requests fail immediately
        let err = connection.list_all_tunnels().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed | Error::Io(_)));
    }

    struct FakeLauncher {
        port: u16,
        launches: Arc<AtomicUsize>,
        secrets: Arc<std::sync::Mutex<Vec<String>>>,
        /// Launches that exit before binding the control port
        dead_launches: usize,
    }

    impl FakeLauncher {
        fn new(port: u16, dead_launches: usize) -> Self {
            Self {
                port,
                launches: Arc::new(AtomicUsize::new(0)),
                secrets: Arc::new(std::sync::Mutex::new(Vec::new())),
                dead_launches,
            }
        }
    }

    impl DaemonLauncher for FakeLauncher {
        fn launch(&self, secret: &UnlockSecret) -> Result<()> {
            let launch = self.launches.fetch_add(1, Ordering::SeqCst);
            self.secrets.lock().unwrap().push(secret.to_string());
            if launch < self.dead_launches {
                return Ok(());
            }

            let port = self.port;
            tokio::spawn(async move {
                // Simulate a slow start-up
                tokio::time::sleep(Duration::from_millis(50)).await;
                // A later launch finds the port taken and exits, like a second daemon would
                let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await else {
                    return;
                };
                let (_stream, _) = listener.accept().await.unwrap();
                tokio::time::sleep(Duration::from_secs(5)).await;
            });
            Ok(())
        }
    }

    fn supervisor_for(launcher: FakeLauncher) -> DaemonSupervisor<FakeLauncher> {
        let config = DaemonClientConfig {
            daemon_port: launcher.port,
            retry_delay_ms: 20,
            ..DaemonClientConfig::default()
        };
        DaemonSupervisor::new(config, launcher)
    }

    #[tokio::test]
    async fn test_supervisor_launches_and_retries() {
        let launcher = FakeLauncher::new(free_port(), 0);
        let launches = launcher.launches.clone();
        let secrets = launcher.secrets.clone();
        let supervisor = supervisor_for(launcher);

        let mut prompts = 0;
        let connection = supervisor
            .connect(|| {
                prompts += 1;
                Ok(Zeroizing::new("master-pw".to_string()))
            })
            .await;

        assert!(connection.is_ok());
        assert_eq!(prompts, 1);
        assert!(launches.load(Ordering::SeqCst) >= 1);
        assert!(secrets.lock().unwrap().iter().all(|s| s == "master-pw"));
    }

    #[tokio::test]
    async fn test_supervisor_relaunches_after_daemon_dies() {
        let launcher = FakeLauncher::new(free_port(), 1);
        let launches = launcher.launches.clone();
        let secrets = launcher.secrets.clone();
        let supervisor = supervisor_for(launcher);

        let mut prompts = 0;
        let connection = tokio::time::timeout(
            Duration::from_secs(5),
            supervisor.connect(|| {
                prompts += 1;
                Ok(Zeroizing::new("master-pw".to_string()))
            }),
        )
        .await
        .expect("supervisor gave up after the first launch died");

        assert!(connection.is_ok());
        assert_eq!(prompts, 1);
        assert!(launches.load(Ordering::SeqCst) >= 2);
        assert!(secrets.lock().unwrap().iter().all(|s| s == "master-pw"));
    }

    #[tokio::test]
    async fn test_try_connect_does_not_launch() {
        let config = DaemonClientConfig {
            daemon_port: free_port(),
            ..DaemonClientConfig::default()
        };
        let launcher = FakeLauncher::new(config.daemon_port, 0);
        let launches = launcher.launches.clone();
        let supervisor = DaemonSupervisor::new(config, launcher);

        assert!(supervisor.try_connect().await.is_err());
        assert_eq!(launches.load(Ordering::SeqCst), 0);
    }
}
