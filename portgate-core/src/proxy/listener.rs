use super::relay::{relay, Direction};
use crate::config::schema::{default_bind_address, ProxyConfig};
use crate::error::{FirewallError, Result};
use crate::events::EventLog;
use crate::filter::{ConnectionDescriptor, PolicyEngine};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Destination address recorded for every connection.
///
/// The listener cannot see the address a client originally dialled, so
/// rules on the destination address only work when that address is the
/// proxy host itself.
pub const LOOPBACK_DESTINATION: &str = "127.0.0.1";

/// Optional bounds on a listener. The default is unbounded with no timeouts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Maximum connections handled at once; accepting pauses at the limit
    pub max_connections: Option<usize>,
    /// Upper bound on establishing the upstream connection
    pub connect_timeout: Option<Duration>,
    /// A relay with no bytes moving in either direction for this long is closed
    pub idle_timeout: Option<Duration>,
}

/// Where a listener binds and what it forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub bind_address: IpAddr,
    /// 0 picks an ephemeral port
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub limits: ConnectionLimits,
}

impl ListenerConfig {
    pub fn new(listen_port: u16, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            bind_address: default_bind_address(),
            listen_port,
            target_host: target_host.into(),
            target_port,
            limits: ConnectionLimits::default(),
        }
    }

    pub fn from_proxy(proxy: &ProxyConfig, limits: ConnectionLimits) -> Self {
        Self {
            bind_address: proxy.bind_address,
            listen_port: proxy.listen_port,
            target_host: proxy.target_host.clone(),
            target_port: proxy.target_port,
            limits,
        }
    }

    pub fn with_bind_address(mut self, bind_address: IpAddr) -> Self {
        self.bind_address = bind_address;
        self
    }

    pub fn with_limits(mut self, limits: ConnectionLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Listening,
}

/// State shared by the accept loop and every connection task
struct ConnectionContext {
    engine: Arc<PolicyEngine>,
    events: Arc<EventLog>,
    listen_port: u16,
    target_host: String,
    target_port: u16,
    limits: ConnectionLimits,
}

struct Running {
    local_addr: SocketAddr,
    config: ListenerConfig,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// Accepts TCP connections, checks each against the policy engine, and
/// forwards allowed ones to a fixed upstream.
pub struct ProxyListener {
    engine: Arc<PolicyEngine>,
    events: Arc<EventLog>,
    running: Option<Running>,
}

impl ProxyListener {
    pub fn new(engine: Arc<PolicyEngine>, events: Arc<EventLog>) -> Self {
        Self {
            engine,
            events,
            running: None,
        }
    }

    pub fn state(&self) -> ListenerState {
        match self.running {
            Some(_) => ListenerState::Listening,
            None => ListenerState::Stopped,
        }
    }

    /// Address actually bound, while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn config(&self) -> Option<&ListenerConfig> {
        self.running.as_ref().map(|r| &r.config)
    }

    /// Bind and start accepting.
    ///
    /// Binding is the only failure reported here; everything that goes wrong
    /// per connection is logged and confined to that connection.
    pub async fn start(&mut self, config: ListenerConfig) -> Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Err(FirewallError::AlreadyListening {
                port: running.local_addr.port(),
            });
        }

        let addr = SocketAddr::new(config.bind_address, config.listen_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| FirewallError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| FirewallError::Bind { addr, source })?;

        let ctx = Arc::new(ConnectionContext {
            engine: self.engine.clone(),
            events: self.events.clone(),
            listen_port: local_addr.port(),
            target_host: config.target_host.clone(),
            target_port: config.target_port,
            limits: config.limits.clone(),
        });

        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown.clone()));

        self.events.log_system(&format!(
            "Proxy listener started: {} -> {}:{}",
            local_addr.port(),
            config.target_host,
            config.target_port
        ));

        self.running = Some(Running {
            local_addr,
            config,
            shutdown,
            accept_task,
        });

        Ok(local_addr)
    }

    /// Stop accepting and release the listening socket.
    ///
    /// Connections already accepted keep relaying. No-op when stopped.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.shutdown.cancel();
        if let Err(e) = running.accept_task.await {
            debug!("Accept task on port {} ended abnormally: {}", running.local_addr.port(), e);
        }

        self.events.log_system(&format!(
            "Proxy listener stopped on port {}",
            running.local_addr.port()
        ));
    }
}

impl Drop for ProxyListener {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.shutdown.cancel();
        }
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ConnectionContext>, shutdown: CancellationToken) {
    let permits = ctx
        .limits
        .max_connections
        .map(|max| Arc::new(Semaphore::new(max)));

    loop {
        let permit = match &permits {
            Some(semaphore) => tokio::select! {
                _ = shutdown.cancelled() => break,
                acquired = semaphore.clone().acquire_owned() => match acquired {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
            },
            None => None,
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, &ctx).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    if !shutdown.is_cancelled() {
                        warn!("Listener error on port {}: {}", ctx.listen_port, e);
                    }
                }
            },
        }
    }

    debug!("Accept loop on port {} exited", ctx.listen_port);
}

async fn handle_connection(client: TcpStream, peer: SocketAddr, ctx: &ConnectionContext) {
    let source = peer.ip().to_canonical();
    let conn = ConnectionDescriptor::tcp(
        source.to_string(),
        peer.port(),
        LOOPBACK_DESTINATION,
        ctx.listen_port,
    );

    let verdict = ctx.engine.evaluate(&conn);

    if verdict.is_denied() {
        let rule_id = verdict.rule_id.as_deref().unwrap_or("Unknown");
        ctx.events.log_block(&conn, rule_id);
        info!(
            "[BLOCKED] {}:{} -> {} (Rule: {})",
            conn.source_address, conn.source_port, ctx.listen_port, rule_id
        );
        drop(client);
        return;
    }

    info!(
        "[ALLOWED] {}:{} -> {} (Rule: {}) -> Forwarding to {}:{}",
        conn.source_address,
        conn.source_port,
        ctx.listen_port,
        verdict.rule_id.as_deref().unwrap_or("Default"),
        ctx.target_host,
        ctx.target_port
    );

    let upstream = match connect_upstream(ctx).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(
                "Upstream connection to {}:{} failed: {}",
                ctx.target_host, ctx.target_port, e
            );
            return;
        }
    };

    let outcome = relay(client, upstream, ctx.limits.idle_timeout).await;
    let side = match outcome.finished {
        Some(Direction::ClientToUpstream) => "client",
        Some(Direction::UpstreamToClient) => "upstream",
        None => "idle timeout",
    };
    match outcome.result {
        Ok(bytes) => debug!(
            "Relay for {}:{} closed by {} after {} bytes",
            conn.source_address, conn.source_port, side, bytes
        ),
        Err(e) => debug!(
            "Relay for {}:{} ended by {} error: {}",
            conn.source_address, conn.source_port, side, e
        ),
    }
}

async fn connect_upstream(ctx: &ConnectionContext) -> io::Result<TcpStream> {
    let connect = TcpStream::connect((ctx.target_host.as_str(), ctx.target_port));
    match ctx.limits.connect_timeout {
        Some(limit) => timeout(limit, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream connect timed out"))?,
        None => connect.await,
    }
}
