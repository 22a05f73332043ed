use crate::admin::AdminConsole;
use crate::auth::AuthManager;
use crate::config::Config;
use crate::coordinator::ClusterContext;
use crate::session::Session;
use anyhow::anyhow;
use axum::http::StatusCode;
use axum::routing::get;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use pgshard_core::ProxyError;
use pgshard_pool::{Connector, PgConnector, PoolManager};
use pgshard_protocol::backend::{write_message, write_messages};
use pgshard_protocol::frontend::{read_message, read_startup};
use pgshard_protocol::{BackendMessage, ErrorFields, FrontendMessage, TransactionState};
use pgshard_router::{ReadWriteSplitter, ShardRouter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Process-wide shutdown flag that tasks can also wait on.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Shared state of the listener: logins, clusters and their pools.
pub struct Proxy {
    auth: AuthManager,
    pools: Arc<PoolManager>,
    clusters: HashMap<String, Arc<ClusterContext>>,
    shutdown: Arc<ShutdownSignal>,
    next_pid: AtomicI32,
}

impl Proxy {
    pub fn new(config: &Config, connector: Arc<dyn Connector>) -> anyhow::Result<Self> {
        let specs = config.clusters.iter().map(|c| c.spec()).collect();
        let pools = Arc::new(PoolManager::new(specs, config.pool.settings(), connector));
        let mut clusters = HashMap::new();
        for cluster in &config.clusters {
            let router = ShardRouter::new(cluster.shards.len(), &cluster.sharded_tables)?;
            clusters.insert(
                cluster.name.clone(),
                Arc::new(ClusterContext {
                    name: cluster.name.clone(),
                    router: Arc::new(router),
                    splitter: ReadWriteSplitter::new(cluster.read_write_split),
                    pools: pools.clone(),
                }),
            );
        }
        Ok(Self {
            auth: AuthManager::new(config),
            pools,
            clusters,
            shutdown: Arc::new(ShutdownSignal::new()),
            next_pid: AtomicI32::new(1),
        })
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn shutdown_signal(&self) -> Arc<ShutdownSignal> {
        self.shutdown.clone()
    }

    /// Stop accepting work: pools go offline and waiters fail.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.pools.shutdown(None);
        self.shutdown.trigger();
    }

    /// Startup, authentication, then the admin console or a cluster session.
    pub async fn handle_client<S>(&self, mut stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Some(params) = startup(&mut stream).await? else {
            return Ok(());
        };
        let Some(user) = params.get("user").cloned() else {
            return fatal(&mut stream, "28000", "no PostgreSQL user name specified in startup packet").await;
        };
        let database = params.get("database").cloned().unwrap_or_else(|| user.clone());
        if self.shutdown.is_triggered() {
            let err = ProxyError::ShuttingDown;
            return fatal(&mut stream, err.sqlstate(), err.to_string()).await;
        }

        let requires_password = match self.auth.requires_password(&database, &user) {
            Ok(required) => required,
            Err(err) => return fatal(&mut stream, "3D000", err.to_string()).await,
        };
        let password = if requires_password {
            write_message(&mut stream, &BackendMessage::AuthenticationCleartextPassword).await?;
            match read_message(&mut stream).await? {
                FrontendMessage::Password { password } => Some(password),
                _ => return fatal(&mut stream, "08P01", "expected password response").await,
            }
        } else {
            None
        };
        let ctx = match self.auth.authenticate(&database, &user, password.as_deref()) {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(user = %user, database = %database, "authentication failed");
                return fatal(&mut stream, "28P01", err.to_string()).await;
            }
        };

        let mut hello = vec![BackendMessage::AuthenticationOk];
        for (key, value) in [
            ("server_version", "14.0"),
            ("server_encoding", "UTF8"),
            ("client_encoding", "UTF8"),
            ("DateStyle", "ISO, MDY"),
            ("integer_datetimes", "on"),
            ("standard_conforming_strings", "on"),
            ("application_name", params.get("application_name").map_or("", String::as_str)),
        ] {
            hello.push(BackendMessage::ParameterStatus {
                key: key.into(),
                value: value.into(),
            });
        }
        hello.push(BackendMessage::BackendKeyData {
            pid: self.next_pid.fetch_add(1, Ordering::Relaxed),
            secret: 0,
        });
        hello.push(BackendMessage::ready(TransactionState::Idle));
        write_messages(&mut stream, &hello).await?;
        info!(user = %ctx.username, database = %ctx.database, "client connected");

        if ctx.is_admin {
            let console = AdminConsole::new(self.pools.clone(), self.shutdown.clone());
            return console.serve(&mut stream).await;
        }
        let cluster = self
            .clusters
            .get(&ctx.database)
            .cloned()
            .ok_or_else(|| anyhow!("no cluster for database {}", ctx.database))?;
        Session::new(stream, cluster).run().await
    }

    /// Answer the startup packet with a FATAL error and hang up.
    pub async fn refuse_client<S>(&self, mut stream: S, code: &str, message: &str) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if startup(&mut stream).await?.is_some() {
            fatal(&mut stream, code, message).await?;
        }
        Ok(())
    }
}

/// Read the startup packet, declining SSL. `None` when the client only sent
/// a cancel request.
async fn startup<S>(stream: &mut S) -> anyhow::Result<Option<HashMap<String, String>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match read_startup(stream).await? {
            FrontendMessage::SslRequest => {
                stream.write_all(b"N").await?;
                stream.flush().await?;
            }
            FrontendMessage::Startup { params } => return Ok(Some(params)),
            FrontendMessage::CancelRequest { pid, .. } => {
                debug!(pid, "cancel request ignored");
                return Ok(None);
            }
            _ => return Err(anyhow!("unexpected message during startup")),
        }
    }
}

async fn fatal<S>(stream: &mut S, code: &str, message: impl Into<String>) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let fields = ErrorFields::new("FATAL", code, message);
    write_message(stream, &BackendMessage::ErrorResponse { fields }).await
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let proxy = Arc::new(Proxy::new(&config, Arc::new(PgConnector::new("pgshard")))?);
    let shutdown = proxy.shutdown_signal();

    if config.metrics.enabled {
        let handle = PrometheusBuilder::new().install_recorder()?;
        let metrics_addr = config.metrics.listen_addr.clone();
        let ready = shutdown.clone();
        tokio::spawn(async move {
            let app = axum::Router::new()
                .route("/metrics", get(move || async move { handle.render() }))
                .route("/health", get(|| async { "ok" }))
                .route(
                    "/ready",
                    get(move || {
                        let ready = ready.clone();
                        async move {
                            if ready.is_triggered() {
                                (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
                            } else {
                                (StatusCode::OK, "ok")
                            }
                        }
                    }),
                );
            match tokio::net::TcpListener::bind(&metrics_addr).await {
                Ok(listener) => {
                    if let Err(err) = axum::serve(listener, app).await {
                        error!("metrics server error: {err}");
                    }
                }
                Err(err) => error!("metrics listener {metrics_addr}: {err}"),
            }
        });
    }

    proxy.pools().prewarm().await;

    let interval = Duration::from_millis(config.server.maintenance_interval_ms.max(100));
    let maintained = proxy.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if maintained.shutdown_signal().is_triggered() {
                break;
            }
            maintained.pools().maintain().await;
        }
    });

    let listener = TcpListener::bind(&config.server.listen_addr).await?;
    info!("pgshard listening on {}", config.server.listen_addr);
    let max_connections = config.server.max_connections;
    let slots = Arc::new(Semaphore::new(max_connections));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("accept error: {err}");
                        continue;
                    }
                };
                let _ = socket.set_nodelay(true);
                let proxy = proxy.clone();
                let slot = slots.clone().try_acquire_owned();
                tokio::spawn(async move {
                    let Ok(_slot) = slot else {
                        counter!("pgshard_clients_refused_total").increment(1);
                        let refused = proxy
                            .refuse_client(socket, "53300", "sorry, too many clients already")
                            .await;
                        if let Err(err) = refused {
                            debug!(%peer, "refusing client: {err}");
                        }
                        return;
                    };
                    gauge!("pgshard_clients_connected").increment(1.0);
                    if let Err(err) = proxy.handle_client(socket).await {
                        debug!(%peer, "client session ended: {err}");
                    }
                    gauge!("pgshard_clients_connected").decrement(1.0);
                    info!(%peer, "client disconnected");
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                proxy.shutdown();
                break;
            }
            _ = shutdown.wait() => break,
        }
    }

    // In-flight sessions hand their connections back; pools close them.
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while slots.available_permits() < max_connections && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if slots.available_permits() < max_connections {
        warn!(
            remaining = max_connections - slots.available_permits(),
            "clients still connected at shutdown"
        );
    }
    Ok(())
}
