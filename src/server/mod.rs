//! Service orchestration and lifecycle state machine.
//!
//! [`Server`] owns the RPC transport, the optional HTTP gateway transport,
//! their listeners and the lifecycle state. Listeners are bound at
//! construction so misconfiguration fails synchronously; serving starts on
//! [`Server::start`] and winds down on [`Server::stop`] or an OS signal.
//!
//! Two topologies exist. Without passthrough, one listener serves the RPC
//! transport directly. With passthrough, the RPC transport moves to a fixed
//! loopback-only port and the configured port serves the
//! [`ProtocolRouter`], which splits gRPC frames from gateway traffic; the
//! gateway mux translates HTTP calls by dialing the internal listener.
//!
//! The `Starting` → `Ready` transition is driven by first-accept detection
//! rather than by entering the serve loop: only an accepted peer proves the
//! socket is reachable.

mod options;

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::Router;
use axum_server::Handle;
use axum_server::accept::DefaultAcceptor;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::error::{BifrostError, Result};
use crate::gateway::{self, GatewayRegistration};
use crate::listener::FirstAccept;
use crate::router::ProtocolRouter;
use crate::state::State;
use crate::telemetry;
use crate::tls::TlsMaterial;

pub use options::{RpcMiddleware, ServerBuilder};

/// Lifecycle-managed gRPC endpoint with an optional HTTP/JSON gateway.
///
/// Constructed via [`Server::builder`]; a discarded instance releases its
/// sockets, and a stopped or errored instance cannot be restarted.
pub struct Server {
    inner: Arc<Inner>,
    serve: Mutex<Option<ServeParts>>,
    tls: Option<TlsMaterial>,
    rpc_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    span: Span,
}

/// Shared core: state machine, subscriptions, diagnostics and shutdown
/// handles. Everything behind one reader/writer lock, scoped per instance.
struct Inner {
    lifecycle: RwLock<Lifecycle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    rpc_handle: Handle,
    http_handle: Option<Handle>,
    shutdown_timeout: Option<Duration>,
    stopped: Notify,
    signals_spawned: AtomicBool,
}

struct Lifecycle {
    state: State,
    subscribers: HashMap<State, Vec<mpsc::Sender<State>>>,
    errors: Vec<Arc<BifrostError>>,
    missed: u64,
}

/// Everything [`Server::start`] consumes exactly once.
struct ServeParts {
    rpc_listener: StdTcpListener,
    rpc_router: Router,
    http: Option<HttpParts>,
}

struct HttpParts {
    listener: StdTcpListener,
    mux: Router,
    secure: bool,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("rpc_addr", &self.rpc_addr)
            .field("http_addr", &self.http_addr)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create a builder for configuring a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Begin serving.
    ///
    /// Valid only from [`State::Init`]; any other state is caller misuse
    /// and yields [`BifrostError::InvalidState`] (logged, no other effect).
    /// Returns immediately after spawning the signal task and one serve
    /// task per transport.
    pub fn start(&self) -> Result<()> {
        let parts = self.serve.lock().unwrap().take();
        let Some(parts) = parts else {
            let actual = self.state();
            warn!(state = %actual, "server is not in a valid state, want: INIT");
            return Err(BifrostError::InvalidState {
                expected: State::Init,
                actual,
            });
        };

        info!(
            version = crate::PKG_VERSION,
            rpc_addr = %self.rpc_addr,
            http_addr = ?self.http_addr,
            "server starting"
        );

        if !self.inner.signals_spawned.swap(true, Ordering::AcqRel) {
            tokio::spawn(handle_signals(self.inner.clone()).instrument(self.span.clone()));
        }

        self.inner.change_state(State::Starting);

        let rpc_tls = self.tls.as_ref().map(|m| m.server_config());
        match parts.http {
            Some(http) => {
                let app = Router::new()
                    .fallback_service(ProtocolRouter::new(parts.rpc_router.clone(), http.mux));
                let http_tls = if http.secure { rpc_tls.clone() } else { None };
                if let Some(handle) = self.inner.http_handle.clone() {
                    self.spawn_serve("http", http.listener, app, http_tls, handle);
                }
                self.spawn_serve(
                    "rpc",
                    parts.rpc_listener,
                    parts.rpc_router,
                    rpc_tls,
                    self.inner.rpc_handle.clone(),
                );
            }
            None => {
                self.spawn_serve(
                    "rpc",
                    parts.rpc_listener,
                    parts.rpc_router,
                    rpc_tls,
                    self.inner.rpc_handle.clone(),
                );
            }
        }

        Ok(())
    }

    /// Gracefully shut the service down.
    ///
    /// Transitions to `Stopping`, drains in-flight requests on every
    /// transport (bounded by the configured shutdown timeout, unbounded
    /// otherwise), then transitions to `Stopped`. Concurrent double-stop is
    /// caller misuse; the second call awaits nothing.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.inner.lifecycle.read().unwrap().state
    }

    /// Snapshot of errors recorded by background serve loops.
    pub fn errors(&self) -> Vec<Arc<BifrostError>> {
        self.inner.lifecycle.read().unwrap().errors.clone()
    }

    /// Number of state notifications dropped because a subscriber channel
    /// was full.
    pub fn missed_notifications(&self) -> u64 {
        self.inner.lifecycle.read().unwrap().missed
    }

    /// Subscribe to the given states.
    ///
    /// The channel capacity equals the number of requested states, so a
    /// subscriber that drains promptly and requests each state once never
    /// misses a transition. If the server is already in one of the
    /// requested states, that state is enqueued immediately. Delivery is
    /// non-blocking: a full channel increments the missed counter instead
    /// of stalling the transition.
    pub fn notify(&self, states: &[State]) -> mpsc::Receiver<State> {
        let (tx, rx) = mpsc::channel(states.len().max(1));
        let mut lifecycle = self.inner.lifecycle.write().unwrap();
        for &state in states {
            lifecycle.subscribers.entry(state).or_default().push(tx.clone());
            if state == lifecycle.state {
                let _ = tx.try_send(state);
            }
        }
        rx
    }

    /// Bound address of the RPC listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Bound address of the HTTP gateway listener, if passthrough is
    /// enabled.
    pub fn http_local_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Register HTTP-to-RPC translation routes against the gateway mux.
    ///
    /// Call between construction and [`start`](Self::start). Each
    /// registration receives the mux built so far and a lazy channel to the
    /// internal RPC listener (dialed with the TLS material's internal
    /// credentials, or plainly when TLS is disabled). Fails fast on the
    /// first registration error; partial registration is not rolled back,
    /// so treat a failure as fatal to startup.
    pub fn register_gateway(&self, registrations: Vec<GatewayRegistration>) -> Result<()> {
        let mut serve = self.serve.lock().unwrap();
        let Some(parts) = serve.as_mut() else {
            return Err(BifrostError::InvalidState {
                expected: State::Init,
                actual: self.state(),
            });
        };
        let Some(http) = parts.http.as_mut() else {
            return Err(BifrostError::Registration(
                "HTTP passthrough is not enabled".to_string(),
            ));
        };

        match &self.tls {
            Some(_) => info!("registering gateway routes with tls credentials"),
            None => info!("registering gateway routes without tls credentials"),
        }

        let channel =
            gateway::internal_channel(self.tls.as_ref().map(|m| m.internal_client_config()))?;
        let mux = std::mem::take(&mut http.mux);
        http.mux = gateway::register_all(mux, channel, registrations)?;
        Ok(())
    }

    fn spawn_serve(
        &self,
        transport: &'static str,
        listener: StdTcpListener,
        app: Router,
        tls: Option<Arc<rustls::ServerConfig>>,
        handle: Handle,
    ) {
        let inner = self.inner.clone();
        let ready = {
            let inner = self.inner.clone();
            move || inner.change_state(State::Ready)
        };
        let span = self.span.clone();

        let task = match tls {
            Some(config) => {
                let acceptor =
                    FirstAccept::new(RustlsAcceptor::new(RustlsConfig::from_config(config)), ready);
                let server = axum_server::from_tcp(listener).acceptor(acceptor).handle(handle);
                tokio::spawn(
                    async move {
                        if let Err(e) = server.serve(app.into_make_service()).await {
                            inner.record_serve_failure(transport, e);
                        }
                    }
                    .instrument(span),
                )
            }
            None => {
                let acceptor = FirstAccept::new(DefaultAcceptor::new(), ready);
                let server = axum_server::from_tcp(listener).acceptor(acceptor).handle(handle);
                tokio::spawn(
                    async move {
                        if let Err(e) = server.serve(app.into_make_service()).await {
                            inner.record_serve_failure(transport, e);
                        }
                    }
                    .instrument(span),
                )
            }
        };

        self.inner.tasks.lock().unwrap().push(task);
    }
}

impl Inner {
    /// Apply a state transition, skipping anything outside the edge table,
    /// and deliver notifications to matching subscribers.
    fn change_state(&self, next: State) {
        let mut lifecycle = self.lifecycle.write().unwrap();
        if !lifecycle.state.can_transition(next) {
            debug!(from = %lifecycle.state, to = %next, "state transition ignored");
            return;
        }
        lifecycle.state = next;
        debug!(state = %next, "state changed");
        metrics::counter!(telemetry::STATE_TRANSITIONS_TOTAL, "state" => next.to_string())
            .increment(1);

        let mut missed = 0u64;
        if let Some(subscribers) = lifecycle.subscribers.get(&next) {
            for tx in subscribers {
                if tx.try_send(next).is_err() {
                    missed += 1;
                }
            }
        }
        if missed > 0 {
            lifecycle.missed += missed;
            metrics::counter!(telemetry::NOTIFICATIONS_MISSED_TOTAL).increment(missed);
            warn!(state = %next, missed, "dropped state notifications for slow subscribers");
        }
    }

    fn record_serve_failure(&self, transport: &'static str, err: io::Error) {
        error!(transport, error = %err, "serve loop failed");
        metrics::counter!(telemetry::SERVE_FAILURES_TOTAL, "transport" => transport).increment(1);
        {
            let mut lifecycle = self.lifecycle.write().unwrap();
            lifecycle
                .errors
                .push(Arc::new(BifrostError::Serve(Arc::new(err))));
        }
        // First writer wins: only valid from Starting or Ready, later
        // failures just append to the log.
        self.change_state(State::Error);
    }

    async fn stop(&self) {
        self.change_state(State::Stopping);

        self.rpc_handle.graceful_shutdown(self.shutdown_timeout);
        if let Some(handle) = &self.http_handle {
            handle.graceful_shutdown(self.shutdown_timeout);
        }

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.stopped.notify_waiters();
        self.change_state(State::Stopped);
    }
}

impl ServerBuilder {
    /// Validate options, resolve TLS material, build the RPC router and
    /// bind the listener(s).
    ///
    /// Every accumulated configuration problem is reported together in a
    /// single [`BifrostError::Setup`]; nothing is bound until validation
    /// passes. The returned server is in [`State::Init`].
    pub fn build(mut self) -> Result<Server> {
        self.opts.validate();
        if !self.opts.errs.is_empty() {
            return Err(BifrostError::Setup(self.opts.errs));
        }

        let policy = self.opts.client_auth.unwrap_or_default();
        let roots = self.opts.ca_roots.take();
        let tls = if self.opts.insecure {
            None
        } else if let Some((chain, key)) = self.opts.identity.take() {
            Some(TlsMaterial::resolve(chain, key, roots, policy)?)
        } else if let (Some(cert), Some(key)) = (&self.opts.tls_cert, &self.opts.tls_key) {
            Some(TlsMaterial::from_pem(cert, key, roots, policy)?)
        } else {
            return Err(BifrostError::Configuration(
                "either set insecure or define TLS certificates appropriately".to_string(),
            ));
        };

        let mut routes = self.opts.routes;
        if let Some(descriptors) = self.opts.reflection.as_deref() {
            let reflection = tonic_reflection::server::Builder::configure()
                .register_encoded_file_descriptor_set(descriptors)
                .build_v1()
                .map_err(|e| BifrostError::Configuration(format!("reflection service: {e}")))?;
            routes.add_service(reflection);
        }
        let mut rpc_router = routes.routes().into_axum_router();
        for decorate in self.opts.middleware {
            rpc_router = decorate(rpc_router);
        }

        let gateway_mode = self.opts.http_passthrough || self.opts.http_passthrough_insecure;
        let (rpc_listener, rpc_addr, http) = if gateway_mode {
            let (http_listener, http_addr) = bind(
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.opts.port)),
                "http",
            )?;
            let (rpc_listener, rpc_addr) = bind(gateway::internal_rpc_addr(), "rpc")?;
            let parts = HttpParts {
                listener: http_listener,
                mux: Router::new(),
                secure: self.opts.http_passthrough,
            };
            (rpc_listener, rpc_addr, Some((parts, http_addr)))
        } else {
            let (rpc_listener, rpc_addr) = bind(
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.opts.port)),
                "rpc",
            )?;
            (rpc_listener, rpc_addr, None)
        };

        let (http_parts, http_addr) = match http {
            Some((parts, addr)) => (Some(parts), Some(addr)),
            None => (None, None),
        };

        Ok(Server {
            inner: Arc::new(Inner {
                lifecycle: RwLock::new(Lifecycle {
                    state: State::Init,
                    subscribers: HashMap::new(),
                    errors: Vec::new(),
                    missed: 0,
                }),
                tasks: Mutex::new(Vec::new()),
                rpc_handle: Handle::new(),
                http_handle: http_parts.as_ref().map(|_| Handle::new()),
                shutdown_timeout: self.opts.shutdown_timeout,
                stopped: Notify::new(),
                signals_spawned: AtomicBool::new(false),
            }),
            serve: Mutex::new(Some(ServeParts {
                rpc_listener,
                rpc_router,
                http: http_parts,
            })),
            tls,
            rpc_addr,
            http_addr,
            span: self.opts.span,
        })
    }
}

fn bind(addr: SocketAddr, role: &'static str) -> Result<(StdTcpListener, SocketAddr)> {
    let bind_err = |source: io::Error| BifrostError::Bind {
        role,
        port: addr.port(),
        source: Arc::new(source),
    };
    let listener = StdTcpListener::bind(addr).map_err(bind_err)?;
    listener.set_nonblocking(true).map_err(bind_err)?;
    let local = listener.local_addr().map_err(bind_err)?;
    Ok((listener, local))
}

/// Block on OS signals for the life of the process; any of them triggers
/// the same graceful-stop path.
#[cfg(unix)]
async fn handle_signals(inner: Arc<Inner>) {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut interrupt), Ok(mut terminate), Ok(mut hangup), Ok(mut quit)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
        signal(SignalKind::quit()),
    ) else {
        error!("failed to install signal handlers");
        return;
    };

    let received = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
        _ = quit.recv() => "SIGQUIT",
        _ = inner.stopped.notified() => return,
    };

    warn!(signal = received, "received os signal, shutting down");
    inner.stop().await;
    warn!("shut down");
}

#[cfg(not(unix))]
async fn handle_signals(inner: Arc<Inner>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if result.is_err() {
                error!("failed to install interrupt handler");
                return;
            }
        }
        _ = inner.stopped.notified() => return,
    }

    warn!("received interrupt, shutting down");
    inner.stop().await;
    warn!("shut down");
}
