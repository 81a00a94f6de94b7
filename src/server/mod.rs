// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus TCP server skeleton
//!
//! A [`Server`] accepts connections and hands each one to a
//! [`ConnectionFactory`]. Every [`Connection`] runs in its own task until
//! it finishes, fails or the server is stopped. A failing connection never
//! affects the accept loop or other connections.

pub mod proxy;
pub mod service;
pub mod tcp;

use std::{
    collections::HashMap,
    fmt, io,
    net::{Shutdown, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use socket2::{Domain, SockRef, Socket, Type};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    client::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT},
    codec::ByteOrder,
    error::Error,
};

const DEFAULT_INITIALIZATION_TIMEOUT_SECS: u64 = 30;

/// Listener settings of a [`Server`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ServerConfig {
    /// Host name or IP address to listen on.
    pub listen_on: String,
    /// Port to listen on, `0` picks a free port.
    pub port: u16,
    /// Byte order of connections accepted by the server.
    pub byte_order: ByteOrder,
    /// Upper bound of resolving and binding the listen address.
    pub initialization_timeout_secs: u64,
    /// Upper bound of a single received frame.
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_on: "127.0.0.1".to_owned(),
            port: DEFAULT_PORT,
            byte_order: ByteOrder::default(),
            initialization_timeout_secs: DEFAULT_INITIALIZATION_TIMEOUT_SECS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    /// Default settings for listening on `listen_on:port`.
    #[must_use]
    pub fn new(listen_on: impl Into<String>, port: u16) -> Self {
        Self {
            listen_on: listen_on.into(),
            port,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.listen_on.trim().is_empty() {
            return Err(Error::Config("missing listen address".to_owned()));
        }
        if self.max_frame_size == 0 {
            return Err(Error::Config("invalid max frame size 0".to_owned()));
        }
        if self.initialization_timeout_secs == 0 {
            return Err(Error::Config("initialization timeout must not be zero".to_owned()));
        }
        Ok(())
    }

    #[must_use]
    pub fn initialization_timeout(&self) -> Duration {
        Duration::from_secs(self.initialization_timeout_secs)
    }
}

/// A single accepted connection.
#[async_trait]
pub trait Connection: Send {
    /// Serves the peer until it disconnects, fails or `cancel` fires.
    async fn execute(&mut self, cancel: CancellationToken) -> io::Result<()>;

    /// Releases the socket. Called exactly once after [`Self::execute()`].
    async fn close(&mut self);
}

/// Creates a [`Connection`] for every accepted socket.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Refusing a peer is done by returning an error, which closes the socket.
    async fn create(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<Box<dyn Connection>>;
}

/// Lifecycle of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Initializing,
    Accepting,
    Stopping,
}

#[derive(Debug, Default)]
struct Registry {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, SocketAddr>>,
}

impl Registry {
    fn insert(&self, peer: SocketAddr) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, peer);
        id
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, SocketAddr>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Running {
    shutdown: CancellationToken,
    accept_loop: JoinHandle<()>,
}

/// A TCP server that delegates every connection to a [`ConnectionFactory`].
pub struct Server {
    config: ServerConfig,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<State>,
    running: tokio::sync::Mutex<Option<Running>>,
    registry: Arc<Registry>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(
        config: ServerConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            config,
            factory,
            state: Mutex::new(State::Stopped),
            running: tokio::sync::Mutex::new(None),
            registry: Arc::default(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> State {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of connections currently being served.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    fn set_state(&self, state: State) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// Returns the local address the server is listening on.
    pub async fn start(&self) -> Result<SocketAddr, Error> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::Config(format!("server is {:?}", self.state())));
        }
        self.set_state(State::Initializing);
        let bound = tokio::time::timeout(self.config.initialization_timeout(), bind(&self.config))
            .await
            .unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "initialization timed out",
                ))
            });
        let listener = match bound {
            Ok(listener) => listener,
            Err(err) => {
                self.set_state(State::Stopped);
                return Err(Error::Connect(err));
            }
        };
        let local_addr = listener.local_addr().map_err(Error::Connect)?;
        log::info!("Listening on {local_addr}");
        let shutdown = CancellationToken::new();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.factory),
            Arc::clone(&self.registry),
            shutdown.clone(),
        ));
        *running = Some(Running {
            shutdown,
            accept_loop,
        });
        self.set_state(State::Accepting);
        Ok(local_addr)
    }

    /// Stops accepting, cancels all connections and waits for the accept loop to exit.
    ///
    /// Connections finish their current request before they observe the
    /// cancellation.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running {
            shutdown,
            accept_loop,
        }) = running.take()
        else {
            return;
        };
        self.set_state(State::Stopping);
        shutdown.cancel();
        if let Err(err) = accept_loop.await {
            log::error!("Accept loop aborted: {err}");
        }
        self.set_state(State::Stopped);
    }
}

async fn bind(config: &ServerConfig) -> io::Result<TcpListener> {
    let addr = tokio::net::lookup_host((config.listen_on.as_str(), config.port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("cannot resolve {}", config.listen_on),
            )
        })?;
    listener(addr)
}

/// Start TCP listener - configure and open TCP socket
fn listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let listener = match addr {
        SocketAddr::V4(_) => Socket::new(Domain::IPV4, Type::STREAM, None)?,
        SocketAddr::V6(_) => Socket::new(Domain::IPV6, Type::STREAM, None)?,
    };
    listener.set_reuse_address(true)?;
    listener.set_nonblocking(true)?;
    listener.bind(&addr.into())?;
    listener.listen(1024)?;
    TcpListener::from_std(listener.into())
}

async fn accept_loop(
    listener: TcpListener,
    factory: Arc<dyn ConnectionFactory>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                log::trace!("Shutdown signal received");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::error!("Accepting connection failed: {err}");
                    continue;
                }
            },
        };
        log::debug!("Accepted connection from {peer}");
        let connection = match factory.create(stream, peer).await {
            Ok(connection) => connection,
            Err(err) => {
                log::warn!("Refused connection from {peer}: {err}");
                continue;
            }
        };
        let id = registry.insert(peer);
        tokio::spawn(supervise(
            connection,
            peer,
            shutdown.child_token(),
            Arc::clone(&registry),
            id,
        ));
    }
}

/// Runs a connection to completion, containing its failures.
async fn supervise(
    mut connection: Box<dyn Connection>,
    peer: SocketAddr,
    cancel: CancellationToken,
    registry: Arc<Registry>,
    id: u64,
) {
    let served = tokio::spawn(async move {
        let result = connection.execute(cancel).await;
        connection.close().await;
        result
    })
    .await;
    match served {
        Ok(Ok(())) => log::debug!("Connection from {peer} closed"),
        Ok(Err(err)) => log::error!("Connection from {peer} failed: {err}"),
        Err(err) => log::error!("Connection from {peer} aborted: {err}"),
    }
    registry.remove(id);
}

/// Shuts both directions of `stream` down, ignoring sockets that are already gone.
pub(crate) fn shutdown_socket(stream: &TcpStream) {
    if let Err(err) = SockRef::from(stream).shutdown(Shutdown::Both) {
        if err.kind() != io::ErrorKind::NotConnected {
            log::debug!("Shutting down socket failed: {err}");
        }
    }
}
