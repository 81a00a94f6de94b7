// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus TCP proxy
//!
//! Every downstream connection is routed to one upstream device. The
//! connection opens its own [`Client`] and forwards each request through
//! it, so requests of one downstream peer never overlap upstream.
//!
//! Routing: the first target whose [`SourceFilter`] contains the peer
//! address wins, a target without a filter matches every peer. Peers
//! without a matching target are refused.

use std::{
    fmt, io,
    net::{IpAddr, SocketAddr},
    str::FromStr,
    sync::Arc,
};

use async_trait::async_trait;
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_util::{codec::Framed, sync::CancellationToken};

use super::{
    shutdown_socket, tcp::malformed_reply, Connection, ConnectionFactory, Server, ServerConfig,
};
use crate::{
    client::{Client, ClientConfig},
    codec::tcp::{ServerCodec, ServerFrame},
    error::Error,
    frame::*,
    resolver::PacketFactory,
};

/// An IP network given by address and prefix length, e.g. `10.0.0.0/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceFilter {
    pub network: IpAddr,
    pub prefix_len: u8,
}

impl SourceFilter {
    pub fn new(network: IpAddr, prefix_len: u8) -> Result<Self, Error> {
        let filter = Self {
            network,
            prefix_len,
        };
        filter.validate()?;
        Ok(filter)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let max = match self.network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if self.prefix_len > max {
            return Err(Error::Config(format!(
                "prefix length {} exceeds {max} bits",
                self.prefix_len
            )));
        }
        Ok(())
    }

    /// Whether `addr` belongs to this network.
    ///
    /// IPv4-mapped IPv6 addresses are matched against IPv4 networks.
    #[must_use]
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = match addr {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
            v4 => v4,
        };
        match (self.network, addr) {
            (IpAddr::V4(network), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32_u32.saturating_sub(u32::from(self.prefix_len)))
                    .unwrap_or(0);
                u32::from(network) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(network), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128_u32.saturating_sub(u32::from(self.prefix_len)))
                    .unwrap_or(0);
                u128::from(network) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }
}

impl fmt::Display for SourceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for SourceFilter {
    type Err = Error;

    /// Parses `address/prefix`, a bare address matches only itself.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Config(format!("invalid source filter '{s}'"));
        let (network, prefix_len) = match s.split_once('/') {
            Some((network, prefix_len)) => (
                network.trim().parse::<IpAddr>().map_err(|_| invalid())?,
                Some(prefix_len.trim().parse::<u8>().map_err(|_| invalid())?),
            ),
            None => (s.trim().parse::<IpAddr>().map_err(|_| invalid())?, None),
        };
        let prefix_len = prefix_len.unwrap_or(if network.is_ipv4() { 32 } else { 128 });
        Self::new(network, prefix_len)
    }
}

/// An upstream device and the downstream peers routed to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ProxyTargetConfig {
    /// Peers routed to this target, all peers if `None`.
    pub source: Option<SourceFilter>,
    pub client: ClientConfig,
}

impl ProxyTargetConfig {
    #[must_use]
    pub fn new(client: ClientConfig) -> Self {
        Self {
            source: None,
            client,
        }
    }

    #[must_use]
    pub fn with_source(self, source: SourceFilter) -> Self {
        Self {
            source: Some(source),
            ..self
        }
    }

    #[must_use]
    pub fn matches(&self, peer: IpAddr) -> bool {
        self.source.map_or(true, |source| source.contains(peer))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ProxyConfig {
    pub server: ServerConfig,
    /// Candidates in routing order.
    pub targets: Vec<ProxyTargetConfig>,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), Error> {
        self.server.validate()?;
        if self.targets.is_empty() {
            return Err(Error::Config("no proxy targets".to_owned()));
        }
        for target in &self.targets {
            if let Some(source) = &target.source {
                source.validate()?;
            }
            target.client.validate()?;
        }
        Ok(())
    }

    /// The first target matching `peer`.
    #[must_use]
    pub fn route(&self, peer: IpAddr) -> Option<&ProxyTargetConfig> {
        self.targets.iter().find(|target| target.matches(peer))
    }
}

/// Creates a [`ProxyConnection`] to the routed target of every peer.
#[derive(Debug)]
pub struct ProxyConnectionFactory {
    config: ProxyConfig,
    swap: bool,
    factory: PacketFactory,
    resolver: Arc<PacketFactory>,
}

impl ProxyConnectionFactory {
    /// Forwards the functions known to the default [`PacketFactory`].
    pub fn new(config: ProxyConfig) -> Result<Self, Error> {
        Self::with_factory(config, PacketFactory::default())
    }

    /// Decodes downstream requests and upstream responses with `factory`,
    /// e.g. to forward custom function codes.
    pub fn with_factory(config: ProxyConfig, factory: PacketFactory) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            swap: config.server.byte_order.requires_swap(),
            config,
            resolver: Arc::new(factory.clone()),
            factory,
        })
    }
}

#[async_trait]
impl ConnectionFactory for ProxyConnectionFactory {
    async fn create(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<Box<dyn Connection>> {
        let target = self.config.route(peer.ip()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("no proxy target for {peer}"),
            )
        })?;
        log::debug!(
            "Routing {peer} to {}:{}",
            target.client.host,
            target.client.port
        );
        let factory = self
            .factory
            .clone()
            .with_protocol_id(target.client.protocol_id);
        let upstream = Client::with_factory(target.client.clone(), factory)?;
        stream.set_nodelay(true)?;
        let codec = ServerCodec::new(
            self.swap,
            self.config.server.max_frame_size,
            self.resolver.clone(),
        );
        Ok(Box::new(ProxyConnection {
            downstream: Framed::new(stream, codec),
            upstream,
            peer,
        }))
    }
}

/// Forwards the requests of one downstream peer to its upstream device.
#[derive(Debug)]
pub struct ProxyConnection {
    downstream: Framed<TcpStream, ServerCodec>,
    upstream: Client,
    peer: SocketAddr,
}

impl ProxyConnection {
    /// The response to `frame`, or the error that ends the connection.
    async fn forward(&self, frame: &ServerFrame, cancel: &CancellationToken) -> Result<Mbap, Error> {
        let request = match frame {
            ServerFrame::Request(request) => request,
            ServerFrame::Malformed(request) => {
                log::debug!("Malformed request from {}", self.peer);
                return Ok(malformed_reply(request));
            }
        };
        let Some(pdu) = request.pdu() else {
            return Err(Error::Reception(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame without PDU from {}", self.peer),
            )));
        };
        if pdu.payload.is_none() {
            return Ok(request.reply(Pdu::exception(
                pdu.function,
                ExceptionCode::IllegalFunction,
            )));
        }
        match self.upstream.transceive(request, cancel).await {
            Ok(mut response) => {
                response.transaction_id = request.transaction_id;
                Ok(response)
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                log::warn!("Forwarding request from {} failed: {err}", self.peer);
                if err.is_transport() {
                    return Err(err);
                }
                Ok(request.reply(Pdu::exception(
                    pdu.function,
                    ExceptionCode::GatewayTargetDevice,
                )))
            }
        }
    }

    async fn serve(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        self.upstream.connect(cancel).await?;
        loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    log::trace!("Shutdown signal received");
                    return Ok(());
                }
                frame = self.downstream.next() => frame,
            };
            let Some(frame) = frame.transpose().map_err(Error::Reception)? else {
                return Ok(());
            };
            match self.forward(&frame, cancel).await {
                Ok(response) => self
                    .downstream
                    .send(response)
                    .await
                    .map_err(Error::Transmission)?,
                Err(err) => {
                    let gateway_reply = match &frame {
                        ServerFrame::Request(request) if err.is_transport() => {
                            request.pdu().map(|pdu| {
                                request.reply(Pdu::exception(
                                    pdu.function,
                                    ExceptionCode::GatewayTargetDevice,
                                ))
                            })
                        }
                        _ => None,
                    };
                    if let Some(response) = gateway_reply {
                        self.downstream
                            .send(response)
                            .await
                            .map_err(Error::Transmission)?;
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl Connection for ProxyConnection {
    async fn execute(&mut self, cancel: CancellationToken) -> io::Result<()> {
        match self.serve(&cancel).await {
            Ok(()) | Err(Error::Cancelled) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn close(&mut self) {
        shutdown_socket(self.downstream.get_ref());
        if let Err(err) = self.upstream.disconnect().await {
            log::debug!("Disconnecting upstream of {} failed: {err}", self.peer);
        }
    }
}

/// A [`Server`] forwarding requests to the configured targets.
#[derive(Debug)]
pub struct Proxy {
    server: Server,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Result<Self, Error> {
        Self::with_factory(config, PacketFactory::default())
    }

    /// A proxy whose connections decode frames with `factory`.
    pub fn with_factory(config: ProxyConfig, factory: PacketFactory) -> Result<Self, Error> {
        let server_config = config.server.clone();
        let connections = ProxyConnectionFactory::with_factory(config, factory)?;
        let server = Server::new(server_config, Arc::new(connections))?;
        Ok(Self { server })
    }

    /// Starts accepting downstream connections, see [`Server::start()`].
    pub async fn start(&self) -> Result<SocketAddr, Error> {
        self.server.start().await
    }

    pub async fn stop(&self) {
        self.server.stop().await;
    }

    #[must_use]
    pub fn server(&self) -> &Server {
        &self.server
    }
}
