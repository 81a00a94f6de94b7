// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus TCP slave connections

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_util::{codec::Framed, sync::CancellationToken};

use super::{
    service::{Service, SlaveRequest},
    shutdown_socket, Connection, ConnectionFactory, ServerConfig,
};
use crate::{
    codec::tcp::{ServerCodec, ServerFrame},
    frame::*,
    resolver::PacketFactory,
};

/// Serves every accepted connection with a shared [`Service`].
#[derive(Debug)]
pub struct SlaveConnectionFactory<S> {
    service: Arc<S>,
    swap: bool,
    max_frame_size: usize,
    resolver: Arc<PacketFactory>,
}

impl<S> SlaveConnectionFactory<S> {
    /// Decodes requests with the default [`PacketFactory`].
    pub fn new(config: &ServerConfig, service: S) -> Self {
        Self::with_factory(config, service, PacketFactory::default())
    }

    /// Decodes requests with `resolver`, e.g. to accept custom function codes.
    pub fn with_factory(config: &ServerConfig, service: S, resolver: PacketFactory) -> Self {
        Self {
            service: Arc::new(service),
            swap: config.byte_order.requires_swap(),
            max_frame_size: config.max_frame_size,
            resolver: Arc::new(resolver),
        }
    }
}

#[async_trait]
impl<S> ConnectionFactory for SlaveConnectionFactory<S>
where
    S: Service<Request = SlaveRequest, Response = Packet, Exception = ExceptionCode>
        + Send
        + Sync
        + 'static,
{
    async fn create(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<Box<dyn Connection>> {
        stream.set_nodelay(true)?;
        let codec = ServerCodec::new(self.swap, self.max_frame_size, self.resolver.clone());
        Ok(Box::new(SlaveConnection {
            framed: Framed::new(stream, codec),
            service: Arc::clone(&self.service),
            peer,
        }))
    }
}

/// The request-response loop of a single peer.
#[derive(Debug)]
pub struct SlaveConnection<S> {
    framed: Framed<TcpStream, ServerCodec>,
    service: Arc<S>,
    peer: SocketAddr,
}

impl<S> SlaveConnection<S>
where
    S: Service<Request = SlaveRequest, Response = Packet, Exception = ExceptionCode>,
{
    async fn respond(&self, frame: ServerFrame) -> io::Result<Mbap> {
        let request = match frame {
            ServerFrame::Request(request) => request,
            ServerFrame::Malformed(request) => {
                log::debug!("Malformed request from {}", self.peer);
                return Ok(malformed_reply(&request));
            }
        };
        let Some(pdu) = request.pdu() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame without PDU from {}", self.peer),
            ));
        };
        let function = pdu.function_code();
        let Some(payload) = pdu.payload().cloned() else {
            log::debug!("Unsupported function {} from {}", pdu.function, self.peer);
            return Ok(request.reply(Pdu::exception(
                pdu.function,
                ExceptionCode::IllegalFunction,
            )));
        };
        let req = SlaveRequest {
            unit_id: request.unit_id,
            function,
            payload,
        };
        let pdu = match self.service.call(req).await {
            Ok(rsp) => Pdu::new(function, rsp),
            Err(exception) => Pdu::exception(function.value(), exception),
        };
        if let Err(err) = pdu.check_limits() {
            log::warn!("Discarding response to {}: {err}", self.peer);
            return Ok(request.reply(Pdu::exception(
                function.value(),
                ExceptionCode::ServerDeviceFailure,
            )));
        }
        Ok(request.reply(pdu))
    }
}

/// The reply to a request whose payload doesn't match its function code.
pub(crate) fn malformed_reply(request: &Mbap) -> Mbap {
    let function = request.pdu().map_or(0, |pdu| pdu.function);
    request.reply(Pdu::exception(function, ExceptionCode::IllegalDataValue))
}

#[async_trait]
impl<S> Connection for SlaveConnection<S>
where
    S: Service<Request = SlaveRequest, Response = Packet, Exception = ExceptionCode>
        + Send
        + Sync
        + 'static,
{
    async fn execute(&mut self, cancel: CancellationToken) -> io::Result<()> {
        loop {
            let request = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    log::trace!("Shutdown signal received");
                    return Ok(());
                }
                request = self.framed.next() => request,
            };
            // tcp socket closed
            let Some(request) = request.transpose()? else {
                return Ok(());
            };
            let response = self.respond(request).await?;
            self.framed.send(response).await?;
        }
    }

    async fn close(&mut self) {
        shutdown_socket(self.framed.get_ref());
    }
}
