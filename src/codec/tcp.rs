// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{
    io::{Cursor, Error, Result},
    sync::Arc,
};

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::{ByteReader, ByteWriter};
use crate::{error::ProtocolError, frame::*, resolver::PayloadResolver};

/// A complete frame received by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// A frame decoded as far as the resolver knows its payloads.
    Request(Mbap),
    /// A frame with a function code whose payload could not be decoded,
    /// e.g. because its byte count is off.
    ///
    /// Holds the header and a PDU without payload.
    Malformed(Mbap),
}

/// Resolves the PDU of a frame but none of its payloads.
#[derive(Debug)]
struct HeaderOnly;

impl PayloadResolver for HeaderOnly {
    fn resolve(&self, header: &Packet, _: Direction) -> Option<Packet> {
        match header {
            Packet::Mbap(_) => Some(Pdu::default().into()),
            _ => None,
        }
    }
}

/// Frames commands received by a server and encodes its responses.
#[derive(Debug, Clone)]
pub struct ServerCodec {
    swap: bool,
    max_frame_size: usize,
    resolver: Arc<dyn PayloadResolver>,
}

impl ServerCodec {
    #[must_use]
    pub fn new(swap: bool, max_frame_size: usize, resolver: Arc<dyn PayloadResolver>) -> Self {
        Self {
            swap,
            max_frame_size,
            resolver,
        }
    }
}

impl Decoder for ServerCodec {
    type Item = ServerFrame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ServerFrame>> {
        let mut buffered = ByteReader::new(Cursor::new(&buf[..]), self.swap);
        let required = Mbap::default().require_additional_bytes(&mut buffered, buf.len())?;
        let frame_len = buf.len().saturating_add_signed(required);
        if frame_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                len: frame_len,
                max: self.max_frame_size,
            }
            .into());
        }
        if required > 0 {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }
        let frame = buf.split_to(frame_len).freeze();
        let mut reader = ByteReader::new(&frame[..], self.swap);
        match Mbap::decode(&mut reader, &*self.resolver, Direction::Command) {
            Ok(request) => Ok(Some(ServerFrame::Request(request))),
            Err(err) => {
                let mut reader = ByteReader::new(&frame[..], self.swap);
                let request = Mbap::decode(&mut reader, &HeaderOnly, Direction::Command)?;
                if request.pdu().is_none() {
                    return Err(err);
                }
                log::debug!("Malformed request: {err}");
                Ok(Some(ServerFrame::Malformed(request)))
            }
        }
    }
}

impl Encoder<Mbap> for ServerCodec {
    type Error = Error;

    fn encode(&mut self, frame: Mbap, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(frame.measure());
        frame.encode(&mut ByteWriter::new(buf, self.swap));
        Ok(())
    }
}
