// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types.

use std::io;

use thiserror::Error;

use crate::frame::Address;

/// Error type of all fallible operations in this crate.
///
/// _Modbus_ exception responses are not errors at this level. They are
/// regular replies and returned as the inner error of [`crate::Result`].
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration was rejected before any I/O took place.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Establishing or accepting a connection failed.
    #[error("connection failed: {0}")]
    Connect(#[source] io::Error),

    /// Sending a packet failed or timed out.
    #[error("Modbus transmission failed: {0}")]
    Transmission(#[source] io::Error),

    /// Receiving or decoding a packet failed or timed out.
    #[error("Modbus packet reception failed: {0}")]
    Reception(#[source] io::Error),

    /// The peer or the caller violated the protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

/// Violations detected while building, mapping or interpreting packets.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A response carried a function code that no resolver understands.
    #[error("unsupported function code 0x{0:02X}")]
    UnsupportedFunction(u8),

    /// The response doesn't match the request.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Registers to read or write don't fit into a single request.
    #[error("span of {count} registers exceeds the maximum of {max}")]
    SpanTooLarge { count: usize, max: u16 },

    /// A request that would not transfer any registers.
    #[error("no registers to transfer")]
    EmptySpan,

    /// Two register definitions claim the same address.
    #[error("register '{label}' at 0x{address:04X} overlaps the preceding register ending at 0x{previous_end:04X}")]
    Overlap {
        label: String,
        address: Address,
        previous_end: u32,
    },

    /// A register definition ends beyond the address space.
    #[error("register '{label}' at 0x{address:04X} exceeds the address range")]
    AddressOverflow { label: String, address: Address },

    /// A register codec needs more bytes than its definition spans.
    #[error("register '{label}' needs {width} bytes but spans only {available}")]
    CodecTooWide {
        label: String,
        width: usize,
        available: usize,
    },

    /// A register buffer is shorter than the definitions require.
    #[error("register buffer holds {actual} bytes but {expected} are required")]
    BufferTooShort { expected: usize, actual: usize },

    /// A frame declares more data than the receive buffer can hold.
    #[error("frame of {len} bytes exceeds the maximum frame size of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}

impl From<ProtocolError> for std::io::Error {
    fn from(from: ProtocolError) -> Self {
        Self::new(std::io::ErrorKind::InvalidData, from)
    }
}

impl From<Error> for std::io::Error {
    fn from(from: Error) -> Self {
        match from {
            Error::Connect(err) | Error::Transmission(err) | Error::Reception(err) => err,
            Error::Protocol(err) => err.into(),
            Error::Cancelled => Self::new(std::io::ErrorKind::Interrupted, from),
            Error::Config(_) => Self::new(std::io::ErrorKind::InvalidInput, from),
        }
    }
}

impl Error {
    /// Whether the connection must be considered broken after this error.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Transmission(_) | Self::Reception(_)
        )
    }
}
