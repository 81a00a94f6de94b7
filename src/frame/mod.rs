// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

pub(crate) mod pdu;
pub(crate) mod tcp;

use std::{
    error,
    fmt::{self, Display},
    io::{self, Read, Seek},
};

use bytes::BufMut;

pub use self::{pdu::*, tcp::*};
use crate::{
    codec::{ByteReader, ByteWriter},
    resolver::PayloadResolver,
};

/// A Modbus protocol address is represented by 16 bit from `0` to `65535`.
///
/// This *protocol address* uses 0-based indexing, while the *register address*
/// is often specified as a number with 1-based indexing. Please consult the
/// specification of your devices if 1-based register addresses need to be
/// converted to 0-based protocol addresses by subtracting 1.
pub type Address = u16;

/// Modbus uses 16 bit for its data items.
pub type Word = u16;

/// Number of items to process.
pub type Quantity = u16;

/// Identifies the addressed device behind a _Modbus TCP_ endpoint.
pub type UnitId = u8;

/// Matches a response to its request.
pub type TransactionId = u16;

/// Set on the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Direction of a packet, i.e. which payload shape a function code selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sent by a client (master) to a server (slave).
    Command,
    /// Sent back by the server.
    Response,
}

/// A Modbus function code.
///
/// Only the register functions are decoded by the built-in resolver,
/// everything else is carried as [`FunctionCode::Custom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    /// 03 (0x03) Read Holding Registers
    ReadHoldingRegisters,

    /// 04 (0x04) Read Input Registers
    ReadInputRegisters,

    /// 06 (0x06) Write Single Register
    WriteSingleRegister,

    /// 16 (0x10) Write Multiple Registers
    WriteMultipleRegisters,

    /// Custom Modbus Function Code.
    Custom(u8),
}

impl FunctionCode {
    /// Create a new [`FunctionCode`] with `value`.
    #[must_use]
    pub const fn new(value: u8) -> Self {
        match value {
            0x03 => Self::ReadHoldingRegisters,
            0x04 => Self::ReadInputRegisters,
            0x06 => Self::WriteSingleRegister,
            0x10 => Self::WriteMultipleRegisters,
            code => Self::Custom(code),
        }
    }

    /// Gets the [`u8`] value of the current [`FunctionCode`].
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleRegister => 0x06,
            Self::WriteMultipleRegisters => 0x10,
            Self::Custom(code) => code,
        }
    }
}

impl Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value().fmt(f)
    }
}

/// Whether a raw function code signals an exception response.
#[must_use]
pub const fn is_exception(function: u8) -> bool {
    function & EXCEPTION_FLAG != 0
}

/// A server (slave) exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    /// 0x01
    IllegalFunction,
    /// 0x02
    IllegalDataAddress,
    /// 0x03
    IllegalDataValue,
    /// 0x04
    ServerDeviceFailure,
    /// 0x05
    Acknowledge,
    /// 0x06
    ServerDeviceBusy,
    /// 0x08
    MemoryParityError,
    /// 0x0A
    GatewayPathUnavailable,
    /// 0x0B
    GatewayTargetDevice,
    /// None of the above.
    ///
    /// Although encoding one of the predefined values as this is possible, it is not recommended.
    /// Instead, prefer to use [`Self::new()`] to prevent such ambiguities.
    Custom(u8),
}

impl From<ExceptionCode> for u8 {
    fn from(from: ExceptionCode) -> Self {
        from.value()
    }
}

impl ExceptionCode {
    /// Create a new [`ExceptionCode`] with `value`.
    #[must_use]
    pub const fn new(value: u8) -> Self {
        use crate::frame::ExceptionCode::*;

        match value {
            0x01 => IllegalFunction,
            0x02 => IllegalDataAddress,
            0x03 => IllegalDataValue,
            0x04 => ServerDeviceFailure,
            0x05 => Acknowledge,
            0x06 => ServerDeviceBusy,
            0x08 => MemoryParityError,
            0x0A => GatewayPathUnavailable,
            0x0B => GatewayTargetDevice,
            other => Custom(other),
        }
    }

    /// Gets the [`u8`] value of the current [`ExceptionCode`].
    #[must_use]
    pub const fn value(self) -> u8 {
        use crate::frame::ExceptionCode::*;

        match self {
            IllegalFunction => 0x01,
            IllegalDataAddress => 0x02,
            IllegalDataValue => 0x03,
            ServerDeviceFailure => 0x04,
            Acknowledge => 0x05,
            ServerDeviceBusy => 0x06,
            MemoryParityError => 0x08,
            GatewayPathUnavailable => 0x0A,
            GatewayTargetDevice => 0x0B,
            Custom(code) => code,
        }
    }

    pub(crate) fn description(&self) -> &str {
        use crate::frame::ExceptionCode::*;

        match *self {
            IllegalFunction => "Illegal function",
            IllegalDataAddress => "Illegal data address",
            IllegalDataValue => "Illegal data value",
            ServerDeviceFailure => "Server device failure",
            Acknowledge => "Acknowledge",
            ServerDeviceBusy => "Server device busy",
            MemoryParityError => "Memory parity error",
            GatewayPathUnavailable => "Gateway path unavailable",
            GatewayTargetDevice => "Gateway target device failed to respond",
            Custom(_) => "Custom",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl error::Error for ExceptionCode {
    fn description(&self) -> &str {
        self.description()
    }
}

/// The fields a single protocol layer owns, excluding its payload.
pub(crate) trait Layer {
    fn header_len(&self) -> usize;

    fn encode_header<B: BufMut>(&self, writer: &mut ByteWriter<B>);

    fn decode_header<R: Read>(&mut self, reader: &mut ByteReader<R>) -> io::Result<()>;
}

/// A node in a packet chain.
///
/// Containers ([`Packet::Mbap`] and [`Packet::Pdu`]) carry an optional
/// payload, all other kinds are leaves. Encoding writes a node's own fields
/// followed by its payload. Decoding reads the own fields and then asks
/// a [`PayloadResolver`] which kind of payload follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Mbap(Mbap),
    Pdu(Pdu),
    ReadRegisters(ReadRegisters),
    WriteRegister(WriteRegister),
    WriteMultipleRegisters(WriteMultipleRegisters),
    RegisterValues(RegisterValues),
    MultipleRegistersWritten(MultipleRegistersWritten),
    ExceptionResponse(ExceptionResponse),
}

macro_rules! with_layer {
    ($packet:expr, $layer:ident => $body:expr) => {
        match $packet {
            Packet::Mbap($layer) => $body,
            Packet::Pdu($layer) => $body,
            Packet::ReadRegisters($layer) => $body,
            Packet::WriteRegister($layer) => $body,
            Packet::WriteMultipleRegisters($layer) => $body,
            Packet::RegisterValues($layer) => $body,
            Packet::MultipleRegistersWritten($layer) => $body,
            Packet::ExceptionResponse($layer) => $body,
        }
    };
}

macro_rules! impl_from_packet_kind {
    ($($kind:ident),* $(,)?) => {
        $(
            impl From<$kind> for Packet {
                fn from(from: $kind) -> Self {
                    Self::$kind(from)
                }
            }
        )*
    };
}

impl_from_packet_kind!(
    Mbap,
    Pdu,
    ReadRegisters,
    WriteRegister,
    WriteMultipleRegisters,
    RegisterValues,
    MultipleRegistersWritten,
    ExceptionResponse,
);

impl Packet {
    /// The nested packet, if this is a container and one is set.
    #[must_use]
    pub fn payload(&self) -> Option<&Packet> {
        match self {
            Self::Mbap(mbap) => mbap.payload.as_deref(),
            Self::Pdu(pdu) => pdu.payload.as_deref(),
            _ => None,
        }
    }

    /// Total number of bytes [`Self::encode()`] writes.
    #[must_use]
    pub fn measure(&self) -> usize {
        let own = with_layer!(self, layer => layer.header_len());
        own + self.payload().map_or(0, Packet::measure)
    }

    /// Writes this packet and its payload chain.
    pub fn encode<B: BufMut>(&self, writer: &mut ByteWriter<B>) {
        with_layer!(self, layer => layer.encode_header(writer));
        if let Some(payload) = self.payload() {
            payload.encode(writer);
        }
    }

    /// Reads this packet's fields and then the payload chain selected by `resolver`.
    ///
    /// Decoding is structural: trailing bytes beyond the decoded chain are
    /// left unread. If the resolver doesn't know the payload, decoding
    /// stops at this packet.
    pub fn decode<R: Read>(
        &mut self,
        reader: &mut ByteReader<R>,
        resolver: &dyn PayloadResolver,
        direction: Direction,
    ) -> io::Result<()> {
        with_layer!(self, layer => layer.decode_header(reader))?;
        if !self.accepts_payload() {
            return Ok(());
        }
        let Some(mut payload) = resolver.resolve(self, direction) else {
            return Ok(());
        };
        payload.decode(reader, resolver, direction)?;
        self.set_payload(payload);
        Ok(())
    }

    /// Number of bytes still missing before a complete frame is buffered.
    ///
    /// Only the outermost layer is consulted by the framing logic.
    pub fn require_additional_bytes<R: Read + Seek>(
        &self,
        reader: &mut ByteReader<R>,
        buffered: usize,
    ) -> io::Result<isize> {
        match self {
            Self::Mbap(mbap) => mbap.require_additional_bytes(reader, buffered),
            Self::Pdu(_) => Ok(missing(pdu::FUNCTION_LEN, buffered)),
            leaf => Ok(missing(leaf.measure(), buffered)),
        }
    }

    fn accepts_payload(&self) -> bool {
        match self {
            Self::Mbap(mbap) => mbap.carries_pdu(),
            Self::Pdu(_) => true,
            _ => false,
        }
    }

    fn set_payload(&mut self, payload: Packet) {
        let payload = Some(Box::new(payload));
        match self {
            Self::Mbap(mbap) => mbap.payload = payload,
            Self::Pdu(pdu) => pdu.payload = payload,
            _ => debug_assert!(false, "leaf packets have no payload"),
        }
    }
}

#[allow(clippy::cast_possible_wrap)]
pub(crate) fn missing(required: usize, buffered: usize) -> isize {
    required as isize - buffered as isize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_code_values() {
        assert_eq!(FunctionCode::new(0x03), FunctionCode::ReadHoldingRegisters);
        assert_eq!(FunctionCode::new(0x04), FunctionCode::ReadInputRegisters);
        assert_eq!(FunctionCode::new(0x06), FunctionCode::WriteSingleRegister);
        assert_eq!(FunctionCode::new(0x10), FunctionCode::WriteMultipleRegisters);
        assert_eq!(FunctionCode::new(0x41), FunctionCode::Custom(0x41));
        assert_eq!(FunctionCode::Custom(0x41).value(), 0x41);
    }

    #[test]
    fn exception_flag() {
        assert!(is_exception(0x83));
        assert!(!is_exception(0x03));
    }

    #[test]
    fn exception_code_round_trip() {
        for value in 0..=u8::MAX {
            assert_eq!(ExceptionCode::new(value).value(), value);
        }
        assert_eq!(u8::from(ExceptionCode::GatewayTargetDevice), 0x0B);
        assert_eq!(
            ExceptionCode::IllegalDataAddress.to_string(),
            "Illegal data address"
        );
    }

    #[test]
    fn leaves_have_no_payload() {
        let packet = Packet::from(ReadRegisters::new(0, 1));
        assert!(packet.payload().is_none());
        assert!(!packet.accepts_payload());
    }
}
