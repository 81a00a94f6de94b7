// SPDX-FileCopyrightText: Copyright (c) 2017-2023 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io::{self, Read, Seek};

use bytes::BufMut;

use super::*;
use crate::codec::u16_len;

/// Byte offset of the data length field.
pub const LENGTH_FIELD_OFFSET: u64 = 6;

/// Number of bytes up to and including the data length field.
pub const LENGTH_FIELD_END: usize = 8;

/// _Modbus TCP_ application header (MBAP) with its PDU.
///
/// Wire layout, all 16 bit fields in the configured byte order:
///
/// | offset | field            |
/// |--------|------------------|
/// | 0..2   | transaction id   |
/// | 2..4   | protocol id      |
/// | 4..6   | protocol type    |
/// | 6..8   | data length      |
/// | 8      | unit id          |
/// | 9..    | PDU              |
///
/// The data length is always derived from the payload when encoding.
///
/// Two frames are equal if they encode to the same bytes. The data length
/// of a decoded frame only takes part in the comparison where it changes
/// the encoding, i.e. for a frame that ends after the length field.
#[derive(Debug, Clone, Default)]
pub struct Mbap {
    pub transaction_id: TransactionId,
    pub protocol_id: u16,
    pub protocol_type: u16,
    pub unit_id: UnitId,
    pub payload: Option<Box<Packet>>,
    declared_length: Option<u16>,
}

impl PartialEq for Mbap {
    fn eq(&self, other: &Self) -> bool {
        let Self {
            transaction_id,
            protocol_id,
            protocol_type,
            unit_id,
            payload,
            declared_length: _,
        } = self;
        *transaction_id == other.transaction_id
            && *protocol_id == other.protocol_id
            && *protocol_type == other.protocol_type
            && *unit_id == other.unit_id
            && *payload == other.payload
            && self.is_truncated() == other.is_truncated()
    }
}

impl Eq for Mbap {}

impl Mbap {
    #[must_use]
    pub fn new(transaction_id: TransactionId, protocol_id: u16, unit_id: UnitId, pdu: Pdu) -> Self {
        Self {
            transaction_id,
            protocol_id,
            protocol_type: 0,
            unit_id,
            payload: Some(Box::new(pdu.into())),
            declared_length: None,
        }
    }

    /// A response frame with the identifiers of this frame.
    #[must_use]
    pub fn reply(&self, pdu: Pdu) -> Self {
        Self {
            protocol_type: self.protocol_type,
            ..Self::new(self.transaction_id, self.protocol_id, self.unit_id, pdu)
        }
    }

    /// Decodes a complete frame.
    pub fn decode<R: Read>(
        reader: &mut ByteReader<R>,
        resolver: &dyn PayloadResolver,
        direction: Direction,
    ) -> io::Result<Self> {
        let mut packet = Packet::Mbap(Self::default());
        packet.decode(reader, resolver, direction)?;
        let Packet::Mbap(mbap) = packet else {
            unreachable!("decoding never changes the packet kind");
        };
        Ok(mbap)
    }

    /// Writes the complete frame.
    pub fn encode<B: BufMut>(&self, writer: &mut ByteWriter<B>) {
        self.encode_header(writer);
        if let Some(payload) = &self.payload {
            payload.encode(writer);
        }
    }

    /// Full frame length in bytes.
    #[must_use]
    pub fn measure(&self) -> usize {
        self.header_len() + self.payload.as_deref().map_or(0, Packet::measure)
    }

    /// The data length found on the wire, for decoded frames.
    #[must_use]
    pub fn declared_length(&self) -> Option<u16> {
        self.declared_length
    }

    /// The data length as written on encode: unit id plus PDU.
    #[must_use]
    pub fn data_length(&self) -> u16 {
        if self.is_truncated() {
            return 0;
        }
        u16_len(1 + self.payload.as_deref().map_or(0, Packet::measure))
    }

    #[must_use]
    pub fn pdu(&self) -> Option<&Pdu> {
        match self.payload.as_deref() {
            Some(Packet::Pdu(pdu)) => Some(pdu),
            _ => None,
        }
    }

    /// Number of bytes still missing before the frame is complete.
    ///
    /// Positive while more bytes are needed, zero or negative once the
    /// buffer holds at least one complete frame. While fewer than
    /// [`LENGTH_FIELD_END`] bytes are buffered only the header is requested,
    /// afterwards the declared data length is read from the buffer.
    pub fn require_additional_bytes<R: Read + Seek>(
        &self,
        reader: &mut ByteReader<R>,
        buffered: usize,
    ) -> io::Result<isize> {
        if buffered < LENGTH_FIELD_END {
            return Ok(missing(LENGTH_FIELD_END, buffered));
        }
        reader.seek(LENGTH_FIELD_OFFSET)?;
        let declared = reader.read_u16()?;
        reader.seek(0)?;
        Ok(missing(LENGTH_FIELD_END + usize::from(declared), buffered))
    }

    pub(crate) fn carries_pdu(&self) -> bool {
        self.declared_length.map_or(true, |len| len > 1)
    }

    fn is_truncated(&self) -> bool {
        self.payload.is_none() && self.declared_length == Some(0)
    }
}

impl Layer for Mbap {
    fn header_len(&self) -> usize {
        if self.is_truncated() {
            LENGTH_FIELD_END
        } else {
            LENGTH_FIELD_END + 1
        }
    }

    fn encode_header<B: BufMut>(&self, writer: &mut ByteWriter<B>) {
        writer.write_u16(self.transaction_id);
        writer.write_u16(self.protocol_id);
        writer.write_u16(self.protocol_type);
        writer.write_u16(self.data_length());
        if !self.is_truncated() {
            writer.write_u8(self.unit_id);
        }
    }

    fn decode_header<R: Read>(&mut self, reader: &mut ByteReader<R>) -> io::Result<()> {
        self.transaction_id = reader.read_u16()?;
        self.protocol_id = reader.read_u16()?;
        self.protocol_type = reader.read_u16()?;
        let declared = reader.read_u16()?;
        self.declared_length = Some(declared);
        self.payload = None;
        if declared > 0 {
            self.unit_id = reader.read_u8()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::{codec::ByteOrder, resolver::PacketFactory};

    const READ_COMMAND: [u8; 14] = [
        0x12, 0x34, 0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x7E, 0x32, 0x00, 0x02,
    ];

    const READ_RESPONSE: [u8; 15] = [
        0x12, 0x34, 0x00, 0x01, 0x00, 0x00, 0x00, 0x0A, 0x01, 0x03, 0x04, 0x01, 0x02, 0x03, 0x04,
    ];

    fn swap() -> bool {
        ByteOrder::BigEndian.requires_swap()
    }

    fn encode(mbap: &Mbap) -> Vec<u8> {
        let mut buf = Vec::new();
        mbap.encode(&mut ByteWriter::new(&mut buf, swap()));
        buf
    }

    fn decode(bytes: &[u8], direction: Direction) -> io::Result<Mbap> {
        let mut reader = ByteReader::new(bytes, swap());
        Mbap::decode(&mut reader, &PacketFactory::default(), direction)
    }

    fn required(bytes: &[u8]) -> isize {
        let mut reader = ByteReader::new(Cursor::new(bytes), swap());
        Mbap::default()
            .require_additional_bytes(&mut reader, bytes.len())
            .unwrap()
    }

    #[test]
    fn encode_read_command() {
        let factory = PacketFactory::default()
            .with_protocol_id(1)
            .with_initial_transaction_id(0x1234);
        let tx = factory.read_registers(1, 0x7E32, 2);
        let bytes = encode(&tx);
        assert_eq!(bytes, READ_COMMAND);
        assert_eq!(tx.measure(), bytes.len());
        assert_eq!(tx.data_length(), 6);
    }

    #[test]
    fn decode_read_response() {
        let rx = decode(&READ_RESPONSE, Direction::Response).unwrap();
        assert_eq!(rx.transaction_id, 0x1234);
        assert_eq!(rx.protocol_id, 1);
        assert_eq!(rx.unit_id, 1);
        assert_eq!(rx.declared_length(), Some(0x0A));
        let pdu = rx.pdu().unwrap();
        assert_eq!(pdu.function_code(), FunctionCode::ReadHoldingRegisters);
        let Some(Packet::RegisterValues(values)) = pdu.payload() else {
            panic!("unexpected payload: {:?}", pdu.payload());
        };
        assert_eq!(values.byte_count(), 4);
        assert_eq!(values.buffer().as_ref(), &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(values.words(), [0x0102, 0x0304]);
    }

    #[test]
    fn decode_exception_response() {
        let bytes = [0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x04];
        let rx = decode(&bytes, Direction::Response).unwrap();
        let pdu = rx.pdu().unwrap();
        assert!(pdu.is_exception());
        assert_eq!(pdu.function_code(), FunctionCode::ReadHoldingRegisters);
        let Some(Packet::ExceptionResponse(exception)) = pdu.payload() else {
            panic!("unexpected payload: {:?}", pdu.payload());
        };
        assert_eq!(exception.exception(), ExceptionCode::ServerDeviceFailure);
    }

    #[test]
    fn decode_command_direction() {
        let rx = decode(&READ_COMMAND, Direction::Command).unwrap();
        let Some(Packet::ReadRegisters(read)) = rx.pdu().and_then(Pdu::payload) else {
            panic!("unexpected frame: {rx:?}");
        };
        assert_eq!(*read, ReadRegisters::new(0x7E32, 2));
    }

    #[test]
    fn decode_unknown_function_stops_at_pdu() {
        let bytes = [0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x01, 0x41, 0xFF];
        let rx = decode(&bytes, Direction::Response).unwrap();
        let pdu = rx.pdu().unwrap();
        assert_eq!(pdu.function, 0x41);
        assert!(pdu.payload().is_none());
    }

    #[test]
    fn decode_short_frame_fails() {
        let err = decode(&READ_COMMAND[..12], Direction::Command).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn framing_converges_byte_by_byte() {
        for len in 0..LENGTH_FIELD_END {
            assert_eq!(required(&READ_COMMAND[..len]), missing(LENGTH_FIELD_END, len));
        }
        for len in LENGTH_FIELD_END..READ_COMMAND.len() {
            let expected = missing(READ_COMMAND.len(), len);
            assert!(expected > 0);
            assert_eq!(required(&READ_COMMAND[..len]), expected);
        }
        assert_eq!(required(&READ_COMMAND), 0);
    }

    #[test]
    fn framing_reports_surplus_bytes() {
        let mut bytes = READ_COMMAND.to_vec();
        bytes.extend_from_slice(&[0xFF, 0xFF]);
        assert_eq!(required(&bytes), -2);
    }

    #[test]
    fn zero_length_frame() {
        let bytes = [0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(required(&bytes), 0);
        let rx = decode(&bytes, Direction::Response).unwrap();
        assert_eq!(rx.transaction_id, 7);
        assert_eq!(rx.declared_length(), Some(0));
        assert!(rx.payload.is_none());
        assert_eq!(rx.measure(), LENGTH_FIELD_END);
        assert_eq!(encode(&rx), bytes);

        let header_only = Mbap {
            transaction_id: 7,
            ..Mbap::default()
        };
        assert_eq!(encode(&header_only).len(), LENGTH_FIELD_END + 1);
        assert_ne!(rx, header_only);
    }

    #[test]
    fn equality_ignores_declared_length_of_complete_frames() {
        let rx = decode(&READ_RESPONSE, Direction::Response).unwrap();
        let rebuilt = rx.reply(Pdu::new(
            FunctionCode::ReadHoldingRegisters,
            RegisterValues::new(vec![0x01, 0x02, 0x03, 0x04]),
        ));
        assert_eq!(rx.declared_length(), Some(0x0A));
        assert_eq!(rebuilt.declared_length(), None);
        assert_eq!(rx, rebuilt);
    }

    #[test]
    fn unit_id_only_frame() {
        let bytes = [0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x11];
        let rx = decode(&bytes, Direction::Response).unwrap();
        assert_eq!(rx.unit_id, 0x11);
        assert!(rx.pdu().is_none());
        assert_eq!(encode(&rx), bytes);
    }

    #[test]
    fn padded_frame_is_tolerated() {
        let mut bytes = READ_COMMAND.to_vec();
        bytes[7] = 0x08;
        bytes.extend_from_slice(&[0x00, 0x00]);
        let rx = decode(&bytes, Direction::Command).unwrap();
        assert_eq!(rx.declared_length(), Some(8));
        assert_eq!(rx.data_length(), 6);
    }

    #[test]
    fn encode_then_decode_keeps_fields() {
        let factory = PacketFactory::default().with_initial_transaction_id(0xFFFF);
        let frames = [
            factory.read_input_registers(3, 0x0100, 0x7D),
            factory.write_register(4, 0x0002, 0xBEEF),
            factory.write_multiple_registers(5, 0x0010, vec![1, 2, 3]),
        ];
        for tx in frames {
            let bytes = encode(&tx);
            assert_eq!(bytes.len(), tx.measure());
            let rx = decode(&bytes, Direction::Command).unwrap();
            assert_eq!(rx, tx);
            assert_eq!(rx.declared_length(), Some(tx.data_length()));
        }
    }

    #[test]
    fn reply_echoes_identifiers() {
        let request = decode(&READ_COMMAND, Direction::Command).unwrap();
        let reply = request.reply(Pdu::exception(0x03, ExceptionCode::IllegalDataAddress));
        assert_eq!(reply.transaction_id, 0x1234);
        assert_eq!(reply.protocol_id, 1);
        assert_eq!(reply.unit_id, 1);
        assert_eq!(
            encode(&reply),
            [0x12, 0x34, 0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02]
        );
    }
}
