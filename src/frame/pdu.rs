// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io::{self, Read};

use byteorder::{BigEndian, ByteOrder as _};
use bytes::{BufMut, Bytes};

use super::*;
use crate::{
    codec::{u16_len, u8_len},
    error::ProtocolError,
};

pub(crate) const FUNCTION_LEN: usize = 1;

/// Upper bound of registers per read request.
pub const MAX_READ_REGISTERS: Quantity = 0x7D;

/// Upper bound of registers per write request.
pub const MAX_WRITE_REGISTERS: Quantity = 0x7B;

/// Checks that `count` registers fit into a single request.
pub(crate) fn check_count(count: usize, max: Quantity) -> Result<(), ProtocolError> {
    if count == 0 {
        return Err(ProtocolError::EmptySpan);
    }
    if count > usize::from(max) {
        return Err(ProtocolError::SpanTooLarge { count, max });
    }
    Ok(())
}

/// Protocol data unit: a function code followed by its payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pdu {
    /// Raw function code, with [`EXCEPTION_FLAG`] set on exception responses.
    pub function: u8,
    pub payload: Option<Box<Packet>>,
}

impl Pdu {
    #[must_use]
    pub fn new(function: FunctionCode, payload: impl Into<Packet>) -> Self {
        Self {
            function: function.value(),
            payload: Some(Box::new(payload.into())),
        }
    }

    /// The exception response to a request with `function`.
    #[must_use]
    pub fn exception(function: u8, exception: ExceptionCode) -> Self {
        Self {
            function: function | EXCEPTION_FLAG,
            payload: Some(Box::new(ExceptionResponse::new(exception).into())),
        }
    }

    /// The function code with the exception flag cleared.
    #[must_use]
    pub fn function_code(&self) -> FunctionCode {
        FunctionCode::new(self.function & !EXCEPTION_FLAG)
    }

    #[must_use]
    pub fn is_exception(&self) -> bool {
        is_exception(self.function)
    }

    #[must_use]
    pub fn payload(&self) -> Option<&Packet> {
        self.payload.as_deref()
    }

    /// Checks that the payload fits its count and byte count fields.
    pub fn check_limits(&self) -> Result<(), ProtocolError> {
        match self.payload() {
            Some(Packet::ReadRegisters(read)) => {
                check_count(read.count.into(), MAX_READ_REGISTERS)
            }
            Some(Packet::WriteMultipleRegisters(write)) => {
                check_count(write.values.len(), MAX_WRITE_REGISTERS)
            }
            Some(Packet::RegisterValues(values)) => {
                let count = (values.buffer.len() + 1) / 2;
                if count > usize::from(MAX_READ_REGISTERS) {
                    return Err(ProtocolError::SpanTooLarge {
                        count,
                        max: MAX_READ_REGISTERS,
                    });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Layer for Pdu {
    fn header_len(&self) -> usize {
        FUNCTION_LEN
    }

    fn encode_header<B: BufMut>(&self, writer: &mut ByteWriter<B>) {
        writer.write_u8(self.function);
    }

    fn decode_header<R: Read>(&mut self, reader: &mut ByteReader<R>) -> io::Result<()> {
        self.function = reader.read_u8()?;
        Ok(())
    }
}

/// Command of functions 0x03 and 0x04.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadRegisters {
    pub start_address: Address,
    pub count: Quantity,
}

impl ReadRegisters {
    #[must_use]
    pub const fn new(start_address: Address, count: Quantity) -> Self {
        Self {
            start_address,
            count,
        }
    }
}

impl Layer for ReadRegisters {
    fn header_len(&self) -> usize {
        4
    }

    fn encode_header<B: BufMut>(&self, writer: &mut ByteWriter<B>) {
        writer.write_u16(self.start_address);
        writer.write_u16(self.count);
    }

    fn decode_header<R: Read>(&mut self, reader: &mut ByteReader<R>) -> io::Result<()> {
        self.start_address = reader.read_u16()?;
        self.count = reader.read_u16()?;
        Ok(())
    }
}

/// Command and response of function 0x06.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteRegister {
    pub address: Address,
    pub value: Word,
}

impl WriteRegister {
    #[must_use]
    pub const fn new(address: Address, value: Word) -> Self {
        Self { address, value }
    }
}

impl Layer for WriteRegister {
    fn header_len(&self) -> usize {
        4
    }

    fn encode_header<B: BufMut>(&self, writer: &mut ByteWriter<B>) {
        writer.write_u16(self.address);
        writer.write_u16(self.value);
    }

    fn decode_header<R: Read>(&mut self, reader: &mut ByteReader<R>) -> io::Result<()> {
        self.address = reader.read_u16()?;
        self.value = reader.read_u16()?;
        Ok(())
    }
}

/// Command of function 0x10.
///
/// Register count and byte count are derived from `values`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteMultipleRegisters {
    pub start_address: Address,
    pub values: Vec<Word>,
}

impl WriteMultipleRegisters {
    #[must_use]
    pub fn new(start_address: Address, values: impl Into<Vec<Word>>) -> Self {
        Self {
            start_address,
            values: values.into(),
        }
    }

    #[must_use]
    pub fn count(&self) -> Quantity {
        u16_len(self.values.len())
    }

    #[must_use]
    pub fn byte_count(&self) -> u8 {
        u8_len(self.values.len() * 2)
    }
}

impl Layer for WriteMultipleRegisters {
    fn header_len(&self) -> usize {
        5 + self.values.len() * 2
    }

    fn encode_header<B: BufMut>(&self, writer: &mut ByteWriter<B>) {
        writer.write_u16(self.start_address);
        writer.write_u16(self.count());
        writer.write_u8(self.byte_count());
        for value in &self.values {
            writer.write_u16(*value);
        }
    }

    fn decode_header<R: Read>(&mut self, reader: &mut ByteReader<R>) -> io::Result<()> {
        self.start_address = reader.read_u16()?;
        let count = reader.read_u16()?;
        let byte_count = reader.read_u8()?;
        if usize::from(byte_count) != usize::from(count) * 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("byte count {byte_count} doesn't match {count} registers"),
            ));
        }
        self.values = (0..count)
            .map(|_| reader.read_u16())
            .collect::<io::Result<_>>()?;
        Ok(())
    }
}

/// Response of functions 0x03 and 0x04.
///
/// The register contents are kept as raw bytes in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterValues {
    buffer: Bytes,
}

impl RegisterValues {
    #[must_use]
    pub fn new(buffer: impl Into<Bytes>) -> Self {
        Self {
            buffer: buffer.into(),
        }
    }

    /// Packs `words` in _Modbus_ (big-endian) register order.
    #[must_use]
    pub fn from_words(words: &[Word]) -> Self {
        let mut buffer = vec![0; words.len() * 2];
        BigEndian::write_u16_into(words, &mut buffer);
        Self::new(buffer)
    }

    #[must_use]
    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    #[must_use]
    pub fn byte_count(&self) -> u8 {
        u8_len(self.buffer.len())
    }

    /// Unpacks the buffer as big-endian registers, ignoring an odd trailing byte.
    #[must_use]
    pub fn words(&self) -> Vec<Word> {
        let mut words = vec![0; self.buffer.len() / 2];
        BigEndian::read_u16_into(&self.buffer[..words.len() * 2], &mut words);
        words
    }
}

impl Layer for RegisterValues {
    fn header_len(&self) -> usize {
        1 + self.buffer.len()
    }

    fn encode_header<B: BufMut>(&self, writer: &mut ByteWriter<B>) {
        writer.write_u8(self.byte_count());
        writer.write_bytes(&self.buffer);
    }

    fn decode_header<R: Read>(&mut self, reader: &mut ByteReader<R>) -> io::Result<()> {
        let byte_count = reader.read_u8()?;
        self.buffer = reader.read_bytes(byte_count.into())?.into();
        Ok(())
    }
}

/// Response of function 0x10.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultipleRegistersWritten {
    pub start_address: Address,
    pub count: Quantity,
}

impl MultipleRegistersWritten {
    #[must_use]
    pub const fn new(start_address: Address, count: Quantity) -> Self {
        Self {
            start_address,
            count,
        }
    }
}

impl Layer for MultipleRegistersWritten {
    fn header_len(&self) -> usize {
        4
    }

    fn encode_header<B: BufMut>(&self, writer: &mut ByteWriter<B>) {
        writer.write_u16(self.start_address);
        writer.write_u16(self.count);
    }

    fn decode_header<R: Read>(&mut self, reader: &mut ByteReader<R>) -> io::Result<()> {
        self.start_address = reader.read_u16()?;
        self.count = reader.read_u16()?;
        Ok(())
    }
}

/// Payload of any PDU whose function code has [`EXCEPTION_FLAG`] set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExceptionResponse {
    pub exception_code: u8,
}

impl ExceptionResponse {
    #[must_use]
    pub fn new(exception: ExceptionCode) -> Self {
        Self {
            exception_code: exception.value(),
        }
    }

    #[must_use]
    pub fn exception(&self) -> ExceptionCode {
        ExceptionCode::new(self.exception_code)
    }
}

impl fmt::Display for ExceptionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus exception: {}", self.exception())
    }
}

impl error::Error for ExceptionResponse {}

impl Layer for ExceptionResponse {
    fn header_len(&self) -> usize {
        1
    }

    fn encode_header<B: BufMut>(&self, writer: &mut ByteWriter<B>) {
        writer.write_u8(self.exception_code);
    }

    fn decode_header<R: Read>(&mut self, reader: &mut ByteReader<R>) -> io::Result<()> {
        self.exception_code = reader.read_u8()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteOrder;

    fn encode(packet: impl Into<Packet>) -> Vec<u8> {
        let packet = packet.into();
        let mut buf = Vec::new();
        packet.encode(&mut ByteWriter::new(&mut buf, ByteOrder::BigEndian.requires_swap()));
        assert_eq!(buf.len(), packet.measure());
        buf
    }

    #[test]
    fn encode_write_multiple_registers() {
        let bytes = encode(WriteMultipleRegisters::new(0x0010, [0xABCD, 0xEF12]));
        assert_eq!(bytes, [0x00, 0x10, 0x00, 0x02, 0x04, 0xAB, 0xCD, 0xEF, 0x12]);
    }

    #[test]
    fn decode_write_multiple_registers_rejects_byte_count_mismatch() {
        let bytes = [0x00, 0x10, 0x00, 0x02, 0x03, 0xAB, 0xCD, 0xEF];
        let mut reader = ByteReader::new(&bytes[..], ByteOrder::BigEndian.requires_swap());
        let err = WriteMultipleRegisters::default()
            .decode_header(&mut reader)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn register_values_words() {
        let values = RegisterValues::from_words(&[0x1234, 0xABCD]);
        assert_eq!(values.buffer().as_ref(), &[0x12, 0x34, 0xAB, 0xCD]);
        assert_eq!(values.byte_count(), 4);
        assert_eq!(values.words(), [0x1234, 0xABCD]);
        assert_eq!(encode(values), [0x04, 0x12, 0x34, 0xAB, 0xCD]);
    }

    #[test]
    fn register_values_are_never_swapped() {
        let values = RegisterValues::new(vec![0x01, 0x02]);
        let mut buf = Vec::new();
        Packet::from(values).encode(&mut ByteWriter::new(&mut buf, true));
        assert_eq!(buf, [0x02, 0x01, 0x02]);
    }

    #[test]
    fn exception_pdu() {
        let pdu = Pdu::exception(0x03, ExceptionCode::ServerDeviceFailure);
        assert_eq!(pdu.function, 0x83);
        assert!(pdu.is_exception());
        assert_eq!(pdu.function_code(), FunctionCode::ReadHoldingRegisters);
        assert_eq!(encode(pdu), [0x83, 0x04]);
    }

    #[test]
    fn limits_of_register_counts() {
        let write = |count: usize| {
            Pdu::new(
                FunctionCode::WriteMultipleRegisters,
                WriteMultipleRegisters::new(0, vec![0; count]),
            )
            .check_limits()
        };
        assert!(write(0x7B).is_ok());
        assert!(matches!(
            write(200),
            Err(ProtocolError::SpanTooLarge { count: 200, max: 0x7B })
        ));
        assert!(matches!(write(0), Err(ProtocolError::EmptySpan)));

        let read = |count| {
            Pdu::new(FunctionCode::ReadHoldingRegisters, ReadRegisters::new(0, count))
                .check_limits()
        };
        assert!(read(0x7D).is_ok());
        assert!(matches!(
            read(0x7E),
            Err(ProtocolError::SpanTooLarge { count: 0x7E, max: 0x7D })
        ));

        let values = Pdu::new(
            FunctionCode::ReadHoldingRegisters,
            RegisterValues::new(vec![0; 256]),
        );
        assert!(values.check_limits().is_err());
        assert!(Pdu::exception(0x03, ExceptionCode::Acknowledge)
            .check_limits()
            .is_ok());
    }
}
