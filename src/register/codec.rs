// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt, io};

use crate::codec::{ByteReader, ByteWriter, Primitive};

/// Converts between register bytes and a typed value.
pub trait Register: fmt::Debug + fmt::Display + Send + Sync {
    /// Number of bytes consumed and produced.
    fn width(&self) -> usize;

    /// Whether a value has been decoded or set.
    fn is_initialized(&self) -> bool;

    fn decode(&mut self, reader: &mut ByteReader<&[u8]>) -> io::Result<()>;

    /// Writes the current value. Without a value all bytes are zero.
    fn encode(&self, writer: &mut ByteWriter<&mut [u8]>);

    /// The numeric view of this register, if it holds a number.
    fn as_f64(&self) -> Option<f64> {
        None
    }
}

/// A number occupying `T::SIZE` bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Numeric<T> {
    value: Option<T>,
}

pub type U8Register = Numeric<u8>;
pub type I8Register = Numeric<i8>;
pub type U16Register = Numeric<u16>;
pub type I16Register = Numeric<i16>;
pub type U32Register = Numeric<u32>;
pub type I32Register = Numeric<i32>;
pub type U64Register = Numeric<u64>;
pub type I64Register = Numeric<i64>;
pub type F32Register = Numeric<f32>;
pub type F64Register = Numeric<f64>;

impl<T: Primitive> Numeric<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self { value: None }
    }

    #[must_use]
    pub const fn with_value(value: T) -> Self {
        Self { value: Some(value) }
    }

    #[must_use]
    pub fn value(&self) -> Option<T> {
        self.value
    }

    pub fn set_value(&mut self, value: T) {
        self.value = Some(value);
    }
}

impl<T: Primitive + fmt::Display> fmt::Display for Numeric<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => value.fmt(f),
            None => f.write_str("null value"),
        }
    }
}

impl<T: Primitive + fmt::Debug + fmt::Display> Register for Numeric<T> {
    fn width(&self) -> usize {
        T::SIZE
    }

    fn is_initialized(&self) -> bool {
        self.value.is_some()
    }

    fn decode(&mut self, reader: &mut ByteReader<&[u8]>) -> io::Result<()> {
        self.value = Some(reader.read()?);
        Ok(())
    }

    fn encode(&self, writer: &mut ByteWriter<&mut [u8]>) {
        match self.value {
            Some(value) => writer.write(value),
            None => writer.write_bytes(T::Bytes::default().as_ref()),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        self.value.map(Primitive::to_f64)
    }
}

/// A fixed-length ASCII string.
///
/// Shorter values are padded with NUL bytes on encode, trailing NUL bytes
/// are trimmed on decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixedString {
    len: usize,
    value: Option<String>,
}

impl FixedString {
    #[must_use]
    pub const fn new(len: usize) -> Self {
        Self { len, value: None }
    }

    #[must_use]
    pub fn with_value(len: usize, value: impl Into<String>) -> Self {
        Self {
            len,
            value: Some(value.into()),
        }
    }

    #[must_use]
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = Some(value.into());
    }
}

impl fmt::Display for FixedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.value().unwrap_or("null value"))
    }
}

impl Register for FixedString {
    fn width(&self) -> usize {
        self.len
    }

    fn is_initialized(&self) -> bool {
        self.value.is_some()
    }

    fn decode(&mut self, reader: &mut ByteReader<&[u8]>) -> io::Result<()> {
        let bytes = reader.read_bytes(self.len)?;
        let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |pos| pos + 1);
        let value = bytes[..end]
            .iter()
            .map(|b| if b.is_ascii() { char::from(*b) } else { '?' })
            .collect();
        self.value = Some(value);
        Ok(())
    }

    fn encode(&self, writer: &mut ByteWriter<&mut [u8]>) {
        let mut bytes = vec![0; self.len];
        let value = self.value().unwrap_or_default();
        for (dst, src) in bytes.iter_mut().zip(value.bytes()) {
            *dst = if src.is_ascii() { src } else { b'?' };
        }
        writer.write_bytes(&bytes);
    }
}
