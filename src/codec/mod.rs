// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Endian-aware byte stream I/O
//!
//! Every multi-byte value read or written through [`ByteReader`] and
//! [`ByteWriter`] passes a single choke point that either copies the
//! native representation straight through or reverses it. Whether to
//! reverse is decided once, by comparing the host byte order with the
//! [`ByteOrder`] of the peer (see [`ByteOrder::requires_swap()`]).

use std::io::{self, Read, Seek, SeekFrom};

use byteorder::ReadBytesExt as _;

use bytes::BufMut;

pub(crate) mod pool;

#[cfg(feature = "tcp-server")]
pub mod tcp;

pub use self::pool::{BufferPool, PooledBuffer};

#[allow(clippy::cast_possible_truncation)]
pub(crate) fn u16_len(len: usize) -> u16 {
    // This type conversion should always be safe, because either
    // the caller is responsible to pass a valid usize or the
    // possible values are limited by the protocol.
    debug_assert!(len <= u16::MAX.into());
    len as u16
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) fn u8_len(len: usize) -> u8 {
    // This type conversion should always be safe, because either
    // the caller is responsible to pass a valid usize or the
    // possible values are limited by the protocol.
    debug_assert!(len <= u8::MAX.into());
    len as u8
}

/// Byte order of multi-byte values on the wire.
///
/// _Modbus_ transmits registers big-endian. Some devices deviate and
/// send little-endian values, which is what [`ByteOrder::LittleEndian`]
/// is for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ByteOrder {
    /// Most significant byte first (network byte order).
    #[default]
    BigEndian,
    /// Least significant byte first.
    LittleEndian,
}

impl ByteOrder {
    /// Byte order of the host this code is running on.
    #[must_use]
    pub const fn native() -> Self {
        if cfg!(target_endian = "little") {
            Self::LittleEndian
        } else {
            Self::BigEndian
        }
    }

    /// Whether values have to be byte-reversed between host and wire.
    #[must_use]
    pub fn requires_swap(self) -> bool {
        self != Self::native()
    }
}

/// A fixed-width value that can be moved through the byte stream
/// as its raw in-memory representation.
///
/// Implemented for all built-in integer and floating point types, which
/// allows register codecs to be written generically over numbers.
pub trait Primitive: Copy + Send + Sync + 'static {
    /// Width in bytes.
    const SIZE: usize;

    /// Raw byte array of this type.
    type Bytes: AsRef<[u8]> + AsMut<[u8]> + Default;

    /// Native (host order) representation.
    fn to_ne_bytes(self) -> Self::Bytes;

    /// Reinterprets host order bytes as a value.
    fn from_ne_bytes(bytes: Self::Bytes) -> Self;

    /// Lossy numeric view, used for gain scaling.
    fn to_f64(self) -> f64;
}

macro_rules! impl_primitive {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Primitive for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                type Bytes = [u8; std::mem::size_of::<$ty>()];

                fn to_ne_bytes(self) -> Self::Bytes {
                    <$ty>::to_ne_bytes(self)
                }

                fn from_ne_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_ne_bytes(bytes)
                }

                #[allow(clippy::cast_lossless, clippy::cast_precision_loss)]
                fn to_f64(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

impl_primitive!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Reads primitive values from a byte stream, optionally reversing
/// the byte order of each value.
#[derive(Debug)]
pub struct ByteReader<R> {
    inner: R,
    swap: bool,
}

impl<R> ByteReader<R> {
    #[must_use]
    pub fn new(inner: R, swap: bool) -> Self {
        Self { inner, swap }
    }

    #[must_use]
    pub fn is_swapping(&self) -> bool {
        self.swap
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> ByteReader<R> {
    /// Single bytes are never swapped.
    pub fn read_u8(&mut self) -> io::Result<u8> {
        self.inner.read_u8()
    }

    pub fn read_u16(&mut self) -> io::Result<u16> {
        self.read()
    }

    /// Reads `T::SIZE` raw bytes and reinterprets them as `T`.
    pub fn read<T: Primitive>(&mut self) -> io::Result<T> {
        let mut bytes = T::Bytes::default();
        self.inner.read_exact(bytes.as_mut())?;
        if self.swap {
            bytes.as_mut().reverse();
        }
        Ok(T::from_ne_bytes(bytes))
    }

    /// Reads `len` bytes verbatim, i.e. without any reordering.
    pub fn read_bytes(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut bytes = vec![0; len];
        self.inner.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

impl<R: Seek> ByteReader<R> {
    pub fn seek(&mut self, pos: u64) -> io::Result<u64> {
        self.inner.seek(SeekFrom::Start(pos))
    }
}

/// Writes primitive values into a buffer, optionally reversing the
/// byte order of each value.
///
/// Writing past the end of a fixed-size buffer (e.g. `&mut [u8]`) panics,
/// so callers size their buffers by measuring first.
#[derive(Debug)]
pub struct ByteWriter<W> {
    inner: W,
    swap: bool,
}

impl<W> ByteWriter<W> {
    #[must_use]
    pub fn new(inner: W, swap: bool) -> Self {
        Self { inner, swap }
    }

    #[must_use]
    pub fn is_swapping(&self) -> bool {
        self.swap
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: BufMut> ByteWriter<W> {
    pub fn write_u8(&mut self, value: u8) {
        self.inner.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write(value);
    }

    pub fn write<T: Primitive>(&mut self, value: T) {
        let mut bytes = value.to_ne_bytes();
        if self.swap {
            bytes.as_mut().reverse();
        }
        self.inner.put_slice(bytes.as_ref());
    }

    /// Writes `bytes` verbatim, i.e. without any reordering.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.inner.put_slice(bytes);
    }

    /// Number of bytes that can still be written.
    pub fn remaining(&self) -> usize {
        self.inner.remaining_mut()
    }
}
