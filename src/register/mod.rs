// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mapping of typed register definitions onto register buffers
//!
//! A buffer always starts at the lowest address of the definitions it
//! belongs to. Addresses between two definitions are gaps and skipped.

mod codec;

use std::fmt;

pub use self::codec::*;
use crate::{
    codec::{ByteReader, ByteWriter},
    error::{Error, ProtocolError},
    frame::Address,
};

/// Bytes per register.
const REGISTER_WIDTH: usize = 2;

/// A typed value at a register address.
#[derive(Debug)]
pub struct RegisterDefinition {
    pub label: String,
    pub address: Address,
    /// Number of consecutive registers covered.
    pub register_count: u8,
    pub unit: Option<String>,
    /// Factor applied to numeric values for display.
    pub gain: f64,
    pub readable: bool,
    pub writable: bool,
    pub register: Box<dyn Register>,
}

impl RegisterDefinition {
    /// A readable, non-writable definition without unit and a gain of 1.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        address: Address,
        register_count: u8,
        register: impl Register + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            address,
            register_count,
            unit: None,
            gain: 1.0,
            readable: true,
            writable: false,
            register: Box::new(register),
        }
    }

    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    #[must_use]
    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    #[must_use]
    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// First address after this definition.
    #[must_use]
    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.register_count)
    }

    /// Size of the covered registers in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        usize::from(self.register_count) * REGISTER_WIDTH
    }

    /// The numeric value multiplied by the gain.
    #[must_use]
    pub fn scaled_value(&self) -> Option<f64> {
        self.register.as_f64().map(|value| value * self.gain)
    }
}

impl fmt::Display for RegisterDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X} {}: ", self.address, self.label)?;
        match self.scaled_value() {
            Some(value) => write!(f, "{value}")?,
            None => write!(f, "{}", self.register)?,
        }
        if let Some(unit) = &self.unit {
            write!(f, " {unit}")?;
        }
        Ok(())
    }
}

/// The register range `(start, count)` spanning all definitions.
///
/// Returns `(0, 0)` if there are no definitions.
#[must_use]
pub fn covering_span(definitions: &[RegisterDefinition]) -> (Address, usize) {
    span(definitions)
}

fn span<'a>(definitions: impl IntoIterator<Item = &'a RegisterDefinition>) -> (Address, usize) {
    let mut bounds: Option<(Address, u32)> = None;
    for def in definitions {
        let (start, end) = bounds.get_or_insert((def.address, def.end()));
        *start = (*start).min(def.address);
        *end = (*end).max(def.end());
    }
    let Some((start, end)) = bounds else {
        return (0, 0);
    };
    #[allow(clippy::cast_possible_truncation)]
    let count = (end - u32::from(start)) as usize;
    (start, count)
}

/// Checks definitions for overlaps and codecs wider than their registers.
pub fn validate_layout<'a>(
    definitions: impl IntoIterator<Item = &'a RegisterDefinition>,
) -> Result<(), Error> {
    let mut sorted: Vec<&RegisterDefinition> = definitions.into_iter().collect();
    sorted.sort_by_key(|def| def.address);
    validate_sorted(sorted)
}

fn validate_sorted<'a>(sorted: impl IntoIterator<Item = &'a RegisterDefinition>) -> Result<(), Error> {
    let mut previous_end: Option<u32> = None;
    for def in sorted {
        if def.end() > u32::from(Address::MAX) + 1 {
            return Err(ProtocolError::AddressOverflow {
                label: def.label.clone(),
                address: def.address,
            }
            .into());
        }
        if let Some(previous_end) = previous_end {
            if u32::from(def.address) < previous_end {
                return Err(ProtocolError::Overlap {
                    label: def.label.clone(),
                    address: def.address,
                    previous_end,
                }
                .into());
            }
        }
        if def.register.width() > def.byte_len() {
            return Err(ProtocolError::CodecTooWide {
                label: def.label.clone(),
                width: def.register.width(),
                available: def.byte_len(),
            }
            .into());
        }
        previous_end = Some(def.end());
    }
    Ok(())
}

fn byte_offset(base: Address, address: Address) -> usize {
    usize::from(address - base) * REGISTER_WIDTH
}

/// Decodes the values of all definitions from `buffer`.
///
/// The buffer must start at the lowest definition address. Nothing is
/// decoded if the definitions overlap or the buffer is too short.
pub fn decode_buffer(
    definitions: &mut [RegisterDefinition],
    buffer: &[u8],
    swap: bool,
) -> Result<(), Error> {
    let mut sorted: Vec<&mut RegisterDefinition> = definitions.iter_mut().collect();
    sorted.sort_by_key(|def| def.address);
    validate_sorted(sorted.iter().map(|def| &**def))?;
    let Some(base) = sorted.first().map(|def| def.address) else {
        return Ok(());
    };
    let (_, count) = span(sorted.iter().map(|def| &**def));
    let expected = count * REGISTER_WIDTH;
    if buffer.len() < expected {
        return Err(ProtocolError::BufferTooShort {
            expected,
            actual: buffer.len(),
        }
        .into());
    }
    for def in sorted {
        let offset = byte_offset(base, def.address);
        let mut reader = ByteReader::new(&buffer[offset..offset + def.byte_len()], swap);
        def.register.decode(&mut reader).map_err(Error::Reception)?;
    }
    Ok(())
}

/// Encodes the values of all definitions into a new buffer.
///
/// Returns the start address and the buffer covering all definitions,
/// with gaps filled by zeros.
pub fn encode_buffer<'a>(
    definitions: impl IntoIterator<Item = &'a RegisterDefinition>,
    swap: bool,
) -> Result<(Address, Vec<u8>), Error> {
    let mut sorted: Vec<&RegisterDefinition> = definitions.into_iter().collect();
    sorted.sort_by_key(|def| def.address);
    validate_sorted(sorted.iter().copied())?;
    let (base, count) = span(sorted.iter().copied());
    let mut buffer = vec![0; count * REGISTER_WIDTH];
    for def in sorted {
        let offset = byte_offset(base, def.address);
        let mut writer = ByteWriter::new(&mut buffer[offset..offset + def.byte_len()], swap);
        def.register.encode(&mut writer);
    }
    Ok((base, buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteOrder;

    fn swap() -> bool {
        ByteOrder::BigEndian.requires_swap()
    }

    fn definitions() -> Vec<RegisterDefinition> {
        vec![
            RegisterDefinition::new("Power", 0x0104, 2, I32Register::new())
                .with_unit("W")
                .with_gain(0.1),
            RegisterDefinition::new("Voltage", 0x0100, 1, U16Register::new()).with_unit("V"),
            RegisterDefinition::new("Name", 0x0106, 2, FixedString::new(4)),
        ]
    }

    #[test]
    fn span_covers_all_definitions() {
        assert_eq!(covering_span(&definitions()), (0x0100, 8));
        assert_eq!(covering_span(&[]), (0, 0));
    }

    #[test]
    fn decode_with_gap() {
        let mut defs = definitions();
        #[rustfmt::skip]
        let buffer = [
            0x00, 0xE6,             // 0x0100 Voltage
            0xFF, 0xFF, 0xFF, 0xFF, // 0x0101..0x0103 gap
            0x00, 0x00,
            0x00, 0x00, 0x04, 0xD2, // 0x0104 Power
            b'M', b'B', 0x00, 0x00, // 0x0106 Name
        ];
        decode_buffer(&mut defs, &buffer, swap()).unwrap();
        assert_eq!(defs[0].to_string(), "0x0104 Power: 123.4 W");
        assert_eq!(defs[1].to_string(), "0x0100 Voltage: 230 V");
        assert_eq!(defs[2].to_string(), "0x0106 Name: MB");
        assert!(defs.iter().all(|def| def.register.is_initialized()));
    }

    #[test]
    fn decode_rejects_overlap_without_decoding() {
        let mut defs = definitions();
        defs.push(RegisterDefinition::new("Current", 0x0105, 1, U16Register::new()));
        let buffer = [0; 16];
        let err = decode_buffer(&mut defs, &buffer, swap()).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::Overlap { address: 0x0105, .. })
        ));
        assert!(defs.iter().all(|def| !def.register.is_initialized()));
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let mut defs = definitions();
        let err = decode_buffer(&mut defs, &[0; 15], swap()).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::BufferTooShort {
                expected: 16,
                actual: 15
            })
        ));
    }

    #[test]
    fn decode_rejects_codec_wider_than_definition() {
        let mut defs = vec![RegisterDefinition::new("Energy", 0, 1, U32Register::new())];
        let err = decode_buffer(&mut defs, &[0; 4], swap()).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::CodecTooWide { width: 4, available: 2, .. })
        ));
    }

    #[test]
    fn narrow_codec_reads_leading_bytes() {
        let mut defs = vec![RegisterDefinition::new("Mode", 0x10, 1, U8Register::new())];
        decode_buffer(&mut defs, &[0x07, 0xFF], swap()).unwrap();
        assert_eq!(defs[0].to_string(), "0x0010 Mode: 7");
    }

    #[test]
    fn encode_fills_gaps_with_zeros() {
        let defs = vec![
            RegisterDefinition::new("Setpoint", 0x0200, 1, U16Register::with_value(0x1234)),
            RegisterDefinition::new("Limit", 0x0203, 2, U32Register::with_value(0xAABB_CCDD)),
        ];
        let (start, buffer) = encode_buffer(&defs, swap()).unwrap();
        assert_eq!(start, 0x0200);
        assert_eq!(
            buffer,
            [0x12, 0x34, 0x00, 0x00, 0x00, 0x00, 0xAA, 0xBB, 0xCC, 0xDD]
        );
    }

    #[test]
    fn encode_then_decode() {
        let defs = vec![
            RegisterDefinition::new("Temperature", 0x0010, 2, F32Register::with_value(21.5)),
            RegisterDefinition::new("Offset", 0x0012, 1, I16Register::with_value(-5)),
        ];
        let (_, buffer) = encode_buffer(&defs, swap()).unwrap();
        let mut decoded = vec![
            RegisterDefinition::new("Temperature", 0x0010, 2, F32Register::new()),
            RegisterDefinition::new("Offset", 0x0012, 1, I16Register::new()),
        ];
        decode_buffer(&mut decoded, &buffer, swap()).unwrap();
        assert_eq!(decoded[0].scaled_value(), Some(21.5));
        assert_eq!(decoded[1].scaled_value(), Some(-5.0));
    }

    #[test]
    fn address_overflow() {
        let defs = vec![RegisterDefinition::new("Last", u16::MAX, 2, U32Register::new())];
        assert!(matches!(
            encode_buffer(&defs, swap()),
            Err(Error::Protocol(ProtocolError::AddressOverflow { .. }))
        ));
    }

    #[test]
    fn display_without_value() {
        let def = RegisterDefinition::new("Voltage", 0x0100, 1, U16Register::new());
        assert_eq!(def.to_string(), "0x0100 Voltage: null value");
    }
}
