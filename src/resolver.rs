// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Payload resolution and packet construction

use std::{
    fmt,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
};

use crate::frame::*;

/// Decides which payload follows an already decoded header.
///
/// Resolvers are consulted in order, the first one returning a packet wins.
/// Returning `None` leaves the payload of the header unset, which ends
/// decoding of the chain.
pub trait PayloadResolver: fmt::Debug + Send + Sync {
    /// An empty packet of the kind that follows `header`.
    fn resolve(&self, header: &Packet, direction: Direction) -> Option<Packet>;
}

/// Creates an empty payload packet to decode into.
pub type PayloadConstructor = fn() -> Packet;

#[derive(Clone, Copy)]
struct Entry {
    function: u8,
    direction: Direction,
    construct: PayloadConstructor,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("function", &self.function)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

const fn entry(function: FunctionCode, direction: Direction, construct: PayloadConstructor) -> Entry {
    Entry {
        function: function.value(),
        direction,
        construct,
    }
}

fn read_registers() -> Packet {
    ReadRegisters::default().into()
}

fn register_values() -> Packet {
    RegisterValues::default().into()
}

fn write_register() -> Packet {
    WriteRegister::default().into()
}

fn write_multiple_registers() -> Packet {
    WriteMultipleRegisters::default().into()
}

fn multiple_registers_written() -> Packet {
    MultipleRegistersWritten::default().into()
}

const BASIC_TABLE: [Entry; 8] = [
    entry(FunctionCode::ReadHoldingRegisters, Direction::Command, read_registers),
    entry(FunctionCode::ReadHoldingRegisters, Direction::Response, register_values),
    entry(FunctionCode::ReadInputRegisters, Direction::Command, read_registers),
    entry(FunctionCode::ReadInputRegisters, Direction::Response, register_values),
    entry(FunctionCode::WriteSingleRegister, Direction::Command, write_register),
    entry(FunctionCode::WriteSingleRegister, Direction::Response, write_register),
    entry(
        FunctionCode::WriteMultipleRegisters,
        Direction::Command,
        write_multiple_registers,
    ),
    entry(
        FunctionCode::WriteMultipleRegisters,
        Direction::Response,
        multiple_registers_written,
    ),
];

fn lookup(table: &[Entry], function: u8, direction: Direction) -> Option<Packet> {
    table
        .iter()
        .find(|entry| entry.function == function && entry.direction == direction)
        .map(|entry| (entry.construct)())
}

/// Knows the MBAP → PDU step and the register functions.
///
/// Any PDU whose function code has the exception flag set is followed by
/// an [`ExceptionResponse`] in response direction.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicPayloadResolver;

impl PayloadResolver for BasicPayloadResolver {
    fn resolve(&self, header: &Packet, direction: Direction) -> Option<Packet> {
        match header {
            Packet::Mbap(_) => Some(Pdu::default().into()),
            Packet::Pdu(pdu) => {
                if direction == Direction::Response && pdu.is_exception() {
                    return Some(ExceptionResponse::default().into());
                }
                lookup(&BASIC_TABLE, pdu.function, direction)
            }
            _ => None,
        }
    }
}

/// Maps additional (e.g. vendor specific) function codes onto the
/// existing payload kinds.
///
/// ```
/// use mbap_stack::{Direction, FunctionCode, PacketFactory, ReadRegisters, RegisterValues, TableResolver};
///
/// let vendor_read = FunctionCode::Custom(0x41);
/// let resolver = TableResolver::default()
///     .with(vendor_read, Direction::Command, || ReadRegisters::default().into())
///     .with(vendor_read, Direction::Response, || RegisterValues::default().into());
/// let mut factory = PacketFactory::default();
/// factory.add(resolver);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TableResolver {
    entries: Vec<Entry>,
}

impl TableResolver {
    #[must_use]
    pub fn with(mut self, function: FunctionCode, direction: Direction, construct: PayloadConstructor) -> Self {
        self.entries.push(entry(function, direction, construct));
        self
    }
}

impl PayloadResolver for TableResolver {
    fn resolve(&self, header: &Packet, direction: Direction) -> Option<Packet> {
        match header {
            Packet::Pdu(pdu) => lookup(&self.entries, pdu.function, direction),
            _ => None,
        }
    }
}

/// Builds command frames and resolves payloads for decoding.
///
/// Transaction ids are taken from a wrapping 16 bit counter.
#[derive(Debug)]
pub struct PacketFactory {
    resolvers: Vec<Arc<dyn PayloadResolver>>,
    protocol_id: u16,
    transaction_id: AtomicU16,
}

impl Default for PacketFactory {
    fn default() -> Self {
        Self {
            resolvers: vec![Arc::new(BasicPayloadResolver)],
            protocol_id: 0,
            transaction_id: AtomicU16::new(0),
        }
    }
}

/// The clone shares the resolvers and continues with the next
/// transaction id of the original.
impl Clone for PacketFactory {
    fn clone(&self) -> Self {
        Self {
            resolvers: self.resolvers.clone(),
            protocol_id: self.protocol_id,
            transaction_id: AtomicU16::new(self.transaction_id.load(Ordering::Relaxed)),
        }
    }
}

impl PacketFactory {
    /// Stamps `protocol_id` into all built frames.
    #[must_use]
    pub fn with_protocol_id(mut self, protocol_id: u16) -> Self {
        self.protocol_id = protocol_id;
        self
    }

    /// The transaction id of the next built frame.
    #[must_use]
    pub fn with_initial_transaction_id(self, transaction_id: TransactionId) -> Self {
        self.transaction_id.store(transaction_id, Ordering::Relaxed);
        self
    }

    /// Appends a resolver, consulted after all existing ones.
    pub fn add(&mut self, resolver: impl PayloadResolver + 'static) {
        self.resolvers.push(Arc::new(resolver));
    }

    #[must_use]
    pub fn protocol_id(&self) -> u16 {
        self.protocol_id
    }

    fn next_transaction_id(&self) -> TransactionId {
        self.transaction_id.fetch_add(1, Ordering::Relaxed)
    }

    fn frame(&self, unit_id: UnitId, function: FunctionCode, payload: impl Into<Packet>) -> Mbap {
        Mbap::new(
            self.next_transaction_id(),
            self.protocol_id,
            unit_id,
            Pdu::new(function, payload),
        )
    }

    /// Read holding registers (0x03).
    #[must_use]
    pub fn read_registers(&self, unit_id: UnitId, start_address: Address, count: Quantity) -> Mbap {
        self.frame(
            unit_id,
            FunctionCode::ReadHoldingRegisters,
            ReadRegisters::new(start_address, count),
        )
    }

    /// Read input registers (0x04).
    #[must_use]
    pub fn read_input_registers(
        &self,
        unit_id: UnitId,
        start_address: Address,
        count: Quantity,
    ) -> Mbap {
        self.frame(
            unit_id,
            FunctionCode::ReadInputRegisters,
            ReadRegisters::new(start_address, count),
        )
    }

    /// Write a single register (0x06).
    #[must_use]
    pub fn write_register(&self, unit_id: UnitId, address: Address, value: Word) -> Mbap {
        self.frame(
            unit_id,
            FunctionCode::WriteSingleRegister,
            WriteRegister::new(address, value),
        )
    }

    /// Write consecutive registers (0x10).
    #[must_use]
    pub fn write_multiple_registers(
        &self,
        unit_id: UnitId,
        start_address: Address,
        values: impl Into<Vec<Word>>,
    ) -> Mbap {
        self.frame(
            unit_id,
            FunctionCode::WriteMultipleRegisters,
            WriteMultipleRegisters::new(start_address, values),
        )
    }
}

impl PayloadResolver for PacketFactory {
    fn resolve(&self, header: &Packet, direction: Direction) -> Option<Packet> {
        self.resolvers
            .iter()
            .find_map(|resolver| resolver.resolve(header, direction))
    }
}
