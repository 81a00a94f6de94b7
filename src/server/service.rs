// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{
    collections::HashMap,
    future::{self, Future},
    ops::Deref,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{codec::u16_len, frame::*};

/// A Modbus server service.
pub trait Service {
    /// Requests handled by the service.
    type Request;

    /// Responses sent by the service.
    type Response;

    /// Exceptional responses sent by the service.
    type Exception;

    /// The future response value.
    type Future: Future<Output = Result<Self::Response, Self::Exception>> + Send;

    /// Process the request and return the response asynchronously.
    fn call(&self, req: Self::Request) -> Self::Future;
}

impl<D> Service for D
where
    D: Deref + ?Sized,
    D::Target: Service,
{
    type Request = <D::Target as Service>::Request;
    type Response = <D::Target as Service>::Response;
    type Exception = <D::Target as Service>::Exception;
    type Future = <D::Target as Service>::Future;

    /// A forwarding blanket impl to support smart pointers around [`Service`].
    fn call(&self, req: Self::Request) -> Self::Future {
        self.deref().call(req)
    }
}

/// A request addressed to a unit behind the server.
///
/// Only requests with a resolved payload reach a [`Service`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveRequest {
    pub unit_id: UnitId,
    pub function: FunctionCode,
    pub payload: Packet,
}

/// In-memory holding registers.
///
/// Serves reads and writes of the register functions for every unit id.
/// Accessing an address that has not been populated is answered with
/// [`ExceptionCode::IllegalDataAddress`].
#[derive(Debug, Clone, Default)]
pub struct RegisterMapService {
    registers: Arc<Mutex<HashMap<Address, Word>>>,
}

impl RegisterMapService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Populates consecutive registers beginning at `start_address`.
    #[must_use]
    pub fn with_registers(self, start_address: Address, values: &[Word]) -> Self {
        {
            let mut registers = self.lock();
            for (address, value) in (start_address..=Address::MAX).zip(values) {
                registers.insert(address, *value);
            }
        }
        self
    }

    #[must_use]
    pub fn get(&self, address: Address) -> Option<Word> {
        self.lock().get(&address).copied()
    }

    pub fn set(&self, address: Address, value: Word) {
        self.lock().insert(address, value);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Address, Word>> {
        self.registers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self, start_address: Address, count: Quantity) -> Result<Vec<Word>, ExceptionCode> {
        if count == 0 || count > MAX_READ_REGISTERS {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let registers = self.lock();
        (0..count)
            .map(|offset| {
                start_address
                    .checked_add(offset)
                    .and_then(|address| registers.get(&address).copied())
                    .ok_or(ExceptionCode::IllegalDataAddress)
            })
            .collect()
    }

    fn write(&self, start_address: Address, values: &[Word]) -> Result<(), ExceptionCode> {
        if values.is_empty() || values.len() > usize::from(MAX_WRITE_REGISTERS) {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let mut registers = self.lock();
        let addresses = (0..u16_len(values.len()))
            .map(|offset| start_address.checked_add(offset))
            .collect::<Option<Vec<_>>>()
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        if !addresses.iter().all(|address| registers.contains_key(address)) {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        for (address, value) in addresses.into_iter().zip(values) {
            registers.insert(address, *value);
        }
        Ok(())
    }

    fn handle(&self, req: SlaveRequest) -> Result<Packet, ExceptionCode> {
        match req.payload {
            Packet::ReadRegisters(ReadRegisters {
                start_address,
                count,
            }) => {
                let words = self.read(start_address, count)?;
                Ok(RegisterValues::from_words(&words).into())
            }
            Packet::WriteRegister(write) => {
                self.write(write.address, &[write.value])?;
                Ok(write.into())
            }
            Packet::WriteMultipleRegisters(write) => {
                self.write(write.start_address, &write.values)?;
                Ok(MultipleRegistersWritten::new(write.start_address, write.count()).into())
            }
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }
}

impl Service for RegisterMapService {
    type Request = SlaveRequest;
    type Response = Packet;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        future::ready(self.handle(req))
    }
}
