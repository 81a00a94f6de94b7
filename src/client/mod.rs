// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus TCP client

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    codec::ByteOrder,
    error::Error,
    frame::*,
    register::RegisterDefinition,
    Result,
};

mod tcp;

pub use self::tcp::Client;

/// Default _Modbus TCP_ port.
pub const DEFAULT_PORT: u16 = 502;

/// Default receive buffer size and upper bound of a single frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 14;

const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Upper bound of registers per read through register definitions.
pub const MAX_DEFINITION_SPAN: Quantity = 0x7B;

/// Connection settings of a [`Client`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ClientConfig {
    /// Host name or IP address of the server.
    pub host: String,
    pub port: u16,
    pub byte_order: ByteOrder,
    /// Protocol identifier stamped into every request.
    pub protocol_id: u16,
    pub connect_timeout_secs: u64,
    pub transmit_timeout_secs: u64,
    pub receive_timeout_secs: u64,
    /// Size of the receive buffer, frames declaring more are rejected.
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            byte_order: ByteOrder::default(),
            protocol_id: 0,
            connect_timeout_secs: DEFAULT_TIMEOUT_SECS,
            transmit_timeout_secs: DEFAULT_TIMEOUT_SECS,
            receive_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    /// Default settings for a server at `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), Error> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("missing host".to_owned()));
        }
        if self.port == 0 {
            return Err(Error::Config("invalid port 0".to_owned()));
        }
        if self.max_frame_size == 0 {
            return Err(Error::Config("invalid max frame size 0".to_owned()));
        }
        if self.connect_timeout_secs == 0
            || self.transmit_timeout_secs == 0
            || self.receive_timeout_secs == 0
        {
            return Err(Error::Config("timeouts must not be zero".to_owned()));
        }
        Ok(())
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn transmit_timeout(&self) -> Duration {
        Duration::from_secs(self.transmit_timeout_secs)
    }

    #[must_use]
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }
}

/// Asynchronous _Modbus_ reader
#[async_trait]
pub trait Reader: Send + Sync + Debug {
    /// Read the holding registers covering `definitions` and decode their values.
    async fn read_registers(
        &self,
        unit_id: UnitId,
        definitions: &mut [RegisterDefinition],
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Read `count` holding registers (0x03) as raw bytes.
    async fn read_register_range(
        &self,
        unit_id: UnitId,
        start_address: Address,
        count: Quantity,
        cancel: &CancellationToken,
    ) -> Result<Bytes>;
}

/// Asynchronous _Modbus_ writer
#[async_trait]
pub trait Writer: Send + Sync + Debug {
    /// Write a single holding register (0x06)
    async fn write_register(
        &self,
        unit_id: UnitId,
        address: Address,
        value: Word,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Write consecutive holding registers (0x10)
    async fn write_multiple_registers(
        &self,
        unit_id: UnitId,
        start_address: Address,
        values: &[Word],
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Encode the values of all writable `definitions` and write them at once.
    async fn write_registers(
        &self,
        unit_id: UnitId,
        definitions: &[RegisterDefinition],
        cancel: &CancellationToken,
    ) -> Result<()>;
}
