// SPDX-FileCopyrightText: Copyright (c) 2017-2023 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types and traits

///////////////////////////////////////////////////////////////////
/// Modules
///////////////////////////////////////////////////////////////////
pub use crate::client;

#[cfg(feature = "tcp-server")]
pub use crate::server;

///////////////////////////////////////////////////////////////////
/// Types
///////////////////////////////////////////////////////////////////
pub use crate::client::{Client, ClientConfig};
pub use crate::codec::ByteOrder;
pub use crate::register::{
    F32Register, F64Register, FixedString, I16Register, I32Register, I64Register, I8Register,
    Numeric, RegisterDefinition, U16Register, U32Register, U64Register, U8Register,
};
pub use crate::{
    Address, Direction, Error, ExceptionCode, ExceptionResponse, FunctionCode, Mbap, Packet,
    PacketFactory, Pdu, Quantity, UnitId, Word,
};

#[cfg(feature = "tcp-server")]
pub use crate::server::{
    proxy::{Proxy, ProxyConfig, ProxyTargetConfig, SourceFilter},
    service::{RegisterMapService, Service, SlaveRequest},
    tcp::SlaveConnectionFactory,
    Server, ServerConfig,
};

///////////////////////////////////////////////////////////////////
/// Traits
///////////////////////////////////////////////////////////////////
pub use crate::client::{Reader, Writer};
pub use crate::register::Register;
pub use crate::PayloadResolver;
