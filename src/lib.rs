// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A [Modbus TCP](https://en.wikipedia.org/wiki/Modbus) protocol stack
//! based on [tokio](https://tokio.rs).
//!
//! Modbus is based on a [master/slave](https://en.wikipedia.org/wiki/Master/slave_(technology))
//! model.
//! To avoid confusions with the tokio terminology the master is called *client*
//! and the slave is called *server* in this library.
//!
//! The stack consists of
//!
//! - a packet model for the MBAP header, the PDU and the register functions
//!   with incremental framing ([`Mbap::require_additional_bytes()`]),
//! - pluggable [`PayloadResolver`]s selecting the payload that follows a header,
//! - an endian-aware byte stream ([`codec::ByteReader`], [`codec::ByteWriter`]),
//! - typed register definitions mapped onto register buffers ([`register`]),
//! - a single-flight [`client::Client`],
//! - a TCP [`server::Server`] with a slave responder and a proxy.
//!
//! ## Installation
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! mbap-stack = "*"
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use mbap_stack::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(ClientConfig::new("192.168.0.222", 502))?;
//! let cancel = CancellationToken::new();
//! client.connect(&cancel).await?;
//!
//! let mut definitions = [
//!     RegisterDefinition::new("Voltage", 0x0100, 1, U16Register::new()).with_unit("V"),
//!     RegisterDefinition::new("Power", 0x0102, 2, I32Register::new()).with_gain(0.1),
//! ];
//! client.read_registers(1, &mut definitions, &cancel).await??;
//! for definition in &definitions {
//!     println!("{definition}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![warn(unsafe_code)]

pub mod prelude;

pub mod client;
pub mod codec;
pub mod register;

#[cfg(feature = "tcp-server")]
pub mod server;

mod error;
pub use self::error::{Error, ProtocolError};

mod frame;
pub use self::frame::*;

mod resolver;
pub use self::resolver::*;

/// Specialized [`std::result::Result`] type for client operations.
///
/// The outer error is a transport or protocol failure, the inner error
/// an exception reported by the server.
pub type Result<T> = std::result::Result<std::result::Result<T, ExceptionResponse>, Error>;
