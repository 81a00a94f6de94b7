// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # TCP client example
//!
//! Reads typed register definitions from a device, e.g.
//! `cargo run --example tcp-client -- 192.168.0.222:502`.

use std::net::SocketAddr;

use mbap_stack::prelude::*;
use tokio_util::sync::CancellationToken;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let socket_addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "192.168.0.222:502".to_owned())
        .parse()?;

    let client = Client::new(ClientConfig::new(
        socket_addr.ip().to_string(),
        socket_addr.port(),
    ))?;
    let cancel = CancellationToken::new();
    client.connect(&cancel).await?;

    let mut definitions = [
        RegisterDefinition::new("Coupler ID", 0x1000, 7, FixedString::new(14)),
        RegisterDefinition::new("Voltage", 0x1008, 1, U16Register::new()).with_unit("V"),
        RegisterDefinition::new("Power", 0x100A, 2, I32Register::new())
            .with_unit("kW")
            .with_gain(0.001),
    ];

    println!("Fetching the coupler ID");
    match client.read_registers(1, &mut definitions, &cancel).await? {
        Ok(()) => {
            for definition in &definitions {
                println!("{definition}");
            }
        }
        Err(exception) => println!("The device responded with '{exception}'"),
    }

    client.disconnect().await?;
    Ok(())
}
