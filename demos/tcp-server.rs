// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # TCP server example
//!
//! This example shows how to start a server serving an in-memory register
//! map and access it with a client.

use std::sync::Arc;

use mbap_stack::prelude::*;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Insert some test data as register values.
    let service = RegisterMapService::new().with_registers(0x00, &[10, 20, 30, 40]);

    let config = ServerConfig::new("127.0.0.1", 5502);
    let factory = SlaveConnectionFactory::new(&config, service);
    let server = Server::new(config, Arc::new(factory))?;
    let socket_addr = server.start().await?;
    println!("Starting up server on {socket_addr}");

    println!("CLIENT: Connecting client...");
    let client = Client::new(ClientConfig::new(
        socket_addr.ip().to_string(),
        socket_addr.port(),
    ))?;
    let cancel = CancellationToken::new();
    client.connect(&cancel).await?;

    println!("CLIENT: Writing 2 holding registers...");
    client
        .write_multiple_registers(1, 0x01, &[7777, 8888], &cancel)
        .await??;

    // Read back a block including the two registers we wrote.
    println!("CLIENT: Reading 4 holding registers...");
    let mut definitions = [
        RegisterDefinition::new("First", 0x00, 1, U16Register::new()),
        RegisterDefinition::new("Written", 0x01, 2, U32Register::new()),
        RegisterDefinition::new("Last", 0x03, 1, U16Register::new()),
    ];
    client.read_registers(1, &mut definitions, &cancel).await??;
    for definition in &definitions {
        println!("CLIENT: {definition}");
    }

    // Now we try to read with an invalid register address.
    // This should return a Modbus exception response with the code
    // IllegalDataAddress.
    println!("CLIENT: Reading nonexistent holding register address... (should return IllegalDataAddress)");
    let response = client.read_register_range(1, 0x100, 1, &cancel).await?;
    println!("CLIENT: The result is '{response:?}'");
    assert!(matches!(
        response.map_err(|err| err.exception()),
        Err(ExceptionCode::IllegalDataAddress)
    ));

    println!("CLIENT: Done.");
    client.disconnect().await?;
    server.stop().await;
    println!("Exiting");
    Ok(())
}
