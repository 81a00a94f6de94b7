// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # TCP proxy example
//!
//! Local peers are forwarded to a slave on port 5502, everybody else to
//! the device given on the command line, e.g.
//! `cargo run --example tcp-proxy -- 192.168.0.222:502`.

use std::net::SocketAddr;

use mbap_stack::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let device: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "192.168.0.222:502".to_owned())
        .parse()?;

    let config = ProxyConfig {
        server: ServerConfig::new("0.0.0.0", 5503),
        targets: vec![
            ProxyTargetConfig::new(ClientConfig::new("127.0.0.1", 5502))
                .with_source("127.0.0.0/8".parse::<SourceFilter>()?),
            ProxyTargetConfig::new(ClientConfig::new(device.ip().to_string(), device.port())),
        ],
    };
    let proxy = Proxy::new(config)?;
    let socket_addr = proxy.start().await?;
    println!("Proxy listening on {socket_addr}, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    proxy.stop().await;
    println!("Exiting");
    Ok(())
}
