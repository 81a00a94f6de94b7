// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{future, net::SocketAddr, sync::Arc};

use mbap_stack::{
    prelude::*,
    server::service::{Service, SlaveRequest},
};
use tokio_util::sync::CancellationToken;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Answers every register function with a distinct exception.
#[derive(Debug)]
pub struct TestService {}

impl TestService {
    fn handle(&self, req: SlaveRequest) -> Result<Packet, ExceptionCode> {
        use FunctionCode::*;

        match req.function {
            ReadHoldingRegisters => Err(ExceptionCode::Acknowledge),
            ReadInputRegisters => Err(ExceptionCode::GatewayPathUnavailable),
            WriteSingleRegister => Err(ExceptionCode::MemoryParityError),
            WriteMultipleRegisters => Err(ExceptionCode::ServerDeviceBusy),
            Custom(_) => Err(ExceptionCode::IllegalFunction),
        }
    }
}

impl Service for TestService {
    type Request = SlaveRequest;

    type Response = Packet;

    type Exception = ExceptionCode;

    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        future::ready(self.handle(req))
    }
}

/// Starts a slave server on a free loopback port.
pub async fn start_server<S>(service: S) -> anyhow::Result<(Server, SocketAddr)>
where
    S: Service<Request = SlaveRequest, Response = Packet, Exception = ExceptionCode>
        + Send
        + Sync
        + 'static,
{
    let config = ServerConfig::new("127.0.0.1", 0);
    let factory = SlaveConnectionFactory::new(&config, service);
    let server = Server::new(config, Arc::new(factory))?;
    let addr = server.start().await?;
    Ok((server, addr))
}

pub fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        connect_timeout_secs: 2,
        transmit_timeout_secs: 2,
        receive_timeout_secs: 2,
        ..ClientConfig::new(addr.ip().to_string(), addr.port())
    }
}

pub async fn connect(addr: SocketAddr) -> anyhow::Result<Client> {
    let client = Client::new(client_config(addr))?;
    client.connect(&CancellationToken::new()).await?;
    Ok(client)
}

pub async fn check_client_context(client: &Client) {
    let cancel = CancellationToken::new();

    let response = client
        .read_register_range(1, 0x00, 2, &cancel)
        .await
        .expect("communication failed");
    assert!(matches!(
        response.map_err(|err| err.exception()),
        Err(ExceptionCode::Acknowledge)
    ));

    let tx = client.factory().read_input_registers(1, 0x00, 2);
    let rx = client.transceive(&tx, &cancel).await.unwrap();
    let pdu = rx.pdu().unwrap();
    assert!(pdu.is_exception());
    assert_eq!(
        pdu.payload(),
        Some(&Packet::from(ExceptionResponse::new(
            ExceptionCode::GatewayPathUnavailable
        )))
    );

    let response = client.write_register(1, 0x00, 42, &cancel).await.unwrap();
    assert!(matches!(
        response.map_err(|err| err.exception()),
        Err(ExceptionCode::MemoryParityError)
    ));

    let response = client
        .write_multiple_registers(1, 0x00, &[42, 43], &cancel)
        .await
        .unwrap();
    assert!(matches!(
        response.map_err(|err| err.exception()),
        Err(ExceptionCode::ServerDeviceBusy)
    ));
}
