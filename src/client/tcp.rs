// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{
    future::Future,
    io::{self, Cursor},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpStream,
    sync::{Mutex, MutexGuard},
};
use tokio_util::sync::CancellationToken;

use super::{ClientConfig, Reader, Writer, MAX_DEFINITION_SPAN};
use crate::{
    codec::{u16_len, BufferPool, ByteReader, ByteWriter},
    error::{Error, ProtocolError},
    frame::{check_count, *},
    register::{self, RegisterDefinition},
    resolver::PacketFactory,
    Result,
};

/// Modbus TCP client
///
/// At most one request/response exchange is in flight at any time.
/// Concurrent callers are admitted one after another in arrival order,
/// so a single client can be shared between tasks through an [`Arc`].
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    swap: bool,
    factory: PacketFactory,
    pool: Arc<BufferPool>,
    stream: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
    disconnected: AtomicBool,
}

impl Client {
    /// A disconnected client for the server in `config`.
    pub fn new(config: ClientConfig) -> std::result::Result<Self, Error> {
        let factory = PacketFactory::default().with_protocol_id(config.protocol_id);
        Self::with_factory(config, factory)
    }

    /// A client that builds and decodes frames with `factory`.
    pub fn with_factory(
        config: ClientConfig,
        factory: PacketFactory,
    ) -> std::result::Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            swap: config.byte_order.requires_swap(),
            config,
            factory,
            pool: BufferPool::shared(),
            stream: Mutex::new(None),
            connected: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Builds the request frames sent by this client.
    #[must_use]
    pub fn factory(&self) -> &PacketFactory {
        &self.factory
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Opens the connection, unless already connected.
    pub async fn connect(&self, cancel: &CancellationToken) -> std::result::Result<(), Error> {
        let mut slot = self.admit(cancel).await?;
        if self.disconnected.load(Ordering::Acquire) {
            return Err(Error::Connect(io::Error::new(
                io::ErrorKind::NotConnected,
                "client has been disconnected",
            )));
        }
        if slot.is_some() {
            return Ok(());
        }
        let ClientConfig { host, port, .. } = &self.config;
        log::debug!("Connecting to {host}:{port}");
        let connected = with_deadline(
            self.config.connect_timeout(),
            cancel,
            TcpStream::connect((host.as_str(), *port)),
        )
        .await
        .ok_or(Error::Cancelled)?;
        let stream = connected.map_err(Error::Connect)?;
        stream.set_nodelay(true).map_err(Error::Connect)?;
        *slot = Some(stream);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Shuts the connection down for good.
    ///
    /// Waits for an exchange in flight to complete.
    pub async fn disconnect(&self) -> std::result::Result<(), Error> {
        self.disconnected.store(true, Ordering::Release);
        let mut slot = self.stream.lock().await;
        self.connected.store(false, Ordering::Release);
        if let Some(mut stream) = slot.take() {
            log::debug!("Disconnecting from {}:{}", self.config.host, self.config.port);
            stream.shutdown().await.map_err(Error::Transmission)?;
        }
        Ok(())
    }

    /// Sends `tx` and waits for the next frame sent back.
    ///
    /// Exception responses are regular frames. The response is not
    /// correlated with the request by transaction id. If the exchange
    /// fails or is abandoned halfway the connection is dropped, because
    /// the stream position is unknown afterwards.
    ///
    /// Requests exceeding the register limits of their function are
    /// rejected before anything is sent.
    pub async fn transceive(
        &self,
        tx: &Mbap,
        cancel: &CancellationToken,
    ) -> std::result::Result<Mbap, Error> {
        log::debug!("Transceive {tx:?}");
        if let Some(pdu) = tx.pdu() {
            pdu.check_limits()?;
        }
        let mut slot = self.admit(cancel).await?;
        // Out of the slot while in flight: if this future is dropped
        // halfway, the stream is dropped with it.
        let mut stream = slot.take().ok_or_else(|| {
            Error::Transmission(io::Error::new(
                io::ErrorKind::NotConnected,
                "client is not connected",
            ))
        })?;
        let mut in_flight = InFlight {
            connected: &self.connected,
            completed: false,
        };
        self.transmit(&mut stream, tx, cancel).await?;
        let rx = self.receive(&mut stream, cancel).await?;
        *slot = Some(stream);
        in_flight.completed = true;
        drop(slot);
        match rx.pdu() {
            Some(pdu) if pdu.payload.is_some() => Ok(rx),
            Some(pdu) => Err(ProtocolError::UnsupportedFunction(pdu.function).into()),
            None => Err(ProtocolError::UnexpectedResponse("frame without PDU".to_owned()).into()),
        }
    }

    async fn admit(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<MutexGuard<'_, Option<TcpStream>>, Error> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            slot = self.stream.lock() => Ok(slot),
        }
    }

    async fn transmit(
        &self,
        stream: &mut TcpStream,
        tx: &Mbap,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Error> {
        let mut buf = self.pool.rent(tx.measure());
        tx.encode(&mut ByteWriter::new(&mut buf[..], self.swap));
        let sent = with_deadline(self.config.transmit_timeout(), cancel, async {
            stream.write_all(&buf).await?;
            stream.flush().await
        })
        .await
        .ok_or(Error::Cancelled)?;
        sent.map_err(|err| {
            log::warn!("Modbus transmission failed: {err}");
            Error::Transmission(err)
        })
    }

    async fn receive(
        &self,
        stream: &mut TcpStream,
        cancel: &CancellationToken,
    ) -> std::result::Result<Mbap, Error> {
        let mut buf = self.pool.rent(self.config.max_frame_size);
        let received = with_deadline(
            self.config.receive_timeout(),
            cancel,
            read_frame(stream, &mut buf, self.swap),
        )
        .await
        .ok_or(Error::Cancelled)?;
        let decoded = received.and_then(|len| {
            let mut reader = ByteReader::new(&buf[..len], self.swap);
            Mbap::decode(&mut reader, &self.factory, Direction::Response)
        });
        decoded.map_err(|err| {
            log::warn!("Modbus packet reception failed: {err}");
            Error::Reception(err)
        })
    }

    async fn exchange(&self, tx: Mbap, cancel: &CancellationToken) -> Result<Packet> {
        let rx = self.transceive(&tx, cancel).await?;
        into_response(&tx, rx)
    }
}

/// Marks the client as disconnected unless the exchange completes.
struct InFlight<'a> {
    connected: &'a AtomicBool,
    completed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.connected.store(false, Ordering::Release);
        }
    }
}

/// Races `future` against a timeout and cancellation.
///
/// Returns `None` if cancelled first, a timeout surfaces as
/// [`io::ErrorKind::TimedOut`].
async fn with_deadline<T>(
    timeout: Duration,
    cancel: &CancellationToken,
    future: impl Future<Output = io::Result<T>>,
) -> Option<io::Result<T>> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        result = tokio::time::timeout(timeout, future) => Some(result.unwrap_or_else(|_| {
            Err(io::Error::new(io::ErrorKind::TimedOut, "deadline elapsed"))
        })),
    }
}

/// Reads exactly one frame into `buf` and returns its length.
async fn read_frame<R>(reader: &mut R, buf: &mut [u8], swap: bool) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let header = Mbap::default();
    let mut received = 0;
    loop {
        let mut buffered = ByteReader::new(Cursor::new(&buf[..received]), swap);
        let Ok(required) = usize::try_from(header.require_additional_bytes(&mut buffered, received)?)
        else {
            return Ok(received);
        };
        if required == 0 {
            return Ok(received);
        }
        let end = received + required;
        if end > buf.len() {
            return Err(ProtocolError::FrameTooLarge {
                len: end,
                max: buf.len(),
            }
            .into());
        }
        reader.read_exact(&mut buf[received..end]).await?;
        received = end;
    }
}

/// Splits the response PDU into its payload or the exception.
fn into_response(tx: &Mbap, rx: Mbap) -> Result<Packet> {
    let function = tx.pdu().map_or(0, |pdu| pdu.function);
    let Some(Packet::Pdu(pdu)) = rx.payload.map(|payload| *payload) else {
        return Err(ProtocolError::UnexpectedResponse("frame without PDU".to_owned()).into());
    };
    if pdu.function & !EXCEPTION_FLAG != function {
        return Err(ProtocolError::UnexpectedResponse(format!(
            "function code 0x{:02X} in response to 0x{function:02X}",
            pdu.function
        ))
        .into());
    }
    match pdu.payload.map(|payload| *payload) {
        Some(Packet::ExceptionResponse(exception)) => Ok(Err(exception)),
        Some(payload) => Ok(Ok(payload)),
        None => Err(ProtocolError::UnsupportedFunction(pdu.function).into()),
    }
}

fn unexpected<T>(payload: &Packet) -> Result<T> {
    Err(ProtocolError::UnexpectedResponse(format!("{payload:?}")).into())
}

fn check_span(count: usize, max: Quantity) -> std::result::Result<(), Error> {
    Ok(check_count(count, max)?)
}

#[async_trait]
impl Reader for Client {
    async fn read_registers(
        &self,
        unit_id: UnitId,
        definitions: &mut [RegisterDefinition],
        cancel: &CancellationToken,
    ) -> Result<()> {
        register::validate_layout(definitions.iter())?;
        let (start_address, count) = register::covering_span(definitions);
        check_span(count, MAX_DEFINITION_SPAN)?;
        let buffer = match self
            .read_register_range(unit_id, start_address, u16_len(count), cancel)
            .await?
        {
            Ok(buffer) => buffer,
            Err(exception) => return Ok(Err(exception)),
        };
        register::decode_buffer(definitions, &buffer, self.swap)?;
        Ok(Ok(()))
    }

    async fn read_register_range(
        &self,
        unit_id: UnitId,
        start_address: Address,
        count: Quantity,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        check_span(count.into(), MAX_READ_REGISTERS)?;
        let tx = self.factory.read_registers(unit_id, start_address, count);
        match self.exchange(tx, cancel).await? {
            Ok(Packet::RegisterValues(values)) => Ok(Ok(values.buffer().clone())),
            Ok(payload) => unexpected(&payload),
            Err(exception) => Ok(Err(exception)),
        }
    }
}

#[async_trait]
impl Writer for Client {
    async fn write_register(
        &self,
        unit_id: UnitId,
        address: Address,
        value: Word,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let tx = self.factory.write_register(unit_id, address, value);
        match self.exchange(tx, cancel).await? {
            Ok(Packet::WriteRegister(_)) => Ok(Ok(())),
            Ok(payload) => unexpected(&payload),
            Err(exception) => Ok(Err(exception)),
        }
    }

    async fn write_multiple_registers(
        &self,
        unit_id: UnitId,
        start_address: Address,
        values: &[Word],
        cancel: &CancellationToken,
    ) -> Result<()> {
        check_span(values.len(), MAX_WRITE_REGISTERS)?;
        let tx = self
            .factory
            .write_multiple_registers(unit_id, start_address, values);
        match self.exchange(tx, cancel).await? {
            Ok(Packet::MultipleRegistersWritten(_)) => Ok(Ok(())),
            Ok(payload) => unexpected(&payload),
            Err(exception) => Ok(Err(exception)),
        }
    }

    async fn write_registers(
        &self,
        unit_id: UnitId,
        definitions: &[RegisterDefinition],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let writable = definitions.iter().filter(|def| def.writable);
        let (start_address, buffer) = register::encode_buffer(writable, self.swap)?;
        check_span(buffer.len() / 2, MAX_WRITE_REGISTERS)?;
        let mut reader = ByteReader::new(&buffer[..], self.swap);
        let values = (0..buffer.len() / 2)
            .map(|_| reader.read_u16())
            .collect::<io::Result<Vec<_>>>()
            .map_err(Error::Reception)?;
        self.write_multiple_registers(unit_id, start_address, &values, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteOrder;

    #[tokio::test]
    async fn read_frame_stops_at_declared_length() {
        let stream = [
            0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x04, // first frame
            0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x01, 0x86, 0x02, // second frame
        ];
        let mut reader = &stream[..];
        let mut buf = [0; 64];
        let swap = ByteOrder::BigEndian.requires_swap();
        let len = read_frame(&mut reader, &mut buf, swap).await.unwrap();
        assert_eq!(&buf[..len], &stream[..11]);
        let len = read_frame(&mut reader, &mut buf, swap).await.unwrap();
        assert_eq!(&buf[..len], &stream[11..]);
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_frame() {
        let stream = [0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00];
        let mut buf = [0; 64];
        let err = read_frame(&mut &stream[..], &mut buf, ByteOrder::BigEndian.requires_swap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn read_frame_fails_on_early_eof() {
        let stream = [0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x06, 0x01];
        let mut buf = [0; 64];
        let err = read_frame(&mut &stream[..], &mut buf, ByteOrder::BigEndian.requires_swap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn deadline_times_out() {
        let cancel = CancellationToken::new();
        let result = with_deadline(
            Duration::from_millis(10),
            &cancel,
            std::future::pending::<io::Result<()>>(),
        )
        .await;
        assert_eq!(result.unwrap().unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn deadline_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = with_deadline(
            Duration::from_secs(60),
            &cancel,
            std::future::pending::<io::Result<()>>(),
        )
        .await;
        assert!(result.is_none());
    }

    #[test]
    fn response_function_must_match() {
        let factory = PacketFactory::default();
        let tx = factory.read_registers(1, 0, 1);
        let rx = tx.reply(Pdu::new(
            FunctionCode::WriteSingleRegister,
            WriteRegister::new(0, 1),
        ));
        assert!(matches!(
            into_response(&tx, rx),
            Err(Error::Protocol(ProtocolError::UnexpectedResponse(_)))
        ));
    }

    #[test]
    fn exception_is_a_value() {
        let tx = PacketFactory::default().read_registers(1, 0, 1);
        let rx = tx.reply(Pdu::exception(0x03, ExceptionCode::IllegalDataAddress));
        let exception = into_response(&tx, rx).unwrap().unwrap_err();
        assert_eq!(exception.exception(), ExceptionCode::IllegalDataAddress);
    }

    #[test]
    fn span_limits() {
        assert!(matches!(
            check_span(0, MAX_DEFINITION_SPAN),
            Err(Error::Protocol(ProtocolError::EmptySpan))
        ));
        assert!(check_span(0x7B, MAX_DEFINITION_SPAN).is_ok());
        assert!(matches!(
            check_span(0x7C, MAX_DEFINITION_SPAN),
            Err(Error::Protocol(ProtocolError::SpanTooLarge { count: 0x7C, max: 0x7B }))
        ));
    }

    #[tokio::test]
    async fn transceive_requires_connection() {
        let client = Client::new(ClientConfig::new("127.0.0.1", 502)).unwrap();
        assert!(!client.is_connected());
        let tx = client.factory().read_registers(1, 0, 1);
        let err = client
            .transceive(&tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transmission(_)));
    }

    #[tokio::test]
    async fn cancelled_before_admission() {
        let client = Client::new(ClientConfig::new("127.0.0.1", 502)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tx = client.factory().read_registers(1, 0, 1);
        assert!(matches!(
            client.transceive(&tx, &cancel).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn oversized_request_is_rejected_before_sending() {
        let client = Client::new(ClientConfig::new("127.0.0.1", 502)).unwrap();
        let tx = client.factory().write_multiple_registers(1, 0, vec![0; 200]);
        let err = client
            .transceive(&tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::SpanTooLarge { count: 200, max: 0x7B })
        ));
    }

    #[test]
    fn invalid_config_fails_construction() {
        assert!(matches!(
            Client::new(ClientConfig::default()),
            Err(Error::Config(_))
        ));
    }
}
