//! Serial links to the two microcontrollers
//!
//! [`SerialClient`] owns one port. Its connection loop opens the port,
//! forwards complete inbound lines to a channel, and reconnects with
//! exponential backoff when the port goes away. Writes while the port is
//! down fail fast with [`SerialError::NotConnected`].

use async_trait::async_trait;
use bytes::Bytes;
use raybot_shared::FrameDecoder;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Parity, SerialConfig};
use crate::error::SerialError;
use crate::eventbus::{topics, Event, EventBus};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Which microcontroller a link talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// Motion and power controller
    Pic,
    /// Peripheral controller (cargo door, QR reader, bottom sensor)
    Esp,
}

impl Device {
    pub fn ack_topic(self) -> &'static str {
        match self {
            Device::Pic => topics::PIC_CMD_ACK,
            Device::Esp => topics::ESP_CMD_ACK,
        }
    }

    pub fn connected_topic(self) -> &'static str {
        match self {
            Device::Pic => topics::PIC_SERIAL_CONNECTED,
            Device::Esp => topics::ESP_SERIAL_CONNECTED,
        }
    }

    pub fn disconnected_topic(self) -> &'static str {
        match self {
            Device::Pic => topics::PIC_SERIAL_DISCONNECTED,
            Device::Esp => topics::ESP_SERIAL_DISCONNECTED,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Pic => write!(f, "PIC"),
            Device::Esp => write!(f, "ESP"),
        }
    }
}

/// Byte sink for one microcontroller
#[async_trait]
pub trait SerialLink: Send + Sync {
    fn device(&self) -> Device;

    fn is_connected(&self) -> bool;

    /// Write a complete frame; aborts with [`SerialError::Cancelled`] when
    /// `token` fires first
    async fn write(&self, token: &CancellationToken, data: &[u8]) -> Result<(), SerialError>;
}

/// A physical (or virtual) serial port
pub struct SerialClient {
    device: Device,
    config: SerialConfig,
    bus: Arc<EventBus>,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    connected: AtomicBool,
}

impl SerialClient {
    pub fn new(device: Device, config: SerialConfig, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            device,
            config,
            bus,
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    fn open(&self) -> Result<SerialStream, SerialError> {
        let cfg = &self.config;
        let data_bits = match cfg.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match cfg.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let parity = match cfg.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };

        tokio_serial::new(&cfg.port, cfg.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .timeout(cfg.read_timeout())
            .open_native_async()
            .map_err(|source| SerialError::Open {
                port: cfg.port.clone(),
                source,
            })
    }

    /// Connection loop with reconnection; returns when `token` is cancelled
    pub async fn run(self: Arc<Self>, token: CancellationToken, lines: mpsc::Sender<Bytes>) {
        let mut reconnect_delay = RECONNECT_DELAY;

        loop {
            match self.open() {
                Ok(stream) => {
                    reconnect_delay = RECONNECT_DELAY;
                    let reason = self.handle_connection(stream, &token, &lines).await;
                    self.mark_disconnected(reason.err().map(|e| e.to_string()))
                        .await;
                }
                Err(e) => {
                    error!(device = %self.device, error = %e, "failed to open serial port");
                }
            }

            tokio::select! {
                _ = token.cancelled() => {
                    info!(device = %self.device, "serial client stopped");
                    return;
                }
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
            reconnect_delay = std::cmp::min(reconnect_delay * 2, MAX_RECONNECT_DELAY);
        }
    }

    async fn handle_connection(
        &self,
        stream: SerialStream,
        token: &CancellationToken,
        lines: &mpsc::Sender<Bytes>,
    ) -> Result<(), SerialError> {
        let (mut reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        info!(device = %self.device, port = %self.config.port, "serial port connected");
        self.bus
            .publish(self.device.connected_topic(), Event::SerialConnected);

        let mut decoder = FrameDecoder::new();
        let mut read_buf = vec![0u8; 1024];

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                result = reader.read(&mut read_buf) => {
                    match result {
                        Ok(0) => {
                            return Err(SerialError::Io(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "serial port closed",
                            )));
                        }
                        Ok(n) => {
                            decoder.extend(&read_buf[..n]);
                            loop {
                                match decoder.decode_next() {
                                    Ok(Some(line)) => {
                                        if lines.send(line).await.is_err() {
                                            return Ok(());
                                        }
                                    }
                                    Ok(None) => break,
                                    Err(e) => {
                                        warn!(device = %self.device, error = %e, "dropping malformed input");
                                    }
                                }
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => return Err(SerialError::Io(e)),
                    }
                }
            }
        }
    }

    async fn mark_disconnected(&self, error: Option<String>) {
        *self.writer.lock().await = None;
        self.connected.store(false, Ordering::SeqCst);
        match &error {
            Some(e) => warn!(device = %self.device, error = %e, "serial port disconnected"),
            None => info!(device = %self.device, "serial port closed"),
        }
        self.bus.publish(
            self.device.disconnected_topic(),
            Event::SerialDisconnected { error },
        );
    }
}

#[async_trait]
impl SerialLink for SerialClient {
    fn device(&self) -> Device {
        self.device
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn write(&self, token: &CancellationToken, data: &[u8]) -> Result<(), SerialError> {
        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = token.cancelled() => return Err(SerialError::Cancelled),
        };
        let Some(writer) = guard.as_mut() else {
            return Err(SerialError::NotConnected(self.device));
        };

        tokio::select! {
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => {
                result?;
                debug!(device = %self.device, bytes = data.len(), "frame written");
                Ok(())
            }
            _ = token.cancelled() => Err(SerialError::Cancelled),
        }
    }
}
