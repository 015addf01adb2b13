//! Serial [`Transport`] built on Tokio and the `tokio-serial` crate.
//!
//! The port is pull based: every [`Transport::read`] performs one read on the
//! serial stream, bounded by the configured I/O timeout.
//!
//! # Example
//!
//! ```no_run
//! use smartbms_lib::client::SmartBms;
//! use smartbms_lib::tokio_serial_async::SerialTransport;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), smartbms_lib::Error> {
//!     let mut transport = SerialTransport::new("/dev/ttyUSB0")?;
//!     transport.set_timeout(Duration::from_millis(500));
//!
//!     let mut bms = SmartBms::new(transport);
//!     println!("Cell voltages: {:?}", bms.read_cell_voltages().await?);
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::transport::Transport;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct SerialTransport {
    serial: tokio_serial::SerialStream,
    io_timeout: Duration,
}

impl SerialTransport {
    /// Opens `port` (e.g. `/dev/ttyUSB0` on Linux, `COM3` on Windows) with 9600 8N1.
    pub fn new(port: &str) -> Result<Self> {
        Ok(Self {
            serial: tokio_serial::new(port, 9600)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()?,
            io_timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Sets the timeout for individual read and write operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        self.io_timeout = timeout;
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        tokio::time::timeout(self.io_timeout, self.serial.write_all(data))
            .await
            .map_err(|_| Error::Timeout(self.io_timeout))??;
        Ok(())
    }

    async fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut rx_buffer = vec![0; size];
        let received = tokio::time::timeout(self.io_timeout, self.serial.read(&mut rx_buffer))
            .await
            .map_err(|_| Error::Timeout(self.io_timeout))??;
        if received == 0 {
            return Err(Error::Timeout(self.io_timeout));
        }
        rx_buffer.truncate(received);
        log::trace!("read bytes: {rx_buffer:02X?}");
        Ok(rx_buffer)
    }

    fn flush_input(&mut self) -> Result<()> {
        let pending = self.serial.bytes_to_read()?;
        if pending > 0 {
            log::trace!("discard {pending} pending bytes");
        }
        self.serial.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
