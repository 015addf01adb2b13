//! Request/response exchanges with a smart BMS over any [`Transport`].
//!
//! # Example
//!
//! ```no_run
//! use smartbms_lib::client::SmartBms;
//! use smartbms_lib::tokio_serial_async::SerialTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), smartbms_lib::Error> {
//!     let mut bms = SmartBms::new(SerialTransport::new("/dev/ttyUSB0")?);
//!
//!     let info = bms.read_basic_information().await?;
//!     println!("Basic information: {:?}", info);
//!
//!     let cell_voltages = bms.read_cell_voltages().await?;
//!     println!("Cell voltages: {:?}", cell_voltages);
//!     Ok(())
//! }
//! ```

use crate::error::Result;
use crate::protocol::*;
use crate::transport::Transport;

/// Drives one exchange at a time over an owned transport.
///
/// Every operation takes `&mut self`, so exchanges on one client never overlap.
/// Nothing is retried internally; on [`Error::Timeout`](crate::Error::Timeout) the
/// caller decides whether to try again.
#[derive(Debug)]
pub struct SmartBms<T> {
    transport: T,
    end_marker_check: EndMarkerCheck,
}

impl<T: Transport> SmartBms<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            end_marker_check: EndMarkerCheck::default(),
        }
    }

    /// Selects whether a wrong end byte (expected `0x77`) fails the exchange.
    /// The default is [`EndMarkerCheck::Lenient`].
    pub fn set_end_marker_check(&mut self, check: EndMarkerCheck) {
        log::trace!("set end marker check to {check:?}");
        self.end_marker_check = check;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Reads voltage, current, capacities, temperatures and balancing state.
    pub async fn read_basic_information(&mut self) -> Result<BasicInformation> {
        log::trace!("read basic information");
        let payload = self
            .send_command(BasicInformation::COMMAND as u8, &[])
            .await?;
        BasicInformation::decode(&payload)
    }

    /// Reads the voltage of every cell in mV.
    pub async fn read_cell_voltages(&mut self) -> Result<Vec<u16>> {
        log::trace!("read cell voltages");
        let payload = self.send_command(CellVoltages::COMMAND as u8, &[]).await?;
        CellVoltages::decode(&payload)
    }

    /// Runs a single exchange and returns the raw response payload.
    pub async fn send_command(&mut self, command: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let tx_buffer = create_request_frame(command, payload)?;
        log::trace!("write bytes: {tx_buffer:02X?}");
        self.transport.write(&tx_buffer).await?;

        // Anything buffered now belongs to an earlier, aborted exchange
        self.transport.flush_input()?;

        log::trace!("await start byte");
        validate_start(self.read_exact(1).await?[0])?;

        log::trace!("await command echo");
        validate_command(command, self.read_exact(1).await?[0])?;

        log::trace!("await status and length");
        let header = self.read_exact(2).await?;
        let (status, length) = (header[0], header[1]);
        validate_status(status)?;

        log::trace!("await {length} payload bytes");
        let rx_payload = self.read_exact(usize::from(length)).await?;

        log::trace!("await checksum and end byte");
        let trailer = self.read_exact(TRAILER_LENGTH).await?;
        validate_checksum(status, length, &rx_payload, &trailer)?;
        validate_end(trailer[2], self.end_marker_check)?;

        log::trace!("receive payload: {rx_payload:02X?}");
        Ok(rx_payload)
    }

    async fn read_exact(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut rx_buffer = Vec::with_capacity(size);
        while rx_buffer.len() < size {
            let chunk = self.transport.read(size - rx_buffer.len()).await?;
            rx_buffer.extend_from_slice(&chunk);
        }
        // Surplus bytes from a transport ignoring `size` are dropped
        rx_buffer.truncate(size);
        Ok(rx_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Hands out prepared chunks, one per read call.
    #[derive(Default)]
    struct ChunkTransport {
        written: Vec<Vec<u8>>,
        chunks: VecDeque<Vec<u8>>,
        flushes: usize,
    }

    #[async_trait]
    impl Transport for ChunkTransport {
        async fn write(&mut self, data: &[u8]) -> Result<()> {
            self.written.push(data.to_vec());
            Ok(())
        }

        async fn read(&mut self, _size: usize) -> Result<Vec<u8>> {
            self.chunks
                .pop_front()
                .ok_or(Error::Timeout(std::time::Duration::ZERO))
        }

        fn flush_input(&mut self) -> Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    fn client_with(chunks: &[&[u8]]) -> SmartBms<ChunkTransport> {
        SmartBms::new(ChunkTransport {
            chunks: chunks.iter().map(|c| c.to_vec()).collect(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn writes_request_then_flushes() {
        let mut bms = client_with(&[
            &[0xdd],
            &[0x04],
            &[0x00, 0x02],
            &[0x0c, 0xe4],
            &[0xff, 0x0e, 0x77],
        ]);
        assert_eq!(bms.read_cell_voltages().await.unwrap(), vec![3300]);
        let transport = bms.into_inner();
        assert_eq!(
            transport.written,
            vec![vec![0xdd, 0xa5, 0x04, 0x00, 0xff, 0xfc, 0x77]]
        );
        assert_eq!(transport.flushes, 1);
    }

    #[tokio::test]
    async fn empty_payload_skips_payload_read() {
        // status 0, length 0: checksum over [0, 0] is 0x0000
        let mut bms = client_with(&[&[0xdd], &[0x04], &[0x00, 0x00], &[0x00, 0x00, 0x77]]);
        assert!(bms.read_cell_voltages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn device_status_stops_exchange() {
        let mut bms = client_with(&[&[0xdd], &[0x03], &[0x01, 0x00]]);
        assert!(matches!(
            bms.read_basic_information().await,
            Err(Error::DeviceStatus(1))
        ));
        assert!(bms.transport().chunks.is_empty());
    }

    #[tokio::test]
    async fn strict_end_marker() {
        let chunks: &[&[u8]] = &[&[0xdd], &[0x04], &[0x00, 0x00], &[0x00, 0x00, 0x00]];

        let mut bms = client_with(chunks);
        assert!(bms.read_cell_voltages().await.is_ok());

        let mut bms = client_with(chunks);
        bms.set_end_marker_check(EndMarkerCheck::Strict);
        assert!(matches!(
            bms.read_cell_voltages().await,
            Err(Error::Framing {
                expected: 0x77,
                received: 0x00
            })
        ));
    }

    #[tokio::test]
    async fn payload_too_large_is_not_sent() {
        let mut bms = client_with(&[]);
        assert!(matches!(
            bms.send_command(0x03, &[0; 256]).await,
            Err(Error::PayloadTooLarge(256))
        ));
        assert!(bms.transport().written.is_empty());
    }
}
