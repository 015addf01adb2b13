//! Bluetooth Low Energy [`Transport`] built on `btleplug`.
//!
//! The BMS answers through notifications on characteristic `0xFF01` and accepts
//! requests on `0xFF02`. A background task moves every notification into a bounded
//! [`ByteQueue`], from which [`Transport::read`] pulls.

use crate::error::{Error, Result};
use crate::transport::{byte_queue, ByteQueue, Transport, DEFAULT_QUEUE_CAPACITY};
use async_trait::async_trait;
use btleplug::api::bleuuid::uuid_from_u16;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const NOTIFY_CHARACTERISTIC_ID: u16 = 0xff01;
const WRITE_CHARACTERISTIC_ID: u16 = 0xff02;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);
// The BMS drops requests sent right after the subscription
const SETTLE_DELAY: Duration = Duration::from_secs(2);

pub struct BleTransport {
    peripheral: Peripheral,
    write_char: Characteristic,
    queue: ByteQueue,
    io_timeout: Duration,
    notification_task: tokio::task::JoinHandle<()>,
}

impl BleTransport {
    /// Scans on the first adapter for `address` (e.g. `A4:C1:38:00:00:00`),
    /// connects and subscribes to the BMS notifications.
    pub async fn connect(address: &str, scan_timeout: Duration) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::NoAdapter)?;

        log::debug!("scanning for {address}");
        adapter.start_scan(ScanFilter::default()).await?;
        let found = tokio::time::timeout(scan_timeout, find_peripheral(&adapter, address)).await;
        adapter.stop_scan().await?;
        let peripheral = found.map_err(|_| Error::DeviceNotFound(address.to_string()))??;

        log::debug!("connecting to {address}");
        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let notify_char = find_characteristic(&peripheral, NOTIFY_CHARACTERISTIC_ID)?;
        let write_char = find_characteristic(&peripheral, WRITE_CHARACTERISTIC_ID)?;
        peripheral.subscribe(&notify_char).await?;

        let (sink, queue) = byte_queue(DEFAULT_QUEUE_CAPACITY);
        let mut notifications = peripheral.notifications().await?;
        let notify_uuid = notify_char.uuid;
        let notification_task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == notify_uuid {
                    sink.push(&notification.value);
                }
            }
            log::debug!("notification stream ended");
        });

        log::debug!("connected to {address}");
        tokio::time::sleep(SETTLE_DELAY).await;

        Ok(Self {
            peripheral,
            write_char,
            queue,
            io_timeout: DEFAULT_TIMEOUT,
            notification_task,
        })
    }

    /// Sets how long a read waits for the first notification byte.
    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        self.io_timeout = timeout;
    }

    pub async fn disconnect(self) -> Result<()> {
        self.notification_task.abort();
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.notification_task.abort();
    }
}

async fn find_peripheral(adapter: &Adapter, address: &str) -> Result<Peripheral> {
    loop {
        for peripheral in adapter.peripherals().await? {
            if peripheral.address().to_string().eq_ignore_ascii_case(address) {
                return Ok(peripheral);
            }
        }
        tokio::time::sleep(SCAN_POLL_INTERVAL).await;
    }
}

fn find_characteristic(peripheral: &Peripheral, short_id: u16) -> Result<Characteristic> {
    let uuid = uuid_from_u16(short_id);
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| Error::MissingCharacteristic(uuid.to_string()))
}

#[async_trait]
impl Transport for BleTransport {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        log::trace!("write bytes: {data:02X?}");
        tokio::time::timeout(
            self.io_timeout,
            self.peripheral
                .write(&self.write_char, data, WriteType::WithoutResponse),
        )
        .await
        .map_err(|_| Error::Timeout(self.io_timeout))??;
        Ok(())
    }

    async fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        self.queue.read(size, self.io_timeout).await
    }

    fn flush_input(&mut self) -> Result<()> {
        self.queue.flush();
        Ok(())
    }
}
