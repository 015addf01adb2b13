use crate::error::{Error, Result};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const START_BYTE: u8 = 0xdd;
pub const END_BYTE: u8 = 0x77;
pub const READ_OPCODE: u8 = 0xa5;

/// Largest payload a single length byte can describe.
pub const MAX_PAYLOAD_LENGTH: usize = u8::MAX as usize;

/// Checksum (2) plus end marker (1).
pub const TRAILER_LENGTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    BasicInformation = 0x03,
    CellVoltages = 0x04,
}

/// How the end marker of a response frame is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EndMarkerCheck {
    /// The end byte is read and a mismatch is only logged.
    #[default]
    Lenient,
    /// A mismatching end byte fails the exchange with [`Error::Framing`].
    Strict,
}

/// `(0xFFFF - sum + 1) mod 0x10000`, i.e. the two's complement of the byte sum.
pub fn calc_checksum(data: &[u8]) -> u16 {
    let sum = data
        .iter()
        .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)));
    0xffffu16.wrapping_sub(sum).wrapping_add(1)
}

fn checksum_of_parts(first: u8, second: u8, payload: &[u8]) -> u16 {
    calc_checksum(&[first, second]).wrapping_sub(
        payload
            .iter()
            .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b))),
    )
}

pub fn create_request_frame(command: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LENGTH {
        return Err(Error::PayloadTooLarge(payload.len()));
    }
    let length = payload.len() as u8;
    let mut tx_buffer = Vec::with_capacity(payload.len() + 7);
    tx_buffer.push(START_BYTE);
    tx_buffer.push(READ_OPCODE);
    tx_buffer.push(command);
    tx_buffer.push(length);
    tx_buffer.extend_from_slice(payload);
    tx_buffer.extend_from_slice(&checksum_of_parts(command, length, payload).to_be_bytes());
    tx_buffer.push(END_BYTE);
    log::trace!("create_request_frame: {tx_buffer:02X?}");
    Ok(tx_buffer)
}

pub fn validate_start(received: u8) -> Result<()> {
    if received != START_BYTE {
        log::warn!("Invalid start byte - received={received:02X?}");
        return Err(Error::Framing {
            expected: START_BYTE,
            received,
        });
    }
    Ok(())
}

pub fn validate_command(expected: u8, received: u8) -> Result<()> {
    if received != expected {
        log::warn!("Command mismatch - expected={expected:02X?} received={received:02X?}");
        return Err(Error::CommandMismatch { expected, received });
    }
    Ok(())
}

pub fn validate_status(status: u8) -> Result<()> {
    if status != 0 {
        log::warn!("Device reported status {status:02X?}");
        return Err(Error::DeviceStatus(status));
    }
    Ok(())
}

/// Checks the first two trailer bytes against the checksum over `status‖length‖payload`.
pub fn validate_checksum(status: u8, length: u8, payload: &[u8], trailer: &[u8]) -> Result<()> {
    let calculated = checksum_of_parts(status, length, payload);
    let received = u16::from_be_bytes([trailer[0], trailer[1]]);
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={calculated:04X} received={received:04X} payload={payload:02X?}"
        );
        return Err(Error::ChecksumMismatch {
            calculated,
            received,
        });
    }
    Ok(())
}

pub fn validate_end(received: u8, check: EndMarkerCheck) -> Result<()> {
    if received == END_BYTE {
        return Ok(());
    }
    match check {
        EndMarkerCheck::Lenient => {
            log::warn!("Ignoring invalid end byte - received={received:02X?}");
            Ok(())
        }
        EndMarkerCheck::Strict => Err(Error::Framing {
            expected: END_BYTE,
            received,
        }),
    }
}

/// Validates a complete, buffered response frame and returns its payload.
///
/// Applies the same checks, in the same order, as a streaming exchange does.
pub fn decode_response(frame: &[u8], expected_command: u8, check: EndMarkerCheck) -> Result<Vec<u8>> {
    let require = |expected: usize| {
        if frame.len() < expected {
            Err(Error::IncompleteFrame {
                expected,
                received: frame.len(),
            })
        } else {
            Ok(())
        }
    };

    require(1)?;
    validate_start(frame[0])?;
    require(2)?;
    validate_command(expected_command, frame[1])?;
    require(4)?;
    let (status, length) = (frame[2], frame[3]);
    validate_status(status)?;
    let payload_end = 4 + usize::from(length);
    require(payload_end + TRAILER_LENGTH)?;
    let payload = &frame[4..payload_end];
    let trailer = &frame[payload_end..payload_end + TRAILER_LENGTH];
    validate_checksum(status, length, payload, trailer)?;
    validate_end(trailer[2], check)?;
    Ok(payload.to_vec())
}

macro_rules! read_bit {
    ($value:expr,$position:expr) => {
        ($value >> $position) & 1 != 0
    };
}

fn validate_len(payload: &[u8], required: usize) -> Result<()> {
    if payload.len() < required {
        log::warn!(
            "Invalid payload size - required={} received={}",
            required,
            payload.len()
        );
        return Err(Error::MalformedPayload(format!(
            "{} bytes required, {} received",
            required,
            payload.len()
        )));
    }
    Ok(())
}

/// Fixed part of the basic information payload, up to and including the NTC count.
const BASIC_INFORMATION_HEADER_LENGTH: usize = 23;

// Temperatures are reported in 0.1 K
const KELVIN_OFFSET_DECI: i32 = 2731;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BasicInformation {
    pub voltage_mv: u32,
    pub current_ma: i32, // negative=discharging, positive=charging
    pub remaining_capacity_mah: u32,
    pub nominal_capacity_mah: u32,
    pub cycles: u16,
    pub production_date: u16,
    pub protection_status: u16,
    pub firmware_version: u8,
    pub soc_percent: u8,
    pub charging_enabled: bool,
    pub discharging_enabled: bool,
    pub cell_count: u8,
    pub temperatures: Vec<f32>,
    pub cell_balancing: Vec<bool>,
}

impl BasicInformation {
    pub const COMMAND: Command = Command::BasicInformation;

    pub fn request() -> Vec<u8> {
        // An empty payload always fits into a frame
        create_request_frame(Self::COMMAND as u8, &[]).unwrap_or_default()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        validate_len(payload, BASIC_INFORMATION_HEADER_LENGTH)?;
        let word = |offset: usize| u16::from_be_bytes([payload[offset], payload[offset + 1]]);

        let low_balance = word(12);
        let high_balance = word(14);
        let mos_status = payload[20];
        let cell_count = payload[21];
        let n_temperatures = usize::from(payload[22]);
        validate_len(
            payload,
            BASIC_INFORMATION_HEADER_LENGTH + 2 * n_temperatures,
        )?;

        let temperatures = (0..n_temperatures)
            .map(|n| {
                let raw = word(BASIC_INFORMATION_HEADER_LENGTH + 2 * n);
                (i32::from(raw) - KELVIN_OFFSET_DECI) as f32 / 10.0
            })
            .collect();

        let cell_balancing = (0..u32::from(cell_count))
            .map(|cell| match cell {
                0..=15 => read_bit!(low_balance, cell),
                16..=31 => read_bit!(high_balance, cell - 16),
                // The device only reports balancing for 32 cells
                _ => false,
            })
            .collect();

        Ok(Self {
            voltage_mv: u32::from(word(0)) * 10,
            current_ma: i32::from(word(2) as i16) * 10,
            remaining_capacity_mah: u32::from(word(4)) * 10,
            nominal_capacity_mah: u32::from(word(6)) * 10,
            cycles: word(8),
            production_date: word(10),
            protection_status: word(16),
            firmware_version: payload[18],
            soc_percent: payload[19],
            charging_enabled: read_bit!(mos_status, 0),
            discharging_enabled: read_bit!(mos_status, 1),
            cell_count,
            temperatures,
            cell_balancing,
        })
    }

    pub fn production_date(&self) -> ProductionDate {
        ProductionDate::from(self.production_date)
    }

    pub fn protections(&self) -> Vec<Protection> {
        Protection::from_bitmap(self.protection_status)
    }

    /// Firmware version as `major.minor`, e.g. `0x10` is "1.0".
    pub fn firmware_version_string(&self) -> String {
        format!(
            "{}.{}",
            self.firmware_version >> 4,
            self.firmware_version & 0x0f
        )
    }
}

/// Production date unpacked from `(year - 2000) << 9 | month << 5 | day`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProductionDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl From<u16> for ProductionDate {
    fn from(raw: u16) -> Self {
        Self {
            year: 2000 + (raw >> 9),
            month: ((raw >> 5) & 0x0f) as u8,
            day: (raw & 0x1f) as u8,
        }
    }
}

impl fmt::Display for ProductionDate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

pub struct CellVoltages;

impl CellVoltages {
    pub const COMMAND: Command = Command::CellVoltages;

    pub fn request() -> Vec<u8> {
        create_request_frame(Self::COMMAND as u8, &[]).unwrap_or_default()
    }

    /// Cell voltages in mV, in cell order.
    pub fn decode(payload: &[u8]) -> Result<Vec<u16>> {
        if payload.len() % 2 != 0 {
            log::warn!("Odd cell voltage payload size {}", payload.len());
            return Err(Error::MalformedPayload(format!(
                "odd cell voltage payload size {}",
                payload.len()
            )));
        }
        let result: Vec<u16> = payload
            .chunks_exact(2)
            .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
            .collect();
        log::trace!("Cell voltages mV={result:?}");
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Protection {
    CellOvervoltage,
    CellUndervoltage,
    PackOvervoltage,
    PackUndervoltage,
    ChargeOvertemperature,
    ChargeUndertemperature,
    DischargeOvertemperature,
    DischargeUndertemperature,
    ChargeOvercurrent,
    DischargeOvercurrent,
    ShortCircuit,
    FrontEndIcError,
    MosSoftwareLock,
}

impl Protection {
    pub fn from_bitmap(bitmap: u16) -> Vec<Self> {
        let mut result = Vec::new();

        macro_rules! ck_and_add {
            ($position:expr,$enum_type:expr) => {
                if read_bit!(bitmap, $position) {
                    result.push($enum_type);
                }
            };
        }

        ck_and_add!(0, Protection::CellOvervoltage);
        ck_and_add!(1, Protection::CellUndervoltage);
        ck_and_add!(2, Protection::PackOvervoltage);
        ck_and_add!(3, Protection::PackUndervoltage);
        ck_and_add!(4, Protection::ChargeOvertemperature);
        ck_and_add!(5, Protection::ChargeUndertemperature);
        ck_and_add!(6, Protection::DischargeOvertemperature);
        ck_and_add!(7, Protection::DischargeUndertemperature);
        ck_and_add!(8, Protection::ChargeOvercurrent);
        ck_and_add!(9, Protection::DischargeOvercurrent);
        ck_and_add!(10, Protection::ShortCircuit);
        ck_and_add!(11, Protection::FrontEndIcError);
        ck_and_add!(12, Protection::MosSoftwareLock);

        result
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protection::CellOvervoltage => write!(f, "Cell overvoltage protection"),
            Protection::CellUndervoltage => write!(f, "Cell undervoltage protection"),
            Protection::PackOvervoltage => write!(f, "Pack overvoltage protection"),
            Protection::PackUndervoltage => write!(f, "Pack undervoltage protection"),
            Protection::ChargeOvertemperature => write!(f, "Charging over temperature protection"),
            Protection::ChargeUndertemperature => {
                write!(f, "Charging under temperature protection")
            }
            Protection::DischargeOvertemperature => {
                write!(f, "Discharging over temperature protection")
            }
            Protection::DischargeUndertemperature => {
                write!(f, "Discharging under temperature protection")
            }
            Protection::ChargeOvercurrent => write!(f, "Charging overcurrent protection"),
            Protection::DischargeOvercurrent => write!(f, "Discharging overcurrent protection"),
            Protection::ShortCircuit => write!(f, "Short circuit protection"),
            Protection::FrontEndIcError => write!(f, "Front-end detection IC error"),
            Protection::MosSoftwareLock => write!(f, "Software lock MOS"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_frame(command: u8, status: u8, payload: &[u8]) -> Vec<u8> {
        let length = payload.len() as u8;
        let mut frame = vec![START_BYTE, command, status, length];
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&checksum_of_parts(status, length, payload).to_be_bytes());
        frame.push(END_BYTE);
        frame
    }

    #[test]
    fn checksum_matches_known_requests() {
        assert_eq!(calc_checksum(&[]), 0x0000);
        assert_eq!(calc_checksum(&[0x03, 0x00]), 0xfffd);
        assert_eq!(calc_checksum(&[0x04, 0x00]), 0xfffc);
        assert_eq!(
            BasicInformation::request(),
            vec![0xdd, 0xa5, 0x03, 0x00, 0xff, 0xfd, 0x77]
        );
        assert_eq!(
            CellVoltages::request(),
            vec![0xdd, 0xa5, 0x04, 0x00, 0xff, 0xfc, 0x77]
        );
    }

    #[test]
    fn checksum_wraps_on_large_sums() {
        let payload = [0xff; 255];
        let mut data = vec![0x00, 0xff];
        data.extend_from_slice(&payload);
        assert_eq!(checksum_of_parts(0x00, 0xff, &payload), calc_checksum(&data));
    }

    #[test]
    fn request_frame_layout() {
        let frame = create_request_frame(0xe1, &[0x00, 0x02]).unwrap();
        assert_eq!(frame, vec![0xdd, 0xa5, 0xe1, 0x02, 0x00, 0x02, 0xff, 0x1b, 0x77]);
    }

    #[test]
    fn request_frame_rejects_large_payload() {
        assert!(create_request_frame(0x03, &[0; 255]).is_ok());
        assert!(matches!(
            create_request_frame(0x03, &[0; 256]),
            Err(Error::PayloadTooLarge(256))
        ));
    }

    #[test]
    fn decode_response_returns_payload() {
        let frame = response_frame(0x04, 0x00, &[0x0c, 0xe4, 0x0c, 0xe5]);
        let payload = decode_response(&frame, 0x04, EndMarkerCheck::Strict).unwrap();
        assert_eq!(payload, vec![0x0c, 0xe4, 0x0c, 0xe5]);
    }

    #[test]
    fn decode_response_rejects_bad_frames() {
        let frame = response_frame(0x04, 0x00, &[0x01, 0x02]);

        let mut bad_start = frame.clone();
        bad_start[0] = 0xaa;
        assert!(matches!(
            decode_response(&bad_start, 0x04, EndMarkerCheck::Lenient),
            Err(Error::Framing {
                expected: 0xdd,
                received: 0xaa
            })
        ));

        assert!(matches!(
            decode_response(&frame, 0x03, EndMarkerCheck::Lenient),
            Err(Error::CommandMismatch {
                expected: 0x03,
                received: 0x04
            })
        ));

        let mut bad_checksum = frame.clone();
        bad_checksum[6] ^= 0x01;
        assert!(matches!(
            decode_response(&bad_checksum, 0x04, EndMarkerCheck::Lenient),
            Err(Error::ChecksumMismatch { .. })
        ));

        assert!(matches!(
            decode_response(&frame[..frame.len() - 1], 0x04, EndMarkerCheck::Lenient),
            Err(Error::IncompleteFrame {
                expected: 9,
                received: 8
            })
        ));
    }

    #[test]
    fn decode_response_device_status() {
        let frame = response_frame(0x03, 0x80, &[]);
        assert!(matches!(
            decode_response(&frame, 0x03, EndMarkerCheck::Lenient),
            Err(Error::DeviceStatus(0x80))
        ));
    }

    #[test]
    fn end_marker_policy() {
        let mut frame = response_frame(0x04, 0x00, &[0x01, 0x02]);
        let last = frame.len() - 1;
        frame[last] = 0x00;
        assert_eq!(
            decode_response(&frame, 0x04, EndMarkerCheck::Lenient).unwrap(),
            vec![0x01, 0x02]
        );
        assert!(matches!(
            decode_response(&frame, 0x04, EndMarkerCheck::Strict),
            Err(Error::Framing {
                expected: 0x77,
                received: 0x00
            })
        ));
    }

    #[test]
    fn decode_basic_information() {
        // 4 cells, 2 NTCs, cells 1 and 3 balancing, charge MOS on
        let payload = hex::decode(concat!(
            "0a28", "fff6", "1f40", "2710", "0015", "2a61", "000a", "0000", "0801", "10",
            "50", "01", "04", "02", "0ba5", "0b90"
        ))
        .unwrap();
        let info = BasicInformation::decode(&payload).unwrap();
        assert_eq!(info.voltage_mv, 26000);
        assert_eq!(info.current_ma, -100);
        assert_eq!(info.remaining_capacity_mah, 80000);
        assert_eq!(info.nominal_capacity_mah, 100000);
        assert_eq!(info.cycles, 21);
        assert_eq!(info.production_date, 0x2a61);
        assert_eq!(info.protection_status, 0x0801);
        assert_eq!(info.firmware_version, 0x10);
        assert_eq!(info.soc_percent, 80);
        assert!(info.charging_enabled);
        assert!(!info.discharging_enabled);
        assert_eq!(info.cell_count, 4);
        assert_eq!(info.temperatures, vec![25.0, 22.9]);
        assert_eq!(info.cell_balancing, vec![false, true, false, true]);

        assert_eq!(info.production_date().to_string(), "2021-03-01");
        assert_eq!(info.firmware_version_string(), "1.0");
        assert_eq!(
            info.protections(),
            vec![Protection::CellOvervoltage, Protection::FrontEndIcError]
        );
    }

    #[test]
    fn balancing_uses_both_bitmaps() {
        let mut payload = vec![0u8; BASIC_INFORMATION_HEADER_LENGTH];
        payload[13] = 0x01; // low bitmap bit 0
        payload[15] = 0x01; // high bitmap bit 0
        payload[21] = 17;
        let info = BasicInformation::decode(&payload).unwrap();
        assert_eq!(info.cell_balancing.len(), 17);
        for (cell, balancing) in info.cell_balancing.iter().enumerate() {
            assert_eq!(*balancing, cell == 0 || cell == 16, "cell {cell}");
        }
    }

    #[test]
    fn balancing_beyond_32_cells_is_false() {
        let mut payload = vec![0u8; BASIC_INFORMATION_HEADER_LENGTH];
        payload[12..16].copy_from_slice(&[0xff; 4]);
        payload[21] = 40;
        let info = BasicInformation::decode(&payload).unwrap();
        assert_eq!(info.cell_balancing.iter().filter(|b| **b).count(), 32);
        assert!(!info.cell_balancing[32..].iter().any(|b| *b));
    }

    #[test]
    fn basic_information_too_short() {
        assert!(matches!(
            BasicInformation::decode(&[0; 22]),
            Err(Error::MalformedPayload(_))
        ));
        // Declares 3 temperatures but carries only 2
        let mut payload = vec![0u8; BASIC_INFORMATION_HEADER_LENGTH + 4];
        payload[22] = 3;
        assert!(matches!(
            BasicInformation::decode(&payload),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn decode_cell_voltages() {
        let voltages = CellVoltages::decode(&[0x0c, 0xe4, 0x0d, 0x02, 0x00, 0x00]).unwrap();
        assert_eq!(voltages, vec![3300, 3330, 0]);
        assert!(CellVoltages::decode(&[]).unwrap().is_empty());
        assert!(matches!(
            CellVoltages::decode(&[0x0c, 0xe4, 0x0d]),
            Err(Error::MalformedPayload(_))
        ));
    }
}
