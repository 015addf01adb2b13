#![cfg_attr(docsrs, feature(doc_cfg))]
//! # smartbms_lib
//!
//! This crate provides a library for interacting with "smart" BMS (Battery Management System)
//! devices which use the `0xDD ... 0x77` frame protocol, over Bluetooth Low Energy or a serial port.
//!
//! The protocol codec in [`protocol`] is transport independent. [`client::SmartBms`] runs
//! request/response exchanges over anything implementing [`transport::Transport`].
//!
//! ## Features
//!
//! This crate uses a feature-based system to keep dependencies minimal.
//! You need to enable the transport you want to use.
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `smartbms` command-line tool.
//!
//! ### Transport Features
//! - `tokio-serial-async`: Enables the serial transport using `tokio` and `tokio-serial`.
//! - `ble`: Enables the Bluetooth Low Energy transport using `btleplug`.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing data structures.
//! - `bin-dependencies`: Enables all features required by the `smartbms` binary executable.

/// Request/response exchanges over a transport.
pub mod client;
/// Contains error types for the library.
mod error;
/// Defines the communication protocol of the BMS.
pub mod protocol;
/// The transport abstraction and the byte queue for push based links.
pub mod transport;

pub use error::{Error, Result};

/// Serial transport for BMS communication.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;

/// Bluetooth Low Energy transport for BMS communication.
#[cfg_attr(docsrs, doc(cfg(feature = "ble")))]
#[cfg(feature = "ble")]
pub mod ble;
