use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_command(value: &str) -> Result<u8, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|err| format!("invalid command '{value}': {err}"))
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show voltage, current, capacities, temperatures, MOS and balancing status
    BasicInfo,
    /// Show individual cell voltages in mV
    CellVoltages,
    /// Show all available BMS information
    All,
    /// Periodically read and print basic information and cell voltages
    Monitor {
        /// Interval between two readings (e.g., "1s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "1s")]
        interval: Duration,
    },
    /// Decode a captured response frame without connecting to a device
    Decode {
        /// The command the frame answers (e.g., 3, 4 or 0x03)
        #[arg(value_parser = parse_command)]
        command: u8,
        /// The frame as hex string (e.g., dd0400020ce4ff0e77)
        frame: String,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Debug,
    Json,
}

const fn about_text() -> &'static str {
    "smart bms command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    /// Connect over Bluetooth Low Energy to this device address instead of the serial port
    #[arg(short, long)]
    pub ble: Option<String>,

    /// How long to scan for the Bluetooth device (e.g., "10s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "10s")]
    pub scan_timeout: Duration,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for a single transport read (e.g., "500ms", "1s", "2s 500ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "1s")]
    pub timeout: Duration,

    /// Number of retries for commands that timed out
    #[arg(long, default_value = "3")]
    pub retries: u8,

    /// Fail on response frames whose end byte is not 0x77
    #[arg(long)]
    pub strict_end_marker: bool,

    /// Output format for the readings
    #[arg(long, value_enum, default_value_t = OutputFormat::Debug)]
    pub format: OutputFormat,
}
