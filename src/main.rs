use anyhow::{bail, Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use serde_json::json;
use smartbms_lib::ble::BleTransport;
use smartbms_lib::client::SmartBms;
use smartbms_lib::protocol::{self, BasicInformation, CellVoltages, EndMarkerCheck};
use smartbms_lib::tokio_serial_async::SerialTransport;
use smartbms_lib::transport::Transport;
use std::{ops::Deref, panic};

mod commandline;

use commandline::{CliArgs, CliCommands, OutputFormat};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

// Timeouts are retried here, the library never retries on its own
macro_rules! with_retry {
    ($retries:expr, $call:expr) => {{
        let mut attempt = 0;
        loop {
            match $call.await {
                Err(err) if err.is_timeout() && attempt < $retries => {
                    attempt += 1;
                    warn!("Failed try {} of {}, repeating ({err})", attempt, $retries);
                }
                result => break result,
            }
        }
    }};
}

type Bms = SmartBms<Box<dyn Transport>>;

async fn open_transport(args: &CliArgs) -> Result<Box<dyn Transport>> {
    if let Some(address) = &args.ble {
        let mut transport = BleTransport::connect(address, args.scan_timeout)
            .await
            .with_context(|| format!("Cannot connect to Bluetooth device '{address}'"))?;
        transport.set_timeout(args.timeout);
        Ok(Box::new(transport))
    } else {
        let mut transport = SerialTransport::new(&args.device)
            .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
        transport.set_timeout(args.timeout);
        Ok(Box::new(transport))
    }
}

fn print_basic_information(info: &BasicInformation, format: OutputFormat) -> Result<()> {
    let protections: Vec<String> = info.protections().iter().map(|p| p.to_string()).collect();
    match format {
        OutputFormat::Debug => {
            println!("Basic information: {info:?}");
            println!("Production date: {}", info.production_date());
            println!("Firmware version: {}", info.firmware_version_string());
            println!("Protections: {protections:?}");
        }
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(&json!({
                "basic_information": info,
                "production_date": info.production_date().to_string(),
                "firmware_version": info.firmware_version_string(),
                "protections": protections,
            }))?
        ),
    }
    Ok(())
}

fn print_cell_voltages(cell_voltages: &[u16], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Debug => println!("Cell voltages: {cell_voltages:?}"),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(&json!({ "cell_voltages": cell_voltages }))?
        ),
    }
    Ok(())
}

async fn show_basic_information(bms: &mut Bms, args: &CliArgs) -> Result<()> {
    let info = with_retry!(args.retries, bms.read_basic_information())
        .with_context(|| "Cannot get basic information")?;
    print_basic_information(&info, args.format)
}

async fn show_cell_voltages(bms: &mut Bms, args: &CliArgs) -> Result<()> {
    let cell_voltages = with_retry!(args.retries, bms.read_cell_voltages())
        .with_context(|| "Cannot get cell voltages")?;
    print_cell_voltages(&cell_voltages, args.format)
}

async fn monitor(bms: &mut Bms, args: &CliArgs, interval: std::time::Duration) -> Result<()> {
    loop {
        let reading = async {
            let info = bms.read_basic_information().await?;
            let cell_voltages = bms.read_cell_voltages().await?;
            Ok::<_, smartbms_lib::Error>((info, cell_voltages))
        }
        .await;
        match reading {
            Ok((info, cell_voltages)) => {
                print_basic_information(&info, args.format)?;
                print_cell_voltages(&cell_voltages, args.format)?;
            }
            Err(err) if err.is_recoverable() => warn!("Reading failed: {err}"),
            Err(err) => return Err(err).with_context(|| "Cannot read from BMS"),
        }
        tokio::time::sleep(interval).await;
    }
}

fn decode_frame(command: u8, frame: &str, check: EndMarkerCheck, format: OutputFormat) -> Result<()> {
    let frame = hex::decode(frame.trim()).with_context(|| "Frame is not a valid hex string")?;
    let payload = protocol::decode_response(&frame, command, check)
        .with_context(|| "Cannot decode response frame")?;
    match command {
        c if c == BasicInformation::COMMAND as u8 => print_basic_information(
            &BasicInformation::decode(&payload).with_context(|| "Cannot decode basic information")?,
            format,
        ),
        c if c == CellVoltages::COMMAND as u8 => print_cell_voltages(
            &CellVoltages::decode(&payload).with_context(|| "Cannot decode cell voltages")?,
            format,
        ),
        _ => {
            println!("Payload: {}", hex::encode(&payload));
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let end_marker_check = if args.strict_end_marker {
        EndMarkerCheck::Strict
    } else {
        EndMarkerCheck::Lenient
    };

    if let CliCommands::Decode { command, frame } = &args.command {
        return decode_frame(*command, frame, end_marker_check, args.format);
    }

    let mut bms = SmartBms::new(open_transport(&args).await?);
    bms.set_end_marker_check(end_marker_check);

    match args.command {
        CliCommands::BasicInfo => show_basic_information(&mut bms, &args).await?,
        CliCommands::CellVoltages => show_cell_voltages(&mut bms, &args).await?,
        CliCommands::All => {
            show_basic_information(&mut bms, &args).await?;
            show_cell_voltages(&mut bms, &args).await?;
        }
        CliCommands::Monitor { interval } => monitor(&mut bms, &args, interval).await?,
        CliCommands::Decode { .. } => bail!("decode does not use a device connection"),
    }

    Ok(())
}
