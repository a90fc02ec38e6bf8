use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{info, warn};
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::{Config, PollConfig};
use crate::devices::ActuatorProfileRegistry;
use crate::modbus::crc::{crc16_bytes, crc16_modbus};
use crate::modbus::protocol::READ_INPUT_REGISTERS;
use crate::modbus::transport::list_ports;
use crate::modbus::{ModbusMaster, TransactionResult};
use crate::output::{formatter_for, ResultFormatter};
use crate::utils::error::{ErrorKind, ModbusError};

pub fn build_cli() -> Command {
    let actuator = || {
        Arg::new("actuator")
            .required(true)
            .help("Actuator model, e.g. \"TOP-E Module\" (see `profiles`)")
    };

    Command::new("valvectl")
        .version(crate::VERSION)
        .about("Modbus RTU control of serial valve actuators")
        .arg(Arg::new("config").short('c').long("config").global(true).help("TOML configuration file"))
        .arg(Arg::new("port").short('p').long("port").global(true).help("Serial port, e.g. /dev/ttyUSB0 or COM5"))
        .arg(Arg::new("baud").short('b').long("baud").global(true).help("Baud rate"))
        .arg(Arg::new("parity").long("parity").global(true).help("none | even | odd"))
        .arg(Arg::new("device").short('d').long("device").global(true).help("Modbus device id for actuator commands"))
        .arg(Arg::new("timeout").long("timeout").global(true).help("Serial read timeout in ms"))
        .arg(Arg::new("settle").long("settle").global(true).help("Delay between write and read in ms"))
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .global(true)
                .value_parser(["console", "json", "csv", "hex"])
                .default_value("console"),
        )
        .arg(Arg::new("verbose").short('v').long("verbose").global(true).action(ArgAction::SetTrue))
        .subcommand(Command::new("open").about("Open the valve completely").arg(actuator()))
        .subcommand(Command::new("close").about("Close the valve completely").arg(actuator()))
        .subcommand(
            Command::new("position")
                .about("Move the valve to a position in percent")
                .arg(actuator())
                .arg(Arg::new("percent").required(true).allow_negative_numbers(true)),
        )
        .subcommand(
            Command::new("custom")
                .about("Send a raw request, bypassing actuator profiles")
                .arg(Arg::new("device_id").required(true).allow_negative_numbers(true))
                .arg(Arg::new("function").required(true).allow_negative_numbers(true))
                .arg(Arg::new("address").required(true).allow_negative_numbers(true))
                .arg(Arg::new("value").required(true).allow_negative_numbers(true)),
        )
        .subcommand(
            Command::new("poll")
                .about("Read registers repeatedly until interrupted")
                .arg(Arg::new("interval").long("interval").help("Interval in ms"))
                .arg(Arg::new("address").long("address"))
                .arg(Arg::new("quantity").long("quantity"))
                .arg(Arg::new("input").long("input").action(ArgAction::SetTrue).help("Use function 0x04"))
                .arg(Arg::new("count").long("count").help("Stop after this many reads")),
        )
        .subcommand(Command::new("profiles").about("List actuator profiles"))
        .subcommand(Command::new("ports").about("List serial ports"))
        .subcommand(
            Command::new("crc")
                .about("Compute the Modbus CRC of hex bytes")
                .arg(Arg::new("bytes").required(true).num_args(1..)),
        )
        .subcommand(
            Command::new("init-config")
                .about("Write the effective configuration to a TOML file")
                .arg(Arg::new("path").required(true)),
        )
}

fn parse<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Result<T> {
    let raw = matches
        .get_one::<String>(name)
        .ok_or_else(|| anyhow!("missing argument <{}>", name))?;
    raw.parse()
        .map_err(|_| anyhow!("invalid value for <{}>: {}", name, raw))
}

fn parse_opt<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>> {
    match matches.get_one::<String>(name) {
        Some(_) => parse(matches, name).map(Some),
        None => Ok(None),
    }
}

// Errors raised before a frame is built leave no transaction behind
fn reached_wire(err: &ModbusError) -> bool {
    !matches!(
        err.kind(),
        ErrorKind::UnknownActuator
            | ErrorKind::InvalidPercent
            | ErrorKind::EncodingError
            | ErrorKind::TransactionInProgress
    )
}

async fn run_blocking<F>(master: &Arc<ModbusMaster>, op: F) -> Result<Result<TransactionResult, ModbusError>>
where
    F: FnOnce(&ModbusMaster) -> Result<TransactionResult, ModbusError> + Send + 'static,
{
    let master = Arc::clone(master);
    let outcome = tokio::task::spawn_blocking(move || op(&master))
        .await
        .context("transaction task panicked")?;
    Ok(outcome)
}

fn report(
    master: &ModbusMaster,
    outcome: Result<TransactionResult, ModbusError>,
    formatter: &dyn ResultFormatter,
) -> Result<(), ModbusError> {
    match outcome {
        Ok(result) => {
            print!("{}", formatter.format_result(&result));
            Ok(())
        }
        Err(err) => {
            if reached_wire(&err) {
                if let Some(last) = master.last_transaction() {
                    print!("{}", formatter.format_result(&last));
                }
            }
            Err(err)
        }
    }
}

async fn single_transaction<F>(master: &Arc<ModbusMaster>, formatter: &dyn ResultFormatter, op: F) -> Result<()>
where
    F: FnOnce(&ModbusMaster) -> Result<TransactionResult, ModbusError> + Send + 'static,
{
    let outcome = run_blocking(master, op).await?;
    report(master, outcome, formatter)?;
    Ok(())
}

/// Caller-owned continuous read. Each tick runs one read transaction; a
/// failed read is reported and the loop carries on.
pub async fn poll_loop(
    master: Arc<ModbusMaster>,
    poll: PollConfig,
    count: Option<u64>,
    formatter: &dyn ResultFormatter,
) -> Result<()> {
    let mut ticker = interval(poll.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let stop = tokio::signal::ctrl_c();
    tokio::pin!(stop);

    info!(
        "🔁 Polling device {} fn 0x{:02X} address {} x{} every {} ms",
        master.device_id(),
        poll.function,
        poll.address,
        poll.quantity,
        poll.interval_ms
    );
    print!("{}", formatter.format_header());

    let mut reads = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut stop => {
                info!("🛑 Poll interrupted after {} reads", reads);
                break;
            }
        }

        let PollConfig { function, address, quantity, .. } = poll;
        let outcome = run_blocking(&master, move |m| {
            if function == READ_INPUT_REGISTERS {
                m.read_input_registers(address, quantity)
            } else {
                m.read_holding_registers(address, quantity)
            }
        })
        .await?;

        if let Err(err) = report(&master, outcome, formatter) {
            warn!("⚠️  Read failed: {}", err);
        }

        reads += 1;
        if count.map_or(false, |limit| reads >= limit) {
            break;
        }
    }
    Ok(())
}

pub async fn handle_subcommands(matches: &ArgMatches, config: &Config) -> Result<bool> {
    let format = matches
        .get_one::<String>("format")
        .map(String::as_str)
        .unwrap_or("console");
    let formatter = formatter_for(format);

    match matches.subcommand() {
        Some(("profiles", _)) => {
            print!("{}", formatter.format_profiles(ActuatorProfileRegistry::profiles()));
            Ok(true)
        }
        Some(("ports", _)) => {
            let ports = list_ports()?;
            if ports.is_empty() {
                println!("⚠️  No serial ports found");
            }
            for port in ports {
                match port.port_type {
                    serialport::SerialPortType::UsbPort(usb) => println!(
                        "{}  USB {:04x}:{:04x} {}",
                        port.port_name,
                        usb.vid,
                        usb.pid,
                        usb.product.unwrap_or_default()
                    ),
                    _ => println!("{}", port.port_name),
                }
            }
            Ok(true)
        }
        Some(("crc", sub)) => {
            let text: String = sub
                .get_many::<String>("bytes")
                .into_iter()
                .flatten()
                .map(|s| s.trim_start_matches("0x"))
                .collect();
            let bytes = hex::decode(&text).with_context(|| format!("not a hex byte string: {}", text))?;
            let [lo, hi] = crc16_bytes(&bytes);
            println!("CRC-16/Modbus: 0x{:04X} (wire: {:02X} {:02X})", crc16_modbus(&bytes), lo, hi);
            Ok(true)
        }
        Some(("init-config", sub)) => {
            let path = sub.get_one::<String>("path").ok_or_else(|| anyhow!("missing <path>"))?;
            config.save_to_file(path)?;
            println!("📝 Configuration written to {}", path);
            Ok(true)
        }
        Some((name, sub)) => {
            let master = Arc::new(ModbusMaster::from_config(config)?);
            match name {
                "open" => {
                    let actuator: String = parse(sub, "actuator")?;
                    single_transaction(&master, formatter.as_ref(), move |m| m.open_valve(&actuator)).await?;
                }
                "close" => {
                    let actuator: String = parse(sub, "actuator")?;
                    single_transaction(&master, formatter.as_ref(), move |m| m.close_valve(&actuator)).await?;
                }
                "position" => {
                    let actuator: String = parse(sub, "actuator")?;
                    let percent: i64 = parse(sub, "percent")?;
                    single_transaction(&master, formatter.as_ref(), move |m| m.set_position(&actuator, percent))
                        .await?;
                }
                "custom" => {
                    let device_id: i64 = parse(sub, "device_id")?;
                    let function: i64 = parse(sub, "function")?;
                    let address: i64 = parse(sub, "address")?;
                    let value: i64 = parse(sub, "value")?;
                    single_transaction(&master, formatter.as_ref(), move |m| {
                        m.send_custom_request(device_id, function, address, value)
                    })
                    .await?;
                }
                "poll" => {
                    let mut poll = config.poll.clone();
                    if let Some(interval_ms) = parse_opt(sub, "interval")? {
                        poll.interval_ms = interval_ms;
                    }
                    if let Some(address) = parse_opt(sub, "address")? {
                        poll.address = address;
                    }
                    if let Some(quantity) = parse_opt(sub, "quantity")? {
                        poll.quantity = quantity;
                    }
                    if sub.get_flag("input") {
                        poll.function = READ_INPUT_REGISTERS;
                    }
                    if poll.interval_ms == 0 {
                        return Err(anyhow!("poll interval must be positive"));
                    }
                    let count = parse_opt(sub, "count")?;
                    poll_loop(master, poll, count, formatter.as_ref()).await?;
                }
                other => return Err(anyhow!("unknown command: {}", other)),
            }
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_position() {
        let matches = build_cli()
            .try_get_matches_from(["valvectl", "--port", "COM5", "position", "TOP-E Module", "40"])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "position");
        assert_eq!(parse::<String>(sub, "actuator").unwrap(), "TOP-E Module");
        assert_eq!(parse::<i64>(sub, "percent").unwrap(), 40);
        assert_eq!(matches.get_one::<String>("port").map(String::as_str), Some("COM5"));
    }

    #[test]
    fn test_cli_accepts_negative_custom_fields() {
        let matches = build_cli()
            .try_get_matches_from(["valvectl", "custom", "1", "6", "-1", "0"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        assert_eq!(parse::<i64>(sub, "address").unwrap(), -1);
    }

    #[test]
    fn test_global_args_after_subcommand() {
        let matches = build_cli()
            .try_get_matches_from(["valvectl", "open", "Grey-M Multivoltas", "--device", "4", "-f", "json"])
            .unwrap();
        let mut config = Config::default();
        config.apply_matches(&matches).unwrap();
        assert_eq!(config.device_id, 4);
        assert_eq!(matches.get_one::<String>("format").map(String::as_str), Some("json"));
    }

    #[test]
    fn test_reached_wire() {
        assert!(!reached_wire(&ModbusError::UnknownActuator("x".into())));
        assert!(!reached_wire(&ModbusError::TransactionInProgress));
        assert!(reached_wire(&ModbusError::FrameTooShort(0)));
    }

    #[tokio::test]
    async fn test_profiles_and_crc_commands_need_no_port() {
        let config = Config::default();
        for args in [vec!["valvectl", "profiles"], vec!["valvectl", "crc", "01", "06", "00", "01", "00", "01"]] {
            let matches = build_cli().try_get_matches_from(args).unwrap();
            assert!(handle_subcommands(&matches, &config).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_open_on_missing_port_fails() {
        let mut config = Config::default();
        config.serial.port = "/dev/valve-modbus-no-such-port".to_string();
        let matches = build_cli()
            .try_get_matches_from(["valvectl", "open", "Grey-M Multivoltas"])
            .unwrap();

        let err = handle_subcommands(&matches, &config).await.unwrap_err();
        let modbus = err.downcast_ref::<ModbusError>().unwrap();
        assert_eq!(modbus.kind(), ErrorKind::PortUnavailable);
    }
}
