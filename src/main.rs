use anyhow::Result;
use log::{debug, error};

use valve_modbus::cli::{build_cli, handle_subcommands};
use valve_modbus::Config;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    init_logging(matches.get_flag("verbose"));

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_matches(&matches)?;
    debug!("🖥️  valvectl {} on {}", valve_modbus::VERSION, config.serial.port);

    match handle_subcommands(&matches, &config).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            build_cli().print_help()?;
            Ok(())
        }
        Err(e) => {
            error!("💥 {:#}", e);
            Err(e)
        }
    }
}
