use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use clap::builder::FalseyValueParser;
use clap::Parser;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tracing_subscriber::filter::LevelFilter;
use tuya2mqtt::bridge::Bridge;
use tuya2mqtt::config;
use tuya2mqtt::config::LogLevel;
use tuya2mqtt::config::Source;
use tuya2mqtt::config::TransportBackend;
use tuya2mqtt::mqtt::RumqttcClient;
use tuya2mqtt::registry;
use tuya2mqtt::translate::OFFLINE;
use tuya2mqtt::transport::HelperConnector;
use tuya2mqtt::transport::NativeConnector;
use tuya2mqtt::Config;
use tuya2mqtt::ConfigError;
use tuya2mqtt::Device;

/// Bridge Tuya local-protocol devices to an MQTT broker
#[derive(Debug, Parser)]
#[command(name = "tuya2mqtt", version, about)]
struct Cli {
    /// Bridge configuration (TOML). Defaults to ./tuya2mqtt.toml, then /tuya2mqtt.toml
    #[arg(short, long, env = "TUYA2MQTT_CONFIG")]
    config: Option<PathBuf>,

    /// Device inventory (JSON). Defaults to ./devices.json, then /devices.json
    #[arg(short, long, env = "TUYA2MQTT_DEVICES")]
    devices: Option<PathBuf>,

    /// Log level, overriding [logging] level
    #[arg(long, env = "TUYA2MQTT_LOG")]
    log_level: Option<LogLevel>,

    /// Force debug logging. Any non-empty value other than 0/false/no/off enables it
    #[arg(long, env = "DEBUG", value_parser = FalseyValueParser::new())]
    debug: bool,

    /// Log raw device traffic (native) or ask the helper to (helper)
    #[arg(long, env = "TINYTUYA_DEBUG", value_parser = FalseyValueParser::new())]
    transport_debug: bool,
}

fn load_config(cli: &Cli) -> Result<(Config, PathBuf), ConfigError> {
    let path = config::locate(cli.config.as_deref(), config::CONFIG_CANDIDATES, Source::Mapping)?;
    let config = Config::from_file(&path)?;
    Ok((config, path))
}

/// Load the inventory and join it with the device sections
fn load_devices(
    cli: &Cli,
    config: &Config,
    config_path: &Path,
) -> Result<Vec<Device>, ConfigError> {
    let inventory_path = config::locate(
        cli.devices.as_deref(),
        config::INVENTORY_CANDIDATES,
        Source::Inventory,
    )?;
    tracing::info!("Loading device inventory from {}", inventory_path.display());

    let inventory = config::load_inventory(&inventory_path)?;
    registry::build(config, config_path, inventory, &inventory_path)
}

/// Print a one-line diagnostic and exit with the error's status
fn exit_with(e: ConfigError) -> ! {
    eprintln!("tuya2mqtt: {}", e);
    std::process::exit(e.exit_code());
}

fn log_level(cli: &Cli, config: &Config) -> LevelFilter {
    if cli.debug {
        LevelFilter::DEBUG
    } else {
        cli.log_level.unwrap_or(config.logging.level).into()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, config_path) = load_config(&cli).unwrap_or_else(|e| exit_with(e));

    tracing_subscriber::fmt()
        .with_max_level(log_level(&cli, &config))
        .init();

    tracing::info!("tuya2mqtt {} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!("Loaded config from {}", config_path.display());

    let devices = load_devices(&cli, &config, &config_path).unwrap_or_else(|e| exit_with(e));
    tracing::info!(
        "Bridging {} devices via {}:{}",
        devices.len(),
        config.broker.hostname,
        config.broker.port
    );

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let shutdown = async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
            }
            _ = terminate.recv() => {}
        }
    };

    let bridge = Bridge::new(&config);
    let make_client = |device: &Device| {
        RumqttcClient::new(
            &config.broker,
            format!("{}-{}", config.broker.client_id_prefix, device.id),
            &bridge.layout().availability_topic(&device.id),
            OFFLINE,
        )
    };

    tracing::info!("Using {} device transport", config.transport.backend);
    let summary = match config.transport.backend {
        TransportBackend::Native => {
            let connector = NativeConnector::new(&config.transport, cli.transport_debug);
            bridge.run(devices, connector, make_client, shutdown).await
        }
        TransportBackend::Helper => {
            let connector = HelperConnector::new(config.transport.clone(), cli.transport_debug);
            bridge.run(devices, connector, make_client, shutdown).await
        }
    };

    tracing::info!(
        "tuya2mqtt shutdown complete ({} stopped, {} faulted)",
        summary.stopped,
        summary.faulted
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both variables are only touched here, so a single test avoids racing
    // other tests on the process environment.
    #[test]
    fn test_debug_env_toggles() {
        std::env::set_var("DEBUG", "1");
        std::env::set_var("TINYTUYA_DEBUG", "x");
        let cli = Cli::try_parse_from(["tuya2mqtt"]).unwrap();
        assert!(cli.debug);
        assert!(cli.transport_debug);

        std::env::set_var("DEBUG", "0");
        std::env::set_var("TINYTUYA_DEBUG", "");
        let cli = Cli::try_parse_from(["tuya2mqtt"]).unwrap();
        assert!(!cli.debug);
        assert!(!cli.transport_debug);

        std::env::remove_var("DEBUG");
        std::env::remove_var("TINYTUYA_DEBUG");
        let cli = Cli::try_parse_from(["tuya2mqtt", "--debug"]).unwrap();
        assert!(cli.debug);
        assert!(!cli.transport_debug);
    }
}
