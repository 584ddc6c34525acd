use clap::{Arg, Command};
use log::LevelFilter;
use mailgate::{Config, Gateway, Server};
use std::process;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG: &str = "/etc/mailgate.yaml";

#[tokio::main]
async fn main() {
    let matches = Command::new("mailgate")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Inbound SMTP gateway that turns received mail into queue jobs")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("classify")
                .long("classify")
                .value_name("ADDRESS")
                .help("Print how a recipient address is classified and exit")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG);

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if let Some(address) = matches.get_one::<String>("classify") {
        let classified = mailgate::classify(address, &config.domains.allowed);
        match serde_json::to_string_pretty(&classified) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error encoding classification: {e}");
                process::exit(1);
            }
        }
        return;
    }

    if matches.get_flag("test-config") {
        println!("Testing configuration...");
        println!("Allowed domains: {}", config.domains.allowed.join(", "));
        println!("Queue backend: {:?}", config.queue.backend);
        println!(
            "Checks: dns={} dkim={} spf={} spam={}",
            config.validation.dns.enabled,
            config.validation.dkim.enabled,
            config.validation.spf.enabled,
            config.validation.spam.enabled
        );
        println!("Configuration is valid.");
        return;
    }

    if let Err(e) = run(config).await {
        log::error!("Server error: {e:#}");
        process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    log::info!(
        "Starting mailgate {} for domains: {}",
        env!("CARGO_PKG_VERSION"),
        config.domains.allowed.join(", ")
    );

    let gateway = Arc::new(Gateway::from_config(&config).await?);
    let server = Server::new(
        gateway,
        Duration::from_secs(config.server.command_timeout_seconds),
    );

    let address = format!("{}:{}", config.server.listen_address, config.server.port);
    server.run(&address).await
}

/// Read the file (or defaults when it is missing), apply `MAILGATE_*`
/// overrides and validate the result.
fn load_config(path: &str) -> anyhow::Result<Config> {
    let mut config = if std::path::Path::new(path).exists() {
        Config::from_file(path)?
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Config::default()
    };
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}
