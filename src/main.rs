use clap::Parser;
use iohub::config::HubConfig;
use iohub::hub::Hub;
use iohub::logger::BacklogLogger;
use log::{error, warn};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "iohub", version, about = "Input event hub process")]
struct Cli {
    /// Hub configuration file (TOML). Built-in defaults when omitted.
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Override the UDP port from the configuration
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Debug verbosity level (0=quiet, 1=info, 2=debug, 3=trace)
    #[arg(short = 'd', long = "debug", value_name = "LEVEL", default_value = "0")]
    debug: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.debug {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // RUST_LOG overrides the CLI level.
    let logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).build();
    let max_level = logger.filter().max(log::LevelFilter::Info);
    if let Err(e) = BacklogLogger::new(logger).install(max_level) {
        eprintln!("logger already installed: {}", e);
    }

    warn!("Starting iohub v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => match HubConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        None => HubConfig::default(),
    };
    if let Some(port) = cli.port {
        config.hub.udp_port = port;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        let hub = Hub::start(config)?;
        hub.run().await
    });
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
