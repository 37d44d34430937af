use clap::Parser;
use keel_cli::cli::Cli;
use keel_cli::config::Settings;
use keel_cli::logging::{init_logging, LoggingConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    cli.apply_overrides(&mut settings);

    let logging = LoggingConfig::new(settings.log_level.clone(), settings.log_format)
        .with_verbosity(cli.verbose);
    if let Err(e) = init_logging(logging) {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }

    if let Err(e) = keel_cli::run(cli, settings).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
