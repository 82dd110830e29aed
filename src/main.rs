pub use clap::Parser;
use gaitd::{
    args,
    server::{hardware_factory, ControlServer, ServerConfig},
};
use std::sync::mpsc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, prelude::*, EnvFilter};

fn main() -> eyre::Result<()> {
    // Setup the error handler
    color_eyre::install()?;
    // Get the CLI options
    let cli = args::Cli::parse();
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = ServerConfig {
        command_port: cli.command_port,
        response_port: cli.response_port,
        live_data_port: cli.live_data_port,
        timeout_period: Duration::from_millis(cli.timeout_period),
        live_data_interval: Duration::from_millis(cli.live_data_interval),
    };
    let factory = hardware_factory(
        cli.delsys_host,
        cli.magstim_port.map(|p| p.display().to_string()),
    );

    let mut server = ControlServer::new(config, factory);
    server.start()?;

    // Park until SIGINT, then tear the server down
    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })?;
    shutdown_rx.recv()?;
    info!("Shutting down!");
    server.stop();

    Ok(())
}
