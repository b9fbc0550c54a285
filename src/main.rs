pub mod config;
pub mod console;
pub mod fleet;
pub mod mqtt;
pub mod panel;

use crate::config::PanelConfig;
use crate::mqtt::mqtt_handler::MqttHandler;
use crate::panel::dispatcher::Dispatcher;
use color_eyre::Result;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let (config, path) = PanelConfig::load().await?;
    setup_logging(config.log_level());
    info!("Loaded config from {}", path.display());
    for warning in config.warnings() {
        warn!("{}", warning);
    }

    let (handle, events, dispatcher) = Dispatcher::spawn(
        &config,
        Box::new(MqttHandler::new()),
        Box::new(MqttHandler::new()),
    );
    let printer = console::spawn_event_printer(events);

    let result = console::run(handle.clone(), &config).await;

    info!("Shutting down");
    if let Err(e) = handle.shutdown().await {
        warn!("Dispatcher already gone: {}", e);
    }
    if let Err(e) = dispatcher.await {
        error!("Dispatcher task failed: {}", e);
    }
    // The event stream closes with the dispatcher
    if let Err(e) = printer.await {
        error!("Event printer failed: {}", e);
    }

    result
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
