use anyhow::{Context, Result};
use futures_util::future::join_all;
use lib_vent::actuator::serial::open_serial;
use lib_vent::actuator::ActuatorDriver;
use lib_vent::bridge::MqttBridge;
use lib_vent::core::Arbiter;
use lib_vent::fanout::StateFanout;
use lib_vent::EventBus;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

mod ventilation_logic;
use ventilation_logic::{config, downstream, logger};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    logger::setup_logging(&log_dir, config.log_level.as_deref().unwrap_or("info"), config.debug.as_deref())?;

    let settings = Arc::new(config.to_settings().context("invalid configuration")?);
    log::info!("{}", settings);

    let bus = Arc::new(EventBus::new());

    // Consumers of canonical state subscribe before the arbiter can publish anything.
    let fanout_handle = tokio::spawn(StateFanout::new(Arc::clone(&bus)).run());

    let (serial_rd, serial_wr) = open_serial(&settings.tty, settings.baud)
        .with_context(|| format!("cannot open damper controller at {}", settings.tty.display()))?;
    let driver = ActuatorDriver::new(Arc::clone(&bus), serial_wr, &settings);
    let driver_handle = tokio::spawn(async move {
        if let Err(e) = driver.run(serial_rd).await {
            log::error!("Actuation driver stopped: {}", e);
        }
    });

    let bridge = MqttBridge::new(Arc::clone(&bus), &settings)?;
    let bridge_handle = tokio::spawn(bridge.run());

    let arbiter_handle = tokio::spawn(Arbiter::new(Arc::clone(&bus), &settings).run());

    let mut downstream_handle = tokio::spawn(downstream::run(downstream::WebState::new(
        Arc::clone(&bus),
        Arc::clone(&settings),
    )));

    // Wait for shutdown signal, or for the web server to fail on its own
    let mut downstream_done = false;
    tokio::select! {
        _ = shutdown_signal() => {}
        result = &mut downstream_handle => {
            downstream_done = true;
            match result {
                Ok(Ok(())) => log::warn!("Downstream server exited."),
                Ok(Err(e)) => log::error!("Downstream server failed: {:#}", e),
                Err(e) => log::error!("Downstream server task failed: {}", e),
            }
        }
    }

    // Send shutdown signal to all components
    bus.shutdown().await;

    // Wait for components to shut down
    let mut handles = vec![fanout_handle, driver_handle, bridge_handle, arbiter_handle];
    if !downstream_done {
        handles.push(tokio::spawn(async move {
            if let Ok(Err(e)) = downstream_handle.await {
                log::error!("Downstream server failed: {:#}", e);
            }
        }));
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, join_all(handles)).await.is_err() {
        log::warn!("Components did not stop within {:?}, exiting anyway.", SHUTDOWN_GRACE);
    }

    log::info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => log::info!("Ctrl-C received, initiating shutdown."),
            Err(e) => {
                log::error!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            Err(e) => {
                log::error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
