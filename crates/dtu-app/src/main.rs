use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use dtu_app::DtuConfig;
use dtu_client::DtuClient;
use limit_coordinator::{
    LimitCoordinator, LimitOutcome, MemorySink, PollerActor, PollerConfig, PollerError,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = parse_config_arg();
    let config = DtuConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;

    if let Some(listen) = config.metrics_listen.as_deref() {
        install_metrics_exporter(listen)?;
    }

    let client = DtuClient::new(config.client.clone()).context("dtu client init failed")?;
    info!(
        base_url = %client.base_url(),
        inverters = config.inverters.len(),
        "using OpenDTU gateway"
    );
    let sink = Arc::new(MemorySink::default());
    let coordinator = LimitCoordinator::new(
        config.coordinator.clone(),
        &config.inverters,
        Arc::new(client),
        sink.clone(),
    );

    let accepted = coordinator.apply_initial_limits().await;
    info!(
        accepted,
        inverters = coordinator.devices().len(),
        "initial limits applied"
    );

    let mut join_set = JoinSet::new();
    for serial in coordinator.devices().serials() {
        spawn_poller(
            &coordinator,
            serial,
            config.poller.clone(),
            &mut join_set,
            Duration::ZERO,
        );
    }

    let cycle_handle = tokio::spawn(cycle_task(
        coordinator.clone(),
        sink,
        Duration::from_millis(config.cycle_interval_ms),
        config.static_limit_w,
    ));

    notify_ready();
    let watchdog_handle = start_watchdog(coordinator.shutdown_signal());

    let mut shutdown_signal = std::pin::pin!(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("shutdown signal received");
                coordinator.shutdown();
                break;
            }
            maybe_result = join_set.join_next() => {
                let Some(result) = maybe_result else {
                    break;
                };
                match result {
                    Ok((serial, Ok(()))) => {
                        info!(serial = %serial, "poller exited cleanly");
                        if !coordinator.is_shut_down() {
                            spawn_poller(
                                &coordinator,
                                serial,
                                config.poller.clone(),
                                &mut join_set,
                                Duration::from_millis(config.respawn_delay_ms),
                            );
                        }
                    }
                    Ok((serial, Err(err))) => {
                        warn!(serial = %serial, error = %err, "poller exited with error");
                    }
                    Err(err) => {
                        warn!(error = %err, "poller task failed");
                    }
                }
            }
        }
    }

    join_set.abort_all();
    while let Some(result) = join_set.join_next().await {
        if let Err(err) = result {
            if !err.is_cancelled() {
                warn!(error = %err, "poller task join failed");
            }
        }
    }

    let _ = cycle_handle.await;
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

fn spawn_poller(
    coordinator: &LimitCoordinator,
    serial: String,
    config: PollerConfig,
    join_set: &mut JoinSet<(String, Result<(), PollerError>)>,
    delay: Duration,
) {
    let coordinator = coordinator.clone();
    join_set.spawn(async move {
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let shutdown = coordinator.shutdown_signal();
        let actor = PollerActor::new(serial.clone(), coordinator, shutdown, config);
        (serial, actor.run().await)
    });
}

/// Drives the per-cycle hook. With a static target configured it also plays
/// the part of the limiting controller.
async fn cycle_task(
    coordinator: LimitCoordinator,
    sink: Arc<MemorySink>,
    interval: Duration,
    static_limit_w: Option<i32>,
) {
    let mut shutdown = coordinator.shutdown_signal();
    loop {
        tokio::select! {
            _ = sleep(interval) => {
                let aggregate = coordinator.on_cycle();
                debug!(
                    total_power_w = aggregate.total_power_w,
                    total_ceiling_w = aggregate.total_ceiling_w,
                    reporting = aggregate.reporting_devices,
                    comm_failed = aggregate.comm_failed_devices,
                    "cycle"
                );

                if let Some(target_w) = static_limit_w {
                    match coordinator.set_active_power_limit(target_w) {
                        LimitOutcome::Distributed(decisions) => {
                            for decision in decisions {
                                debug!(
                                    serial = %decision.serial,
                                    decision = ?decision.decision,
                                    target_w,
                                    "limit decision"
                                );
                            }
                        }
                        outcome => debug!(target_w, ?outcome, "limit not distributed"),
                    }
                }

                for (key, value) in sink.snapshot() {
                    trace!(channel = %key, ?value, "channel");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("cycle task shutdown requested");
                    break;
                }
            }
        }
    }
}

fn install_metrics_exporter(listen: &str) -> Result<()> {
    let addr: SocketAddr = listen.parse().context("parse metrics listen address")?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("prometheus exporter install failed")?;

    metrics::describe_counter!("opendtu_ingest_total", "Live-data ingests by outcome");
    metrics::describe_counter!("opendtu_limit_writes_total", "Limit writes by outcome");
    metrics::describe_counter!(
        "opendtu_limit_decisions_total",
        "Per-inverter limit decisions by kind"
    );
    info!(%addr, "prometheus exporter listening");
    Ok(())
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(
    mut shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
