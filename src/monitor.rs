/// Server monitoring
///
/// One monitor task per known address repeatedly probes the server and
/// reports the resulting description to the topology. Probe failures are
/// never fatal to the monitor; it keeps retrying on a shorter backoff until
/// the owning cluster tears it down.
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::cluster::state::SharedTopology;
use crate::conn::{ConnectionFactory, ProbeReply, ServerConnection};
use crate::topology::{ServerAddress, ServerDescription};

/// Weight of the newest sample in the round-trip-time moving average
const RTT_SAMPLE_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone)]
pub(crate) struct MonitorOptions {
    /// Interval between probes while the server is responding
    pub heartbeat_interval: Duration,
    /// Shorter backoff used after a failed probe
    pub min_heartbeat_interval: Duration,
}

/// Handle used by the cluster to signal a running monitor
pub(crate) struct MonitorHandle {
    address: ServerAddress,
    check_requested: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
}

impl MonitorHandle {
    /// Ask for an immediate out-of-band probe (fast failure detection after
    /// a caller's operation hit a network error)
    pub fn request_check(&self) {
        self.check_requested.notify_one();
    }

    /// Signal the monitor to stop. Returns once signaled; an in-flight probe
    /// is allowed to finish and its late result is discarded by the topology.
    pub fn stop(&self) {
        debug!(address = %self.address, "stopping monitor");
        let _ = self.shutdown_tx.send(true);
    }
}

/// Spawn a monitor task for one address
pub(crate) fn spawn(
    address: ServerAddress,
    factory: Arc<dyn ConnectionFactory>,
    topology: Arc<SharedTopology>,
    options: MonitorOptions,
) -> MonitorHandle {
    let check_requested = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(run(
        address.clone(),
        factory,
        topology,
        options,
        Arc::clone(&check_requested),
        shutdown_rx,
    ));

    MonitorHandle {
        address,
        check_requested,
        shutdown_tx,
    }
}

async fn run(
    address: ServerAddress,
    factory: Arc<dyn ConnectionFactory>,
    topology: Arc<SharedTopology>,
    options: MonitorOptions,
    check_requested: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(address = %address, "monitor started");
    let mut connection: Option<Box<dyn ServerConnection>> = None;
    let mut smoothed_rtt: Option<Duration> = None;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let description = match probe_once(&address, &factory, &mut connection).await {
            Ok((reply, sample)) => {
                smoothed_rtt = Some(smooth_rtt(smoothed_rtt, sample));
                describe(&address, reply, smoothed_rtt)
            }
            Err(error) => {
                warn!(address = %address, %error, "probe failed");
                connection = None;
                smoothed_rtt = None;
                ServerDescription::unreachable(address.clone(), error.to_string())
            }
        };
        let failed = description.error.is_some();

        if !topology.apply_report(description) {
            // cluster closed while we were probing
            break;
        }

        let delay = if failed {
            options.min_heartbeat_interval
        } else {
            options.heartbeat_interval
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = check_requested.notified() => {
                debug!(address = %address, "immediate check requested");
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!(address = %address, "monitor stopped");
}

async fn probe_once(
    address: &ServerAddress,
    factory: &Arc<dyn ConnectionFactory>,
    connection: &mut Option<Box<dyn ServerConnection>>,
) -> crate::error::Result<(ProbeReply, Duration)> {
    if connection.is_none() {
        *connection = Some(factory.connect(address).await?);
    }
    let conn = connection.as_mut().expect("connection just established");

    let started = Instant::now();
    let reply = conn.probe().await?;
    Ok((reply, started.elapsed()))
}

fn smooth_rtt(previous: Option<Duration>, sample: Duration) -> Duration {
    match previous {
        Some(prev) => Duration::from_secs_f64(
            prev.as_secs_f64() * (1.0 - RTT_SAMPLE_WEIGHT)
                + sample.as_secs_f64() * RTT_SAMPLE_WEIGHT,
        ),
        None => sample,
    }
}

fn describe(
    address: &ServerAddress,
    reply: ProbeReply,
    round_trip_time: Option<Duration>,
) -> ServerDescription {
    ServerDescription {
        address: address.clone(),
        role: reply.role,
        round_trip_time,
        last_probe: Some(SystemTime::now()),
        error: None,
        set_name: reply.set_name,
        election_ordinal: reply.election_ordinal,
        hosts: reply.hosts,
        tags: reply.tags,
        last_write: reply.last_write,
        logical_session_timeout: reply.logical_session_timeout,
    }
}
