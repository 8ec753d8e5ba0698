//! Runs one poll worker per device until shutdown.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::task::JoinSet;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::device::Device;
use crate::mqtt::MqttClient;
use crate::poll::PollWorker;
use crate::poll::WorkerError;
use crate::translate::TopicLayout;
use crate::transport::TransportConnector;

/// How long workers get to release their devices after shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// How the workers ended
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub stopped: usize,
    pub faulted: usize,
}

impl Summary {
    fn record(&mut self, joined: Result<(String, Result<(), WorkerError>), JoinError>) {
        match joined {
            Ok((id, Ok(()))) => {
                info!("[{}] Worker stopped", id);
                self.stopped += 1;
            }
            Ok((id, Err(e))) => {
                error!("[{}] Worker faulted: {}", id, e);
                self.faulted += 1;
            }
            Err(e) => {
                error!("Worker task failed: {}", e);
                self.faulted += 1;
            }
        }
    }
}

pub struct Bridge {
    layout: TopicLayout,
    interval: Duration,
}

impl Bridge {
    pub fn new(config: &Config) -> Self {
        Self {
            layout: TopicLayout::from(&config.bridge),
            interval: Duration::from_secs(config.bridge.poll_interval_secs.max(1)),
        }
    }

    pub fn layout(&self) -> &TopicLayout {
        &self.layout
    }

    /// Spawn a worker per device and wait for `signal`.
    ///
    /// Returns early if every worker has exited on its own.
    pub async fn run<C, M, F, S>(
        &self,
        devices: Vec<Device>,
        connector: C,
        make_client: F,
        signal: S,
    ) -> Summary
    where
        C: TransportConnector + Clone + 'static,
        M: MqttClient + 'static,
        F: Fn(&Device) -> M,
        S: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = JoinSet::new();

        if devices.is_empty() {
            warn!("No devices to bridge");
        }

        for device in devices {
            let id = device.id.clone();
            let mqtt = make_client(&device);
            let worker = PollWorker::new(
                device,
                self.layout.clone(),
                self.interval,
                connector.clone(),
                mqtt,
            );
            let shutdown = shutdown_rx.clone();
            workers.spawn(async move { (id, worker.run(shutdown).await) });
        }

        let mut summary = Summary::default();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Received shutdown signal");
                    break;
                }
                joined = workers.join_next() => match joined {
                    Some(joined) => summary.record(joined),
                    None => {
                        warn!("No device workers left running");
                        return summary;
                    }
                },
            }
        }

        let _ = shutdown_tx.send(true);
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;

        loop {
            match tokio::time::timeout_at(deadline, workers.join_next()).await {
                Ok(Some(joined)) => summary.record(joined),
                Ok(None) => break,
                Err(_) => {
                    warn!("{} workers did not stop in time, aborting them", workers.len());
                    workers.abort_all();
                    while let Some(joined) = workers.join_next().await {
                        summary.record(joined);
                    }
                    break;
                }
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;
    use crate::mqtt::MockMqttClient;
    use crate::status::addr;
    use crate::status::Snapshot;
    use crate::translate::tests::device;
    use crate::translate::tests::fan;
    use crate::transport::mock::MockConnector;

    fn bridge() -> Bridge {
        Bridge {
            layout: TopicLayout::default(),
            interval: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_failed_device_does_not_affect_others() {
        let mut snapshot = Snapshot::new();
        snapshot.insert(addr(1), true);
        let connector = MockConnector::new(snapshot);
        connector.device.lock().unwrap().unreachable.push("bf01".to_string());

        let mut healthy = device(vec![fan()]);
        healthy.id = "bf02".to_string();
        let devices = vec![device(vec![fan()]), healthy];

        let (signal_tx, signal_rx) = oneshot::channel::<()>();
        let state = connector.device.clone();
        tokio::spawn(async move {
            for _ in 0..400 {
                if state.lock().unwrap().polls > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let _ = signal_tx.send(());
        });

        let summary = bridge()
            .run(devices, connector.clone(), |_| MockMqttClient::pair().0, async {
                let _ = signal_rx.await;
            })
            .await;

        assert_eq!(summary, Summary { stopped: 1, faulted: 1 });
        let device = connector.device.lock().unwrap();
        assert_eq!(device.connects, 2);
        assert!(device.polls >= 1);
        assert!(device.closed);
    }

    #[tokio::test]
    async fn test_returns_when_all_workers_exit() {
        let connector = MockConnector::default();
        connector.device.lock().unwrap().unreachable.push("bf01".to_string());

        let summary = bridge()
            .run(
                vec![device(vec![fan()])],
                connector,
                |_| MockMqttClient::pair().0,
                std::future::pending(),
            )
            .await;

        assert_eq!(summary, Summary { stopped: 0, faulted: 1 });
    }
}
