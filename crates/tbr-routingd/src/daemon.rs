//! Async event loop around [`BorderRouter`].
//!
//! Control events arrive on a bounded mpsc channel. Timer deadlines are
//! slept on in the same `select!`, so expirations are serialized with
//! events and never race a teardown.

use crate::border_router::{BorderRouter, BorderRouterEvent};
use crate::error::{BorderRoutingError, Result};
use crate::platform::{InfraLinkOps, MeshOps};
use crate::snapshot::{SnapshotHandle, TableSnapshot};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Client side of a running [`Daemon`].
#[derive(Clone)]
pub struct DaemonHandle {
    events: mpsc::Sender<BorderRouterEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    snapshot: SnapshotHandle,
}

impl DaemonHandle {
    /// Queues an event, waiting for channel capacity.
    pub async fn send(&self, event: BorderRouterEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| BorderRoutingError::ChannelClosed)
    }

    pub fn snapshot(&self) -> Arc<TableSnapshot> {
        self.snapshot.load()
    }

    pub fn snapshot_handle(&self) -> SnapshotHandle {
        self.snapshot.clone()
    }

    /// Asks the loop to stop after the event it is processing.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

pub struct Daemon<P> {
    router: BorderRouter<P>,
    events: mpsc::Receiver<BorderRouterEvent>,
    shutdown: watch::Receiver<bool>,
}

impl<P: InfraLinkOps + MeshOps> Daemon<P> {
    pub fn new(router: BorderRouter<P>, capacity: usize) -> (Self, DaemonHandle) {
        let (event_tx, event_rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = DaemonHandle {
            events: event_tx,
            shutdown: Arc::new(shutdown_tx),
            snapshot: router.snapshot_handle(),
        };
        let daemon = Self {
            router,
            events: event_rx,
            shutdown: shutdown_rx,
        };
        (daemon, handle)
    }

    /// Runs until shutdown is requested or every handle is dropped and the
    /// queue is drained. Returns the router for inspection.
    pub async fn run(mut self) -> BorderRouter<P> {
        self.router.start(now());
        info!("Event loop running");

        let mut shutdown_open = true;
        loop {
            let deadline = self.router.next_deadline();
            tokio::select! {
                biased;

                changed = self.shutdown.changed(), if shutdown_open => match changed {
                    Ok(()) if *self.shutdown.borrow() => {
                        info!("Shutdown requested");
                        break;
                    }
                    Ok(()) => {}
                    Err(_) => shutdown_open = false,
                },

                event = self.events.recv() => match event {
                    Some(event) => self.router.handle_event(event, now()),
                    None => {
                        info!("Event channel closed");
                        break;
                    }
                },

                () = sleep_until(deadline) => {
                    debug!("Timer deadline reached");
                    self.router.on_timer(now());
                }
            }
        }

        self.router
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BorderRoutingConfig;
    use crate::metrics::MetricsCollector;
    use crate::platform::RecordingPlatform;
    use pretty_assertions::assert_eq;

    fn daemon() -> (Daemon<RecordingPlatform>, DaemonHandle) {
        let router = BorderRouter::new(
            BorderRoutingConfig::default(),
            RecordingPlatform::new(),
            MetricsCollector::new().unwrap(),
        );
        Daemon::new(router, 8)
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let (daemon, handle) = daemon();
        let task = tokio::spawn(daemon.run());
        handle.shutdown();
        let router = task.await.unwrap();
        assert!(router.snapshot().generation >= 1);
    }

    #[tokio::test]
    async fn test_drains_queue_when_handles_dropped() {
        let (daemon, handle) = daemon();
        handle.send(BorderRouterEvent::MeshLinkUp).await.unwrap();
        let snapshot = handle.snapshot_handle();
        drop(handle);

        let router = daemon.run().await;
        assert_eq!(router.snapshot().mesh, crate::types::LinkState::Up);
        assert_eq!(snapshot.load().mesh, crate::types::LinkState::Up);
    }

    #[tokio::test]
    async fn test_send_after_exit_fails() {
        let (daemon, handle) = daemon();
        handle.shutdown();
        let _router = daemon.run().await;
        assert!(matches!(
            handle.send(BorderRouterEvent::MeshLinkUp).await,
            Err(BorderRoutingError::ChannelClosed)
        ));
    }
}
