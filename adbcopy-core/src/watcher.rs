//! Device Watcher
//!
//! Polls the command channel for attached devices and publishes the
//! differences between two polls as [`DeviceEvent`]s. A detached device can
//! be forwarded to a [`TransferQueue`] so its tasks fail instead of hanging.

use crate::channel::{CommandChannel, DeviceId, DeviceInfo};
use crate::queue::TransferQueue;
use crate::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default interval between two device polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Device list changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A ready device appeared
    Attached(DeviceInfo),
    /// A previously seen device is gone or no longer ready
    Detached(DeviceId),
    /// Polling failed; only sent when the message changes
    Error {
        message: String,
    },
}

#[derive(Debug, Default)]
struct WatchState {
    known: BTreeMap<DeviceId, DeviceInfo>,
    last_error: Option<String>,
}

/// Polling device watcher
#[derive(Debug)]
pub struct DeviceWatcher {
    channel: Arc<dyn CommandChannel>,
    poll_interval: Duration,
    event_tx: broadcast::Sender<DeviceEvent>,
    state: Mutex<WatchState>,
}

impl DeviceWatcher {
    pub fn new(channel: Arc<dyn CommandChannel>, poll_interval: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            channel,
            poll_interval,
            event_tx,
            state: Mutex::new(WatchState::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.event_tx.subscribe()
    }

    /// Devices seen by the last successful poll
    pub async fn devices(&self) -> Vec<DeviceInfo> {
        self.state.lock().await.known.values().cloned().collect()
    }

    /// Poll once and publish what changed
    pub async fn poll_once(&self) -> Result<Vec<DeviceEvent>> {
        let listed = match self.channel.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                let message = e.to_string();
                let mut state = self.state.lock().await;
                if state.last_error.as_deref() != Some(message.as_str()) {
                    warn!("Device poll failed: {}", message);
                    state.last_error = Some(message.clone());
                    let _ = self.event_tx.send(DeviceEvent::Error { message });
                }
                return Err(e);
            }
        };

        let mut state = self.state.lock().await;
        state.last_error = None;

        let current: BTreeMap<DeviceId, DeviceInfo> = listed
            .into_iter()
            .filter(DeviceInfo::is_ready)
            .map(|device| (device.id.clone(), device))
            .collect();

        let mut events = Vec::new();
        for id in state.known.keys() {
            if !current.contains_key(id) {
                info!("Device detached: {}", id);
                events.push(DeviceEvent::Detached(id.clone()));
            }
        }
        for (id, device) in &current {
            if !state.known.contains_key(id) {
                info!("Device attached: {} ({})", id, device.display_name());
                events.push(DeviceEvent::Attached(device.clone()));
            }
        }
        state.known = current;
        drop(state);

        for event in &events {
            let _ = self.event_tx.send(event.clone());
        }
        Ok(events)
    }

    /// Poll forever on the configured interval
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let watcher = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = interval(watcher.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(e) = watcher.poll_once().await {
                    debug!("Device poll error: {}", e);
                }
            }
        })
    }

    /// Fail the tasks of every device that detaches
    pub fn forward_to(&self, queue: TransferQueue) -> JoinHandle<()> {
        let mut events = self.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DeviceEvent::Detached(device)) => {
                        queue.device_disconnected(&device).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Device watcher lagged, {} event(s) lost", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
