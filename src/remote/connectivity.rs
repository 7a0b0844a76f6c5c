use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connectivity {
    /// A network interface is up.
    pub connected: bool,
    /// The remote service answered recently.
    pub reachable: bool,
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        self.connected && self.reachable
    }
}

/// Current connectivity as seen by the device. Queue processors consult it
/// before every network attempt.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    state: watch::Sender<Connectivity>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(Connectivity {
            connected: online,
            reachable: online,
        });
        Self { state }
    }

    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    pub fn set(&self, connected: bool, reachable: bool) {
        let next = Connectivity { connected, reachable };
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            info!(connected, reachable, "connectivity changed");
        }
    }

    pub fn set_online(&self, online: bool) {
        self.set(online, online);
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    /// Poll `url` every `every` and record whether it answered. Any HTTP
    /// status counts as reachable; only transport failures do not.
    pub fn spawn_http_probe(
        self: &Arc<Self>,
        url: String,
        every: Duration,
        timeout: Duration,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let client = match reqwest::Client::builder().timeout(timeout).build() {
                Ok(client) => client,
                Err(e) => {
                    tracing::error!(error = %e, "cannot build connectivity probe client");
                    return;
                }
            };
            let mut ticks = tokio::time::interval(every);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                match client.head(&url).send().await {
                    Ok(_) => monitor.set(true, true),
                    Err(e) => {
                        debug!(error = %e, "connectivity probe failed");
                        // Connect errors mean no route; anything else means
                        // the link is up but the service did not answer.
                        monitor.set(!e.is_connect(), false);
                    }
                }
            }
        })
    }
}
