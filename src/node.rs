use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::PortBroadcaster;
use crate::config::MasterConfig;
use crate::error::Result;
use crate::http::{run_http_server, AppState};
use crate::scheduler::MasterState;

/// The master process: HTTP front, maintenance loop and port broadcast.
pub struct MasterNode {
    pub config: MasterConfig,
    pub state: AppState,
}

impl MasterNode {
    pub fn new(config: MasterConfig) -> Result<Self> {
        let master = MasterState::open(&config)?;
        tracing::info!(
            root = %master.storage().root().display(),
            jobs = master.jobs().len(),
            "Master state ready"
        );
        Ok(Self {
            config,
            state: AppState::new(master),
        })
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// 1. Spawns the maintenance loop (slave timeouts, usage, credits)
    /// 2. Optionally spawns the UDP port broadcast
    /// 3. Serves HTTP (blocking)
    /// 4. Saves every job once the server has stopped
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP listener cannot be bound or fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let maintenance_state = self.state.clone();
        let interval = self.config.maintenance_interval;
        let maintenance_shutdown = shutdown.clone();
        let maintenance = tokio::spawn(async move {
            Self::maintenance_loop(maintenance_state, interval, maintenance_shutdown).await;
        });

        if self.config.broadcast {
            let broadcaster = PortBroadcaster::new(
                self.config.listen_addr.port(),
                self.config.broadcast_port,
                self.config.maintenance_interval,
            );
            let broadcast_shutdown = shutdown.clone();
            tokio::spawn(async move {
                broadcaster.run(broadcast_shutdown).await;
            });
        }

        let served = run_http_server(self.config.listen_addr, self.state.clone(), shutdown.clone()).await;
        shutdown.cancel();
        let _ = maintenance.await;

        self.state.master.read().await.save_all();
        tracing::info!("Master stopped");
        served.map_err(Into::into)
    }

    /// Periodic upkeep of the master state.
    pub async fn maintenance_loop(state: AppState, every: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let mut master = state.master.write().await;
                    Self::maintain(&mut master);
                }
            }
        }
    }

    /// One maintenance pass.
    pub fn maintain(master: &mut MasterState) {
        let now = Utc::now();
        let removed = master.timeout_slaves(now);
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Timed out slaves removed");
        }
        master.update_usage();
        master.update(now);
        master.save_all();
    }
}
