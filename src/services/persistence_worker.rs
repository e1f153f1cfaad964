//! Persistence consumer
//!
//! Standing bus subscriber that mirrors every status change into the
//! snapshot file and appends plate reads to the parking log. If the bus ever
//! drops this subscriber for falling behind, it resubscribes and then
//! reapplies the full store snapshot, so missed events are recovered and the
//! idempotent apply absorbs anything seen twice.

use crate::domain::types::{SpotStatus, StatusChangeEvent};
use crate::io::persistence::{ParkingLog, ParkingLogEntry, SnapshotFile};
use crate::services::event_bus::{EventBus, Subscription};
use crate::services::status_store::StatusStore;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SUBSCRIBER_NAME: &str = "persistence";

pub struct PersistenceWorker {
    snapshot: SnapshotFile,
    log: ParkingLog,
    bus: EventBus,
    store: Arc<StatusStore>,
    sub: Subscription,
}

impl PersistenceWorker {
    /// Subscribes immediately so no change published after this call is missed
    pub fn new(
        snapshot: SnapshotFile,
        log: ParkingLog,
        bus: EventBus,
        store: Arc<StatusStore>,
    ) -> Self {
        let sub = bus.subscribe(SUBSCRIBER_NAME);
        Self { snapshot, log, bus, store, sub }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("persistence_worker_started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        while let Some(event) = self.sub.try_recv() {
                            self.handle(&event);
                        }
                        info!("persistence_worker_shutdown");
                        return;
                    }
                }
                event = self.sub.recv() => match event {
                    Some(event) => self.handle(&event),
                    None => self.resubscribe(),
                },
            }
        }
    }

    /// Apply one event to disk
    pub fn handle(&mut self, event: &StatusChangeEvent) {
        if let Err(e) = self.snapshot.apply(event.spot_id, event.status) {
            error!(spot_id = %event.spot_id, error = %e, "snapshot_write_failed");
        }

        let Some(plate) = event.plate.as_ref() else {
            return;
        };
        if event.status != SpotStatus::Occupied {
            return;
        }
        let entry_time = Utc.timestamp_millis_opt(event.ts as i64).single().unwrap_or_else(Utc::now);
        let entry =
            ParkingLogEntry { spot_id: event.spot_id, license_plate: plate.clone(), entry_time };
        if let Err(e) = self.log.append(&entry) {
            error!(spot_id = %event.spot_id, error = %e, "parking_log_write_failed");
        }
    }

    fn resubscribe(&mut self) {
        warn!("persistence_subscriber_dropped_resyncing");
        self.sub = self.bus.subscribe(SUBSCRIBER_NAME);
        match self.snapshot.apply_all(self.store.snapshot()) {
            Ok(changed) => info!(changed = changed, "persistence_resynced"),
            Err(e) => error!(error = %e, "persistence_resync_failed"),
        }
    }
}
