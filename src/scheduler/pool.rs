use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::scheduler::slave::Slave;

/// Registry of known slaves keyed by slave id.
#[derive(Debug, Default)]
pub struct SlavePool {
    slaves: HashMap<String, Slave>,
}

impl SlavePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slave, or refresh the record of a returning one.
    pub fn register(
        &mut self,
        name: String,
        address: String,
        stats: String,
        now: DateTime<Utc>,
    ) -> &Slave {
        let id = Slave::derive_id(&name, &address);
        let slave = self
            .slaves
            .entry(id)
            .and_modify(|s| {
                s.seen(now);
                tracing::info!(slave_id = %s.id, name = %s.name, "Slave reconnected");
            })
            .or_insert_with(|| {
                let slave = Slave::new(name, address, String::new(), now);
                tracing::info!(
                    slave_id = %slave.id,
                    name = %slave.name,
                    address = %slave.address,
                    "Slave registered"
                );
                slave
            });
        slave.stats = stats;
        slave
    }

    /// Heartbeat: refresh `last_seen` of a known slave.
    pub fn update_slave(&mut self, id: &str, now: DateTime<Utc>) -> Option<&mut Slave> {
        let slave = self.slaves.get_mut(id)?;
        slave.seen(now);
        Some(slave)
    }

    pub fn get(&self, id: &str) -> Option<&Slave> {
        self.slaves.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Slave> {
        self.slaves.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Slave> {
        self.slaves.remove(id)
    }

    /// Ids of slaves silent for longer than `timeout`.
    pub fn timed_out(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        self.slaves
            .values()
            .filter(|s| !s.is_alive(now, timeout))
            .map(|s| s.id.clone())
            .collect()
    }

    /// All slaves sorted by name.
    pub fn all_slaves(&self) -> Vec<&Slave> {
        let mut slaves: Vec<&Slave> = self.slaves.values().collect();
        slaves.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        slaves
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slave> {
        self.slaves.values()
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }
}
