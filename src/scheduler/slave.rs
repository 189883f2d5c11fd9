use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `POST /slave`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveRegistration {
    pub name: String,
    /// Defaults to the peer address of the request when absent.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub stats: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveInfo {
    pub id: String,
    pub name: String,
    pub address: String,
    pub stats: String,
    pub last_seen: DateTime<Utc>,
    pub job: Option<String>,
    pub job_frames: Vec<i32>,
}

/// A remote render worker as seen by the master.
#[derive(Debug, Clone)]
pub struct Slave {
    pub id: String,
    pub name: String,
    pub address: String,
    pub stats: String,
    pub last_seen: DateTime<Utc>,
    job: Option<String>,
    job_frames: Vec<i32>,
}

impl Slave {
    /// Stable id for a name/address pair, so a reconnecting slave gets its
    /// previous record back.
    pub fn derive_id(name: &str, address: &str) -> String {
        let key = format!("{}@{}", name, address);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
            .simple()
            .to_string()
    }

    pub fn new(name: String, address: String, stats: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Self::derive_id(&name, &address),
            name,
            address,
            stats,
            last_seen: now,
            job: None,
            job_frames: Vec::new(),
        }
    }

    pub fn seen(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
    }

    /// A slave silent for exactly `timeout` is still alive.
    pub fn is_alive(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let silent = (now - self.last_seen).to_std().unwrap_or_default();
        silent <= timeout
    }

    pub fn job(&self) -> Option<&str> {
        self.job.as_deref()
    }

    pub fn job_frames(&self) -> &[i32] {
        &self.job_frames
    }

    pub fn assign(&mut self, job_id: &str, frames: Vec<i32>) {
        if frames.is_empty() {
            self.job = None;
            self.job_frames.clear();
        } else {
            self.job = Some(job_id.to_string());
            self.job_frames = frames;
        }
    }

    /// Drop a reported frame from the assignment. Returns false if the frame
    /// was not assigned to this slave.
    pub fn finished_frame(&mut self, job_id: &str, number: i32) -> bool {
        if self.job.as_deref() != Some(job_id) {
            return false;
        }
        let before = self.job_frames.len();
        self.job_frames.retain(|&n| n != number);
        let removed = self.job_frames.len() != before;
        if self.job_frames.is_empty() {
            self.job = None;
        }
        removed
    }

    /// Clear and return the current assignment.
    pub fn take_assignment(&mut self) -> Option<(String, Vec<i32>)> {
        let job = self.job.take()?;
        Some((job, std::mem::take(&mut self.job_frames)))
    }

    pub fn serialize(&self) -> SlaveInfo {
        SlaveInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            address: self.address.clone(),
            stats: self.stats.clone(),
            last_seen: self.last_seen,
            job: self.job.clone(),
            job_frames: self.job_frames.clone(),
        }
    }
}
