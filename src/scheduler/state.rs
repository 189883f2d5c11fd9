use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MasterConfig;
use crate::error::{NetrenderError, Result};
use crate::scheduler::balancer::{Balancer, FarmCounts};
use crate::scheduler::frame::FrameStatus;
use crate::scheduler::job::{Job, JobInfo, JobManifest, JobStatus};
use crate::scheduler::pool::SlavePool;
use crate::scheduler::queue::JobQueue;
use crate::scheduler::slave::{Slave, SlaveRegistration};
use crate::storage::Storage;

/// Weight of the current sample in the usage moving average.
const USAGE_BLEND: f64 = 0.5;

/// Work handed to a slave by `GET /job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispatch {
    /// The job, restricted to the dispatched frames.
    pub job: JobInfo,
    pub frames: Vec<i32>,
}

/// Body of `POST /log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogInfo {
    pub job_id: String,
    pub frames: Vec<i32>,
}

/// Everything the master knows: jobs, slaves and the dispatch policy.
///
/// Every mutating operation takes `&mut self`, so sharing the state behind
/// one lock makes frame selection and slave assignment atomic together.
#[derive(Debug)]
pub struct MasterState {
    queue: JobQueue,
    pool: SlavePool,
    balancer: Balancer,
    storage: Storage,
    slave_timeout: Duration,
    usage_primed: bool,
}

impl MasterState {
    pub fn new(config: &MasterConfig, storage: Storage) -> Self {
        Self {
            queue: JobQueue::new(),
            pool: SlavePool::new(),
            balancer: Balancer::from_config(&config.balancer),
            storage,
            slave_timeout: config.slave_timeout,
            usage_primed: false,
        }
    }

    /// Create the storage directory and, if configured, reload jobs saved by
    /// earlier runs.
    pub fn open(config: &MasterConfig) -> Result<Self> {
        let storage = Storage::new(&config.root_path)?;
        let mut state = Self::new(config, storage);
        if config.recover {
            let jobs = Storage::recover(&config.root_path, Some(state.storage.root()))?;
            for job in jobs {
                tracing::info!(job_id = %job.id, name = %job.name, status = %job.status, "Recovered job");
                state.queue.add_job(job);
            }
        }
        Ok(state)
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    pub fn balancer_mut(&mut self) -> &mut Balancer {
        &mut self.balancer
    }

    pub fn slave_timeout(&self) -> Duration {
        self.slave_timeout
    }

    // ---------------------------------------------------------------------
    // Jobs
    // ---------------------------------------------------------------------

    /// Register a submitted job. Returns its id and whether all of its files
    /// are already present.
    pub fn add_job(&mut self, manifest: JobManifest, now: DateTime<Utc>) -> Result<(String, bool)> {
        let id = self.queue.next_id();
        let save_path = self.storage.create_job_dir(&id)?;
        let mut job = Job::new(id.clone(), manifest, save_path, now);
        let started = job.test_start();
        Storage::save_job(&job)?;

        tracing::info!(
            job_id = %id,
            name = %job.name,
            frames = job.frames.len(),
            chunks = job.chunks,
            started,
            "Job added"
        );
        self.queue.add_job(job);
        Ok((id, started))
    }

    pub fn get_job_by_id(&self, id: &str) -> Option<&Job> {
        self.queue.get_job(id)
    }

    pub fn jobs(&self) -> &[Job] {
        self.queue.jobs()
    }

    fn job_mut(&mut self, id: &str) -> Result<&mut Job> {
        self.queue
            .get_job_mut(id)
            .ok_or_else(|| NetrenderError::JobNotFound(id.to_string()))
    }

    fn job(&self, id: &str) -> Result<&Job> {
        self.queue
            .get_job(id)
            .ok_or_else(|| NetrenderError::JobNotFound(id.to_string()))
    }

    pub fn remove_job(&mut self, id: &str) -> Option<Job> {
        let job = self.queue.remove_job(id)?;
        for slave_id in self.slaves_on(|job_id| job_id == id) {
            if let Some(slave) = self.pool.get_mut(&slave_id) {
                slave.take_assignment();
            }
        }
        tracing::info!(job_id = %id, "Job removed");
        Some(job)
    }

    /// Remove every job. Returns how many were removed.
    pub fn clear_jobs(&mut self) -> usize {
        let removed = self.queue.clear().len();
        for slave_id in self.slaves_on(|_| true) {
            if let Some(slave) = self.pool.get_mut(&slave_id) {
                slave.take_assignment();
            }
        }
        tracing::info!(removed, "All jobs cleared");
        removed
    }

    fn slaves_on(&self, matches: impl Fn(&str) -> bool) -> Vec<String> {
        self.pool
            .iter()
            .filter(|s| s.job().is_some_and(&matches))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Requeue one frame or the frames of a job. Without `all` only frames
    /// in ERROR are reset. Dispatched frames taken back by `all` are dropped
    /// from the assignment of the slave holding them.
    pub fn reset(&mut self, job_id: &str, frame: Option<i32>, all: bool) -> Result<usize> {
        let job = self.job_mut(job_id)?;
        if let Some(number) = frame {
            if job.frame(number).is_none() {
                return Err(NetrenderError::FrameNotFound {
                    job_id: job_id.to_string(),
                    frame: number,
                });
            }
        }
        let held: Vec<(String, i32)> = if all {
            job.frames
                .iter()
                .filter(|f| frame.map_or(true, |n| f.number == n))
                .filter(|f| f.status() == FrameStatus::Dispatched)
                .filter_map(|f| f.slave().map(|s| (s.to_string(), f.number)))
                .collect()
        } else {
            Vec::new()
        };

        let count = job.reset(frame, all);
        tracing::info!(job_id, frame = ?frame, all, count, "Frames reset");
        Self::persist(job);

        for (slave_id, number) in held {
            if let Some(slave) = self.pool.get_mut(&slave_id) {
                slave.finished_frame(job_id, number);
            }
        }
        Ok(count)
    }

    /// Assign a shared log file to a group of frames.
    pub fn add_log(&mut self, info: &LogInfo) -> Result<PathBuf> {
        let first = *info
            .frames
            .first()
            .ok_or_else(|| NetrenderError::InvalidRequest("log without frames".to_string()))?;
        let job = self.job_mut(&info.job_id)?;
        if job.frame(first).is_none() {
            return Err(NetrenderError::FrameNotFound {
                job_id: info.job_id.clone(),
                frame: first,
            });
        }
        let path = Storage::log_path(job, first);
        job.add_log(&info.frames, path.clone());
        Self::persist(job);
        Ok(path)
    }

    /// The log file of a frame, if one was assigned.
    pub fn frame_log(&self, job_id: &str, frame: i32) -> Result<Option<PathBuf>> {
        let job = self.job(job_id)?;
        let frame = job.frame(frame).ok_or_else(|| NetrenderError::FrameNotFound {
            job_id: job_id.to_string(),
            frame,
        })?;
        Ok(frame.log_path.clone())
    }

    /// Status of a frame and where its result is stored.
    pub fn frame_result(&self, job_id: &str, frame: i32) -> Result<(FrameStatus, PathBuf)> {
        let job = self.job(job_id)?;
        let status = job
            .frame(frame)
            .ok_or_else(|| NetrenderError::FrameNotFound {
                job_id: job_id.to_string(),
                frame,
            })?
            .status();
        Ok((status, Storage::result_path(job, frame)))
    }

    /// Current location of a declared input file.
    pub fn input_file(&self, job_id: &str, path: &str) -> Result<PathBuf> {
        let job = self.job(job_id)?;
        job.file(path)
            .map(|f| f.local_path.clone())
            .ok_or_else(|| NetrenderError::FileNotFound {
                job_id: job_id.to_string(),
                path: path.to_string(),
            })
    }

    /// Where an upload of a declared input file should be written.
    pub fn upload_target(&self, job_id: &str, path: &str) -> Result<PathBuf> {
        let job = self.job(job_id)?;
        Storage::input_path(job, path).ok_or_else(|| NetrenderError::FileNotFound {
            job_id: job_id.to_string(),
            path: path.to_string(),
        })
    }

    /// Record an uploaded input file and re-test whether the job can start.
    pub fn file_uploaded(&mut self, job_id: &str, path: &str, stored_at: PathBuf) -> Result<bool> {
        let job = self.job_mut(job_id)?;
        let file = job
            .file_mut(path)
            .ok_or_else(|| NetrenderError::FileNotFound {
                job_id: job_id.to_string(),
                path: path.to_string(),
            })?;
        file.local_path = stored_at;
        let started = job.test_start();
        tracing::info!(job_id, file = path, started, "Input file received");
        Self::persist(job);
        Ok(started)
    }

    // ---------------------------------------------------------------------
    // Slaves
    // ---------------------------------------------------------------------

    pub fn add_slave(&mut self, registration: SlaveRegistration, peer: String, now: DateTime<Utc>) -> String {
        let address = registration.address.unwrap_or(peer);
        self.pool
            .register(registration.name, address, registration.stats, now)
            .id
            .clone()
    }

    pub fn get_slave(&self, id: &str) -> Option<&Slave> {
        self.pool.get(id)
    }

    pub fn slaves(&self) -> Vec<&Slave> {
        self.pool.all_slaves()
    }

    /// Heartbeat contract of every request carrying a slave id.
    pub fn update_slave(&mut self, id: &str, now: DateTime<Utc>) -> Option<&Slave> {
        self.pool.update_slave(id, now).map(|s| &*s)
    }

    /// Remove a slave. Frames it still held go to ERROR.
    pub fn remove_slave(&mut self, id: &str) -> Option<Slave> {
        self.release_slave(id);
        self.pool.remove(id)
    }

    /// Mark the frames still dispatched to a slave as ERROR and clear its
    /// assignment. No blacklisting: the slave may simply be unreachable.
    fn release_slave(&mut self, id: &str) {
        let Some((job_id, frames)) = self.pool.get_mut(id).and_then(Slave::take_assignment) else {
            return;
        };
        if let Some(job) = self.queue.get_job_mut(&job_id) {
            for number in &frames {
                if let Some(frame) = job.frame_mut(*number) {
                    if frame.slave() == Some(id) {
                        frame.abandon();
                    }
                }
            }
            job.test_finished();
            tracing::warn!(slave_id = id, job_id = %job_id, frames = ?frames, "Frames abandoned");
            Self::persist(job);
        }
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    pub fn farm_counts(&self) -> FarmCounts {
        FarmCounts::new(self.queue.jobs(), self.pool.len())
    }

    /// Pick work for a slave: the first job in insertion order that no
    /// exclusion rule filters, that has not blacklisted the slave and that
    /// has queued frames. Credits are charged for the selected frames but
    /// they are not marked dispatched.
    pub fn get_new_job(&mut self, slave_id: &str, now: DateTime<Utc>) -> Option<(String, Vec<i32>)> {
        if self.queue.is_empty() {
            return None;
        }
        let farm = self.farm_counts();
        for job in self.queue.jobs_mut() {
            if self.balancer.apply_exceptions(job, &farm) || job.is_blacklisted(slave_id) {
                continue;
            }
            let frames = job.get_frames(now);
            if !frames.is_empty() {
                return Some((job.id.clone(), frames));
            }
        }
        None
    }

    /// Handle a work request from a slave: heartbeat, selection and
    /// assignment in one step.
    ///
    /// Frames the slave still held from an earlier request are treated as
    /// abandoned and go to ERROR, rather than being silently overwritten by
    /// the new assignment.
    pub fn dispatch(&mut self, slave_id: &str, now: DateTime<Utc>) -> Result<Option<Dispatch>> {
        if self.pool.update_slave(slave_id, now).is_none() {
            return Err(NetrenderError::SlaveNotFound(slave_id.to_string()));
        }
        self.release_slave(slave_id);

        let Some((job_id, frames)) = self.get_new_job(slave_id, now) else {
            return Ok(None);
        };

        let job = self.job_mut(&job_id)?;
        for number in &frames {
            if let Some(frame) = job.frame_mut(*number) {
                frame.dispatch(slave_id);
            }
        }
        let info = job.serialize(Some(&frames));
        if let Some(slave) = self.pool.get_mut(slave_id) {
            slave.assign(&job_id, frames.clone());
        }

        tracing::info!(job_id = %job_id, slave_id, frames = ?frames, "Frames dispatched");
        Ok(Some(Dispatch { job: info, frames }))
    }

    /// Whether `slave_id` currently holds `frame` of `job_id`.
    pub fn holds_frame(&self, slave_id: &str, job_id: &str, frame: i32) -> Result<bool> {
        if self.pool.get(slave_id).is_none() {
            return Err(NetrenderError::SlaveNotFound(slave_id.to_string()));
        }
        let job = self.job(job_id)?;
        let frame = job.frame(frame).ok_or_else(|| NetrenderError::FrameNotFound {
            job_id: job_id.to_string(),
            frame,
        })?;
        Ok(frame.status() == FrameStatus::Dispatched && frame.slave() == Some(slave_id))
    }

    /// Where a result upload from `slave_id` is staged before the report is
    /// applied. `None` if the slave does not hold the frame.
    pub fn result_staging(&self, slave_id: &str, job_id: &str, frame: i32) -> Result<Option<PathBuf>> {
        if !self.holds_frame(slave_id, job_id, frame)? {
            return Ok(None);
        }
        let job = self.job(job_id)?;
        Ok(Some(Storage::staging_path(job, frame, slave_id)))
    }

    /// Apply a render report from a slave. An ERROR report blacklists the
    /// slave for this job. Reports for frames the slave no longer holds are
    /// ignored. Returns the resulting frame status.
    pub fn report_render(
        &mut self,
        slave_id: &str,
        job_id: &str,
        frame: i32,
        result: FrameStatus,
        time: f64,
        now: DateTime<Utc>,
    ) -> Result<FrameStatus> {
        if !matches!(result, FrameStatus::Done | FrameStatus::Error) {
            return Err(NetrenderError::InvalidHeader {
                name: "job-result",
                value: result.to_string(),
            });
        }
        if self.pool.update_slave(slave_id, now).is_none() {
            return Err(NetrenderError::SlaveNotFound(slave_id.to_string()));
        }
        let job = self.job_mut(job_id)?;
        let target = job.frame_mut(frame).ok_or_else(|| NetrenderError::FrameNotFound {
            job_id: job_id.to_string(),
            frame,
        })?;

        if target.status() != FrameStatus::Dispatched || target.slave() != Some(slave_id) {
            tracing::warn!(job_id, slave_id, frame, status = %target.status(), "Ignoring stale render report");
            return Ok(target.status());
        }
        target.complete(result, time);

        if result == FrameStatus::Error {
            job.blacklist.insert(slave_id.to_string());
            tracing::warn!(job_id, slave_id, frame, "Render error, slave blacklisted for job");
        } else {
            tracing::info!(job_id, slave_id, frame, time, "Frame done");
        }
        job.test_finished();
        Self::persist(job);

        if let Some(slave) = self.pool.get_mut(slave_id) {
            slave.finished_frame(job_id, frame);
        }
        Ok(result)
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    /// Drop slaves silent for longer than the slave timeout. Their frames
    /// go to ERROR. Returns the removed ids.
    pub fn timeout_slaves(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired = self.pool.timed_out(now, self.slave_timeout);
        for id in &expired {
            tracing::warn!(slave_id = %id, "Slave timed out");
            self.remove_slave(id);
        }
        expired
    }

    /// Decaying average of the share of slaves working on each job.
    pub fn update_usage(&mut self) {
        let blend = if self.usage_primed {
            for job in self.queue.jobs_mut() {
                job.usage *= 1.0 - USAGE_BLEND;
            }
            USAGE_BLEND
        } else {
            self.usage_primed = true;
            1.0
        };

        if self.pool.is_empty() {
            return;
        }
        let share = blend / self.pool.len() as f64;
        let busy: Vec<String> = self
            .pool
            .iter()
            .filter_map(|s| s.job().map(str::to_string))
            .collect();
        for job_id in busy {
            if let Some(job) = self.queue.get_job_mut(&job_id) {
                job.usage += share;
            }
        }
    }

    /// Per tick: accrue credits then re-rate every job.
    pub fn update(&mut self, now: DateTime<Utc>) {
        for job in self.queue.jobs_mut() {
            job.update(now);
        }
        self.balancer.balance(self.queue.jobs_mut());
    }

    /// Rewrite `job.txt` of every job.
    pub fn save_all(&self) {
        for job in self.queue.jobs() {
            Self::persist(job);
        }
    }

    fn persist(job: &Job) {
        if let Err(e) = Storage::save_job(job) {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to save job");
        }
    }

    // ---------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------

    /// All jobs ranked for display.
    pub fn ranked_jobs(&self, now: DateTime<Utc>) -> Vec<JobInfo> {
        let farm = self.farm_counts();
        self.balancer
            .ranked(self.queue.jobs(), &farm, now)
            .into_iter()
            .map(|job| job.serialize(None))
            .collect()
    }

    pub fn count_jobs(&self, status: JobStatus) -> usize {
        self.queue.jobs().iter().filter(|j| j.status == status).count()
    }
}
