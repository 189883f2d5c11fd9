//! On-disk layout of the master.
//!
//! ```text
//! <root>/master_<pid>/job_<id>/job.txt                  JSON snapshot of the job
//! <root>/master_<pid>/job_<id>/000001.exr               result of frame 1
//! <root>/master_<pid>/job_<id>/000001.<slave>.part      result upload in flight
//! <root>/master_<pid>/job_<id>/000001.log               log of the chunk starting at frame 1
//! <root>/master_<pid>/job_<id>/input_0_scene.blend      uploaded input file 0
//! ```
//!
//! Writes are synchronous and small except for result and input blobs,
//! which the HTTP layer writes with `tokio::fs`. Results are staged outside
//! the state lock and renamed into place once the report is accepted.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::scheduler::frame::FrameStatus;
use crate::scheduler::job::{Job, JobInfo};

const JOB_FILE: &str = "job.txt";

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create `<root_path>/master_<pid>`.
    pub fn new(root_path: &Path) -> Result<Self> {
        Self::with_pid(root_path, std::process::id())
    }

    pub fn with_pid(root_path: &Path, pid: u32) -> Result<Self> {
        let root = root_path.join(format!("master_{}", pid));
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn create_job_dir(&self, job_id: &str) -> Result<PathBuf> {
        let dir = self.root.join(format!("job_{}", job_id));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Rewrite the job's `job.txt`.
    pub fn save_job(job: &Job) -> Result<()> {
        let info = job.serialize(None);
        let data = serde_json::to_vec_pretty(&info)?;
        let path = job.save_path.join(JOB_FILE);
        let tmp = path.with_extension("txt.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load_job(dir: &Path) -> Result<Job> {
        let data = fs::read(dir.join(JOB_FILE))?;
        let info: JobInfo = serde_json::from_slice(&data)?;
        Ok(Job::materialize(info, dir.to_path_buf()))
    }

    /// Load every job persisted under `root_path` by earlier masters.
    ///
    /// Dispatched frames go back to QUEUED since slave assignments are not
    /// persisted. When several runs saved the same job id, the most recently
    /// created job wins.
    pub fn recover(root_path: &Path, skip: Option<&Path>) -> Result<Vec<Job>> {
        let mut recovered: HashMap<String, Job> = HashMap::new();

        for master in fs::read_dir(root_path)? {
            let master = master?.path();
            let is_master = master
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("master_"));
            if !is_master || !master.is_dir() || Some(master.as_path()) == skip {
                continue;
            }

            for entry in fs::read_dir(&master)? {
                let dir = entry?.path();
                if !dir.join(JOB_FILE).is_file() {
                    continue;
                }
                let mut job = match Self::load_job(&dir) {
                    Ok(job) => job,
                    Err(e) => {
                        tracing::warn!(path = %dir.display(), error = %e, "Skipping unreadable job");
                        continue;
                    }
                };
                for frame in job.frames.iter_mut() {
                    if frame.status() == FrameStatus::Dispatched {
                        frame.reset(true);
                    }
                }

                match recovered.get(&job.id) {
                    Some(existing) if existing.created_at >= job.created_at => {
                        tracing::warn!(job_id = %job.id, path = %dir.display(), "Skipping older duplicate job");
                    }
                    _ => {
                        recovered.insert(job.id.clone(), job);
                    }
                }
            }
        }

        let mut jobs: Vec<Job> = recovered.into_values().collect();
        jobs.sort_by_key(|j| (j.id.parse::<u64>().unwrap_or(u64::MAX), j.created_at));
        Ok(jobs)
    }

    pub fn result_path(job: &Job, frame: i32) -> PathBuf {
        job.save_path.join(format!("{:06}.exr", frame))
    }

    pub fn log_path(job: &Job, frame: i32) -> PathBuf {
        job.save_path.join(format!("{:06}.log", frame))
    }

    /// A result upload in flight, private to the uploading slave.
    pub fn staging_path(job: &Job, frame: i32, slave_id: &str) -> PathBuf {
        job.save_path.join(format!("{:06}.{}.part", frame, slave_id))
    }

    /// Where an uploaded input file is stored inside the job directory.
    ///
    /// The name carries the file's position in the manifest, so declared
    /// files sharing a base name never collide with each other or with the
    /// master's own files. `None` if the job does not declare `declared`.
    pub fn input_path(job: &Job, declared: &str) -> Option<PathBuf> {
        let index = job.files.iter().position(|f| f.path == declared)?;
        let base = Path::new(declared)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("input");
        Some(job.save_path.join(format!("input_{}_{}", index, base)))
    }
}
