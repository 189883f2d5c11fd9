use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::frame::{Frame, FrameInfo, FrameStatus};

/// Version of the [`JobInfo`] schema written to the wire and to `job.txt`.
pub const JOB_INFO_VERSION: u32 = 1;

/// Credits spent for every frame handed out.
const FRAME_COST: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Waiting,
    Queued,
    Finished,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "WAITING"),
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::Finished => write!(f, "FINISHED"),
        }
    }
}

/// A file entry of a job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    #[serde(default)]
    pub start: i32,
    #[serde(default)]
    pub end: i32,
}

/// Body of `POST /job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManifest {
    pub name: String,
    pub files: Vec<FileEntry>,
    pub frames: Vec<i32>,
    #[serde(default = "default_one")]
    pub chunks: usize,
    #[serde(default = "default_one_u32")]
    pub priority: u32,
    #[serde(default)]
    pub blacklist: Vec<String>,
}

fn default_one() -> usize {
    1
}

fn default_one_u32() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub start: i32,
    pub end: i32,
    pub local_path: PathBuf,
    pub found: bool,
}

/// Wire and snapshot form of a [`Job`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub version: u32,
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub files: Vec<FileInfo>,
    pub frames: Vec<FrameInfo>,
    pub chunks: usize,
    pub priority: u32,
    pub credits: f64,
    pub usage: f64,
    pub rating: f64,
    pub blacklist: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_dispatched: Option<DateTime<Utc>>,
}

/// Input file of a job and where the master expects to find it.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderFile {
    pub path: String,
    pub start: i32,
    pub end: i32,
    pub local_path: PathBuf,
    pub found: bool,
}

impl RenderFile {
    fn new(entry: FileEntry) -> Self {
        Self {
            local_path: PathBuf::from(&entry.path),
            path: entry.path,
            start: entry.start,
            end: entry.end,
            found: false,
        }
    }

    pub fn test(&mut self) -> bool {
        self.found = self.local_path.exists();
        self.found
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub name: String,
    /// `files[0]` is the main file.
    pub files: Vec<RenderFile>,
    files_map: HashMap<String, usize>,
    pub frames: Vec<Frame>,
    pub chunks: usize,
    pub priority: u32,
    pub credits: f64,
    /// Smoothed share of the farm working on this job.
    pub usage: f64,
    /// Last score computed by the balancer.
    pub rating: f64,
    pub blacklist: BTreeSet<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub last_dispatched: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub save_path: PathBuf,
}

impl Job {
    pub fn new(id: String, manifest: JobManifest, save_path: PathBuf, now: DateTime<Utc>) -> Self {
        let mut job = Self {
            id,
            name: manifest.name,
            files: Vec::new(),
            files_map: HashMap::new(),
            frames: Vec::new(),
            chunks: manifest.chunks.max(1),
            priority: manifest.priority.max(1),
            credits: 0.0,
            usage: 0.0,
            rating: 0.0,
            blacklist: manifest.blacklist.into_iter().collect(),
            status: JobStatus::Waiting,
            created_at: now,
            last_dispatched: None,
            last_update: None,
            save_path,
        };
        for entry in manifest.files {
            job.add_file(RenderFile::new(entry));
        }
        for number in manifest.frames {
            job.add_frame(number);
        }
        job
    }

    fn add_file(&mut self, file: RenderFile) {
        self.files_map.insert(file.path.clone(), self.files.len());
        self.files.push(file);
    }

    pub fn file(&self, path: &str) -> Option<&RenderFile> {
        self.files_map.get(path).map(|&i| &self.files[i])
    }

    pub fn file_mut(&mut self, path: &str) -> Option<&mut RenderFile> {
        self.files_map.get(path).map(|&i| &mut self.files[i])
    }

    /// Adds a frame unless one with the same number already exists.
    pub fn add_frame(&mut self, number: i32) -> bool {
        if self.frame(number).is_some() {
            return false;
        }
        self.frames.push(Frame::new(number));
        true
    }

    pub fn frame(&self, number: i32) -> Option<&Frame> {
        self.frames.iter().find(|f| f.number == number)
    }

    pub fn frame_mut(&mut self, number: i32) -> Option<&mut Frame> {
        self.frames.iter_mut().find(|f| f.number == number)
    }

    /// Points every listed frame at a shared log file.
    pub fn add_log(&mut self, frames: &[i32], log_path: PathBuf) {
        for &number in frames {
            if let Some(frame) = self.frame_mut(number) {
                frame.log_path = Some(log_path.clone());
            }
        }
    }

    pub fn count_frames(&self, status: FrameStatus) -> usize {
        self.frames.iter().filter(|f| f.status() == status).count()
    }

    /// Number of distinct slaves currently holding dispatched frames.
    pub fn count_slaves(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| f.status() == FrameStatus::Dispatched)
            .filter_map(|f| f.slave())
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn is_blacklisted(&self, slave_id: &str) -> bool {
        self.blacklist.contains(slave_id)
    }

    /// Re-check declared files and leave WAITING once all of them exist.
    /// Returns whether the job is startable.
    pub fn test_start(&mut self) -> bool {
        let mut all_found = true;
        for file in &mut self.files {
            all_found &= file.test();
        }
        if !all_found {
            return false;
        }
        if self.status == JobStatus::Waiting {
            self.status = JobStatus::Queued;
            tracing::info!(job_id = %self.id, name = %self.name, "Job started");
        }
        true
    }

    /// Select up to `chunks` queued frames in stored order, charging credits
    /// for each. The frames are not marked dispatched here.
    pub fn get_frames(&mut self, now: DateTime<Utc>) -> Vec<i32> {
        let selected: Vec<i32> = self
            .frames
            .iter()
            .filter(|f| f.status() == FrameStatus::Queued)
            .take(self.chunks)
            .map(|f| f.number)
            .collect();

        if !selected.is_empty() {
            self.credits -= FRAME_COST * selected.len() as f64;
            self.last_dispatched = Some(now);
        }
        selected
    }

    /// Mark the job finished once no frame is queued or dispatched.
    pub fn test_finished(&mut self) -> bool {
        let pending = self
            .frames
            .iter()
            .any(|f| matches!(f.status(), FrameStatus::Queued | FrameStatus::Dispatched));
        if !pending && self.status != JobStatus::Finished {
            self.status = JobStatus::Finished;
            tracing::info!(job_id = %self.id, "Job finished");
        }
        !pending
    }

    /// Reset one frame or all frames. Returns the number of frames requeued.
    pub fn reset(&mut self, frame: Option<i32>, all: bool) -> usize {
        let count = match frame {
            Some(number) => self
                .frame_mut(number)
                .map(|f| usize::from(f.reset(all)))
                .unwrap_or(0),
            None => self
                .frames
                .iter_mut()
                .map(|f| f.reset(all))
                .filter(|&reset| reset)
                .count(),
        };
        if count > 0 && self.status == JobStatus::Finished {
            self.status = JobStatus::Queued;
        }
        count
    }

    /// Accrue credits for the time elapsed since the previous update, in
    /// minutes.
    pub fn update(&mut self, now: DateTime<Utc>) {
        let since = self
            .last_update
            .or(self.last_dispatched)
            .unwrap_or(self.created_at);
        let elapsed = (now - since).num_milliseconds().max(0) as f64 / 60_000.0;
        self.credits += elapsed;
        self.last_update = Some(now);
    }

    /// Snapshot of the job. With `frames` only the listed frames are
    /// included.
    pub fn serialize(&self, frames: Option<&[i32]>) -> JobInfo {
        let frames = match frames {
            Some(numbers) => self
                .frames
                .iter()
                .filter(|f| numbers.contains(&f.number))
                .map(Frame::serialize)
                .collect(),
            None => self.frames.iter().map(Frame::serialize).collect(),
        };

        JobInfo {
            version: JOB_INFO_VERSION,
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            files: self
                .files
                .iter()
                .map(|f| FileInfo {
                    path: f.path.clone(),
                    start: f.start,
                    end: f.end,
                    local_path: f.local_path.clone(),
                    found: f.found,
                })
                .collect(),
            frames,
            chunks: self.chunks,
            priority: self.priority,
            credits: self.credits,
            usage: self.usage,
            rating: self.rating,
            blacklist: self.blacklist.iter().cloned().collect(),
            created_at: self.created_at,
            last_dispatched: self.last_dispatched,
        }
    }

    pub fn materialize(info: JobInfo, save_path: PathBuf) -> Self {
        let mut job = Self {
            id: info.id,
            name: info.name,
            files: Vec::new(),
            files_map: HashMap::new(),
            frames: info.frames.into_iter().map(Frame::materialize).collect(),
            chunks: info.chunks.max(1),
            priority: info.priority.max(1),
            credits: info.credits,
            usage: info.usage,
            rating: info.rating,
            blacklist: info.blacklist.into_iter().collect(),
            status: info.status,
            created_at: info.created_at,
            last_dispatched: info.last_dispatched,
            last_update: None,
            save_path,
        };
        for file in info.files {
            job.add_file(RenderFile {
                path: file.path,
                start: file.start,
                end: file.end,
                local_path: file.local_path,
                found: file.found,
            });
        }
        job
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(frames: Vec<i32>, chunks: usize) -> JobManifest {
        JobManifest {
            name: "shot_010".to_string(),
            files: Vec::new(),
            frames,
            chunks,
            priority: 1,
            blacklist: Vec::new(),
        }
    }

    #[test]
    fn chunks_and_priority_are_at_least_one() {
        let mut m = manifest(vec![1], 0);
        m.priority = 0;
        let job = Job::new("1".to_string(), m, PathBuf::new(), Utc::now());
        assert_eq!(job.chunks, 1);
        assert_eq!(job.priority, 1);
    }

    #[test]
    fn duplicate_frames_are_ignored() {
        let job = Job::new(
            "1".to_string(),
            manifest(vec![1, 2, 2, 3], 1),
            PathBuf::new(),
            Utc::now(),
        );
        assert_eq!(job.frames.len(), 3);
    }

    #[test]
    fn get_frames_charges_credits_per_frame() {
        let now = Utc::now();
        let mut job = Job::new("1".to_string(), manifest(vec![1, 2, 3], 2), PathBuf::new(), now);
        assert_eq!(job.get_frames(now), vec![1, 2]);
        assert_eq!(job.credits, -2.0);
        assert_eq!(job.last_dispatched, Some(now));
    }

    #[test]
    fn get_frames_on_empty_job_is_empty() {
        let now = Utc::now();
        let mut job = Job::new("1".to_string(), manifest(vec![], 4), PathBuf::new(), now);
        assert!(job.get_frames(now).is_empty());
        assert_eq!(job.credits, 0.0);
        assert!(job.last_dispatched.is_none());
        assert!(job.test_finished());
        assert_eq!(job.status, JobStatus::Finished);
    }

    #[test]
    fn update_accrues_credits_in_minutes() {
        let start = Utc::now();
        let mut job = Job::new("1".to_string(), manifest(vec![1], 1), PathBuf::new(), start);
        job.update(start + chrono::Duration::minutes(3));
        assert!((job.credits - 3.0).abs() < 1e-9);
        job.update(start + chrono::Duration::minutes(4));
        assert!((job.credits - 4.0).abs() < 1e-9);
    }

    #[test]
    fn reset_reopens_finished_job() {
        let now = Utc::now();
        let mut job = Job::new("1".to_string(), manifest(vec![1], 1), PathBuf::new(), now);
        job.frame_mut(1).unwrap().dispatch("a");
        job.frame_mut(1).unwrap().complete(FrameStatus::Error, 0.5);
        assert!(job.test_finished());

        assert_eq!(job.reset(Some(1), false), 1);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.frame(1).unwrap().status(), FrameStatus::Queued);
    }

    #[test]
    fn count_slaves_counts_distinct_holders() {
        let now = Utc::now();
        let mut job = Job::new("1".to_string(), manifest(vec![1, 2, 3], 1), PathBuf::new(), now);
        job.frame_mut(1).unwrap().dispatch("a");
        job.frame_mut(2).unwrap().dispatch("a");
        job.frame_mut(3).unwrap().dispatch("b");
        assert_eq!(job.count_slaves(), 2);
    }
}
