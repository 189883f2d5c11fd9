use std::net::SocketAddr;
use std::path::Path;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use netrender_master::config::MasterConfig;
use netrender_master::scheduler::job::FileEntry;
use netrender_master::scheduler::slave::SlaveRegistration;
use netrender_master::scheduler::{FrameStatus, JobManifest, JobStatus, MasterState};
use netrender_master::storage::Storage;

fn config(root: &Path) -> MasterConfig {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    MasterConfig::new(addr, root.to_path_buf())
}

fn manifest(name: &str, frames: Vec<i32>, chunks: usize) -> JobManifest {
    JobManifest {
        name: name.to_string(),
        files: Vec::new(),
        frames,
        chunks,
        priority: 1,
        blacklist: Vec::new(),
    }
}

fn registration(name: &str) -> SlaveRegistration {
    SlaveRegistration {
        name: name.to_string(),
        address: Some(format!("{}.farm", name)),
        stats: String::new(),
    }
}

#[test]
fn test_job_round_trip() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::with_pid(dir.path(), 1).unwrap();
    let mut master = MasterState::new(&config(dir.path()), storage);
    let now = Utc::now();

    let mut shot = manifest("shot 010", vec![1, 2, 3], 2);
    shot.priority = 3;
    shot.blacklist = vec!["old-slave".to_string()];
    shot.files = vec![FileEntry {
        path: "/projects/shot010.blend".to_string(),
        start: 1,
        end: 3,
    }];
    let (id, started) = master.add_job(shot, now).unwrap();
    assert!(!started);

    let saved = master.get_job_by_id(&id).unwrap();
    let loaded = Storage::load_job(&saved.save_path).unwrap();

    assert_eq!(loaded.id, id);
    assert_eq!(loaded.name, "shot 010");
    assert_eq!(loaded.chunks, 2);
    assert_eq!(loaded.priority, 3);
    assert_eq!(loaded.status, JobStatus::Waiting);
    assert!(loaded.is_blacklisted("old-slave"));
    assert_eq!(loaded.frames.len(), 3);
    let file = loaded.file("/projects/shot010.blend").unwrap();
    assert_eq!((file.start, file.end), (1, 3));
    assert!(!file.found);
    assert_eq!(loaded.created_at, saved.created_at);
}

#[test]
fn test_reports_are_persisted() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::with_pid(dir.path(), 1).unwrap();
    let mut master = MasterState::new(&config(dir.path()), storage);
    let now = Utc::now();

    let (id, _) = master.add_job(manifest("a", vec![1, 2], 1), now).unwrap();
    let slave = master.add_slave(registration("a"), "10.0.0.1".to_string(), now);
    master.dispatch(&slave, now).unwrap();
    master
        .report_render(&slave, &id, 1, FrameStatus::Done, 4.0, now)
        .unwrap();

    let loaded = Storage::load_job(&master.get_job_by_id(&id).unwrap().save_path).unwrap();
    let frame = loaded.frame(1).unwrap();
    assert_eq!(frame.status(), FrameStatus::Done);
    assert_eq!(frame.time(), 4.0);
    assert_eq!(loaded.frame(2).unwrap().status(), FrameStatus::Queued);
}

#[test]
fn test_recover_requeues_dispatched_frames() {
    let dir = TempDir::new().unwrap();
    let now = Utc::now();
    {
        let storage = Storage::with_pid(dir.path(), 1).unwrap();
        let mut master = MasterState::new(&config(dir.path()), storage);
        master.add_job(manifest("a", vec![1, 2, 3], 2), now).unwrap();
        let slave = master.add_slave(registration("a"), "10.0.0.1".to_string(), now);
        master.dispatch(&slave, now).unwrap();
        master
            .report_render(&slave, "1", 1, FrameStatus::Done, 1.0, now)
            .unwrap();
    }

    let jobs = Storage::recover(dir.path(), None).unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.frame(1).unwrap().status(), FrameStatus::Done);
    let frame = job.frame(2).unwrap();
    assert_eq!(frame.status(), FrameStatus::Queued);
    assert_eq!(frame.slave(), None);
    assert_eq!(job.frame(3).unwrap().status(), FrameStatus::Queued);
}

#[test]
fn test_recover_skips_current_master() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::with_pid(dir.path(), 1).unwrap();
    let mut master = MasterState::new(&config(dir.path()), storage);
    master.add_job(manifest("a", vec![1], 1), Utc::now()).unwrap();

    let jobs = Storage::recover(dir.path(), Some(master.storage().root())).unwrap();
    assert!(jobs.is_empty());
}

#[test]
fn test_recover_prefers_newest_duplicate() {
    let dir = TempDir::new().unwrap();
    let now = Utc::now();

    let older = Storage::with_pid(dir.path(), 1).unwrap();
    MasterState::new(&config(dir.path()), older)
        .add_job(manifest("old", vec![1], 1), now - Duration::hours(1))
        .unwrap();
    let newer = Storage::with_pid(dir.path(), 2).unwrap();
    MasterState::new(&config(dir.path()), newer)
        .add_job(manifest("new", vec![1], 1), now)
        .unwrap();

    let jobs = Storage::recover(dir.path(), None).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].name, "new");
}

#[test]
fn test_recover_ignores_unrelated_entries() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("scratch/job_1")).unwrap();
    std::fs::write(dir.path().join("master_9"), b"not a directory").unwrap();
    let broken = dir.path().join("master_3/job_4");
    std::fs::create_dir_all(&broken).unwrap();
    std::fs::write(broken.join("job.txt"), b"{ truncated").unwrap();

    let jobs = Storage::recover(dir.path(), None).unwrap();
    assert!(jobs.is_empty());
}

#[test]
fn test_open_with_recovery_continues_ids() {
    let dir = TempDir::new().unwrap();
    let now = Utc::now();
    {
        let storage = Storage::with_pid(dir.path(), 1).unwrap();
        let mut master = MasterState::new(&config(dir.path()), storage);
        master.add_job(manifest("a", vec![1], 1), now).unwrap();
        master.add_job(manifest("b", vec![1], 1), now).unwrap();
    }

    let recovering = config(dir.path()).with_recovery();
    let mut master = MasterState::open(&recovering).unwrap();
    assert_eq!(master.jobs().len(), 2);
    assert_eq!(master.jobs()[0].name, "a");

    let (id, _) = master.add_job(manifest("c", vec![1], 1), now).unwrap();
    assert_eq!(id, "3");
}

#[test]
fn test_open_without_recovery_starts_empty() {
    let dir = TempDir::new().unwrap();
    {
        let storage = Storage::with_pid(dir.path(), 1).unwrap();
        let mut master = MasterState::new(&config(dir.path()), storage);
        master.add_job(manifest("a", vec![1], 1), Utc::now()).unwrap();
    }

    let master = MasterState::open(&config(dir.path())).unwrap();
    assert!(master.jobs().is_empty());
}
