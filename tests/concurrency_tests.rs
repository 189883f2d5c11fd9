use std::collections::HashSet;
use std::net::SocketAddr;

use chrono::Utc;
use tempfile::TempDir;

use netrender_master::config::MasterConfig;
use netrender_master::http::AppState;
use netrender_master::scheduler::slave::SlaveRegistration;
use netrender_master::scheduler::{FrameStatus, JobManifest, JobStatus, MasterState};
use netrender_master::storage::Storage;

const SLAVES: usize = 20;
const FRAMES: i32 = 40;

fn create_state(dir: &TempDir) -> AppState {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let config = MasterConfig::new(addr, dir.path().to_path_buf());
    let storage = Storage::with_pid(dir.path(), 1).unwrap();
    AppState::new(MasterState::new(&config, storage))
}

async fn setup(state: &AppState) -> Vec<String> {
    let mut master = state.master.write().await;
    let manifest = JobManifest {
        name: "crowd".to_string(),
        files: Vec::new(),
        frames: (1..=FRAMES).collect(),
        chunks: 2,
        priority: 1,
        blacklist: Vec::new(),
    };
    master.add_job(manifest, Utc::now()).unwrap();

    (0..SLAVES)
        .map(|i| {
            let registration = SlaveRegistration {
                name: format!("node{:02}", i),
                address: Some(format!("10.1.0.{}", i)),
                stats: String::new(),
            };
            master.add_slave(registration, String::new(), Utc::now())
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispatch_hands_out_disjoint_frames() {
    let dir = TempDir::new().unwrap();
    let state = create_state(&dir);
    let slaves = setup(&state).await;

    let handles: Vec<_> = slaves
        .into_iter()
        .map(|slave| {
            let state = state.clone();
            tokio::spawn(async move {
                let dispatch = state
                    .master
                    .write()
                    .await
                    .dispatch(&slave, Utc::now())
                    .unwrap();
                dispatch.map(|d| d.frames).unwrap_or_default()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        let frames = handle.await.unwrap();
        assert_eq!(frames.len(), 2);
        for frame in frames {
            assert!(seen.insert(frame), "frame {} dispatched twice", frame);
            total += 1;
        }
    }
    assert_eq!(total, FRAMES as usize);

    let master = state.master.read().await;
    let job = master.get_job_by_id("1").unwrap();
    assert_eq!(job.count_frames(FrameStatus::Dispatched), FRAMES as usize);
    assert_eq!(job.count_slaves(), SLAVES);
    for slave in master.slaves() {
        let job_frames = slave.job_frames();
        assert_eq!(job_frames.len(), 2);
        for number in job_frames {
            assert_eq!(job.frame(*number).unwrap().slave(), Some(slave.id.as_str()));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reports_finish_job_once() {
    let dir = TempDir::new().unwrap();
    let state = create_state(&dir);
    let slaves = setup(&state).await;

    let handles: Vec<_> = slaves
        .into_iter()
        .map(|slave| {
            let state = state.clone();
            tokio::spawn(async move {
                let frames = state
                    .master
                    .write()
                    .await
                    .dispatch(&slave, Utc::now())
                    .unwrap()
                    .map(|d| d.frames)
                    .unwrap_or_default();
                for frame in frames {
                    tokio::task::yield_now().await;
                    state
                        .master
                        .write()
                        .await
                        .report_render(&slave, "1", frame, FrameStatus::Done, 1.0, Utc::now())
                        .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    let master = state.master.read().await;
    let job = master.get_job_by_id("1").unwrap();
    assert_eq!(job.count_frames(FrameStatus::Done), FRAMES as usize);
    assert_eq!(job.status, JobStatus::Finished);
    assert!(master.slaves().iter().all(|s| s.job().is_none()));
}
