use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use tokio::io::AsyncWriteExt;

use crate::error::{NetrenderError, Result};
use crate::http::headers::{self as hdr, JOB_FILE, JOB_FRAME, JOB_ID, JOB_RESULT, JOB_TIME};
use crate::http::headers::{RESET_ALL, RULE_ENABLE, RULE_ID, RULE_LIMIT, SLAVE_ID};
use crate::http::AppState;
use crate::scheduler::frame::FrameStatus;
use crate::scheduler::job::JobManifest;
use crate::scheduler::slave::{SlaveInfo, SlaveRegistration};
use crate::scheduler::state::LogInfo;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Read a stored blob. A file that is not there yet maps to `None`.
async fn read_blob(path: &std::path::Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn version() -> &'static str {
    VERSION
}

/// `GET /job`: heartbeat plus work request of a slave.
pub async fn get_job(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let slave_id = hdr::required(&headers, SLAVE_ID)?;
    let dispatch = state.master.write().await.dispatch(slave_id, Utc::now())?;

    Ok(match dispatch {
        Some(dispatch) => {
            let job_id = dispatch.job.id.clone();
            (StatusCode::OK, [(JOB_ID, job_id)], Json(dispatch)).into_response()
        }
        None => StatusCode::ACCEPTED.into_response(),
    })
}

/// `POST /job`: 200 if every input file is already present, 202 otherwise.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(manifest): Json<JobManifest>,
) -> Result<Response> {
    let (job_id, started) = state.master.write().await.add_job(manifest, Utc::now())?;
    let status = if started {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, [(JOB_ID, job_id)]).into_response())
}

/// `GET /render`: the result of a frame.
pub async fn get_render(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let job_id = hdr::required(&headers, JOB_ID)?;
    let frame: i32 = hdr::parse(&headers, JOB_FRAME)?;
    let (status, path) = state.master.read().await.frame_result(job_id, frame)?;

    Ok(match status {
        FrameStatus::Done => match read_blob(&path).await? {
            Some(data) => (StatusCode::OK, data).into_response(),
            None => {
                tracing::warn!(job_id, frame, "Frame done but no result stored");
                StatusCode::NO_CONTENT.into_response()
            }
        },
        FrameStatus::Error => StatusCode::PARTIAL_CONTENT.into_response(),
        FrameStatus::Queued | FrameStatus::Dispatched => StatusCode::ACCEPTED.into_response(),
    })
}

/// `PUT /render`: a slave reports a frame. The body of a DONE report is the
/// rendered image.
///
/// The image is staged outside the lock and only moved to the frame's result
/// path if the slave still holds the frame once the write lock is taken.
pub async fn put_render(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let slave_id = hdr::required(&headers, SLAVE_ID)?;
    let job_id = hdr::required(&headers, JOB_ID)?;
    let frame: i32 = hdr::parse(&headers, JOB_FRAME)?;
    let result: FrameStatus = hdr::parse(&headers, JOB_RESULT)?;
    let time: f64 = hdr::parse_optional(&headers, JOB_TIME)?.unwrap_or(0.0);

    let staged = if result == FrameStatus::Done && !body.is_empty() {
        let staging = state
            .master
            .read()
            .await
            .result_staging(slave_id, job_id, frame)?;
        if let Some(path) = &staging {
            tokio::fs::write(path, &body).await?;
        }
        staging
    } else {
        None
    };

    let mut master = state.master.write().await;
    let held = match master.holds_frame(slave_id, job_id, frame) {
        Ok(held) => held,
        Err(e) => {
            if let Some(path) = &staged {
                let _ = tokio::fs::remove_file(path).await;
            }
            return Err(e);
        }
    };
    master.report_render(slave_id, job_id, frame, result, time, Utc::now())?;

    if let Some(staged) = staged {
        if held {
            let (_, target) = master.frame_result(job_id, frame)?;
            tokio::fs::rename(&staged, &target).await?;
        } else {
            tracing::warn!(job_id, slave_id, frame, "Discarding result of a frame no longer held");
            tokio::fs::remove_file(&staged).await?;
        }
    }
    Ok(StatusCode::OK.into_response())
}

/// `GET /log`: 202 while no log has been written for the frame.
pub async fn get_log(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let job_id = hdr::required(&headers, JOB_ID)?;
    let frame: i32 = hdr::parse(&headers, JOB_FRAME)?;
    let log_path = state.master.read().await.frame_log(job_id, frame)?;

    let Some(path) = log_path else {
        return Ok(StatusCode::ACCEPTED.into_response());
    };
    Ok(match read_blob(&path).await? {
        Some(data) => (StatusCode::OK, data).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    })
}

/// `POST /log`: assign a log file to a group of frames.
pub async fn post_log(State(state): State<AppState>, Json(info): Json<LogInfo>) -> Result<Response> {
    state.master.write().await.add_log(&info)?;
    Ok(StatusCode::OK.into_response())
}

/// `PUT /log`: append a chunk to the log of a frame.
pub async fn put_log(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let slave_id = hdr::required(&headers, SLAVE_ID)?;
    let job_id = hdr::required(&headers, JOB_ID)?;
    let frame: i32 = hdr::parse(&headers, JOB_FRAME)?;

    let log_path = {
        let mut master = state.master.write().await;
        if master.update_slave(slave_id, Utc::now()).is_none() {
            return Err(NetrenderError::SlaveNotFound(slave_id.to_string()));
        }
        master.frame_log(job_id, frame)?
    };
    let Some(path) = log_path else {
        return Err(NetrenderError::FrameNotFound {
            job_id: job_id.to_string(),
            frame,
        });
    };

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(&body).await?;
    Ok(StatusCode::OK.into_response())
}

/// `GET /file`: an input file of a job. 202 if it has not been uploaded yet.
pub async fn get_file(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let job_id = hdr::required(&headers, JOB_ID)?;
    let file = hdr::required(&headers, JOB_FILE)?;

    let path = {
        let mut master = state.master.write().await;
        if let Some(slave_id) = hdr::optional(&headers, SLAVE_ID)? {
            if master.update_slave(slave_id, Utc::now()).is_none() {
                return Err(NetrenderError::SlaveNotFound(slave_id.to_string()));
            }
        }
        master.input_file(job_id, file)?
    };

    Ok(match read_blob(&path).await? {
        Some(data) => (StatusCode::OK, data).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    })
}

/// `PUT /file`: upload an input file, then re-test whether the job starts.
pub async fn put_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let job_id = hdr::required(&headers, JOB_ID)?;
    let file = hdr::required(&headers, JOB_FILE)?;

    let target = state.master.read().await.upload_target(job_id, file)?;
    tokio::fs::write(&target, &body).await?;

    let started = state
        .master
        .write()
        .await
        .file_uploaded(job_id, file, target)?;
    Ok(if started {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    }
    .into_response())
}

/// `GET /slave`
pub async fn list_slaves(State(state): State<AppState>) -> Json<Vec<SlaveInfo>> {
    let master = state.master.read().await;
    Json(master.slaves().into_iter().map(|s| s.serialize()).collect())
}

/// `POST /slave`: register or re-register a slave.
pub async fn register_slave(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(registration): Json<SlaveRegistration>,
) -> Result<Response> {
    let peer = peer
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let slave_id = state
        .master
        .write()
        .await
        .add_slave(registration, peer, Utc::now());
    Ok((StatusCode::OK, [(SLAVE_ID, slave_id)]).into_response())
}

/// `GET /status`: all jobs, one job, or one frame.
pub async fn get_status(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let job_id = hdr::optional(&headers, JOB_ID)?;
    let frame: Option<i32> = hdr::parse_optional(&headers, JOB_FRAME)?;
    let master = state.master.read().await;

    let Some(job_id) = job_id else {
        return Ok(Json(master.ranked_jobs(Utc::now())).into_response());
    };
    let job = master
        .get_job_by_id(job_id)
        .ok_or_else(|| NetrenderError::JobNotFound(job_id.to_string()))?;

    Ok(match frame {
        None => Json(job.serialize(None)).into_response(),
        Some(number) => {
            let frame = job.frame(number).ok_or_else(|| NetrenderError::FrameNotFound {
                job_id: job_id.to_string(),
                frame: number,
            })?;
            Json(frame.serialize()).into_response()
        }
    })
}

/// `HEAD /status`: existence probe of a job or frame.
pub async fn head_status(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode> {
    let job_id = hdr::optional(&headers, JOB_ID)?;
    let frame: Option<i32> = hdr::parse_optional(&headers, JOB_FRAME)?;
    let master = state.master.read().await;

    let exists = match (job_id, frame) {
        (None, _) => true,
        (Some(job_id), None) => master.get_job_by_id(job_id).is_some(),
        (Some(job_id), Some(number)) => master
            .get_job_by_id(job_id)
            .is_some_and(|job| job.frame(number).is_some()),
    };
    Ok(if exists {
        StatusCode::OK
    } else {
        StatusCode::NO_CONTENT
    })
}

/// `POST /cancel`: remove one job, or every job without `job-id`.
pub async fn cancel(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let job_id = hdr::optional(&headers, JOB_ID)?;
    let mut master = state.master.write().await;
    match job_id {
        Some(job_id) => {
            master
                .remove_job(job_id)
                .ok_or_else(|| NetrenderError::JobNotFound(job_id.to_string()))?;
        }
        None => {
            master.clear_jobs();
        }
    }
    Ok(StatusCode::OK.into_response())
}

/// `POST /reset`
pub async fn reset(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let job_id = hdr::required(&headers, JOB_ID)?;
    let frame: Option<i32> = hdr::parse_optional(&headers, JOB_FRAME)?;
    let all = hdr::flag(&headers, RESET_ALL)?.unwrap_or(false);

    state.master.write().await.reset(job_id, frame, all)?;
    Ok(StatusCode::OK.into_response())
}

/// `GET /balance`
pub async fn get_balance(State(state): State<AppState>) -> Response {
    Json(state.master.read().await.balancer().serialize()).into_response()
}

/// `PUT /balance_enable`
pub async fn balance_enable(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let rule_id = hdr::required(&headers, RULE_ID)?;
    let enabled = hdr::flag(&headers, RULE_ENABLE)?.ok_or(NetrenderError::MissingHeader(RULE_ENABLE))?;

    state
        .master
        .write()
        .await
        .balancer_mut()
        .set_enabled(rule_id, enabled)?;
    Ok(StatusCode::OK.into_response())
}

/// `PUT /balance_limit`
pub async fn balance_limit(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let rule_id = hdr::required(&headers, RULE_ID)?;
    let limit: f64 = hdr::parse(&headers, RULE_LIMIT)?;

    state
        .master
        .write()
        .await
        .balancer_mut()
        .set_limit(rule_id, limit)?;
    Ok(StatusCode::OK.into_response())
}
