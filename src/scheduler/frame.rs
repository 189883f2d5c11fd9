use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameStatus {
    Queued,
    Dispatched,
    Done,
    Error,
}

impl std::fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameStatus::Queued => write!(f, "QUEUED"),
            FrameStatus::Dispatched => write!(f, "DISPATCHED"),
            FrameStatus::Done => write!(f, "DONE"),
            FrameStatus::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for FrameStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(FrameStatus::Queued),
            "DISPATCHED" => Ok(FrameStatus::Dispatched),
            "DONE" => Ok(FrameStatus::Done),
            "ERROR" => Ok(FrameStatus::Error),
            other => Err(format!("unknown frame status {other:?}")),
        }
    }
}

/// Wire and snapshot form of a [`Frame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub number: i32,
    pub status: FrameStatus,
    pub slave: Option<String>,
    pub time: f64,
    pub log_path: Option<PathBuf>,
}

/// A single renderable frame of a job.
///
/// `slave` holds the id of the slave the frame was handed to. It is looked
/// up in the slave pool, never owned, so a slave timing out cannot leave a
/// dangling reference behind.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub number: i32,
    status: FrameStatus,
    slave: Option<String>,
    time: f64,
    pub log_path: Option<PathBuf>,
}

impl Frame {
    pub fn new(number: i32) -> Self {
        Self {
            number,
            status: FrameStatus::Queued,
            slave: None,
            time: 0.0,
            log_path: None,
        }
    }

    pub fn status(&self) -> FrameStatus {
        self.status
    }

    pub fn slave(&self) -> Option<&str> {
        self.slave.as_deref()
    }

    /// Render time reported by the slave, in seconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// QUEUED -> DISPATCHED. Returns false if the frame was not queued.
    pub fn dispatch(&mut self, slave_id: &str) -> bool {
        if self.status != FrameStatus::Queued {
            return false;
        }
        self.status = FrameStatus::Dispatched;
        self.slave = Some(slave_id.to_string());
        true
    }

    /// DISPATCHED -> DONE or ERROR with the reported render time.
    pub fn complete(&mut self, status: FrameStatus, time: f64) -> bool {
        if self.status != FrameStatus::Dispatched
            || !matches!(status, FrameStatus::Done | FrameStatus::Error)
        {
            return false;
        }
        self.status = status;
        self.time = time;
        true
    }

    /// DISPATCHED -> ERROR after the owning slave stopped answering.
    pub fn abandon(&mut self) -> bool {
        if self.status != FrameStatus::Dispatched {
            return false;
        }
        self.status = FrameStatus::Error;
        true
    }

    /// Requeue the frame. Without `all` only frames in ERROR are reset.
    pub fn reset(&mut self, all: bool) -> bool {
        if all || self.status == FrameStatus::Error {
            self.status = FrameStatus::Queued;
            self.slave = None;
            self.time = 0.0;
            true
        } else {
            false
        }
    }

    pub fn serialize(&self) -> FrameInfo {
        FrameInfo {
            number: self.number,
            status: self.status,
            slave: self.slave.clone(),
            time: self.time,
            log_path: self.log_path.clone(),
        }
    }

    pub fn materialize(info: FrameInfo) -> Self {
        Self {
            number: info.number,
            status: info.status,
            slave: info.slave,
            time: info.time,
            log_path: info.log_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_frame_is_queued() {
        let frame = Frame::new(7);
        assert_eq!(frame.number, 7);
        assert_eq!(frame.status(), FrameStatus::Queued);
        assert!(frame.slave().is_none());
        assert_eq!(frame.time(), 0.0);
    }

    #[test]
    fn dispatch_only_from_queued() {
        let mut frame = Frame::new(1);
        assert!(frame.dispatch("a"));
        assert_eq!(frame.status(), FrameStatus::Dispatched);
        assert_eq!(frame.slave(), Some("a"));
        assert!(!frame.dispatch("b"));
        assert_eq!(frame.slave(), Some("a"));
    }

    #[test]
    fn complete_requires_dispatched() {
        let mut frame = Frame::new(1);
        assert!(!frame.complete(FrameStatus::Done, 1.0));

        frame.dispatch("a");
        assert!(!frame.complete(FrameStatus::Queued, 1.0));
        assert!(frame.complete(FrameStatus::Done, 12.5));
        assert_eq!(frame.status(), FrameStatus::Done);
        assert_eq!(frame.time(), 12.5);
    }

    #[test]
    fn abandon_marks_error() {
        let mut frame = Frame::new(1);
        assert!(!frame.abandon());
        frame.dispatch("a");
        assert!(frame.abandon());
        assert_eq!(frame.status(), FrameStatus::Error);
    }

    #[test]
    fn reset_error_only_leaves_done_alone() {
        let mut done = Frame::new(1);
        done.dispatch("a");
        done.complete(FrameStatus::Done, 3.0);

        let mut failed = Frame::new(2);
        failed.dispatch("a");
        failed.complete(FrameStatus::Error, 1.0);

        assert!(!done.reset(false));
        assert_eq!(done.status(), FrameStatus::Done);

        assert!(failed.reset(false));
        assert_eq!(failed.status(), FrameStatus::Queued);
        assert!(failed.slave().is_none());
        assert_eq!(failed.time(), 0.0);

        assert!(done.reset(true));
        assert_eq!(done.status(), FrameStatus::Queued);
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("done".parse::<FrameStatus>(), Ok(FrameStatus::Done));
        assert_eq!("ERROR".parse::<FrameStatus>(), Ok(FrameStatus::Error));
        assert!("finished".parse::<FrameStatus>().is_err());
    }
}
