use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetrenderError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Frame {frame} not found in job {job_id}")]
    FrameNotFound { job_id: String, frame: i32 },

    #[error("Slave not found: {0}")]
    SlaveNotFound(String),

    #[error("File {path} not declared by job {job_id}")]
    FileNotFound { job_id: String, path: String },

    #[error("Balancer rule not found: {0}")]
    RuleNotFound(String),

    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid header {name}: {value}")]
    InvalidHeader { name: &'static str, value: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NetrenderError {
    /// True for lookups of ids the master does not know about.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            NetrenderError::JobNotFound(_)
                | NetrenderError::FrameNotFound { .. }
                | NetrenderError::SlaveNotFound(_)
                | NetrenderError::FileNotFound { .. }
                | NetrenderError::RuleNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NetrenderError>;
