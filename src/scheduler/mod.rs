pub mod balancer;
pub mod frame;
pub mod job;
pub mod pool;
pub mod queue;
pub mod slave;
pub mod state;

pub use balancer::Balancer;
pub use frame::{Frame, FrameStatus};
pub use job::{Job, JobManifest, JobStatus};
pub use slave::Slave;
pub use state::MasterState;
