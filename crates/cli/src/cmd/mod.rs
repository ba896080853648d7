pub mod util;
pub mod agent;
pub mod admin;

pub use agent::{heartbeat, log, poll, register, result};
pub use admin::{job_cancel, job_create, job_get};
