//! CLI commands

pub mod banner;
pub mod index;
pub mod job_status;
pub mod load;
pub mod poll;
pub mod scan;
pub mod serve;
pub mod version;
pub mod worker;
