pub mod ask;
pub mod config;
pub mod features;
pub mod history;
pub mod init;
pub mod state;
pub mod task;
pub mod usage;
