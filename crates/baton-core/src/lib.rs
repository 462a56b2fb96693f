pub mod config;
pub mod error;
pub mod history;
pub mod invoke;
pub mod io;
pub mod lifecycle;
pub mod lock;
pub mod paths;
pub mod plan;
pub mod registry;
pub mod router;
pub mod state;
pub mod store;
pub mod types;
pub mod usage;

pub use error::{BatonError, Result};
