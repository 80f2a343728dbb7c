pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod notify;
pub mod session;
pub mod store;
pub mod tmux;
pub mod util;
pub mod workers;

pub mod orchestration;

pub use error::{Error, Result};
