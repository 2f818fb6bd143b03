// Public API for integration tests and potential library usage

pub mod abuse;
pub mod captcha;
pub mod config;
pub mod error;
pub mod handlers;
pub mod session;
pub mod settings;
pub mod state;
pub mod tally;
pub mod tasks;
