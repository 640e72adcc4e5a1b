//! Core engine for Taskpoints: users, tasks, goals, point settlement and the
//! daily digest.

pub mod audit;
pub mod config;
pub mod digest;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod notify;
pub mod password;
pub mod schedule;
pub mod schema;
pub mod store;

#[cfg(test)]
mod test_env;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
