pub mod api;
pub mod cache;
pub mod client;
pub mod descheduler;
pub mod errors;
pub mod evictions;
pub mod framework;
pub mod helpers;
pub mod setup_plugins;

#[cfg(test)]
mod test_helpers;

pub use descheduler::descheduler;
