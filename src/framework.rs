pub mod plugins;
pub mod profile;
pub mod registry;
pub mod types;

pub use types::*;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FrameworkError {
    #[error("want args of plugin {plugin} to be of type {expected}, got {got}")]
    ArgType {
        plugin: String,
        expected: String,
        got: String,
    },
    #[error("failed to initialize plugin {plugin}: {message}")]
    Init { plugin: String, message: String },
}

impl FrameworkError {
    pub fn arg_type(plugin: &str, expected: &str, got: &plugins::PluginArgs) -> Self {
        FrameworkError::ArgType {
            plugin: plugin.to_string(),
            expected: expected.to_string(),
            got: got.kind().to_string(),
        }
    }
}
