use crate::api::{ExtensionPoint, ValidationError};
use crate::framework::plugins::PluginArgs;
use crate::framework::{FrameworkError, Handle, PluginInstance};
use std::collections::BTreeMap;

pub type PluginFactory = fn(PluginArgs, &dyn Handle) -> Result<PluginInstance, FrameworkError>;
pub type DecodeArgsFn = fn(serde_yaml::Value) -> Result<PluginArgs, serde_yaml::Error>;
pub type ValidateArgsFn = fn(&PluginArgs) -> Result<(), ValidationError>;
pub type SetDefaultsFn = fn(&mut PluginArgs);
pub type NewArgsFn = fn() -> PluginArgs;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("plugin {0:?} is already registered")]
    Duplicate(String),
}

#[derive(Clone)]
pub struct PluginRegistration {
    pub name: String,
    pub factory: PluginFactory,
    /// Args used when the policy configures none.
    pub new_args: NewArgsFn,
    pub decode: DecodeArgsFn,
    pub validate: ValidateArgsFn,
    pub set_defaults: SetDefaultsFn,
    pub extension_points: Vec<ExtensionPoint>,
}

impl PluginRegistration {
    pub fn supports(&self, point: ExtensionPoint) -> bool {
        self.extension_points.contains(&point)
    }

    /// Decodes, defaults and validates raw policy args. A missing or null
    /// value starts from the empty args.
    pub fn resolve_args(&self, raw: Option<&serde_yaml::Value>) -> Result<PluginArgs, ValidationError> {
        let mut args = match raw {
            None | Some(serde_yaml::Value::Null) => (self.new_args)(),
            Some(value) => (self.decode)(value.clone()).map_err(|e| ValidationError::Decode {
                plugin: self.name.clone(),
                message: e.to_string(),
            })?,
        };
        (self.set_defaults)(&mut args);
        (self.validate)(&args).map_err(|e| ValidationError::Plugin {
            plugin: self.name.clone(),
            source: Box::new(e),
        })?;
        Ok(args)
    }
}

/// Plugin name to registration. Built once at startup and passed around by
/// reference.
#[derive(Default, Clone)]
pub struct Registry {
    plugins: BTreeMap<String, PluginRegistration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: PluginRegistration) -> Result<(), RegistryError> {
        if self.plugins.contains_key(&registration.name) {
            return Err(RegistryError::Duplicate(registration.name));
        }
        self.plugins.insert(registration.name.clone(), registration);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PluginRegistration> {
        self.plugins.get(name)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
