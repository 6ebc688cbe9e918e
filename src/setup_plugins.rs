use crate::framework::plugins::{
    custompolicy, defaultevictor, nodeutilization, podlifetime, removeduplicates, removefailedpods,
    removepodshavingtoomanyrestarts, removepodsviolatinginterpodantiaffinity, removepodsviolatingnodeaffinity,
    removepodsviolatingnodetaints,
};
use crate::framework::registry::{Registry, RegistryError};

/// Registers every built-in plugin.
pub fn register_default_plugins(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register(defaultevictor::registration())?;
    registry.register(nodeutilization::lownodeutilization_registration())?;
    registry.register(nodeutilization::highnodeutilization_registration())?;
    registry.register(custompolicy::registration())?;
    registry.register(removeduplicates::registration())?;
    registry.register(removefailedpods::registration())?;
    registry.register(removepodshavingtoomanyrestarts::registration())?;
    registry.register(removepodsviolatingnodetaints::registration())?;
    registry.register(removepodsviolatingnodeaffinity::registration())?;
    registry.register(removepodsviolatinginterpodantiaffinity::registration())?;
    registry.register(podlifetime::registration())?;
    Ok(())
}

/// A registry holding every built-in plugin.
pub fn default_registry() -> Result<Registry, RegistryError> {
    let mut registry = Registry::new();
    register_default_plugins(&mut registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ExtensionPoint;

    #[test]
    fn should_register_builtin_plugins() {
        let registry = default_registry().unwrap();
        assert_eq!(registry.len(), 11);
        let evictor = registry.get("DefaultEvictor").unwrap();
        assert!(evictor.supports(ExtensionPoint::Filter));
        assert!(evictor.supports(ExtensionPoint::PreEvictionFilter));
        assert!(!evictor.supports(ExtensionPoint::Balance));
        assert!(registry.get("CustomPolicyOne").unwrap().supports(ExtensionPoint::Balance));
        assert!(registry.get("PodLifeTime").unwrap().supports(ExtensionPoint::Deschedule));
        assert!(registry
            .get("RemovePodsViolatingNodeAffinity")
            .unwrap()
            .supports(ExtensionPoint::Deschedule));
        assert!(registry
            .get("RemovePodsViolatingInterPodAntiAffinity")
            .unwrap()
            .supports(ExtensionPoint::Deschedule));
    }

    #[test]
    fn registering_twice_fails() {
        let mut registry = default_registry().unwrap();
        assert!(register_default_plugins(&mut registry).is_err());
    }
}
