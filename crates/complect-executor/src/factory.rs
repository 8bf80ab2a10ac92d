//! Backend construction from target configuration.

use complect_config::{RemoteTarget, SystemConfig, TargetKind};
use complect_core::{Backend, BackendProvider, Error, Result};
use std::sync::Arc;

use crate::docker::DockerBackend;
use crate::engine::EngineCommands;
use crate::kubernetes::KubernetesBackend;
use crate::vm::VirtualMachineBackend;

/// Build the backend variant a target is configured for.
pub fn create_backend(target: &RemoteTarget) -> Box<dyn Backend> {
    let engine = EngineCommands::new(&target.engine_path, target.strict);

    match (&target.kind, &target.container) {
        (TargetKind::Kubernetes(k8s), _) => Box::new(KubernetesBackend::new(
            &target.name,
            k8s.clone(),
            &target.data_path,
            engine,
        )),
        (TargetKind::Ssh(ssh), Some(container)) => Box::new(DockerBackend::new(
            &target.name,
            ssh.clone(),
            &target.data_path,
            engine,
            container,
            &target.container_volume,
        )),
        (TargetKind::Ssh(ssh), None) => Box::new(VirtualMachineBackend::new(
            &target.name,
            ssh.clone(),
            &target.data_path,
            engine,
        )),
    }
}

/// Resolves target names against the loaded system configuration.
pub struct TargetBackends {
    config: Arc<SystemConfig>,
}

impl TargetBackends {
    pub fn new(config: Arc<SystemConfig>) -> Self {
        Self { config }
    }
}

impl BackendProvider for TargetBackends {
    fn compiler(&self, target: &str) -> Result<Box<dyn Backend>> {
        let target = self
            .config
            .compiler(target)
            .map_err(|e| Error::Configuration(e.to_string()))?;
        Ok(create_backend(target))
    }

    fn deployer(&self, target: &str) -> Result<Box<dyn Backend>> {
        let target = self
            .config
            .deployer(target)
            .map_err(|e| Error::Configuration(e.to_string()))?;
        Ok(create_backend(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use complect_config::parse_system_config;

    const CONFIG: &str = r#"
        compiler "vm" { ssh host="h1"; engine-path "/e"; data-path "/d"; }
        compiler "dockered" { ssh host="h2"; engine-path "/e"; data-path "/d"; container "infengine"; }
        deployer "pod" { kubernetes pod="p"; engine-path "/e"; }
    "#;

    fn backends() -> TargetBackends {
        TargetBackends::new(Arc::new(parse_system_config(CONFIG).unwrap()))
    }

    #[test]
    fn test_variant_selection() {
        let backends = backends();
        assert_eq!(backends.compiler("vm").unwrap().name(), "ssh");
        assert_eq!(backends.compiler("dockered").unwrap().name(), "docker");

        let pod = backends.deployer("pod").unwrap();
        assert_eq!(pod.name(), "kubernetes");
        assert_eq!(pod.target(), "pod");
        assert!(!pod.capabilities().update);
    }

    #[test]
    fn test_unknown_target_is_configuration_error() {
        let backends = backends();
        let err = backends.deployer("vm").err().unwrap();
        assert!(err.is_configuration());
        assert!(backends.compiler("nope").is_err());
    }
}
