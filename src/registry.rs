use crate::config::stack::{Dependency, ServiceSpec, StackConfig};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service `{name}` is declared more than once")]
    Duplicate { name: String },
    #[error("service name must not be empty")]
    EmptyName,
}

/// Declared services, kept in declaration order.
#[derive(Clone, Debug, Default)]
pub struct ServiceRegistry {
    services: Vec<Arc<ServiceSpec>>,
    index: HashMap<String, usize>,
}

impl ServiceRegistry {
    pub fn build(config: &StackConfig) -> Result<Self, RegistryError> {
        Self::from_services(config.services.iter().cloned())
    }

    pub fn from_services(
        services: impl IntoIterator<Item = ServiceSpec>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for spec in services {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, spec: ServiceSpec) -> Result<(), RegistryError> {
        if spec.name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.index.contains_key(&spec.name) {
            return Err(RegistryError::Duplicate {
                name: spec.name.clone(),
            });
        }

        self.index.insert(spec.name.clone(), self.services.len());
        self.services.push(Arc::new(spec));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ServiceSpec>> {
        self.index.get(name).map(|idx| &self.services[*idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceSpec>> {
        self.services.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|spec| spec.name.as_str())
    }

    pub fn dependencies_of(&self, name: &str) -> &[Dependency] {
        self.get(name)
            .map(|spec| spec.depends_on.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
