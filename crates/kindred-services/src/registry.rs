//! Service registry: service type to live service instance.

use std::collections::HashMap;
use std::sync::Arc;

use kindred_core::wire::service_types;
use kindred_core::{Item, RawItem, ServiceType, WireError};
use thiserror::Error;

use crate::service::Service;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service {0:#06x} is already registered")]
    Duplicate(ServiceType),
}

/// Flat lookup table, filled at startup and read-only afterwards.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<ServiceType, Arc<dyn Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Arc<dyn Service>) -> Result<(), RegistryError> {
        let service_type = service.service_type();
        if self.services.contains_key(&service_type) {
            return Err(RegistryError::Duplicate(service_type));
        }
        tracing::info!(
            service = service.name(),
            service_type = %format!("{service_type:#06x}"),
            "service registered"
        );
        self.services.insert(service_type, service);
        Ok(())
    }

    pub fn get(&self, service_type: ServiceType) -> Option<&Arc<dyn Service>> {
        self.services.get(&service_type)
    }

    pub fn contains(&self, service_type: ServiceType) -> bool {
        self.services.contains_key(&service_type)
    }

    /// Registered service types, ascending.
    pub fn service_types(&self) -> Vec<ServiceType> {
        let mut types: Vec<_> = self.services.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Resolve a frame to its owning service and typed item. An unknown
    /// service or sub-type is a `NoSuchItem` frame error.
    pub fn decode(&self, raw: &RawItem) -> Result<(Arc<dyn Service>, Box<dyn Item>), WireError> {
        let service = self.services.get(&raw.service_type).ok_or(WireError::NoSuchItem {
            service_type: raw.service_type,
            sub_type: raw.sub_type,
        })?;
        let item = service.item_factory().decode(raw)?;
        Ok((service.clone(), item))
    }

    pub fn name_of(&self, service_type: ServiceType) -> String {
        match self.services.get(&service_type) {
            Some(service) => service.name().to_string(),
            None => service_types::name(service_type).to_string(),
        }
    }
}
