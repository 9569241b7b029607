use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use super::{ServiceError, ServiceFactory, ServiceResult};

/// Service type to factory mapping.
#[derive(Default)]
pub struct ServiceRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ServiceFactory>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for `service_type`, replacing any earlier one.
    pub fn register(&self, service_type: impl Into<String>, factory: Arc<dyn ServiceFactory>) {
        let service_type = service_type.into();
        let replaced = self
            .factories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(service_type.clone(), factory);
        if replaced.is_some() {
            warn!(service_type = %service_type, "Service factory replaced");
        } else {
            debug!(service_type = %service_type, "Service factory registered");
        }
    }

    pub fn get(&self, service_type: &str) -> ServiceResult<Arc<dyn ServiceFactory>> {
        self.factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(service_type)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownType(service_type.to_string()))
    }

    /// Registered service types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}
