use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use super::{
    Manager, ManagerState, ProviderContext, ServiceError, ServiceFactory, ServiceOptions,
    ServiceRegistry, ServiceResult,
};

/// Supervises the service instances of a node, one per service type.
pub struct ServiceRunner {
    registry: Arc<ServiceRegistry>,
    context: ProviderContext,
    managers: Mutex<HashMap<String, Arc<Manager>>>,
    next_proposal_id: AtomicU64,
}

impl ServiceRunner {
    pub fn new(registry: Arc<ServiceRegistry>, context: ProviderContext) -> Self {
        Self {
            registry,
            context,
            managers: Mutex::new(HashMap::new()),
            next_proposal_id: AtomicU64::new(1),
        }
    }

    fn managers(&self) -> MutexGuard<'_, HashMap<String, Arc<Manager>>> {
        self.managers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Register a factory with the underlying service registry.
    pub fn register(&self, service_type: impl Into<String>, factory: Arc<dyn ServiceFactory>) {
        self.registry.register(service_type, factory);
    }

    /// Start an instance of `service_type`. Returns the manager driving it.
    pub async fn start(
        &self,
        service_type: &str,
        options: ServiceOptions,
    ) -> ServiceResult<Arc<Manager>> {
        let factory = self.registry.get(service_type)?;

        let manager = {
            let mut managers = self.managers();
            if let Some(existing) = managers.get(service_type) {
                if matches!(
                    existing.state(),
                    ManagerState::Starting | ManagerState::Running | ManagerState::Stopping
                ) {
                    return Err(ServiceError::AlreadyRunning(service_type.to_string()));
                }
            }
            let manager = Arc::new(Manager::new(service_type, self.context.clone()));
            managers.insert(service_type.to_string(), Arc::clone(&manager));
            manager
        };

        let proposal_id = self.next_proposal_id.fetch_add(1, Ordering::Relaxed);
        match manager.start(factory, options, proposal_id).await {
            Ok(()) => Ok(manager),
            Err(e) => {
                let mut managers = self.managers();
                if managers
                    .get(service_type)
                    .is_some_and(|current| Arc::ptr_eq(current, &manager))
                {
                    managers.remove(service_type);
                }
                Err(e)
            }
        }
    }

    /// Stop the instance of `service_type`.
    pub async fn stop(&self, service_type: &str) -> ServiceResult<()> {
        let manager = self
            .managers()
            .remove(service_type)
            .ok_or_else(|| ServiceError::NotRunning(service_type.to_string()))?;
        manager.stop().await
    }

    pub fn get(&self, service_type: &str) -> Option<Arc<Manager>> {
        self.managers().get(service_type).cloned()
    }

    /// Service types with an instance running, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut running: Vec<String> = self
            .managers()
            .iter()
            .filter(|(_, manager)| manager.state() == ManagerState::Running)
            .map(|(service_type, _)| service_type.clone())
            .collect();
        running.sort();
        running
    }

    /// Stop every instance in parallel and wait for all of them.
    pub async fn kill_all(&self) -> ServiceResult<()> {
        let managers: Vec<Arc<Manager>> = self.managers().drain().map(|(_, m)| m).collect();
        if managers.is_empty() {
            return Ok(());
        }
        info!(count = managers.len(), "Stopping all services");

        let results = join_all(managers.iter().map(|manager| manager.stop())).await;
        let mut first_error = None;
        for (manager, result) in managers.iter().zip(results) {
            if let Err(e) = result {
                warn!(service_type = %manager.service_type(), "Service stop failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
