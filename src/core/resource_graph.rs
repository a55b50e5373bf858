//! In-memory typed graph of gateway entities.
//!
//! Every namespace owns a cell with its own read/write lock holding the entity tables
//! (keyed `"{name}/{namespace}"`) and the back-edge sets used to enforce referential
//! integrity. The outer map is guarded by a main lock: per-entity writers take it shared and
//! then the namespace lock exclusively; namespace creation/removal and `clear` take it
//! exclusively. No namespace lock is ever taken while another one is held.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{
    error::{ResourceError, ResourceResult},
    resources::{
        Collection, Domain, HTTP_METHODS, Module, Namespace, NamespacedResource, Route, Secret,
        Service, resource_key,
    },
};

/// A domain together with the instant it was last written; used to key certificate caches.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainRecord {
    pub domain: Domain,
    pub created_at: DateTime<Utc>,
}

/// A route with its references resolved, as needed to build a router.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRoute {
    pub route: Route,
    pub namespace: Namespace,
    pub service: Option<Service>,
    pub modules: Vec<Module>,
}

#[derive(Debug, Default)]
struct NamespaceState {
    namespace: Namespace,
    services: BTreeMap<String, Service>,
    routes: BTreeMap<String, Route>,
    modules: BTreeMap<String, Module>,
    domains: BTreeMap<String, DomainRecord>,
    collections: BTreeMap<String, Collection>,
    secrets: BTreeMap<String, Secret>,
    // back-edges: service/module key -> route keys
    service_routes: BTreeMap<String, BTreeSet<String>>,
    module_routes: BTreeMap<String, BTreeSet<String>>,
}

impl NamespaceState {
    fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            ..Default::default()
        }
    }

    fn unlink_route(&mut self, route: &Route) {
        let route_key = route.key();
        if let Some(service) = route.service_name() {
            let service_key = resource_key(service, &route.namespace);
            if let Some(set) = self.service_routes.get_mut(&service_key) {
                set.remove(&route_key);
                if set.is_empty() {
                    self.service_routes.remove(&service_key);
                }
            }
        }
        for module in &route.modules {
            let module_key = resource_key(module, &route.namespace);
            if let Some(set) = self.module_routes.get_mut(&module_key) {
                set.remove(&route_key);
                if set.is_empty() {
                    self.module_routes.remove(&module_key);
                }
            }
        }
    }

    fn link_route(&mut self, route: &Route) {
        let route_key = route.key();
        if let Some(service) = route.service_name() {
            self.service_routes
                .entry(resource_key(service, &route.namespace))
                .or_default()
                .insert(route_key.clone());
        }
        for module in &route.modules {
            self.module_routes
                .entry(resource_key(module, &route.namespace))
                .or_default()
                .insert(route_key.clone());
        }
    }

    fn resolve(&self, route: &Route) -> ResolvedRoute {
        ResolvedRoute {
            route: route.clone(),
            namespace: self.namespace.clone(),
            service: route
                .service_name()
                .and_then(|s| self.services.get(&resource_key(s, &route.namespace)))
                .cloned(),
            modules: route
                .modules
                .iter()
                .filter_map(|m| self.modules.get(&resource_key(m, &route.namespace)))
                .cloned()
                .collect(),
        }
    }

    /// Name of the first table that still holds entities, in deletion-check order.
    fn first_dependent(&self) -> Option<&'static str> {
        if !self.routes.is_empty() {
            Some("routes")
        } else if !self.services.is_empty() {
            Some("services")
        } else if !self.modules.is_empty() {
            Some("modules")
        } else if !self.domains.is_empty() {
            Some("domains")
        } else if !self.collections.is_empty() {
            Some("collections")
        } else if !self.secrets.is_empty() {
            Some("secrets")
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct NamespaceCell {
    state: RwLock<NamespaceState>,
}

/// Validate a route's method list: `"*"` alone, or recognized methods only.
pub fn validate_methods(methods: &[String]) -> ResourceResult<()> {
    if methods.is_empty() {
        return Err(ResourceError::Validation(
            "route must have at least one method".into(),
        ));
    }
    if methods.iter().any(|m| m == "*") {
        if methods.len() > 1 {
            return Err(ResourceError::Validation(
                "route method \"*\" cannot be combined with other methods".into(),
            ));
        }
        return Ok(());
    }
    for method in methods {
        if !HTTP_METHODS.contains(&method.to_ascii_uppercase().as_str()) {
            return Err(ResourceError::Validation(format!(
                "route method not supported: {method}"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct ResourceGraph {
    main: RwLock<BTreeMap<String, Arc<NamespaceCell>>>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, namespace: &str) -> ResourceResult<Arc<NamespaceCell>> {
        self.main
            .read()
            .get(namespace)
            .cloned()
            .ok_or_else(|| ResourceError::NamespaceNotFound(namespace.to_string()))
    }

    fn write_ns<T>(
        &self,
        namespace: &str,
        f: impl FnOnce(&mut NamespaceState) -> ResourceResult<T>,
    ) -> ResourceResult<T> {
        let main = self.main.read();
        let cell = main
            .get(namespace)
            .ok_or_else(|| ResourceError::NamespaceNotFound(namespace.to_string()))?;
        let mut state = cell.state.write();
        f(&mut state)
    }

    fn read_ns<T>(&self, namespace: &str, f: impl FnOnce(&NamespaceState) -> T) -> ResourceResult<T> {
        let cell = self.cell(namespace)?;
        let state = cell.state.read();
        Ok(f(&state))
    }

    /// Visit every namespace under the main read lock, one namespace lock at a time.
    fn scan<T>(&self, mut f: impl FnMut(&NamespaceState) -> Vec<T>) -> Vec<T> {
        let main = self.main.read();
        main.values().flat_map(|cell| f(&cell.state.read())).collect()
    }

    // Namespaces

    pub fn add_namespace(&self, namespace: Namespace) -> ResourceResult<()> {
        if namespace.name.is_empty() {
            return Err(ResourceError::Validation("namespace name is required".into()));
        }
        let mut main = self.main.write();
        match main.get(&namespace.name) {
            Some(cell) => cell.state.write().namespace = namespace,
            None => {
                main.insert(
                    namespace.name.clone(),
                    Arc::new(NamespaceCell {
                        state: RwLock::new(NamespaceState::new(namespace)),
                    }),
                );
            }
        }
        Ok(())
    }

    pub fn remove_namespace(&self, name: &str) -> ResourceResult<()> {
        let mut main = self.main.write();
        let cell = main
            .get(name)
            .ok_or_else(|| ResourceError::NamespaceNotFound(name.to_string()))?;
        if let Some(dependent) = cell.state.read().first_dependent() {
            return Err(ResourceError::cannot_delete(
                "namespace",
                name,
                format!("{dependent} still linked"),
            ));
        }
        main.remove(name);
        Ok(())
    }

    pub fn get_namespace(&self, name: &str) -> Option<Namespace> {
        self.read_ns(name, |s| s.namespace.clone()).ok()
    }

    pub fn get_namespaces(&self) -> Vec<Namespace> {
        self.scan(|s| vec![s.namespace.clone()])
    }

    pub fn namespace_count(&self) -> usize {
        self.main.read().len()
    }

    // Services

    pub fn add_service(&self, service: Service) -> ResourceResult<()> {
        if service.name.is_empty() {
            return Err(ResourceError::Validation("service name is required".into()));
        }
        let namespace = service.namespace.clone();
        self.write_ns(&namespace, |s| {
            s.services.insert(service.key(), service);
            Ok(())
        })
    }

    pub fn remove_service(&self, name: &str, namespace: &str) -> ResourceResult<()> {
        self.write_ns(namespace, |s| {
            let key = resource_key(name, namespace);
            if !s.services.contains_key(&key) {
                return Err(ResourceError::ServiceNotFound(name.to_string()));
            }
            if s.service_routes.get(&key).is_some_and(|r| !r.is_empty()) {
                return Err(ResourceError::cannot_delete(
                    "service",
                    name,
                    "routes still linked",
                ));
            }
            s.services.remove(&key);
            Ok(())
        })
    }

    pub fn get_service(&self, name: &str, namespace: &str) -> Option<Service> {
        self.read_ns(namespace, |s| s.services.get(&resource_key(name, namespace)).cloned())
            .ok()
            .flatten()
    }

    pub fn get_services_by_namespace(&self, namespace: &str) -> ResourceResult<Vec<Service>> {
        self.read_ns(namespace, |s| s.services.values().cloned().collect())
    }

    pub fn get_services(&self) -> Vec<Service> {
        self.scan(|s| s.services.values().cloned().collect())
    }

    // Routes

    pub fn add_route(&self, route: Route) -> ResourceResult<()> {
        if route.name.is_empty() {
            return Err(ResourceError::Validation("route name is required".into()));
        }
        if route.paths.is_empty() {
            return Err(ResourceError::Validation(
                "route must have at least one path".into(),
            ));
        }
        validate_methods(&route.methods)?;
        let namespace = route.namespace.clone();
        self.write_ns(&namespace, |s| {
            if let Some(service) = route.service_name() {
                if !s.services.contains_key(&resource_key(service, &namespace)) {
                    return Err(ResourceError::ServiceNotFound(service.to_string()));
                }
            }
            for module in &route.modules {
                if !s.modules.contains_key(&resource_key(module, &namespace)) {
                    return Err(ResourceError::ModuleNotFound(module.to_string()));
                }
            }
            let key = route.key();
            if let Some(old) = s.routes.remove(&key) {
                s.unlink_route(&old);
            }
            s.link_route(&route);
            s.routes.insert(key, route);
            Ok(())
        })
    }

    pub fn remove_route(&self, name: &str, namespace: &str) -> ResourceResult<()> {
        self.write_ns(namespace, |s| {
            let route = s
                .routes
                .remove(&resource_key(name, namespace))
                .ok_or_else(|| ResourceError::RouteNotFound(name.to_string()))?;
            s.unlink_route(&route);
            Ok(())
        })
    }

    pub fn get_route(&self, name: &str, namespace: &str) -> Option<Route> {
        self.read_ns(namespace, |s| s.routes.get(&resource_key(name, namespace)).cloned())
            .ok()
            .flatten()
    }

    pub fn get_routes_by_namespace(&self, namespace: &str) -> ResourceResult<Vec<Route>> {
        self.read_ns(namespace, |s| s.routes.values().cloned().collect())
    }

    pub fn get_routes(&self) -> Vec<Route> {
        self.scan(|s| s.routes.values().cloned().collect())
    }

    /// Routes of a namespace with service and modules attached.
    pub fn resolved_routes_by_namespace(
        &self,
        namespace: &str,
    ) -> ResourceResult<Vec<ResolvedRoute>> {
        self.read_ns(namespace, |s| s.routes.values().map(|r| s.resolve(r)).collect())
    }

    pub fn get_resolved_route(&self, name: &str, namespace: &str) -> Option<ResolvedRoute> {
        self.read_ns(namespace, |s| {
            s.routes.get(&resource_key(name, namespace)).map(|r| s.resolve(r))
        })
        .ok()
        .flatten()
    }

    // Modules

    pub fn add_module(&self, module: Module) -> ResourceResult<()> {
        if module.name.is_empty() {
            return Err(ResourceError::Validation("module name is required".into()));
        }
        let namespace = module.namespace.clone();
        self.write_ns(&namespace, |s| {
            s.modules.insert(module.key(), module);
            Ok(())
        })
    }

    pub fn remove_module(&self, name: &str, namespace: &str) -> ResourceResult<()> {
        self.write_ns(namespace, |s| {
            let key = resource_key(name, namespace);
            if !s.modules.contains_key(&key) {
                return Err(ResourceError::ModuleNotFound(name.to_string()));
            }
            if s.module_routes.get(&key).is_some_and(|r| !r.is_empty()) {
                return Err(ResourceError::cannot_delete(
                    "module",
                    name,
                    "routes still linked",
                ));
            }
            if s.collections.values().any(|c| c.modules.iter().any(|m| m == name)) {
                return Err(ResourceError::cannot_delete(
                    "module",
                    name,
                    "collections still linked",
                ));
            }
            s.modules.remove(&key);
            Ok(())
        })
    }

    pub fn get_module(&self, name: &str, namespace: &str) -> Option<Module> {
        self.read_ns(namespace, |s| s.modules.get(&resource_key(name, namespace)).cloned())
            .ok()
            .flatten()
    }

    pub fn get_modules_by_namespace(&self, namespace: &str) -> ResourceResult<Vec<Module>> {
        self.read_ns(namespace, |s| s.modules.values().cloned().collect())
    }

    pub fn get_modules(&self) -> Vec<Module> {
        self.scan(|s| s.modules.values().cloned().collect())
    }

    // Domains

    pub fn add_domain(&self, domain: Domain) -> ResourceResult<()> {
        if domain.name.is_empty() {
            return Err(ResourceError::Validation("domain name is required".into()));
        }
        let namespace = domain.namespace.clone();
        self.write_ns(&namespace, |s| {
            s.domains.insert(
                domain.key(),
                DomainRecord {
                    domain,
                    created_at: Utc::now(),
                },
            );
            Ok(())
        })
    }

    pub fn remove_domain(&self, name: &str, namespace: &str) -> ResourceResult<()> {
        self.write_ns(namespace, |s| {
            s.domains
                .remove(&resource_key(name, namespace))
                .map(|_| ())
                .ok_or_else(|| ResourceError::DomainNotFound(name.to_string()))
        })
    }

    pub fn get_domain(&self, name: &str, namespace: &str) -> Option<Domain> {
        self.read_ns(namespace, |s| {
            s.domains
                .get(&resource_key(name, namespace))
                .map(|d| d.domain.clone())
        })
        .ok()
        .flatten()
    }

    pub fn get_domains_by_namespace(&self, namespace: &str) -> ResourceResult<Vec<Domain>> {
        self.read_ns(namespace, |s| {
            s.domains.values().map(|d| d.domain.clone()).collect()
        })
    }

    pub fn get_domains(&self) -> Vec<Domain> {
        self.scan(|s| s.domains.values().map(|d| d.domain.clone()).collect())
    }

    /// All domains sorted by priority (highest first), ties broken by name.
    pub fn get_domains_by_priority(&self) -> Vec<DomainRecord> {
        let mut domains = self.scan(|s| s.domains.values().cloned().collect());
        domains.sort_by(|a, b| {
            b.domain
                .priority
                .cmp(&a.domain.priority)
                .then_with(|| a.domain.name.cmp(&b.domain.name))
        });
        domains
    }

    pub fn namespace_has_domains(&self, namespace: &str) -> bool {
        self.read_ns(namespace, |s| !s.domains.is_empty())
            .unwrap_or(false)
    }

    // Collections

    pub fn add_collection(&self, collection: Collection) -> ResourceResult<()> {
        if collection.name.is_empty() {
            return Err(ResourceError::Validation(
                "collection name is required".into(),
            ));
        }
        let namespace = collection.namespace.clone();
        self.write_ns(&namespace, |s| {
            for module in &collection.modules {
                if !s.modules.contains_key(&resource_key(module, &namespace)) {
                    return Err(ResourceError::ModuleNotFound(module.to_string()));
                }
            }
            s.collections.insert(collection.key(), collection);
            Ok(())
        })
    }

    pub fn remove_collection(&self, name: &str, namespace: &str) -> ResourceResult<()> {
        self.write_ns(namespace, |s| {
            s.collections
                .remove(&resource_key(name, namespace))
                .map(|_| ())
                .ok_or_else(|| ResourceError::CollectionNotFound(name.to_string()))
        })
    }

    pub fn get_collection(&self, name: &str, namespace: &str) -> Option<Collection> {
        self.read_ns(namespace, |s| {
            s.collections.get(&resource_key(name, namespace)).cloned()
        })
        .ok()
        .flatten()
    }

    pub fn get_collections_by_namespace(
        &self,
        namespace: &str,
    ) -> ResourceResult<Vec<Collection>> {
        self.read_ns(namespace, |s| s.collections.values().cloned().collect())
    }

    pub fn get_collections(&self) -> Vec<Collection> {
        self.scan(|s| s.collections.values().cloned().collect())
    }

    // Secrets

    pub fn add_secret(&self, secret: Secret) -> ResourceResult<()> {
        if secret.name.is_empty() {
            return Err(ResourceError::Validation("secret name is required".into()));
        }
        let namespace = secret.namespace.clone();
        self.write_ns(&namespace, |s| {
            s.secrets.insert(secret.key(), secret);
            Ok(())
        })
    }

    pub fn remove_secret(&self, name: &str, namespace: &str) -> ResourceResult<()> {
        self.write_ns(namespace, |s| {
            s.secrets
                .remove(&resource_key(name, namespace))
                .map(|_| ())
                .ok_or_else(|| ResourceError::SecretNotFound(name.to_string()))
        })
    }

    pub fn get_secret(&self, name: &str, namespace: &str) -> Option<Secret> {
        self.read_ns(namespace, |s| s.secrets.get(&resource_key(name, namespace)).cloned())
            .ok()
            .flatten()
    }

    pub fn get_secrets_by_namespace(&self, namespace: &str) -> ResourceResult<Vec<Secret>> {
        self.read_ns(namespace, |s| s.secrets.values().cloned().collect())
    }

    pub fn get_secrets(&self) -> Vec<Secret> {
        self.scan(|s| s.secrets.values().cloned().collect())
    }

    // Whole graph

    pub fn clear(&self) {
        self.main.write().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.main.read().is_empty()
    }
}
