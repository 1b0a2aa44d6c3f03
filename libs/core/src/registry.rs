use std::collections::HashMap;
use std::sync::Arc;

use crate::model::OAuthProviderRecord;
use crate::service::{OAuthConfig, ServiceDescriptor};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("service {0} registered twice")]
    Duplicate(String),
    #[error("service name must not be empty")]
    EmptyName,
}

/// Immutable name → descriptor map built once at startup.
///
/// ```
/// use hookgram_core::registry::ServiceRegistry;
///
/// let registry = ServiceRegistry::builder().build();
/// assert!(registry.get("trello").is_none());
/// ```
#[derive(Debug, Default, Clone)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<ServiceDescriptor>>,
    order: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ServiceRegistryBuilder {
    services: Vec<ServiceDescriptor>,
}

impl ServiceRegistryBuilder {
    pub fn register(mut self, descriptor: ServiceDescriptor) -> Self {
        self.services.push(descriptor);
        self
    }

    pub fn try_build(self) -> Result<ServiceRegistry, RegistryError> {
        let mut registry = ServiceRegistry::default();
        for descriptor in self.services {
            if descriptor.name.is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if registry.services.contains_key(&descriptor.name) {
                return Err(RegistryError::Duplicate(descriptor.name));
            }
            registry.order.push(descriptor.name.clone());
            registry
                .services
                .insert(descriptor.name.clone(), Arc::new(descriptor));
        }
        Ok(registry)
    }

    /// Builds the registry; later duplicates are dropped with a warning.
    pub fn build(self) -> ServiceRegistry {
        let mut registry = ServiceRegistry::default();
        for descriptor in self.services {
            if registry.services.contains_key(&descriptor.name) {
                tracing::warn!(service = %descriptor.name, "duplicate service registration ignored");
                continue;
            }
            registry.order.push(descriptor.name.clone());
            registry
                .services
                .insert(descriptor.name.clone(), Arc::new(descriptor));
        }
        registry
    }
}

impl ServiceRegistry {
    pub fn builder() -> ServiceRegistryBuilder {
        ServiceRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.services.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Provider derived from the service's own OAuth configuration.
    pub fn default_provider(&self, name: &str) -> Option<OAuthProviderRecord> {
        let descriptor = self.services.get(name)?;
        let (client_id, client_secret) = match descriptor.oauth.as_ref()? {
            OAuthConfig::OAuth1(cfg) => (&cfg.consumer_key, &cfg.consumer_secret),
            OAuthConfig::OAuth2(cfg) => (&cfg.client_id, &cfg.client_secret),
        };
        Some(
            OAuthProviderRecord::new(&descriptor.name, &descriptor.base_url)
                .with_credentials(client_id, client_secret),
        )
    }

    /// Looks up a default provider by the id embedded in callback URLs.
    pub fn default_provider_by_id(&self, internal_id: &str) -> Option<OAuthProviderRecord> {
        self.order
            .iter()
            .filter_map(|name| self.default_provider(name))
            .find(|provider| provider.internal_id() == internal_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DispatchContext;
    use crate::service::{HandlerError, OAuth2Config, WebhookHandler, WebhookRequest};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl WebhookHandler for Noop {
        async fn handle(
            &self,
            _ctx: &DispatchContext,
            _request: &WebhookRequest,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn oauth2() -> OAuth2Config {
        OAuth2Config {
            client_id: "cid".into(),
            client_secret: "csecret".into(),
            auth_url: "/authorize".into(),
            token_url: "/token".into(),
            scopes: vec![],
            receiver: None,
        }
    }

    #[test]
    fn duplicates_are_rejected() {
        let err = ServiceRegistry::builder()
            .register(ServiceDescriptor::new("trello", Arc::new(Noop)))
            .register(ServiceDescriptor::new("trello", Arc::new(Noop)))
            .try_build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "trello"));
    }

    #[test]
    fn lookup_by_name_and_provider_id() {
        let registry = ServiceRegistry::builder()
            .register(
                ServiceDescriptor::new("trello", Arc::new(Noop))
                    .with_base_url("https://trello.com")
                    .with_oauth2(oauth2()),
            )
            .register(ServiceDescriptor::new("plain", Arc::new(Noop)))
            .build();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["trello", "plain"]);
        assert!(registry.default_provider("plain").is_none());

        let provider = registry.default_provider("trello").unwrap();
        assert_eq!(provider.client_id, "cid");
        let found = registry
            .default_provider_by_id(&provider.internal_id())
            .unwrap();
        assert_eq!(found.service, "trello");
        assert!(registry.default_provider_by_id("nope").is_none());
    }
}
