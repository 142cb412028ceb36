//! Plugin registry.
//!
//! Holds the authorization plugins known to the daemon. The daemon core may
//! register plugins while restoring persisted state, which is why configured
//! authorization plugins are validated only after the core is up.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

/// Errors raised by plugin lookups.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("plugin {0:?} not found")]
    NotFound(String),
}

/// The part of a request an authorization plugin gets to see.
#[derive(Debug, Clone)]
pub struct AuthzRequest {
    pub method: String,
    pub uri: String,
    pub user: Option<String>,
}

/// A plugin's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthzResponse {
    pub allow: bool,
    pub message: String,
}

impl AuthzResponse {
    pub fn allow() -> Self {
        Self {
            allow: true,
            message: String::new(),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            allow: false,
            message: message.into(),
        }
    }
}

/// An authorization plugin consulted for every API request.
#[async_trait]
pub trait AuthzPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn authorize(&self, request: &AuthzRequest) -> AuthzResponse;
}

/// Registry of plugins by name.
#[derive(Default)]
pub struct PluginStore {
    authz: DashMap<String, Arc<dyn AuthzPlugin>>,
}

impl std::fmt::Debug for PluginStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginStore")
            .field("authz", &self.authz_names())
            .finish()
    }
}

impl PluginStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an authorization plugin.
    pub fn register_authz(&self, plugin: Arc<dyn AuthzPlugin>) {
        let name = plugin.name().to_string();
        tracing::debug!(plugin = %name, "Authorization plugin registered");
        self.authz.insert(name, plugin);
    }

    pub fn authz(&self, name: &str) -> Result<Arc<dyn AuthzPlugin>, PluginError> {
        self.authz
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    pub fn authz_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.authz.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

/// Check that every configured authorization plugin is registered.
pub fn validate_authz_plugins(names: &[String], store: &PluginStore) -> Result<(), PluginError> {
    for name in names {
        store.authz(name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DenyAll;

    #[async_trait]
    impl AuthzPlugin for DenyAll {
        fn name(&self) -> &str {
            "deny-all"
        }

        async fn authorize(&self, _request: &AuthzRequest) -> AuthzResponse {
            AuthzResponse::deny("nope")
        }
    }

    #[test]
    fn validation_requires_registration() {
        let store = PluginStore::new();
        let names = vec!["deny-all".to_string()];
        assert_eq!(
            validate_authz_plugins(&names, &store),
            Err(PluginError::NotFound("deny-all".into()))
        );

        store.register_authz(Arc::new(DenyAll));
        assert!(validate_authz_plugins(&names, &store).is_ok());
        assert_eq!(store.authz_names(), names);
    }

    #[test]
    fn empty_list_is_valid() {
        assert!(validate_authz_plugins(&[], &PluginStore::new()).is_ok());
    }
}
