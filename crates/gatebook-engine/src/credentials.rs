//! Credential records and the injected lookup used by the resolver.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Named secret bundle resolved at parameter-resolution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Credential name (lookup key).
    pub name: String,

    /// Account username.
    pub username: String,

    /// Account password.
    #[serde(skip_serializing)]
    pub password: String,

    /// Gateway URL associated with this credential, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_url: Option<String>,
}

impl Credential {
    /// Read a credential field by template name.
    pub fn field(&self, field: &str) -> Option<String> {
        match field {
            "name" => Some(self.name.clone()),
            "username" | "user" => Some(self.username.clone()),
            "password" | "pass" => Some(self.password.clone()),
            "gateway_url" | "url" => self.gateway_url.clone(),
            _ => None,
        }
    }
}

/// Read-only credential lookup, safely shared across executions.
#[async_trait]
pub trait CredentialLookup: Send + Sync {
    /// Fetch a credential by name; `None` when unknown.
    async fn lookup(&self, name: &str) -> Option<Credential>;
}

/// In-memory credential store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCredentials {
    entries: HashMap<String, Credential>,
}

impl InMemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a credential, replacing any existing entry with the same name.
    pub fn insert(&mut self, credential: Credential) {
        self.entries.insert(credential.name.clone(), credential);
    }

    /// Build a shared lookup from a list of credentials.
    pub fn shared(credentials: Vec<Credential>) -> Arc<dyn CredentialLookup> {
        let mut store = Self::new();
        for credential in credentials {
            store.insert(credential);
        }
        Arc::new(store)
    }
}

#[async_trait]
impl CredentialLookup for InMemoryCredentials {
    async fn lookup(&self, name: &str) -> Option<Credential> {
        self.entries.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> Credential {
        Credential {
            name: "prod".to_string(),
            username: "admin".to_string(),
            password: "hunter2".to_string(),
            gateway_url: Some("https://gw.example.com".to_string()),
        }
    }

    #[test]
    fn test_field_access() {
        let cred = credential();
        assert_eq!(cred.field("username").as_deref(), Some("admin"));
        assert_eq!(cred.field("pass").as_deref(), Some("hunter2"));
        assert_eq!(cred.field("url").as_deref(), Some("https://gw.example.com"));
        assert_eq!(cred.field("token"), None);
    }

    #[test]
    fn test_password_not_serialized() {
        let json = serde_json::to_string(&credential()).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("admin"));
    }

    #[tokio::test]
    async fn test_in_memory_lookup() {
        let lookup = InMemoryCredentials::shared(vec![credential()]);
        assert!(lookup.lookup("prod").await.is_some());
        assert!(lookup.lookup("staging").await.is_none());
    }
}
