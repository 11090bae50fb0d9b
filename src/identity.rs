//! Caller identity.
//!
//! Callers authenticate with a bearer API key. [`ApiKeyStore`] resolves a key
//! to a stable user id and a role; keys are declared in the server config.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Role attached to an authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Technician,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Manager => write!(f, "manager"),
            Role::Technician => write!(f, "technician"),
        }
    }
}

/// Authenticated user info, added to request extensions after auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: String,
    pub role: Role,
}

impl AuthUser {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}

/// API key entry in config.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ApiKeyEntry {
    pub key: String,
    pub user_id: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::Technician
}

/// API key store - maps key -> AuthUser.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyStore {
    keys: HashMap<String, AuthUser>,
}

impl ApiKeyStore {
    /// Builds the store from configured entries.
    ///
    /// Later entries win when a key is declared twice.
    pub fn from_entries(entries: &[ApiKeyEntry]) -> Self {
        let mut keys = HashMap::new();
        for entry in entries {
            if keys
                .insert(
                    entry.key.clone(),
                    AuthUser::new(entry.user_id.clone(), entry.role),
                )
                .is_some()
            {
                tracing::warn!("API key for user {} declared more than once", entry.user_id);
            }
        }

        if keys.is_empty() {
            tracing::warn!("No API keys loaded - all authenticated requests will fail");
        } else {
            tracing::info!("Loaded {} API key(s)", keys.len());
        }

        Self { keys }
    }

    /// Validate an API key and return the associated user.
    pub fn validate(&self, key: &str) -> Option<AuthUser> {
        self.keys.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
