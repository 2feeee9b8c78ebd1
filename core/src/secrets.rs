/// Secret references and resolution for channel adapters.
/// The engine never stores secret material itself; it resolves typed
/// references against a pluggable provider and hands the resulting
/// opaque blobs to the adapter, wiping them on drop.
use crate::errors::DispatchResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Scope a secret reference is resolved in, ordered by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretScope {
    /// Per-recipient credential
    User,
    /// Tenant-wide credential
    Tenant,
    /// Installation default
    System,
}

impl SecretScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretScope::User => "user",
            SecretScope::Tenant => "tenant",
            SecretScope::System => "system",
        }
    }
}

/// A reference to one secret: `(scope, subject, channel, provider, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretReference {
    pub scope: SecretScope,
    pub subject_id: String,
    pub channel: String,
    pub provider: String,
    pub key: String,
}

impl SecretReference {
    pub fn new(
        scope: SecretScope,
        subject_id: impl Into<String>,
        channel: impl Into<String>,
        provider: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            subject_id: subject_id.into(),
            channel: channel.into(),
            provider: provider.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for SecretReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.scope.as_str(),
            self.subject_id,
            self.channel,
            self.provider,
            self.key
        )
    }
}

/// Resolved secret material. Zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretEntry {
    pub data: Vec<u8>,
}

impl SecretEntry {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl std::fmt::Debug for SecretEntry {
    // Secret bytes never land in logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretEntry({} bytes)", self.data.len())
    }
}

/// Resolves secret references to opaque blobs. References that do not
/// exist are simply absent from the result; that is not an error.
#[async_trait]
pub trait SecretsResolver: Send + Sync {
    async fn resolve(
        &self,
        refs: &[SecretReference],
    ) -> DispatchResult<HashMap<SecretReference, SecretEntry>>;
}

/// In-memory resolver for tests and single-process hosts.
#[derive(Default)]
pub struct MemorySecretsResolver {
    entries: RwLock<HashMap<SecretReference, Vec<u8>>>,
}

impl MemorySecretsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, reference: SecretReference, data: Vec<u8>) {
        self.entries.write().insert(reference, data);
    }
}

#[async_trait]
impl SecretsResolver for MemorySecretsResolver {
    async fn resolve(
        &self,
        refs: &[SecretReference],
    ) -> DispatchResult<HashMap<SecretReference, SecretEntry>> {
        let entries = self.entries.read();
        Ok(refs
            .iter()
            .filter_map(|r| entries.get(r).map(|d| (r.clone(), SecretEntry::new(d.clone()))))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_resolver_returns_only_known_refs() {
        let resolver = MemorySecretsResolver::new();
        let known = SecretReference::new(
            SecretScope::Tenant,
            "acme",
            "email",
            "smtp",
            "default",
        );
        resolver.insert(known.clone(), b"hunter2".to_vec());

        let unknown =
            SecretReference::new(SecretScope::User, "user@example.com", "email", "smtp", "default");

        let found = resolver
            .resolve(&[known.clone(), unknown.clone()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[&known].data, b"hunter2");
        assert!(!found.contains_key(&unknown));
    }

    #[test]
    fn secret_entry_debug_hides_bytes() {
        let entry = SecretEntry::new(b"topsecret".to_vec());
        assert!(!format!("{:?}", entry).contains("topsecret"));
    }
}
