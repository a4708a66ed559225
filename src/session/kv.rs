//! Remote key-value transport for cluster session storage.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("remote store unavailable: {0}")]
    Unavailable(String),
}

/// Minimal object store: one opaque value per key, grouped in a partition.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Partition (namespace) this store operates in.
    fn partition(&self) -> &str;

    /// Create a new object. Fails with `AlreadyExists` rather than overwrite.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Delete an object. Returns `false` when it did not exist.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Every object in the partition.
    async fn list(&self) -> Result<Vec<(String, Vec<u8>)>, KvError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────────────────

/// Process-local store, for tests and single-replica development setups.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    partition: String,
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    pub fn new(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    fn partition(&self) -> &str {
        &self.partition
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        let mut objects = self.objects.write().await;
        if objects.contains_key(key) {
            return Err(KvError::AlreadyExists(key.to_string()));
        }
        objects.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.objects.write().await.remove(key).is_some())
    }

    async fn list(&self) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let objects = self.objects.read().await;
        let mut items: Vec<_> = objects
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(items)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Kubernetes Secrets
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(feature = "kubernetes")]
mod kube_store {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use k8s_openapi::{ByteString, api::core::v1::Secret};
    use kube::{
        Client,
        api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams},
    };

    use super::{KeyValueStore, KvError};

    const SECRET_NAME_PREFIX: &str = "fwd-auth-session-";
    const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
    const MANAGED_BY_VALUE: &str = "forward-auth";
    const DATA_KEY: &str = "session";
    const LIST_PAGE_SIZE: u32 = 500;

    /// One Secret per session in a single namespace.
    pub struct KubeSecretStore {
        api: Api<Secret>,
        namespace: String,
    }

    impl KubeSecretStore {
        pub fn new(client: Client, namespace: &str) -> Self {
            Self {
                api: Api::namespaced(client, namespace),
                namespace: namespace.to_string(),
            }
        }

        fn secret_name(key: &str) -> String {
            format!("{SECRET_NAME_PREFIX}{key}")
        }

        fn secret_data(secret: Secret) -> Vec<u8> {
            secret
                .data
                .and_then(|mut data| data.remove(DATA_KEY))
                .map(|bytes| bytes.0)
                .unwrap_or_default()
        }
    }

    fn unavailable(op: &str, e: kube::Error) -> KvError {
        KvError::Unavailable(format!("{op}: {e}"))
    }

    #[async_trait]
    impl KeyValueStore for KubeSecretStore {
        fn partition(&self) -> &str {
            &self.namespace
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(Self::secret_name(key)),
                    namespace: Some(self.namespace.clone()),
                    labels: Some(BTreeMap::from([(
                        MANAGED_BY_LABEL.to_string(),
                        MANAGED_BY_VALUE.to_string(),
                    )])),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([(DATA_KEY.to_string(), ByteString(value))])),
                type_: Some("Opaque".to_string()),
                ..Default::default()
            };

            match self.api.create(&PostParams::default(), &secret).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    Err(KvError::AlreadyExists(key.to_string()))
                }
                Err(e) => Err(unavailable("create secret", e)),
            }
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
            self.api
                .get_opt(&Self::secret_name(key))
                .await
                .map(|secret| secret.map(Self::secret_data))
                .map_err(|e| unavailable("get secret", e))
        }

        async fn delete(&self, key: &str) -> Result<bool, KvError> {
            match self
                .api
                .delete(&Self::secret_name(key), &DeleteParams::default())
                .await
            {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
                Err(e) => Err(unavailable("delete secret", e)),
            }
        }

        async fn list(&self) -> Result<Vec<(String, Vec<u8>)>, KvError> {
            let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
            let mut items = Vec::new();
            let mut continue_token: Option<String> = None;

            loop {
                let mut params = ListParams::default()
                    .labels(&selector)
                    .limit(LIST_PAGE_SIZE);
                if let Some(token) = &continue_token {
                    params = params.continue_token(token);
                }

                let page = self
                    .api
                    .list(&params)
                    .await
                    .map_err(|e| unavailable("list secrets", e))?;

                for secret in page.items {
                    let Some(key) = secret
                        .metadata
                        .name
                        .as_deref()
                        .and_then(|name| name.strip_prefix(SECRET_NAME_PREFIX))
                        .map(str::to_string)
                    else {
                        continue;
                    };
                    items.push((key, Self::secret_data(secret)));
                }

                continue_token = page.metadata.continue_.filter(|t| !t.is_empty());
                if continue_token.is_none() {
                    break;
                }
            }

            tracing::debug!(
                namespace = %self.namespace,
                count = items.len(),
                "Listed session secrets"
            );
            Ok(items)
        }
    }
}

#[cfg(feature = "kubernetes")]
pub use kube_store::KubeSecretStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_basics() {
        let store = MemoryKeyValueStore::new("sessions");
        assert_eq!(store.partition(), "sessions");

        store.put("a", b"one".to_vec()).await.unwrap();
        assert!(matches!(
            store.put("a", b"two".to_vec()).await,
            Err(KvError::AlreadyExists(_))
        ));
        assert_eq!(store.get("a").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get("missing").await.unwrap(), None);

        store.put("b", b"two".to_vec()).await.unwrap();
        let keys: Vec<_> = store.list().await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert_eq!(store.len().await, 1);
    }
}
