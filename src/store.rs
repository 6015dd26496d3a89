//! Typed key/value persistence for the decryption keypair, authorization
//! artifacts and unsettled play outcomes.
use crate::{
    error::StoreError,
    lock,
    types::{
        Address,
        AuthorizationArtifact,
        DecryptionKeypair,
        PendingPlayOutcome,
    },
};
use serde::{
    Deserialize,
    Serialize,
    de::DeserializeOwned,
};
use sha2::{
    Digest,
    Sha256,
};
use sled::{
    Config,
    Tree,
};
use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc,
        Mutex,
    },
};

const KEYPAIR_KEY: &str = "keypair";
const TREE_NAME: &str = "fhe_spin_keystore";

pub trait KeyValueBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        lock(&self.entries).insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

#[derive(Clone)]
pub struct SledBackend {
    tree: Tree,
}

impl SledBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Config::default().path(path).open()?;
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { tree })
    }
}

impl KeyValueBackend for SledBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tree.get(key.as_bytes())?.map(|value| value.to_vec()))
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.tree.insert(key.as_bytes(), value)?;
        self.tree.flush()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.tree.remove(key.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }
}

/// A cached value with an optional unix-seconds expiry.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Entry<T> {
    pub value: T,
    pub expires_at: Option<u64>,
}

impl<T> Entry<T> {
    pub fn permanent(value: T) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    pub fn expiring(value: T, expires_at: u64) -> Self {
        Self {
            value,
            expires_at: Some(expires_at),
        }
    }

    pub fn is_live(&self, now: u64) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Cache key for an authorization artifact: (account, contract, public key).
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ArtifactKey {
    pub account: Address,
    pub contract: Address,
    public_key_fingerprint: String,
}

impl ArtifactKey {
    pub fn new(account: Address, contract: Address, public_key: &str) -> Self {
        let digest = Sha256::digest(public_key.as_bytes());
        Self {
            account,
            contract,
            public_key_fingerprint: hex::encode(&digest[..12]),
        }
    }

    pub fn storage_key(&self) -> String {
        format!(
            "udsig:{}:{}:{}",
            self.account, self.contract, self.public_key_fingerprint
        )
    }
}

fn pending_key(account: &Address, contract: &Address) -> String {
    format!("pending:{account}:{contract}")
}

#[derive(Clone)]
pub struct PersistentKeyStore {
    backend: Arc<dyn KeyValueBackend>,
}

impl PersistentKeyStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn open_sled<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(SledBackend::open(path)?)))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Entry<T>>, StoreError> {
        let Some(bytes) = self.backend.get(key)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| StoreError::Codec {
                key: key.to_string(),
                message: err.to_string(),
            })
    }

    pub fn set<T: Serialize>(&self, key: &str, entry: &Entry<T>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(entry).map_err(|err| StoreError::Codec {
            key: key.to_string(),
            message: err.to_string(),
        })?;
        self.backend.put(key, bytes)
    }

    pub fn invalidate(&self, key: &str) -> Result<(), StoreError> {
        self.backend.remove(key)
    }

    /// Returns the entry only while it is live; expired entries are removed.
    pub fn get_live<T: DeserializeOwned>(
        &self,
        key: &str,
        now: u64,
    ) -> Result<Option<T>, StoreError> {
        match self.get::<T>(key)? {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value)),
            Some(_) => {
                self.invalidate(key)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn keypair(&self) -> Result<Option<DecryptionKeypair>, StoreError> {
        Ok(self
            .get::<DecryptionKeypair>(KEYPAIR_KEY)?
            .map(|entry| entry.value))
    }

    pub fn set_keypair(&self, keypair: &DecryptionKeypair) -> Result<(), StoreError> {
        self.set(KEYPAIR_KEY, &Entry::permanent(keypair))
    }

    pub fn clear_keypair(&self) -> Result<(), StoreError> {
        self.invalidate(KEYPAIR_KEY)
    }

    pub fn artifact(
        &self,
        key: &ArtifactKey,
        now: u64,
    ) -> Result<Option<AuthorizationArtifact>, StoreError> {
        self.get_live(&key.storage_key(), now)
    }

    pub fn set_artifact(
        &self,
        key: &ArtifactKey,
        artifact: &AuthorizationArtifact,
    ) -> Result<(), StoreError> {
        self.set(
            &key.storage_key(),
            &Entry::expiring(artifact, artifact.expires_at),
        )
    }

    pub fn invalidate_artifact(&self, key: &ArtifactKey) -> Result<(), StoreError> {
        self.invalidate(&key.storage_key())
    }

    pub fn pending_outcome(
        &self,
        account: &Address,
        contract: &Address,
    ) -> Result<Option<PendingPlayOutcome>, StoreError> {
        Ok(self
            .get::<PendingPlayOutcome>(&pending_key(account, contract))?
            .map(|entry| entry.value))
    }

    pub fn set_pending_outcome(
        &self,
        account: &Address,
        contract: &Address,
        outcome: &PendingPlayOutcome,
    ) -> Result<(), StoreError> {
        self.set(&pending_key(account, contract), &Entry::permanent(outcome))
    }

    pub fn clear_pending_outcome(
        &self,
        account: &Address,
        contract: &Address,
    ) -> Result<(), StoreError> {
        self.invalidate(&pending_key(account, contract))
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    fn artifact(contract: Address, public_key: &str, expires_at: u64) -> AuthorizationArtifact {
        AuthorizationArtifact {
            signature: "abcd".into(),
            window_start: 0,
            window_length_days: 10,
            contract,
            public_key: public_key.into(),
            expires_at,
        }
    }

    #[test]
    fn artifact__expired_entries_are_dropped_on_read() {
        // given
        let store = PersistentKeyStore::in_memory();
        let account = Address::repeat_byte(1);
        let contract = Address::repeat_byte(2);
        let key = ArtifactKey::new(account, contract, "pk");
        store.set_artifact(&key, &artifact(contract, "pk", 100)).unwrap();

        // when
        let live = store.artifact(&key, 99).unwrap();
        let expired = store.artifact(&key, 100).unwrap();
        let after = store.get::<AuthorizationArtifact>(&key.storage_key()).unwrap();

        // then
        assert!(live.is_some());
        assert!(expired.is_none());
        assert!(after.is_none());
    }

    #[test]
    fn artifact_key__differs_per_contract_and_public_key() {
        let account = Address::repeat_byte(1);
        let a = ArtifactKey::new(account, Address::repeat_byte(2), "pk");
        let b = ArtifactKey::new(account, Address::repeat_byte(3), "pk");
        let c = ArtifactKey::new(account, Address::repeat_byte(2), "pk2");
        assert_ne!(a.storage_key(), b.storage_key());
        assert_ne!(a.storage_key(), c.storage_key());
    }

    #[test]
    fn pending_outcome__set_then_clear() {
        // given
        let store = PersistentKeyStore::in_memory();
        let account = Address::repeat_byte(1);
        let contract = Address::repeat_byte(2);
        let outcome = PendingPlayOutcome { slot: 6, gm_delta: 15 };

        // when
        store.set_pending_outcome(&account, &contract, &outcome).unwrap();
        let stored = store.pending_outcome(&account, &contract).unwrap();
        store.clear_pending_outcome(&account, &contract).unwrap();

        // then
        assert_eq!(stored, Some(outcome));
        assert_eq!(store.pending_outcome(&account, &contract).unwrap(), None);
    }

    #[test]
    fn sled_backend__survives_reopen() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let keypair = DecryptionKeypair {
            public_key: "pub".into(),
            private_key: "priv".into(),
        };
        {
            let store = PersistentKeyStore::open_sled(dir.path()).unwrap();
            store.set_keypair(&keypair).unwrap();
        }

        // when
        let reopened = PersistentKeyStore::open_sled(dir.path()).unwrap();

        // then
        assert_eq!(reopened.keypair().unwrap(), Some(keypair));
    }

    #[test]
    fn get__reports_codec_errors_with_key() {
        let backend = MemoryBackend::new();
        backend.put("broken", b"not json".to_vec()).unwrap();
        let store = PersistentKeyStore::new(Arc::new(backend));

        let err = store.get::<DecryptionKeypair>("broken").unwrap_err();

        assert!(matches!(err, StoreError::Codec { ref key, .. } if key == "broken"));
    }
}
