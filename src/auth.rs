//! Acquisition and caching of the signed grant that lets the local keypair
//! decrypt one contract's confidential values.
use crate::{
    clock::Clock,
    config::AuthPolicy,
    error::{
        AuthorizationError,
        StoreError,
    },
    ledger::{
        Relayer,
        TypedDataSigner,
    },
    lock,
    store::{
        ArtifactKey,
        PersistentKeyStore,
    },
    types::{
        Address,
        AuthorizationArtifact,
        DecryptionKeypair,
        SECONDS_PER_DAY,
    },
};
use futures::{
    FutureExt,
    future::{
        BoxFuture,
        Shared,
    },
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
    },
};
use tokio::time::Instant;
use tracing::{
    debug,
    info,
    warn,
};

type SharedAcquire = Shared<BoxFuture<'static, Result<AuthorizationArtifact, AuthorizationError>>>;

/// Start of the UTC day containing `now`.
pub fn window_start(now: u64) -> u64 {
    now / SECONDS_PER_DAY * SECONDS_PER_DAY
}

pub fn window_expiry(window_start: u64, window_length_days: u32, margin_secs: u64) -> u64 {
    (window_start + u64::from(window_length_days) * SECONDS_PER_DAY).saturating_sub(margin_secs)
}

fn strip_hex_prefix(signature: &str) -> &str {
    signature
        .strip_prefix("0x")
        .or_else(|| signature.strip_prefix("0X"))
        .unwrap_or(signature)
}

#[derive(Clone)]
pub struct AuthorizationSessionManager {
    inner: Arc<AuthInner>,
}

struct AuthInner {
    relayer: Arc<dyn Relayer>,
    signer: Arc<dyn TypedDataSigner>,
    store: PersistentKeyStore,
    clock: Arc<dyn Clock>,
    policy: AuthPolicy,
    keypair: Mutex<Option<DecryptionKeypair>>,
    next_prompt_at: Mutex<Option<Instant>>,
    in_flight: Mutex<HashMap<String, SharedAcquire>>,
}

impl AuthorizationSessionManager {
    pub fn new(
        relayer: Arc<dyn Relayer>,
        signer: Arc<dyn TypedDataSigner>,
        store: PersistentKeyStore,
        clock: Arc<dyn Clock>,
        policy: AuthPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(AuthInner {
                relayer,
                signer,
                store,
                clock,
                policy,
                keypair: Mutex::new(None),
                next_prompt_at: Mutex::new(None),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn account(&self) -> Address {
        self.inner.signer.address()
    }

    /// Loads the persisted keypair, generating and persisting one if absent.
    pub fn ensure_keypair(&self) -> Result<DecryptionKeypair, AuthorizationError> {
        if let Some(keypair) = lock(&self.inner.keypair).clone() {
            return Ok(keypair);
        }
        let keypair = match self.inner.store.keypair()? {
            Some(stored) => stored,
            None => {
                let generated = self.inner.relayer.generate_keypair()?;
                self.inner.store.set_keypair(&generated)?;
                info!("generated new decryption keypair");
                generated
            }
        };
        *lock(&self.inner.keypair) = Some(keypair.clone());
        Ok(keypair)
    }

    /// Returns a usable artifact for `contract`, prompting the wallet for a
    /// signature only when nothing usable is cached.
    pub async fn acquire(
        &self,
        contract: Address,
    ) -> Result<AuthorizationArtifact, AuthorizationError> {
        let keypair = self.ensure_keypair()?;
        let key = ArtifactKey::new(self.account(), contract, &keypair.public_key);
        let now = self.inner.clock.now_unix();
        if let Some(artifact) = self.inner.cached(&key, &keypair, now)? {
            return Ok(artifact);
        }

        let shared = {
            let mut in_flight = lock(&self.inner.in_flight);
            let storage_key = key.storage_key();
            match in_flight.get(&storage_key) {
                Some(existing) => {
                    debug!(%contract, "joining in-flight authorization request");
                    existing.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let cleanup_key = storage_key.clone();
                    let fut = async move {
                        let result = inner.clone().prompt(key, keypair).await;
                        lock(&inner.in_flight).remove(&cleanup_key);
                        result
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(storage_key, fut.clone());
                    tokio::spawn(fut.clone());
                    fut
                }
            }
        };
        shared.await
    }

    /// Never prompts and never generates a keypair.
    pub fn peek_cached(&self, contract: &Address) -> Option<AuthorizationArtifact> {
        self.peek_credentials(contract).map(|(artifact, _)| artifact)
    }

    pub fn peek_credentials(
        &self,
        contract: &Address,
    ) -> Option<(AuthorizationArtifact, DecryptionKeypair)> {
        let keypair = match self.known_keypair() {
            Ok(Some(keypair)) => keypair,
            Ok(None) => return None,
            Err(err) => {
                warn!(%err, "failed to read decryption keypair");
                return None;
            }
        };
        let key = ArtifactKey::new(self.account(), *contract, &keypair.public_key);
        let now = self.inner.clock.now_unix();
        match self.inner.cached(&key, &keypair, now) {
            Ok(Some(artifact)) => Some((artifact, keypair)),
            Ok(None) => None,
            Err(err) => {
                warn!(%err, %contract, "failed to read cached authorization");
                None
            }
        }
    }

    /// Drops the cached artifact for `contract` under the current keypair.
    pub fn invalidate(&self, contract: &Address) -> Result<(), AuthorizationError> {
        if let Some(keypair) = self.known_keypair()? {
            let key = ArtifactKey::new(self.account(), *contract, &keypair.public_key);
            self.inner.store.invalidate_artifact(&key)?;
            info!(%contract, "invalidated cached authorization");
        }
        Ok(())
    }

    /// Replaces the keypair. Artifacts for `contracts` are dropped; any other
    /// artifact is keyed by the old public key and can no longer match.
    pub fn reset_keypair(
        &self,
        contracts: &[Address],
    ) -> Result<DecryptionKeypair, AuthorizationError> {
        for contract in contracts {
            self.invalidate(contract)?;
        }
        *lock(&self.inner.keypair) = None;
        self.inner.store.clear_keypair()?;
        let keypair = self.ensure_keypair()?;
        info!("decryption keypair reset");
        Ok(keypair)
    }

    fn known_keypair(&self) -> Result<Option<DecryptionKeypair>, AuthorizationError> {
        if let Some(keypair) = lock(&self.inner.keypair).clone() {
            return Ok(Some(keypair));
        }
        let stored = self.inner.store.keypair()?;
        if let Some(keypair) = &stored {
            *lock(&self.inner.keypair) = Some(keypair.clone());
        }
        Ok(stored)
    }
}

impl AuthInner {
    fn cached(
        &self,
        key: &ArtifactKey,
        keypair: &DecryptionKeypair,
        now: u64,
    ) -> Result<Option<AuthorizationArtifact>, AuthorizationError> {
        let stored = match self.store.artifact(key, now) {
            Ok(stored) => stored,
            Err(err @ StoreError::Codec { .. }) => {
                warn!(%err, contract = %key.contract, "discarding unreadable cached authorization");
                self.store.invalidate_artifact(key)?;
                None
            }
            Err(err) => return Err(err.into()),
        };
        Ok(stored.filter(|artifact| artifact.is_usable_for(&key.contract, &keypair.public_key, now)))
    }

    /// Waits out the minimum interval since the previous prompt, reserving
    /// the next slot before sleeping so concurrent prompts queue up.
    async fn throttle(&self) {
        let wake_at = {
            let mut next = lock(&self.next_prompt_at);
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.policy.min_prompt_interval());
            slot
        };
        if wake_at > Instant::now() {
            debug!("throttling signature prompt");
            tokio::time::sleep_until(wake_at).await;
        }
    }

    async fn prompt(
        self: Arc<Self>,
        key: ArtifactKey,
        keypair: DecryptionKeypair,
    ) -> Result<AuthorizationArtifact, AuthorizationError> {
        self.throttle().await;

        let now = self.clock.now_unix();
        if let Some(artifact) = self.cached(&key, &keypair, now)? {
            return Ok(artifact);
        }

        let contract = key.contract;
        let start = window_start(now);
        let days = self.policy.window_length_days;
        let payload = self
            .relayer
            .create_eip712(&keypair.public_key, &[contract], start, days)?;

        info!(%contract, window_start = start, days, "requesting decryption authorization");
        let signature = self.signer.sign_typed_data(&payload).await?;

        let artifact = AuthorizationArtifact {
            signature: strip_hex_prefix(&signature).to_string(),
            window_start: start,
            window_length_days: days,
            contract,
            public_key: keypair.public_key.clone(),
            expires_at: window_expiry(start, days, self.policy.expiry_margin_secs),
        };
        self.store.set_artifact(&key, &artifact)?;
        info!(%contract, expires_at = artifact.expires_at, "decryption authorized");
        Ok(artifact)
    }
}
