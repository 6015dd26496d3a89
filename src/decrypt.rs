//! Opportunistic user-decryption through the relayer.
//!
//! Decryption never prompts: without a cached authorization the gateway
//! simply returns nothing for the affected handles. One batch is in flight
//! at a time and a short client-wide cooldown follows transient relayer
//! failures.
use crate::{
    auth::AuthorizationSessionManager,
    config::DecryptPolicy,
    ledger::{
        Relayer,
        UserDecryptRequest,
    },
    lock,
    types::{
        Address,
        ConfidentialHandle,
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
    collections::{
        BTreeMap,
        BTreeSet,
        HashMap,
    },
    sync::{
        Arc,
        Mutex,
    },
};
use tokio::time::Instant;
use tracing::{
    debug,
    warn,
};

pub type DecryptedValues = HashMap<ConfidentialHandle, u64>;

type RequestKey = BTreeSet<(ConfidentialHandle, Address)>;
type SharedBatch = Shared<BoxFuture<'static, DecryptedValues>>;

#[derive(Clone)]
pub struct DecryptionGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    relayer: Arc<dyn Relayer>,
    auth: AuthorizationSessionManager,
    policy: DecryptPolicy,
    state: Mutex<GatewayState>,
}

#[derive(Default)]
struct GatewayState {
    in_flight: Option<InFlight>,
    cooldown_until: Option<Instant>,
    next_batch_id: u64,
}

struct InFlight {
    id: u64,
    key: RequestKey,
    batch: SharedBatch,
}

enum Step {
    Join(SharedBatch),
    WaitFor(SharedBatch),
    Done,
}

impl DecryptionGateway {
    pub fn new(
        relayer: Arc<dyn Relayer>,
        auth: AuthorizationSessionManager,
        policy: DecryptPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                relayer,
                auth,
                policy,
                state: Mutex::new(GatewayState::default()),
            }),
        }
    }

    pub fn is_cooling_down(&self) -> bool {
        let state = lock(&self.inner.state);
        state
            .cooldown_until
            .is_some_and(|until| until > Instant::now())
    }

    /// Returns `None` when the value could not be decrypted right now.
    pub async fn decrypt_one(
        &self,
        handle: &ConfidentialHandle,
        contract: &Address,
    ) -> Option<u64> {
        let values = self
            .decrypt_batch(&[(handle.clone(), *contract)])
            .await;
        values.get(handle).copied()
    }

    /// Zero and malformed handles always map to `0`. Other handles are
    /// present only if the relayer returned them.
    pub async fn decrypt_batch(
        &self,
        pairs: &[(ConfidentialHandle, Address)],
    ) -> DecryptedValues {
        let mut values = DecryptedValues::new();
        let mut key = RequestKey::new();
        for (handle, contract) in pairs {
            if handle.needs_decryption() {
                key.insert((handle.clone(), *contract));
            } else {
                if !handle.is_well_formed() {
                    debug!(%handle, "treating malformed handle as zero");
                }
                values.insert(handle.clone(), 0);
            }
        }
        if key.is_empty() {
            return values;
        }

        loop {
            let step = {
                let mut state = lock(&self.inner.state);
                if let Some(in_flight) = &state.in_flight {
                    if in_flight.key == key {
                        Step::Join(in_flight.batch.clone())
                    } else {
                        Step::WaitFor(in_flight.batch.clone())
                    }
                } else if state
                    .cooldown_until
                    .is_some_and(|until| until > Instant::now())
                {
                    debug!("decryption cooling down; skipping batch");
                    Step::Done
                } else {
                    match self.inner.clone().start_batch(&mut state, key.clone()) {
                        Some(batch) => Step::Join(batch),
                        None => Step::Done,
                    }
                }
            };
            match step {
                Step::Join(batch) => {
                    values.extend(batch.await);
                    return values;
                }
                Step::WaitFor(batch) => {
                    let _ = batch.await;
                }
                Step::Done => return values,
            }
        }
    }
}

impl GatewayInner {
    /// Groups the request per contract and starts one shared batch covering
    /// every contract that has cached credentials.
    fn start_batch(
        self: Arc<Self>,
        state: &mut GatewayState,
        key: RequestKey,
    ) -> Option<SharedBatch> {
        let mut per_contract: BTreeMap<Address, Vec<ConfidentialHandle>> = BTreeMap::new();
        for (handle, contract) in &key {
            per_contract.entry(*contract).or_default().push(handle.clone());
        }

        let account = self.auth.account();
        let mut requests = Vec::new();
        for (contract, handles) in per_contract {
            let Some((artifact, keypair)) = self.auth.peek_credentials(&contract) else {
                debug!(%contract, "no cached authorization; skipping decryption");
                continue;
            };
            requests.push(UserDecryptRequest {
                pairs: handles.into_iter().map(|h| (h, contract)).collect(),
                keypair,
                signature: artifact.signature,
                contracts: vec![contract],
                account,
                window_start: artifact.window_start,
                window_length_days: artifact.window_length_days,
            });
        }
        if requests.is_empty() {
            return None;
        }

        let id = state.next_batch_id;
        state.next_batch_id += 1;
        let inner = self.clone();
        let batch = async move {
            let values = inner.run(requests).await;
            let mut state = lock(&inner.state);
            if state.in_flight.as_ref().is_some_and(|f| f.id == id) {
                state.in_flight = None;
            }
            values
        }
        .boxed()
        .shared();
        state.in_flight = Some(InFlight {
            id,
            key,
            batch: batch.clone(),
        });
        tokio::spawn(batch.clone());
        Some(batch)
    }

    async fn run(&self, requests: Vec<UserDecryptRequest>) -> DecryptedValues {
        let mut values = DecryptedValues::new();
        for request in requests {
            let contract = request.contracts.first().copied();
            let requested: BTreeSet<ConfidentialHandle> =
                request.pairs.iter().map(|(h, _)| h.clone()).collect();
            match self.relayer.user_decrypt(request).await {
                Ok(clear) => {
                    for (handle, value) in clear {
                        if requested.contains(&handle) {
                            values.insert(handle, value.to_u64_lossy());
                        }
                    }
                }
                Err(err) => {
                    warn!(%err, "user decryption failed");
                    if err.is_transient() {
                        let until = Instant::now() + self.policy.cooldown();
                        lock(&self.state).cooldown_until = Some(until);
                    }
                    if err.is_server_error()
                        && let Some(contract) = contract
                        && let Err(invalidate_err) = self.auth.invalidate(&contract)
                    {
                        warn!(%invalidate_err, "failed to drop stale authorization");
                    }
                    if err.is_transient() {
                        break;
                    }
                }
            }
        }
        values
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        clock::ManualClock,
        config::AuthPolicy,
        ledger::GameLedger,
        sandbox::{
            SandboxChain,
            SandboxRelayer,
            SandboxSigner,
        },
        store::PersistentKeyStore,
    };
    use std::time::Duration;

    struct Fixture {
        chain: SandboxChain,
        relayer: SandboxRelayer,
        auth: AuthorizationSessionManager,
        gateway: DecryptionGateway,
        account: Address,
    }

    fn fixture() -> Fixture {
        let chain = SandboxChain::new(3);
        let relayer = SandboxRelayer::new(chain.clone());
        let account = Address::repeat_byte(0x42);
        let auth = AuthorizationSessionManager::new(
            Arc::new(relayer.clone()),
            Arc::new(SandboxSigner::new(account)),
            PersistentKeyStore::in_memory(),
            Arc::new(ManualClock::new(1_700_000_000)),
            AuthPolicy::default(),
        );
        let gateway =
            DecryptionGateway::new(Arc::new(relayer.clone()), auth.clone(), DecryptPolicy::default());
        Fixture {
            chain,
            relayer,
            auth,
            gateway,
            account,
        }
    }

    async fn spins_handle(f: &Fixture) -> ConfidentialHandle {
        f.chain.encrypted_user_bundle(&f.account).await.unwrap().spins
    }

    #[tokio::test(start_paused = true)]
    async fn decrypt_batch__zero_and_malformed_handles_skip_the_relayer() {
        // given
        let f = fixture();
        let contract = f.chain.contract();
        let malformed = ConfidentialHandle::new("0x1234");

        // when
        let values = f
            .gateway
            .decrypt_batch(&[(ConfidentialHandle::zero(), contract), (malformed.clone(), contract)])
            .await;

        // then
        assert_eq!(values.get(&ConfidentialHandle::zero()), Some(&0));
        assert_eq!(values.get(&malformed), Some(&0));
        assert_eq!(f.relayer.decrypt_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn decrypt_batch__without_authorization_returns_nothing() {
        // given
        let f = fixture();
        f.chain.grant(&f.account, 4, 0);
        let handle = spins_handle(&f).await;

        // when
        let values = f.gateway.decrypt_batch(&[(handle, f.chain.contract())]).await;

        // then
        assert!(values.is_empty());
        assert_eq!(f.relayer.decrypt_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn decrypt_one__reads_authorized_value() {
        // given
        let f = fixture();
        f.chain.grant(&f.account, 4, 0);
        f.auth.acquire(f.chain.contract()).await.unwrap();
        let handle = spins_handle(&f).await;

        // when
        let value = f.gateway.decrypt_one(&handle, &f.chain.contract()).await;

        // then
        assert_eq!(value, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn decrypt_batch__concurrent_identical_requests_share_one_call() {
        // given
        let f = fixture();
        f.chain.grant(&f.account, 4, 0);
        f.chain.set_latency(Duration::from_millis(200));
        f.auth.acquire(f.chain.contract()).await.unwrap();
        let pairs = vec![(spins_handle(&f).await, f.chain.contract())];

        // when
        let (a, b) = tokio::join!(f.gateway.decrypt_batch(&pairs), f.gateway.decrypt_batch(&pairs));

        // then
        assert_eq!(a, b);
        assert_eq!(f.relayer.decrypt_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn decrypt_batch__server_error_engages_cooldown_and_drops_authorization() {
        // given
        let f = fixture();
        f.chain.grant(&f.account, 4, 0);
        f.auth.acquire(f.chain.contract()).await.unwrap();
        let pairs = vec![(spins_handle(&f).await, f.chain.contract())];
        f.relayer.fail_next(500);

        // when
        let failed = f.gateway.decrypt_batch(&pairs).await;
        let during_cooldown = f.gateway.decrypt_batch(&pairs).await;

        // then
        assert!(failed.is_empty());
        assert!(during_cooldown.is_empty());
        assert!(f.gateway.is_cooling_down());
        assert_eq!(f.relayer.decrypt_calls(), 1);
        assert!(f.auth.peek_cached(&f.chain.contract()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn decrypt_batch__rate_limit_cools_down_but_keeps_authorization() {
        // given
        let f = fixture();
        f.chain.grant(&f.account, 4, 0);
        f.auth.acquire(f.chain.contract()).await.unwrap();
        let pairs = vec![(spins_handle(&f).await, f.chain.contract())];
        f.relayer.fail_next(429);

        // when
        f.gateway.decrypt_batch(&pairs).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        let after_cooldown = f.gateway.decrypt_batch(&pairs).await;

        // then
        assert_eq!(after_cooldown.values().copied().collect::<Vec<_>>(), vec![4]);
        assert_eq!(f.relayer.decrypt_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn decrypt_batch__cooldown_skips_the_relayer_while_authorized() {
        // given
        let f = fixture();
        f.chain.grant(&f.account, 4, 0);
        f.auth.acquire(f.chain.contract()).await.unwrap();
        let pairs = vec![(spins_handle(&f).await, f.chain.contract())];
        f.relayer.fail_next(429);
        f.gateway.decrypt_batch(&pairs).await;

        // when
        let during_cooldown = f.gateway.decrypt_batch(&pairs).await;

        // then
        assert!(during_cooldown.is_empty());
        assert!(f.gateway.is_cooling_down());
        assert!(f.auth.peek_cached(&f.chain.contract()).is_some());
        assert_eq!(f.relayer.decrypt_calls(), 1);
    }
}
