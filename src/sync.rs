//! Reconciles the account's confidential state into a plaintext snapshot.
//!
//! Reloads are throttled and single-flight. The ledger's per-account
//! version counter lets a reload skip decryption entirely while the state
//! is unchanged and the snapshot is still fresh, and published snapshots
//! never move backwards in version.
use crate::{
    config::SyncPolicy,
    decrypt::DecryptionGateway,
    ledger::GameLedger,
    lock,
    types::{
        Address,
        ConfidentialHandle,
        StateChanged,
        UserGameState,
    },
};
use futures::{
    FutureExt,
    future::{
        BoxFuture,
        Shared,
    },
};
use std::sync::{
    Arc,
    Mutex,
};
use tokio::{
    sync::{
        broadcast::{
            self,
            error::RecvError,
        },
        watch,
    },
    task::JoinHandle,
    time::{
        Instant,
        sleep_until,
    },
};
use tracing::{
    debug,
    info,
    warn,
};

/// Reactive reloads that still trail the notified version are retried this
/// many times before giving up until the next notification.
const MAX_RECONCILE_ATTEMPTS: u32 = 3;

type SharedReload = Shared<BoxFuture<'static, Option<UserGameState>>>;

#[derive(Clone)]
pub struct StateSyncEngine {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    ledger: Arc<dyn GameLedger>,
    gateway: DecryptionGateway,
    policy: SyncPolicy,
    state: Mutex<SyncState>,
    snapshot: watch::Sender<Option<UserGameState>>,
}

#[derive(Default)]
struct SyncState {
    account: Option<Address>,
    generation: u64,
    in_flight: Option<(u64, SharedReload)>,
    next_reload_id: u64,
    last_reload_at: Option<Instant>,
    last_synced: Option<(u64, Instant)>,
}

struct PendingReconcile {
    target: u64,
    deadline: Instant,
    attempts: u32,
}

impl StateSyncEngine {
    pub fn new(
        ledger: Arc<dyn GameLedger>,
        gateway: DecryptionGateway,
        policy: SyncPolicy,
    ) -> Self {
        let (snapshot, _) = watch::channel(None);
        Self {
            inner: Arc::new(SyncInner {
                ledger,
                gateway,
                policy,
                state: Mutex::new(SyncState::default()),
                snapshot,
            }),
        }
    }

    pub fn account(&self) -> Option<Address> {
        lock(&self.inner.state).account
    }

    /// Switches the active account, discarding everything synced so far.
    pub fn set_account(&self, account: Option<Address>) {
        let mut state = lock(&self.inner.state);
        if state.account == account {
            return;
        }
        *state = SyncState {
            account,
            generation: state.generation + 1,
            next_reload_id: state.next_reload_id,
            ..SyncState::default()
        };
        self.inner.snapshot.send_replace(None);
    }

    pub fn snapshot(&self) -> Option<UserGameState> {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<UserGameState>> {
        self.inner.snapshot.subscribe()
    }

    pub fn synced_version(&self) -> Option<u64> {
        lock(&self.inner.state).last_synced.map(|(version, _)| version)
    }

    /// Returns the newest snapshot, or `None` without an active account or
    /// before anything could be decrypted.
    pub async fn reload(
        &self,
        bypass_throttle: bool,
        bypass_cache: bool,
    ) -> Option<UserGameState> {
        let reload = {
            let mut state = lock(&self.inner.state);
            let account = state.account?;
            if let Some((_, in_flight)) = &state.in_flight {
                debug!("joining in-flight reload");
                in_flight.clone()
            } else if !bypass_throttle
                && state
                    .last_reload_at
                    .is_some_and(|at| at.elapsed() < self.inner.policy.min_reload_interval())
            {
                debug!("reload throttled");
                return self.snapshot();
            } else {
                self.inner
                    .clone()
                    .start_reload(&mut state, account, bypass_cache)
            }
        };
        reload.await
    }

    /// Debounces `UserStateChanged` notifications for the active account into
    /// a single reload per burst.
    pub fn spawn_reconciler(
        &self,
        mut events: broadcast::Receiver<StateChanged>,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        let debounce = self.inner.policy.notification_debounce();
        tokio::spawn(async move {
            let mut pending: Option<PendingReconcile> = None;
            loop {
                let deadline = pending.as_ref().map(|p| p.deadline);
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(changed) => {
                            if engine.account() != Some(changed.account)
                                || engine.synced_version().is_some_and(|v| v >= changed.version)
                            {
                                continue;
                            }
                            debug!(version = changed.version, "state change notified");
                            let target = pending
                                .as_ref()
                                .map_or(changed.version, |p| p.target.max(changed.version));
                            pending = Some(PendingReconcile {
                                target,
                                deadline: Instant::now() + debounce,
                                attempts: 0,
                            });
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "missed state change notifications");
                            pending = Some(PendingReconcile {
                                target: pending.as_ref().map_or(0, |p| p.target),
                                deadline: Instant::now() + debounce,
                                attempts: 0,
                            });
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        let Some(due) = pending.take() else {
                            continue;
                        };
                        let reached = engine
                            .reload(false, true)
                            .await
                            .is_some_and(|snapshot| snapshot.version >= due.target);
                        if !reached && due.attempts + 1 < MAX_RECONCILE_ATTEMPTS {
                            pending = Some(PendingReconcile {
                                target: due.target,
                                deadline: Instant::now() + debounce,
                                attempts: due.attempts + 1,
                            });
                        }
                    }
                }
            }
            debug!("state change stream closed; reconciler stopped");
        })
    }
}

impl SyncInner {
    fn start_reload(
        self: Arc<Self>,
        state: &mut SyncState,
        account: Address,
        bypass_cache: bool,
    ) -> SharedReload {
        let id = state.next_reload_id;
        state.next_reload_id += 1;
        let generation = state.generation;
        let inner = self.clone();
        let reload = async move {
            let result = inner.fetch(account, generation, bypass_cache).await;
            let mut state = lock(&inner.state);
            if state.in_flight.as_ref().is_some_and(|(current, _)| *current == id) {
                state.in_flight = None;
            }
            if state.generation == generation {
                state.last_reload_at = Some(Instant::now());
            }
            result
        }
        .boxed()
        .shared();
        state.in_flight = Some((id, reload.clone()));
        tokio::spawn(reload.clone());
        reload
    }

    fn is_fresh(&self, version: u64) -> bool {
        lock(&self.state).last_synced.is_some_and(|(synced, at)| {
            synced == version && at.elapsed() < self.policy.freshness_ttl()
        })
    }

    async fn fetch(
        &self,
        account: Address,
        generation: u64,
        bypass_cache: bool,
    ) -> Option<UserGameState> {
        let current = self.snapshot.borrow().clone();

        if !bypass_cache && current.is_some() {
            match self.ledger.state_version(&account).await {
                Ok(version) if self.is_fresh(version) => {
                    debug!(version, "state version unchanged; reusing snapshot");
                    return current;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "failed to read state version");
                    return current;
                }
            }
        }

        let (version, bundle) = match futures::try_join!(
            self.ledger.state_version(&account),
            self.ledger.encrypted_user_bundle(&account),
        ) {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(%err, "failed to fetch encrypted state");
                return current;
            }
        };

        let contract = self.ledger.contract();
        let pairs = [
            (bundle.spins.clone(), contract),
            (bundle.gm.clone(), contract),
            (bundle.pending_eth_wei.clone(), contract),
            (bundle.score.clone(), contract),
        ];
        let values = self.gateway.decrypt_batch(&pairs).await;
        let read = |handle: &ConfidentialHandle| values.get(handle).copied();
        let (Some(spins), Some(gm), Some(pending_eth_wei), Some(score)) = (
            read(&bundle.spins),
            read(&bundle.gm),
            read(&bundle.pending_eth_wei),
            read(&bundle.score),
        ) else {
            debug!(version, "confidential values unavailable; keeping previous snapshot");
            return current;
        };

        self.publish(
            generation,
            UserGameState {
                spins,
                gm,
                pending_eth_wei,
                last_slot: bundle.last_slot,
                score,
                version,
            },
        )
    }

    fn publish(&self, generation: u64, next: UserGameState) -> Option<UserGameState> {
        let mut state = lock(&self.state);
        let current = self.snapshot.borrow().clone();
        if state.generation != generation {
            return current;
        }
        if let Some(existing) = &current
            && existing.version > next.version
        {
            debug!(
                published = existing.version,
                fetched = next.version,
                "discarding stale reload"
            );
            return current;
        }
        state.last_synced = Some((next.version, Instant::now()));
        info!(
            version = next.version,
            spins = next.spins,
            gm = next.gm,
            "state snapshot updated"
        );
        self.snapshot.send_replace(Some(next.clone()));
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        auth::AuthorizationSessionManager,
        clock::ManualClock,
        config::{
            AuthPolicy,
            DecryptPolicy,
        },
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
        engine: StateSyncEngine,
        account: Address,
    }

    async fn fixture() -> Fixture {
        let chain = SandboxChain::new(9);
        let relayer = SandboxRelayer::new(chain.clone());
        let account = Address::repeat_byte(0x21);
        let auth = AuthorizationSessionManager::new(
            Arc::new(relayer.clone()),
            Arc::new(SandboxSigner::new(account)),
            PersistentKeyStore::in_memory(),
            Arc::new(ManualClock::new(1_700_000_000)),
            AuthPolicy::default(),
        );
        auth.acquire(chain.contract()).await.unwrap();
        let gateway =
            DecryptionGateway::new(Arc::new(relayer.clone()), auth, DecryptPolicy::default());
        let engine = StateSyncEngine::new(Arc::new(chain.clone()), gateway, SyncPolicy::default());
        engine.set_account(Some(account));
        Fixture {
            chain,
            relayer,
            engine,
            account,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reload__without_account_returns_none() {
        let f = fixture().await;
        f.engine.set_account(None);
        assert!(f.engine.reload(true, true).await.is_none());
        assert_eq!(f.chain.version_reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reload__unchanged_version_within_ttl_skips_decryption() {
        // given
        let f = fixture().await;
        f.chain.grant(&f.account, 2, 30);

        // when
        let first = f.engine.reload(true, false).await.unwrap();
        let second = f.engine.reload(true, false).await.unwrap();

        // then
        assert_eq!(first, second);
        assert_eq!(first.spins, 2);
        assert_eq!(first.gm, 30);
        assert_eq!(f.relayer.decrypt_calls(), 1);
        assert_eq!(f.chain.bundle_reads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reload__stale_after_ttl_decrypts_again() {
        // given
        let f = fixture().await;
        f.chain.grant(&f.account, 2, 0);
        f.engine.reload(true, false).await.unwrap();

        // when
        tokio::time::sleep(Duration::from_secs(121)).await;
        f.engine.reload(true, false).await.unwrap();

        // then
        assert_eq!(f.relayer.decrypt_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reload__concurrent_calls_share_one_fetch() {
        // given
        let f = fixture().await;
        f.chain.grant(&f.account, 1, 0);
        f.chain.set_latency(Duration::from_millis(300));

        // when
        let (a, b) = tokio::join!(f.engine.reload(true, true), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            f.engine.reload(true, true).await
        });

        // then
        assert_eq!(a, b);
        assert_eq!(f.relayer.decrypt_calls(), 1);
        assert_eq!(f.chain.bundle_reads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reload__throttled_call_returns_last_snapshot() {
        // given
        let f = fixture().await;
        f.chain.grant(&f.account, 1, 0);
        let first = f.engine.reload(true, true).await;
        f.chain.grant(&f.account, 1, 0);

        // when
        let throttled = f.engine.reload(false, true).await;

        // then
        assert_eq!(first, throttled);
        assert_eq!(f.relayer.decrypt_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reload__versions_never_decrease() {
        // given
        let f = fixture().await;
        let mut versions = Vec::new();

        // when
        for round in 0..5 {
            f.chain.grant(&f.account, round, 0);
            if let Some(snapshot) = f.engine.reload(true, round % 2 == 0).await {
                versions.push(snapshot.version);
            }
        }

        // then
        assert!(versions.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(versions.last().copied(), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn reload__undecryptable_state_keeps_previous_snapshot() {
        // given
        let f = fixture().await;
        f.chain.grant(&f.account, 1, 0);
        let before = f.engine.reload(true, true).await;
        f.chain.grant(&f.account, 1, 0);
        f.relayer.fail_next(500);

        // when
        let after = f.engine.reload(true, true).await;

        // then
        assert_eq!(before, after);
        assert_eq!(f.engine.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn reconciler__coalesces_a_burst_into_one_batch() {
        // given
        let f = fixture().await;
        let handle = f.engine.spawn_reconciler(f.chain.subscribe_state_changes());

        // when
        for _ in 0..3 {
            f.chain.grant(&f.account, 1, 0);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        // then
        assert_eq!(f.relayer.decrypt_calls(), 1);
        assert_eq!(f.engine.snapshot().map(|s| s.spins), Some(3));
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn reconciler__ignores_other_accounts() {
        // given
        let f = fixture().await;
        let handle = f.engine.spawn_reconciler(f.chain.subscribe_state_changes());

        // when
        f.chain.grant(&Address::repeat_byte(0x99), 1, 0);
        tokio::time::sleep(Duration::from_secs(2)).await;

        // then
        assert_eq!(f.chain.bundle_reads(), 0);
        handle.abort();
    }
}
