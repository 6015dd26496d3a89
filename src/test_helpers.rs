use crate::{
    clock::ManualClock,
    config::SessionConfig,
    ledger::OutcomeAnimator,
    sandbox::{
        SandboxChain,
        SandboxRelayer,
        SandboxSigner,
    },
    session::{
        GameSession,
        SessionParts,
    },
    store::PersistentKeyStore,
    types::{
        Address,
        WEI_PER_ETH,
    },
    wheel::TimedAnimator,
};
use std::sync::Arc;

/// 2023-11-14T22:13:20Z
pub const TEST_NOW: u64 = 1_700_000_000;
pub const TEST_SEED: u64 = 17;

/// A session for `alice` wired to a fresh sandbox network, with a manual
/// clock and an in-memory key store.
pub struct TestContext {
    chain: SandboxChain,
    relayer: SandboxRelayer,
    signer: SandboxSigner,
    clock: ManualClock,
    store: PersistentKeyStore,
    config: SessionConfig,
    session: Arc<GameSession>,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let clock = ManualClock::new(TEST_NOW);
        let chain = SandboxChain::with_clock(TEST_SEED, Arc::new(clock.clone()));
        chain.set_pool_balance(WEI_PER_ETH);
        let relayer = SandboxRelayer::new(chain.clone());
        let signer = SandboxSigner::new(Self::alice());
        let store = PersistentKeyStore::in_memory();
        let animator = Arc::new(TimedAnimator::new(config.play.animation()));
        let session = build_session(&chain, &relayer, &signer, &clock, &store, &config, animator);
        Self {
            chain,
            relayer,
            signer,
            clock,
            store,
            config,
            session,
        }
    }

    pub fn alice() -> Address {
        Address::repeat_byte(0xa1)
    }

    pub fn bob() -> Address {
        Address::repeat_byte(0xb0)
    }

    pub fn chain(&self) -> &SandboxChain {
        &self.chain
    }

    pub fn relayer(&self) -> &SandboxRelayer {
        &self.relayer
    }

    pub fn signer(&self) -> &SandboxSigner {
        &self.signer
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn store(&self) -> &PersistentKeyStore {
        &self.store
    }

    pub fn session(&self) -> Arc<GameSession> {
        self.session.clone()
    }

    /// Replaces the session with a fresh one over the same chain and store,
    /// as if the client had been restarted.
    pub fn restart(&mut self) -> Arc<GameSession> {
        self.restart_with_animator(Arc::new(TimedAnimator::new(self.config.play.animation())))
    }

    pub fn restart_with_animator(&mut self, animator: Arc<dyn OutcomeAnimator>) -> Arc<GameSession> {
        self.session.shutdown();
        self.session = build_session(
            &self.chain,
            &self.relayer,
            &self.signer,
            &self.clock,
            &self.store,
            &self.config,
            animator,
        );
        self.session.clone()
    }

    /// Starts the session and authorizes decryption for the game contract.
    pub async fn start_authorized(&self) -> Arc<GameSession> {
        self.session.start().await;
        self.session
            .authorize()
            .await
            .expect("sandbox authorization succeeds");
        self.session.clone()
    }
}

fn build_session(
    chain: &SandboxChain,
    relayer: &SandboxRelayer,
    signer: &SandboxSigner,
    clock: &ManualClock,
    store: &PersistentKeyStore,
    config: &SessionConfig,
    animator: Arc<dyn OutcomeAnimator>,
) -> Arc<GameSession> {
    Arc::new(GameSession::new(SessionParts {
        ledger: Arc::new(chain.clone()),
        relayer: Arc::new(relayer.clone()),
        signer: Arc::new(signer.clone()),
        store: store.clone(),
        animator,
        clock: Arc::new(clock.clone()),
        config: config.clone(),
    }))
}
