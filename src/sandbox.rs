//! In-process stand-ins for the game contract, the relayer and the wallet.
//!
//! The chain keeps every account's state in plaintext and hands out opaque
//! handles for it; the relayer resolves those handles only for requests
//! carrying a signature the wallet actually produced. Fault knobs let tests
//! reproduce budget exhaustion, relayer outages, rejected prompts and an
//! underfunded prize pool.
use crate::{
    clock::{
        Clock,
        SystemClock,
    },
    error::{
        LedgerError,
        RelayerError,
        SignerError,
    },
    ledger::{
        ClearValue,
        Eip712Payload,
        GameLedger,
        Relayer,
        TypedDataSigner,
        UserDecryptRequest,
    },
    lock,
    types::{
        Address,
        ConfidentialHandle,
        DecryptionKeypair,
        EncryptedInput,
        EncryptedUserBundle,
        LeaderboardEntry,
        LedgerEvent,
        SECONDS_PER_DAY,
        SpinOutcomeEvent,
        StateChanged,
        TxReceipt,
        TxStatus,
    },
    wheel::Prize,
};
use async_trait::async_trait;
use rand::{
    Rng,
    SeedableRng,
    rngs::StdRng,
};
use sha2::{
    Digest,
    Sha256,
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
    },
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::debug;

pub const DAILY_CHECK_IN_GM: u64 = 10;
pub const SPIN_PRICE_GM: u64 = 10;
pub const ERROR_NOT_ENOUGH_GM: u64 = 1;
pub const ERROR_ALREADY_CHECKED_IN: u64 = 2;
pub const ERROR_NO_SPINS: u64 = 3;

const SCORE_BY_SLOT: [u64; 8] = [100, 50, 0, 0, 0, 5, 15, 30];

/// Plaintext view of one sandbox account.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SandboxAccount {
    pub spins: u64,
    pub gm: u64,
    pub pending_eth_wei: u64,
    pub last_slot: Option<u8>,
    pub score: u64,
    pub version: u64,
    pub last_check_in_day: u64,
    pub unsettled_slot: Option<u8>,
    pub error_code: u64,
    pub error_at: u64,
}

#[derive(Clone, Debug)]
struct AccountHandles {
    spins: ConfidentialHandle,
    gm: ConfidentialHandle,
    pending_eth_wei: ConfidentialHandle,
    score: ConfidentialHandle,
    error_code: ConfidentialHandle,
}

impl Default for AccountHandles {
    fn default() -> Self {
        Self {
            spins: ConfidentialHandle::zero(),
            gm: ConfidentialHandle::zero(),
            pending_eth_wei: ConfidentialHandle::zero(),
            score: ConfidentialHandle::zero(),
            error_code: ConfidentialHandle::zero(),
        }
    }
}

#[derive(Default)]
struct Faults {
    exhaust_next_spin: bool,
    omit_next_outcome: bool,
    forced_slot: Option<u8>,
}

struct ChainState {
    contract: Address,
    rng: StdRng,
    accounts: HashMap<Address, SandboxAccount>,
    handles: HashMap<Address, AccountHandles>,
    ciphertexts: HashMap<ConfidentialHandle, u64>,
    published: Vec<LeaderboardEntry>,
    pool_wei: u128,
    next_tx: u64,
    latency: Duration,
    faults: Faults,
    version_reads: usize,
    bundle_reads: usize,
}

impl ChainState {
    fn encrypt(&mut self, value: u64) -> ConfidentialHandle {
        let handle = ConfidentialHandle::from_bytes(self.rng.random::<[u8; 32]>());
        self.ciphertexts.insert(handle.clone(), value);
        handle
    }

    fn next_tx_hash(&mut self) -> String {
        self.next_tx += 1;
        format!("0x{:064x}", self.next_tx)
    }

    fn account_mut(&mut self, account: &Address) -> &mut SandboxAccount {
        self.accounts.entry(*account).or_default()
    }

    /// Re-encrypts the account's fields and bumps its version.
    fn commit_account(&mut self, account: &Address) -> StateChanged {
        let state = {
            let entry = self.account_mut(account);
            entry.version += 1;
            entry.clone()
        };
        let handles = AccountHandles {
            spins: self.encrypt(state.spins),
            gm: self.encrypt(state.gm),
            pending_eth_wei: self.encrypt(state.pending_eth_wei),
            score: self.encrypt(state.score),
            error_code: self.encrypt(state.error_code),
        };
        self.handles.insert(*account, handles);
        StateChanged {
            account: *account,
            version: state.version,
        }
    }

    fn receipt(&mut self, status: TxStatus, logs: Vec<LedgerEvent>) -> TxReceipt {
        TxReceipt {
            tx_hash: self.next_tx_hash(),
            status,
            logs,
        }
    }
}

/// Shared sandbox network. Clones observe the same chain.
#[derive(Clone)]
pub struct SandboxChain {
    state: Arc<Mutex<ChainState>>,
    events: broadcast::Sender<StateChanged>,
    clock: Arc<dyn Clock>,
}

impl SandboxChain {
    pub fn new(seed: u64) -> Self {
        Self::with_clock(seed, Arc::new(SystemClock))
    }

    pub fn with_clock(seed: u64, clock: Arc<dyn Clock>) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let contract = Address::new(rng.random());
        let (events, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(ChainState {
                contract,
                rng,
                accounts: HashMap::new(),
                handles: HashMap::new(),
                ciphertexts: HashMap::new(),
                published: Vec::new(),
                pool_wei: 0,
                next_tx: 0,
                latency: Duration::ZERO,
                faults: Faults::default(),
                version_reads: 0,
                bundle_reads: 0,
            })),
            events,
            clock,
        }
    }

    pub fn contract(&self) -> Address {
        lock(&self.state).contract
    }

    pub fn account(&self, account: &Address) -> SandboxAccount {
        lock(&self.state)
            .accounts
            .get(account)
            .cloned()
            .unwrap_or_default()
    }

    /// Credits spins and GM directly, as an operator top-up would.
    pub fn grant(&self, account: &Address, spins: u64, gm: u64) -> StateChanged {
        let changed = {
            let mut state = lock(&self.state);
            let entry = state.account_mut(account);
            entry.spins += spins;
            entry.gm += gm;
            state.commit_account(account)
        };
        self.notify(changed);
        changed
    }

    /// Bumps the account's version without changing its values.
    pub fn touch(&self, account: &Address) -> StateChanged {
        let changed = lock(&self.state).commit_account(account);
        self.notify(changed);
        changed
    }

    pub fn set_error(&self, account: &Address, code: u64) {
        let now = self.clock.now_unix();
        let changed = {
            let mut state = lock(&self.state);
            let entry = state.account_mut(account);
            entry.error_code = code;
            entry.error_at = now;
            state.commit_account(account)
        };
        self.notify(changed);
    }

    pub fn set_pool_balance(&self, wei: u128) {
        lock(&self.state).pool_wei = wei;
    }

    pub fn pool_balance(&self) -> u128 {
        lock(&self.state).pool_wei
    }

    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }

    /// The next commit reverts without logs.
    pub fn exhaust_next_spin(&self) {
        lock(&self.state).faults.exhaust_next_spin = true;
    }

    /// The next commit succeeds but its receipt carries no outcome log.
    pub fn omit_next_outcome(&self) {
        lock(&self.state).faults.omit_next_outcome = true;
    }

    pub fn force_next_slot(&self, slot: u8) {
        lock(&self.state).faults.forced_slot = Some(slot);
    }

    pub fn version_reads(&self) -> usize {
        lock(&self.state).version_reads
    }

    pub fn bundle_reads(&self) -> usize {
        lock(&self.state).bundle_reads
    }

    fn plaintext(&self, handle: &ConfidentialHandle) -> Option<u64> {
        if handle.is_zero() {
            return Some(0);
        }
        lock(&self.state).ciphertexts.get(handle).copied()
    }

    fn register(&self, value: u64) -> ConfidentialHandle {
        lock(&self.state).encrypt(value)
    }

    fn notify(&self, changed: StateChanged) {
        let _ = self.events.send(changed);
    }

    async fn delay(&self) {
        let latency = lock(&self.state).latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn today(&self) -> u64 {
        self.clock.now_unix() / SECONDS_PER_DAY
    }

    fn record_error(&self, account: &Address, code: u64) -> TxReceipt {
        let now = self.clock.now_unix();
        let (receipt, changed) = {
            let mut state = lock(&self.state);
            let entry = state.account_mut(account);
            entry.error_code = code;
            entry.error_at = now;
            let changed = state.commit_account(account);
            let receipt = state.receipt(
                TxStatus::Success,
                vec![
                    LedgerEvent::ErrorChanged { user: *account },
                    LedgerEvent::UserStateChanged(changed),
                ],
            );
            (receipt, changed)
        };
        self.notify(changed);
        receipt
    }

    /// Applies `apply` to the account and commits it when it returns logs.
    fn mutate<F>(&self, account: &Address, apply: F) -> TxReceipt
    where
        F: FnOnce(&mut ChainState) -> Result<Vec<LedgerEvent>, ()>,
    {
        let (receipt, changed) = {
            let mut state = lock(&self.state);
            match apply(&mut state) {
                Ok(mut logs) => {
                    let changed = state.commit_account(account);
                    logs.push(LedgerEvent::UserStateChanged(changed));
                    (state.receipt(TxStatus::Success, logs), Some(changed))
                }
                Err(()) => {
                    let receipt = state.receipt(TxStatus::Reverted, vec![LedgerEvent::ErrorChanged { user: *account }]);
                    (receipt, None)
                }
            }
        };
        if let Some(changed) = changed {
            self.notify(changed);
        }
        receipt
    }
}

#[async_trait]
impl GameLedger for SandboxChain {
    fn contract(&self) -> Address {
        SandboxChain::contract(self)
    }

    async fn state_version(&self, account: &Address) -> Result<u64, LedgerError> {
        let mut state = lock(&self.state);
        state.version_reads += 1;
        Ok(state
            .accounts
            .get(account)
            .map(|entry| entry.version)
            .unwrap_or(0))
    }

    async fn encrypted_user_bundle(
        &self,
        account: &Address,
    ) -> Result<EncryptedUserBundle, LedgerError> {
        let mut state = lock(&self.state);
        state.bundle_reads += 1;
        let handles = state.handles.get(account).cloned().unwrap_or_default();
        let last_slot = state.accounts.get(account).and_then(|entry| entry.last_slot);
        Ok(EncryptedUserBundle {
            spins: handles.spins,
            gm: handles.gm,
            pending_eth_wei: handles.pending_eth_wei,
            last_slot,
            score: handles.score,
        })
    }

    async fn last_check_in_day(&self, account: &Address) -> Result<u64, LedgerError> {
        Ok(lock(&self.state)
            .accounts
            .get(account)
            .map(|entry| entry.last_check_in_day)
            .unwrap_or(0))
    }

    async fn encrypted_pending_eth_wei(
        &self,
        account: &Address,
    ) -> Result<ConfidentialHandle, LedgerError> {
        Ok(lock(&self.state)
            .handles
            .get(account)
            .map(|handles| handles.pending_eth_wei.clone())
            .unwrap_or_else(ConfidentialHandle::zero))
    }

    async fn last_error(
        &self,
        account: &Address,
    ) -> Result<(ConfidentialHandle, u64), LedgerError> {
        let state = lock(&self.state);
        let handle = state
            .handles
            .get(account)
            .map(|handles| handles.error_code.clone())
            .unwrap_or_else(ConfidentialHandle::zero);
        let at = state
            .accounts
            .get(account)
            .map(|entry| entry.error_at)
            .unwrap_or(0);
        Ok((handle, at))
    }

    async fn contract_balance(&self) -> Result<u128, LedgerError> {
        Ok(self.pool_balance())
    }

    async fn published_range(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<LeaderboardEntry>, LedgerError> {
        let state = lock(&self.state);
        Ok(state
            .published
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn daily_gm(&self, account: &Address) -> Result<TxReceipt, LedgerError> {
        self.delay().await;
        let today = self.today();
        if self.account(account).last_check_in_day >= today {
            return Ok(self.record_error(account, ERROR_ALREADY_CHECKED_IN));
        }
        let now = self.clock.now_unix();
        let user = *account;
        Ok(self.mutate(account, |state| {
            let entry = state.account_mut(&user);
            entry.gm += DAILY_CHECK_IN_GM;
            entry.last_check_in_day = today;
            entry.error_code = 0;
            Ok(vec![LedgerEvent::CheckInCompleted {
                user,
                timestamp: now,
            }])
        }))
    }

    async fn buy_spins_with_gm(
        &self,
        account: &Address,
        count: u64,
    ) -> Result<TxReceipt, LedgerError> {
        self.delay().await;
        let cost = count.saturating_mul(SPIN_PRICE_GM);
        if self.account(account).gm < cost {
            return Ok(self.record_error(account, ERROR_NOT_ENOUGH_GM));
        }
        let user = *account;
        Ok(self.mutate(account, |state| {
            let entry = state.account_mut(&user);
            entry.gm -= cost;
            entry.spins += count;
            entry.error_code = 0;
            Ok(vec![LedgerEvent::SpinBoughtWithGm { user, count }])
        }))
    }

    async fn buy_gm_tokens(
        &self,
        account: &Address,
        input: &EncryptedInput,
        value_wei: u128,
    ) -> Result<TxReceipt, LedgerError> {
        self.delay().await;
        let Some(amount) = input.handles.first().and_then(|handle| self.plaintext(handle))
        else {
            return Err(LedgerError::Reverted("unknown encrypted input".into()));
        };
        let user = *account;
        Ok(self.mutate(account, |state| {
            state.pool_wei += value_wei;
            let entry = state.account_mut(&user);
            entry.gm += amount;
            Ok(vec![LedgerEvent::GmTokensBought { user }])
        }))
    }

    async fn spin_lite(&self, account: &Address) -> Result<TxReceipt, LedgerError> {
        self.delay().await;
        {
            let mut state = lock(&self.state);
            if std::mem::take(&mut state.faults.exhaust_next_spin) {
                debug!(%account, "sandbox spin exhausted the operation budget");
                return Ok(state.receipt(TxStatus::Reverted, Vec::new()));
            }
        }
        if self.account(account).spins == 0 {
            return Ok(self.record_error(account, ERROR_NO_SPINS));
        }
        let user = *account;
        Ok(self.mutate(account, |state| {
            let slot = match state.faults.forced_slot.take() {
                Some(slot) => slot,
                None => state.rng.random_range(0..8u8),
            };
            let prize = Prize::for_slot(slot);
            let entry = state.account_mut(&user);
            entry.spins -= 1;
            entry.last_slot = Some(slot);
            entry.unsettled_slot = Some(slot);
            if std::mem::take(&mut state.faults.omit_next_outcome) {
                return Ok(Vec::new());
            }
            Ok(vec![LedgerEvent::SpinOutcome(SpinOutcomeEvent {
                user,
                slot,
                prize_wei: prize.fixed_payout_wei().unwrap_or(0),
                gm_delta: prize.gm_reward(),
            })])
        }))
    }

    async fn settle_prize(&self, account: &Address, slot: u8) -> Result<TxReceipt, LedgerError> {
        self.delay().await;
        let user = *account;
        Ok(self.mutate(account, |state| {
            let prize = Prize::for_slot(slot);
            let payout = prize.fixed_payout_wei().unwrap_or(0);
            if state.account_mut(&user).unsettled_slot != Some(slot) || state.pool_wei < payout {
                return Err(());
            }
            state.pool_wei -= payout;
            let entry = state.account_mut(&user);
            entry.unsettled_slot = None;
            entry.pending_eth_wei += payout as u64;
            entry.gm += prize.gm_reward();
            entry.score += SCORE_BY_SLOT.get(slot as usize).copied().unwrap_or(0);
            Ok(Vec::new())
        }))
    }

    async fn request_claim_eth(
        &self,
        account: &Address,
        amount_wei: u64,
    ) -> Result<TxReceipt, LedgerError> {
        self.delay().await;
        let user = *account;
        Ok(self.mutate(account, |state| {
            if state.account_mut(&user).pending_eth_wei < amount_wei
                || state.pool_wei < u128::from(amount_wei)
            {
                return Err(());
            }
            state.pool_wei -= u128::from(amount_wei);
            state.account_mut(&user).pending_eth_wei -= amount_wei;
            Ok(vec![LedgerEvent::ClaimRequested { user, amount_wei }])
        }))
    }

    async fn publish_score(&self, account: &Address, score: u64) -> Result<TxReceipt, LedgerError> {
        self.delay().await;
        let mut state = lock(&self.state);
        state.published.retain(|entry| entry.address != *account);
        state.published.push(LeaderboardEntry {
            address: *account,
            score,
        });
        Ok(state.receipt(TxStatus::Success, Vec::new()))
    }

    async fn unpublish_score(&self, account: &Address) -> Result<TxReceipt, LedgerError> {
        self.delay().await;
        let mut state = lock(&self.state);
        state.published.retain(|entry| entry.address != *account);
        Ok(state.receipt(TxStatus::Success, Vec::new()))
    }

    fn subscribe_state_changes(&self) -> broadcast::Receiver<StateChanged> {
        self.events.subscribe()
    }
}

fn signature_for(account: &Address, payload: &Eip712Payload) -> String {
    let mut hasher = Sha256::new();
    hasher.update(account.as_bytes());
    hasher.update(payload.digest());
    format!("0x{}", hex::encode(hasher.finalize()))
}

const PRIMARY_TYPE: &str = "UserDecryptRequestVerification";

#[derive(Clone)]
pub struct SandboxRelayer {
    chain: SandboxChain,
    calls: Arc<AtomicUsize>,
    failures: Arc<Mutex<Vec<RelayerError>>>,
}

impl SandboxRelayer {
    pub fn new(chain: SandboxChain) -> Self {
        Self {
            chain,
            calls: Arc::new(AtomicUsize::new(0)),
            failures: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of `user_decrypt` calls that reached the relayer.
    pub fn decrypt_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The next `user_decrypt` call fails with `status`.
    pub fn fail_next(&self, status: u16) {
        lock(&self.failures).push(RelayerError::Status {
            status,
            message: format!("sandbox relayer returned {status}"),
        });
    }
}

#[async_trait]
impl Relayer for SandboxRelayer {
    fn generate_keypair(&self) -> Result<DecryptionKeypair, RelayerError> {
        let mut rng = rand::rng();
        Ok(DecryptionKeypair {
            public_key: hex::encode(rng.random::<[u8; 32]>()),
            private_key: hex::encode(rng.random::<[u8; 32]>()),
        })
    }

    fn create_eip712(
        &self,
        public_key: &str,
        contracts: &[Address],
        window_start: u64,
        window_length_days: u32,
    ) -> Result<Eip712Payload, RelayerError> {
        Ok(Eip712Payload {
            primary_type: PRIMARY_TYPE.to_string(),
            public_key: public_key.to_string(),
            contracts: contracts.to_vec(),
            window_start,
            window_length_days,
        })
    }

    async fn user_decrypt(
        &self,
        request: UserDecryptRequest,
    ) -> Result<HashMap<ConfidentialHandle, ClearValue>, RelayerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.chain.delay().await;
        if let Some(failure) = lock(&self.failures).pop() {
            return Err(failure);
        }
        let payload = self.create_eip712(
            &request.keypair.public_key,
            &request.contracts,
            request.window_start,
            request.window_length_days,
        )?;
        let expected = signature_for(&request.account, &payload);
        if expected.trim_start_matches("0x") != request.signature {
            return Err(RelayerError::Status {
                status: 403,
                message: "signature does not match request".into(),
            });
        }
        let mut values = HashMap::new();
        for (handle, contract) in request.pairs {
            if !request.contracts.contains(&contract) {
                continue;
            }
            if let Some(value) = self.chain.plaintext(&handle) {
                values.insert(handle, ClearValue::Wide(u128::from(value)));
            }
        }
        Ok(values)
    }

    async fn encrypt_u64(
        &self,
        contract: &Address,
        account: &Address,
        value: u64,
    ) -> Result<EncryptedInput, RelayerError> {
        let handle = self.chain.register(value);
        let mut hasher = Sha256::new();
        hasher.update(contract.as_bytes());
        hasher.update(account.as_bytes());
        hasher.update(handle.as_str().as_bytes());
        Ok(EncryptedInput {
            handles: vec![handle],
            input_proof: format!("0x{}", hex::encode(hasher.finalize())),
        })
    }
}

#[derive(Clone)]
pub struct SandboxSigner {
    address: Address,
    prompts: Arc<AtomicUsize>,
    reject_next: Arc<AtomicBool>,
}

impl SandboxSigner {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            prompts: Arc::new(AtomicUsize::new(0)),
            reject_next: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn reject_next(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TypedDataSigner for SandboxSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_typed_data(&self, payload: &Eip712Payload) -> Result<String, SignerError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if self.reject_next.swap(false, Ordering::SeqCst) {
            return Err(SignerError::Rejected);
        }
        Ok(signature_for(&self.address, payload))
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::types::WEI_PER_ETH;

    fn user() -> Address {
        Address::repeat_byte(0x11)
    }

    #[tokio::test]
    async fn spin_lite__emits_outcome_and_consumes_a_spin() {
        // given
        let chain = SandboxChain::new(1);
        chain.grant(&user(), 1, 0);
        chain.force_next_slot(6);

        // when
        let receipt = chain.spin_lite(&user()).await.unwrap();

        // then
        let outcome = receipt.spin_outcome_for(&user()).unwrap();
        assert_eq!(outcome.slot, 6);
        assert_eq!(outcome.gm_delta, 15);
        assert_eq!(chain.account(&user()).spins, 0);
        assert_eq!(chain.account(&user()).unsettled_slot, Some(6));
    }

    #[tokio::test]
    async fn spin_lite__without_spins_records_error_code() {
        let chain = SandboxChain::new(1);

        let receipt = chain.spin_lite(&user()).await.unwrap();

        assert!(receipt.succeeded());
        assert!(receipt.spin_outcome_for(&user()).is_none());
        assert_eq!(chain.account(&user()).error_code, ERROR_NO_SPINS);
    }

    #[tokio::test]
    async fn settle_prize__reverts_when_pool_cannot_cover_fixed_payout() {
        // given
        let chain = SandboxChain::new(1);
        chain.grant(&user(), 1, 0);
        chain.force_next_slot(0);
        chain.spin_lite(&user()).await.unwrap();
        chain.set_pool_balance(WEI_PER_ETH / 100);

        // when
        let receipt = chain.settle_prize(&user(), 0).await.unwrap();

        // then
        assert_eq!(receipt.status, TxStatus::Reverted);
        assert_eq!(chain.account(&user()).pending_eth_wei, 0);
    }

    #[tokio::test]
    async fn every_mutation__bumps_version_and_notifies() {
        // given
        let chain = SandboxChain::new(1);
        let mut events = chain.subscribe_state_changes();

        // when
        chain.grant(&user(), 0, 20);
        chain.buy_spins_with_gm(&user(), 2).await.unwrap();

        // then
        assert_eq!(events.recv().await.unwrap().version, 1);
        assert_eq!(events.recv().await.unwrap().version, 2);
        assert_eq!(chain.account(&user()).spins, 2);
    }

    #[tokio::test]
    async fn user_decrypt__rejects_foreign_signatures() {
        // given
        let chain = SandboxChain::new(1);
        chain.grant(&user(), 3, 0);
        let relayer = SandboxRelayer::new(chain.clone());
        let bundle = chain.encrypted_user_bundle(&user()).await.unwrap();
        let keypair = relayer.generate_keypair().unwrap();

        // when
        let result = relayer
            .user_decrypt(UserDecryptRequest {
                pairs: vec![(bundle.spins, chain.contract())],
                keypair,
                signature: "00".into(),
                contracts: vec![chain.contract()],
                account: user(),
                window_start: 0,
                window_length_days: 10,
            })
            .await;

        // then
        assert!(matches!(result, Err(RelayerError::Status { status: 403, .. })));
    }
}
