//! The explicitly constructed service context that owns every component of
//! one signed-in account and exposes the account actions.
use crate::{
    auth::AuthorizationSessionManager,
    clock::Clock,
    config::SessionConfig,
    decrypt::DecryptionGateway,
    error::{
        GameError,
        LedgerError,
    },
    leaderboard::Leaderboard,
    ledger::{
        GameLedger,
        OutcomeAnimator,
        Relayer,
        TypedDataSigner,
    },
    lock,
    play::{
        PlayEvent,
        PlayReport,
        PlayState,
        SpinSettlement,
        TxGate,
    },
    store::PersistentKeyStore,
    sync::StateSyncEngine,
    types::{
        Address,
        AuthorizationArtifact,
        ConfidentialHandle,
        LastErrorReport,
        LeaderboardEntry,
        PendingPlayOutcome,
        SECONDS_PER_DAY,
        TxReceipt,
        UserGameState,
        WEI_PER_ETH,
    },
    wheel::WheelLayout,
};
use chrono::DateTime;
use std::{
    future::Future,
    sync::{
        Arc,
        Mutex,
    },
};
use tokio::{
    sync::{
        broadcast,
        watch,
    },
    task::JoinHandle,
};
use tracing::{
    info,
    warn,
};

/// Everything a session is built from.
pub struct SessionParts {
    pub ledger: Arc<dyn GameLedger>,
    pub relayer: Arc<dyn Relayer>,
    pub signer: Arc<dyn TypedDataSigner>,
    pub store: PersistentKeyStore,
    pub animator: Arc<dyn OutcomeAnimator>,
    pub clock: Arc<dyn Clock>,
    pub config: SessionConfig,
}

pub fn last_error_message(code: u64) -> String {
    match code {
        1 => "Not enough GM to buy spin".into(),
        2 => "Already checked in today".into(),
        3 => "No spins available".into(),
        other => format!("FHE error code: {other}"),
    }
}

pub struct GameSession {
    account: Address,
    ledger: Arc<dyn GameLedger>,
    relayer: Arc<dyn Relayer>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    auth: AuthorizationSessionManager,
    gateway: DecryptionGateway,
    sync: StateSyncEngine,
    leaderboard: Leaderboard,
    play: SpinSettlement,
    gate: TxGate,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl GameSession {
    pub fn new(parts: SessionParts) -> Self {
        let SessionParts {
            ledger,
            relayer,
            signer,
            store,
            animator,
            clock,
            config,
        } = parts;
        let account = signer.address();
        let auth = AuthorizationSessionManager::new(
            relayer.clone(),
            signer,
            store.clone(),
            clock.clone(),
            config.auth.clone(),
        );
        let gateway =
            DecryptionGateway::new(relayer.clone(), auth.clone(), config.decrypt.clone());
        let sync = StateSyncEngine::new(ledger.clone(), gateway.clone(), config.sync.clone());
        let leaderboard = Leaderboard::new(ledger.clone(), config.leaderboard.page_size);
        let gate = TxGate::default();
        let play = SpinSettlement::new(
            ledger.clone(),
            sync.clone(),
            leaderboard.clone(),
            animator,
            store,
            WheelLayout::default(),
            config.play.clone(),
            gate.clone(),
        );
        Self {
            account,
            ledger,
            relayer,
            clock,
            config,
            auth,
            gateway,
            sync,
            leaderboard,
            play,
            gate,
            reconciler: Mutex::new(None),
        }
    }

    pub fn account(&self) -> Address {
        self.account
    }

    pub fn contract(&self) -> Address {
        self.ledger.contract()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn sync(&self) -> &StateSyncEngine {
        &self.sync
    }

    pub fn auth(&self) -> &AuthorizationSessionManager {
        &self.auth
    }

    pub fn gateway(&self) -> &DecryptionGateway {
        &self.gateway
    }

    /// Activates the account, subscribes to its state notifications and
    /// loads whatever can be read without prompting.
    pub async fn start(&self) -> Option<UserGameState> {
        self.sync.set_account(Some(self.account));
        let handle = self
            .sync
            .spawn_reconciler(self.ledger.subscribe_state_changes());
        if let Some(previous) = lock(&self.reconciler).replace(handle) {
            previous.abort();
        }
        info!(account = %self.account, contract = %self.contract(), "session started");
        if let Ok(Some(pending)) = self.pending_settlement() {
            warn!(slot = pending.slot, "found unsettled play from a previous session");
        }
        self.sync.reload(true, false).await
    }

    pub fn shutdown(&self) {
        if let Some(handle) = lock(&self.reconciler).take() {
            handle.abort();
        }
        self.sync.set_account(None);
        info!(account = %self.account, "session stopped");
    }

    /// Explicit user action: may prompt the wallet for a signature.
    pub async fn authorize(&self) -> Result<AuthorizationArtifact, GameError> {
        let artifact = self.auth.acquire(self.contract()).await?;
        self.sync.reload(true, true).await;
        Ok(artifact)
    }

    pub fn has_cached_authorization(&self) -> bool {
        self.auth.peek_cached(&self.contract()).is_some()
    }

    /// Generates a fresh keypair; decryption stays unavailable until the
    /// next `authorize`.
    pub fn reset_keypair(&self) -> Result<String, GameError> {
        let keypair = self.auth.reset_keypair(&[self.contract()])?;
        Ok(keypair.public_key)
    }

    pub fn snapshot(&self) -> Option<UserGameState> {
        self.sync.snapshot()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<Option<UserGameState>> {
        self.sync.subscribe()
    }

    pub async fn refresh(&self) -> Option<UserGameState> {
        self.sync.reload(true, false).await
    }

    pub fn play_state(&self) -> PlayState {
        self.play.state()
    }

    pub fn subscribe_play_events(&self) -> broadcast::Receiver<PlayEvent> {
        self.play.subscribe_events()
    }

    pub fn is_transaction_pending(&self) -> bool {
        self.gate.is_busy()
    }

    pub async fn play(&self) -> Result<PlayReport, GameError> {
        self.play.play(&self.account).await
    }

    pub fn pending_settlement(&self) -> Result<Option<PendingPlayOutcome>, GameError> {
        self.play.pending_settlement(&self.account)
    }

    pub async fn resume_settlement(&self) -> Result<PlayReport, GameError> {
        self.play.resume_settlement(&self.account).await
    }

    /// Eligible once per UTC day.
    pub async fn daily_check_in(&self) -> Result<TxReceipt, GameError> {
        let _permit = self.gate.try_begin()?;
        let today = self.clock.now_unix() / SECONDS_PER_DAY;
        let last = self.ledger.last_check_in_day(&self.account).await?;
        if today <= last {
            return Err(GameError::AlreadyCheckedIn);
        }
        self.transact("check-in", self.ledger.daily_gm(&self.account))
            .await
    }

    pub async fn buy_spins_with_gm(&self, count: u64) -> Result<TxReceipt, GameError> {
        let _permit = self.gate.try_begin()?;
        if count == 0 {
            return Err(GameError::InvalidAmount(
                "spin count must be positive".into(),
            ));
        }
        let required = count.saturating_mul(self.config.economy.gm_per_spin);
        if let Some(snapshot) = self.snapshot()
            && snapshot.gm < required
        {
            return Err(GameError::InsufficientGm {
                required,
                available: snapshot.gm,
            });
        }
        self.transact(
            "buy spins",
            self.ledger.buy_spins_with_gm(&self.account, count),
        )
        .await
    }

    /// Converts `eth_wei` at the configured rate and submits the GM amount
    /// as an encrypted input with the ETH attached.
    pub async fn buy_gm_tokens(&self, eth_wei: u128) -> Result<TxReceipt, GameError> {
        let _permit = self.gate.try_begin()?;
        let gm = eth_wei
            .checked_mul(u128::from(self.config.economy.gm_per_eth))
            .map(|scaled| scaled / WEI_PER_ETH)
            .and_then(|gm| u64::try_from(gm).ok())
            .ok_or_else(|| GameError::InvalidAmount("amount is too large".into()))?;
        if gm == 0 {
            return Err(GameError::InvalidAmount(
                "amount is too small to buy any GM".into(),
            ));
        }
        let contract = self.contract();
        let input = self
            .relayer
            .encrypt_u64(&contract, &self.account, gm)
            .await?;
        info!(gm, eth_wei, "buying GM tokens");
        self.transact(
            "buy GM",
            self.ledger.buy_gm_tokens(&self.account, &input, eth_wei),
        )
        .await
    }

    /// Claims `amount_wei`, or the whole pending balance when `None`.
    pub async fn claim_eth(&self, amount_wei: Option<u128>) -> Result<TxReceipt, GameError> {
        let _permit = self.gate.try_begin()?;
        let handle = self
            .ledger
            .encrypted_pending_eth_wei(&self.account)
            .await?;
        let pending = self.read_confidential(&handle).await?;
        if pending == 0 {
            return Err(GameError::NothingToClaim);
        }
        let requested = match amount_wei {
            Some(amount) => u64::try_from(amount).map_err(|_| GameError::ExceedsPending {
                requested: u64::MAX,
                available: pending,
            })?,
            None => pending,
        };
        if requested == 0 {
            return Err(GameError::InvalidAmount("claim amount must be positive".into()));
        }
        if requested > pending {
            return Err(GameError::ExceedsPending {
                requested,
                available: pending,
            });
        }
        let available = self.ledger.contract_balance().await?;
        if available < u128::from(requested) {
            return Err(GameError::InsufficientPoolBalance {
                required: u128::from(requested),
                available,
            });
        }
        self.transact(
            "claim",
            self.ledger.request_claim_eth(&self.account, requested),
        )
        .await
    }

    /// Reads the contract's encrypted error side channel; `None` when clear.
    pub async fn last_error(&self) -> Result<Option<LastErrorReport>, GameError> {
        let (handle, timestamp) = self.ledger.last_error(&self.account).await?;
        let code = self.read_confidential(&handle).await?;
        if code == 0 {
            return Ok(None);
        }
        let at = i64::try_from(timestamp)
            .ok()
            .filter(|ts| *ts > 0)
            .and_then(|ts| DateTime::from_timestamp(ts, 0));
        Ok(Some(LastErrorReport {
            code,
            message: last_error_message(code),
            at,
        }))
    }

    pub fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        self.leaderboard.entries()
    }

    pub async fn refresh_leaderboard(&self) -> Result<Vec<LeaderboardEntry>, GameError> {
        Ok(self.leaderboard.refresh().await?)
    }

    /// Publishes the current decrypted score.
    pub async fn publish_score(&self) -> Result<u64, GameError> {
        let _permit = self.gate.try_begin()?;
        let score = self.snapshot().ok_or(GameError::StateUnavailable)?.score;
        self.transact("publish", self.ledger.publish_score(&self.account, score))
            .await?;
        self.leaderboard
            .set_published_score(self.account, Some(score));
        self.refresh_leaderboard_quietly().await;
        Ok(score)
    }

    pub async fn unpublish_score(&self) -> Result<TxReceipt, GameError> {
        let _permit = self.gate.try_begin()?;
        let receipt = self
            .transact("unpublish", self.ledger.unpublish_score(&self.account))
            .await?;
        self.leaderboard.set_published_score(self.account, None);
        self.refresh_leaderboard_quietly().await;
        Ok(receipt)
    }

    async fn refresh_leaderboard_quietly(&self) {
        if let Err(err) = self.leaderboard.refresh().await {
            warn!(%err, "leaderboard refresh failed");
        }
    }

    /// Decrypts one value, distinguishing "not authorized" from "relayer
    /// unavailable".
    async fn read_confidential(&self, handle: &ConfidentialHandle) -> Result<u64, GameError> {
        let contract = self.contract();
        if handle.needs_decryption() && !self.has_cached_authorization() {
            return Err(GameError::NotAuthorized);
        }
        self.gateway
            .decrypt_one(handle, &contract)
            .await
            .ok_or(GameError::StateUnavailable)
    }

    /// Awaits the submission, reconciles, then classifies the receipt.
    async fn transact<F>(&self, stage: &'static str, submit: F) -> Result<TxReceipt, GameError>
    where
        F: Future<Output = Result<TxReceipt, LedgerError>>,
    {
        let result = submit.await;
        self.sync.reload(true, true).await;
        let receipt = result?;
        if !receipt.succeeded() {
            warn!(stage, tx = %receipt.tx_hash, "transaction reverted");
            return Err(GameError::Reverted {
                stage,
                tx_hash: receipt.tx_hash,
            });
        }
        info!(stage, tx = %receipt.tx_hash, "transaction confirmed");
        Ok(receipt)
    }
}

impl Drop for GameSession {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.reconciler).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn last_error_message__maps_known_codes() {
        assert_eq!(last_error_message(1), "Not enough GM to buy spin");
        assert_eq!(last_error_message(2), "Already checked in today");
        assert_eq!(last_error_message(3), "No spins available");
        assert_eq!(last_error_message(9), "FHE error code: 9");
    }
}
