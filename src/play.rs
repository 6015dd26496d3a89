//! Two-transaction play: commit picks the outcome, settle applies it.
//!
//! The outcome is persisted as soon as the commit receipt is parsed, revealed
//! only after the animation completes, and cleared once settle succeeds.
//! Whatever happens, the play ends with a forced reload and a delayed
//! leaderboard refresh, and the machine returns to `Idle`.
use crate::{
    config::PlayPolicy,
    error::{
        FailureKind,
        GameError,
    },
    leaderboard::Leaderboard,
    ledger::{
        GameLedger,
        OutcomeAnimator,
    },
    store::PersistentKeyStore,
    sync::StateSyncEngine,
    types::{
        Address,
        PendingPlayOutcome,
        UserGameState,
    },
    wheel::{
        Prize,
        WheelLayout,
        friendly_outcome,
    },
};
use std::sync::{
    Arc,
    atomic::{
        AtomicBool,
        Ordering,
    },
};
use tokio::sync::{
    broadcast,
    watch,
};
use tracing::{
    info,
    warn,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlayState {
    Idle,
    Committing,
    AnimatingOutcome,
    Settling,
    Reconciling,
    Error(FailureKind),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PlayEvent {
    StateChanged(PlayState),
    AnimationFinished { display_index: usize },
    OutcomeRevealed { slot: u8, text: String },
    Notice(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlayReport {
    pub slot: u8,
    pub gm_delta: u64,
    pub text: String,
    pub settle_tx: String,
    pub snapshot: Option<UserGameState>,
}

/// Single "transaction pending" flag shared by every user action.
#[derive(Clone, Default)]
pub struct TxGate {
    busy: Arc<AtomicBool>,
}

pub struct TxPermit {
    busy: Arc<AtomicBool>,
}

impl TxGate {
    pub fn try_begin(&self) -> Result<TxPermit, GameError> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| GameError::AlreadyInProgress)?;
        Ok(TxPermit {
            busy: self.busy.clone(),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

impl Drop for TxPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Puts the machine back to `Idle` however the play exits.
struct ReturnToIdle<'a>(&'a SpinSettlement);

impl Drop for ReturnToIdle<'_> {
    fn drop(&mut self) {
        self.0.set_state(PlayState::Idle);
    }
}

pub struct SpinSettlement {
    ledger: Arc<dyn GameLedger>,
    sync: StateSyncEngine,
    leaderboard: Leaderboard,
    animator: Arc<dyn OutcomeAnimator>,
    store: PersistentKeyStore,
    layout: WheelLayout,
    policy: PlayPolicy,
    gate: TxGate,
    state: watch::Sender<PlayState>,
    events: broadcast::Sender<PlayEvent>,
}

impl SpinSettlement {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<dyn GameLedger>,
        sync: StateSyncEngine,
        leaderboard: Leaderboard,
        animator: Arc<dyn OutcomeAnimator>,
        store: PersistentKeyStore,
        layout: WheelLayout,
        policy: PlayPolicy,
        gate: TxGate,
    ) -> Self {
        let (state, _) = watch::channel(PlayState::Idle);
        let (events, _) = broadcast::channel(64);
        Self {
            ledger,
            sync,
            leaderboard,
            animator,
            store,
            layout,
            policy,
            gate,
            state,
            events,
        }
    }

    pub fn state(&self) -> PlayState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlayState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PlayEvent> {
        self.events.subscribe()
    }

    pub fn layout(&self) -> &WheelLayout {
        &self.layout
    }

    /// Outcome committed on the ledger whose settle never went through.
    pub fn pending_settlement(
        &self,
        account: &Address,
    ) -> Result<Option<PendingPlayOutcome>, GameError> {
        Ok(self
            .store
            .pending_outcome(account, &self.ledger.contract())?)
    }

    pub async fn play(&self, account: &Address) -> Result<PlayReport, GameError> {
        let _permit = self.gate.try_begin()?;
        let snapshot = self.sync.snapshot().ok_or(GameError::StateUnavailable)?;
        if snapshot.spins == 0 {
            return Err(GameError::NoSpins);
        }
        if let Some(unsettled) = self.pending_settlement(account)? {
            return Err(GameError::UnsettledOutcome {
                slot: unsettled.slot,
            });
        }

        let _idle = ReturnToIdle(self);
        let result = self.commit_and_settle(account).await;
        self.finish(result).await
    }

    /// Settles a persisted outcome without animating it again.
    pub async fn resume_settlement(&self, account: &Address) -> Result<PlayReport, GameError> {
        let _permit = self.gate.try_begin()?;
        let outcome = self
            .pending_settlement(account)?
            .ok_or(GameError::NoOutcome)?;

        let _idle = ReturnToIdle(self);
        info!(slot = outcome.slot, "resuming unsettled play");
        self.reveal(outcome.slot);
        let result = self.settle(account, outcome).await;
        self.finish(result).await
    }

    async fn commit_and_settle(&self, account: &Address) -> Result<PlayReport, GameError> {
        self.set_state(PlayState::Committing);
        let receipt = self.ledger.spin_lite(account).await?;
        if receipt.is_budget_exhaustion() {
            return Err(GameError::BudgetExceeded);
        }
        if !receipt.succeeded() {
            return Err(GameError::Reverted {
                stage: "commit",
                tx_hash: receipt.tx_hash,
            });
        }
        let outcome = receipt
            .spin_outcome_for(account)
            .map(|event| PendingPlayOutcome {
                slot: event.slot,
                gm_delta: event.gm_delta,
            });
        if let Some(outcome) = &outcome {
            self.store
                .set_pending_outcome(account, &self.ledger.contract(), outcome)?;
        }
        info!(tx = %receipt.tx_hash, slot = ?outcome.map(|o| o.slot), "spin committed");

        self.set_state(PlayState::AnimatingOutcome);
        let target = outcome.and_then(|o| self.layout.display_index(o.slot));
        let landed = self.animator.animate(target).await;
        self.emit(PlayEvent::AnimationFinished {
            display_index: landed,
        });

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => {
                warn!(
                    display_index = landed,
                    "commit receipt carried no outcome; deriving slot from wheel position"
                );
                let slot = self
                    .layout
                    .contract_slot(landed)
                    .ok_or(GameError::NoOutcome)?;
                PendingPlayOutcome {
                    slot,
                    gm_delta: Prize::for_slot(slot).gm_reward(),
                }
            }
        };
        self.reveal(outcome.slot);

        self.set_state(PlayState::Settling);
        self.settle(account, outcome).await
    }

    async fn settle(
        &self,
        account: &Address,
        outcome: PendingPlayOutcome,
    ) -> Result<PlayReport, GameError> {
        self.submit_settle(account, outcome.slot)
            .await
            .map(|settle_tx| PlayReport {
                slot: outcome.slot,
                gm_delta: outcome.gm_delta,
                text: friendly_outcome(outcome.slot).to_string(),
                settle_tx,
                snapshot: None,
            })
            .map_err(|err| GameError::Settlement(Box::new(err)))
    }

    async fn submit_settle(&self, account: &Address, slot: u8) -> Result<String, GameError> {
        if let Some(required) = Prize::for_slot(slot).fixed_payout_wei() {
            let available = self.ledger.contract_balance().await?;
            if available < required {
                return Err(GameError::InsufficientPoolBalance {
                    required,
                    available,
                });
            }
        }
        let receipt = self.ledger.settle_prize(account, slot).await?;
        if !receipt.succeeded() {
            return Err(GameError::Reverted {
                stage: "settle",
                tx_hash: receipt.tx_hash,
            });
        }
        self.store
            .clear_pending_outcome(account, &self.ledger.contract())?;
        info!(tx = %receipt.tx_hash, slot, "prize settled");
        Ok(receipt.tx_hash)
    }

    /// Classifies a failure, then reconciles regardless of the outcome.
    async fn finish(
        &self,
        result: Result<PlayReport, GameError>,
    ) -> Result<PlayReport, GameError> {
        match &result {
            Ok(_) => self.set_state(PlayState::Reconciling),
            Err(err) => {
                warn!(%err, "play failed");
                self.set_state(PlayState::Error(err.kind()));
                self.emit(PlayEvent::Notice(err.user_message()));
            }
        }
        let snapshot = self.reconcile().await;
        result.map(|report| PlayReport { snapshot, ..report })
    }

    async fn reconcile(&self) -> Option<UserGameState> {
        let snapshot = self.sync.reload(true, true).await;
        let leaderboard = self.leaderboard.clone();
        let delay = self.policy.leaderboard_refresh_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = leaderboard.refresh().await {
                warn!(%err, "leaderboard refresh failed");
            }
        });
        snapshot
    }

    fn reveal(&self, slot: u8) {
        let text = friendly_outcome(slot).to_string();
        info!(slot, %text, "outcome revealed");
        self.emit(PlayEvent::OutcomeRevealed { slot, text });
    }

    fn set_state(&self, next: PlayState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            self.emit(PlayEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: PlayEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn try_begin__second_permit_is_refused_until_first_drops() {
        // given
        let gate = TxGate::default();
        let first = gate.try_begin().unwrap();

        // when
        let second = gate.try_begin();

        // then
        assert!(matches!(second, Err(GameError::AlreadyInProgress)));
        drop(first);
        assert!(gate.try_begin().is_ok());
        assert!(!gate.is_busy());
    }
}
