use crate::types::format_eth;

/// Persistence backend failures.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("failed to encode or decode '{key}': {message}")]
    Codec { key: String, message: String },
}

impl From<sled::Error> for StoreError {
    fn from(value: sled::Error) -> Self {
        StoreError::Backend(value.to_string())
    }
}

/// Ledger read/write failures that never reached a receipt.
#[derive(Clone, Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger transport error: {0}")]
    Transport(String),

    #[error("transaction rejected by wallet: {0}")]
    Rejected(String),

    #[error("ledger call reverted: {0}")]
    Reverted(String),
}

/// Relayer (user-decryption service) failures.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RelayerError {
    #[error("relayer responded with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("relayer request timed out")]
    Timeout,

    #[error("relayer transport error: {0}")]
    Transport(String),

    #[error("relayer returned an unusable payload: {0}")]
    Malformed(String),
}

impl RelayerError {
    /// Server-side failures: a 5xx status, or the same condition reported
    /// only in the message text.
    pub fn is_server_error(&self) -> bool {
        match self {
            RelayerError::Status { status, message } => {
                (500..600).contains(status) || mentions_internal_error(message)
            }
            RelayerError::Transport(message) => mentions_internal_error(message),
            _ => false,
        }
    }

    /// Failures worth backing off from rather than retrying straight away.
    pub fn is_transient(&self) -> bool {
        match self {
            RelayerError::Status { status, .. } if *status == 429 => true,
            RelayerError::Timeout => true,
            _ => self.is_server_error(),
        }
    }
}

/// Matches "500" only as a whole token, so "retry after 1500ms" does not count.
fn mentions_internal_error(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("internal server error")
        || lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == "500")
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum SignerError {
    #[error("signature request rejected by user")]
    Rejected,

    #[error("signer unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum AuthorizationError {
    #[error("user declined to authorize decryption")]
    Declined,

    #[error("signer error: {0}")]
    Signer(SignerError),

    #[error(transparent)]
    Relayer(#[from] RelayerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SignerError> for AuthorizationError {
    fn from(value: SignerError) -> Self {
        match value {
            SignerError::Rejected => AuthorizationError::Declined,
            other => AuthorizationError::Signer(other),
        }
    }
}

/// How a failed user action is presented.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    BudgetExceeded,
    RelayerUnavailable,
    Generic,
}

/// Failures of user-initiated actions (play, settle, check-in, claims...).
#[derive(Clone, Debug, thiserror::Error)]
pub enum GameError {
    #[error("no active account")]
    NoAccount,

    #[error("a transaction is already in progress")]
    AlreadyInProgress,

    #[error("account state has not been loaded yet")]
    StateUnavailable,

    #[error("no spins available")]
    NoSpins,

    #[error("not enough GM: need {required}, have {available}")]
    InsufficientGm { required: u64, available: u64 },

    #[error("already checked in today")]
    AlreadyCheckedIn,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("no pending ETH to claim")]
    NothingToClaim,

    #[error("requested {requested} wei exceeds pending {available} wei")]
    ExceedsPending { requested: u64, available: u64 },

    #[error("contract balance insufficient: need {required} wei, have {available} wei")]
    InsufficientPoolBalance { required: u128, available: u128 },

    #[error("confidential operation budget exceeded")]
    BudgetExceeded,

    #[error("no outcome to settle")]
    NoOutcome,

    #[error("previous spin (slot {slot}) is still unsettled")]
    UnsettledOutcome { slot: u8 },

    #[error("prize settlement failed: {0}")]
    Settlement(Box<GameError>),

    #[error("transaction {tx_hash} reverted during {stage}")]
    Reverted { stage: &'static str, tx_hash: String },

    #[error("decryption is not authorized")]
    NotAuthorized,

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Relayer(#[from] RelayerError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GameError {
    pub fn kind(&self) -> FailureKind {
        match self {
            GameError::BudgetExceeded => FailureKind::BudgetExceeded,
            GameError::Settlement(inner) => inner.kind(),
            GameError::Relayer(_) | GameError::Authorization(_) | GameError::NotAuthorized => {
                FailureKind::RelayerUnavailable
            }
            _ => FailureKind::Generic,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            GameError::NoAccount => "Please connect your wallet first".into(),
            GameError::AlreadyInProgress => {
                "Please wait for current transaction to complete".into()
            }
            GameError::StateUnavailable => {
                "Private balances are still loading. Please try again shortly.".into()
            }
            GameError::NoSpins => "No spins available. Please buy spins with GM.".into(),
            GameError::InsufficientGm { required, available } => {
                format!("Not enough GM to buy spins: need {required}, have {available}")
            }
            GameError::AlreadyCheckedIn => "Already checked in today".into(),
            GameError::InvalidAmount(reason) => format!("Invalid amount: {reason}"),
            GameError::NothingToClaim => "No pending ETH available to claim".into(),
            GameError::ExceedsPending { available, .. } => format!(
                "Insufficient pending ETH. Available: {} ETH",
                format_eth(*available as u128)
            ),
            GameError::InsufficientPoolBalance { required, .. } => format!(
                "Contract balance insufficient: need {} ETH",
                format_eth(*required)
            ),
            GameError::BudgetExceeded => {
                "FHE operation budget exceeded. Please wait and try again.".into()
            }
            GameError::NoOutcome => "No spin outcome available to settle".into(),
            GameError::UnsettledOutcome { .. } => {
                "Previous spin is not settled yet. Use resume to settle it first.".into()
            }
            GameError::Settlement(inner) => {
                format!("Prize settlement failed: {}", inner.user_message())
            }
            GameError::Reverted { stage, .. } => format!("Transaction reverted during {stage}"),
            GameError::NotAuthorized => {
                "Authorize decryption to view private balances".into()
            }
            GameError::Authorization(AuthorizationError::Declined) => {
                "Decryption authorization was declined".into()
            }
            GameError::Authorization(_) | GameError::Relayer(_) => {
                "Private data service is unavailable. Please try again.".into()
            }
            GameError::Ledger(LedgerError::Rejected(_)) => "Transaction rejected".into(),
            GameError::Ledger(err) => err.to_string(),
            GameError::Store(err) => format!("Local storage error: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn relayer_error__classifies_server_failures() {
        let status = RelayerError::Status {
            status: 500,
            message: "boom".into(),
        };
        let text = RelayerError::Transport("Internal Server Error".into());
        let client = RelayerError::Status {
            status: 400,
            message: "bad request".into(),
        };

        assert!(status.is_server_error());
        assert!(text.is_server_error());
        assert!(!client.is_server_error());
        assert!(!client.is_transient());
    }

    #[test]
    fn relayer_error__rate_limit_is_transient_but_not_server_error() {
        let limited = RelayerError::Status {
            status: 429,
            message: "slow down".into(),
        };
        assert!(limited.is_transient());
        assert!(!limited.is_server_error());
    }

    #[test]
    fn relayer_error__500_must_be_a_whole_token() {
        let limited = RelayerError::Status {
            status: 429,
            message: "retry after 1500ms".into(),
        };
        let wrapped = RelayerError::Transport("upstream returned status 500".into());

        assert!(limited.is_transient());
        assert!(!limited.is_server_error());
        assert!(wrapped.is_server_error());
    }

    #[test]
    fn game_error__kind_separates_budget_and_relayer() {
        assert_eq!(GameError::BudgetExceeded.kind(), FailureKind::BudgetExceeded);
        assert_eq!(
            GameError::Relayer(RelayerError::Timeout).kind(),
            FailureKind::RelayerUnavailable
        );
        assert_eq!(GameError::NoSpins.kind(), FailureKind::Generic);
    }

    #[test]
    fn game_error__settlement_failures_are_labelled_and_keep_inner_kind() {
        // given
        let reverted = GameError::Settlement(Box::new(GameError::Reverted {
            stage: "settle",
            tx_hash: "0x01".into(),
        }));
        let relayer = GameError::Settlement(Box::new(GameError::Relayer(RelayerError::Timeout)));

        // then
        assert_eq!(
            reverted.user_message(),
            "Prize settlement failed: Transaction reverted during settle"
        );
        assert_eq!(relayer.kind(), FailureKind::RelayerUnavailable);
    }
}
