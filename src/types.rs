use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    str::FromStr,
};

pub const SECONDS_PER_DAY: u64 = 86_400;
pub const WEI_PER_ETH: u128 = 1_000_000_000_000_000_000;

/// 20-byte account or contract address.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; 20]);

impl Address {
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub const fn repeat_byte(byte: u8) -> Self {
        Self([byte; 20])
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("invalid address '{0}'")]
pub struct InvalidAddress(pub String);

impl FromStr for Address {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let digits = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(raw);
        let bytes = hex::decode(digits).map_err(|_| InvalidAddress(s.to_string()))?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| InvalidAddress(s.to_string()))?;
        Ok(Self(arr))
    }
}

impl TryFrom<String> for Address {
    type Error = InvalidAddress;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

/// Opaque reference to an encrypted value held by the ledger.
///
/// Handles are never decrypted locally. The all-zero handle is the ledger's
/// "never written" sentinel and always reads as `0`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfidentialHandle(String);

impl ConfidentialHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_ascii_lowercase())
    }

    pub fn zero() -> Self {
        Self::from_bytes([0u8; 32])
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `0x` followed by exactly 64 hex digits.
    pub fn is_well_formed(&self) -> bool {
        self.0
            .strip_prefix("0x")
            .map(|digits| {
                digits.len() == 64 && digits.bytes().all(|b| b.is_ascii_hexdigit())
            })
            .unwrap_or(false)
    }

    pub fn is_zero(&self) -> bool {
        self.is_well_formed() && self.0[2..].bytes().all(|b| b == b'0')
    }

    /// True when the handle has to go through the relayer to be read.
    pub fn needs_decryption(&self) -> bool {
        self.is_well_formed() && !self.is_zero()
    }
}

impl fmt::Display for ConfidentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.chars().count() > 14 {
            let preview: String = self.0.chars().take(14).collect();
            write!(f, "{preview}…")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DecryptionKeypair {
    pub public_key: String,
    pub private_key: String,
}

/// Signed, time-boxed grant allowing one keypair to decrypt one contract's values.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationArtifact {
    /// Hex signature without the `0x` transport prefix.
    pub signature: String,
    pub window_start: u64,
    pub window_length_days: u32,
    pub contract: Address,
    pub public_key: String,
    pub expires_at: u64,
}

impl AuthorizationArtifact {
    pub fn is_usable_for(&self, contract: &Address, public_key: &str, now: u64) -> bool {
        self.contract == *contract && self.public_key == public_key && self.expires_at > now
    }
}

/// Reconciled plaintext view of the account's confidential state.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserGameState {
    pub spins: u64,
    pub gm: u64,
    pub pending_eth_wei: u64,
    pub last_slot: Option<u8>,
    pub score: u64,
    pub version: u64,
}

impl UserGameState {
    pub fn pending_eth(&self) -> f64 {
        wei_to_eth(self.pending_eth_wei as u128)
    }
}

/// Outcome captured from the commit receipt, held until the settle step.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PendingPlayOutcome {
    pub slot: u8,
    pub gm_delta: u64,
}

/// Handles returned by `getEncryptedUserBundle`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EncryptedUserBundle {
    pub spins: ConfidentialHandle,
    pub gm: ConfidentialHandle,
    pub pending_eth_wei: ConfidentialHandle,
    pub last_slot: Option<u8>,
    pub score: ConfidentialHandle,
}

/// Handles plus input proof produced by the relayer for a confidential write.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EncryptedInput {
    pub handles: Vec<ConfidentialHandle>,
    pub input_proof: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StateChanged {
    pub account: Address,
    pub version: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpinOutcomeEvent {
    pub user: Address,
    pub slot: u8,
    pub prize_wei: u128,
    pub gm_delta: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LedgerEvent {
    SpinOutcome(SpinOutcomeEvent),
    UserStateChanged(StateChanged),
    CheckInCompleted { user: Address, timestamp: u64 },
    SpinBoughtWithGm { user: Address, count: u64 },
    GmTokensBought { user: Address },
    ErrorChanged { user: Address },
    ClaimRequested { user: Address, amount_wei: u64 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxStatus {
    Success,
    Reverted,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub status: TxStatus,
    pub logs: Vec<LedgerEvent>,
}

impl TxReceipt {
    pub fn succeeded(&self) -> bool {
        self.status == TxStatus::Success
    }

    /// A failed receipt with no logs at all is how the confidential
    /// coprocessor reports an exhausted operation budget.
    pub fn is_budget_exhaustion(&self) -> bool {
        self.status == TxStatus::Reverted && self.logs.is_empty()
    }

    pub fn spin_outcome_for(&self, user: &Address) -> Option<SpinOutcomeEvent> {
        self.logs.iter().find_map(|log| match log {
            LedgerEvent::SpinOutcome(event) if event.user == *user => Some(*event),
            _ => None,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    pub address: Address,
    pub score: u64,
}

/// Decoded reading of the contract's encrypted error side channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LastErrorReport {
    pub code: u64,
    pub message: String,
    pub at: Option<chrono::DateTime<chrono::Utc>>,
}

pub fn wei_to_eth(wei: u128) -> f64 {
    wei as f64 / WEI_PER_ETH as f64
}

/// Parses a decimal ETH amount ("0.01", "1", "2.5") into wei without going
/// through floating point.
pub fn parse_eth(amount: &str) -> Option<u128> {
    let amount = amount.trim();
    if amount.is_empty() {
        return None;
    }
    let (whole, frac) = match amount.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (amount, ""),
    };
    if frac.len() > 18
        || !whole.bytes().all(|b| b.is_ascii_digit())
        || !frac.bytes().all(|b| b.is_ascii_digit())
        || (whole.is_empty() && frac.is_empty())
    {
        return None;
    }
    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut frac_padded = frac.to_string();
    while frac_padded.len() < 18 {
        frac_padded.push('0');
    }
    let frac: u128 = frac_padded.parse().ok()?;
    whole.checked_mul(WEI_PER_ETH)?.checked_add(frac)
}

pub fn format_eth(wei: u128) -> String {
    let whole = wei / WEI_PER_ETH;
    let frac = wei % WEI_PER_ETH;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:018}");
    format!("{whole}.{}", frac.trim_end_matches('0'))
}
