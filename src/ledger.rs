//! Interfaces consumed by the session: the game contract, the user-decryption
//! relayer and the wallet that signs authorization payloads.
use crate::{
    error::{
        LedgerError,
        RelayerError,
        SignerError,
    },
    types::{
        Address,
        ConfidentialHandle,
        DecryptionKeypair,
        EncryptedInput,
        EncryptedUserBundle,
        LeaderboardEntry,
        StateChanged,
        TxReceipt,
    },
};
use async_trait::async_trait;
use serde::{
    Deserialize,
    Serialize,
};
use sha2::{
    Digest,
    Sha256,
};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Read, write and notification surface of the deployed game contract.
///
/// Writes are submitted on behalf of `account` and resolve once the
/// transaction is included. A receipt with `TxStatus::Reverted` is returned
/// as `Ok`; only failures that never produced a receipt are errors.
#[async_trait]
pub trait GameLedger: Send + Sync {
    fn contract(&self) -> Address;

    async fn state_version(&self, account: &Address) -> Result<u64, LedgerError>;

    async fn encrypted_user_bundle(
        &self,
        account: &Address,
    ) -> Result<EncryptedUserBundle, LedgerError>;

    async fn last_check_in_day(&self, account: &Address) -> Result<u64, LedgerError>;

    async fn encrypted_pending_eth_wei(
        &self,
        account: &Address,
    ) -> Result<ConfidentialHandle, LedgerError>;

    /// Encrypted error code and the unix timestamp it was recorded at.
    async fn last_error(
        &self,
        account: &Address,
    ) -> Result<(ConfidentialHandle, u64), LedgerError>;

    /// Operating balance the contract pays prizes and claims from.
    async fn contract_balance(&self) -> Result<u128, LedgerError>;

    async fn published_range(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<LeaderboardEntry>, LedgerError>;

    async fn daily_gm(&self, account: &Address) -> Result<TxReceipt, LedgerError>;

    async fn buy_spins_with_gm(
        &self,
        account: &Address,
        count: u64,
    ) -> Result<TxReceipt, LedgerError>;

    async fn buy_gm_tokens(
        &self,
        account: &Address,
        input: &EncryptedInput,
        value_wei: u128,
    ) -> Result<TxReceipt, LedgerError>;

    /// Commit step of a play. Emits the outcome event on success.
    async fn spin_lite(&self, account: &Address) -> Result<TxReceipt, LedgerError>;

    /// Settle step of a play: applies the reward for `slot`.
    async fn settle_prize(&self, account: &Address, slot: u8)
    -> Result<TxReceipt, LedgerError>;

    async fn request_claim_eth(
        &self,
        account: &Address,
        amount_wei: u64,
    ) -> Result<TxReceipt, LedgerError>;

    async fn publish_score(&self, account: &Address, score: u64)
    -> Result<TxReceipt, LedgerError>;

    async fn unpublish_score(&self, account: &Address) -> Result<TxReceipt, LedgerError>;

    fn subscribe_state_changes(&self) -> broadcast::Receiver<StateChanged>;
}

/// Typed-data payload the wallet signs to grant decryption rights.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Eip712Payload {
    pub primary_type: String,
    pub public_key: String,
    pub contracts: Vec<Address>,
    pub window_start: u64,
    pub window_length_days: u32,
}

impl Eip712Payload {
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.primary_type.as_bytes());
        hasher.update(self.public_key.as_bytes());
        for contract in &self.contracts {
            hasher.update(contract.as_bytes());
        }
        hasher.update(self.window_start.to_be_bytes());
        hasher.update(self.window_length_days.to_be_bytes());
        hasher.finalize().into()
    }
}

#[derive(Clone, Debug)]
pub struct UserDecryptRequest {
    pub pairs: Vec<(ConfidentialHandle, Address)>,
    pub keypair: DecryptionKeypair,
    pub signature: String,
    pub contracts: Vec<Address>,
    pub account: Address,
    pub window_start: u64,
    pub window_length_days: u32,
}

/// Plaintext as reported by the relayer. The wire representation varies
/// between numbers, big integers and decimal strings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClearValue {
    Number(u64),
    Wide(u128),
    Text(String),
    Bool(bool),
}

impl ClearValue {
    /// Anything that is not an unsigned integer fitting in 64 bits reads as `0`.
    pub fn to_u64_lossy(&self) -> u64 {
        match self {
            ClearValue::Number(value) => *value,
            ClearValue::Wide(value) => u64::try_from(*value).unwrap_or(0),
            ClearValue::Text(text) => text.trim().parse().unwrap_or(0),
            ClearValue::Bool(_) => 0,
        }
    }
}

#[async_trait]
pub trait Relayer: Send + Sync {
    fn generate_keypair(&self) -> Result<DecryptionKeypair, RelayerError>;

    fn create_eip712(
        &self,
        public_key: &str,
        contracts: &[Address],
        window_start: u64,
        window_length_days: u32,
    ) -> Result<Eip712Payload, RelayerError>;

    async fn user_decrypt(
        &self,
        request: UserDecryptRequest,
    ) -> Result<HashMap<ConfidentialHandle, ClearValue>, RelayerError>;

    /// `createEncryptedInput(contract, account).add64(value).encrypt()`
    async fn encrypt_u64(
        &self,
        contract: &Address,
        account: &Address,
        value: u64,
    ) -> Result<EncryptedInput, RelayerError>;
}

#[async_trait]
pub trait TypedDataSigner: Send + Sync {
    fn address(&self) -> Address;

    /// Returns a hex signature, possibly `0x`-prefixed.
    async fn sign_typed_data(&self, payload: &Eip712Payload) -> Result<String, SignerError>;
}

/// Drives the reveal animation. Resolves only once the animation has
/// finished, returning the display index it stopped on.
#[async_trait]
pub trait OutcomeAnimator: Send + Sync {
    async fn animate(&self, target: Option<usize>) -> usize;
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn to_u64_lossy__normalises_known_shapes() {
        assert_eq!(ClearValue::Number(7).to_u64_lossy(), 7);
        assert_eq!(ClearValue::Wide(42).to_u64_lossy(), 42);
        assert_eq!(ClearValue::Text(" 15 ".into()).to_u64_lossy(), 15);
    }

    #[test]
    fn to_u64_lossy__unusable_values_read_as_zero() {
        assert_eq!(ClearValue::Text("abc".into()).to_u64_lossy(), 0);
        assert_eq!(ClearValue::Text("-3".into()).to_u64_lossy(), 0);
        assert_eq!(ClearValue::Bool(true).to_u64_lossy(), 0);
        assert_eq!(ClearValue::Wide(u128::from(u64::MAX) + 1).to_u64_lossy(), 0);
    }

    #[test]
    fn digest__depends_on_contracts() {
        let payload = Eip712Payload {
            primary_type: "UserDecryptRequestVerification".into(),
            public_key: "pk".into(),
            contracts: vec![Address::repeat_byte(1)],
            window_start: 0,
            window_length_days: 10,
        };
        let other = Eip712Payload {
            contracts: vec![Address::repeat_byte(2)],
            ..payload.clone()
        };
        assert_ne!(payload.digest(), other.digest());
    }

    proptest! {
        #[test]
        fn to_u64_lossy__text_and_number_agree(value in any::<u64>()) {
            prop_assert_eq!(ClearValue::Text(value.to_string()).to_u64_lossy(), value);
            prop_assert_eq!(ClearValue::Wide(value as u128).to_u64_lossy(), value);
        }
    }
}
