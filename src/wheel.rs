use crate::{
    ledger::OutcomeAnimator,
    types::WEI_PER_ETH,
};
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

pub const SLOT_COUNT: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Prize {
    /// Fixed ETH payout credited to the pending balance.
    Eth { wei: u128 },
    Gm(u64),
    Miss,
}

impl Prize {
    pub fn for_slot(slot: u8) -> Prize {
        match slot {
            0 => Prize::Eth {
                wei: WEI_PER_ETH / 10,
            },
            1 => Prize::Eth {
                wei: WEI_PER_ETH / 100,
            },
            5 => Prize::Gm(5),
            6 => Prize::Gm(15),
            7 => Prize::Gm(30),
            _ => Prize::Miss,
        }
    }

    /// Payout the contract's operating balance must cover before settling.
    pub fn fixed_payout_wei(&self) -> Option<u128> {
        match self {
            Prize::Eth { wei } => Some(*wei),
            _ => None,
        }
    }

    pub fn gm_reward(&self) -> u64 {
        match self {
            Prize::Gm(amount) => *amount,
            _ => 0,
        }
    }
}

pub fn friendly_outcome(slot: u8) -> &'static str {
    match slot {
        0 => "Won 0.1 ETH (pending)",
        1 => "Won 0.01 ETH (pending)",
        2..=4 => "Miss",
        5 => "Won 5 GM",
        6 => "Won 15 GM",
        7 => "Won 30 GM",
        _ => "Completed",
    }
}

/// Order in which contract slots are drawn around the wheel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WheelLayout {
    display: [u8; SLOT_COUNT],
}

impl Default for WheelLayout {
    fn default() -> Self {
        Self {
            display: [0, 2, 5, 3, 1, 6, 4, 7],
        }
    }
}

impl WheelLayout {
    /// `display` must be a permutation of `0..SLOT_COUNT`.
    pub fn new(display: [u8; SLOT_COUNT]) -> Option<Self> {
        let mut seen = [false; SLOT_COUNT];
        for slot in display {
            let idx = slot as usize;
            if idx >= SLOT_COUNT || seen[idx] {
                return None;
            }
            seen[idx] = true;
        }
        Some(Self { display })
    }

    pub fn display_index(&self, slot: u8) -> Option<usize> {
        self.display.iter().position(|s| *s == slot)
    }

    pub fn contract_slot(&self, index: usize) -> Option<u8> {
        self.display.get(index).copied()
    }

    pub fn len(&self) -> usize {
        SLOT_COUNT
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Sleeps for the configured duration and lands on the target segment, or
/// on a random one when no target is known.
#[derive(Clone, Debug)]
pub struct TimedAnimator {
    duration: Duration,
    segments: usize,
}

impl TimedAnimator {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            segments: SLOT_COUNT,
        }
    }
}

#[async_trait]
impl OutcomeAnimator for TimedAnimator {
    async fn animate(&self, target: Option<usize>) -> usize {
        tokio::time::sleep(self.duration).await;
        match target {
            Some(index) if index < self.segments => index,
            _ => rand::rng().random_range(0..self.segments),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use proptest::prelude::*;
    use tokio::time::Instant;

    #[test]
    fn prize__fixed_payouts_only_for_eth_tiers() {
        assert_eq!(Prize::for_slot(0).fixed_payout_wei(), Some(WEI_PER_ETH / 10));
        assert_eq!(Prize::for_slot(1).fixed_payout_wei(), Some(WEI_PER_ETH / 100));
        for slot in 2..8 {
            assert_eq!(Prize::for_slot(slot).fixed_payout_wei(), None);
        }
    }

    #[test]
    fn friendly_outcome__matches_table() {
        assert_eq!(friendly_outcome(0), "Won 0.1 ETH (pending)");
        assert_eq!(friendly_outcome(3), "Miss");
        assert_eq!(friendly_outcome(7), "Won 30 GM");
    }

    #[test]
    fn new__rejects_non_permutations() {
        assert!(WheelLayout::new([0, 1, 2, 3, 4, 5, 6, 6]).is_none());
        assert!(WheelLayout::new([0, 1, 2, 3, 4, 5, 6, 8]).is_none());
        assert!(WheelLayout::new([7, 6, 5, 4, 3, 2, 1, 0]).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn animate__waits_full_duration_and_lands_on_target() {
        // given
        let animator = TimedAnimator::new(Duration::from_secs(3));
        let started = Instant::now();

        // when
        let landed = animator.animate(Some(4)).await;

        // then
        assert_eq!(landed, 4);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    proptest! {
        #[test]
        fn display_index__inverts_contract_slot(slot in 0u8..8) {
            let layout = WheelLayout::default();
            let index = layout.display_index(slot).unwrap();
            prop_assert_eq!(layout.contract_slot(index), Some(slot));
        }
    }
}
