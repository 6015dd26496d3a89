use crate::{
    error::LedgerError,
    ledger::GameLedger,
    lock,
    types::{
        Address,
        LeaderboardEntry,
    },
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
    },
};
use tracing::debug;

/// Published-score leaderboard, merged with this client's own publish and
/// unpublish actions so they show up before the ledger read catches up.
#[derive(Clone)]
pub struct Leaderboard {
    ledger: Arc<dyn GameLedger>,
    page_size: u64,
    entries: Arc<Mutex<Vec<LeaderboardEntry>>>,
    local: Arc<Mutex<HashMap<Address, Option<u64>>>>,
}

impl Leaderboard {
    pub fn new(ledger: Arc<dyn GameLedger>, page_size: u64) -> Self {
        Self {
            ledger,
            page_size,
            entries: Arc::new(Mutex::new(Vec::new())),
            local: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn refresh(&self) -> Result<Vec<LeaderboardEntry>, LedgerError> {
        let published = self.ledger.published_range(0, self.page_size).await?;
        let merged = merge(published, &lock(&self.local));
        debug!(entries = merged.len(), "leaderboard refreshed");
        *lock(&self.entries) = merged.clone();
        Ok(merged)
    }

    pub fn entries(&self) -> Vec<LeaderboardEntry> {
        lock(&self.entries).clone()
    }

    /// `None` records an unpublish.
    pub fn set_published_score(&self, account: Address, score: Option<u64>) {
        lock(&self.local).insert(account, score);
        let current = lock(&self.entries).clone();
        *lock(&self.entries) = merge(current, &lock(&self.local));
    }
}

fn merge(
    mut entries: Vec<LeaderboardEntry>,
    local: &HashMap<Address, Option<u64>>,
) -> Vec<LeaderboardEntry> {
    for (address, score) in local {
        match score {
            Some(score) => match entries.iter_mut().find(|e| e.address == *address) {
                Some(entry) => entry.score = entry.score.max(*score),
                None => entries.push(LeaderboardEntry {
                    address: *address,
                    score: *score,
                }),
            },
            None => entries.retain(|e| e.address != *address),
        }
    }
    entries.sort_by(|a, b| b.score.cmp(&a.score).then(a.address.cmp(&b.address)));
    entries
}
