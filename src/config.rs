//! Session policy constants, loadable from JSON and the environment.
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    env,
    fs,
    path::{
        Path,
        PathBuf,
    },
    str::FromStr,
    time::Duration,
};

pub const ENV_PREFIX: &str = "FHE_SPIN_";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub auth: AuthPolicy,
    pub decrypt: DecryptPolicy,
    pub sync: SyncPolicy,
    pub play: PlayPolicy,
    pub leaderboard: LeaderboardPolicy,
    pub economy: EconomyPolicy,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthPolicy {
    pub window_length_days: u32,
    pub expiry_margin_secs: u64,
    pub min_prompt_interval_ms: u64,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            window_length_days: 10,
            expiry_margin_secs: 60,
            min_prompt_interval_ms: 1_000,
        }
    }
}

impl AuthPolicy {
    pub fn min_prompt_interval(&self) -> Duration {
        Duration::from_millis(self.min_prompt_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecryptPolicy {
    pub cooldown_ms: u64,
}

impl Default for DecryptPolicy {
    fn default() -> Self {
        Self { cooldown_ms: 50 }
    }
}

impl DecryptPolicy {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    pub min_reload_interval_ms: u64,
    pub freshness_ttl_ms: u64,
    pub notification_debounce_ms: u64,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            min_reload_interval_ms: 2_000,
            freshness_ttl_ms: 120_000,
            notification_debounce_ms: 1_000,
        }
    }
}

impl SyncPolicy {
    pub fn min_reload_interval(&self) -> Duration {
        Duration::from_millis(self.min_reload_interval_ms)
    }

    pub fn freshness_ttl(&self) -> Duration {
        Duration::from_millis(self.freshness_ttl_ms)
    }

    pub fn notification_debounce(&self) -> Duration {
        Duration::from_millis(self.notification_debounce_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayPolicy {
    pub leaderboard_refresh_delay_ms: u64,
    pub animation_ms: u64,
}

impl Default for PlayPolicy {
    fn default() -> Self {
        Self {
            leaderboard_refresh_delay_ms: 1_000,
            animation_ms: 3_000,
        }
    }
}

impl PlayPolicy {
    pub fn leaderboard_refresh_delay(&self) -> Duration {
        Duration::from_millis(self.leaderboard_refresh_delay_ms)
    }

    pub fn animation(&self) -> Duration {
        Duration::from_millis(self.animation_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderboardPolicy {
    pub page_size: u64,
}

impl Default for LeaderboardPolicy {
    fn default() -> Self {
        Self { page_size: 20 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomyPolicy {
    pub gm_per_spin: u64,
    pub gm_per_eth: u64,
}

impl Default for EconomyPolicy {
    fn default() -> Self {
        Self {
            gm_per_spin: 10,
            gm_per_eth: 1_000,
        }
    }
}

impl SessionConfig {
    /// Reads the optional JSON file, then applies `FHE_SPIN_*` overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(raw) => Self::from_file(expand_path(raw))?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)
            .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_slice(&data)
            .wrap_err_with(|| format!("Failed to parse config file {}", path.display()))
    }

    /// - `FHE_SPIN_AUTH_WINDOW_DAYS`
    /// - `FHE_SPIN_DECRYPT_COOLDOWN_MS`
    /// - `FHE_SPIN_RELOAD_INTERVAL_MS` / `FHE_SPIN_FRESHNESS_TTL_MS`
    /// - `FHE_SPIN_DEBOUNCE_MS`
    /// - `FHE_SPIN_ANIMATION_MS`
    pub fn apply_env(&mut self) {
        if let Some(days) = read_env::<u32>("AUTH_WINDOW_DAYS") {
            self.auth.window_length_days = days.max(1);
        }
        if let Some(ms) = read_env::<u64>("DECRYPT_COOLDOWN_MS") {
            self.decrypt.cooldown_ms = ms;
        }
        if let Some(ms) = read_env::<u64>("RELOAD_INTERVAL_MS") {
            self.sync.min_reload_interval_ms = ms;
        }
        if let Some(ms) = read_env::<u64>("FRESHNESS_TTL_MS") {
            self.sync.freshness_ttl_ms = ms;
        }
        if let Some(ms) = read_env::<u64>("DEBOUNCE_MS") {
            self.sync.notification_debounce_ms = ms;
        }
        if let Some(ms) = read_env::<u64>("ANIMATION_MS") {
            self.play.animation_ms = ms;
        }
    }
}

pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

fn read_env<T: FromStr>(suffix: &str) -> Option<T> {
    env::var(format!("{ENV_PREFIX}{suffix}"))
        .ok()
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use std::io::Write;

    #[test]
    fn from_file__fills_missing_fields_with_defaults() {
        // given
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "sync": {{ "freshness_ttl_ms": 5000 }} }}"#).unwrap();

        // when
        let config = SessionConfig::from_file(file.path()).unwrap();

        // then
        assert_eq!(config.sync.freshness_ttl_ms, 5_000);
        assert_eq!(config.sync.min_reload_interval_ms, 2_000);
        assert_eq!(config.auth, AuthPolicy::default());
    }

    #[test]
    fn default__matches_observed_policy() {
        let config = SessionConfig::default();
        assert_eq!(config.auth.window_length_days, 10);
        assert_eq!(config.auth.expiry_margin_secs, 60);
        assert_eq!(config.decrypt.cooldown(), Duration::from_millis(50));
        assert_eq!(config.sync.freshness_ttl(), Duration::from_secs(120));
        assert_eq!(config.sync.notification_debounce(), Duration::from_secs(1));
        assert_eq!(config.leaderboard.page_size, 20);
    }
}
