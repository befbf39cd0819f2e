//! Configuration layer.
//!
//! Settings are loaded from an optional `Config.toml` in the working
//! directory, then overridden by `DBCACHE_*` environment variables, with
//! built-in defaults for everything so the crate runs unconfigured. This
//! mirrors the layered `config` + `serde(default = ...)` approach used
//! elsewhere in this codebase's lineage rather than hand-rolling a parser.

use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

fn default_bases_max_hard() -> u32 {
    1024
}
fn default_bases_max_soft() -> u32 {
    0 // 0 means "equal to max_hard"; resolved in `CacheSettings::resolved_soft_max`
}
fn default_timeout_open_ms() -> u64 {
    5_000
}
fn default_grace_delay_cool_ms() -> u64 {
    1_000
}
fn default_grace_delay_hot_ms() -> u64 {
    5_000
}
fn default_cond_wait_period_ms() -> u64 {
    1_000
}
fn default_heat_threshold() -> u32 {
    1
}
fn default_min_load_on_heavy_load() -> u64 {
    1
}
fn default_false() -> bool {
    false
}
fn default_max_rss() -> i64 {
    0 // 0 disables the soft memory ceiling
}

/// Tunables for the cache controller.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    #[serde(default = "default_bases_max_hard")]
    pub bases_max_hard: u32,
    #[serde(default = "default_bases_max_soft")]
    pub bases_max_soft: u32,
    #[serde(default = "default_timeout_open_ms")]
    pub timeout_open_ms: u64,
    #[serde(default = "default_grace_delay_cool_ms")]
    pub grace_delay_cool_ms: u64,
    #[serde(default = "default_grace_delay_hot_ms")]
    pub grace_delay_hot_ms: u64,
    #[serde(default = "default_cond_wait_period_ms")]
    pub cond_wait_period_ms: u64,
    #[serde(default = "default_heat_threshold")]
    pub heat_threshold: u32,
    #[serde(default = "default_min_load_on_heavy_load")]
    pub min_load_on_heavy_load: u64,
    #[serde(default = "default_false")]
    pub fail_on_heavy_load: bool,
    #[serde(default = "default_false")]
    pub alert_on_heavy_load: bool,
    #[serde(default = "default_max_rss")]
    pub max_rss: i64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            bases_max_hard: default_bases_max_hard(),
            bases_max_soft: default_bases_max_soft(),
            timeout_open_ms: default_timeout_open_ms(),
            grace_delay_cool_ms: default_grace_delay_cool_ms(),
            grace_delay_hot_ms: default_grace_delay_hot_ms(),
            cond_wait_period_ms: default_cond_wait_period_ms(),
            heat_threshold: default_heat_threshold(),
            min_load_on_heavy_load: default_min_load_on_heavy_load(),
            fail_on_heavy_load: default_false(),
            alert_on_heavy_load: default_false(),
            max_rss: default_max_rss(),
        }
    }
}

impl CacheSettings {
    pub fn timeout_open(&self) -> Duration {
        Duration::from_millis(self.timeout_open_ms)
    }

    pub fn grace_delay_cool(&self) -> Duration {
        Duration::from_millis(self.grace_delay_cool_ms)
    }

    pub fn grace_delay_hot(&self) -> Duration {
        Duration::from_millis(self.grace_delay_hot_ms)
    }

    pub fn cond_wait_period(&self) -> Duration {
        Duration::from_millis(self.cond_wait_period_ms)
    }

    /// The effective soft limit: `bases_max_soft` clamped into
    /// `[1, bases_max_hard]`, or `bases_max_hard` itself when
    /// `bases_max_soft` is unset (0).
    pub fn resolved_soft_max(&self) -> u32 {
        if self.bases_max_soft == 0 {
            self.bases_max_hard
        } else {
            self.bases_max_soft.clamp(1, self.bases_max_hard)
        }
    }
}

fn default_poll_timeout_ms() -> u64 {
    200
}
fn default_flush_divisor() -> u64 {
    10
}
fn default_shutdown_drain_secs() -> u64 {
    5
}
fn default_backoff_base_ms() -> u64 {
    100
}
fn default_backoff_max_attempts() -> u32 {
    5
}
fn default_overwritable_capacity() -> usize {
    4096
}
fn default_buffer_delay_ms() -> u64 {
    1_000
}

/// Tunables for the event dispatch worker.
#[derive(Debug, Deserialize, Clone)]
pub struct DispatchSettings {
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_flush_divisor")]
    pub flush_divisor: u64,
    #[serde(default = "default_shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_attempts")]
    pub backoff_max_attempts: u32,
    #[serde(default = "default_overwritable_capacity")]
    pub overwritable_capacity: usize,
    #[serde(default = "default_buffer_delay_ms")]
    pub buffer_delay_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            flush_divisor: default_flush_divisor(),
            shutdown_drain_secs: default_shutdown_drain_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_attempts: default_backoff_max_attempts(),
            overwritable_capacity: default_overwritable_capacity(),
            buffer_delay_ms: default_buffer_delay_ms(),
        }
    }
}

impl DispatchSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_secs)
    }

    pub fn buffer_flush_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_delay_ms / self.flush_divisor.max(1))
    }

    /// How stale a buffered (overwritable) event may get before a
    /// non-forced flush sends it anyway.
    pub fn buffer_delay(&self) -> Duration {
        Duration::from_millis(self.buffer_delay_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

impl Settings {
    /// Loads settings from `Config.toml` (if present) layered with
    /// built-in defaults, then applies `DBCACHE_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let raw = Config::builder()
            .add_source(File::with_name("Config.toml").required(false))
            .build()?;

        let mut settings: Self = raw.try_deserialize().unwrap_or_default();

        if let Ok(v) = env::var("DBCACHE_BASES_MAX_HARD") {
            if let Ok(parsed) = v.parse() {
                settings.cache.bases_max_hard = parsed;
            }
        }
        if let Ok(v) = env::var("DBCACHE_BASES_MAX_SOFT") {
            if let Ok(parsed) = v.parse() {
                settings.cache.bases_max_soft = parsed;
            }
        }
        if let Ok(v) = env::var("DBCACHE_FAIL_ON_HEAVY_LOAD") {
            settings.cache.fail_on_heavy_load = matches!(v.as_str(), "1" | "true" | "TRUE");
        }
        if let Ok(v) = env::var("DBCACHE_ALERT_ON_HEAVY_LOAD") {
            settings.cache.alert_on_heavy_load = matches!(v.as_str(), "1" | "true" | "TRUE");
        }
        if let Ok(v) = env::var("DBCACHE_MAX_RSS") {
            if let Ok(parsed) = v.parse() {
                settings.cache.max_rss = parsed;
            }
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_soft_max_to_hard() {
        let cache = CacheSettings::default();
        assert_eq!(cache.resolved_soft_max(), cache.bases_max_hard);
    }

    #[test]
    fn explicit_soft_max_is_clamped() {
        let mut cache = CacheSettings::default();
        cache.bases_max_soft = 5000;
        cache.bases_max_hard = 100;
        assert_eq!(cache.resolved_soft_max(), 100);
    }

    /// `Settings::load` reads `Config.toml` relative to the process cwd, so
    /// this test owns that global and must not run concurrently with
    /// anything else that touches it.
    #[test]
    fn load_reads_config_toml_from_cwd_and_applies_env_override() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Config.toml"),
            "[cache]\nbases_max_hard = 7\n\n[dispatch]\npoll_timeout_ms = 250\n",
        )
        .unwrap();

        let original_cwd = env::current_dir().unwrap();
        env::set_current_dir(dir.path()).unwrap();
        env::set_var("DBCACHE_BASES_MAX_HARD", "42");

        let result = Settings::load();

        env::remove_var("DBCACHE_BASES_MAX_HARD");
        env::set_current_dir(original_cwd).unwrap();

        let settings = result.unwrap();
        assert_eq!(settings.cache.bases_max_hard, 42, "env override wins over the file");
        assert_eq!(settings.dispatch.poll_timeout_ms, 250, "file value applies where no env override exists");
    }
}
