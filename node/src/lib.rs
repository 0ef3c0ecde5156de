use jackpot_execution::{RakePolicy, RoundConfig, SettlementConfig, Staking, WithdrawalConfig};
use serde::{Deserialize, Serialize};
use std::{fmt, num::NonZeroU32, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::Level;
use url::Url;

pub mod api;
pub mod defaults;
pub mod gateway;
mod retry;
pub mod table;

/// Configuration file for the jackpot node.
#[derive(Clone, Deserialize, Serialize)]
pub struct Config {
    pub port: u16,
    pub metrics_port: u16,
    /// Operator routes (deposits, resume). Bind it to a private interface.
    pub admin_port: u16,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,

    #[serde(default = "default_mailbox_size")]
    pub mailbox_size: usize,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_countdown_ms")]
    pub countdown_ms: u64,
    #[serde(default = "default_reveal_ms")]
    pub reveal_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_min_wager")]
    pub min_wager: u64,
    #[serde(default = "default_max_wager")]
    pub max_wager: u64,
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default = "default_rake_policy")]
    pub rake_policy: String,
    #[serde(default = "default_rake_bps")]
    pub rake_bps: u16,
    #[serde(default = "default_referral_bps")]
    pub referral_bps: u16,

    #[serde(default = "default_staking_rate_ppm_per_day")]
    pub staking_rate_ppm_per_day: u32,
    #[serde(default = "default_max_update_attempts")]
    pub max_update_attempts: usize,

    #[serde(default = "default_min_withdrawal")]
    pub min_withdrawal: u64,
    #[serde(default = "default_withdrawal_fee_bps")]
    pub withdrawal_fee_bps: u16,
    #[serde(default = "default_withdrawal_timeout_ms")]
    pub withdrawal_timeout_ms: u64,
    #[serde(default = "default_idempotency_namespace")]
    pub idempotency_namespace: String,
    #[serde(default = "default_withdrawal_history_limit")]
    pub withdrawal_history_limit: usize,

    #[serde(default = "default_referral_retry_ms")]
    pub referral_retry_ms: u64,
    #[serde(default = "default_referral_retry_max_ms")]
    pub referral_retry_max_ms: u64,

    #[serde(default = "default_wager_rate_per_second")]
    pub wager_rate_per_second: u32,

    /// Payout gateway endpoint. Transfers are only logged when unset.
    #[serde(default)]
    pub gateway_url: Option<String>,
    #[serde(default)]
    pub gateway_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: usize },
    #[error("{field} must be at most 10000 basis points (got {value})")]
    InvalidBps { field: &'static str, value: u16 },
    #[error("unknown rake policy: {value}")]
    InvalidRakePolicy { value: String },
    #[error("invalid round settings: {0}")]
    InvalidRound(&'static str),
    #[error("{field} must be a valid URL: {value}")]
    InvalidUrl { field: &'static str, value: String },
    #[error("{field} URL scheme must be http or https: {value}")]
    InvalidUrlScheme { field: &'static str, value: String },
    #[error("{first} and {second} must be different (both {port})")]
    PortConflict {
        first: &'static str,
        second: &'static str,
        port: u16,
    },
}

/// Where withdrawals are sent.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub url: Url,
    pub token: Option<String>,
}

pub struct ValidatedConfig {
    pub port: u16,
    pub metrics_port: u16,
    pub admin_port: u16,
    pub worker_threads: usize,
    pub log_level: Level,
    pub json_logs: bool,

    pub mailbox_size: usize,
    pub event_buffer: usize,
    pub tick_interval: Duration,

    pub round: RoundConfig,
    pub history_limit: usize,
    pub staking: Staking,
    pub withdrawal: WithdrawalConfig,
    pub withdrawal_history_limit: usize,
    pub referral_retry: Duration,
    pub referral_retry_max: Duration,
    pub wager_rate_per_second: NonZeroU32,
    pub gateway: Option<GatewayConfig>,
}

struct RedactedConfig<'a>(&'a Config);

impl fmt::Debug for RedactedConfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cfg = self.0;
        f.debug_struct("Config")
            .field("port", &cfg.port)
            .field("metrics_port", &cfg.metrics_port)
            .field("admin_port", &cfg.admin_port)
            .field("worker_threads", &cfg.worker_threads)
            .field("log_level", &cfg.log_level)
            .field("json_logs", &cfg.json_logs)
            .field("mailbox_size", &cfg.mailbox_size)
            .field("event_buffer", &cfg.event_buffer)
            .field("tick_interval_ms", &cfg.tick_interval_ms)
            .field("countdown_ms", &cfg.countdown_ms)
            .field("reveal_ms", &cfg.reveal_ms)
            .field("cooldown_ms", &cfg.cooldown_ms)
            .field("min_wager", &cfg.min_wager)
            .field("max_wager", &cfg.max_wager)
            .field("max_participants", &cfg.max_participants)
            .field("history_limit", &cfg.history_limit)
            .field("rake_policy", &cfg.rake_policy)
            .field("rake_bps", &cfg.rake_bps)
            .field("referral_bps", &cfg.referral_bps)
            .field("staking_rate_ppm_per_day", &cfg.staking_rate_ppm_per_day)
            .field("max_update_attempts", &cfg.max_update_attempts)
            .field("min_withdrawal", &cfg.min_withdrawal)
            .field("withdrawal_fee_bps", &cfg.withdrawal_fee_bps)
            .field("withdrawal_timeout_ms", &cfg.withdrawal_timeout_ms)
            .field("idempotency_namespace", &cfg.idempotency_namespace)
            .field("withdrawal_history_limit", &cfg.withdrawal_history_limit)
            .field("referral_retry_ms", &cfg.referral_retry_ms)
            .field("referral_retry_max_ms", &cfg.referral_retry_max_ms)
            .field("wager_rate_per_second", &cfg.wager_rate_per_second)
            .field("gateway_url", &cfg.gateway_url)
            .field(
                "gateway_token",
                &cfg.gateway_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

fn default_worker_threads() -> usize {
    defaults::DEFAULT_WORKER_THREADS
}

fn default_log_level() -> String {
    defaults::DEFAULT_LOG_LEVEL.to_string()
}

fn default_mailbox_size() -> usize {
    defaults::DEFAULT_MAILBOX_SIZE
}

fn default_event_buffer() -> usize {
    defaults::DEFAULT_EVENT_BUFFER
}

fn default_tick_interval_ms() -> u64 {
    defaults::DEFAULT_TICK_INTERVAL_MS
}

fn default_countdown_ms() -> u64 {
    defaults::DEFAULT_COUNTDOWN_MS
}

fn default_reveal_ms() -> u64 {
    defaults::DEFAULT_REVEAL_MS
}

fn default_cooldown_ms() -> u64 {
    defaults::DEFAULT_COOLDOWN_MS
}

fn default_min_wager() -> u64 {
    defaults::DEFAULT_MIN_WAGER
}

fn default_max_wager() -> u64 {
    defaults::DEFAULT_MAX_WAGER
}

fn default_max_participants() -> usize {
    defaults::DEFAULT_MAX_PARTICIPANTS
}

fn default_history_limit() -> usize {
    defaults::DEFAULT_HISTORY_LIMIT
}

fn default_rake_policy() -> String {
    defaults::DEFAULT_RAKE_POLICY.to_string()
}

fn default_rake_bps() -> u16 {
    defaults::DEFAULT_RAKE_BPS
}

fn default_referral_bps() -> u16 {
    defaults::DEFAULT_REFERRAL_BPS
}

fn default_staking_rate_ppm_per_day() -> u32 {
    defaults::DEFAULT_STAKING_RATE_PPM_PER_DAY
}

fn default_max_update_attempts() -> usize {
    defaults::DEFAULT_MAX_UPDATE_ATTEMPTS
}

fn default_min_withdrawal() -> u64 {
    defaults::DEFAULT_MIN_WITHDRAWAL
}

fn default_withdrawal_fee_bps() -> u16 {
    defaults::DEFAULT_WITHDRAWAL_FEE_BPS
}

fn default_withdrawal_timeout_ms() -> u64 {
    defaults::DEFAULT_WITHDRAWAL_TIMEOUT_MS
}

fn default_idempotency_namespace() -> String {
    defaults::DEFAULT_IDEMPOTENCY_NAMESPACE.to_string()
}

fn default_withdrawal_history_limit() -> usize {
    defaults::DEFAULT_WITHDRAWAL_HISTORY_LIMIT
}

fn default_referral_retry_ms() -> u64 {
    defaults::DEFAULT_REFERRAL_RETRY_MS
}

fn default_referral_retry_max_ms() -> u64 {
    defaults::DEFAULT_REFERRAL_RETRY_MAX_MS
}

fn default_wager_rate_per_second() -> u32 {
    defaults::DEFAULT_WAGER_RATE_PER_SECOND
}

fn ensure_nonzero(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(())
}

fn ensure_nonzero_u64(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value: 0 });
    }
    Ok(())
}

fn nonzero_u32(field: &'static str, value: u32) -> Result<NonZeroU32, ConfigError> {
    NonZeroU32::new(value).ok_or(ConfigError::InvalidNonZero {
        field,
        value: value as usize,
    })
}

fn ensure_distinct_ports(ports: [(&'static str, u16); 3]) -> Result<(), ConfigError> {
    for (i, &(first, port)) in ports.iter().enumerate() {
        if let Some(&(second, _)) = ports[i + 1..].iter().find(|(_, other)| *other == port) {
            return Err(ConfigError::PortConflict {
                first,
                second,
                port,
            });
        }
    }
    Ok(())
}

fn ensure_bps(field: &'static str, value: u16) -> Result<(), ConfigError> {
    if value > 10_000 {
        return Err(ConfigError::InvalidBps { field, value });
    }
    Ok(())
}

fn validate_http_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|_| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => {}
        _ => {
            return Err(ConfigError::InvalidUrlScheme {
                field,
                value: value.to_string(),
            })
        }
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
        });
    }
    Ok(url)
}

impl Config {
    pub fn redacted_debug(&self) -> impl fmt::Debug + '_ {
        RedactedConfig(self)
    }

    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        ensure_nonzero("worker_threads", self.worker_threads)?;
        ensure_nonzero("mailbox_size", self.mailbox_size)?;
        ensure_nonzero("event_buffer", self.event_buffer)?;
        ensure_nonzero("history_limit", self.history_limit)?;
        ensure_nonzero("withdrawal_history_limit", self.withdrawal_history_limit)?;
        ensure_nonzero("max_update_attempts", self.max_update_attempts)?;
        ensure_nonzero_u64("tick_interval_ms", self.tick_interval_ms)?;
        ensure_nonzero_u64("withdrawal_timeout_ms", self.withdrawal_timeout_ms)?;
        ensure_nonzero_u64("min_withdrawal", self.min_withdrawal)?;
        ensure_nonzero_u64("referral_retry_ms", self.referral_retry_ms)?;
        ensure_nonzero_u64("referral_retry_max_ms", self.referral_retry_max_ms)?;
        ensure_nonzero("idempotency_namespace", self.idempotency_namespace.len())?;
        ensure_bps("rake_bps", self.rake_bps)?;
        ensure_bps("referral_bps", self.referral_bps)?;
        ensure_bps("withdrawal_fee_bps", self.withdrawal_fee_bps)?;
        let wager_rate_per_second = nonzero_u32("wager_rate_per_second", self.wager_rate_per_second)?;

        ensure_distinct_ports([
            ("port", self.port),
            ("metrics_port", self.metrics_port),
            ("admin_port", self.admin_port),
        ])?;

        let policy =
            RakePolicy::from_str(&self.rake_policy).map_err(|_| ConfigError::InvalidRakePolicy {
                value: self.rake_policy.clone(),
            })?;
        let round = RoundConfig {
            countdown_ms: self.countdown_ms,
            reveal_ms: self.reveal_ms,
            cooldown_ms: self.cooldown_ms,
            min_wager: self.min_wager,
            max_wager: self.max_wager,
            max_participants: self.max_participants,
            settlement: SettlementConfig {
                policy,
                rake_bps: self.rake_bps,
                referral_bps: self.referral_bps,
            },
        };
        round.validate().map_err(ConfigError::InvalidRound)?;

        let gateway = self
            .gateway_url
            .as_deref()
            .map(|url| validate_http_url("gateway_url", url))
            .transpose()?
            .map(|url| GatewayConfig {
                url,
                token: self.gateway_token.clone(),
            });

        let log_level =
            Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
                value: self.log_level.clone(),
            })?;

        Ok(ValidatedConfig {
            port: self.port,
            metrics_port: self.metrics_port,
            admin_port: self.admin_port,
            worker_threads: self.worker_threads,
            log_level,
            json_logs: self.json_logs,
            mailbox_size: self.mailbox_size,
            event_buffer: self.event_buffer,
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            round,
            history_limit: self.history_limit,
            staking: Staking::new(self.staking_rate_ppm_per_day, self.max_update_attempts),
            withdrawal: WithdrawalConfig {
                min_amount: self.min_withdrawal,
                fee_bps: self.withdrawal_fee_bps,
                timeout: Duration::from_millis(self.withdrawal_timeout_ms),
                namespace: self.idempotency_namespace.into_bytes(),
            },
            withdrawal_history_limit: self.withdrawal_history_limit,
            referral_retry: Duration::from_millis(self.referral_retry_ms),
            referral_retry_max: Duration::from_millis(
                self.referral_retry_max_ms.max(self.referral_retry_ms),
            ),
            wager_rate_per_second,
            gateway,
        })
    }
}
