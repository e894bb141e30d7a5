//! Run configuration loaded from a TOML file.
//!
//! The path comes from `--config` or `$EVCHECK_CONFIG`. Durations are
//! Go-style strings (`1m30s`, `250ms`) and are parsed during validation,
//! which fails on the first offending field.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use evcheck_core::{HarnessError, HarnessResult};
use evcheck_net::{AttackPlan, FaultInjection, ReceiverSettings, DEFAULT_WORKERS};

/// Upper bound on channel buffers.
const MAX_BUFFER: u64 = i32::MAX as u64;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// How long the attack runs.
    pub duration: String,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
    /// Presence enables ordering mode.
    pub ordered: Option<OrderedConfig>,

    #[serde(skip)]
    pub parsed_duration: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SenderConfig {
    pub disabled: bool,
    pub target: String,
    /// Requests per second.
    pub frequency: i64,
    /// Attack workers. 0 picks the default.
    pub workers: u64,
    pub keep_alive: bool,
    /// Pause before the attack so the receiver is up.
    pub start_delay: String,

    #[serde(skip)]
    pub parsed_start_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReceiverConfig {
    pub port: u16,
    /// Grace period for in-flight deliveries after the attack stops.
    pub timeout: String,
    pub max_duplicates_percentage: Option<i64>,
    pub include_remote_address_label: Option<bool>,
    pub fault: Option<FaultConfig>,

    #[serde(skip)]
    pub parsed_timeout: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FaultConfig {
    /// Requires `max_sleep_duration`.
    pub min_sleep_duration: Option<String>,
    pub max_sleep_duration: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrderedConfig {
    pub num_partition_keys: i64,
    /// Compare each partition's received order with its sent order.
    ///
    /// Sent order is the order in which responses came back and the
    /// correlator finalised events, not the order requests reached the
    /// broker. With more than one sender worker, requests race each other
    /// and an in-order broker can still fail the check, so set
    /// `sender.workers = 1` when enabling this.
    pub verify_order: bool,
}

// --- Defaults ---

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            target: String::new(),
            frequency: 0,
            workers: 0,
            keep_alive: false,
            start_delay: "10s".into(),
            parsed_start_delay: Duration::ZERO,
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            timeout: String::new(),
            max_duplicates_percentage: None,
            include_remote_address_label: None,
            fault: None,
            parsed_timeout: Duration::ZERO,
        }
    }
}

// --- Validation ---

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("parsing config")?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field and fill in parsed values and defaults.
    pub fn validate(&mut self) -> HarnessResult<()> {
        self.parsed_duration = parse_field("duration", &self.duration)?;

        let active = !self.sender.disabled;
        if active && self.sender.frequency <= 0 {
            return Err(HarnessError::invalid(
                "sender.frequency",
                "frequency cannot be less or equal to 0",
            ));
        }
        if active && self.sender.target.is_empty() {
            return Err(HarnessError::invalid("sender.target", "target cannot be empty"));
        }

        if self.receiver.max_duplicates_percentage.is_some_and(|p| p < 0) {
            return Err(HarnessError::invalid(
                "receiver.maxDuplicatesPercentage",
                "cannot be negative",
            ));
        }

        self.fault_injection()?;

        if active {
            let target = url::Url::parse(&self.sender.target)
                .map_err(|e| HarnessError::invalid("sender.target", e.to_string()))?;
            if target.cannot_be_a_base() {
                return Err(HarnessError::invalid(
                    "sender.target",
                    "target must be an absolute URL",
                ));
            }
        }

        if let Some(ordered) = &self.ordered {
            if !(1..=i64::from(u8::MAX)).contains(&ordered.num_partition_keys) {
                return Err(HarnessError::invalid(
                    "ordered.numPartitionKeys",
                    format!(
                        "must be between 1 and {}, got {}",
                        u8::MAX,
                        ordered.num_partition_keys
                    ),
                ));
            }
        }

        if self.sender.workers == 0 {
            self.sender.workers = DEFAULT_WORKERS as u64;
        }
        self.sender.parsed_start_delay =
            parse_field("sender.startDelay", &self.sender.start_delay)?;
        self.receiver.parsed_timeout = parse_field("receiver.timeout", &self.receiver.timeout)?;

        Ok(())
    }

    /// Parsed fault bounds, `None` when no minimum sleep is configured.
    pub fn fault_injection(&self) -> HarnessResult<Option<FaultInjection>> {
        let Some(fault) = &self.receiver.fault else {
            return Ok(None);
        };
        let Some(min) = &fault.min_sleep_duration else {
            return Ok(None);
        };
        let Some(max) = &fault.max_sleep_duration else {
            return Err(HarnessError::invalid(
                "receiver.fault.maxSleepDuration",
                format!("maxSleepDuration must be specified when minSleepDuration ({min}) is configured"),
            ));
        };
        let min_sleep = parse_field("receiver.fault.minSleepDuration", min)?;
        let max_sleep = parse_field("receiver.fault.maxSleepDuration", max)?;
        if min_sleep > max_sleep {
            return Err(HarnessError::invalid(
                "receiver.fault.maxSleepDuration",
                format!("maxSleepDuration ({max}) is less than minSleepDuration ({min})"),
            ));
        }
        Ok(Some(FaultInjection {
            min_sleep,
            max_sleep,
        }))
    }

    /// Partition count when ordering mode is on.
    pub fn num_partition_keys(&self) -> Option<u8> {
        self.ordered
            .as_ref()
            .and_then(|o| u8::try_from(o.num_partition_keys).ok())
    }

    pub fn verify_order(&self) -> bool {
        self.ordered.as_ref().is_some_and(|o| o.verify_order)
    }

    /// Order verification with concurrent senders, where sent order only
    /// approximates broker arrival order.
    pub fn order_check_races_workers(&self) -> bool {
        self.verify_order() && !self.sender.disabled && self.sender.workers > 1
    }

    /// Capacity of every run channel: one slot per planned request,
    /// clamped to `[1, 2^31 - 1]`.
    pub fn buffer_size(&self) -> usize {
        let frequency = u64::try_from(self.sender.frequency).unwrap_or(0);
        let planned = self.parsed_duration.as_secs().saturating_mul(frequency);
        usize::try_from(planned.clamp(1, MAX_BUFFER)).unwrap_or(usize::MAX)
    }

    pub fn attack_plan(&self) -> AttackPlan {
        AttackPlan {
            rate: u64::try_from(self.sender.frequency).unwrap_or(0),
            duration: self.parsed_duration,
            workers: usize::try_from(self.sender.workers).unwrap_or(DEFAULT_WORKERS),
            keep_alive: self.sender.keep_alive,
            ..AttackPlan::default()
        }
    }

    pub fn receiver_settings(&self) -> HarnessResult<ReceiverSettings> {
        Ok(ReceiverSettings {
            port: self.receiver.port,
            fault: self.fault_injection()?,
        })
    }
}

/// Read and validate the config at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Config::from_toml(&content).with_context(|| format!("loading {}", path.display()))
}

fn parse_field(field: &str, value: &str) -> HarnessResult<Duration> {
    parse_duration(value).map_err(|reason| HarnessError::invalid(field, reason))
}

// --- Durations ---

/// Parse a Go-style duration: a sequence of decimal numbers, each with a
/// unit suffix (`ns`, `us`, `µs`, `ms`, `s`, `m`, `h`). A bare `0` is
/// accepted; negative durations are not.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.strip_prefix('+').unwrap_or(input);
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(format!("invalid duration {input:?}"));
    }
    if s.starts_with('-') {
        return Err(format!("negative duration {input:?}"));
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let split = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        let (number, tail) = rest.split_at(split);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration {input:?}"))?;

        let split = tail.find(is_number).unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(split);
        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("missing unit in duration {input:?}")),
            other => return Err(format!("unknown unit {other:?} in duration {input:?}")),
        };
        nanos += value * scale;
        rest = tail;
    }

    if nanos > u64::MAX as f64 {
        return Err(format!("invalid duration {input:?}"));
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}
