// SPDX-License-Identifier: Apache-2.0

//! Configuration model for the dynres resource manager.
//!
//! Options are resolved in three layers, later layers overriding earlier ones:
//! 1. built-in defaults,
//! 2. the `DYNRES_ARGS` option string (`--key=value` tokens),
//! 3. individual `DYNRES_<OPTION>` environment variables.
//!
//! The same option string syntax is accepted programmatically through
//! [`Options::parse_args`], so launchers can configure a sub-process without
//! touching the environment.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod error;

use error::ConfigError;

/// Ownership balancing policy of a sub-process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// The ownership state machine is disabled; lend/borrow calls are
    /// refused.
    #[default]
    None,
    /// Lend-when-idle over an anonymous CPU count (the process mask is
    /// synthesized from the number of CPUs).
    Lewi,
    /// Lend-when-idle over an explicit CPU mask.
    LewiMask,
}

impl Policy {
    /// Whether this policy drives the shared ownership state machine.
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Policy::None)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Policy::None => "none",
            Policy::Lewi => "lewi",
            Policy::LewiMask => "lewi_mask",
        };
        write!(f, "{label}")
    }
}

impl FromStr for Policy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "no" => Ok(Policy::None),
            "lewi" => Ok(Policy::Lewi),
            "lewi_mask" | "lewi-mask" => Ok(Policy::LewiMask),
            other => Err(ConfigError::InvalidValue {
                option: "policy",
                value: other.to_owned(),
                expected: "none | lewi | lewi_mask",
            }),
        }
    }
}

/// How a sub-process observes actions produced by other processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    /// The process discovers foreign actions on its next API call.
    #[default]
    Polling,
    /// A helper thread periodically reconciles state and runs callbacks.
    Async,
}

impl fmt::Display for InteractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InteractionMode::Polling => "polling",
            InteractionMode::Async => "async",
        };
        write!(f, "{label}")
    }
}

impl FromStr for InteractionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(InteractionMode::Polling),
            "async" => Ok(InteractionMode::Async),
            other => Err(ConfigError::InvalidValue {
                option: "mode",
                value: other.to_owned(),
                expected: "polling | async",
            }),
        }
    }
}

/// Ordering preference applied when borrowing CPUs from other processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LendPriority {
    /// Any available CPU, lowest id first.
    Any,
    /// CPUs close to the process mask first, then the rest.
    #[default]
    NearbyFirst,
    /// Only CPUs close to the process mask.
    NearbyOnly,
}

impl fmt::Display for LendPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LendPriority::Any => "any",
            LendPriority::NearbyFirst => "nearby_first",
            LendPriority::NearbyOnly => "nearby_only",
        };
        write!(f, "{label}")
    }
}

impl FromStr for LendPriority {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(LendPriority::Any),
            "nearby_first" | "nearby-first" => Ok(LendPriority::NearbyFirst),
            "nearby_only" | "nearby-only" => Ok(LendPriority::NearbyOnly),
            other => Err(ConfigError::InvalidValue {
                option: "priority",
                value: other.to_owned(),
                expected: "any | nearby_first | nearby_only",
            }),
        }
    }
}

bitflags::bitflags! {
    /// How the OpenMP thread-manager adapter interacts with the
    /// ownership state machine.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OmpToolOpts: u32 {
        /// Borrow CPUs opportunistically when tasks pile up.
        const BORROW = 1 << 0;
        /// Lend idle worker CPUs eagerly (outside blocking calls too).
        const LEND = 1 << 1;
    }
}

impl FromStr for OmpToolOpts {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut opts = OmpToolOpts::empty();
        for token in s.split(':').filter(|t| !t.is_empty()) {
            match token {
                "none" => {}
                "borrow" => opts |= OmpToolOpts::BORROW,
                "lend" => opts |= OmpToolOpts::LEND,
                other => {
                    return Err(ConfigError::InvalidValue {
                        option: "lewi-ompt",
                        value: other.to_owned(),
                        expected: "none | borrow | lend (colon separated)",
                    });
                }
            }
        }
        Ok(opts)
    }
}

bitflags::bitflags! {
    /// Debug behaviors that alter cleanup semantics.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DebugOpts: u32 {
        /// On deregister, push stolen CPUs back to their previous owner.
        const RETURN_STOLEN = 1 << 0;
        /// Emit a state dump of both tables when a fatal condition aborts.
        const DUMP_ON_FATAL = 1 << 1;
    }
}

impl FromStr for DebugOpts {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut opts = DebugOpts::empty();
        for token in s.split(':').filter(|t| !t.is_empty()) {
            match token {
                "return-stolen" | "return_stolen" => opts |= DebugOpts::RETURN_STOLEN,
                "dump-on-fatal" | "dump_on_fatal" => opts |= DebugOpts::DUMP_ON_FATAL,
                other => {
                    return Err(ConfigError::InvalidValue {
                        option: "debug-opts",
                        value: other.to_owned(),
                        expected: "return-stolen | dump-on-fatal (colon separated)",
                    });
                }
            }
        }
        Ok(opts)
    }
}

/// Default interval of the async helper thread.
const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Resolved configuration snapshot of a sub-process.
///
/// The struct is plain data; a copy is embedded into every sub-process
/// descriptor at init time and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Ownership balancing policy.
    pub policy: Policy,
    /// Enable the runtime mask controller (future-mask updates).
    pub drom: bool,
    /// Enable usage statistics accounting.
    pub stats: bool,
    /// Foreign action observation mode.
    pub mode: InteractionMode,
    /// Key distinguishing independent node-local instances.
    pub shm_key: String,
    /// CPUs managed by the instance; 0 derives it from the node.
    pub system_size: u32,
    /// Max concurrent processes = system size x multiplier.
    pub shm_size_multiplier: u32,
    /// Partitions processes into non-interacting groups.
    pub lewi_color: u32,
    /// Borrow ordering preference.
    pub priority: LendPriority,
    /// OpenMP adapter interaction flags.
    pub lewi_ompt: OmpToolOpts,
    /// Debug behaviors.
    pub debug_opts: DebugOpts,
    /// Async helper tick, milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            policy: Policy::default(),
            drom: false,
            stats: false,
            mode: InteractionMode::default(),
            shm_key: String::new(),
            system_size: 0,
            shm_size_multiplier: 1,
            lewi_color: 0,
            priority: LendPriority::default(),
            lewi_ompt: OmpToolOpts::empty(),
            debug_opts: DebugOpts::empty(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

/// Environment variable holding the option string.
pub const ARGS_ENV_VAR: &str = "DYNRES_ARGS";

/// Prefix of per-option environment variables.
const ENV_PREFIX: &str = "DYNRES_";

impl Options {
    /// Resolves options from defaults, then `DYNRES_ARGS`, then individual
    /// `DYNRES_<OPTION>` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut options = Options::default();
        if let Ok(args) = std::env::var(ARGS_ENV_VAR) {
            options.apply_args(&args)?;
        }
        for name in OPTION_NAMES {
            let var = format!("{ENV_PREFIX}{}", name.replace('-', "_").to_uppercase());
            if let Ok(value) = std::env::var(&var) {
                options.set(name, &value)?;
            }
        }
        Ok(options)
    }

    /// Parses an option string (`--key=value` tokens, whitespace separated)
    /// on top of the defaults.
    pub fn parse_args(args: &str) -> Result<Self, ConfigError> {
        let mut options = Options::default();
        options.apply_args(args)?;
        Ok(options)
    }

    /// Applies an option string on top of the current values.
    pub fn apply_args(&mut self, args: &str) -> Result<(), ConfigError> {
        for token in args.split_whitespace() {
            let stripped = token
                .strip_prefix("--")
                .ok_or_else(|| ConfigError::MalformedToken(token.to_owned()))?;
            match stripped.split_once('=') {
                Some((name, value)) => self.set(name, value)?,
                // A bare `--flag` enables a boolean option.
                None => self.set(stripped, "true")?,
            }
        }
        Ok(())
    }

    /// Sets a single option by name.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        match name {
            "policy" => self.policy = value.parse()?,
            "drom" => self.drom = parse_bool("drom", value)?,
            "stats" => self.stats = parse_bool("stats", value)?,
            "mode" => self.mode = value.parse()?,
            "shm-key" => self.shm_key = value.to_owned(),
            "system-size" => self.system_size = parse_number("system-size", value)?,
            "shm-size-multiplier" => {
                self.shm_size_multiplier = parse_number("shm-size-multiplier", value)?;
                if self.shm_size_multiplier == 0 {
                    return Err(ConfigError::InvalidValue {
                        option: "shm-size-multiplier",
                        value: value.to_owned(),
                        expected: "a positive integer",
                    });
                }
            }
            "lewi-color" => self.lewi_color = parse_number("lewi-color", value)?,
            "priority" => self.priority = value.parse()?,
            "lewi-ompt" => self.lewi_ompt = value.parse()?,
            "debug-opts" => self.debug_opts = value.parse()?,
            "poll-interval-ms" => self.poll_interval_ms = parse_number("poll-interval-ms", value)?,
            other => return Err(ConfigError::UnknownOption(other.to_owned())),
        }
        Ok(())
    }

    /// Returns the current value of an option as a string.
    pub fn get(&self, name: &str) -> Result<String, ConfigError> {
        let value = match name {
            "policy" => self.policy.to_string(),
            "drom" => self.drom.to_string(),
            "stats" => self.stats.to_string(),
            "mode" => self.mode.to_string(),
            "shm-key" => self.shm_key.clone(),
            "system-size" => self.system_size.to_string(),
            "shm-size-multiplier" => self.shm_size_multiplier.to_string(),
            "lewi-color" => self.lewi_color.to_string(),
            "priority" => self.priority.to_string(),
            "lewi-ompt" => format!("{:?}", self.lewi_ompt),
            "debug-opts" => format!("{:?}", self.debug_opts),
            "poll-interval-ms" => self.poll_interval_ms.to_string(),
            other => return Err(ConfigError::UnknownOption(other.to_owned())),
        };
        Ok(value)
    }

    /// The effective segment key: `<shm-key>[-<color>]`, where an empty
    /// `shm-key` falls back to the user id so unrelated jobs of the same
    /// user share a namespace while different users never collide.
    #[must_use]
    pub fn segment_key(&self) -> String {
        let base = if self.shm_key.is_empty() {
            // Same fallback the launcher tools use.
            uid().to_string()
        } else {
            self.shm_key.clone()
        };
        if self.lewi_color == 0 {
            base
        } else {
            format!("{base}-{}", self.lewi_color)
        }
    }

    /// Async helper tick as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Option names recognized by [`Options::set`], also used to derive the
/// per-option environment variable names.
pub const OPTION_NAMES: &[&str] = &[
    "policy",
    "drom",
    "stats",
    "mode",
    "shm-key",
    "system-size",
    "shm-size-multiplier",
    "lewi-color",
    "priority",
    "lewi-ompt",
    "debug-opts",
    "poll-interval-ms",
];

fn parse_bool(option: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            option,
            value: other.to_owned(),
            expected: "true | false",
        }),
    }
}

fn parse_number<T: FromStr>(option: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        option,
        value: value.to_owned(),
        expected: "an unsigned integer",
    })
}

fn uid() -> u32 {
    nix::unistd::getuid().as_raw()
}
