use crate::mutator::{ByteFlipEngine, CommandEngine, MutationEngine, MutationError};
use crate::scheduler::{RunBounds, ScheduleMode};
use crate::session::{
    DEFAULT_FAILURE_THRESHOLD, Direction, FuzzIndex, Message, Session, SessionError, Subcomponent,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while turning user-facing settings into run parameters.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid run range '{0}', expected X, X- or X-Y")]
    InvalidRange(String),
    #[error("Invalid number list '{0}', expected X, X-Y or X,Y,Z-Q")]
    InvalidNumberList(String),
    #[error("Number list '{input}' expands to more than {limit} entries")]
    NumberListTooLong { input: String, limit: usize },
    #[error("Conflicting options: {0}")]
    Conflict(String),
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error(transparent)]
    Session(#[from] SessionError),
}

fn default_proto() -> String {
    "tcp".to_string()
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_failure_timeout_secs() -> f64 {
    5.0
}

fn default_receive_timeout_secs() -> f64 {
    1.0
}

/// A single payload region. Exactly one of `hex` or `text` must be set.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PayloadDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub fuzz: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_size: Option<usize>,
}

impl PayloadDefinition {
    pub fn from_bytes(bytes: &[u8], fuzz: bool, fixed_size: Option<usize>) -> Self {
        Self {
            hex: Some(hex::encode(bytes)),
            text: None,
            fuzz,
            fixed_size,
        }
    }

    /// Decodes the payload bytes; `message` is only used for error reporting.
    pub fn bytes(&self, message: usize) -> Result<Vec<u8>, SessionError> {
        match (&self.hex, &self.text) {
            (Some(encoded), None) => {
                hex::decode(encoded.trim()).map_err(|e| SessionError::InvalidPayload {
                    message,
                    reason: format!("bad hex: {e}"),
                })
            }
            (None, Some(text)) => Ok(text.as_bytes().to_vec()),
            _ => Err(SessionError::InvalidPayload {
                message,
                reason: "exactly one of 'hex' or 'text' must be given".to_string(),
            }),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MessageDefinition {
    pub direction: Direction,
    pub subcomponents: Vec<PayloadDefinition>,
}

/// On-disk form of a [`Session`]. Also produced by [`Session::snapshot`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SessionFile {
    #[serde(default = "default_proto")]
    pub proto: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_true")]
    pub client_mode: bool,
    #[serde(default)]
    pub fuzz_direction: Direction,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_timeout_secs")]
    pub failure_timeout_secs: f64,
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages_to_fuzz: Option<String>,
    pub messages: Vec<MessageDefinition>,
}

impl SessionFile {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read session file at {:?}: {}", path, e))?;

        let file: SessionFile = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from session file {:?}: {}", path, e)
        })?;

        Ok(file)
    }

    pub fn to_toml(&self) -> Result<String, anyhow::Error> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn to_json(&self) -> Result<String, anyhow::Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl TryFrom<SessionFile> for Session {
    type Error = ConfigError;

    fn try_from(file: SessionFile) -> Result<Self, Self::Error> {
        let mut messages = Vec::with_capacity(file.messages.len());
        for (i, definition) in file.messages.iter().enumerate() {
            let mut subcomponents = Vec::with_capacity(definition.subcomponents.len());
            for payload in &definition.subcomponents {
                subcomponents.push(
                    Subcomponent::new(payload.bytes(i)?)
                        .fuzzed(payload.fuzz)
                        .with_fixed_size(payload.fixed_size),
                );
            }
            let message = Message::new(definition.direction, subcomponents)
                .map_err(|_| SessionError::EmptyMessage(i))?;
            messages.push(message);
        }

        let mut session = Session::new(messages)?;
        session.proto = file.proto;
        session.port = file.port;
        session.client_mode = file.client_mode;
        session.fuzz_direction = file.fuzz_direction;
        session.failure_threshold = file.failure_threshold.max(1);
        session.failure_timeout = seconds("failure-timeout-secs", file.failure_timeout_secs)?;
        session.receive_timeout = seconds("receive-timeout-secs", file.receive_timeout_secs)?;
        if let Some(list) = &file.messages_to_fuzz {
            session.set_targets(parse_fuzz_targets(list)?)?;
        }
        Ok(session)
    }
}

/// Converts a user-supplied number of seconds into a `Duration`.
pub fn seconds(field: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        field,
        reason: e.to_string(),
    })
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EngineType {
    #[default]
    Command,
    ByteFlip,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    #[serde(default)]
    pub engine_type: EngineType,
    /// Program and arguments; `{seed}` is replaced with the run's seed.
    #[serde(default = "default_engine_command")]
    pub command: Vec<String>,
}

pub fn default_engine_command() -> Vec<String> {
    vec![
        "radamsa".to_string(),
        "--seed".to_string(),
        "{seed}".to_string(),
    ]
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            engine_type: EngineType::Command,
            command: default_engine_command(),
        }
    }
}

impl EngineSettings {
    /// Builds the engine and verifies it can be invoked.
    pub fn build(&self) -> Result<Box<dyn MutationEngine>, MutationError> {
        let engine: Box<dyn MutationEngine> = match self.engine_type {
            EngineType::Command => Box::new(CommandEngine::new(self.command.clone())?),
            EngineType::ByteFlip => Box::new(ByteFlipEngine::new()),
        };
        engine.check_available()?;
        Ok(engine)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_target_host")]
    pub target_host: String,
    /// Overrides the session's port when set.
    #[serde(default)]
    pub port: Option<u16>,
    /// `X`, `X-` or `X-Y`.
    #[serde(default)]
    pub range: Option<String>,
    /// `X`, `X-Y` or `X,Y,Z-Q`; seeds cycled in order.
    #[serde(default)]
    pub seed_loop: Option<String>,
    /// Iterations per fuzz target before rotating to the next one.
    #[serde(default)]
    pub round_robin: Option<u64>,
    /// Overrides the session's receive timeout.
    #[serde(default)]
    pub receive_timeout_secs: Option<f64>,
    /// Overrides the session's fuzz targets.
    #[serde(default)]
    pub messages_to_fuzz: Option<String>,
    #[serde(default)]
    pub sleep_secs: f64,
    #[serde(default)]
    pub harness: bool,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Run a single seed, sending traffic and dumping every packet.
    #[serde(default)]
    pub dump_raw: Option<u64>,
    /// Run a single seed, dumping every packet without touching the network.
    #[serde(default)]
    pub emulate: Option<u64>,
}

fn default_target_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            target_host: default_target_host(),
            port: None,
            range: None,
            seed_loop: None,
            round_robin: None,
            receive_timeout_secs: None,
            messages_to_fuzz: None,
            sleep_secs: 0.0,
            harness: false,
            log_dir: None,
            dump_raw: None,
            emulate: None,
        }
    }
}

impl FuzzerSettings {
    /// Resolves the mutually exclusive seed options into a schedule.
    pub fn schedule(&self) -> Result<(ScheduleMode, RunBounds), ConfigError> {
        let single = match (self.dump_raw, self.emulate) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Conflict(
                    "dump-raw and emulate are mutually exclusive".to_string(),
                ));
            }
            (seed, None) | (None, seed) => seed,
        };
        let exclusive = [self.range.is_some(), self.seed_loop.is_some(), single.is_some()];
        if exclusive.iter().filter(|set| **set).count() > 1 {
            return Err(ConfigError::Conflict(
                "only one of range, seed-loop, dump-raw or emulate may be given".to_string(),
            ));
        }

        if let Some(seed) = single {
            return Ok((ScheduleMode::Single(seed), RunBounds::single(seed)));
        }

        let bounds = match &self.range {
            Some(range) => parse_run_range(range)?,
            None => RunBounds::default(),
        };

        let mode = match (&self.seed_loop, self.round_robin) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Conflict(
                    "seed-loop and round-robin are mutually exclusive".to_string(),
                ));
            }
            (Some(list), None) => ScheduleMode::FiniteLoop(parse_number_list(list)?),
            (None, Some(0)) => {
                return Err(ConfigError::InvalidValue {
                    field: "round-robin",
                    reason: "window must be at least 1".to_string(),
                });
            }
            (None, Some(window)) => ScheduleMode::RoundRobin { window },
            (None, None) => ScheduleMode::Sequential,
        };
        Ok((mode, bounds))
    }

    pub fn single_seed(&self) -> Option<u64> {
        self.dump_raw.or(self.emulate)
    }

    pub fn sleep_time(&self) -> Result<Duration, ConfigError> {
        seconds("sleep-secs", self.sleep_secs)
    }

    pub fn receive_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        self.receive_timeout_secs
            .map(|secs| seconds("receive-timeout-secs", secs))
            .transpose()
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutineerConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub engine: EngineSettings,
}

impl MutineerConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: MutineerConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

/// Parses `X` (exactly X), `X-` (X onwards) or `X-Y`.
pub fn parse_run_range(input: &str) -> Result<RunBounds, ConfigError> {
    let invalid = || ConfigError::InvalidRange(input.to_string());
    let input = input.trim();
    match input.split_once('-') {
        Some((min, max)) => {
            let min: u64 = min.trim().parse().map_err(|_| invalid())?;
            if max.trim().is_empty() {
                return Ok(RunBounds { min, max: None });
            }
            let max: u64 = max.trim().parse().map_err(|_| invalid())?;
            if max < min {
                return Err(invalid());
            }
            Ok(RunBounds {
                min,
                max: Some(max),
            })
        }
        None => {
            let value: u64 = input.parse().map_err(|_| invalid())?;
            Ok(RunBounds::single(value))
        }
    }
}

/// Upper bound on the entries a number list may expand to.
pub const MAX_NUMBER_LIST_LEN: usize = 1 << 20;

/// Expands `X`, `X-Y` and comma-separated combinations into a flat list of at
/// most [`MAX_NUMBER_LIST_LEN`] entries.
pub fn parse_number_list(input: &str) -> Result<Vec<u64>, ConfigError> {
    let invalid = || ConfigError::InvalidNumberList(input.to_string());
    let too_long = || ConfigError::NumberListTooLong {
        input: input.to_string(),
        limit: MAX_NUMBER_LIST_LEN,
    };
    let mut values = Vec::new();
    for token in input.split(',') {
        let token = token.trim();
        match token.split_once('-') {
            Some((start, end)) => {
                let start: u64 = start.trim().parse().map_err(|_| invalid())?;
                let end: u64 = end.trim().parse().map_err(|_| invalid())?;
                if end < start {
                    return Err(invalid());
                }
                let room = (MAX_NUMBER_LIST_LEN - values.len()) as u64;
                if end - start >= room {
                    return Err(too_long());
                }
                values.extend(start..=end);
            }
            None => {
                if values.len() == MAX_NUMBER_LIST_LEN {
                    return Err(too_long());
                }
                values.push(token.parse().map_err(|_| invalid())?);
            }
        }
    }
    Ok(values)
}

/// Parses a messages-to-fuzz list: whole messages (`2`), ranges of whole
/// messages (`1-3`) and single subcomponents (`2.1`), comma separated.
pub fn parse_fuzz_targets(input: &str) -> Result<Vec<FuzzIndex>, SessionError> {
    let mut targets = Vec::new();
    for token in input.split(',') {
        let token = token.trim();
        if token.contains('.') {
            targets.push(token.parse()?);
            continue;
        }
        let numbers = parse_number_list(token)
            .map_err(|_| SessionError::InvalidTargetList(input.to_string()))?;
        for number in numbers {
            let index = usize::try_from(number)
                .map_err(|_| SessionError::InvalidTargetList(input.to_string()))?;
            targets.push(FuzzIndex::Message(index));
        }
    }
    Ok(targets)
}
