use crate::config::{MessageDefinition, PayloadDefinition, SessionFile};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default number of crash signals tolerated for one seed before moving on.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
/// Default pause between a detected crash and the retry of the same seed.
pub const DEFAULT_FAILURE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default time a receive waits for the target's response.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors raised by the in-memory session model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A message or subcomponent index does not exist in the session.
    #[error("Fuzz index {0} is out of range for this session")]
    InvalidIndex(String),
    /// A message was built without any subcomponent.
    #[error("A message needs at least one subcomponent")]
    NoSubcomponents,
    /// Message {0} of a session definition has no subcomponents.
    #[error("Message {0} has no subcomponents")]
    EmptyMessage(usize),
    /// A message-to-fuzz list could not be parsed.
    #[error("Invalid fuzz target list '{0}'")]
    InvalidTargetList(String),
    /// A payload in the session definition is malformed.
    #[error("Invalid payload in message {message}: {reason}")]
    InvalidPayload { message: usize, reason: String },
    /// The session has no messages at all.
    #[error("Session defines no messages")]
    NoMessages,
}

/// Direction of a message relative to the fuzzer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// Sent by the fuzzer to the target.
    #[default]
    Outbound,
    /// Sent by the target and received by the fuzzer.
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("outbound"),
            Direction::Inbound => f.write_str("inbound"),
        }
    }
}

/// Addresses either a whole message (`3`) or a single subcomponent (`3.1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FuzzIndex {
    Message(usize),
    Subcomponent { message: usize, subcomponent: usize },
}

impl FuzzIndex {
    pub fn message(&self) -> usize {
        match *self {
            FuzzIndex::Message(message) => message,
            FuzzIndex::Subcomponent { message, .. } => message,
        }
    }
}

impl fmt::Display for FuzzIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FuzzIndex::Message(message) => write!(f, "{message}"),
            FuzzIndex::Subcomponent {
                message,
                subcomponent,
            } => write!(f, "{message}.{subcomponent}"),
        }
    }
}

impl FromStr for FuzzIndex {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SessionError::InvalidTargetList(s.to_string());
        let s = s.trim();
        match s.split_once('.') {
            Some((message, subcomponent)) => Ok(FuzzIndex::Subcomponent {
                message: message.parse().map_err(|_| invalid())?,
                subcomponent: subcomponent.parse().map_err(|_| invalid())?,
            }),
            None => Ok(FuzzIndex::Message(s.parse().map_err(|_| invalid())?)),
        }
    }
}

/// The smallest independently mutable region of a message.
///
/// `original` is the immutable baseline loaded with the session; `altered` is the
/// working copy that hooks and the mutation engine rewrite during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subcomponent {
    original: Vec<u8>,
    altered: Vec<u8>,
    fuzzed: bool,
    fixed_size: Option<usize>,
}

impl Subcomponent {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            altered: bytes.clone(),
            original: bytes,
            fuzzed: false,
            fixed_size: None,
        }
    }

    pub fn fuzzed(mut self, fuzzed: bool) -> Self {
        self.fuzzed = fuzzed;
        self
    }

    pub fn with_fixed_size(mut self, fixed_size: Option<usize>) -> Self {
        self.fixed_size = fixed_size.filter(|size| *size > 0);
        self
    }

    pub fn original(&self) -> &[u8] {
        &self.original
    }

    pub fn altered(&self) -> &[u8] {
        &self.altered
    }

    pub fn set_altered(&mut self, bytes: Vec<u8>) {
        self.altered = bytes;
    }

    pub fn is_fuzzed(&self) -> bool {
        self.fuzzed
    }

    pub fn set_fuzzed(&mut self, fuzzed: bool) {
        self.fuzzed = fuzzed;
    }

    /// Mutated output for this subcomponent is truncated to this length.
    pub fn fixed_size(&self) -> Option<usize> {
        self.fixed_size
    }

    pub fn reset(&mut self) {
        self.altered.clone_from(&self.original);
    }
}

/// One step of the scripted exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    direction: Direction,
    subcomponents: Vec<Subcomponent>,
}

impl Message {
    pub fn new(
        direction: Direction,
        subcomponents: Vec<Subcomponent>,
    ) -> Result<Self, SessionError> {
        if subcomponents.is_empty() {
            return Err(SessionError::NoSubcomponents);
        }
        Ok(Self {
            direction,
            subcomponents,
        })
    }

    /// Convenience constructor for a message made of a single region.
    pub fn single(direction: Direction, bytes: Vec<u8>, fuzzed: bool) -> Self {
        Self {
            direction,
            subcomponents: vec![Subcomponent::new(bytes).fuzzed(fuzzed)],
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn subcomponents(&self) -> &[Subcomponent] {
        &self.subcomponents
    }

    pub fn subcomponents_mut(&mut self) -> &mut [Subcomponent] {
        &mut self.subcomponents
    }

    pub fn has_subcomponents(&self) -> bool {
        self.subcomponents.len() > 1
    }

    pub fn is_fuzzed(&self) -> bool {
        self.subcomponents.iter().any(Subcomponent::is_fuzzed)
    }

    pub fn original_bytes(&self) -> Vec<u8> {
        self.subcomponents
            .iter()
            .flat_map(|sub| sub.original().iter().copied())
            .collect()
    }

    pub fn altered_bytes(&self) -> Vec<u8> {
        self.subcomponents
            .iter()
            .flat_map(|sub| sub.altered().iter().copied())
            .collect()
    }

    /// Current altered buffer of every subcomponent, in order.
    ///
    /// Rebuilt on every call so a hook sees the edits earlier hooks made to its
    /// siblings.
    pub fn altered_parts(&self) -> Vec<Vec<u8>> {
        self.subcomponents
            .iter()
            .map(|sub| sub.altered().to_vec())
            .collect()
    }

    pub fn reset_altered(&mut self) {
        for sub in &mut self.subcomponents {
            sub.reset();
        }
    }
}

/// The last message the fuzzer mutated, kept for snapshots and findings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzedMessage {
    pub index: usize,
    pub bytes: Vec<u8>,
}

/// An ordered, replayable exchange with a target plus its fuzzing parameters.
#[derive(Debug, Clone)]
pub struct Session {
    /// `tcp`, `udp`, `L2raw`, an L3 protocol name or a protocol number.
    pub proto: String,
    pub port: u16,
    /// Connect to the target when set, otherwise listen for it.
    pub client_mode: bool,
    pub fuzz_direction: Direction,
    pub failure_threshold: u32,
    pub failure_timeout: Duration,
    pub receive_timeout: Duration,
    messages: Vec<Message>,
    targets: Vec<FuzzIndex>,
    current_target: usize,
}

impl Session {
    /// Builds a session from its messages with default parameters.
    ///
    /// The eligible fuzz targets are derived from the subcomponents already
    /// flagged as fuzzed: a message whose regions are all fuzzed becomes a
    /// whole-message target, otherwise each fuzzed region is its own target.
    pub fn new(messages: Vec<Message>) -> Result<Self, SessionError> {
        if messages.is_empty() {
            return Err(SessionError::NoMessages);
        }
        let mut targets = Vec::new();
        for (i, message) in messages.iter().enumerate() {
            let subs = message.subcomponents();
            if subs.iter().all(Subcomponent::is_fuzzed) {
                targets.push(FuzzIndex::Message(i));
            } else {
                targets.extend(
                    subs.iter()
                        .enumerate()
                        .filter(|(_, sub)| sub.is_fuzzed())
                        .map(|(j, _)| FuzzIndex::Subcomponent {
                            message: i,
                            subcomponent: j,
                        }),
                );
            }
        }
        Ok(Self {
            proto: "tcp".to_string(),
            port: 0,
            client_mode: true,
            fuzz_direction: Direction::Outbound,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_timeout: DEFAULT_FAILURE_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            messages,
            targets,
            current_target: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message_at(&self, index: usize) -> Result<&Message, SessionError> {
        self.messages
            .get(index)
            .ok_or_else(|| SessionError::InvalidIndex(index.to_string()))
    }

    pub fn message_at_mut(&mut self, index: usize) -> Result<&mut Message, SessionError> {
        self.messages
            .get_mut(index)
            .ok_or_else(|| SessionError::InvalidIndex(index.to_string()))
    }

    pub fn subcomponents_of(&self, index: usize) -> Result<&[Subcomponent], SessionError> {
        self.message_at(index).map(Message::subcomponents)
    }

    pub fn mark_fuzzed(&mut self, index: FuzzIndex) -> Result<(), SessionError> {
        self.set_fuzzed(index, true)
    }

    pub fn clear_fuzzed(&mut self, index: FuzzIndex) -> Result<(), SessionError> {
        self.set_fuzzed(index, false)
    }

    fn set_fuzzed(&mut self, index: FuzzIndex, fuzzed: bool) -> Result<(), SessionError> {
        let message = self
            .messages
            .get_mut(index.message())
            .ok_or_else(|| SessionError::InvalidIndex(index.to_string()))?;
        match index {
            FuzzIndex::Message(_) => {
                for sub in message.subcomponents_mut() {
                    sub.set_fuzzed(fuzzed);
                }
            }
            FuzzIndex::Subcomponent { subcomponent, .. } => {
                message
                    .subcomponents_mut()
                    .get_mut(subcomponent)
                    .ok_or_else(|| SessionError::InvalidIndex(index.to_string()))?
                    .set_fuzzed(fuzzed);
            }
        }
        Ok(())
    }

    pub fn clear_all_fuzzed(&mut self) {
        for message in &mut self.messages {
            for sub in message.subcomponents_mut() {
                sub.set_fuzzed(false);
            }
        }
    }

    pub fn reset_all_altered(&mut self) {
        for message in &mut self.messages {
            message.reset_altered();
        }
    }

    /// Eligible fuzz targets, in rotation order.
    pub fn targets(&self) -> &[FuzzIndex] {
        &self.targets
    }

    /// Replaces the eligible targets and marks exactly those as fuzzed.
    pub fn set_targets(&mut self, targets: Vec<FuzzIndex>) -> Result<(), SessionError> {
        self.clear_all_fuzzed();
        for target in &targets {
            self.mark_fuzzed(*target)?;
        }
        self.targets = targets;
        self.current_target = 0;
        Ok(())
    }

    pub fn current_target(&self) -> Option<FuzzIndex> {
        self.targets.get(self.current_target).copied()
    }

    /// Moves to the next eligible target. Returns `true` when the rotation wrapped
    /// back to the first one.
    pub fn rotate_target(&mut self) -> bool {
        if self.targets.is_empty() {
            return false;
        }
        self.current_target = (self.current_target + 1) % self.targets.len();
        self.current_target == 0
    }

    /// Leaves only the current target marked as fuzzed.
    pub fn focus_current_target(&mut self) -> Result<(), SessionError> {
        self.clear_all_fuzzed();
        match self.current_target() {
            Some(target) => self.mark_fuzzed(target),
            None => Ok(()),
        }
    }

    /// Exports an immutable definition of this session.
    ///
    /// When `fuzzed` is given, that message is replaced by the mutated bytes as a
    /// single region, so the export reproduces the fuzzed case without a seed.
    pub fn snapshot(&self, fuzzed: Option<&FuzzedMessage>) -> SessionFile {
        let messages = self
            .messages
            .iter()
            .enumerate()
            .map(|(i, message)| match fuzzed {
                Some(edit) if edit.index == i => MessageDefinition {
                    direction: message.direction(),
                    subcomponents: vec![PayloadDefinition::from_bytes(&edit.bytes, true, None)],
                },
                _ => MessageDefinition {
                    direction: message.direction(),
                    subcomponents: message
                        .subcomponents()
                        .iter()
                        .map(|sub| {
                            PayloadDefinition::from_bytes(
                                sub.original(),
                                sub.is_fuzzed(),
                                sub.fixed_size(),
                            )
                        })
                        .collect(),
                },
            })
            .collect();

        SessionFile {
            proto: self.proto.clone(),
            port: self.port,
            client_mode: self.client_mode,
            fuzz_direction: self.fuzz_direction,
            failure_threshold: self.failure_threshold,
            failure_timeout_secs: self.failure_timeout.as_secs_f64(),
            receive_timeout_secs: self.receive_timeout.as_secs_f64(),
            messages_to_fuzz: None,
            messages,
        }
    }
}
