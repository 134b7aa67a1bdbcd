use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

/// Placeholder in an engine's argument list that is replaced with the seed.
pub const SEED_PLACEHOLDER: &str = "{seed}";

/// Upper bound on the number of bytes `ByteFlipEngine` touches per call.
const MAX_BYTE_FLIPS: usize = 8;

/// Errors from invoking a mutation engine. All of them are fatal for the process.
#[derive(Error, Debug)]
pub enum MutationError {
    #[error("Mutation engine command is empty")]
    EmptyCommand,
    #[error("Mutation engine '{0}' could not be found, did you build it?")]
    EngineNotFound(PathBuf),
    #[error("Failed to invoke mutation engine '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Mutation engine I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A `MutationEngine` turns a seed and an input buffer into a mutated buffer.
///
/// The same seed and input must always produce the same output, so a finding can
/// be reproduced from its seed alone.
pub trait MutationEngine: Send {
    fn name(&self) -> &str;

    /// Verifies the engine can be invoked at all. Called once at startup.
    fn check_available(&self) -> Result<(), MutationError> {
        Ok(())
    }

    fn mutate(&mut self, seed: u64, input: &[u8]) -> Result<Vec<u8>, MutationError>;
}

/// Runs an external program (radamsa by default) once per mutation.
///
/// The input is written to the child's stdin and the mutated bytes are read back
/// from its stdout. A nonzero exit status or stderr output does not fail the call.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(command: Vec<String>) -> Result<Self, MutationError> {
        let mut parts = command.into_iter();
        let program = parts.next().ok_or(MutationError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    fn resolve_program(&self) -> Option<PathBuf> {
        let candidate = Path::new(&self.program);
        if candidate.components().count() > 1 {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }
        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(&self.program))
            .find(|path| path.is_file())
    }
}

impl MutationEngine for CommandEngine {
    fn name(&self) -> &str {
        &self.program
    }

    fn check_available(&self) -> Result<(), MutationError> {
        self.resolve_program()
            .map(|_| ())
            .ok_or_else(|| MutationError::EngineNotFound(PathBuf::from(&self.program)))
    }

    fn mutate(&mut self, seed: u64, input: &[u8]) -> Result<Vec<u8>, MutationError> {
        let seed_str = seed.to_string();
        let args = self
            .args
            .iter()
            .map(|arg| arg.replace(SEED_PLACEHOLDER, &seed_str));

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| MutationError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Feed stdin from a separate thread so a large input cannot deadlock
        // against the child filling its stdout pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            let data = input.to_vec();
            std::thread::spawn(move || {
                let _ = stdin.write_all(&data);
            })
        });

        let output = child.wait_with_output()?;
        if let Some(handle) = writer {
            let _ = handle.join();
        }
        if !output.status.success() {
            tracing::debug!(
                engine = %self.program,
                status = %output.status,
                "mutation engine exited abnormally"
            );
        }
        Ok(output.stdout)
    }
}

/// In-process engine: adds small random values to a few bytes, driven by a
/// ChaCha8 stream seeded from the run's seed.
///
/// An empty input grows to a single zero byte before mutation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteFlipEngine;

impl ByteFlipEngine {
    pub fn new() -> Self {
        ByteFlipEngine
    }
}

impl MutationEngine for ByteFlipEngine {
    fn name(&self) -> &str {
        "byte-flip"
    }

    fn mutate(&mut self, seed: u64, input: &[u8]) -> Result<Vec<u8>, MutationError> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut bytes = input.to_vec();
        if bytes.is_empty() {
            bytes.push(0);
        }

        let flips = rng.random_range(1..=MAX_BYTE_FLIPS.min(bytes.len()));
        for _ in 0..flips {
            let random_add_value = rng.random_range(1u8..=15u8);
            let index = rng.random_range(0..bytes.len());
            bytes[index] = bytes[index].wrapping_add(random_add_value);
        }
        Ok(bytes)
    }
}

/// Applies a `MutationEngine` to a single fuzzed region and enforces the region's
/// size constraint.
pub struct MutationGateway {
    engine: Box<dyn MutationEngine>,
}

impl MutationGateway {
    pub fn new(engine: Box<dyn MutationEngine>) -> Self {
        Self { engine }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Mutates `bytes` with `seed`, truncating (never padding) to `fixed_size`.
    pub fn mutate(
        &mut self,
        seed: u64,
        bytes: &[u8],
        fixed_size: Option<usize>,
    ) -> Result<Vec<u8>, MutationError> {
        let mut mutated = self.engine.mutate(seed, bytes)?;
        if let Some(size) = fixed_size {
            mutated.truncate(size);
        }
        Ok(mutated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Appends a fixed tail so the output is always longer than the input.
    struct GrowingEngine;

    impl MutationEngine for GrowingEngine {
        fn name(&self) -> &str {
            "growing"
        }

        fn mutate(&mut self, seed: u64, input: &[u8]) -> Result<Vec<u8>, MutationError> {
            let mut out = input.to_vec();
            out.extend_from_slice(&seed.to_le_bytes());
            out.extend_from_slice(b"-TAIL-TAIL-TAIL");
            Ok(out)
        }
    }

    #[test]
    fn gateway_truncates_to_fixed_size() {
        let mut gateway = MutationGateway::new(Box::new(GrowingEngine));
        let out = gateway.mutate(7, b"abcd", Some(6)).unwrap();
        assert_eq!(out, b"abcd\x07\x00");
    }

    #[test]
    fn gateway_never_pads_short_output() {
        let mut gateway = MutationGateway::new(Box::new(ByteFlipEngine::new()));
        let out = gateway.mutate(1, b"ab", Some(64)).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn gateway_without_constraint_keeps_full_output() {
        let mut gateway = MutationGateway::new(Box::new(GrowingEngine));
        let out = gateway.mutate(0, b"x", None).unwrap();
        assert_eq!(out.len(), 1 + 8 + 15);
    }

    #[test]
    fn byte_flip_engine_is_deterministic_per_seed() {
        let mut engine = ByteFlipEngine::new();
        let input = b"GET / HTTP/1.1\r\n\r\n";
        let first = engine.mutate(1234, input).unwrap();
        let second = engine.mutate(1234, input).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), input.len());
        assert_ne!(first, input.to_vec());
    }

    #[test]
    fn byte_flip_engine_grows_empty_input() {
        let mut engine = ByteFlipEngine::new();
        let out = engine.mutate(9, &[]).unwrap();
        assert_eq!(out.len(), 1);
        assert_ne!(out[0], 0);
    }

    #[test]
    fn command_engine_rejects_empty_command() {
        assert!(matches!(
            CommandEngine::new(Vec::new()),
            Err(MutationError::EmptyCommand)
        ));
    }

    #[test]
    fn command_engine_reports_missing_binary() {
        let engine =
            CommandEngine::new(vec!["./this_engine_does_not_exist_ever_12345".to_string()])
                .unwrap();
        assert!(matches!(
            engine.check_available(),
            Err(MutationError::EngineNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn command_engine_pipes_input_and_substitutes_seed() {
        let mut engine = CommandEngine::new(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "cat; printf \"$0\"".to_string(),
            SEED_PLACEHOLDER.to_string(),
        ])
        .unwrap();
        engine.check_available().unwrap();
        let out = engine.mutate(42, b"payload:").unwrap();
        assert_eq!(out, b"payload:42");
    }

    #[cfg(unix)]
    #[test]
    fn command_engine_ignores_nonzero_exit_and_stderr() {
        let mut engine = CommandEngine::new(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "cat; echo oops >&2; exit 3".to_string(),
        ])
        .unwrap();
        let out = engine.mutate(0, b"data").unwrap();
        assert_eq!(out, b"data");
    }
}
