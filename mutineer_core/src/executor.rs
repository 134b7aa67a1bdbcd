use crate::hooks::MessageProcessor;
use crate::mutator::MutationGateway;
use crate::session::{Direction, FuzzedMessage, Message, Session};
use crate::signal::RunError;
use crate::transport::{Connection, Link, Transport};
use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;

/// How a run that raised no error ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Server mode accepted a peer other than the target and dropped it.
    SpuriousConnection { peer: String },
}

/// Replays a session once.
pub trait Executor {
    /// Performs one full pass over the session's messages. `seed == None` sends
    /// the messages without mutating them.
    fn perform_run(&mut self, session: &mut Session, seed: Option<u64>)
    -> Result<RunStatus, RunError>;

    /// The last message mutated by the most recent run, if any.
    fn last_fuzzed(&self) -> Option<&FuzzedMessage>;

    /// Releases resources kept across runs.
    fn shutdown(&mut self) {}
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    /// Overrides the session's receive timeout.
    pub receive_timeout: Option<Duration>,
    /// When set, every packet sent or received is also written to this directory.
    pub dump_dir: Option<PathBuf>,
    /// Skip all network traffic. Inbound messages are taken as received verbatim.
    pub emulate: bool,
}

/// Replays sessions over a real socket.
///
/// Outbound messages (those in the session's fuzz direction) go through the hook
/// and mutation pipeline and are sent; every other message is received and handed
/// to `post_receive`.
pub struct NetworkExecutor {
    transport: Transport,
    gateway: MutationGateway,
    processor: Box<dyn MessageProcessor>,
    options: ExecutorOptions,
    last_fuzzed: Option<FuzzedMessage>,
}

impl NetworkExecutor {
    pub fn new(
        transport: Transport,
        gateway: MutationGateway,
        processor: Box<dyn MessageProcessor>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            transport,
            gateway,
            processor,
            options,
            last_fuzzed: None,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    fn replay(
        &mut self,
        session: &mut Session,
        seed: Option<u64>,
        mut connection: Option<&mut Connection>,
    ) -> Result<(), RunError> {
        let fuzz_direction = session.fuzz_direction;
        let timeout = self
            .options
            .receive_timeout
            .unwrap_or(session.receive_timeout);

        for index in 0..session.len() {
            let message = session.message_at_mut(index)?;
            message.reset_altered();

            if message.direction() == fuzz_direction {
                if message.is_fuzzed() {
                    self.fuzz_message(message, index, seed)?;
                }
                let bytes = self.processor.pre_send(message.altered_bytes())?;
                let sent = match connection.as_deref_mut() {
                    Some(conn) => conn.send(&bytes),
                    None => Ok(()),
                };
                message.reset_altered();
                sent?;
                tracing::debug!(message = index, len = bytes.len(), "sent");
                self.dump(index, Direction::Outbound, seed, &bytes)?;
            } else {
                let expected = message.altered_bytes();
                let received = match connection.as_deref_mut() {
                    Some(conn) => {
                        let data = conn.receive(expected.len(), timeout, index)?;
                        tracing::debug!(
                            message = index,
                            len = data.len(),
                            expected = expected.len(),
                            "received"
                        );
                        self.processor.post_receive(&data, &expected, index)?;
                        data
                    }
                    None => expected,
                };
                self.dump(index, Direction::Inbound, seed, &received)?;
            }
        }
        Ok(())
    }

    /// Runs the pre-fuzz hooks, the mutation engine and the per-region pre-send
    /// hooks over one message, in that order.
    fn fuzz_message(
        &mut self,
        message: &mut Message,
        index: usize,
        seed: Option<u64>,
    ) -> Result<(), RunError> {
        let region_count = message.subcomponents().len();

        if message.has_subcomponents() {
            for region in 0..region_count {
                if !message.subcomponents()[region].is_fuzzed() {
                    continue;
                }
                let siblings = message.altered_parts();
                let current = siblings[region].clone();
                let edited = self.processor.pre_fuzz_subcomponent(current, &siblings)?;
                message.subcomponents_mut()[region].set_altered(edited);
            }
        } else {
            let current = message.altered_bytes();
            let edited = self.processor.pre_fuzz(current)?;
            message.subcomponents_mut()[0].set_altered(edited);
        }

        if let Some(seed) = seed {
            for sub in message
                .subcomponents_mut()
                .iter_mut()
                .filter(|sub| sub.is_fuzzed())
            {
                let mutated = self.gateway.mutate(seed, sub.altered(), sub.fixed_size())?;
                sub.set_altered(mutated);
            }
        }

        if message.has_subcomponents() {
            for region in 0..region_count {
                let siblings = message.altered_parts();
                let current = siblings[region].clone();
                let edited = self.processor.pre_send_subcomponent(current, &siblings)?;
                message.subcomponents_mut()[region].set_altered(edited);
            }
        }

        let altered = message.altered_bytes();
        let original_len = message.original_bytes().len();
        if altered != message.original_bytes() {
            tracing::info!(
                message = index,
                seed = ?seed,
                old_len = original_len,
                new_len = altered.len(),
                "message altered"
            );
        }
        self.last_fuzzed = Some(FuzzedMessage {
            index,
            bytes: altered,
        });
        Ok(())
    }

    fn dump(
        &self,
        index: usize,
        direction: Direction,
        seed: Option<u64>,
        bytes: &[u8],
    ) -> Result<(), RunError> {
        let Some(dir) = &self.options.dump_dir else {
            return Ok(());
        };
        let seed = seed.map_or_else(|| "none".to_string(), |s| s.to_string());
        let path = dir.join(format!("{index}-{direction}-seed-{seed}"));
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to dump packet to {}", path.display()))?;
        Ok(())
    }
}

impl Executor for NetworkExecutor {
    fn perform_run(
        &mut self,
        session: &mut Session,
        seed: Option<u64>,
    ) -> Result<RunStatus, RunError> {
        self.last_fuzzed = None;
        session.reset_all_altered();

        let mut connection = if self.options.emulate {
            None
        } else {
            self.processor
                .pre_connect(seed, self.transport.host(), session.port)?;
            match self
                .transport
                .connect(&session.proto, session.port, session.client_mode)?
            {
                Link::Connected(conn) => Some(conn),
                Link::Spurious(peer) => return Ok(RunStatus::SpuriousConnection { peer }),
            }
        };

        let result = self.replay(session, seed, connection.as_mut());
        if let Some(conn) = connection {
            conn.close();
        }
        session.reset_all_altered();
        result.map(|()| RunStatus::Completed)
    }

    fn last_fuzzed(&self) -> Option<&FuzzedMessage> {
        self.last_fuzzed.as_ref()
    }

    fn shutdown(&mut self) {
        self.transport.shutdown();
    }
}
