//! The graph executor: invoke the current node, commit, repeat.
//!
//! A run is a sequence of `(node, envelope)` pairs. Each `Advance` is
//! committed to the checkpoint store before the next node starts, so after a
//! crash the run resumes at the first node whose advance was not yet durable.
//! `Done` clears the checkpoint; `Failed` and every executor-level failure
//! leave it in place for inspection and manual resume.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, info_span, warn};

use crate::capability::Capabilities;
use crate::core::ids::{NodeRef, RunId};
use crate::core::types::{StateEnvelope, Transition};
use crate::error::{ErrorInfo, ErrorKind, RunError, StoreError, classify};
use crate::graph::abort::AbortSignal;
use crate::graph::node::{Node, NodeRegistry};
use crate::io::checkpoint::{Checkpoint, CheckpointStore};
use crate::io::journal::{JournalEntry, StepJournal};

/// Knobs that apply to every run of an executor.
#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    /// Upper bound on a single node invocation; `None` waits indefinitely.
    pub node_timeout: Option<Duration>,
    pub abort: AbortSignal,
    pub journal: Option<StepJournal>,
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Terminated { result: Value },
    Aborted { error: ErrorInfo },
}

impl RunOutcome {
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            Self::Aborted { error } => Some(error),
            Self::Terminated { .. } => None,
        }
    }
}

/// What one `step` did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    Advanced { next: NodeRef },
    Terminated,
    Aborted { kind: ErrorKind },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub node: NodeRef,
    pub event: StepEvent,
    /// Checkpoint sequence after the step.
    pub seq: u64,
    pub duration: Duration,
}

/// Drives runs over a fixed registry, store and capability table.
pub struct GraphExecutor {
    registry: NodeRegistry,
    store: Arc<dyn CheckpointStore>,
    caps: Arc<Capabilities>,
    options: ExecutorOptions,
}

impl GraphExecutor {
    pub fn new(
        registry: NodeRegistry,
        store: Arc<dyn CheckpointStore>,
        caps: Capabilities,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            registry,
            store,
            caps: Arc::new(caps),
            options,
        }
    }

    /// Start `run_id` at `start` with `initial`, or resume it if a checkpoint
    /// already exists (the initial state is then ignored).
    pub fn start_run(
        &self,
        run_id: &RunId,
        start: &NodeRef,
        initial: StateEnvelope,
    ) -> Result<RunHandle<'_>, RunError> {
        match self.store.load(run_id) {
            Ok(checkpoint) => {
                info!(run_id = %run_id, node = %checkpoint.node, seq = checkpoint.seq, "checkpoint found, resuming instead of starting");
                return self.handle_from(checkpoint);
            }
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        if !self.registry.contains(start) {
            return Err(RunError::UnknownNode(start.clone()));
        }
        info!(run_id = %run_id, node = %start, "starting run");
        Ok(RunHandle {
            exec: self,
            run_id: run_id.clone(),
            seq: 0,
            resumed: false,
            running: Some((start.clone(), initial)),
            outcome: None,
        })
    }

    /// Resume `run_id` from its last committed checkpoint.
    pub fn resume_run(&self, run_id: &RunId) -> Result<RunHandle<'_>, RunError> {
        let checkpoint = self.store.load(run_id)?;
        info!(run_id = %run_id, node = %checkpoint.node, seq = checkpoint.seq, "resuming run");
        self.handle_from(checkpoint)
    }

    fn handle_from(&self, checkpoint: Checkpoint) -> Result<RunHandle<'_>, RunError> {
        if !self.registry.contains(&checkpoint.node) {
            return Err(RunError::CorruptData {
                run_id: checkpoint.run_id,
                reason: format!("checkpoint names unregistered node {}", checkpoint.node),
            });
        }
        Ok(RunHandle {
            exec: self,
            run_id: checkpoint.run_id,
            seq: checkpoint.seq,
            resumed: true,
            running: Some((checkpoint.node, checkpoint.state)),
            outcome: None,
        })
    }

    /// Run `node` on a worker thread and wait for its transition.
    ///
    /// A timed-out worker is abandoned, not killed; its eventual result is
    /// dropped and never reaches the store.
    fn invoke(&self, node_ref: &NodeRef, node: Arc<dyn Node>, state: StateEnvelope) -> Transition {
        let caps = Arc::clone(&self.caps);
        let (tx, rx) = mpsc::sync_channel(1);
        let spawned = thread::Builder::new()
            .name(format!("node-{node_ref}"))
            .spawn(move || {
                let result = node.run(state, &caps);
                // the receiver is gone if the invocation already timed out
                let _ = tx.send(result);
            });
        if let Err(err) = spawned {
            return Transition::Failed {
                error: ErrorInfo::capability(format!("spawn node worker: {err}")).at(node_ref),
            };
        }

        let received = match self.options.node_timeout {
            Some(limit) => rx.recv_timeout(limit),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(Ok(transition)) => transition,
            Ok(Err(err)) => Transition::Failed {
                error: classify(node_ref, err),
            },
            Err(RecvTimeoutError::Timeout) => {
                let limit = self.options.node_timeout.unwrap_or_default();
                warn!(node = %node_ref, timeout_ms = limit.as_millis() as u64, "node timed out");
                Transition::Failed {
                    error: ErrorInfo::capability(format!("node timed out after {limit:?}"))
                        .at(node_ref),
                }
            }
            Err(RecvTimeoutError::Disconnected) => Transition::Failed {
                error: ErrorInfo::capability("node panicked before returning a transition")
                    .at(node_ref),
            },
        }
    }
}

/// A live run. Dropping it at any point is equivalent to a crash after the
/// last committed checkpoint.
pub struct RunHandle<'a> {
    exec: &'a GraphExecutor,
    run_id: RunId,
    seq: u64,
    resumed: bool,
    running: Option<(NodeRef, StateEnvelope)>,
    outcome: Option<RunOutcome>,
}

impl RunHandle<'_> {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Sequence number of the last committed checkpoint (0 before the first).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// True when the handle was recovered from a checkpoint.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Node about to run and the envelope it will receive.
    pub fn current(&self) -> Option<(&NodeRef, &StateEnvelope)> {
        self.running.as_ref().map(|(node, state)| (node, state))
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.outcome.as_ref()
    }

    /// Execute one transition. Returns `None` once the run has finished.
    pub fn step(&mut self) -> Option<StepReport> {
        let (node_ref, state) = self.running.take()?;
        let started = Instant::now();
        let span = info_span!("step", run_id = %self.run_id, node = %node_ref, seq = self.seq);
        let _enter = span.enter();

        if self.exec.options.abort.is_raised() {
            info!("abort signal raised, stopping before node");
            let error = ErrorInfo::new(ErrorKind::Cancelled, "run aborted before node started")
                .at(&node_ref);
            return Some(self.abort(node_ref, &state, error, started));
        }
        let Some(node) = self.exec.registry.resolve(&node_ref) else {
            let error = ErrorInfo::new(ErrorKind::CorruptData, format!("node {node_ref} is not registered"))
                .at(&node_ref);
            return Some(self.abort(node_ref, &state, error, started));
        };

        let prev = state.clone();
        debug!("invoking node");
        match self.exec.invoke(&node_ref, Arc::clone(&node), state) {
            Transition::Advance { next, state } => {
                if !self.exec.registry.contains(&next) {
                    let error = ErrorInfo::violation(format!("advance to unregistered node {next}"))
                        .at(&node_ref);
                    return Some(self.abort(node_ref, &prev, error, started));
                }
                let errors = node.validate_advance(&prev, &next, &state);
                if !errors.is_empty() {
                    warn!(violations = errors.len(), "advance failed structural validation");
                    let error = ErrorInfo::violation(errors.join("; ")).at(&node_ref);
                    return Some(self.abort(node_ref, &prev, error, started));
                }
                match self.exec.store.save(&self.run_id, self.seq, &next, &state) {
                    Ok(seq) => {
                        self.seq = seq;
                        info!(next = %next, seq, "advanced");
                        self.journal(&node_ref, "advance", Some(&next), &state, None, started);
                        self.running = Some((next.clone(), state));
                        Some(StepReport {
                            node: node_ref,
                            event: StepEvent::Advanced { next },
                            seq,
                            duration: started.elapsed(),
                        })
                    }
                    Err(err) => {
                        let error = ErrorInfo::new(ErrorKind::IoFailure, err.to_string()).at(&node_ref);
                        Some(self.abort(node_ref, &prev, error, started))
                    }
                }
            }
            Transition::Done { result } => {
                if let Err(err) = self.exec.store.clear(&self.run_id) {
                    let error = ErrorInfo::new(ErrorKind::IoFailure, err.to_string()).at(&node_ref);
                    return Some(self.abort(node_ref, &prev, error, started));
                }
                info!("run terminated");
                self.journal(&node_ref, "done", None, &prev, None, started);
                self.outcome = Some(RunOutcome::Terminated { result });
                Some(StepReport {
                    node: node_ref,
                    event: StepEvent::Terminated,
                    seq: self.seq,
                    duration: started.elapsed(),
                })
            }
            Transition::Failed { error } => {
                let error = error.at(&node_ref);
                Some(self.abort(node_ref, &prev, error, started))
            }
        }
    }

    /// Drive the run to a terminal outcome, reporting each step.
    pub fn run<F: FnMut(&StepReport)>(mut self, mut on_step: F) -> RunOutcome {
        while let Some(report) = self.step() {
            on_step(&report);
        }
        self.outcome.take().unwrap_or_else(|| RunOutcome::Aborted {
            error: ErrorInfo::new(ErrorKind::Cancelled, "run stopped without an outcome"),
        })
    }

    fn abort(
        &mut self,
        node_ref: NodeRef,
        state: &StateEnvelope,
        error: ErrorInfo,
        started: Instant,
    ) -> StepReport {
        warn!(kind = %error.kind, message = %error.message, "run aborted; checkpoint left in place");
        self.journal(&node_ref, "failed", None, state, Some(&error), started);
        let kind = error.kind;
        self.outcome = Some(RunOutcome::Aborted { error });
        StepReport {
            node: node_ref,
            event: StepEvent::Aborted { kind },
            seq: self.seq,
            duration: started.elapsed(),
        }
    }

    fn journal(
        &self,
        node: &NodeRef,
        transition: &str,
        next: Option<&NodeRef>,
        state: &StateEnvelope,
        error: Option<&ErrorInfo>,
        started: Instant,
    ) {
        let Some(journal) = &self.exec.options.journal else {
            return;
        };
        let entry = JournalEntry {
            run_id: self.run_id.clone(),
            seq: self.seq,
            node: node.clone(),
            transition: transition.to_string(),
            next: next.cloned(),
            test_count: state.test_count,
            cycle_index: state.cycle_index,
            requirement: state.open_requirement().map(str::to_string),
            error: error.cloned(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        if let Err(err) = journal.record(&entry) {
            warn!(err = %err, "failed to write journal entry");
        }
    }
}
