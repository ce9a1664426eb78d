//! Worker bridge
//!
//! Runs the force simulation and analytics either on a dedicated background
//! thread or inline on the caller's thread. Both modes share [`WorkerCore`],
//! so they emit the same events in the same order; the only difference is
//! who drives the ticks. In background mode the thread ticks on its own
//! between commands, in inline mode the engine calls [`WorkerBridge::pump`].
//!
//! Cancellation is cooperative: [`WorkerBridge::advance_epoch`] bumps a
//! shared counter that the core checks before every tick, so a stop takes
//! effect at the next tick boundary even if the `STOP` command is still
//! queued behind other work.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tracing::{debug, trace, warn};

use crate::analytics::{self, PathResult};
use crate::error::WorkerError;
use crate::model::GraphSnapshot;
use crate::protocol::{EndReason, WorkerCommand, WorkerEvent, WorkerMessage, WorkerRequest};
use crate::simulation::ForceSimulator;

const THREAD_NAME: &str = "notegraph-worker";

/// Where work is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// On the caller's thread, ticked through [`WorkerBridge::pump`]
    Inline,
    /// On a dedicated background thread
    Background,
}

/// Job handed to a [`Spawner`]
pub type WorkerJob = Box<dyn FnOnce() + Send + 'static>;

/// Starts the background thread
pub type Spawner = Box<dyn FnOnce(WorkerJob) -> io::Result<JoinHandle<()>>>;

fn spawn_thread(job: WorkerJob) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name(THREAD_NAME.to_string()).spawn(job)
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Command processing and ticking, independent of where it runs
pub(crate) struct WorkerCore {
    simulation: Option<ForceSimulator>,
    snapshot: GraphSnapshot,
    run_id: u64,
    run_correlation: u64,
    epoch: Arc<AtomicU64>,
    last_tick: Option<Instant>,
}

impl WorkerCore {
    pub(crate) fn new(epoch: Arc<AtomicU64>) -> Self {
        Self {
            simulation: None,
            snapshot: GraphSnapshot::default(),
            run_id: 0,
            run_correlation: 0,
            epoch,
            last_tick: None,
        }
    }

    fn message(&self, correlation_id: u64, event: WorkerEvent) -> WorkerMessage {
        WorkerMessage {
            correlation_id,
            run_id: self.run_id,
            version: self.snapshot.version,
            event,
        }
    }

    fn error(&self, correlation_id: u64, message: impl Into<String>, context: &str) -> WorkerMessage {
        self.message(
            correlation_id,
            WorkerEvent::WorkerError {
                message: message.into(),
                context: Some(context.to_string()),
            },
        )
    }

    /// Whether the current run may tick
    pub(crate) fn is_ticking(&self) -> bool {
        self.simulation.as_ref().is_some_and(ForceSimulator::is_running)
            && self.run_id == self.epoch.load(Ordering::Acquire)
    }

    fn handle(&mut self, request: WorkerRequest, out: &mut Vec<WorkerMessage>) -> Flow {
        let name = request.command.name();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.apply(request, out)));
        result.unwrap_or_else(|payload| {
            self.simulation = None;
            out.push(self.error(0, panic_message(payload.as_ref()), name));
            Flow::Continue
        })
    }

    fn apply(&mut self, request: WorkerRequest, out: &mut Vec<WorkerMessage>) -> Flow {
        let id = request.correlation_id;
        trace!(command = request.command.name(), correlation_id = id, "worker command");

        match request.command {
            WorkerCommand::Init {
                snapshot,
                config,
                epoch,
            } => {
                let simulation = ForceSimulator::new(&snapshot, config);
                self.run_id = epoch;
                self.run_correlation = id;
                self.last_tick = None;
                self.snapshot = snapshot;
                out.push(self.message(
                    id,
                    WorkerEvent::SimulationInitialized {
                        node_count: simulation.node_count(),
                        edge_count: simulation.link_count(),
                    },
                ));
                self.simulation = Some(simulation);
            }
            WorkerCommand::Start { epoch } => match self.simulation.as_mut() {
                Some(simulation) => {
                    simulation.start();
                    self.run_id = epoch;
                    self.run_correlation = id;
                    self.last_tick = None;
                }
                None => out.push(self.error(id, "no simulation to start", "START")),
            },
            WorkerCommand::Stop => {
                if let Some(simulation) = self.simulation.as_mut() {
                    simulation.stop();
                    let event = WorkerEvent::SimulationEnded {
                        positions: simulation.positions(),
                        reason: EndReason::Stopped,
                        iterations: simulation.iteration(),
                    };
                    out.push(self.message(id, event));
                }
            }
            WorkerCommand::SetNodePosition { node_id, x, y } => {
                let moved = self
                    .simulation
                    .as_mut()
                    .is_some_and(|simulation| simulation.set_node_position(&node_id, x, y));
                if !moved {
                    out.push(self.error(id, format!("cannot move node '{node_id}'"), "SET_NODE_POSITION"));
                }
            }
            WorkerCommand::ReleaseNode { node_id } => {
                let released = self
                    .simulation
                    .as_mut()
                    .is_some_and(|simulation| simulation.release_node(&node_id));
                if !released {
                    out.push(self.error(id, format!("cannot release node '{node_id}'"), "RELEASE_NODE"));
                }
            }
            WorkerCommand::UpdateGraph { snapshot, reheat } => {
                if let Some(simulation) = self.simulation.as_mut() {
                    simulation.update_graph(&snapshot, reheat);
                }
                self.snapshot = snapshot;
            }
            WorkerCommand::CalculateCentrality { options } => {
                let result = analytics::centrality(&self.snapshot, &options).value;
                out.push(self.message(id, WorkerEvent::CentralityCalculated { result }));
            }
            WorkerCommand::FindCommunities { options } => {
                let result = analytics::communities(&self.snapshot, &options).value;
                out.push(self.message(id, WorkerEvent::CommunitiesFound { result }));
            }
            WorkerCommand::FindPath {
                source_id,
                target_id,
            } => {
                let event = match analytics::shortest_path(&self.snapshot, &source_id, &target_id).value {
                    PathResult::Found { path, distance } => WorkerEvent::PathFound { path, distance },
                    PathResult::NotFound { source, target } => WorkerEvent::PathNotFound {
                        source_id: source,
                        target_id: target,
                    },
                };
                out.push(self.message(id, event));
            }
            WorkerCommand::Shutdown => return Flow::Shutdown,
        }
        Flow::Continue
    }

    /// Run one tick of the current simulation, if it may tick
    pub(crate) fn step(&mut self, out: &mut Vec<WorkerMessage>) {
        let Some(simulation) = self.simulation.as_ref() else {
            return;
        };
        if !simulation.is_running() {
            return;
        }
        if self.run_id != self.epoch.load(Ordering::Acquire) {
            // Cancelled: the queued STOP reports the final state
            return;
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.tick(out)));
        if let Err(payload) = result {
            self.simulation = None;
            out.push(self.error(self.run_correlation, panic_message(payload.as_ref()), "TICK"));
        }
    }

    fn tick(&mut self, out: &mut Vec<WorkerMessage>) {
        let Some(simulation) = self.simulation.as_mut() else {
            return;
        };
        let outcome = simulation.tick();
        let now = Instant::now();
        let fps = self
            .last_tick
            .map(|last| now.duration_since(last).as_secs_f64())
            .filter(|elapsed| *elapsed > 0.0)
            .map_or(0.0, |elapsed| 1.0 / elapsed);
        self.last_tick = Some(now);

        let positions = simulation.positions();
        let ended = outcome.converged.then(|| WorkerEvent::SimulationEnded {
            positions: positions.clone(),
            reason: EndReason::Converged,
            iterations: outcome.iteration,
        });
        let correlation = self.run_correlation;
        out.push(self.message(
            correlation,
            WorkerEvent::TickUpdate {
                positions,
                alpha: outcome.alpha,
                iteration: outcome.iteration,
                fps,
            },
        ));
        if let Some(event) = ended {
            out.push(self.message(correlation, event));
        }
    }
}

/// Background thread body: handle commands, tick while running
fn run_worker(
    mut core: WorkerCore,
    mut commands: UnboundedReceiver<WorkerRequest>,
    events: UnboundedSender<WorkerMessage>,
) {
    debug!("layout worker started");
    let mut out = Vec::new();
    loop {
        let request = if core.is_ticking() {
            match commands.try_recv() {
                Ok(request) => Some(request),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match commands.blocking_recv() {
                Some(request) => Some(request),
                None => break,
            }
        };

        let flow = match request {
            Some(request) => core.handle(request, &mut out),
            None => {
                core.step(&mut out);
                Flow::Continue
            }
        };
        for message in out.drain(..) {
            if events.send(message).is_err() {
                return;
            }
        }
        if flow == Flow::Shutdown {
            break;
        }
    }
    debug!("layout worker stopped");
}

struct InlineWorker {
    core: WorkerCore,
    pending: VecDeque<WorkerMessage>,
}

struct BackgroundWorker {
    commands: UnboundedSender<WorkerRequest>,
    events: UnboundedReceiver<WorkerMessage>,
    handle: Option<JoinHandle<()>>,
}

enum Backend {
    Inline(InlineWorker),
    Background(BackgroundWorker),
}

/// Message-passing boundary to the simulation and analytics
pub struct WorkerBridge {
    backend: Backend,
    epoch: Arc<AtomicU64>,
    next_correlation: u64,
}

impl WorkerBridge {
    /// Create a bridge, starting a background thread for [`ExecutionMode::Background`]
    ///
    /// If the thread cannot be started the bridge runs inline instead.
    pub fn new(mode: ExecutionMode) -> Self {
        Self::with_spawner(mode, Box::new(spawn_thread))
    }

    /// Like [`WorkerBridge::new`], with a custom thread spawner
    pub fn with_spawner(mode: ExecutionMode, spawner: Spawner) -> Self {
        let epoch = Arc::new(AtomicU64::new(0));
        let backend = match mode {
            ExecutionMode::Inline => Self::inline_backend(&epoch),
            ExecutionMode::Background => match Self::background_backend(&epoch, spawner) {
                Ok(backend) => backend,
                Err(err) => {
                    warn!(error = %err, "falling back to inline execution");
                    Self::inline_backend(&epoch)
                }
            },
        };
        debug!(?mode, "worker bridge created");

        Self {
            backend,
            epoch,
            next_correlation: 0,
        }
    }

    fn inline_backend(epoch: &Arc<AtomicU64>) -> Backend {
        Backend::Inline(InlineWorker {
            core: WorkerCore::new(Arc::clone(epoch)),
            pending: VecDeque::new(),
        })
    }

    fn background_backend(epoch: &Arc<AtomicU64>, spawner: Spawner) -> Result<Backend, WorkerError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let core = WorkerCore::new(Arc::clone(epoch));
        let handle = spawner(Box::new(move || run_worker(core, command_rx, event_tx)))?;

        Ok(Backend::Background(BackgroundWorker {
            commands: command_tx,
            events: event_rx,
            handle: Some(handle),
        }))
    }

    pub fn mode(&self) -> ExecutionMode {
        match self.backend {
            Backend::Inline(_) => ExecutionMode::Inline,
            Backend::Background(_) => ExecutionMode::Background,
        }
    }

    /// The current run epoch
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Start a new epoch, cancelling the current run at its next tick
    ///
    /// Returns the new epoch, to be sent with the next `INIT` or `START`.
    pub fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Switch to inline execution after the background thread was lost
    ///
    /// Queues a `WORKER_ERROR` so the current run is reported as failed.
    fn fall_back(&mut self, reason: &WorkerError) {
        warn!(error = %reason, "layout worker lost, continuing inline");
        if let Backend::Background(worker) = &mut self.backend {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
        let mut inline = InlineWorker {
            core: WorkerCore::new(Arc::clone(&self.epoch)),
            pending: VecDeque::new(),
        };
        inline.pending.push_back(WorkerMessage {
            correlation_id: 0,
            run_id: self.epoch(),
            version: 0,
            event: WorkerEvent::WorkerError {
                message: reason.to_string(),
                context: Some("worker thread".to_string()),
            },
        });
        self.backend = Backend::Inline(inline);
    }

    /// Queue a command, returning its correlation id
    ///
    /// Inline commands are handled before this returns; their events are
    /// available from [`WorkerBridge::try_recv`].
    pub fn send(&mut self, command: WorkerCommand) -> u64 {
        self.next_correlation += 1;
        let request = WorkerRequest {
            correlation_id: self.next_correlation,
            command,
        };

        if let Backend::Background(worker) = &self.backend {
            match worker.commands.send(request) {
                Ok(()) => return self.next_correlation,
                Err(mpsc::error::SendError(request)) => {
                    self.fall_back(&WorkerError::ChannelClosed);
                    self.handle_inline(request);
                }
            }
        } else {
            self.handle_inline(request);
        }
        self.next_correlation
    }

    fn handle_inline(&mut self, request: WorkerRequest) {
        if let Backend::Inline(worker) = &mut self.backend {
            let mut out = Vec::new();
            worker.core.handle(request, &mut out);
            worker.pending.extend(out);
        }
    }

    /// Run up to `max_ticks` inline ticks, returning how many ran
    ///
    /// Does nothing in background mode, where the thread ticks by itself.
    pub fn pump(&mut self, max_ticks: usize) -> usize {
        let Backend::Inline(worker) = &mut self.backend else {
            return 0;
        };
        let mut ticks = 0;
        let mut out = Vec::new();
        while ticks < max_ticks && worker.core.is_ticking() {
            worker.core.step(&mut out);
            ticks += 1;
        }
        worker.pending.extend(out);
        ticks
    }

    /// Whether an inline simulation still has ticks to run
    pub fn has_inline_work(&self) -> bool {
        match &self.backend {
            Backend::Inline(worker) => worker.core.is_ticking(),
            Backend::Background(_) => false,
        }
    }

    /// Next available event, without waiting
    pub fn try_recv(&mut self) -> Option<WorkerMessage> {
        match &mut self.backend {
            Backend::Inline(worker) => worker.pending.pop_front(),
            Backend::Background(worker) => match worker.events.try_recv() {
                Ok(message) => Some(message),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => {
                    self.fall_back(&WorkerError::ChannelClosed);
                    self.try_recv()
                }
            },
        }
    }

    /// Next event, waiting for the background thread if needed
    ///
    /// In inline mode this returns `None` once the queue is empty; call
    /// [`WorkerBridge::pump`] to produce more.
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        match &mut self.backend {
            Backend::Inline(worker) => worker.pending.pop_front(),
            Backend::Background(worker) => match worker.events.recv().await {
                Some(message) => Some(message),
                None => {
                    self.fall_back(&WorkerError::ChannelClosed);
                    self.try_recv()
                }
            },
        }
    }

    /// Stop the background thread and wait for it to exit
    pub fn shutdown(&mut self) {
        if let Backend::Background(worker) = &mut self.backend {
            let _ = worker.commands.send(WorkerRequest {
                correlation_id: 0,
                command: WorkerCommand::Shutdown,
            });
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    warn!("layout worker panicked during shutdown");
                }
            }
        }
    }
}

impl Drop for WorkerBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
