//! Engine facade
//!
//! [`EngineFacade`] owns the graph store, the cache and the worker bridge, and
//! is the only type a caller needs. It runs the layout lifecycle
//!
//! ```text
//! Idle → Initializing → Running → (Converged | Stopped) → Idle
//! ```
//!
//! and guarantees that nothing from an outdated run or graph version reaches
//! the store or a subscriber:
//!
//! - tick and end-of-run events are applied only while `Running` and only for
//!   the current run id, so nothing arrives after [`EngineFacade::stop_simulation`]
//! - analytics results are kept only if their graph version is still current
//!
//! Small graphs run inline and are advanced with [`EngineFacade::pump`] or
//! [`EngineFacade::settle`]; graphs above `worker_threshold` nodes run on the
//! background thread.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::analytics::{self, CentralityResult, CommunityResult, PathResult};
use crate::cache::{
    CacheKey, CacheManager, CacheStats, CachedLayout, Clock, LayoutBounds, PositionSet,
    SystemClock, Viewport, VisibleSet,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, GraphError};
use crate::model::{
    EdgeAttrs, EdgeRecord, GraphData, NodeAttrs, NodePosition, NodeRecord, Versioned,
};
use crate::protocol::{EndReason, WorkerCommand, WorkerEvent, WorkerMessage};
use crate::store::GraphStore;
use crate::worker::{ExecutionMode, WorkerBridge};

/// Capacity of the subscriber channel before slow subscribers lag
const EVENT_CAPACITY: usize = 1024;

/// Layout lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Initializing,
    Running,
    Converged,
    Stopped,
}

/// Notification delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged {
        from: EngineState,
        to: EngineState,
    },
    /// Positions in the store were updated by a tick
    Tick {
        alpha: f64,
        iteration: u64,
        fps: f64,
    },
    SimulationEnded {
        reason: EndReason,
        iterations: u64,
    },
    GraphChanged {
        version: u64,
        structural: bool,
    },
    CentralityReady(Versioned<CentralityResult>),
    CommunitiesReady(Versioned<CommunityResult>),
    PathReady(Versioned<PathResult>),
    /// The worker failed; the current run was stopped
    WorkerFault {
        message: String,
    },
}

/// Receiving end of [`EngineFacade::subscribe`]
///
/// Dropping the subscription, or calling [`Subscription::unsubscribe`],
/// detaches it.
pub struct Subscription {
    receiver: broadcast::Receiver<EngineEvent>,
}

impl Subscription {
    /// Wait for the next event; `None` once the engine is gone
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is queued
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    /// All queued events
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn unsubscribe(self) {}
}

/// Outcome of [`EngineFacade::import`]
#[derive(Debug, Default)]
pub struct ImportReport {
    pub nodes: usize,
    pub edges: usize,
    pub batches: usize,
    /// Edges that referenced missing nodes
    pub rejected: Vec<GraphError>,
    /// Whether cached positions were used as the starting layout
    pub warm_start: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Centrality,
    Communities,
    Path,
}

/// The graph engine
pub struct EngineFacade {
    config: EngineConfig,
    store: GraphStore,
    cache: CacheManager,
    bridge: Option<WorkerBridge>,
    state: EngineState,
    /// Epoch of the run whose events are accepted
    run_id: Option<u64>,
    /// Graph version last sent to the worker
    synced_version: Option<u64>,
    /// Bumped whenever layout output is written to the store
    layout_generation: u64,
    centrality: Option<Versioned<CentralityResult>>,
    communities: Option<Versioned<CommunityResult>>,
    requests: HashMap<u64, RequestKind>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineFacade {
    /// Create an engine, validating the configuration
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create an engine whose cache uses the given clock
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> EngineResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            cache: CacheManager::with_clock(config.cache.clone(), clock),
            config,
            store: GraphStore::new(),
            bridge: None,
            state: EngineState::Idle,
            run_id: None,
            synced_version: None,
            layout_generation: 0,
            centrality: None,
            communities: None,
            requests: HashMap::new(),
            events,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.store.version()
    }

    /// Current node positions in id order
    pub fn positions(&self) -> Vec<NodePosition> {
        self.store.positions()
    }

    /// Execution mode of the active bridge, if any
    pub fn execution_mode(&self) -> Option<ExecutionMode> {
        self.bridge.as_ref().map(WorkerBridge::mode)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.events.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn transition(&mut self, to: EngineState) {
        let from = self.state;
        if from == to {
            return;
        }
        debug!(?from, ?to, "engine state");
        self.state = to;
        self.emit(EngineEvent::StateChanged { from, to });
    }

    fn desired_mode(&self) -> ExecutionMode {
        if self.store.node_count() > self.config.worker_threshold {
            ExecutionMode::Background
        } else {
            ExecutionMode::Inline
        }
    }

    fn send(&mut self, command: WorkerCommand) -> Option<u64> {
        self.bridge.as_mut().map(|bridge| bridge.send(command))
    }

    fn bridge_mut(&mut self) -> &mut WorkerBridge {
        let mode = self.desired_mode();
        self.bridge.get_or_insert_with(|| {
            info!(?mode, "starting worker bridge");
            WorkerBridge::new(mode)
        })
    }

    /// Send the current graph to the worker if it has an older version
    fn sync_graph(&mut self, reheat: bool) {
        let version = self.store.version();
        if self.synced_version == Some(version) {
            return;
        }
        let snapshot = self.store.snapshot();
        self.bridge_mut()
            .send(WorkerCommand::UpdateGraph { snapshot, reheat });
        self.synced_version = Some(version);
    }

    // ========== Graph Mutations ==========

    /// Drain store changes and react to them
    fn after_mutation(&mut self) {
        let changes = self.store.drain_changes();
        if changes.is_empty() {
            return;
        }
        let structural = changes.iter().any(|change| change.is_structural());
        let version = self.store.version();
        self.centrality = None;
        self.communities = None;

        if matches!(self.state, EngineState::Running | EngineState::Initializing) {
            trace!(version, reheat = structural, "forwarding graph change to running layout");
            self.sync_graph(structural);
        }
        self.emit(EngineEvent::GraphChanged {
            version,
            structural,
        });
    }

    pub fn add_node(&mut self, id: &str, attrs: NodeAttrs) {
        self.store.add_node(id, attrs);
        self.after_mutation();
    }

    pub fn update_node(&mut self, id: &str, attrs: NodeAttrs) -> EngineResult<()> {
        self.store.update_node(id, attrs)?;
        self.after_mutation();
        Ok(())
    }

    pub fn remove_node(&mut self, id: &str) -> bool {
        let removed = self.store.remove_node(id).is_some();
        self.after_mutation();
        removed
    }

    /// Add an edge; fails without changing anything if an endpoint is missing
    pub fn add_edge(&mut self, id: &str, source: &str, target: &str, attrs: EdgeAttrs) -> EngineResult<()> {
        self.store.add_edge(id, source, target, attrs)?;
        self.after_mutation();
        Ok(())
    }

    pub fn update_edge(&mut self, id: &str, attrs: EdgeAttrs) -> EngineResult<()> {
        self.store.update_edge(id, attrs)?;
        self.after_mutation();
        Ok(())
    }

    pub fn remove_edge(&mut self, id: &str) -> bool {
        let removed = self.store.remove_edge(id).is_some();
        self.after_mutation();
        removed
    }

    /// Remove everything and discard the simulation
    pub fn clear(&mut self) {
        self.reset_simulation();
        self.store.clear();
        self.after_mutation();
    }

    /// Pin a node at a position
    ///
    /// If a simulation exists it is reheated so neighbors settle around the
    /// new position.
    pub fn set_node_position(&mut self, id: &str, x: f64, y: f64) -> EngineResult<()> {
        self.store.pin_node(id, x, y)?;
        self.after_mutation();
        if self.has_simulation() {
            self.send(WorkerCommand::SetNodePosition {
                node_id: id.to_string(),
                x,
                y,
            });
            self.resume_after_interaction();
        } else if self.has_cached_layout() {
            self.relaunch();
        }
        Ok(())
    }

    /// Unpin a node and reheat the layout
    pub fn release_node(&mut self, id: &str) -> EngineResult<()> {
        self.store.release_node(id)?;
        self.after_mutation();
        if self.has_simulation() {
            self.send(WorkerCommand::ReleaseNode {
                node_id: id.to_string(),
            });
            self.resume_after_interaction();
        } else if self.has_cached_layout() {
            self.relaunch();
        }
        Ok(())
    }

    fn has_simulation(&self) -> bool {
        self.bridge.is_some()
            && matches!(
                self.state,
                EngineState::Running | EngineState::Converged | EngineState::Stopped
            )
    }

    /// Layout applied from the cache with no simulation behind it
    fn has_cached_layout(&self) -> bool {
        self.bridge.is_none()
            && matches!(self.state, EngineState::Converged | EngineState::Stopped)
    }

    /// Simulate from the current positions after a cached layout
    fn relaunch(&mut self) {
        self.transition(EngineState::Initializing);
        self.launch();
    }

    /// Interactions reheat the worker simulation; give it a fresh run
    fn resume_after_interaction(&mut self) {
        if self.state == EngineState::Running {
            return;
        }
        self.sync_graph(true);
        let Some(bridge) = self.bridge.as_mut() else {
            return;
        };
        let epoch = bridge.advance_epoch();
        bridge.send(WorkerCommand::Start { epoch });
        self.run_id = Some(epoch);
        self.transition(EngineState::Running);
    }

    // ========== Import / Export ==========

    /// Load a payload in batches
    ///
    /// Node and edge records are applied `import_batch_size` at a time, with
    /// change handling after each batch. Edges with missing endpoints are
    /// skipped and reported. When the cache holds positions for a graph of
    /// the resulting size, nodes without an explicit position start there.
    pub fn import(&mut self, data: GraphData) -> ImportReport {
        let batch_size = self.config.import_batch_size.max(1);
        let mut report = ImportReport::default();
        let unplaced: HashSet<&str> = data
            .nodes
            .iter()
            .filter(|record| !record.attrs.has_position())
            .map(|record| record.id.as_str())
            .collect();

        for batch in data.nodes.chunks(batch_size) {
            for record in batch {
                self.store.add_node(&record.id, record.attrs.clone());
                report.nodes += 1;
            }
            report.batches += 1;
            self.after_mutation();
            trace!(nodes = report.nodes, "imported node batch");
        }

        for batch in data.edges.chunks(batch_size) {
            for record in batch {
                match self.store.add_edge(
                    &record.id,
                    &record.source,
                    &record.target,
                    record.attrs.clone(),
                ) {
                    Ok(_) => report.edges += 1,
                    Err(err) => {
                        warn!(error = %err, "skipping edge");
                        report.rejected.push(err);
                    }
                }
            }
            report.batches += 1;
            self.after_mutation();
        }

        let key = CacheKey::positions(self.store.node_count());
        if let Some(PositionSet(cached)) = self.cache.get::<PositionSet>(&key) {
            let warm: Vec<NodePosition> = cached
                .into_iter()
                .filter(|position| unplaced.contains(position.id.as_str()))
                .collect();
            report.warm_start = self.store.apply_positions(&warm) > 0;
            if report.warm_start {
                self.layout_generation += 1;
            }
        }

        info!(
            nodes = report.nodes,
            edges = report.edges,
            rejected = report.rejected.len(),
            warm_start = report.warm_start,
            "import finished"
        );
        report
    }

    /// The graph as a payload, with current positions
    pub fn export(&self) -> GraphData {
        GraphData {
            nodes: self
                .store
                .nodes()
                .map(|node| NodeRecord {
                    id: node.id.clone(),
                    attrs: node.to_attrs(),
                })
                .collect(),
            edges: self
                .store
                .edges()
                .map(|edge| EdgeRecord {
                    id: edge.id.clone(),
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                    attrs: edge.to_attrs(),
                })
                .collect(),
        }
    }

    // ========== Simulation Lifecycle ==========

    /// Start a layout run for the current graph
    ///
    /// A cached layout for a graph of the same shape and configuration is
    /// applied directly and the engine goes straight to `Converged`.
    pub fn init_simulation(&mut self) -> EngineResult<()> {
        if matches!(self.state, EngineState::Running | EngineState::Initializing) {
            self.stop_simulation()?;
        }
        self.transition(EngineState::Initializing);

        let layout_key = CacheKey::layout(
            self.store.node_count(),
            self.store.edge_count(),
            &self.config.simulation,
        );
        if let Some(layout) = self.cache.get::<CachedLayout>(&layout_key) {
            debug!(iterations = layout.iterations, "layout cache hit");
            self.apply_layout(&layout.positions);
            self.transition(EngineState::Converged);
            self.emit(EngineEvent::SimulationEnded {
                reason: EndReason::Converged,
                iterations: layout.iterations,
            });
            return Ok(());
        }

        self.launch();
        Ok(())
    }

    /// Send the current graph to a fresh worker simulation
    fn launch(&mut self) {
        let mode = self.desired_mode();
        if self.bridge.as_ref().map(WorkerBridge::mode) != Some(mode) {
            self.bridge = None;
            self.requests.clear();
        }
        let snapshot = self.store.snapshot();
        let config = self.config.simulation.clone();
        let version = snapshot.version;
        let bridge = self.bridge_mut();
        let epoch = bridge.advance_epoch();
        bridge.send(WorkerCommand::Init {
            snapshot,
            config,
            epoch,
        });
        self.run_id = Some(epoch);
        self.synced_version = Some(version);
        info!(
            nodes = self.store.node_count(),
            mode = ?self.execution_mode(),
            "simulation initialized"
        );

        self.poll();
    }

    /// Resume a converged or stopped layout
    pub fn start_simulation(&mut self) -> EngineResult<()> {
        match self.state {
            EngineState::Running | EngineState::Initializing => Ok(()),
            EngineState::Converged | EngineState::Stopped => {
                if self.bridge.is_some() {
                    self.resume_after_interaction();
                } else {
                    // Converged from the layout cache; nothing to resume
                    self.relaunch();
                }
                Ok(())
            }
            EngineState::Idle => Err(EngineError::NoSimulation),
        }
    }

    /// Halt the layout, keeping current positions
    ///
    /// Every event of the stopped run that is still in flight is discarded.
    pub fn stop_simulation(&mut self) -> EngineResult<()> {
        if !matches!(self.state, EngineState::Running | EngineState::Initializing) {
            return if self.bridge.is_some() {
                Ok(())
            } else {
                Err(EngineError::NoSimulation)
            };
        }
        if let Some(bridge) = self.bridge.as_mut() {
            bridge.advance_epoch();
            bridge.send(WorkerCommand::Stop);
        }
        self.run_id = None;
        let positions = PositionSet(self.store.positions());
        self.cache
            .put(&CacheKey::positions(self.store.node_count()), positions);
        self.transition(EngineState::Stopped);
        Ok(())
    }

    /// Discard the simulation and return to `Idle`
    pub fn reset_simulation(&mut self) {
        if matches!(self.state, EngineState::Running | EngineState::Initializing) {
            let _ = self.stop_simulation();
        }
        self.bridge = None;
        self.run_id = None;
        self.synced_version = None;
        self.requests.clear();
        self.transition(EngineState::Idle);
    }

    fn apply_layout(&mut self, positions: &[NodePosition]) {
        self.store.apply_positions(positions);
        self.layout_generation += 1;
    }

    /// Handle queued worker events without ticking
    pub fn poll(&mut self) -> usize {
        let messages: Vec<WorkerMessage> = match self.bridge.as_mut() {
            Some(bridge) => std::iter::from_fn(|| bridge.try_recv()).collect(),
            None => Vec::new(),
        };
        let handled = messages.len();
        for message in messages {
            self.handle_message(message);
        }
        self.cache.maybe_sweep();
        handled
    }

    /// Run up to `max_ticks` inline ticks and handle the resulting events
    ///
    /// In background mode no ticks run here; queued events are handled.
    /// Returns the number of inline ticks run.
    pub fn pump(&mut self, max_ticks: usize) -> usize {
        let ticks = self
            .bridge
            .as_mut()
            .map_or(0, |bridge| bridge.pump(max_ticks));
        self.poll();
        ticks
    }

    /// Drive the layout until it is no longer running
    ///
    /// Inline runs advance `ticks_per_frame` ticks at a time and yield to the
    /// runtime in between. The run is stopped after `max_ticks` ticks.
    pub async fn settle(&mut self, max_ticks: u64) -> EngineState {
        let mut ticks = 0u64;
        while matches!(self.state, EngineState::Running | EngineState::Initializing) {
            if ticks >= max_ticks {
                warn!(ticks, "layout did not converge, stopping");
                let _ = self.stop_simulation();
                break;
            }
            let Some(bridge) = self.bridge.as_mut() else {
                break;
            };

            if bridge.mode() == ExecutionMode::Inline {
                let ran = self.pump(self.config.ticks_per_frame);
                if ran == 0 && self.state == EngineState::Running {
                    break;
                }
                ticks += ran as u64;
                tokio::task::yield_now().await;
            } else {
                match bridge.recv().await {
                    Some(message) => {
                        if matches!(message.event, WorkerEvent::TickUpdate { .. }) {
                            ticks += 1;
                        }
                        self.handle_message(message);
                    }
                    None => break,
                }
            }
        }
        self.state
    }

    fn is_current_run(&self, message: &WorkerMessage) -> bool {
        self.run_id == Some(message.run_id)
    }

    fn handle_message(&mut self, message: WorkerMessage) {
        let current_run = self.is_current_run(&message);
        let current_version = message.version == self.store.version();

        match message.event {
            WorkerEvent::SimulationInitialized { node_count, .. } => {
                if current_run && self.state == EngineState::Initializing {
                    debug!(node_count, "worker simulation ready");
                    self.transition(EngineState::Running);
                }
            }
            WorkerEvent::TickUpdate {
                positions,
                alpha,
                iteration,
                fps,
            } => {
                if !current_run || self.state != EngineState::Running {
                    trace!(run = message.run_id, iteration, "discarding stale tick");
                    return;
                }
                if message.version < self.store.version() {
                    trace!(version = message.version, iteration, "discarding tick for an old graph");
                    return;
                }
                self.apply_layout(&positions);
                self.emit(EngineEvent::Tick {
                    alpha,
                    iteration,
                    fps,
                });
            }
            WorkerEvent::SimulationEnded {
                positions,
                reason,
                iterations,
            } => {
                if !current_run || self.state != EngineState::Running {
                    trace!(run = message.run_id, "discarding stale end of run");
                    return;
                }
                if reason == EndReason::Converged && message.version < self.store.version() {
                    self.continue_on_current_graph(message.version);
                    return;
                }
                self.apply_layout(&positions);
                self.run_id = None;
                let to = match reason {
                    EndReason::Converged => {
                        self.remember_layout(positions, iterations);
                        EngineState::Converged
                    }
                    EndReason::Stopped => EngineState::Stopped,
                };
                info!(iterations, ?reason, "simulation ended");
                self.transition(to);
                self.emit(EngineEvent::SimulationEnded { reason, iterations });
            }
            WorkerEvent::CentralityCalculated { result } => {
                if self.take_request(message.correlation_id, current_version) {
                    let result = Versioned::new(message.version, result);
                    self.centrality = Some(result.clone());
                    self.emit(EngineEvent::CentralityReady(result));
                }
            }
            WorkerEvent::CommunitiesFound { result } => {
                if self.take_request(message.correlation_id, current_version) {
                    let result = Versioned::new(message.version, result);
                    self.communities = Some(result.clone());
                    self.emit(EngineEvent::CommunitiesReady(result));
                }
            }
            WorkerEvent::PathFound { path, distance } => {
                if self.take_request(message.correlation_id, current_version) {
                    let result = PathResult::Found { path, distance };
                    self.emit(EngineEvent::PathReady(Versioned::new(message.version, result)));
                }
            }
            WorkerEvent::PathNotFound {
                source_id,
                target_id,
            } => {
                if self.take_request(message.correlation_id, current_version) {
                    let result = PathResult::NotFound {
                        source: source_id,
                        target: target_id,
                    };
                    self.emit(EngineEvent::PathReady(Versioned::new(message.version, result)));
                }
            }
            WorkerEvent::WorkerError { message: text, context } => {
                warn!(error = %text, context = ?context, "worker error");
                // The worker may have lost its graph
                self.synced_version = None;
                if current_run
                    && matches!(self.state, EngineState::Running | EngineState::Initializing)
                {
                    self.run_id = None;
                    self.transition(EngineState::Stopped);
                }
                self.emit(EngineEvent::WorkerFault { message: text });
            }
        }
    }

    /// The run converged on a graph that has since changed; keep it going
    fn continue_on_current_graph(&mut self, stale_version: u64) {
        let Some(epoch) = self.run_id else {
            return;
        };
        debug!(
            stale_version,
            version = self.store.version(),
            "run converged on an old graph, resuming"
        );
        self.sync_graph(false);
        self.send(WorkerCommand::Start { epoch });
    }

    /// Whether a worker analytics result answers a live request for the
    /// current graph
    fn take_request(&mut self, correlation_id: u64, current_version: bool) -> bool {
        if self.requests.remove(&correlation_id).is_none() {
            return false;
        }
        if !current_version {
            debug!(correlation_id, "discarding analytics for an old graph version");
        }
        current_version
    }

    fn remember_layout(&mut self, positions: Vec<NodePosition>, iterations: u64) {
        let nodes = self.store.node_count();
        let key = CacheKey::layout(nodes, self.store.edge_count(), &self.config.simulation);
        self.cache.put(
            &key,
            CachedLayout {
                positions: positions.clone(),
                iterations,
            },
        );
        self.cache
            .put(&CacheKey::positions(nodes), PositionSet(positions));
    }

    // ========== Analytics ==========

    /// Centrality for the current graph, computed on this thread if needed
    pub fn centrality_now(&mut self) -> Versioned<CentralityResult> {
        let version = self.store.version();
        if let Some(result) = self.centrality.as_ref().filter(|r| r.is_current(version)) {
            return result.clone();
        }
        let result = analytics::centrality(&self.store.snapshot(), &self.config.analytics);
        self.centrality = Some(result.clone());
        result
    }

    /// Communities for the current graph, computed on this thread if needed
    pub fn communities_now(&mut self) -> Versioned<CommunityResult> {
        let version = self.store.version();
        if let Some(result) = self.communities.as_ref().filter(|r| r.is_current(version)) {
            return result.clone();
        }
        let result = analytics::communities(&self.store.snapshot(), &self.config.analytics);
        self.communities = Some(result.clone());
        result
    }

    pub fn find_path(&self, source: &str, target: &str) -> Versioned<PathResult> {
        analytics::shortest_path(&self.store.snapshot(), source, target)
    }

    /// Last centrality result, if it matches the current graph
    pub fn centrality(&self) -> Option<&Versioned<CentralityResult>> {
        self.centrality
            .as_ref()
            .filter(|result| result.is_current(self.store.version()))
    }

    /// Last community result, if it matches the current graph
    pub fn communities(&self) -> Option<&Versioned<CommunityResult>> {
        self.communities
            .as_ref()
            .filter(|result| result.is_current(self.store.version()))
    }

    fn request(&mut self, kind: RequestKind, command: WorkerCommand) -> u64 {
        self.sync_graph(false);
        let id = self.bridge_mut().send(command);
        self.requests.insert(id, kind);
        self.poll();
        id
    }

    /// Ask the worker for centrality; the answer arrives as
    /// [`EngineEvent::CentralityReady`]
    pub fn request_centrality(&mut self) -> u64 {
        let options = self.config.analytics.clone();
        self.request(
            RequestKind::Centrality,
            WorkerCommand::CalculateCentrality { options },
        )
    }

    pub fn request_communities(&mut self) -> u64 {
        let options = self.config.analytics.clone();
        self.request(
            RequestKind::Communities,
            WorkerCommand::FindCommunities { options },
        )
    }

    pub fn request_path(&mut self, source: &str, target: &str) -> u64 {
        self.request(
            RequestKind::Path,
            WorkerCommand::FindPath {
                source_id: source.to_string(),
                target_id: target.to_string(),
            },
        )
    }

    // ========== Queries ==========

    /// Ids of nodes overlapping the viewport
    ///
    /// Served from the viewport cache, whose entries live for a few seconds.
    pub fn visible_nodes(&mut self, viewport: &Viewport) -> Vec<String> {
        let key = CacheKey::viewport(viewport);
        if let Some(VisibleSet(ids)) = self.cache.get::<VisibleSet>(&key) {
            return ids;
        }
        let ids: Vec<String> = self
            .store
            .nodes()
            .filter(|node| viewport.contains(node.position.x, node.position.y, node.size))
            .map(|node| node.id.clone())
            .collect();
        self.cache.put(&key, VisibleSet(ids.clone()));
        ids
    }

    /// Bounding box of the current layout
    pub fn bounds(&mut self) -> Option<LayoutBounds> {
        let key = CacheKey::geometry(self.store.version(), self.layout_generation);
        if let Some(bounds) = self.cache.get::<LayoutBounds>(&key) {
            return Some(bounds);
        }
        let bounds = LayoutBounds::from_positions(&self.store.positions())?;
        self.cache.put(&key, bounds);
        Some(bounds)
    }

    /// Enable or disable caching; disabling drops every entry
    pub fn set_cache_enabled(&mut self, enabled: bool) {
        self.cache.set_enabled(enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use std::time::Duration;

    fn engine() -> EngineFacade {
        EngineFacade::new(EngineConfig::default()).unwrap()
    }

    fn line_payload() -> GraphData {
        let mut data = GraphData::new();
        for id in ["A", "B", "C", "D", "E", "F"] {
            data = data.with_node(id, NodeAttrs::default());
        }
        for (source, target) in [("A", "B"), ("B", "C"), ("C", "D"), ("D", "E")] {
            data = data.with_edge(format!("{source}-{target}"), source, target);
        }
        data
    }

    fn loaded() -> EngineFacade {
        let mut engine = engine();
        engine.import(line_payload());
        engine
    }

    fn states(events: &[EngineEvent]) -> Vec<EngineState> {
        events
            .iter()
            .filter_map(|event| match event {
                EngineEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    // ========== Lifecycle Tests ==========

    #[test]
    fn inline_run_walks_the_state_machine() {
        let mut engine = loaded();
        let mut events = engine.subscribe();

        engine.init_simulation().unwrap();
        assert_eq!(engine.execution_mode(), Some(ExecutionMode::Inline));
        assert_eq!(engine.state(), EngineState::Running);

        while engine.state() == EngineState::Running {
            engine.pump(50);
        }

        assert_eq!(engine.state(), EngineState::Converged);
        assert_eq!(
            states(&events.drain()),
            vec![
                EngineState::Initializing,
                EngineState::Running,
                EngineState::Converged
            ]
        );
    }

    #[tokio::test]
    async fn settle_drives_inline_run_to_convergence() {
        let mut engine = loaded();
        engine.init_simulation().unwrap();
        assert_eq!(engine.settle(10_000).await, EngineState::Converged);
    }

    #[tokio::test]
    async fn settle_stops_after_tick_limit() {
        let mut engine = loaded();
        engine.init_simulation().unwrap();
        assert_eq!(engine.settle(5).await, EngineState::Stopped);
    }

    #[test]
    fn nothing_is_applied_after_stop() {
        let mut engine = loaded();
        engine.init_simulation().unwrap();
        engine.pump(3);
        engine.stop_simulation().unwrap();
        let frozen = engine.positions();
        let mut events = engine.subscribe();

        assert_eq!(engine.pump(100), 0);
        assert_eq!(engine.positions(), frozen);
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(
            events
                .drain()
                .iter()
                .all(|event| !matches!(event, EngineEvent::Tick { .. }))
        );
    }

    #[test]
    fn start_resumes_stopped_run() {
        let mut engine = loaded();
        engine.init_simulation().unwrap();
        engine.pump(3);
        engine.stop_simulation().unwrap();

        engine.start_simulation().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(engine.pump(3) > 0);
    }

    #[test]
    fn start_without_simulation_fails() {
        let mut engine = loaded();
        assert!(matches!(
            engine.start_simulation(),
            Err(EngineError::NoSimulation)
        ));
    }

    #[test]
    fn cached_layout_converges_immediately() {
        let mut engine = loaded();
        engine.init_simulation().unwrap();
        while engine.state() == EngineState::Running {
            engine.pump(100);
        }
        let converged = engine.positions();

        engine.reset_simulation();
        assert_eq!(engine.state(), EngineState::Idle);
        engine.init_simulation().unwrap();

        assert_eq!(engine.state(), EngineState::Converged);
        assert_eq!(engine.positions(), converged);
        assert_eq!(engine.cache_stats().hits, 1);
    }

    #[test]
    fn disabled_cache_reruns_layout() {
        let mut engine = loaded();
        engine.init_simulation().unwrap();
        while engine.state() == EngineState::Running {
            engine.pump(100);
        }
        engine.set_cache_enabled(false);
        engine.reset_simulation();
        engine.init_simulation().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
    }

    // ========== Mutation Tests ==========

    #[test]
    fn structural_change_while_running_reheats() {
        let mut engine = loaded();
        engine.init_simulation().unwrap();
        while engine.state() == EngineState::Running {
            engine.pump(100);
        }
        engine.start_simulation().unwrap();
        engine.pump(30);

        let mut events = engine.subscribe();
        engine.add_node("G", NodeAttrs::default());
        engine
            .add_edge("F-G", "F", "G", EdgeAttrs::default())
            .unwrap();

        let ticks = engine.pump(1);
        assert_eq!(ticks, 1);
        let alpha = events.drain().iter().find_map(|event| match event {
            EngineEvent::Tick { alpha, .. } => Some(*alpha),
            _ => None,
        });
        // Decayed below 0.15 before the change, back near 0.3 after
        assert!(alpha.is_some_and(|alpha| alpha > 0.28));
    }

    #[test]
    fn invalid_edge_is_a_noop() {
        let mut engine = loaded();
        let version = engine.version();
        let result = engine.add_edge("bad", "A", "ghost", EdgeAttrs::default());

        assert!(matches!(
            result,
            Err(EngineError::Graph(GraphError::InvalidEdge { .. }))
        ));
        assert_eq!(engine.version(), version);
    }

    #[test]
    fn set_node_position_pins_and_restarts_layout() {
        let mut engine = loaded();
        engine.init_simulation().unwrap();
        while engine.state() == EngineState::Running {
            engine.pump(100);
        }

        engine.set_node_position("A", 300.0, 300.0).unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        while engine.state() == EngineState::Running {
            engine.pump(100);
        }

        let node = engine.store().node("A").unwrap();
        assert!(node.pinned);
        assert_eq!((node.position.x, node.position.y), (300.0, 300.0));
    }

    #[test]
    fn set_node_position_after_cached_layout_runs_the_layout() {
        let mut engine = loaded();
        engine.init_simulation().unwrap();
        while engine.state() == EngineState::Running {
            engine.pump(100);
        }
        engine.reset_simulation();
        engine.init_simulation().unwrap();
        assert_eq!(engine.state(), EngineState::Converged);
        assert_eq!(engine.execution_mode(), None);
        let neighbor = engine.store().node("B").unwrap().position;

        engine.set_node_position("A", 300.0, 300.0).unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        while engine.state() == EngineState::Running {
            engine.pump(100);
        }

        assert_eq!(engine.state(), EngineState::Converged);
        let node = engine.store().node("A").unwrap();
        assert_eq!((node.position.x, node.position.y), (300.0, 300.0));
        assert_ne!(engine.store().node("B").unwrap().position, neighbor);
    }

    #[test]
    fn convergence_on_an_old_graph_keeps_running() {
        let mut engine = engine();
        engine.import(
            GraphData::new()
                .with_node("a", NodeAttrs::default())
                .with_node("b", NodeAttrs::default())
                .with_node("c", NodeAttrs::default()),
        );
        engine.init_simulation().unwrap();
        let run_id = engine.run_id.unwrap();
        let old_version = engine.version();
        let old_positions = engine.positions();

        engine.add_node("late", NodeAttrs::default());
        engine
            .add_edge("c-late", "c", "late", EdgeAttrs::default())
            .unwrap();
        engine.handle_message(WorkerMessage {
            correlation_id: 0,
            run_id,
            version: old_version,
            event: WorkerEvent::SimulationEnded {
                positions: old_positions,
                reason: EndReason::Converged,
                iterations: 10,
            },
        });

        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(engine.run_id, Some(run_id));
        let key = CacheKey::layout(4, 1, &engine.config.simulation);
        assert!(engine.cache.get::<CachedLayout>(&key).is_none());

        while engine.state() == EngineState::Running {
            engine.pump(100);
        }
        assert_eq!(engine.state(), EngineState::Converged);
        let cached = engine.cache.get::<CachedLayout>(&key).unwrap();
        assert!(cached.positions.iter().any(|position| position.id == "late"));
    }

    #[test]
    fn clear_returns_to_idle() {
        let mut engine = loaded();
        engine.init_simulation().unwrap();
        engine.clear();

        assert_eq!(engine.state(), EngineState::Idle);
        assert!(engine.store().is_empty());
        assert_eq!(engine.execution_mode(), None);
    }

    // ========== Analytics Tests ==========

    #[test]
    fn analytics_are_memoized_per_version() {
        let mut engine = loaded();
        let first = engine.centrality_now();
        assert!(engine.centrality().is_some());

        engine.add_node("G", NodeAttrs::default());
        assert!(engine.centrality().is_none());

        let second = engine.centrality_now();
        assert_ne!(first.version, second.version);
        assert_eq!(second.value.scores.len(), 7);
    }

    #[test]
    fn worker_analytics_arrive_as_events() {
        let mut engine = loaded();
        let mut events = engine.subscribe();

        engine.request_communities();
        engine.request_path("A", "E");

        let events = events.drain();
        assert!(
            events
                .iter()
                .any(|event| matches!(event, EngineEvent::CommunitiesReady(_)))
        );
        assert!(events.iter().any(|event| matches!(
            event,
            EngineEvent::PathReady(Versioned {
                value: PathResult::Found { distance: 4, .. },
                ..
            })
        )));
        assert!(engine.communities().is_some());
    }

    #[test]
    fn stale_worker_analytics_are_discarded() {
        let mut engine = loaded();
        engine.bridge_mut();
        engine.sync_graph(false);
        // Queue the request behind a mutation the worker has not seen
        let version = engine.version();
        let id = engine
            .bridge
            .as_mut()
            .unwrap()
            .send(WorkerCommand::CalculateCentrality {
                options: engine.config.analytics.clone(),
            });
        engine.requests.insert(id, RequestKind::Centrality);
        engine.add_node("late", NodeAttrs::default());
        assert_ne!(engine.version(), version);

        engine.poll();
        assert!(engine.centrality().is_none());
        assert!(engine.requests.is_empty());
    }

    // ========== Import / Query Tests ==========

    #[test]
    fn import_batches_and_reports_rejected_edges() {
        let mut engine = EngineFacade::new(EngineConfig {
            import_batch_size: 2,
            ..EngineConfig::default()
        })
        .unwrap();
        let data = line_payload().with_edge("bad", "A", "ghost");

        let report = engine.import(data);

        assert_eq!(report.nodes, 6);
        assert_eq!(report.edges, 4);
        assert_eq!(report.batches, 3 + 3);
        assert_eq!(report.rejected.len(), 1);
        assert!(!report.warm_start);
    }

    #[test]
    fn export_round_trips_graph() {
        let engine = loaded();
        let data = engine.export();
        assert_eq!(data.nodes.len(), 6);
        assert_eq!(data.edges.len(), 4);

        let copy = engine_with_data(data);
        assert_eq!(copy.positions(), engine.positions());
        assert_eq!(copy.find_path("A", "E").value, engine.find_path("A", "E").value);
    }

    fn engine_with_data(data: GraphData) -> EngineFacade {
        let mut engine = engine();
        engine.import(data);
        engine
    }

    #[test]
    fn stopped_positions_warm_start_next_import() {
        let mut engine = loaded();
        engine.init_simulation().unwrap();
        engine.pump(20);
        engine.stop_simulation().unwrap();
        let positions = engine.positions();

        engine.clear();
        let report = engine.import(line_payload());
        assert!(report.warm_start);
        assert_eq!(engine.positions(), positions);
    }

    #[test]
    fn viewport_results_expire() {
        let clock = ManualClock::new();
        let mut engine =
            EngineFacade::with_clock(EngineConfig::default(), Arc::new(clock.clone())).unwrap();
        engine.import(line_payload());
        let viewport = Viewport::new(0.0, 0.0, 1.0, 800.0, 600.0);

        let visible = engine.visible_nodes(&viewport);
        assert_eq!(visible.len(), 6);
        assert_eq!(engine.visible_nodes(&viewport), visible);
        assert_eq!(engine.cache_stats().hits, 1);

        clock.advance(Duration::from_secs(5));
        engine.visible_nodes(&viewport);
        assert_eq!(engine.cache_stats().hits, 1);
    }

    #[test]
    fn bounds_follow_layout_generation() {
        let mut engine = loaded();
        let before = engine.bounds().unwrap();
        assert_eq!(engine.bounds(), Some(before));

        engine.init_simulation().unwrap();
        engine.pump(10);
        let after = engine.bounds().unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn empty_graph_has_no_bounds() {
        assert!(engine().bounds().is_none());
    }
}
