//! Force-directed layout simulation
//!
//! An iterative, d3-force style physics step over a graph snapshot. Each tick
//! applies, in order:
//!
//! - **Charge**: repulsion between all non-collapsed nodes (Barnes–Hut above
//!   `barnes_hut_threshold` nodes, exact below)
//! - **Links**: springs pulling connected nodes toward the rest length
//! - **Center**: shifts the barycenter toward the origin
//! - **Collision**: pushes overlapping nodes apart by radius
//!
//! then integrates velocities and decays alpha. The simulation converges,
//! and stops itself, once alpha drops below `target_alpha`.
//!
//! Physics never reads the clock: the same snapshot and configuration always
//! produce the same tick sequence.

mod forces;
mod quadtree;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::model::{GraphSnapshot, NodePosition};
use forces::ChargeParams;

/// Default charge strength (negative = repulsion, matches D3.js)
pub const DEFAULT_CHARGE: f64 = -30.0;

/// Default link rest length
pub const DEFAULT_LINK_DISTANCE: f64 = 30.0;

/// Default link spring strength
pub const DEFAULT_LINK_STRENGTH: f64 = 1.0;

/// Default velocity decay (fraction of velocity lost per tick)
pub const DEFAULT_VELOCITY_DECAY: f64 = 0.4;

/// Default alpha decay per tick (300 ticks from 1.0 to 0.001, as in D3.js)
pub const DEFAULT_ALPHA_DECAY: f64 = 0.022_763_8;

/// Default alpha below which the simulation is converged
pub const DEFAULT_TARGET_ALPHA: f64 = 0.01;

/// Alpha restored when the layout is reheated
pub const REHEAT_ALPHA: f64 = 0.3;

/// Default Barnes–Hut theta (0 = exact, larger = coarser)
pub const DEFAULT_THETA: f64 = 0.9;

/// Node count above which spatial approximation kicks in
pub const DEFAULT_BARNES_HUT_THRESHOLD: usize = 100;

/// Collision radius as a function of node size
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollisionRadius {
    /// Same radius for every node
    Fixed { radius: f64 },
    /// `size * scale + padding`
    NodeSize { scale: f64, padding: f64 },
}

impl CollisionRadius {
    pub fn radius_for(&self, size: f64) -> f64 {
        match *self {
            CollisionRadius::Fixed { radius } => radius,
            CollisionRadius::NodeSize { scale, padding } => size.max(0.0) * scale + padding,
        }
    }
}

impl Default for CollisionRadius {
    fn default() -> Self {
        CollisionRadius::NodeSize {
            scale: 1.0,
            padding: 2.0,
        }
    }
}

/// Configuration for one simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Many-body strength (negative = repulsion)
    pub charge_strength: f64,
    /// Link rest length
    pub link_distance: f64,
    /// Link spring constant, multiplied by edge weight
    pub link_strength: f64,
    /// Fraction of the barycenter offset removed per tick
    pub center_strength: f64,
    pub collision_radius: CollisionRadius,
    pub collision_strength: f64,
    /// Fraction of alpha lost per tick
    pub alpha_decay: f64,
    /// Fraction of velocity lost per tick
    pub velocity_decay: f64,
    /// Convergence threshold
    pub target_alpha: f64,
    pub theta: f64,
    pub barnes_hut_threshold: usize,
    /// Minimum distance for charge calculation (avoids singularity)
    pub distance_min: f64,
    /// Maximum speed per tick (prevents numerical explosion)
    pub max_velocity: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            charge_strength: DEFAULT_CHARGE,
            link_distance: DEFAULT_LINK_DISTANCE,
            link_strength: DEFAULT_LINK_STRENGTH,
            center_strength: 1.0,
            collision_radius: CollisionRadius::default(),
            collision_strength: 0.7,
            alpha_decay: DEFAULT_ALPHA_DECAY,
            velocity_decay: DEFAULT_VELOCITY_DECAY,
            target_alpha: DEFAULT_TARGET_ALPHA,
            theta: DEFAULT_THETA,
            barnes_hut_threshold: DEFAULT_BARNES_HUT_THRESHOLD,
            distance_min: 1.0,
            max_velocity: 100.0,
        }
    }
}

fn in_open_unit(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("{value} is not between 0 and 1"),
        })
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        in_open_unit("alpha_decay", self.alpha_decay)?;
        in_open_unit("target_alpha", self.target_alpha)?;
        if !(0.0..=1.0).contains(&self.velocity_decay) {
            return Err(ConfigError::Invalid {
                field: "velocity_decay",
                reason: format!("{} is not between 0 and 1", self.velocity_decay),
            });
        }
        if self.theta < 0.0 {
            return Err(ConfigError::Invalid {
                field: "theta",
                reason: "must not be negative".to_string(),
            });
        }
        if self.distance_min <= 0.0 || self.max_velocity <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "distance_min",
                reason: "distance_min and max_velocity must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Per-node simulation state
#[derive(Debug, Clone)]
pub(crate) struct SimNode {
    pub(crate) id: String,
    pub(crate) x: f64,
    pub(crate) y: f64,
    pub(crate) vx: f64,
    pub(crate) vy: f64,
    /// Pinned position, if any
    pub(crate) fixed: Option<(f64, f64)>,
    pub(crate) collapsed: bool,
    pub(crate) radius: f64,
}

/// A link between node indices
#[derive(Debug, Clone)]
pub(crate) struct SimLink {
    pub(crate) source: usize,
    pub(crate) target: usize,
    pub(crate) distance: f64,
    pub(crate) strength: f64,
    /// Share of the correction applied to the target (by relative degree)
    pub(crate) bias: f64,
}

/// Mutable run state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationState {
    pub alpha: f64,
    pub iteration: u64,
    pub running: bool,
    pub converged: bool,
}

impl Default for SimulationState {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            iteration: 0,
            running: true,
            converged: false,
        }
    }
}

/// Result of a single tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome {
    pub alpha: f64,
    pub iteration: u64,
    /// Set on the tick that crossed the convergence threshold
    pub converged: bool,
}

/// Force-directed layout simulator
#[derive(Debug, Clone)]
pub struct ForceSimulator {
    nodes: Vec<SimNode>,
    links: Vec<SimLink>,
    index: HashMap<String, usize>,
    config: SimulationConfig,
    state: SimulationState,
}

impl ForceSimulator {
    /// Build a simulator from a snapshot, starting at alpha 1.0
    pub fn new(snapshot: &GraphSnapshot, config: SimulationConfig) -> Self {
        let mut simulator = Self {
            nodes: Vec::new(),
            links: Vec::new(),
            index: HashMap::new(),
            config,
            state: SimulationState::default(),
        };
        simulator.load(snapshot, &HashMap::new());
        simulator
    }

    fn load(&mut self, snapshot: &GraphSnapshot, carried: &HashMap<String, SimNode>) {
        let radius = self.config.collision_radius;
        self.nodes = snapshot
            .nodes
            .iter()
            .map(|node| {
                let fixed = node
                    .pinned
                    .then_some((node.position.x, node.position.y));
                let (x, y, vx, vy) = match (carried.get(&node.id), fixed) {
                    (Some(previous), None) => (previous.x, previous.y, previous.vx, previous.vy),
                    _ => (node.position.x, node.position.y, node.vx, node.vy),
                };
                SimNode {
                    id: node.id.clone(),
                    x,
                    y,
                    vx,
                    vy,
                    fixed,
                    collapsed: node.collapsed,
                    radius: radius.radius_for(node.size),
                }
            })
            .collect();
        self.index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.clone(), i))
            .collect();

        let mut degree = vec![0usize; self.nodes.len()];
        let mut pairs = Vec::with_capacity(snapshot.edges.len());
        for edge in &snapshot.edges {
            let (Some(&source), Some(&target)) =
                (self.index.get(&edge.source), self.index.get(&edge.target))
            else {
                continue;
            };
            if source == target {
                continue;
            }
            degree[source] += 1;
            degree[target] += 1;
            pairs.push((source, target, edge.weight));
        }

        self.links = pairs
            .into_iter()
            .map(|(source, target, weight)| SimLink {
                source,
                target,
                distance: self.config.link_distance,
                strength: self.config.link_strength * weight,
                bias: degree[source] as f64 / (degree[source] + degree[target]) as f64,
            })
            .collect();
    }

    /// Replace the graph while keeping the motion of surviving nodes
    ///
    /// With `reheat` set, alpha is raised to [`REHEAT_ALPHA`] and the
    /// simulation resumes.
    pub fn update_graph(&mut self, snapshot: &GraphSnapshot, reheat: bool) {
        let carried: HashMap<String, SimNode> = self
            .nodes
            .drain(..)
            .map(|node| (node.id.clone(), node))
            .collect();
        self.load(snapshot, &carried);
        if reheat {
            self.reheat(REHEAT_ALPHA);
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn state(&self) -> SimulationState {
        self.state
    }

    pub fn alpha(&self) -> f64 {
        self.state.alpha
    }

    pub fn iteration(&self) -> u64 {
        self.state.iteration
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }

    pub fn is_converged(&self) -> bool {
        self.state.converged
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Resume ticking from the current alpha
    ///
    /// A converged simulation is reheated first, otherwise it would stop
    /// again on the next tick.
    pub fn start(&mut self) {
        if self.state.alpha < self.config.target_alpha {
            self.state.alpha = REHEAT_ALPHA;
        }
        self.state.running = true;
        self.state.converged = false;
    }

    /// Halt ticking, keeping positions
    pub fn stop(&mut self) {
        self.state.running = false;
    }

    /// Raise alpha to at least `alpha` and resume
    pub fn reheat(&mut self, alpha: f64) {
        self.state.alpha = self.state.alpha.max(alpha);
        self.state.running = true;
        self.state.converged = false;
    }

    /// Pin a node at a position and reheat so its neighbors react
    ///
    /// Returns `false` if the node is unknown.
    pub fn set_node_position(&mut self, id: &str, x: f64, y: f64) -> bool {
        let Some(&index) = self.index.get(id) else {
            return false;
        };
        let node = &mut self.nodes[index];
        node.x = x;
        node.y = y;
        node.vx = 0.0;
        node.vy = 0.0;
        node.fixed = Some((x, y));
        self.reheat(REHEAT_ALPHA);
        true
    }

    /// Unpin a node and reheat
    pub fn release_node(&mut self, id: &str) -> bool {
        let Some(&index) = self.index.get(id) else {
            return false;
        };
        self.nodes[index].fixed = None;
        self.reheat(REHEAT_ALPHA);
        true
    }

    /// Advance the simulation by one tick
    ///
    /// Does nothing when stopped.
    pub fn tick(&mut self) -> TickOutcome {
        if !self.state.running {
            return TickOutcome {
                alpha: self.state.alpha,
                iteration: self.state.iteration,
                converged: false,
            };
        }

        let alpha = self.state.alpha;
        let config = &self.config;
        let use_tree = self.nodes.len() > config.barnes_hut_threshold;

        if config.charge_strength != 0.0 {
            let members: Vec<usize> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, node)| !node.collapsed)
                .map(|(i, _)| i)
                .collect();
            let params = ChargeParams {
                strength: config.charge_strength,
                alpha,
                distance_min_sq: config.distance_min * config.distance_min,
                theta: config.theta,
            };
            if use_tree {
                forces::apply_charge_barnes_hut(&mut self.nodes, &members, params);
            } else {
                forces::apply_charge_exact(&mut self.nodes, &members, params);
            }
        }
        forces::apply_links(&mut self.nodes, &self.links, alpha);
        forces::apply_center(&mut self.nodes, config.center_strength);
        forces::apply_collisions(&mut self.nodes, config.collision_strength, use_tree);
        forces::integrate(&mut self.nodes, config.velocity_decay, config.max_velocity);

        self.state.iteration += 1;
        self.state.alpha *= 1.0 - config.alpha_decay;
        let converged = self.state.alpha < config.target_alpha;
        if converged {
            self.state.running = false;
            self.state.converged = true;
        }

        TickOutcome {
            alpha: self.state.alpha,
            iteration: self.state.iteration,
            converged,
        }
    }

    /// Tick until converged, stopped, or `max_ticks` ticks have run
    ///
    /// Returns the number of ticks executed.
    pub fn run_to_convergence(&mut self, max_ticks: u64) -> u64 {
        let mut ticks = 0;
        while self.state.running && ticks < max_ticks {
            self.tick();
            ticks += 1;
        }
        ticks
    }

    /// Current positions in node order
    pub fn positions(&self) -> Vec<NodePosition> {
        self.nodes
            .iter()
            .map(|node| NodePosition {
                id: node.id.clone(),
                x: node.x,
                y: node.y,
            })
            .collect()
    }

    pub fn position_of(&self, id: &str) -> Option<(f64, f64)> {
        self.index
            .get(id)
            .map(|&i| (self.nodes[i].x, self.nodes[i].y))
    }
}
