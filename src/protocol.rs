//! Messages crossing the worker boundary
//!
//! Both directions are closed enums tagged by `type`. Graph data is always
//! sent as an owned [`GraphSnapshot`], never shared.

use serde::{Deserialize, Serialize};

use crate::analytics::{AnalyticsConfig, CentralityResult, CommunityResult};
use crate::model::{GraphSnapshot, NodePosition};
use crate::simulation::SimulationConfig;

/// Command sent to the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerCommand {
    /// Build a new simulation; it starts ticking immediately
    Init {
        snapshot: GraphSnapshot,
        config: SimulationConfig,
        epoch: u64,
    },
    /// Resume ticking under a new epoch
    Start { epoch: u64 },
    Stop,
    SetNodePosition { node_id: String, x: f64, y: f64 },
    ReleaseNode { node_id: String },
    /// Replace the worker's graph, keeping surviving node motion
    UpdateGraph { snapshot: GraphSnapshot, reheat: bool },
    CalculateCentrality { options: AnalyticsConfig },
    FindCommunities { options: AnalyticsConfig },
    FindPath { source_id: String, target_id: String },
    Shutdown,
}

impl WorkerCommand {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            WorkerCommand::Init { .. } => "INIT",
            WorkerCommand::Start { .. } => "START",
            WorkerCommand::Stop => "STOP",
            WorkerCommand::SetNodePosition { .. } => "SET_NODE_POSITION",
            WorkerCommand::ReleaseNode { .. } => "RELEASE_NODE",
            WorkerCommand::UpdateGraph { .. } => "UPDATE_GRAPH",
            WorkerCommand::CalculateCentrality { .. } => "CALCULATE_CENTRALITY",
            WorkerCommand::FindCommunities { .. } => "FIND_COMMUNITIES",
            WorkerCommand::FindPath { .. } => "FIND_PATH",
            WorkerCommand::Shutdown => "SHUTDOWN",
        }
    }
}

/// Why a simulation run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Converged,
    Stopped,
}

/// Event emitted by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerEvent {
    SimulationInitialized {
        node_count: usize,
        edge_count: usize,
    },
    TickUpdate {
        positions: Vec<NodePosition>,
        alpha: f64,
        iteration: u64,
        /// Ticks per second measured by the worker; informational only
        fps: f64,
    },
    SimulationEnded {
        positions: Vec<NodePosition>,
        reason: EndReason,
        iterations: u64,
    },
    CentralityCalculated { result: CentralityResult },
    CommunitiesFound { result: CommunityResult },
    PathFound { path: Vec<String>, distance: usize },
    PathNotFound { source_id: String, target_id: String },
    WorkerError {
        message: String,
        context: Option<String>,
    },
}

/// Command envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub correlation_id: u64,
    pub command: WorkerCommand,
}

/// Event envelope
///
/// `run_id` is the epoch of the simulation run the event belongs to and
/// `version` is the version of the worker's graph snapshot when the event was
/// produced. The engine uses both to discard stale events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    pub correlation_id: u64,
    pub run_id: u64,
    pub version: u64,
    pub event: WorkerEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json(value: &impl Serialize) -> String {
        serde_json::to_string(value).unwrap()
    }

    #[test]
    fn commands_are_tagged_by_type() {
        insta::assert_snapshot!(json(&WorkerCommand::Start { epoch: 3 }), @r#"{"type":"START","epoch":3}"#);
        insta::assert_snapshot!(json(&WorkerCommand::Stop), @r#"{"type":"STOP"}"#);
        insta::assert_snapshot!(
            json(&WorkerCommand::SetNodePosition {
                node_id: "a".to_string(),
                x: 1.5,
                y: -2.0,
            }),
            @r#"{"type":"SET_NODE_POSITION","node_id":"a","x":1.5,"y":-2.0}"#
        );
        insta::assert_snapshot!(
            json(&WorkerCommand::FindPath {
                source_id: "a".to_string(),
                target_id: "b".to_string(),
            }),
            @r#"{"type":"FIND_PATH","source_id":"a","target_id":"b"}"#
        );
    }

    #[test]
    fn events_are_tagged_by_type() {
        let ended = WorkerEvent::SimulationEnded {
            positions: vec![NodePosition {
                id: "a".to_string(),
                x: 0.5,
                y: 1.0,
            }],
            reason: EndReason::Converged,
            iterations: 228,
        };
        insta::assert_snapshot!(
            json(&ended),
            @r#"{"type":"SIMULATION_ENDED","positions":[{"id":"a","x":0.5,"y":1.0}],"reason":"converged","iterations":228}"#
        );

        let missing = WorkerEvent::PathNotFound {
            source_id: "a".to_string(),
            target_id: "z".to_string(),
        };
        insta::assert_snapshot!(
            json(&missing),
            @r#"{"type":"PATH_NOT_FOUND","source_id":"a","target_id":"z"}"#
        );
    }

    #[test]
    fn envelope_wraps_event() {
        let message = WorkerMessage {
            correlation_id: 7,
            run_id: 2,
            version: 11,
            event: WorkerEvent::WorkerError {
                message: "boom".to_string(),
                context: None,
            },
        };
        insta::assert_snapshot!(
            json(&message),
            @r#"{"correlation_id":7,"run_id":2,"version":11,"event":{"type":"WORKER_ERROR","message":"boom","context":null}}"#
        );
    }

    #[test]
    fn init_command_parses_with_default_config() {
        let command: WorkerCommand = serde_json::from_str(
            r#"{"type":"INIT","snapshot":{"version":4,"nodes":[],"edges":[]},"config":{},"epoch":1}"#,
        )
        .unwrap();

        match command {
            WorkerCommand::Init {
                snapshot,
                config,
                epoch,
            } => {
                assert_eq!(snapshot.version, 4);
                assert_eq!(config, SimulationConfig::default());
                assert_eq!(epoch, 1);
            }
            other => panic!("expected INIT, got {}", other.name()),
        }
    }

    #[test]
    fn command_names_match_wire_tags() {
        let command = WorkerCommand::ReleaseNode {
            node_id: "a".to_string(),
        };
        let value: serde_json::Value = serde_json::to_value(&command).unwrap();
        assert_eq!(value["type"], command.name());
    }
}
