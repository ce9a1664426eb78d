//! Graph analytics
//!
//! Pure functions over a [`GraphSnapshot`]. Every result is wrapped in
//! [`Versioned`] with the snapshot's version; deciding when a result is stale
//! is up to the caller.
//!
//! Two measures are deliberately approximate:
//!
//! - Betweenness defaults to a local ego-network estimate, O(n·d²), and the
//!   result says so in [`CentralityResult::betweenness_method`]
//! - PageRank does not redistribute the rank held by sinks, so ranks do not
//!   sum to 1 when the graph has isolated nodes
//!
//! Edges are undirected for every measure: an edge is an out-link of both of
//! its endpoints when rank flows.

use std::collections::{BTreeMap, HashMap, VecDeque};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::model::{GraphSnapshot, Versioned};

/// Default PageRank damping factor
pub const DEFAULT_DAMPING: f64 = 0.85;

/// Default number of PageRank iterations
pub const DEFAULT_PAGERANK_ITERATIONS: usize = 10;

/// Default maximum number of label propagation passes
pub const DEFAULT_MAX_LABEL_ITERATIONS: usize = 10;

/// How betweenness centrality is computed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetweennessMethod {
    /// Ego-network estimate from neighbor-pair connectivity
    #[default]
    Approximate,
    /// Brandes' algorithm, O(n·m)
    Exact,
}

/// Analytics configuration, also sent as options across the worker boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub damping: f64,
    pub pagerank_iterations: usize,
    pub max_label_iterations: usize,
    /// Seed for the label propagation visiting order
    pub seed: u64,
    pub betweenness: BetweennessMethod,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            damping: DEFAULT_DAMPING,
            pagerank_iterations: DEFAULT_PAGERANK_ITERATIONS,
            max_label_iterations: DEFAULT_MAX_LABEL_ITERATIONS,
            seed: 42,
            betweenness: BetweennessMethod::Approximate,
        }
    }
}

impl AnalyticsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.damping) {
            return Err(ConfigError::Invalid {
                field: "damping",
                reason: format!("{} is not between 0 and 1", self.damping),
            });
        }
        if self.max_label_iterations == 0 {
            return Err(ConfigError::Invalid {
                field: "max_label_iterations",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Centrality scores for one node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CentralityScores {
    /// Incident edges, self-loops excluded
    pub degree: usize,
    /// `degree / (n - 1)`, 0 for graphs with fewer than two nodes
    pub normalized_degree: f64,
    pub betweenness: f64,
    pub pagerank: f64,
}

/// Centrality scores for every node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CentralityResult {
    pub scores: BTreeMap<String, CentralityScores>,
    pub betweenness_method: BetweennessMethod,
}

/// Metric used to rank nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Degree,
    Betweenness,
    PageRank,
}

impl CentralityScores {
    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Degree => self.normalized_degree,
            Metric::Betweenness => self.betweenness,
            Metric::PageRank => self.pagerank,
        }
    }
}

impl CentralityResult {
    /// The `limit` highest-scoring nodes, ties broken by id
    pub fn top_by(&self, metric: Metric, limit: usize) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .scores
            .iter()
            .map(|(id, scores)| (id.clone(), scores.get(metric)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }
}

/// Label propagation output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunityResult {
    /// Community label (a member node id) per node
    pub labels: BTreeMap<String, String>,
    /// Members per community, largest first
    pub communities: Vec<Vec<String>>,
    /// Passes run before stabilizing or hitting the limit
    pub iterations: usize,
}

impl CommunityResult {
    pub fn community_of(&self, id: &str) -> Option<&str> {
        self.labels.get(id).map(String::as_str)
    }
}

/// Shortest path outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PathResult {
    Found { path: Vec<String>, distance: usize },
    NotFound { source: String, target: String },
}

/// Index-based view of a snapshot
struct Adjacency<'a> {
    ids: Vec<&'a str>,
    /// Undirected, deduplicated, sorted; self-loops dropped
    neighbors: Vec<Vec<usize>>,
    degree: Vec<usize>,
}

impl<'a> Adjacency<'a> {
    fn new(snapshot: &'a GraphSnapshot) -> Self {
        let ids: Vec<&str> = snapshot.nodes.iter().map(|node| node.id.as_str()).collect();
        let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let n = ids.len();
        let mut neighbors = vec![Vec::new(); n];
        let mut degree = vec![0; n];

        for edge in &snapshot.edges {
            let (Some(&s), Some(&t)) = (
                index.get(edge.source.as_str()),
                index.get(edge.target.as_str()),
            ) else {
                continue;
            };
            if s == t {
                continue;
            }
            neighbors[s].push(t);
            neighbors[t].push(s);
            degree[s] += 1;
            degree[t] += 1;
        }
        for list in &mut neighbors {
            list.sort_unstable();
            list.dedup();
        }

        Self {
            ids,
            neighbors,
            degree,
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|candidate| *candidate == id)
    }

    fn linked(&self, a: usize, b: usize) -> bool {
        self.neighbors[a].binary_search(&b).is_ok()
    }

    fn common_neighbors(&self, a: usize, b: usize) -> usize {
        let (left, right) = (&self.neighbors[a], &self.neighbors[b]);
        let (mut i, mut j, mut count) = (0, 0, 0);
        while i < left.len() && j < right.len() {
            match left[i].cmp(&right[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    count += 1;
                    i += 1;
                    j += 1;
                }
            }
        }
        count
    }
}

fn normalized_degree(adjacency: &Adjacency) -> Vec<f64> {
    let n = adjacency.len();
    adjacency
        .degree
        .iter()
        .map(|&d| if n > 1 { d as f64 / (n - 1) as f64 } else { 0.0 })
        .collect()
}

/// For each pair of a node's neighbors that are not linked to each other, the
/// node gets `1 / k` where `k` is the number of neighbors the pair shares
fn betweenness_approximate(adjacency: &Adjacency) -> Vec<f64> {
    adjacency
        .neighbors
        .iter()
        .map(|around| {
            let mut score = 0.0;
            for (i, &a) in around.iter().enumerate() {
                for &b in &around[i + 1..] {
                    if adjacency.linked(a, b) {
                        continue;
                    }
                    score += 1.0 / adjacency.common_neighbors(a, b).max(1) as f64;
                }
            }
            score
        })
        .collect()
}

fn betweenness_exact(adjacency: &Adjacency) -> Vec<f64> {
    let n = adjacency.len();
    let mut centrality = vec![0.0; n];

    for source in 0..n {
        let mut stack = Vec::with_capacity(n);
        let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut sigma = vec![0.0; n];
        let mut distance: Vec<Option<usize>> = vec![None; n];
        sigma[source] = 1.0;
        distance[source] = Some(0);

        let mut queue = VecDeque::from([source]);
        while let Some(v) = queue.pop_front() {
            stack.push(v);
            let next = distance[v].map_or(0, |d| d + 1);
            for &w in &adjacency.neighbors[v] {
                if distance[w].is_none() {
                    distance[w] = Some(next);
                    queue.push_back(w);
                }
                if distance[w] == Some(next) {
                    sigma[w] += sigma[v];
                    predecessors[w].push(v);
                }
            }
        }

        let mut delta = vec![0.0; n];
        while let Some(w) = stack.pop() {
            for &v in &predecessors[w] {
                delta[v] += sigma[v] / sigma[w] * (1.0 + delta[w]);
            }
            if w != source {
                centrality[w] += delta[w];
            }
        }
    }

    // Each undirected path was counted from both ends
    centrality.iter_mut().for_each(|c| *c /= 2.0);
    centrality
}

fn pagerank(adjacency: &Adjacency, damping: f64, iterations: usize) -> Vec<f64> {
    let n = adjacency.len();
    if n == 0 {
        return Vec::new();
    }
    let base = (1.0 - damping) / n as f64;
    let mut rank = vec![1.0 / n as f64; n];

    for _ in 0..iterations {
        let mut next = vec![base; n];
        for (source, links) in adjacency.neighbors.iter().enumerate() {
            if links.is_empty() {
                continue;
            }
            let share = damping * rank[source] / links.len() as f64;
            for &target in links {
                next[target] += share;
            }
        }
        rank = next;
    }
    rank
}

/// Degree, betweenness, and PageRank for every node
pub fn centrality(snapshot: &GraphSnapshot, config: &AnalyticsConfig) -> Versioned<CentralityResult> {
    let adjacency = Adjacency::new(snapshot);
    let normalized = normalized_degree(&adjacency);
    let betweenness = match config.betweenness {
        BetweennessMethod::Approximate => betweenness_approximate(&adjacency),
        BetweennessMethod::Exact => betweenness_exact(&adjacency),
    };
    let ranks = pagerank(&adjacency, config.damping, config.pagerank_iterations);

    let scores = adjacency
        .ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let scores = CentralityScores {
                degree: adjacency.degree[i],
                normalized_degree: normalized[i],
                betweenness: betweenness[i],
                pagerank: ranks[i],
            };
            (id.to_string(), scores)
        })
        .collect();

    Versioned::new(
        snapshot.version,
        CentralityResult {
            scores,
            betweenness_method: config.betweenness,
        },
    )
}

/// Label propagation community detection
///
/// Nodes are visited in an order shuffled by a generator seeded from
/// `config.seed`, so results are reproducible. Each node takes the most
/// frequent label among its neighbors, keeping its own label on a tie when
/// it is among the leaders and otherwise taking the smallest.
pub fn communities(snapshot: &GraphSnapshot, config: &AnalyticsConfig) -> Versioned<CommunityResult> {
    let adjacency = Adjacency::new(snapshot);
    let n = adjacency.len();
    let mut labels: Vec<usize> = (0..n).collect();
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut iterations = 0;

    while iterations < config.max_label_iterations {
        iterations += 1;
        order.shuffle(&mut rng);
        let mut changed = false;

        for &node in &order {
            let around = &adjacency.neighbors[node];
            if around.is_empty() {
                continue;
            }
            let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
            for &neighbor in around {
                *counts.entry(labels[neighbor]).or_default() += 1;
            }
            let best = counts.values().copied().max().unwrap_or(0);
            let current = labels[node];
            if counts.get(&current) == Some(&best) {
                continue;
            }
            // BTreeMap iterates labels in ascending order
            if let Some((&label, _)) = counts.iter().find(|(_, count)| **count == best) {
                labels[node] = label;
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    let mut groups: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (node, &label) in labels.iter().enumerate() {
        groups
            .entry(label)
            .or_default()
            .push(adjacency.ids[node].to_string());
    }
    let mut communities: Vec<Vec<String>> = groups.into_values().collect();
    communities.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

    let labels = labels
        .iter()
        .enumerate()
        .map(|(node, &label)| {
            (
                adjacency.ids[node].to_string(),
                adjacency.ids[label].to_string(),
            )
        })
        .collect();

    Versioned::new(
        snapshot.version,
        CommunityResult {
            labels,
            communities,
            iterations,
        },
    )
}

/// Unweighted breadth-first shortest path, ignoring edge direction
pub fn shortest_path(snapshot: &GraphSnapshot, source: &str, target: &str) -> Versioned<PathResult> {
    let adjacency = Adjacency::new(snapshot);
    let not_found = || PathResult::NotFound {
        source: source.to_string(),
        target: target.to_string(),
    };
    let (Some(start), Some(goal)) = (adjacency.position(source), adjacency.position(target))
    else {
        return Versioned::new(snapshot.version, not_found());
    };

    let mut previous: Vec<Option<usize>> = vec![None; adjacency.len()];
    let mut visited = vec![false; adjacency.len()];
    visited[start] = true;
    let mut queue = VecDeque::from([start]);

    while let Some(current) = queue.pop_front() {
        if current == goal {
            break;
        }
        for &next in &adjacency.neighbors[current] {
            if !visited[next] {
                visited[next] = true;
                previous[next] = Some(current);
                queue.push_back(next);
            }
        }
    }

    if !visited[goal] {
        return Versioned::new(snapshot.version, not_found());
    }

    let mut path = vec![adjacency.ids[goal].to_string()];
    let mut cursor = goal;
    while let Some(prior) = previous[cursor] {
        path.push(adjacency.ids[prior].to_string());
        cursor = prior;
    }
    path.reverse();
    let distance = path.len() - 1;

    Versioned::new(snapshot.version, PathResult::Found { path, distance })
}
