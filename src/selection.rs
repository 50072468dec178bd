/// Server selection: a pure function from a topology snapshot and caller
/// criteria to the set of eligible servers
use std::collections::HashMap;
use std::time::Duration;

use rand::seq::SliceRandom;

use crate::topology::{ServerDescription, ServerRole, TopologyDescription, TopologyType};

/// Default latency window width above the minimum observed round-trip time
pub const DEFAULT_LATENCY_WINDOW: Duration = Duration::from_millis(15);

/// Which roles a read may be served by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

/// Caller-supplied constraints on server selection
#[derive(Debug, Clone)]
pub struct SelectionCriteria {
    pub mode: ReadMode,
    /// Tag sets tried in order; the first set matched by any server is used
    pub tag_sets: Vec<HashMap<String, String>>,
    /// Maximum tolerated replication lag relative to the freshest eligible server
    pub max_staleness: Option<Duration>,
    /// Latency window width; servers within `min_rtt + window` stay eligible
    pub latency_window: Duration,
}

impl SelectionCriteria {
    pub fn new(mode: ReadMode) -> Self {
        Self {
            mode,
            tag_sets: Vec::new(),
            max_staleness: None,
            latency_window: DEFAULT_LATENCY_WINDOW,
        }
    }

    pub fn primary() -> Self {
        Self::new(ReadMode::Primary)
    }

    pub fn secondary() -> Self {
        Self::new(ReadMode::Secondary)
    }

    pub fn nearest() -> Self {
        Self::new(ReadMode::Nearest)
    }

    pub fn with_tag_set(mut self, tags: HashMap<String, String>) -> Self {
        self.tag_sets.push(tags);
        self
    }

    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = Some(max_staleness);
        self
    }

    pub fn with_latency_window(mut self, window: Duration) -> Self {
        self.latency_window = window;
        self
    }
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        Self::primary()
    }
}

/// Filter the topology down to servers eligible under the criteria.
///
/// Pure and deterministic: repeated calls against the same snapshot and
/// criteria return the same servers in the same order. The caller performs
/// the final pick (see [`pick`]) to spread load.
pub fn select(
    topology: &TopologyDescription,
    criteria: &SelectionCriteria,
) -> Vec<ServerDescription> {
    let candidates = match topology.topology_type {
        TopologyType::Unknown => Vec::new(),
        TopologyType::Single | TopologyType::LoadBalanced => topology
            .servers
            .values()
            .filter(|s| s.is_available())
            .cloned()
            .collect(),
        TopologyType::Sharded => topology
            .servers
            .values()
            .filter(|s| s.role == ServerRole::Router && s.is_available())
            .cloned()
            .collect(),
        TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
            select_replica_set(topology, criteria)
        }
    };

    let mut eligible = within_latency_window(candidates, criteria.latency_window);
    eligible.sort_by(|a, b| a.address.cmp(&b.address));
    eligible
}

/// Uniform-random final pick among eligible servers
pub fn pick(eligible: &[ServerDescription]) -> Option<ServerDescription> {
    eligible.choose(&mut rand::thread_rng()).cloned()
}

fn select_replica_set(
    topology: &TopologyDescription,
    criteria: &SelectionCriteria,
) -> Vec<ServerDescription> {
    let primary: Vec<ServerDescription> =
        topology.primary().into_iter().cloned().collect();
    let secondaries = matching_secondaries(topology, criteria);

    match criteria.mode {
        ReadMode::Primary => primary,
        ReadMode::Secondary => secondaries,
        ReadMode::PrimaryPreferred => {
            if primary.is_empty() {
                secondaries
            } else {
                primary
            }
        }
        ReadMode::SecondaryPreferred => {
            if secondaries.is_empty() {
                primary
            } else {
                secondaries
            }
        }
        ReadMode::Nearest => {
            let mut all = primary;
            all.extend(secondaries);
            all
        }
    }
}

fn matching_secondaries(
    topology: &TopologyDescription,
    criteria: &SelectionCriteria,
) -> Vec<ServerDescription> {
    let secondaries: Vec<ServerDescription> = topology
        .servers
        .values()
        .filter(|s| s.role == ServerRole::Secondary)
        .cloned()
        .collect();

    let fresh = filter_staleness(secondaries, criteria.max_staleness);
    filter_tags(fresh, &criteria.tag_sets)
}

/// Staleness is measured against the freshest last-write among the
/// candidates, avoiding a wall-clock read so selection stays pure.
fn filter_staleness(
    candidates: Vec<ServerDescription>,
    max_staleness: Option<Duration>,
) -> Vec<ServerDescription> {
    let max_staleness = match max_staleness {
        Some(m) => m,
        None => return candidates,
    };

    let freshest = match candidates.iter().filter_map(|s| s.last_write).max() {
        Some(t) => t,
        None => return candidates,
    };

    candidates
        .into_iter()
        .filter(|s| match s.last_write {
            Some(w) => freshest
                .duration_since(w)
                .map(|lag| lag <= max_staleness)
                .unwrap_or(true),
            None => false,
        })
        .collect()
}

fn filter_tags(
    candidates: Vec<ServerDescription>,
    tag_sets: &[HashMap<String, String>],
) -> Vec<ServerDescription> {
    if tag_sets.is_empty() {
        return candidates;
    }

    for tag_set in tag_sets {
        let matched: Vec<ServerDescription> = candidates
            .iter()
            .filter(|s| tag_set.iter().all(|(k, v)| s.tags.get(k) == Some(v)))
            .cloned()
            .collect();
        if !matched.is_empty() {
            return matched;
        }
    }

    Vec::new()
}

/// Keep only servers whose round-trip time is within `window` of the minimum.
/// Servers without a latency estimate are excluded once any candidate has one.
fn within_latency_window(
    candidates: Vec<ServerDescription>,
    window: Duration,
) -> Vec<ServerDescription> {
    let min_rtt = match candidates.iter().filter_map(|s| s.round_trip_time).min() {
        Some(min) => min,
        None => return candidates,
    };

    candidates
        .into_iter()
        .filter(|s| match s.round_trip_time {
            Some(rtt) => rtt <= min_rtt + window,
            None => false,
        })
        .collect()
}
