/// Topology state transitions
///
/// `apply` is the deployment-type state machine: it folds one monitor report
/// into the current snapshot and produces the next one. It is a pure
/// function with no I/O; callers serialize invocations (single writer) and
/// publish the result atomically.
use std::time::Duration;

use tracing::{debug, warn};

use crate::topology::{
    ServerAddress, ServerDescription, ServerRole, TopologyDescription, TopologyType,
};

/// Fold a monitor report into the current topology, producing a new snapshot.
///
/// Reports for addresses no longer in the topology are ignored (the returned
/// snapshot keeps the current revision, which callers treat as a no-op); a
/// server removed by authoritative membership information must not be
/// resurrected by a late probe result. Every effective update increments the
/// revision counter. Never fails: malformed or errored reports are folded in
/// as error-state descriptions.
pub fn apply(current: &TopologyDescription, report: ServerDescription) -> TopologyDescription {
    if !current.contains(&report.address) {
        debug!(address = %report.address, "ignoring report for unknown server");
        return current.clone();
    }

    let mut next = current.clone();

    match current.topology_type {
        TopologyType::LoadBalanced => {
            next.servers.insert(report.address.clone(), report);
        }
        TopologyType::Single => {
            next.servers.insert(report.address.clone(), report);
        }
        TopologyType::Unknown => apply_to_unknown(&mut next, report),
        TopologyType::Sharded => apply_to_sharded(&mut next, report),
        TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
            apply_to_replica_set(&mut next, report)
        }
    }

    next.logical_session_timeout = session_timeout(&next);
    next.revision = current.revision + 1;
    next
}

fn apply_to_unknown(next: &mut TopologyDescription, report: ServerDescription) {
    match report.role {
        ServerRole::Standalone => {
            // A standalone only forms a Single topology when it is the lone
            // seed; otherwise it cannot be part of the deployment.
            if next.servers.len() == 1 {
                next.topology_type = TopologyType::Single;
                next.servers.insert(report.address.clone(), report);
            } else {
                warn!(address = %report.address, "standalone server among multiple seeds, removing");
                next.servers.remove(&report.address);
            }
        }
        ServerRole::Router => {
            next.topology_type = TopologyType::Sharded;
            next.servers.insert(report.address.clone(), report);
        }
        ServerRole::Primary => {
            next.topology_type = TopologyType::ReplicaSetWithPrimary;
            apply_to_replica_set(next, report);
        }
        ServerRole::Secondary | ServerRole::Arbiter => {
            next.topology_type = TopologyType::ReplicaSetNoPrimary;
            apply_to_replica_set(next, report);
        }
        ServerRole::Ghost | ServerRole::Unknown => {
            // Not enough information to adopt a deployment type yet
            next.servers.insert(report.address.clone(), report);
        }
    }
}

fn apply_to_sharded(next: &mut TopologyDescription, report: ServerDescription) {
    match report.role {
        ServerRole::Router | ServerRole::Unknown => {
            next.servers.insert(report.address.clone(), report);
        }
        _ => {
            // A non-router has no place in a sharded topology
            warn!(address = %report.address, role = ?report.role, "removing non-router from sharded topology");
            next.servers.remove(&report.address);
        }
    }
}

fn apply_to_replica_set(next: &mut TopologyDescription, report: ServerDescription) {
    // A server claiming membership in a different set is not one of ours
    if let (Some(expected), Some(reported)) = (&next.set_name, &report.set_name) {
        if expected != reported {
            warn!(
                address = %report.address,
                expected = %expected,
                reported = %reported,
                "server reported foreign replica set, removing"
            );
            next.servers.remove(&report.address);
            recheck_primary(next);
            return;
        }
    }

    match report.role {
        ServerRole::Primary => apply_primary(next, report),
        ServerRole::Secondary | ServerRole::Arbiter | ServerRole::Ghost => {
            if next.set_name.is_none() {
                next.set_name = report.set_name.clone();
            }
            // Secondaries also advertise membership; use it for discovery
            // while there is no primary to be authoritative.
            if next.topology_type == TopologyType::ReplicaSetNoPrimary {
                for host in &report.hosts {
                    next.servers
                        .entry(host.clone())
                        .or_insert_with(|| ServerDescription::unknown(host.clone()));
                }
            }
            let was_primary = next
                .servers
                .get(&report.address)
                .map(|s| s.role == ServerRole::Primary)
                .unwrap_or(false);
            next.servers.insert(report.address.clone(), report);
            if was_primary {
                recheck_primary(next);
            }
        }
        ServerRole::Standalone => {
            // Standalones cannot participate in a replica set
            next.servers.remove(&report.address);
            recheck_primary(next);
        }
        ServerRole::Router => {
            next.servers.remove(&report.address);
            recheck_primary(next);
        }
        ServerRole::Unknown => {
            let was_primary = next
                .servers
                .get(&report.address)
                .map(|s| s.role == ServerRole::Primary)
                .unwrap_or(false);
            next.servers.insert(report.address.clone(), report);
            if was_primary {
                recheck_primary(next);
            }
        }
    }
}

fn apply_primary(next: &mut TopologyDescription, report: ServerDescription) {
    // A primary claim carrying a lower election ordinal than one already
    // observed is stale; demote it and wait for its next probe.
    if let (Some(max_seen), Some(reported)) = (next.max_election_ordinal, report.election_ordinal) {
        if reported < max_seen {
            debug!(
                address = %report.address,
                reported,
                max_seen,
                "stale primary claim, demoting to unknown"
            );
            next.servers.insert(
                report.address.clone(),
                ServerDescription::unknown(report.address.clone()),
            );
            recheck_primary(next);
            return;
        }
    }

    if next.set_name.is_none() {
        next.set_name = report.set_name.clone();
    }
    if report.election_ordinal.is_some() {
        next.max_election_ordinal = report.election_ordinal;
    }

    // Exactly one primary per snapshot: any other server previously recorded
    // as primary is demoted to unknown until its next probe says otherwise.
    let demoted: Vec<ServerAddress> = next
        .servers
        .iter()
        .filter(|(addr, s)| s.role == ServerRole::Primary && **addr != report.address)
        .map(|(addr, _)| addr.clone())
        .collect();
    for addr in demoted {
        debug!(address = %addr, "demoting previous primary");
        next.servers
            .insert(addr.clone(), ServerDescription::unknown(addr));
    }

    // The primary's membership list is authoritative: unreferenced servers
    // are dropped, newly referenced ones are added for monitoring.
    if !report.hosts.is_empty() {
        let members: Vec<ServerAddress> = report.hosts.clone();
        next.servers
            .retain(|addr, _| members.contains(addr) || *addr == report.address);
        for host in members {
            next.servers
                .entry(host.clone())
                .or_insert_with(|| ServerDescription::unknown(host));
        }
    }

    next.servers.insert(report.address.clone(), report);
    next.topology_type = TopologyType::ReplicaSetWithPrimary;
}

fn recheck_primary(next: &mut TopologyDescription) {
    if matches!(
        next.topology_type,
        TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary
    ) {
        next.topology_type = if next.primary().is_some() {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }
}

/// Deployment-wide session timeout: the minimum advertised across data-bearing
/// servers, or None if any data-bearing server does not advertise one.
fn session_timeout(topology: &TopologyDescription) -> Option<Duration> {
    let mut min: Option<Duration> = None;
    for server in topology.servers.values() {
        if !server.role.is_data_bearing() {
            continue;
        }
        match server.logical_session_timeout {
            Some(timeout) => {
                min = Some(match min {
                    Some(m) => m.min(timeout),
                    None => timeout,
                });
            }
            None => return None,
        }
    }
    min
}
