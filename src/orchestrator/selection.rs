//! Least-loaded agent selection.

use std::time::Duration;

use futures::future::join_all;

use crate::agents::{Agent, AgentDirectory, AgentProbe};

/// Probe every agent concurrently and pick the reachable one with the
/// fewest running jobs. Ties go to the lowest agent id.
///
/// Each probe is bounded by `probe_timeout`; a probe that times out counts
/// as unreachable. Returns `None` when no agent answers.
pub async fn select_agent(
    directory: &dyn AgentDirectory,
    mut agents: Vec<Agent>,
    probe_timeout: Duration,
) -> Option<(Agent, AgentProbe)> {
    agents.sort_by_key(|a| a.id);

    let probes = join_all(agents.iter().map(|agent| async move {
        match tokio::time::timeout(probe_timeout, directory.probe(agent)).await {
            Ok(probe) => probe,
            Err(_) => {
                tracing::warn!(agent_id = agent.id, url = %agent.url, "agent probe timed out");
                AgentProbe::unreachable()
            }
        }
    }))
    .await;

    for (agent, probe) in agents.iter().zip(&probes) {
        tracing::debug!(
            agent_id = agent.id,
            reachable = probe.reachable,
            active_jobs = probe.active_jobs,
            "probed agent"
        );
    }

    // min_by_key keeps the first minimum, and agents are sorted by id.
    agents
        .into_iter()
        .zip(probes)
        .filter(|(_, probe)| probe.reachable)
        .min_by_key(|(_, probe)| probe.active_jobs)
}
