use once_cell::sync::Lazy;
use opentelemetry::{global, metrics::Counter, KeyValue};

static COORDINATOR_METRICS: Lazy<CoordinatorMetrics> = Lazy::new(|| {
    let meter = global::meter("horology-kernel.consensus");
    CoordinatorMetrics {
        election_attempts: meter
            .u64_counter("kernel.consensus.election.attempts")
            .with_description("Number of election rounds started by this node")
            .init(),
        election_results: meter
            .u64_counter("kernel.consensus.election.results")
            .with_description("Outcome of consensus election rounds")
            .init(),
        leadership_transitions: meter
            .u64_counter("kernel.consensus.leadership.transitions")
            .with_description("Leadership transitions observed by this node")
            .init(),
    }
});

struct CoordinatorMetrics {
    election_attempts: Counter<u64>,
    election_results: Counter<u64>,
    leadership_transitions: Counter<u64>,
}

#[derive(Clone, Copy)]
pub enum ElectionResult {
    Won,
    Contended,
}

#[derive(Clone, Copy)]
pub enum LeadershipState {
    Leader,
    Follower,
}

pub fn record_election_attempt(node_id: u64) {
    COORDINATOR_METRICS
        .election_attempts
        .add(1, &[KeyValue::new("node_id", node_id.to_string())]);
}

pub fn record_election_result(node_id: u64, result: ElectionResult) {
    COORDINATOR_METRICS.election_results.add(
        1,
        &[
            KeyValue::new("node_id", node_id.to_string()),
            KeyValue::new("result", election_result_value(result)),
        ],
    );
}

pub fn record_leadership_transition(node_id: u64, state: LeadershipState) {
    COORDINATOR_METRICS.leadership_transitions.add(
        1,
        &[
            KeyValue::new("node_id", node_id.to_string()),
            KeyValue::new("state", leadership_state_value(state)),
        ],
    );
}

fn election_result_value(result: ElectionResult) -> &'static str {
    match result {
        ElectionResult::Won => "won",
        ElectionResult::Contended => "contended",
    }
}

fn leadership_state_value(state: LeadershipState) -> &'static str {
    match state {
        LeadershipState::Leader => "leader",
        LeadershipState::Follower => "follower",
    }
}
