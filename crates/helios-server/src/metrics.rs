// Metrics descriptions and runtime-level recorders
// Coordination and election metrics are recorded by helios-coordination

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    // Coordination metrics
    describe_counter!(
        "helios_coordination_commits_total",
        "Transactions submitted, labelled by outcome: committed, recovered, rejected, unknown, unavailable or expired"
    );
    describe_counter!(
        "helios_coordination_retries_total",
        "Transaction and read attempts retried after a connectivity failure"
    );
    describe_counter!(
        "helios_coordination_watch_notifications_total",
        "Change notifications delivered to watch listeners"
    );

    // Election metrics
    describe_gauge!(
        "helios_election_is_leader",
        "1 while this process holds master leadership, 0 otherwise"
    );

    // Runtime metrics
    describe_gauge!("helios_agents_up", "Agents currently registered as up");
    describe_counter!(
        "helios_assignment_updates_total",
        "Desired-state changes observed by the local agent"
    );
}

pub fn set_agents_up(count: usize) {
    gauge!("helios_agents_up").set(count as f64);
}

pub fn record_assignment_update() {
    counter!("helios_assignment_updates_total").increment(1);
}
