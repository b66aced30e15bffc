//! Concrete retention policies.
//!
//! Policies are pure: they look at a node record and the current time and
//! return a decision. They never touch the registry.

use std::time::Duration;

use flotilla_provision::{RetentionDecision, RetentionPolicy};
use flotilla_state::NodeRecord;

/// Never remove the node automatically.
#[derive(Debug, Clone, Copy, Default)]
pub struct Always;

impl RetentionPolicy for Always {
    fn check(&self, _node: &NodeRecord, _now: u64) -> RetentionDecision {
        RetentionDecision::Keep
    }

    fn describe(&self) -> String {
        "always".to_string()
    }
}

/// Remove the node once it has been idle for at least `idle_for`.
///
/// A node with queued tasks is never idle.
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeout {
    idle_for: Duration,
}

impl IdleTimeout {
    pub fn new(idle_for: Duration) -> Self {
        Self { idle_for }
    }
}

impl RetentionPolicy for IdleTimeout {
    fn check(&self, node: &NodeRecord, now: u64) -> RetentionDecision {
        let limit = self.idle_for.as_secs();
        match node.idle_for(now) {
            Some(idle) if idle >= limit => {
                RetentionDecision::remove(format!("idle for {idle}s (limit {limit}s)"))
            }
            _ => RetentionDecision::Keep,
        }
    }

    fn describe(&self) -> String {
        format!("idle-timeout({}s)", self.idle_for.as_secs())
    }
}

/// Remove the node as soon as it has run work and gone idle again.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleUse;

impl RetentionPolicy for SingleUse {
    fn check(&self, node: &NodeRecord, _now: u64) -> RetentionDecision {
        if node.has_run_work && node.is_idle() {
            RetentionDecision::remove("single-use node finished its work")
        } else {
            RetentionDecision::Keep
        }
    }

    fn describe(&self) -> String {
        "single-use".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> NodeRecord {
        NodeRecord::new("n-1", "sim", None, 2, 1000)
    }

    #[test]
    fn always_keeps_idle_nodes() {
        assert_eq!(Always.check(&record(), 1_000_000), RetentionDecision::Keep);
    }

    #[test]
    fn idle_timeout_removes_after_threshold() {
        let policy = IdleTimeout::new(Duration::from_secs(60));
        let node = record();

        assert_eq!(policy.check(&node, 1059), RetentionDecision::Keep);
        assert!(matches!(
            policy.check(&node, 1060),
            RetentionDecision::Remove { .. }
        ));
    }

    #[test]
    fn idle_timeout_keeps_busy_node() {
        let policy = IdleTimeout::new(Duration::from_secs(60));
        let mut node = record();
        node.apply_activity(1, 0, 1010);

        assert_eq!(policy.check(&node, 5000), RetentionDecision::Keep);
    }

    #[test]
    fn idle_timeout_keeps_node_with_queued_tasks() {
        let policy = IdleTimeout::new(Duration::from_secs(60));
        let mut node = record();
        node.apply_activity(0, 3, 1010);

        assert_eq!(policy.check(&node, 5000), RetentionDecision::Keep);
    }

    #[test]
    fn idle_clock_restarts_after_work() {
        let policy = IdleTimeout::new(Duration::from_secs(60));
        let mut node = record();
        node.apply_activity(2, 0, 1050);
        node.apply_activity(0, 0, 1100);

        assert_eq!(policy.check(&node, 1150), RetentionDecision::Keep);
        assert!(matches!(
            policy.check(&node, 1160),
            RetentionDecision::Remove { .. }
        ));
    }

    #[test]
    fn single_use_waits_for_work() {
        let mut node = record();
        assert_eq!(SingleUse.check(&node, 9999), RetentionDecision::Keep);

        node.apply_activity(1, 0, 1010);
        assert_eq!(SingleUse.check(&node, 9999), RetentionDecision::Keep);

        node.apply_activity(0, 0, 1020);
        assert_eq!(
            SingleUse.check(&node, 1020),
            RetentionDecision::remove("single-use node finished its work")
        );
    }

    #[test]
    fn describe_names_policy() {
        assert_eq!(IdleTimeout::new(Duration::from_secs(600)).describe(), "idle-timeout(600s)");
        assert_eq!(SingleUse.describe(), "single-use");
    }
}
