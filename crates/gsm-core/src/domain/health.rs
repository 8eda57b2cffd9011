//! Per-port health bookkeeping for the liveness prober.
//!
//! A [`HealthRecord`] is updated once per probe and reports the transitions
//! the orchestrator cares about:
//!
//! - **Unhealthy** fires once, when consecutive failures first reach the
//!   threshold.
//! - **Recovered** fires once, on the first success after being unhealthy.
//! - **RestartRecommended** fires when failures reach twice the threshold.
//!   How often it repeats after that is set by [`RestartPolicy`].

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Consecutive failures after which a port counts as unhealthy.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Number of response-time samples kept for averaging.
pub const RESPONSE_HISTORY_LEN: usize = 10;

/// Repeat behaviour of the restart recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Fire once when failures reach `2 × threshold`; re-arm after a success.
    #[default]
    OncePerEpisode,
    /// Fire on every failure at or beyond `2 × threshold`.
    EveryFailureBeyondThreshold,
}

/// Thresholds applied to every record of one prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    pub restart_policy: RestartPolicy,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            restart_policy: RestartPolicy::default(),
        }
    }
}

impl HealthPolicy {
    /// Failure count at which a restart is recommended.
    pub fn restart_threshold(&self) -> u32 {
        self.failure_threshold.saturating_mul(2)
    }
}

/// A health change worth telling the orchestrator about.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthTransition {
    Unhealthy {
        consecutive_failures: u32,
        last_error: String,
    },
    Recovered {
        response_time_ms: u64,
    },
    RestartRecommended {
        consecutive_failures: u32,
        reason: String,
    },
}

/// Point-in-time copy of a record, safe to hand out of the lock.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerHealth {
    pub port: u16,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_success: Option<SystemTime>,
    pub last_response_time_ms: Option<u64>,
    pub average_response_time_ms: Option<f64>,
    pub last_error: Option<String>,
}

/// Rolling health state of one monitored port.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    port: u16,
    consecutive_failures: u32,
    last_success: Option<SystemTime>,
    last_response_time_ms: Option<u64>,
    history: VecDeque<u64>,
    last_error: Option<String>,
    restart_recommended: bool,
}

impl HealthRecord {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            consecutive_failures: 0,
            last_success: None,
            last_response_time_ms: None,
            history: VecDeque::with_capacity(RESPONSE_HISTORY_LEN),
            last_error: None,
            restart_recommended: false,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_healthy(&self, policy: &HealthPolicy) -> bool {
        self.consecutive_failures < policy.failure_threshold
    }

    /// Mean of the retained response-time samples.
    pub fn average_response_time_ms(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        let sum: u64 = self.history.iter().sum();
        Some(sum as f64 / self.history.len() as f64)
    }

    /// Applies a successful probe.
    pub fn record_success(
        &mut self,
        policy: &HealthPolicy,
        response_time: Duration,
        at: SystemTime,
    ) -> Option<HealthTransition> {
        let was_healthy = self.is_healthy(policy);
        let response_time_ms = u64::try_from(response_time.as_millis()).unwrap_or(u64::MAX);

        self.consecutive_failures = 0;
        self.restart_recommended = false;
        self.last_error = None;
        self.last_success = Some(at);
        self.last_response_time_ms = Some(response_time_ms);
        if self.history.len() == RESPONSE_HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(response_time_ms);

        if was_healthy {
            None
        } else {
            debug!("port {} recovered after {response_time_ms} ms", self.port);
            Some(HealthTransition::Recovered { response_time_ms })
        }
    }

    /// Applies a failed probe and returns every transition it caused, in the
    /// order they should be reported.
    pub fn record_failure(&mut self, policy: &HealthPolicy, error: &str) -> Vec<HealthTransition> {
        let was_healthy = self.is_healthy(policy);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.to_string());

        let mut transitions = Vec::new();
        if was_healthy && !self.is_healthy(policy) {
            debug!(
                "port {} crossed the failure threshold ({})",
                self.port, self.consecutive_failures
            );
            transitions.push(HealthTransition::Unhealthy {
                consecutive_failures: self.consecutive_failures,
                last_error: error.to_string(),
            });
        }

        if self.consecutive_failures >= policy.restart_threshold() {
            let fire = match policy.restart_policy {
                RestartPolicy::OncePerEpisode => !self.restart_recommended,
                RestartPolicy::EveryFailureBeyondThreshold => true,
            };
            if fire {
                self.restart_recommended = true;
                transitions.push(HealthTransition::RestartRecommended {
                    consecutive_failures: self.consecutive_failures,
                    reason: format!(
                        "{} consecutive liveness failures, last error: {error}",
                        self.consecutive_failures
                    ),
                });
            }
        }
        transitions
    }

    pub fn snapshot(&self, policy: &HealthPolicy) -> ServerHealth {
        ServerHealth {
            port: self.port,
            is_healthy: self.is_healthy(policy),
            consecutive_failures: self.consecutive_failures,
            last_success: self.last_success,
            last_response_time_ms: self.last_response_time_ms,
            average_response_time_ms: self.average_response_time_ms(),
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail_n(record: &mut HealthRecord, policy: &HealthPolicy, n: u32) -> Vec<HealthTransition> {
        (0..n)
            .flat_map(|_| record.record_failure(policy, "timeout"))
            .collect()
    }

    #[test]
    fn test_new_record_is_healthy() {
        let record = HealthRecord::new(11234);
        assert!(record.is_healthy(&HealthPolicy::default()));
        assert_eq!(record.average_response_time_ms(), None);
    }

    #[test]
    fn test_unhealthy_fires_exactly_once_at_threshold() {
        // Arrange
        let policy = HealthPolicy::default();
        let mut record = HealthRecord::new(1);

        // Act
        let before = fail_n(&mut record, &policy, 2);
        let at_threshold = record.record_failure(&policy, "timeout");
        let after = record.record_failure(&policy, "timeout");

        // Assert
        assert!(before.is_empty());
        assert_eq!(
            at_threshold,
            vec![HealthTransition::Unhealthy {
                consecutive_failures: 3,
                last_error: "timeout".to_string()
            }]
        );
        assert!(after.is_empty());
        assert!(!record.is_healthy(&policy));
    }

    #[test]
    fn test_success_after_unhealthy_resets_and_recovers_once() {
        // Arrange
        let policy = HealthPolicy::default();
        let mut record = HealthRecord::new(1);
        fail_n(&mut record, &policy, 3);

        // Act
        let first = record.record_success(&policy, Duration::from_millis(12), SystemTime::now());
        let second = record.record_success(&policy, Duration::from_millis(8), SystemTime::now());

        // Assert
        assert_eq!(first, Some(HealthTransition::Recovered { response_time_ms: 12 }));
        assert_eq!(second, None);
        assert_eq!(record.consecutive_failures(), 0);
    }

    #[test]
    fn test_success_while_healthy_resets_counter_without_event() {
        let policy = HealthPolicy::default();
        let mut record = HealthRecord::new(1);
        fail_n(&mut record, &policy, 2);

        let transition = record.record_success(&policy, Duration::from_millis(3), SystemTime::now());

        assert_eq!(transition, None);
        assert_eq!(record.consecutive_failures(), 0);
    }

    #[test]
    fn test_restart_recommended_once_per_episode_by_default() {
        // Arrange
        let policy = HealthPolicy::default();
        let mut record = HealthRecord::new(1);

        // Act: 10 failures, threshold 3, restart at 6
        let transitions = fail_n(&mut record, &policy, 10);

        // Assert
        let restarts: Vec<_> = transitions
            .iter()
            .filter(|t| matches!(t, HealthTransition::RestartRecommended { .. }))
            .collect();
        assert_eq!(restarts.len(), 1);
        assert!(matches!(
            restarts[0],
            HealthTransition::RestartRecommended {
                consecutive_failures: 6,
                ..
            }
        ));
    }

    #[test]
    fn test_restart_recommendation_rearms_after_success() {
        let policy = HealthPolicy::default();
        let mut record = HealthRecord::new(1);
        fail_n(&mut record, &policy, 6);
        record.record_success(&policy, Duration::from_millis(1), SystemTime::now());

        let second_episode = fail_n(&mut record, &policy, 6);

        assert!(second_episode
            .iter()
            .any(|t| matches!(t, HealthTransition::RestartRecommended { .. })));
    }

    #[test]
    fn test_every_failure_policy_repeats_recommendation() {
        let policy = HealthPolicy {
            failure_threshold: 3,
            restart_policy: RestartPolicy::EveryFailureBeyondThreshold,
        };
        let mut record = HealthRecord::new(1);

        let transitions = fail_n(&mut record, &policy, 8);

        let restarts = transitions
            .iter()
            .filter(|t| matches!(t, HealthTransition::RestartRecommended { .. }))
            .count();
        assert_eq!(restarts, 3, "failures 6, 7 and 8 each recommend a restart");
    }

    #[test]
    fn test_threshold_of_one_reports_unhealthy_on_first_failure() {
        let policy = HealthPolicy {
            failure_threshold: 1,
            ..Default::default()
        };
        let mut record = HealthRecord::new(1);

        let first = record.record_failure(&policy, "refused");
        let second = record.record_failure(&policy, "refused");

        assert!(matches!(first.as_slice(), [HealthTransition::Unhealthy { .. }]));
        assert!(matches!(
            second.as_slice(),
            [HealthTransition::RestartRecommended { .. }]
        ));
    }

    #[test]
    fn test_history_keeps_last_ten_samples() {
        // Arrange
        let policy = HealthPolicy::default();
        let mut record = HealthRecord::new(1);

        // Act: samples 1..=15 ms; only 6..=15 are retained
        for ms in 1..=15 {
            record.record_success(&policy, Duration::from_millis(ms), SystemTime::now());
        }

        // Assert
        assert_eq!(record.average_response_time_ms(), Some(10.5));
    }

    #[test]
    fn test_snapshot_reflects_failure_state() {
        let policy = HealthPolicy::default();
        let mut record = HealthRecord::new(7777);
        record.record_success(&policy, Duration::from_millis(4), SystemTime::now());
        fail_n(&mut record, &policy, 3);

        let snap = record.snapshot(&policy);

        assert_eq!(snap.port, 7777);
        assert!(!snap.is_healthy);
        assert_eq!(snap.consecutive_failures, 3);
        assert_eq!(snap.last_response_time_ms, Some(4));
        assert_eq!(snap.average_response_time_ms, Some(4.0));
        assert_eq!(snap.last_error.as_deref(), Some("timeout"));
        assert!(snap.last_success.is_some());
    }

    #[test]
    fn test_restart_policy_uses_kebab_case_names() {
        use serde::de::{value::Error, IntoDeserializer};

        let parse = |name: &str| {
            RestartPolicy::deserialize(IntoDeserializer::<Error>::into_deserializer(name))
        };

        assert_eq!(parse("once-per-episode").unwrap(), RestartPolicy::OncePerEpisode);
        assert_eq!(
            parse("every-failure-beyond-threshold").unwrap(),
            RestartPolicy::EveryFailureBeyondThreshold
        );
        assert!(parse("OncePerEpisode").is_err());
    }
}
