use crate::state::CheckResult;
use serde::Serialize;

/// Fills in `offline_since` and `blackscreen_since` from the previous record
/// of the same system. A failing condition with no earlier failing record
/// starts at the new record's timestamp.
pub fn track(mut current: CheckResult, previous: Option<&CheckResult>) -> CheckResult {
    current.offline_since = failing_since(
        !current.online(),
        current.timestamp,
        previous.and_then(|p| p.offline_since),
    );
    current.blackscreen_since = failing_since(
        current.application_off(),
        current.timestamp,
        previous.and_then(|p| p.blackscreen_since),
    );
    current
}

fn failing_since(failing: bool, now: i64, carried: Option<i64>) -> Option<i64> {
    if !failing {
        return None;
    }
    Some(carried.unwrap_or(now))
}

/// Change of the `online` predicate between two consecutive records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateChange {
    Recovered,
    Failed,
    Unchanged,
}

impl StateChange {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recovered => "recovered",
            Self::Failed => "failed",
            Self::Unchanged => "unchanged",
        }
    }
}

/// A first record counts as a change in whichever direction it points.
pub fn state_change(current: &CheckResult, previous: Option<&CheckResult>) -> StateChange {
    let now_online = current.online();
    match previous.map(CheckResult::online) {
        Some(was_online) if was_online == now_online => StateChange::Unchanged,
        _ if now_online => StateChange::Recovered,
        _ => StateChange::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{sample_result, ApplicationState, Trinary};

    fn offline(system: u32, timestamp: i64) -> CheckResult {
        CheckResult {
            icmp_request: false,
            ..sample_result(system, timestamp)
        }
    }

    fn blackscreen(system: u32, timestamp: i64) -> CheckResult {
        CheckResult {
            application_state: ApplicationState::NotRunning,
            ..sample_result(system, timestamp)
        }
    }

    #[test]
    fn online_without_history_has_no_offline_since() {
        let tracked = track(sample_result(1, 100), None);
        assert_eq!(tracked.offline_since, None);
        assert_eq!(tracked.blackscreen_since, None);
    }

    #[test]
    fn first_failure_starts_now() {
        let tracked = track(offline(1, 100), None);
        assert_eq!(tracked.offline_since, Some(100));

        let previous = track(sample_result(1, 100), None);
        let tracked = track(offline(1, 200), Some(&previous));
        assert_eq!(tracked.offline_since, Some(200));
    }

    #[test]
    fn failure_carries_forward_over_many_cycles() {
        let mut previous = track(sample_result(1, 0), None);
        let first_failure = 3600;
        for n in 1..=12 {
            let ts = n * 3600;
            let tracked = track(offline(1, ts), Some(&previous));
            assert_eq!(tracked.offline_since, Some(first_failure), "cycle {n}");
            previous = tracked;
        }

        let recovered = track(sample_result(1, 13 * 3600), Some(&previous));
        assert_eq!(recovered.offline_since, None);
    }

    #[test]
    fn failed_login_makes_system_offline() {
        let result = CheckResult {
            ssh_login: Trinary::Failed,
            ..sample_result(1, 50)
        };
        assert_eq!(track(result, None).offline_since, Some(50));
    }

    #[test]
    fn blackscreen_is_tracked_independently() {
        let first = track(blackscreen(2, 10), None);
        assert_eq!(first.blackscreen_since, Some(10));
        assert_eq!(first.offline_since, None);

        let second = track(
            CheckResult {
                icmp_request: false,
                ..blackscreen(2, 20)
            },
            Some(&first),
        );
        assert_eq!(second.blackscreen_since, Some(10));
        assert_eq!(second.offline_since, Some(20));

        let third = track(offline(2, 30), Some(&second));
        assert_eq!(third.blackscreen_since, None);
        assert_eq!(third.offline_since, Some(20));
    }

    #[test]
    fn state_changes_follow_online_predicate() {
        let up = sample_result(1, 1);
        let down = offline(1, 2);

        assert_eq!(state_change(&up, None), StateChange::Recovered);
        assert_eq!(state_change(&down, None), StateChange::Failed);
        assert_eq!(state_change(&down, Some(&up)), StateChange::Failed);
        assert_eq!(state_change(&up, Some(&down)), StateChange::Recovered);
        assert_eq!(state_change(&up, Some(&up)), StateChange::Unchanged);
        assert_eq!(state_change(&down, Some(&down)), StateChange::Unchanged);
    }
}
