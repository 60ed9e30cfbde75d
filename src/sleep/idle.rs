//! Idle bookkeeping for instances with sleep enabled.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::config::SleepConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    /// The wake listener holds the instance port.
    Idle,
    #[default]
    Disabled,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SleepRuntime {
    pub last_activity_at: Option<DateTime<Utc>>,
    pub idle_since: Option<DateTime<Utc>>,
    pub proxy_status: ProxyStatus,
    pub start_in_progress: bool,
    pub stop_in_progress: bool,
    /// Error of the last failed wake, kept until the next wake attempt.
    pub last_wake_error: Option<String>,
    pub grace_until: Option<DateTime<Utc>>,
    /// Last player count the status probe reported.
    pub players_online: Option<u32>,
}

impl SleepRuntime {
    /// Record a completed wake and hold off idle checks for `grace_secs`.
    pub(super) fn woke(&mut self, now: DateTime<Utc>, grace_secs: u64) {
        self.last_activity_at = Some(now);
        self.idle_since = None;
        self.grace_until = i64::try_from(grace_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .map(|grace| now + grace);
    }

    /// Forget what was observed about a server run that is over.
    pub(super) fn clear_observations(&mut self) {
        self.idle_since = None;
        self.players_online = None;
    }
}

/// Feed one player-count observation and report whether an idle stop is due.
///
/// `players` is `None` when the probe failed; the last known count then stays
/// in effect. An unknown count never starts the idle timer. A due stop marks
/// `stop_in_progress` so later observations do not fire again.
pub fn observe(
    rt: &mut SleepRuntime,
    config: &SleepConfig,
    players: Option<u32>,
    now: DateTime<Utc>,
) -> bool {
    if players.is_some() {
        rt.players_online = players;
    }
    let in_grace = rt.grace_until.is_some_and(|until| now < until);

    match rt.players_online {
        Some(0) => {
            if rt.idle_since.is_none() && !in_grace {
                rt.idle_since = Some(now);
            }
        }
        Some(_) => {
            rt.last_activity_at = Some(now);
            rt.idle_since = None;
        }
        None => {}
    }

    if !config.enabled || in_grace || rt.start_in_progress || rt.stop_in_progress {
        return false;
    }
    let limit = i64::try_from(config.idle_minutes)
        .ok()
        .and_then(TimeDelta::try_minutes);
    let (Some(idle_since), Some(limit)) = (rt.idle_since, limit) else {
        return false;
    };
    if now - idle_since < limit {
        return false;
    }
    rt.stop_in_progress = true;
    true
}
