//! Timed and on-demand triggers.
//!
//! Both entry points go through [`Trigger::run`], which selects rules and
//! hands them to the orchestrator one at a time.

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::AuthorizationRuleSpec;
use crate::error::ApiError;
use crate::rotation::{Orchestrator, RotationRun, TriggerSource};

/// How late the timer may fire before it is worth a warning.
const LATE_THRESHOLD_SECONDS: i64 = 60;

/// A fixed time of day, in UTC. Defaults to midnight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DailySchedule {
    at: NaiveTime,
}

impl DailySchedule {
    pub fn new(at: NaiveTime) -> Self {
        Self { at }
    }

    /// First scheduled instant strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = Utc.from_utc_datetime(&now.date_naive().and_time(self.at));
        if today > now {
            today
        } else {
            today + chrono::Duration::days(1)
        }
    }
}

impl FromStr for DailySchedule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        NaiveTime::parse_from_str(s, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
            .map(Self::new)
            .map_err(|_| format!("'{}' is not a time of day (expected HH:MM or HH:MM:SS)", s))
    }
}

impl fmt::Display for DailySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} UTC", self.at.format("%H:%M:%S"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    /// No rules were selected.
    Empty,
    AllSucceeded,
    Partial,
    AllFailed,
}

/// Result of one trigger firing.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub trigger: TriggerSource,
    pub outcome: BatchOutcome,
    pub succeeded: usize,
    pub failed: usize,
    pub runs: Vec<RotationRun>,
}

impl BatchReport {
    pub fn new(trigger: TriggerSource, runs: Vec<RotationRun>) -> Self {
        let succeeded = runs.iter().filter(|r| r.succeeded()).count();
        let failed = runs.len() - succeeded;
        let outcome = match (succeeded, failed) {
            (0, 0) => BatchOutcome::Empty,
            (_, 0) => BatchOutcome::AllSucceeded,
            (0, _) => BatchOutcome::AllFailed,
            _ => BatchOutcome::Partial,
        };
        Self {
            trigger,
            outcome,
            succeeded,
            failed,
            runs,
        }
    }
}

/// Entry point shared by the daily timer and the HTTP surface.
pub struct Trigger {
    orchestrator: Arc<Orchestrator>,
    rules: Vec<AuthorizationRuleSpec>,
    rotation_enabled: bool,
}

impl Trigger {
    pub fn new(orchestrator: Arc<Orchestrator>, rules: Vec<AuthorizationRuleSpec>, rotation_enabled: bool) -> Self {
        Self {
            orchestrator,
            rules,
            rotation_enabled,
        }
    }

    pub fn rules(&self) -> &[AuthorizationRuleSpec] {
        &self.rules
    }

    pub fn rotation_enabled(&self) -> bool {
        self.rotation_enabled
    }

    /// Resolve the rules a firing applies to.
    ///
    /// Without a filter every enabled rule is selected. A named rule must be
    /// configured and enabled.
    pub fn select(&self, rule_name: Option<&str>) -> Result<Vec<&AuthorizationRuleSpec>, ApiError> {
        match rule_name {
            None => Ok(self.rules.iter().filter(|r| r.enabled).collect()),
            Some(name) => {
                let rule = self
                    .rules
                    .iter()
                    .find(|r| r.rule_name == name)
                    .ok_or_else(|| ApiError::UnknownRule(name.to_string()))?;
                if !rule.enabled {
                    return Err(ApiError::RuleDisabled(name.to_string()));
                }
                Ok(vec![rule])
            }
        }
    }

    /// Rotate the selected rules sequentially.
    pub async fn run(&self, source: TriggerSource, rule_name: Option<&str>) -> Result<BatchReport, ApiError> {
        if !self.rotation_enabled {
            return Err(ApiError::RotationDisabled);
        }
        let selected = self.select(rule_name)?;
        info!(?source, rules = selected.len(), "Rotation triggered");

        let mut runs = Vec::with_capacity(selected.len());
        for rule in selected {
            runs.push(self.orchestrator.rotate(rule, source).await);
        }
        Ok(BatchReport::new(source, runs))
    }
}

/// Fire `trigger` once a day until `shutdown` flips.
///
/// Shutdown is only observed between firings, so a batch that has started
/// always runs to completion.
pub async fn run_daily(
    trigger: Arc<Trigger>,
    schedule: DailySchedule,
    run_on_startup: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    if run_on_startup {
        info!("Running rotation on startup");
        fire(&trigger).await;
    }

    loop {
        if *shutdown.borrow() {
            break;
        }
        let now = Utc::now();
        let next = schedule.next_after(now);
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        info!(next_run = %next, %schedule, "Next scheduled rotation");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }

        let late_by = Utc::now() - next;
        if late_by > chrono::Duration::seconds(LATE_THRESHOLD_SECONDS) {
            warn!(
                scheduled_for = %next,
                late_by_seconds = late_by.num_seconds(),
                "Timer fired late"
            );
        }
        fire(&trigger).await;
    }

    info!("Scheduler stopped");
}

async fn fire(trigger: &Trigger) {
    match trigger.run(TriggerSource::Timer, None).await {
        Ok(report) => {
            let summary = format!("{} succeeded, {} failed", report.succeeded, report.failed);
            match report.outcome {
                BatchOutcome::AllSucceeded | BatchOutcome::Empty => {
                    info!("Scheduled rotation finished: {}", summary)
                }
                BatchOutcome::Partial | BatchOutcome::AllFailed => {
                    error!("Scheduled rotation finished with failures: {}", summary)
                }
            }
        }
        Err(ApiError::RotationDisabled) => warn!("Secret rotation is disabled, skipping scheduled run"),
        Err(e) => error!("Scheduled rotation could not start: {}", e),
    }
}
