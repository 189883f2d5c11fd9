//! Dispatch policy for the master.
//!
//! The [`Balancer`] keeps three ordered lists of rules:
//!
//! - **Ratings** score a job; the enabled scores are summed into
//!   [`Job::rating`](crate::scheduler::Job).
//! - **Exclusions** are hard filters: any enabled exclusion matching a job
//!   keeps it out of dispatch.
//! - **Priorities** flag jobs that deserve attention right now. They are
//!   advisory and only used to rank jobs for display.
//!
//! None of the rules mutate jobs. Rules are evaluated in registration order.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BalancerConfig;
use crate::error::{NetrenderError, Result};
use crate::scheduler::frame::FrameStatus;
use crate::scheduler::job::{Job, JobStatus};

/// Farm-wide counts consulted by exclusion rules.
pub trait FarmView {
    fn count_jobs(&self, status: JobStatus) -> usize;
    fn count_slaves(&self) -> usize;
}

/// Point-in-time counts of the farm, taken before a dispatch scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct FarmCounts {
    pub waiting: usize,
    pub queued: usize,
    pub finished: usize,
    pub slaves: usize,
}

impl FarmCounts {
    pub fn new<'a>(jobs: impl IntoIterator<Item = &'a Job>, slaves: usize) -> Self {
        let mut counts = Self {
            slaves,
            ..Default::default()
        };
        for job in jobs {
            match job.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Finished => counts.finished += 1,
            }
        }
        counts
    }
}

impl FarmView for FarmCounts {
    fn count_jobs(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Waiting => self.waiting,
            JobStatus::Queued => self.queued,
            JobStatus::Finished => self.finished,
        }
    }

    fn count_slaves(&self) -> usize {
        self.slaves
    }
}

/// Capabilities shared by every rule kind.
pub trait Rule {
    fn description(&self) -> &'static str;

    fn limit(&self) -> Option<f64> {
        None
    }

    /// Returns false when the rule has no tunable limit.
    fn set_limit(&mut self, _limit: f64) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RatingRule {
    /// The credit balance is the score.
    Credit,
    /// Less usage per unit of priority scores higher.
    Usage,
}

impl RatingRule {
    pub fn rate(&self, job: &Job) -> f64 {
        match self {
            RatingRule::Credit => job.credits,
            RatingRule::Usage => -job.usage / f64::from(job.priority),
        }
    }
}

impl Rule for RatingRule {
    fn description(&self) -> &'static str {
        match self {
            RatingRule::Credit => "Rating by credits",
            RatingRule::Usage => "Rating by usage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExclusionRule {
    /// Jobs that are not queued or have no queued frame left.
    QueuedEmptyJob,
    /// With several jobs queued, keep any single job below `limit` of the
    /// slaves. A farm of one slave is never limited.
    SlavesLimit { limit: f64 },
}

impl ExclusionRule {
    pub fn test(&self, job: &Job, farm: &dyn FarmView) -> bool {
        match self {
            ExclusionRule::QueuedEmptyJob => {
                job.status != JobStatus::Queued || job.count_frames(FrameStatus::Queued) == 0
            }
            ExclusionRule::SlavesLimit { limit } => {
                let slaves = farm.count_slaves();
                farm.count_jobs(JobStatus::Queued) > 1
                    && slaves > 1
                    && (job.count_slaves() + 1) as f64 / slaves as f64 > *limit
            }
        }
    }
}

impl Rule for ExclusionRule {
    fn description(&self) -> &'static str {
        match self {
            ExclusionRule::QueuedEmptyJob => "Exclude jobs with nothing queued",
            ExclusionRule::SlavesLimit { .. } => "Exclude jobs above the slave share limit",
        }
    }

    fn limit(&self) -> Option<f64> {
        match self {
            ExclusionRule::QueuedEmptyJob => None,
            ExclusionRule::SlavesLimit { limit } => Some(*limit),
        }
    }

    fn set_limit(&mut self, new_limit: f64) -> bool {
        match self {
            ExclusionRule::QueuedEmptyJob => false,
            ExclusionRule::SlavesLimit { limit } => {
                *limit = new_limit;
                true
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PriorityRule {
    /// Jobs that were never dispatched.
    NewJob,
    /// Jobs whose last dispatch is at least `limit` seconds old.
    MinimumTimeBetweenDispatch { limit: f64 },
}

impl PriorityRule {
    pub fn test(&self, job: &Job, now: DateTime<Utc>) -> bool {
        match self {
            PriorityRule::NewJob => job.last_dispatched.is_none(),
            PriorityRule::MinimumTimeBetweenDispatch { limit } => match job.last_dispatched {
                None => true,
                Some(last) => (now - last).num_milliseconds() as f64 / 1000.0 >= *limit,
            },
        }
    }
}

impl Rule for PriorityRule {
    fn description(&self) -> &'static str {
        match self {
            PriorityRule::NewJob => "Priority to new jobs",
            PriorityRule::MinimumTimeBetweenDispatch { .. } => {
                "Priority to jobs not dispatched recently"
            }
        }
    }

    fn limit(&self) -> Option<f64> {
        match self {
            PriorityRule::NewJob => None,
            PriorityRule::MinimumTimeBetweenDispatch { limit } => Some(*limit),
        }
    }

    fn set_limit(&mut self, new_limit: f64) -> bool {
        match self {
            PriorityRule::NewJob => false,
            PriorityRule::MinimumTimeBetweenDispatch { limit } => {
                *limit = new_limit;
                true
            }
        }
    }
}

/// A registered rule with its id and enabled flag.
#[derive(Debug, Clone)]
pub struct Policy<R> {
    pub id: String,
    pub enabled: bool,
    pub rule: R,
}

impl<R: Rule + Serialize> Policy<R> {
    fn info(&self) -> RuleInfo {
        RuleInfo {
            id: self.id.clone(),
            description: self.rule.description().to_string(),
            enabled: self.enabled,
            limit: self.rule.limit(),
            rule: serde_json::to_value(&self.rule).unwrap_or(serde_json::Value::Null),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleInfo {
    pub id: String,
    pub description: String,
    pub enabled: bool,
    pub limit: Option<f64>,
    pub rule: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerInfo {
    pub ratings: Vec<RuleInfo>,
    pub exclusions: Vec<RuleInfo>,
    pub priorities: Vec<RuleInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct Balancer {
    ratings: Vec<Policy<RatingRule>>,
    exclusions: Vec<Policy<ExclusionRule>>,
    priorities: Vec<Policy<PriorityRule>>,
}

impl Balancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock rule set of the master.
    pub fn from_config(config: &BalancerConfig) -> Self {
        let mut balancer = Self::new();
        balancer.add_rating(if config.rate_by_usage {
            RatingRule::Usage
        } else {
            RatingRule::Credit
        });
        balancer.add_priority(PriorityRule::NewJob);
        balancer.add_priority(PriorityRule::MinimumTimeBetweenDispatch {
            limit: config.min_dispatch_interval.as_secs_f64(),
        });
        balancer.add_exclusion(ExclusionRule::QueuedEmptyJob);
        balancer.add_exclusion(ExclusionRule::SlavesLimit {
            limit: config.slaves_limit,
        });
        balancer
    }

    pub fn add_rating(&mut self, rule: RatingRule) -> String {
        let id = format!("rating-{}", self.ratings.len());
        self.ratings.push(Policy {
            id: id.clone(),
            enabled: true,
            rule,
        });
        id
    }

    pub fn add_exclusion(&mut self, rule: ExclusionRule) -> String {
        let id = format!("exclusion-{}", self.exclusions.len());
        self.exclusions.push(Policy {
            id: id.clone(),
            enabled: true,
            rule,
        });
        id
    }

    pub fn add_priority(&mut self, rule: PriorityRule) -> String {
        let id = format!("priority-{}", self.priorities.len());
        self.priorities.push(Policy {
            id: id.clone(),
            enabled: true,
            rule,
        });
        id
    }

    /// Sum of the enabled rating scores.
    pub fn apply_ratings(&self, job: &Job) -> f64 {
        self.ratings
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.rule.rate(job))
            .sum()
    }

    /// True if any enabled exclusion rule keeps the job out of dispatch.
    pub fn apply_exceptions(&self, job: &Job, farm: &dyn FarmView) -> bool {
        self.exclusions
            .iter()
            .any(|p| p.enabled && p.rule.test(job, farm))
    }

    /// True if any enabled priority rule flags the job.
    pub fn apply_priorities(&self, job: &Job, now: DateTime<Utc>) -> bool {
        self.priorities
            .iter()
            .any(|p| p.enabled && p.rule.test(job, now))
    }

    /// Recompute every job's rating. Credits must already be accrued.
    pub fn balance(&self, jobs: &mut [Job]) {
        for job in jobs.iter_mut() {
            job.rating = self.apply_ratings(job);
        }
    }

    /// Jobs ordered for display: excluded last, prioritised first, then by
    /// descending rating. Ties keep insertion order.
    pub fn ranked<'a>(
        &self,
        jobs: &'a [Job],
        farm: &dyn FarmView,
        now: DateTime<Utc>,
    ) -> Vec<&'a Job> {
        let mut keyed: Vec<(bool, bool, f64, &Job)> = jobs
            .iter()
            .map(|job| {
                (
                    self.apply_exceptions(job, farm),
                    !self.apply_priorities(job, now),
                    job.rating,
                    job,
                )
            })
            .collect();
        keyed.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then(b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal))
        });
        keyed.into_iter().map(|(_, _, _, job)| job).collect()
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<()> {
        if let Some(p) = self.ratings.iter_mut().find(|p| p.id == id) {
            p.enabled = enabled;
        } else if let Some(p) = self.exclusions.iter_mut().find(|p| p.id == id) {
            p.enabled = enabled;
        } else if let Some(p) = self.priorities.iter_mut().find(|p| p.id == id) {
            p.enabled = enabled;
        } else {
            return Err(NetrenderError::RuleNotFound(id.to_string()));
        }
        tracing::info!(rule_id = id, enabled, "Balancer rule toggled");
        Ok(())
    }

    pub fn set_limit(&mut self, id: &str, limit: f64) -> Result<()> {
        let updated = if let Some(p) = self.ratings.iter_mut().find(|p| p.id == id) {
            p.rule.set_limit(limit)
        } else if let Some(p) = self.exclusions.iter_mut().find(|p| p.id == id) {
            p.rule.set_limit(limit)
        } else if let Some(p) = self.priorities.iter_mut().find(|p| p.id == id) {
            p.rule.set_limit(limit)
        } else {
            return Err(NetrenderError::RuleNotFound(id.to_string()));
        };

        if !updated {
            return Err(NetrenderError::InvalidHeader {
                name: "rule-limit",
                value: format!("rule {} has no limit", id),
            });
        }
        tracing::info!(rule_id = id, limit, "Balancer rule limit changed");
        Ok(())
    }

    pub fn serialize(&self) -> BalancerInfo {
        BalancerInfo {
            ratings: self.ratings.iter().map(Policy::info).collect(),
            exclusions: self.exclusions.iter().map(Policy::info).collect(),
            priorities: self.priorities.iter().map(Policy::info).collect(),
        }
    }
}
