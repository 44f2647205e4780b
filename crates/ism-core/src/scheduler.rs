//! Job scheduler
//!
//! Decides which managed indices are due for a tick. Next-run times live
//! only in memory and are rebuilt from the persisted configs on every
//! sweep, so losing them costs at most one early tick per index.

use chrono::{DateTime, Utc};
use ism_config::{JobSchedule, ManagedIndexConfig};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct Job {
    schedule: JobSchedule,
    next_run: DateTime<Utc>,
    in_flight: bool,
}

pub struct JobScheduler {
    jobs: HashMap<String, Job>,
    rng: StdRng,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic jitter, for tests
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            jobs: HashMap::new(),
            rng,
        }
    }

    /// Reconcile with the persisted configs and return the indices due at
    /// `now`. Returned indices are marked in flight until [`finished`] is
    /// called for them.
    ///
    /// [`finished`]: JobScheduler::finished
    pub fn sweep<'a>(
        &mut self,
        configs: impl IntoIterator<Item = &'a ManagedIndexConfig>,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let mut seen = HashMap::new();
        for config in configs.into_iter().filter(|c| c.enabled) {
            seen.insert(config.index.clone(), config.schedule.clone());
        }

        self.jobs.retain(|index, job| {
            let keep = seen.contains_key(index) || job.in_flight;
            if !keep {
                debug!(index = %index, "Job no longer scheduled");
            }
            keep
        });

        for (index, schedule) in seen {
            match self.jobs.get_mut(&index) {
                Some(job) if job.schedule == schedule => {}
                Some(job) => {
                    job.next_run = schedule.next_run_after(None, now, &mut self.rng);
                    job.schedule = schedule;
                }
                None => {
                    let next_run = schedule.next_run_after(None, now, &mut self.rng);
                    self.jobs.insert(
                        index,
                        Job {
                            schedule,
                            next_run,
                            in_flight: false,
                        },
                    );
                }
            }
        }

        let mut due: Vec<String> = self
            .jobs
            .iter_mut()
            .filter(|(_, job)| !job.in_flight && job.next_run <= now)
            .map(|(index, job)| {
                job.in_flight = true;
                index.clone()
            })
            .collect();
        due.sort();
        due
    }

    /// Record that the tick for `index` finished at `now`
    pub fn finished(&mut self, index: &str, now: DateTime<Utc>) {
        if let Some(job) = self.jobs.get_mut(index) {
            job.in_flight = false;
            job.next_run = job.schedule.next_run_after(Some(now), now, &mut self.rng);
        }
    }

    /// Run `index` on the next sweep regardless of its schedule
    pub fn trigger(&mut self, index: &str, now: DateTime<Utc>) {
        if let Some(job) = self.jobs.get_mut(index) {
            job.next_run = now;
        }
    }

    pub fn next_run(&self, index: &str) -> Option<DateTime<Utc>> {
        self.jobs.get(index).map(|j| j.next_run)
    }

    pub fn in_flight(&self) -> usize {
        self.jobs.values().filter(|j| j.in_flight).count()
    }
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}
