//! Incumbent racing with aggressive capping.
//!
//! A challenger is evaluated on the pairs the incumbent has already run,
//! doubling its run count each time it is not worse. It replaces the
//! incumbent once it has as many runs and is strictly better. When the
//! statistic permits, challengers that are hopelessly behind on their shared
//! runs are cancelled early ("capped").

use aac_types::{ConfigId, JobId};
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CappingReport, RacingStrategy};
use crate::context::TuningContext;
use crate::errors::TunerResult;
use crate::events::TunerEvent;

const INIT_POLL: Duration = Duration::from_secs(1);

/// Slack a challenger gets before it is capped. Shrinks towards 1 as the
/// challenger's finished runs approach the incumbent's.
pub fn capping_factor(max_factor: f64, finished: usize, incumbent_finished: usize) -> f64 {
    if incumbent_finished == 0 {
        return max_factor.max(1.0);
    }
    let progress = finished as f64 / incumbent_finished as f64;
    max_factor.powf(1.0 - progress).max(1.0)
}

#[derive(Debug)]
pub struct CappedRacing {
    name: &'static str,
    capping: bool,
    best: Option<ConfigId>,
    next_incumbent_number: u32,
    stopped: HashSet<ConfigId>,
}

impl Default for CappedRacing {
    fn default() -> Self {
        Self::new()
    }
}

impl CappedRacing {
    pub fn new() -> Self {
        Self {
            name: "capped",
            capping: true,
            best: None,
            next_incumbent_number: 0,
            stopped: HashSet::new(),
        }
    }

    /// Plain incumbent racing, never capping.
    pub fn without_capping() -> Self {
        Self {
            name: "roar",
            capping: false,
            ..Self::new()
        }
    }

    fn best(&self) -> TunerResult<ConfigId> {
        self.best
            .ok_or_else(|| internal_error!("racing has no incumbent"))
    }

    /// Challengers in the pending set that are far enough behind the
    /// incumbent on their shared runs to be cancelled.
    fn capping_candidates(&self, ctx: &TuningContext, best: ConfigId) -> TunerResult<Vec<ConfigId>> {
        let incumbent = ctx.candidate(best)?;
        let function = ctx.statistic.function;
        let max_factor = ctx.config.racing.max_capping_factor;
        let mut capped = Vec::new();
        for &id in ctx.pending.iter().filter(|&&id| id != best) {
            let challenger = ctx.candidate(id)?;
            let finished = challenger.counts().finished;
            if finished < ctx.config.min_runs {
                continue;
            }
            let factor = capping_factor(max_factor, finished, incumbent.counts().finished);
            let (mine, theirs) = challenger.shared_runs(incumbent);
            let challenger_cost = function.cost(mine);
            let incumbent_cost = function.cost(theirs);
            if challenger_cost > factor * incumbent_cost {
                debug!(
                    candidate = %id,
                    challenger_cost,
                    incumbent_cost,
                    factor,
                    "Challenger exceeds capping bound"
                );
                capped.push(id);
            }
        }
        Ok(capped)
    }

    async fn aggressive_capping(&mut self, ctx: &mut TuningContext) -> TunerResult<CappingReport> {
        let best = self.best()?;
        let mut report = CappingReport::default();
        for id in self.capping_candidates(ctx, best)? {
            let unfinished: Vec<JobId> = ctx
                .candidate(id)?
                .jobs()
                .iter()
                .filter(|j| !j.is_finished())
                .map(|j| j.id)
                .collect();

            let mut failed_kills = 0;
            for job in unfinished {
                let killed = ctx.backend.kill_job(job).await;
                match killed {
                    Ok(()) => ctx.candidate_mut(id)?.reset_job(job),
                    Err(e) => {
                        failed_kills += 1;
                        warn!(candidate = %id, job = %job, error = %e, "Failed to kill job");
                    }
                }
            }
            if let Err(e) = ctx.backend.remove_config(id).await {
                report.failed_removals += 1;
                warn!(candidate = %id, error = %e, "Failed to remove capped configuration");
            }

            ctx.pending.remove(&id);
            self.stopped.remove(&id);
            ctx.candidate_mut(id)?.finished = true;
            report.failed_kills += failed_kills;
            report.capped.push(id);
            ctx.emit(TunerEvent::CandidateCapped {
                config_id: id,
                failed_kills,
            });
            info!(candidate = %id, failed_kills, "Capped candidate");
        }
        Ok(report)
    }

    async fn promote(&mut self, ctx: &mut TuningContext, id: ConfigId) -> TunerResult<()> {
        let previous = self.best()?;
        let number = self.next_incumbent_number;
        self.next_incumbent_number += 1;
        self.best = Some(id);
        ctx.candidate_mut(id)?.incumbent_number = Some(number);
        ctx.rename_candidate(previous, false).await?;
        info!(
            previous = %previous,
            current = %id,
            incumbent_number = number,
            "New incumbent"
        );
        ctx.emit(TunerEvent::IncumbentChanged {
            previous,
            current: id,
            incumbent_number: number,
        });
        Ok(())
    }

    async fn reach_parity(
        &mut self,
        ctx: &mut TuningContext,
        id: ConfigId,
        comparison: i32,
    ) -> TunerResult<()> {
        ctx.candidate_mut(id)?.finished = true;
        if comparison > 0 {
            self.promote(ctx, id).await?;
        } else {
            debug!(candidate = %id, "Challenger tied with incumbent");
        }
        Ok(())
    }

    async fn lose(&mut self, ctx: &mut TuningContext, id: ConfigId, best: ConfigId) -> TunerResult<()> {
        let runs = {
            let candidate = ctx.candidate_mut(id)?;
            candidate.finished = true;
            candidate.job_count()
        };
        info!(candidate = %id, runs, "Challenger lost against incumbent");
        ctx.emit(TunerEvent::CandidateLost {
            config_id: id,
            runs,
        });
        if ctx.config.delete_losers {
            ctx.backend.remove_config(id).await?;
        }

        if ctx.candidate(best)?.job_count() < ctx.max_incumbent_runs() {
            let priority = ctx.priority_of(best);
            ctx.expand_candidate(best, 1, priority).await?;
            ctx.pending.insert(best);
        }
        Ok(())
    }
}

#[async_trait]
impl RacingStrategy for CappedRacing {
    fn name(&self) -> &str {
        self.name
    }

    fn incumbent(&self) -> Option<ConfigId> {
        self.best
    }

    async fn init_first(&mut self, ctx: &mut TuningContext, id: ConfigId) -> TunerResult<()> {
        self.best = Some(id);
        ctx.candidate_mut(id)?.incumbent_number = Some(self.next_incumbent_number);
        self.next_incumbent_number += 1;
        ctx.refresh_candidate(id).await?;

        let target = ctx
            .max_incumbent_runs()
            .min(ctx.config.initial_default_parcours_length);
        let missing = target.saturating_sub(ctx.candidate(id)?.job_count());
        let launched = if missing > 0 {
            ctx.expand_candidate(id, missing, i32::MAX).await?
        } else {
            0
        };
        info!(candidate = %id, launched, "Evaluating first incumbent");

        if launched > 0 {
            loop {
                ctx.backend.pause(INIT_POLL).await;
                ctx.refresh_candidate(id).await?;
                if ctx.candidate(id)?.is_done() {
                    break;
                }
            }
        }
        ctx.rename_candidate(id, true).await
    }

    fn compute_optimal_expansion(
        &self,
        ctx: &TuningContext,
        cores: usize,
        active_jobs: usize,
        pending: usize,
    ) -> usize {
        let config = &ctx.config;
        if cores < config.min_cores || (config.max_cores > 0 && cores > config.max_cores) {
            warn!(
                cores,
                min_cores = config.min_cores,
                max_cores = config.max_cores,
                "Core count outside configured bounds"
            );
        }

        let limit = u64::from(config.job_cpu_time_limit.max(1));
        let static_variance = if limit < 4 { 10 } else { 30 };
        let exponent = ((static_variance + limit) / limit).min(16) as i32;
        let factor = 2f64.powi(exponent).clamp(2.0, 10.0);

        let capacity = factor * cores as f64;
        let mut desired = 0;
        if (active_jobs as f64) < capacity {
            desired = (capacity - active_jobs as f64).floor() as usize / config.min_runs.max(1);
        }
        if pending == 0 && desired == 0 {
            desired = 1;
        }
        desired
    }

    async fn candidates_created(
        &mut self,
        ctx: &mut TuningContext,
        ids: &[ConfigId],
    ) -> TunerResult<()> {
        let best = self.best()?;
        let min_runs = ctx.config.min_runs;
        for &id in ids {
            let priority = ctx.priority_of(id);
            let launched = ctx.add_random_job(min_runs, id, best, priority).await?;
            debug!(candidate = %id, launched, "Started racing candidate");
            ctx.rename_candidate(id, false).await?;
            ctx.pending.insert(id);
        }
        Ok(())
    }

    async fn candidates_finished(
        &mut self,
        ctx: &mut TuningContext,
        ids: &[ConfigId],
    ) -> TunerResult<CappingReport> {
        let report = if self.capping && ctx.statistic.allows_capping() {
            self.aggressive_capping(ctx).await?
        } else {
            CappingReport::default()
        };

        for &id in ids {
            let best = self.best()?;
            if id == best || report.capped.contains(&id) {
                continue;
            }
            let stopped = self.stopped.remove(&id);
            let comparison = ctx.compare(id, best)?;

            if !stopped && comparison >= 0 {
                let runs = ctx.candidate(id)?.job_count();
                if runs >= ctx.candidate(best)?.job_count() {
                    self.reach_parity(ctx, id, comparison).await?;
                    continue;
                }
                let more = runs.max(ctx.config.min_runs);
                let priority = ctx.priority_of(id);
                let launched = ctx.add_random_job(more, id, best, priority).await?;
                if launched > 0 {
                    debug!(candidate = %id, launched, "Challenger keeps racing");
                    ctx.pending.insert(id);
                } else if ctx.candidate(best)?.is_done() {
                    self.reach_parity(ctx, id, comparison).await?;
                } else {
                    // Wait for the incumbent's outstanding runs.
                    ctx.pending.insert(id);
                }
            } else {
                self.lose(ctx, id, best).await?;
            }
            ctx.rename_candidate(id, false).await?;
        }
        Ok(report)
    }

    fn stop_evaluation(&mut self, ids: &[ConfigId]) {
        self.stopped.extend(ids.iter().copied());
    }

    fn best_candidates(&self, n: usize) -> Vec<ConfigId> {
        self.best.into_iter().take(n).collect()
    }

    async fn race_finished(&mut self, ctx: &mut TuningContext) -> TunerResult<()> {
        let best = self.best()?;
        ctx.refresh_candidate(best).await?;
        ctx.rename_candidate(best, true).await
    }
}
