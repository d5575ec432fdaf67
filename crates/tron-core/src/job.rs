//! Jobs and the scheduler that drives their recurrence.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::action::ActionGraph;
use crate::command_context::CommandContext;
use crate::config::JobConfig;
use crate::error::Result;
use crate::jobrun::{JobRun, JobRunCollection, JobRunRecord, JobRunState};
use crate::node::{node_selector, Node, NodeError, NodePool, NodePoolStore};
use crate::observer::{Address, Event, Observable};
use crate::runtime::{Runtime, Timer};
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Disabled,
    Enabled,
    Running,
    Unknown,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "DISABLED",
            Self::Enabled => "ENABLED",
            Self::Running => "RUNNING",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Persisted per-job state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub runs: Vec<JobRunRecord>,
    pub enabled: bool,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Job {
    pub name: String,
    config: JobConfig,
    pub scheduler: Scheduler,
    pub enabled: bool,
    node_pool: Arc<NodePool>,
    action_graph: Arc<ActionGraph>,
    pools: NodePoolStore,
    pub runs: JobRunCollection,
}

impl Job {
    pub fn from_config(config: &JobConfig, pools: &NodePoolStore) -> Result<Self> {
        let scheduler = Scheduler::from_config(&config.schedule)?;
        let node_pool = pools.get(&config.node)?;
        let action_graph = Arc::new(ActionGraph::from_config(
            &config.actions,
            config.cleanup_action.as_ref(),
        )?);
        for action in action_graph.actions() {
            if let Some(pool) = &action.node {
                pools.get(pool)?;
            }
        }
        Ok(Self {
            name: config.name.clone(),
            config: config.clone(),
            scheduler,
            enabled: config.enabled,
            node_pool,
            action_graph,
            pools: pools.clone(),
            runs: JobRunCollection::new(config.run_limit),
        })
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn action_graph(&self) -> &Arc<ActionGraph> {
        &self.action_graph
    }

    pub fn node_pool(&self) -> &Arc<NodePool> {
        &self.node_pool
    }

    pub fn queueing(&self) -> bool {
        self.config.queueing
    }

    pub fn allow_overlap(&self) -> bool {
        self.config.allow_overlap && self.scheduler.permits_overlap()
    }

    pub fn status(&self) -> JobStatus {
        if !self.enabled {
            JobStatus::Disabled
        } else if self.runs.has_active() {
            JobStatus::Running
        } else if self.runs.newest().map(|r| r.state()) == Some(JobRunState::Unknown) {
            JobStatus::Unknown
        } else {
            JobStatus::Enabled
        }
    }

    /// Build the runs for `run_time`: one per pool member when `all_nodes`
    /// is set, otherwise one on the next node of the pool.
    pub fn build_new_runs(
        &mut self,
        rt: &mut Runtime,
        run_time: DateTime<Utc>,
        manual: bool,
    ) -> Result<Vec<u64>> {
        let nodes: Vec<Arc<dyn Node>> = if self.config.all_nodes {
            self.node_pool.nodes().to_vec()
        } else {
            vec![self.node_pool.next()]
        };
        let last_success = self.runs.last_success().map(|r| r.run_time);

        let mut built = Vec::with_capacity(nodes.len());
        for node in nodes {
            let run_num = self.runs.next_run_num();
            let context = CommandContext::new(run_time).with_last_success(last_success);
            let run = JobRun::build(
                &self.name,
                run_num,
                run_time,
                node,
                Arc::clone(&self.action_graph),
                &self.pools,
                context,
                manual,
            )?;
            run.attach_action_runs(rt);
            run.attach(&mut rt.bus, self.address());
            self.runs.insert(run);
            built.push(run_num);
        }
        for old in self.runs.remove_old_runs() {
            for address in old.addresses() {
                rt.bus.forget(&address);
            }
        }
        Ok(built)
    }

    /// Apply the queueing policy to a run that cannot proceed right now.
    fn queue_or_cancel(&mut self, rt: &mut Runtime, run_num: u64) {
        let queueing = self.queueing();
        let Some(run) = self.runs.get_mut(run_num) else {
            return;
        };
        if queueing {
            if run.queue(rt) {
                rt.notify(self.address(), Event::JobRunQueued { run: run_num });
            }
        } else if run.cancel(rt) {
            rt.notify(self.address(), Event::JobRunCancelled { run: run_num });
        }
    }

    fn handle_start_failed(&mut self, rt: &mut Runtime, run_num: u64) {
        if self.runs.blocked_by_other(run_num) {
            self.queue_or_cancel(rt, run_num);
        } else if let Some(run) = self.runs.get_mut(run_num) {
            let host = run.node().hostname().to_string();
            run.fail_start(rt, &NodeError::Unreachable(host));
        }
    }

    /// Take over policy and graph from a newer definition of this job.
    /// Returns false when nothing changed.
    pub fn update_from(&mut self, other: Job) -> bool {
        if self.config == other.config {
            return false;
        }
        info!(job = %self.name, "job reconfigured");
        self.config = other.config;
        self.scheduler = other.scheduler;
        self.enabled = other.enabled;
        self.node_pool = other.node_pool;
        self.action_graph = other.action_graph;
        self.pools = other.pools;
        self.runs.set_run_limit(self.config.run_limit);
        true
    }

    pub fn state_data(&self) -> JobState {
        JobState {
            runs: self.runs.state_data(),
            enabled: self.enabled,
        }
    }

    /// Resolve a persisted hostname to a node, preferring the pool the run
    /// or action was bound to.
    fn resolve_node(&self, pool: Option<&str>, hostname: &str) -> Arc<dyn Node> {
        let pool = pool
            .and_then(|p| self.pools.get(p).ok())
            .unwrap_or_else(|| Arc::clone(&self.node_pool));
        node_selector(&pool, Some(hostname))
    }

    pub fn restore_state(&mut self, rt: &mut Runtime, state: &JobState) {
        let mut runs = JobRunCollection::new(self.config.run_limit);
        let graph = Arc::clone(&self.action_graph);
        runs.restore(&self.name, &state.runs, &graph, |pool, host| {
            self.resolve_node(pool, host)
        });
        self.runs = runs;
        self.enabled = state.enabled;
        for run in self.runs.iter() {
            run.attach_action_runs(rt);
            run.attach(&mut rt.bus, self.address());
        }
        info!(job = %self.name, runs = self.runs.len(), "job state restored");
        rt.notify(self.address(), Event::JobStateRestored);
    }
}

impl Observable for Job {
    fn address(&self) -> Address {
        Address::Job(self.name.clone())
    }
}

// ---------------------------------------------------------------------------
// JobScheduler
// ---------------------------------------------------------------------------

/// Drives one job: arms the timer for its next run, starts runs when they
/// fire and applies the overlap and queueing policy.
#[derive(Debug)]
pub struct JobScheduler {
    job: Job,
}

impl JobScheduler {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_mut(&mut self) -> &mut Job {
        &mut self.job
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    /// Build the next run and arm a timer for it. A no-op while disabled,
    /// while a run is already waiting on its timer, or while overlap is not
    /// allowed and an earlier run has not cleared.
    pub fn schedule_next_run(&mut self, rt: &mut Runtime) {
        let job = &mut self.job;
        if !job.enabled {
            return;
        }
        if job.runs.get_run_by_state(JobRunState::Scheduled).is_some() {
            return;
        }
        if !job.allow_overlap() && (job.runs.has_pending() || job.runs.has_active()) {
            debug!(job = %job.name, "previous run not cleared, not scheduling");
            return;
        }

        let Some(next) = job
            .scheduler
            .next_run_time(job.runs.last_scheduled_time(), rt.now())
        else {
            error!(job = %job.name, "next run time out of range, not scheduling");
            return;
        };
        let built = match job.build_new_runs(rt, next, false) {
            Ok(built) => built,
            Err(e) => {
                error!(job = %job.name, error = %e, "failed to build job run");
                return;
            }
        };
        for run_num in built {
            let timer = Timer::RunJob {
                job: job.name.clone(),
                run: run_num,
            };
            let callback = rt.call_at(next, timer);
            if let Some(run) = job.runs.get_mut(run_num) {
                run.set_callback(callback);
            }
            info!(job = %job.name, run = run_num, at = %next, "scheduled job run");
        }
    }

    /// The timer for `run_num` fired.
    pub fn run_job(&mut self, rt: &mut Runtime, run_num: u64) {
        let job = &mut self.job;
        let Some(run) = job.runs.get_mut(run_num) else {
            warn!(job = %job.name, run = run_num, "timer fired for unknown run");
            return;
        };
        run.take_callback();
        if !job.enabled {
            debug!(job = %job.name, run = run_num, "job disabled, cancelling run");
            run.cancel(rt);
            return;
        }
        if run.state() != JobRunState::Scheduled {
            return;
        }

        if !job.allow_overlap() && job.runs.active_other(run_num) {
            job.queue_or_cancel(rt, run_num);
        } else if let Some(run) = job.runs.get_mut(run_num) {
            run.scheduled_start(rt);
        }
        self.schedule_next_run(rt);
    }

    /// Start a run now, ahead of anything already scheduled. Queued behind
    /// an active run unless overlap is allowed.
    pub fn manual_start(&mut self, rt: &mut Runtime, run_time: Option<DateTime<Utc>>) -> Result<Vec<u64>> {
        let job = &mut self.job;
        let run_time = run_time.unwrap_or_else(|| rt.now());
        let built = job.build_new_runs(rt, run_time, true)?;
        for &run_num in &built {
            let blocked = !job.allow_overlap() && job.runs.active_other(run_num);
            let Some(run) = job.runs.get_mut(run_num) else {
                continue;
            };
            if blocked {
                if run.queue(rt) {
                    rt.notify(job.address(), Event::JobRunQueued { run: run_num });
                }
            } else {
                run.manual_start(rt);
            }
            info!(job = %job.name, run = run_num, "manual job run");
        }
        Ok(built)
    }

    pub fn enable(&mut self, rt: &mut Runtime) {
        self.job.enabled = true;
        info!(job = %self.job.name, "job enabled");
        rt.notify(self.job.address(), Event::JobStateChanged);
        self.start_queued(rt);
        self.schedule_next_run(rt);
    }

    /// Stop scheduling and cancel runs that have not started. Running runs
    /// finish on their own.
    pub fn disable(&mut self, rt: &mut Runtime) {
        self.job.enabled = false;
        let cancelled = self.job.runs.cancel_pending(rt);
        info!(job = %self.job.name, cancelled = cancelled.len(), "job disabled");
        rt.notify(self.job.address(), Event::JobStateChanged);
    }

    /// Start the oldest queued run if nothing blocks it.
    fn start_queued(&mut self, rt: &mut Runtime) {
        let job = &mut self.job;
        if !job.enabled || (!job.allow_overlap() && job.runs.has_active()) {
            return;
        }
        if let Some(run_num) = job.runs.next_queued() {
            if let Some(run) = job.runs.get_mut(run_num) {
                run.start(rt);
            }
        }
    }

    /// A run of this job raised `event`.
    pub fn handle_run_event(&mut self, rt: &mut Runtime, run_num: u64, event: &Event) {
        match event {
            Event::JobRunStartFailed => self.job.handle_start_failed(rt, run_num),
            Event::JobRunDone => {
                self.start_queued(rt);
                self.schedule_next_run(rt);
            }
            _ => {}
        }
        rt.notify(self.job.address(), Event::JobStateChanged);
    }

    /// Continue after a restore: conclude runs cut off by the restart,
    /// re-arm runs still waiting on a timer and resume the cadence. A
    /// disabled job has its waiting runs cancelled instead.
    pub fn resume(&mut self, rt: &mut Runtime) {
        let now = rt.now();
        let job = &mut self.job;
        let name = job.name.clone();
        let enabled = job.enabled;
        for run in job.runs.iter_mut() {
            if run.recover(now) {
                continue;
            }
            if !enabled {
                run.cancel(rt);
            } else if run.state() == JobRunState::Scheduled {
                let timer = Timer::RunJob {
                    job: name.clone(),
                    run: run.run_num,
                };
                let callback = rt.call_at(run.run_time, timer);
                run.set_callback(callback);
            }
        }
        self.start_queued(rt);
        self.schedule_next_run(rt);
    }

    /// Take over a new definition of the job. Timers of scheduled runs are
    /// kept; a disabled definition cancels pending runs. The caller resumes
    /// scheduling once the controller is running.
    pub fn update_from(&mut self, rt: &mut Runtime, other: Job) -> bool {
        if !self.job.update_from(other) {
            return false;
        }
        rt.notify(self.job.address(), Event::JobReconfigured);
        if !self.job.enabled {
            self.job.runs.cancel_pending(rt);
        }
        true
    }
}
