//! One execution of a job and the bounded history of them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::ActionGraph;
use crate::actionrun::{ActionRunCollection, ActionRunRecord, ActionRunState};
use crate::command_context::CommandContext;
use crate::eventloop::Callback;
use crate::error::Result;
use crate::node::{Node, NodeError, NodePoolStore};
use crate::observer::{Address, Event, Observable};
use crate::runtime::Runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunState {
    Scheduled,
    Queued,
    Starting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Unknown,
}

impl JobRunState {
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Scheduled | Self::Queued)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn is_done(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Unknown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for JobRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunRecord {
    pub run_num: u64,
    pub run_time: DateTime<Utc>,
    pub node: String,
    pub state: JobRunState,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub manual: bool,
    pub runs: Vec<ActionRunRecord>,
}

// ---------------------------------------------------------------------------
// JobRun
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct JobRun {
    pub job: String,
    pub run_num: u64,
    pub run_time: DateTime<Utc>,
    node: Arc<dyn Node>,
    state: JobRunState,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    manual: bool,
    pub action_runs: ActionRunCollection,
    callback: Option<Callback>,
}

impl JobRun {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        job: &str,
        run_num: u64,
        run_time: DateTime<Utc>,
        node: Arc<dyn Node>,
        graph: Arc<ActionGraph>,
        pools: &NodePoolStore,
        context: CommandContext,
        manual: bool,
    ) -> Result<Self> {
        let context = context
            .with("name", job)
            .with("run_num", run_num)
            .with("run_id", format!("{job}.{run_num}"))
            .with("node", node.hostname());
        let action_runs = ActionRunCollection::build(graph, job, run_num, &node, pools, &context)?;
        Ok(Self {
            job: job.to_string(),
            run_num,
            run_time,
            node,
            state: JobRunState::Scheduled,
            start_time: None,
            end_time: None,
            manual,
            action_runs,
            callback: None,
        })
    }

    pub fn restore<F>(job: &str, record: &JobRunRecord, graph: Arc<ActionGraph>, mut resolve: F) -> Self
    where
        F: FnMut(Option<&str>, &str) -> Arc<dyn Node>,
    {
        let node = resolve(None, &record.node);
        let action_runs =
            ActionRunCollection::restore(Arc::clone(&graph), job, record.run_num, &record.runs, |r| {
                let pool = graph.get(&r.action).and_then(|a| a.node.clone());
                resolve(pool.as_deref(), &r.node)
            });
        Self {
            job: job.to_string(),
            run_num: record.run_num,
            run_time: record.run_time,
            node,
            state: record.state,
            start_time: record.start_time,
            end_time: record.end_time,
            manual: record.manual,
            action_runs,
            callback: None,
        }
    }

    pub fn id(&self) -> String {
        format!("{}.{}", self.job, self.run_num)
    }

    pub fn state(&self) -> JobRunState {
        self.state
    }

    pub fn node(&self) -> &Arc<dyn Node> {
        &self.node
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn set_callback(&mut self, callback: Callback) {
        self.callback = Some(callback);
    }

    pub fn take_callback(&mut self) -> Option<Callback> {
        self.callback.take()
    }

    /// Subscribe this run to its action runs.
    pub fn attach_action_runs(&self, rt: &mut Runtime) {
        self.action_runs.attach_all(rt, &self.address());
    }

    pub fn scheduled_start(&mut self, rt: &mut Runtime) -> bool {
        self.start(rt)
    }

    pub fn manual_start(&mut self, rt: &mut Runtime) -> bool {
        self.manual = true;
        self.start(rt)
    }

    /// Move to STARTING and dispatch every ready action. Returns false when
    /// the run was not pending or no root could be dispatched; in the
    /// latter case the run stays STARTING and `JobRunStartFailed` is raised
    /// for the job to resolve.
    pub fn start(&mut self, rt: &mut Runtime) -> bool {
        if !self.state.is_pending() {
            debug!(run = %self.id(), state = %self.state, "start ignored");
            return false;
        }
        rt.cancel(self.callback.take());
        self.state = JobRunState::Starting;
        self.start_time = Some(rt.now());

        let (started, failed) = self.start_ready(rt);
        if started == 0 && !failed.is_empty() {
            warn!(run = %self.id(), "no action could be dispatched");
            rt.notify(self.address(), Event::JobRunStartFailed);
            return false;
        }
        for (action, error) in failed {
            if let Some(ar) = self.action_runs.get_mut(&action) {
                ar.fail_start(rt, &error);
            }
        }

        self.state = JobRunState::Running;
        info!(run = %self.id(), host = self.node.hostname(), "job run started");
        rt.notify(self.address(), Event::JobRunStarted);
        rt.notify(self.address(), Event::JobRunStateChanged);
        self.advance(rt);
        true
    }

    /// Park the run until the job has room for it. Its action runs are
    /// queued with it.
    pub fn queue(&mut self, rt: &mut Runtime) -> bool {
        if !matches!(self.state, JobRunState::Scheduled | JobRunState::Starting) {
            return false;
        }
        rt.cancel(self.callback.take());
        self.state = JobRunState::Queued;
        self.action_runs.queue_pending();
        info!(run = %self.id(), "job run queued");
        rt.notify(self.address(), Event::JobRunStateChanged);
        true
    }

    /// Cancel a run that has not started anything. Idempotent; a run that is
    /// already running is left alone.
    pub fn cancel(&mut self, rt: &mut Runtime) -> bool {
        if !matches!(
            self.state,
            JobRunState::Scheduled | JobRunState::Queued | JobRunState::Starting
        ) || self.action_runs.is_running()
        {
            return false;
        }
        rt.cancel(self.callback.take());
        self.action_runs.cancel_pending();
        self.state = JobRunState::Cancelled;
        self.end_time = Some(rt.now());
        info!(run = %self.id(), "job run cancelled");
        rt.notify(self.address(), Event::JobRunStateChanged);
        rt.notify(self.address(), Event::JobRunDone);
        true
    }

    /// Resolve a start failure with nothing to wait behind: the undispatched
    /// roots fail and the run concludes through the normal path.
    pub fn fail_start(&mut self, rt: &mut Runtime, error: &NodeError) {
        if self.state != JobRunState::Starting {
            return;
        }
        self.state = JobRunState::Running;
        for action in self.action_runs.ready() {
            if let Some(ar) = self.action_runs.get_mut(&action) {
                ar.fail_start(rt, error);
            }
        }
        self.advance(rt);
    }

    pub fn handle_action_event(&mut self, rt: &mut Runtime, event: &Event) {
        match event {
            Event::ActionRunDone { action } => {
                debug!(run = %self.id(), %action, "action run done");
                rt.notify(self.address(), Event::JobRunStateChanged);
                self.advance(rt);
            }
            Event::ActionRunStarted { .. } => {
                rt.notify(self.address(), Event::JobRunStateChanged);
            }
            _ => {}
        }
    }

    /// After a restart nothing reports back for commands issued by the old
    /// controller. Their action runs become UNKNOWN and the run concludes
    /// without dispatching anything new.
    pub fn recover(&mut self, now: DateTime<Utc>) -> bool {
        if !self.state.is_active() {
            return false;
        }
        let lost = self.action_runs.recover_lost(now);
        warn!(run = %self.id(), lost, "job run interrupted by restart");
        self.state = JobRunState::Unknown;
        self.end_time = Some(now);
        true
    }

    fn start_ready(&mut self, rt: &mut Runtime) -> (usize, Vec<(String, NodeError)>) {
        let mut started = 0;
        let mut failed = Vec::new();
        for action in self.action_runs.ready() {
            let Some(ar) = self.action_runs.get_mut(&action) else {
                continue;
            };
            match ar.start(rt) {
                Ok(()) => started += 1,
                Err(e) => failed.push((action, e)),
            }
        }
        (started, failed)
    }

    /// Promote what is ready; once nothing else can happen run cleanup, then
    /// conclude.
    fn advance(&mut self, rt: &mut Runtime) {
        if self.state != JobRunState::Running {
            return;
        }
        let (_, failed) = self.start_ready(rt);
        for (action, error) in failed {
            if let Some(ar) = self.action_runs.get_mut(&action) {
                ar.fail_start(rt, &error);
            }
        }
        if !self.action_runs.is_done() {
            return;
        }

        if let Some(cleanup) = self.action_runs.cleanup_mut() {
            if cleanup.state().is_pending() {
                match cleanup.start(rt) {
                    Ok(()) => return,
                    Err(e) => cleanup.fail_start(rt, &e),
                }
            }
            if cleanup.state() == ActionRunState::Running {
                return;
            }
        }
        self.finish(rt);
    }

    fn finish(&mut self, rt: &mut Runtime) {
        let mains: Vec<ActionRunState> = self
            .action_runs
            .iter()
            .filter(|r| !r.is_cleanup())
            .map(|r| r.state())
            .collect();
        self.state = if self.action_runs.all_succeeded() {
            JobRunState::Succeeded
        } else if mains.contains(&ActionRunState::Failed) {
            JobRunState::Failed
        } else {
            JobRunState::Unknown
        };
        self.end_time = Some(rt.now());
        info!(run = %self.id(), state = %self.state, "job run finished");
        rt.notify(self.address(), Event::JobRunStateChanged);
        rt.notify(self.address(), Event::JobRunDone);
    }

    pub fn state_data(&self) -> JobRunRecord {
        JobRunRecord {
            run_num: self.run_num,
            run_time: self.run_time,
            node: self.node.hostname().to_string(),
            state: self.state,
            start_time: self.start_time,
            end_time: self.end_time,
            manual: self.manual,
            runs: self.action_runs.state_data(),
        }
    }

    /// Addresses of this run and its action runs, for unsubscribing.
    pub fn addresses(&self) -> Vec<Address> {
        let mut out = self.action_runs.addresses();
        out.push(self.address());
        out
    }
}

impl Observable for JobRun {
    fn address(&self) -> Address {
        Address::JobRun {
            job: self.job.clone(),
            run: self.run_num,
        }
    }
}

// ---------------------------------------------------------------------------
// JobRunCollection
// ---------------------------------------------------------------------------

/// Runs of one job, most recent first.
#[derive(Debug)]
pub struct JobRunCollection {
    runs: VecDeque<JobRun>,
    run_limit: usize,
    next_run_num: u64,
}

impl JobRunCollection {
    pub fn new(run_limit: usize) -> Self {
        Self {
            runs: VecDeque::new(),
            run_limit: run_limit.max(1),
            next_run_num: 0,
        }
    }

    pub fn set_run_limit(&mut self, run_limit: usize) {
        self.run_limit = run_limit.max(1);
    }

    pub fn next_run_num(&mut self) -> u64 {
        let n = self.next_run_num;
        self.next_run_num += 1;
        n
    }

    /// Add a freshly built run. Manual runs go behind the scheduled runs
    /// waiting at the front so those keep their relative order and the
    /// manual run is the oldest pending one.
    pub fn insert(&mut self, run: JobRun) {
        if run.is_manual() {
            let at = self
                .runs
                .iter()
                .take_while(|r| r.state() == JobRunState::Scheduled)
                .count();
            self.runs.insert(at, run);
        } else {
            self.runs.push_front(run);
        }
    }

    /// Drop the oldest finished runs beyond the limit.
    pub fn remove_old_runs(&mut self) -> Vec<JobRun> {
        let mut removed = Vec::new();
        while self.runs.len() > self.run_limit {
            let Some(pos) = self.runs.iter().rposition(|r| r.state().is_done()) else {
                break;
            };
            if let Some(run) = self.runs.remove(pos) {
                removed.push(run);
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobRun> {
        self.runs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut JobRun> {
        self.runs.iter_mut()
    }

    pub fn get(&self, run_num: u64) -> Option<&JobRun> {
        self.runs.iter().find(|r| r.run_num == run_num)
    }

    pub fn get_mut(&mut self, run_num: u64) -> Option<&mut JobRun> {
        self.runs.iter_mut().find(|r| r.run_num == run_num)
    }

    pub fn newest(&self) -> Option<&JobRun> {
        self.runs.front()
    }

    /// Run time of the newest run the scheduler created.
    pub fn last_scheduled_time(&self) -> Option<DateTime<Utc>> {
        self.runs.iter().find(|r| !r.is_manual()).map(|r| r.run_time)
    }

    pub fn last_success(&self) -> Option<&JobRun> {
        self.get_run_by_state(JobRunState::Succeeded)
    }

    /// Newest run in `state`.
    pub fn get_run_by_state(&self, state: JobRunState) -> Option<&JobRun> {
        self.runs.iter().find(|r| r.state() == state)
    }

    pub fn get_pending(&self) -> impl Iterator<Item = &JobRun> {
        self.runs.iter().filter(|r| r.state().is_pending())
    }

    pub fn get_active(&self) -> impl Iterator<Item = &JobRun> {
        self.runs.iter().filter(|r| r.state().is_active())
    }

    pub fn has_pending(&self) -> bool {
        self.get_pending().next().is_some()
    }

    pub fn has_active(&self) -> bool {
        self.get_active().next().is_some()
    }

    /// Whether a run other than `run_num` is active or waiting on a timer.
    pub fn blocked_by_other(&self, run_num: u64) -> bool {
        self.runs.iter().any(|r| {
            r.run_num != run_num
                && (r.state().is_active() || r.state() == JobRunState::Scheduled)
        })
    }

    pub fn active_other(&self, run_num: u64) -> bool {
        self.runs
            .iter()
            .any(|r| r.run_num != run_num && r.state().is_active())
    }

    /// Oldest queued run.
    pub fn next_queued(&self) -> Option<u64> {
        self.runs
            .iter()
            .rev()
            .find(|r| r.state() == JobRunState::Queued)
            .map(|r| r.run_num)
    }

    /// Cancel everything not yet started. Returns the cancelled run numbers.
    pub fn cancel_pending(&mut self, rt: &mut Runtime) -> Vec<u64> {
        self.runs
            .iter_mut()
            .filter(|r| r.state().is_pending())
            .filter_map(|r| r.cancel(rt).then_some(r.run_num))
            .collect()
    }

    pub fn state_data(&self) -> Vec<JobRunRecord> {
        self.runs.iter().map(JobRun::state_data).collect()
    }

    /// Replace the history with `records` (most recent first).
    pub fn restore<F>(&mut self, job: &str, records: &[JobRunRecord], graph: &Arc<ActionGraph>, mut resolve: F)
    where
        F: FnMut(Option<&str>, &str) -> Arc<dyn Node>,
    {
        self.runs = records
            .iter()
            .map(|r| JobRun::restore(job, r, Arc::clone(graph), &mut resolve))
            .collect();
        self.next_run_num = records.iter().map(|r| r.run_num + 1).max().unwrap_or(0);
    }
}
