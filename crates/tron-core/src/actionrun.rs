//! One execution of one action within a job run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::{Action, ActionGraph};
use crate::command_context::CommandContext;
use crate::error::Result;
use crate::node::{Node, NodeError, NodePoolStore};
use crate::observer::{Address, Event, Observable};
use crate::runtime::{Runtime, Ticket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionRunState {
    Scheduled,
    Queued,
    Cancelled,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl ActionRunState {
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Scheduled | Self::Queued)
    }

    pub fn is_done(self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Succeeded | Self::Failed | Self::Unknown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Cancelled => "cancelled",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ActionRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialized form of an [`ActionRun`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRunRecord {
    pub id: String,
    pub action: String,
    pub node: String,
    pub command: String,
    pub state: ActionRunState,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_status: Option<i32>,
    #[serde(default)]
    pub cleanup: bool,
}

// ---------------------------------------------------------------------------
// ActionRun
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ActionRun {
    pub id: String,
    job: String,
    run: u64,
    pub action: String,
    pub command: String,
    node: Arc<dyn Node>,
    state: ActionRunState,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    exit_status: Option<i32>,
    is_cleanup: bool,
    ticket: Option<Ticket>,
}

impl ActionRun {
    fn new(job: &str, run: u64, action: &Action, command: String, node: Arc<dyn Node>) -> Self {
        Self {
            id: format!("{job}.{run}.{}", action.name),
            job: job.to_string(),
            run,
            action: action.name.clone(),
            command,
            node,
            state: ActionRunState::Scheduled,
            start_time: None,
            end_time: None,
            exit_status: None,
            is_cleanup: action.is_cleanup,
            ticket: None,
        }
    }

    pub fn from_record(job: &str, run: u64, record: &ActionRunRecord, node: Arc<dyn Node>) -> Self {
        Self {
            id: record.id.clone(),
            job: job.to_string(),
            run,
            action: record.action.clone(),
            command: record.command.clone(),
            node,
            state: record.state,
            start_time: record.start_time,
            end_time: record.end_time,
            exit_status: record.exit_status,
            is_cleanup: record.cleanup,
            ticket: None,
        }
    }

    pub fn state(&self) -> ActionRunState {
        self.state
    }

    pub fn node(&self) -> &Arc<dyn Node> {
        &self.node
    }

    pub fn is_cleanup(&self) -> bool {
        self.is_cleanup
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn ticket(&self) -> Option<Ticket> {
        self.ticket
    }

    /// Dispatch the command. On `Err` nothing was issued and the state is
    /// unchanged; the caller decides what a refused start means.
    pub fn start(&mut self, rt: &mut Runtime) -> std::result::Result<(), NodeError> {
        if !self.state.is_pending() {
            debug!(action_run = %self.id, state = %self.state, "start ignored");
            return Ok(());
        }
        let ticket = rt.dispatch(self.node.as_ref(), &self.command, self.address())?;
        self.ticket = Some(ticket);
        self.state = ActionRunState::Running;
        self.start_time = Some(rt.now());
        info!(action_run = %self.id, host = self.node.hostname(), "action run started");
        rt.notify(
            self.address(),
            Event::ActionRunStarted {
                action: self.action.clone(),
            },
        );
        Ok(())
    }

    /// Mark a pending run failed without it ever having been dispatched.
    pub fn fail_start(&mut self, rt: &mut Runtime, error: &NodeError) {
        if !self.state.is_pending() {
            return;
        }
        warn!(action_run = %self.id, %error, "action run failed to start");
        self.finish(rt, ActionRunState::Failed);
    }

    /// Record the outcome of the command behind `ticket`. Completions for any
    /// other ticket are stale and ignored.
    pub fn complete(
        &mut self,
        rt: &mut Runtime,
        ticket: Ticket,
        outcome: std::result::Result<i32, NodeError>,
    ) {
        if self.ticket != Some(ticket) || self.state != ActionRunState::Running {
            debug!(action_run = %self.id, ticket = ticket.0, "stale completion ignored");
            return;
        }
        self.ticket = None;
        let state = match outcome {
            Ok(0) => ActionRunState::Succeeded,
            Ok(code) => {
                self.exit_status = Some(code);
                ActionRunState::Failed
            }
            Err(error) => {
                warn!(action_run = %self.id, %error, "lost track of action run");
                ActionRunState::Unknown
            }
        };
        if state == ActionRunState::Succeeded {
            self.exit_status = Some(0);
        }
        info!(action_run = %self.id, state = %state, "action run finished");
        self.finish(rt, state);
    }

    pub fn queue(&mut self) {
        if self.state == ActionRunState::Scheduled {
            self.state = ActionRunState::Queued;
        }
    }

    pub fn cancel(&mut self) -> bool {
        if !self.state.is_pending() {
            return false;
        }
        self.state = ActionRunState::Cancelled;
        true
    }

    /// A run left RUNNING by a previous controller can never report back.
    pub fn mark_unknown(&mut self, now: DateTime<Utc>) -> bool {
        if self.state != ActionRunState::Running {
            return false;
        }
        self.state = ActionRunState::Unknown;
        self.end_time = Some(now);
        self.ticket = None;
        true
    }

    fn finish(&mut self, rt: &mut Runtime, state: ActionRunState) {
        self.state = state;
        self.end_time = Some(rt.now());
        rt.notify(
            self.address(),
            Event::ActionRunDone {
                action: self.action.clone(),
            },
        );
    }

    pub fn state_data(&self) -> ActionRunRecord {
        ActionRunRecord {
            id: self.id.clone(),
            action: self.action.clone(),
            node: self.node.hostname().to_string(),
            command: self.command.clone(),
            state: self.state,
            start_time: self.start_time,
            end_time: self.end_time,
            exit_status: self.exit_status,
            cleanup: self.is_cleanup,
        }
    }
}

impl Observable for ActionRun {
    fn address(&self) -> Address {
        Address::ActionRun {
            job: self.job.clone(),
            run: self.run,
            action: self.action.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionRunCollection
// ---------------------------------------------------------------------------

/// The action runs of one job run plus the graph that orders them.
#[derive(Debug)]
pub struct ActionRunCollection {
    graph: Arc<ActionGraph>,
    runs: BTreeMap<String, ActionRun>,
    order: Vec<String>,
}

impl ActionRunCollection {
    /// Render every action's command and bind it to a node. Actions without
    /// a node override run on `job_node`.
    pub fn build(
        graph: Arc<ActionGraph>,
        job: &str,
        run: u64,
        job_node: &Arc<dyn Node>,
        pools: &NodePoolStore,
        context: &CommandContext,
    ) -> Result<Self> {
        let mut runs = BTreeMap::new();
        let mut order = Vec::with_capacity(graph.len());
        for action in graph.actions() {
            let node = match &action.node {
                Some(pool) => pools.get(pool)?.next(),
                None => Arc::clone(job_node),
            };
            let command = context
                .clone()
                .with("action", &action.name)
                .with("node", node.hostname())
                .with("cleanup", action.is_cleanup)
                .render(&action.command)?;
            order.push(action.name.clone());
            runs.insert(
                action.name.clone(),
                ActionRun::new(job, run, action, command, node),
            );
        }
        Ok(Self { graph, runs, order })
    }

    /// Rebuild from records. Records for actions no longer in `graph` are
    /// kept so history survives a config change.
    pub fn restore<F>(
        graph: Arc<ActionGraph>,
        job: &str,
        run: u64,
        records: &[ActionRunRecord],
        mut resolve: F,
    ) -> Self
    where
        F: FnMut(&ActionRunRecord) -> Arc<dyn Node>,
    {
        let mut runs = BTreeMap::new();
        let mut order = Vec::with_capacity(records.len());
        for record in records {
            let node = resolve(record);
            order.push(record.action.clone());
            runs.insert(
                record.action.clone(),
                ActionRun::from_record(job, run, record, node),
            );
        }
        Self { graph, runs, order }
    }

    pub fn graph(&self) -> &Arc<ActionGraph> {
        &self.graph
    }

    pub fn get(&self, action: &str) -> Option<&ActionRun> {
        self.runs.get(action)
    }

    pub fn get_mut(&mut self, action: &str) -> Option<&mut ActionRun> {
        self.runs.get_mut(action)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Action runs in the order the job defines them.
    pub fn iter(&self) -> impl Iterator<Item = &ActionRun> {
        self.order.iter().filter_map(|n| self.runs.get(n))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ActionRun> {
        self.runs.values_mut()
    }

    fn main_runs(&self) -> impl Iterator<Item = &ActionRun> {
        self.iter().filter(|r| !r.is_cleanup)
    }

    /// Pending non-cleanup runs whose requirements have all succeeded.
    pub fn ready(&self) -> Vec<String> {
        self.main_runs()
            .filter(|r| r.state.is_pending())
            .filter(|r| {
                self.graph.required_actions(&r.action).iter().all(|dep| {
                    self.runs
                        .get(&dep.name)
                        .is_some_and(|d| d.state == ActionRunState::Succeeded)
                })
            })
            .map(|r| r.action.clone())
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.runs.values().any(|r| r.state == ActionRunState::Running)
    }

    /// Nothing is running and nothing can be promoted. Pending runs blocked
    /// behind a failure stay pending.
    pub fn is_done(&self) -> bool {
        !self.main_runs().any(|r| r.state == ActionRunState::Running) && self.ready().is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.main_runs().all(|r| r.state == ActionRunState::Succeeded)
    }

    pub fn cleanup(&self) -> Option<&ActionRun> {
        self.runs.values().find(|r| r.is_cleanup)
    }

    pub fn cleanup_mut(&mut self) -> Option<&mut ActionRun> {
        self.runs.values_mut().find(|r| r.is_cleanup)
    }

    pub fn queue_pending(&mut self) {
        self.runs.values_mut().for_each(ActionRun::queue);
    }

    pub fn cancel_pending(&mut self) -> usize {
        self.runs.values_mut().filter_map(|r| r.cancel().then_some(())).count()
    }

    /// Runs that were RUNNING when state was saved.
    pub fn recover_lost(&mut self, now: DateTime<Utc>) -> usize {
        self.runs
            .values_mut()
            .filter_map(|r| r.mark_unknown(now).then_some(()))
            .count()
    }

    pub fn attach_all(&self, rt: &mut Runtime, observer: &Address) {
        for run in self.runs.values() {
            run.attach(&mut rt.bus, observer.clone());
        }
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.runs.values().map(|r| r.address()).collect()
    }

    pub fn state_data(&self) -> Vec<ActionRunRecord> {
        self.iter().map(ActionRun::state_data).collect()
    }
}
