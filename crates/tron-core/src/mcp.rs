//! The master control program: registry of jobs and services, router for
//! events, timers and command completions, and owner of the state file.
//!
//! Everything runs on one loop. [`MasterControlProgram::run`] waits for the
//! next timer deadline or the next completion, handles it, then drains the
//! event bus before waiting again. Tests drive the same entry points by
//! hand with [`MasterControlProgram::advance`] and
//! [`MasterControlProgram::handle_completion`].

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::MasterConfig;
use crate::error::{Result, TronError};
use crate::job::{Job, JobScheduler};
use crate::node::NodePoolStore;
use crate::observer::{Address, Delivery, Observable};
use crate::runtime::{Completion, Runtime, Timer};
use crate::service::Service;
use crate::state::{StateHandler, StateSnapshot};

/// Longest the loop sleeps when no timer is armed.
const IDLE_WAIT: Duration = Duration::from_secs(60);

pub struct MasterControlProgram {
    rt: Runtime,
    completions: Option<mpsc::UnboundedReceiver<Completion>>,
    pools: NodePoolStore,
    jobs: BTreeMap<String, JobScheduler>,
    services: BTreeMap<String, Service>,
    state: StateHandler,
    running: bool,
    next_listener: u32,
}

impl MasterControlProgram {
    pub fn new(state_dir: &Path, pools: NodePoolStore) -> Self {
        Self::with_origin(state_dir, pools, Utc::now())
    }

    /// A controller whose clock starts at `origin`.
    pub fn with_origin(state_dir: &Path, pools: NodePoolStore, origin: DateTime<Utc>) -> Self {
        let (rt, completions) = Runtime::new(origin);
        Self {
            rt,
            completions: Some(completions),
            pools,
            jobs: BTreeMap::new(),
            services: BTreeMap::new(),
            state: StateHandler::new(state_dir),
            running: false,
            next_listener: 0,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.rt.now()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn set_pools(&mut self, pools: NodePoolStore) {
        self.pools = pools;
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Build, update and remove jobs and services to match `config`. An
    /// entity whose definition is invalid is skipped; its error is returned
    /// and the rest of the config still applies.
    pub fn apply_config(&mut self, config: &MasterConfig) -> Vec<TronError> {
        let mut errors = Vec::new();

        let mut seen = HashSet::new();
        for cfg in &config.jobs {
            let job = match Job::from_config(cfg, &self.pools) {
                Ok(job) => job,
                Err(e) => {
                    error!(job = %cfg.name, error = %e, "job rejected");
                    errors.push(e);
                    continue;
                }
            };
            seen.insert(cfg.name.clone());
            match self.jobs.get_mut(&cfg.name) {
                Some(sched) => {
                    if sched.update_from(&mut self.rt, job) && self.running {
                        sched.schedule_next_run(&mut self.rt);
                    }
                }
                None => {
                    self.rt.bus.watch(Address::StateHandler, job.address());
                    let mut sched = JobScheduler::new(job);
                    if self.running {
                        sched.schedule_next_run(&mut self.rt);
                    }
                    info!(job = %cfg.name, "job added");
                    self.jobs.insert(cfg.name.clone(), sched);
                }
            }
        }
        let removed: Vec<String> = self
            .jobs
            .keys()
            .filter(|n| !seen.contains(*n))
            .cloned()
            .collect();
        for name in removed {
            if let Some(mut sched) = self.jobs.remove(&name) {
                sched.disable(&mut self.rt);
                let job = sched.into_job();
                for run in job.runs.iter() {
                    for address in run.addresses() {
                        self.rt.bus.forget(&address);
                    }
                }
                self.rt.bus.forget(&job.address());
                info!(job = %name, "job removed");
            }
        }

        let mut seen = HashSet::new();
        for cfg in &config.services {
            let svc = match Service::from_config(cfg, &self.pools) {
                Ok(svc) => svc,
                Err(e) => {
                    error!(service = %cfg.name, error = %e, "service rejected");
                    errors.push(e);
                    continue;
                }
            };
            seen.insert(cfg.name.clone());
            match self.services.get_mut(&cfg.name) {
                Some(existing) => {
                    if let Err(e) = existing.update_from(&mut self.rt, svc) {
                        error!(service = %cfg.name, error = %e, "service update failed");
                        errors.push(e);
                    }
                }
                None => {
                    self.rt.bus.watch(Address::StateHandler, svc.address());
                    info!(service = %cfg.name, "service added");
                    self.services.insert(cfg.name.clone(), svc);
                    if self.running {
                        if let Err(e) = self.start_service(&cfg.name) {
                            errors.push(e);
                        }
                    }
                }
            }
        }
        let removed: Vec<String> = self
            .services
            .keys()
            .filter(|n| !seen.contains(*n))
            .cloned()
            .collect();
        for name in removed {
            if let Some(mut svc) = self.services.remove(&name) {
                warn!(service = %name, "service removed from config, stopping its instances");
                svc.disable(&mut self.rt);
                for inst in svc.instances.iter() {
                    for address in inst.addresses() {
                        self.rt.bus.forget(&address);
                    }
                }
                self.rt.bus.forget(&svc.address());
            }
        }

        self.dispatch_events();
        self.state.mark_dirty();
        errors
    }

    fn start_service(&mut self, name: &str) -> Result<()> {
        let svc = self
            .services
            .get_mut(name)
            .ok_or_else(|| TronError::ServiceNotFound(name.to_string()))?;
        svc.resume(&mut self.rt)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Restore jobs and services from the state file. Only valid before
    /// [`resume`](Self::resume). Returns false when there was no file.
    pub fn load_state(&mut self) -> Result<bool> {
        if self.running {
            return Err(TronError::InvalidConfig(
                "state can only be restored before the controller starts".into(),
            ));
        }
        let Some(snapshot) = self.state.load()? else {
            return Ok(false);
        };
        for (name, state) in &snapshot.jobs {
            match self.jobs.get_mut(name) {
                Some(sched) => sched.job_mut().restore_state(&mut self.rt, state),
                None => warn!(job = %name, "state for unknown job ignored"),
            }
        }
        for (name, state) in &snapshot.services {
            match self.services.get_mut(name) {
                Some(svc) => svc.restore_state(&mut self.rt, state)?,
                None => warn!(service = %name, "state for unknown service ignored"),
            }
        }
        self.dispatch_events();
        Ok(true)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let mut snapshot = StateSnapshot::default();
        for (name, sched) in &self.jobs {
            snapshot.jobs.insert(name.clone(), sched.job().state_data());
        }
        for (name, svc) in &self.services {
            snapshot.services.insert(name.clone(), svc.state_data());
        }
        snapshot
    }

    pub fn save_state(&mut self) -> Result<()> {
        let snapshot = self.snapshot();
        self.state.save(&snapshot)
    }

    pub fn state_handler(&self) -> &StateHandler {
        &self.state
    }

    fn save_if_dirty(&mut self) {
        if !self.state.is_dirty() {
            return;
        }
        if let Err(e) = self.save_state() {
            error!(error = %e, path = %self.state.path().display(), "failed to save state");
        }
    }

    /// Enter the running phase: recover runs cut off by a restart, re-arm
    /// scheduled runs and start services.
    pub fn resume(&mut self) -> Result<()> {
        self.running = true;
        for sched in self.jobs.values_mut() {
            sched.resume(&mut self.rt);
        }
        let mut result = Ok(());
        for (name, svc) in self.services.iter_mut() {
            if let Err(e) = svc.resume(&mut self.rt) {
                error!(service = %name, error = %e, "service failed to resume");
                result = Err(e);
            }
        }
        self.dispatch_events();
        self.state.mark_dirty();
        info!(jobs = self.jobs.len(), services = self.services.len(), "controller resumed");
        result
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Deliver every queued notification, including those raised while
    /// delivering.
    pub fn dispatch_events(&mut self) {
        while let Some(delivery) = self.rt.bus.next_delivery() {
            self.route(delivery);
        }
    }

    fn route(&mut self, delivery: Delivery) {
        let Delivery {
            source,
            observer,
            event,
        } = delivery;
        match observer {
            Address::JobRun { job, run } => {
                if let Some(r) = self
                    .jobs
                    .get_mut(&job)
                    .and_then(|s| s.job_mut().runs.get_mut(run))
                {
                    r.handle_action_event(&mut self.rt, &event);
                }
            }
            Address::Job(name) => {
                if let (Some(sched), Address::JobRun { run, .. }) = (self.jobs.get_mut(&name), &source) {
                    sched.handle_run_event(&mut self.rt, *run, &event);
                }
            }
            Address::Instance { service, instance } => {
                if let Some(inst) = self
                    .services
                    .get_mut(&service)
                    .and_then(|s| s.instances.get_mut(instance))
                {
                    inst.handler(&mut self.rt, &event);
                }
            }
            Address::Service(name) => {
                if let Some(svc) = self.services.get_mut(&name) {
                    svc.handle_instance_event(&mut self.rt, &event);
                }
            }
            Address::StateHandler => self.state.mark_dirty(),
            _ => {}
        }
    }

    /// Route a finished command to whoever issued it. Completions for
    /// abandoned or unknown tickets are dropped.
    pub fn handle_completion(&mut self, completion: Completion) {
        let Completion { ticket, outcome } = completion;
        let Some(owner) = self.rt.take_owner(ticket) else {
            debug!(ticket = ticket.0, "completion for abandoned command ignored");
            return;
        };
        match owner {
            Address::ActionRun { job, run, action } => {
                let action_run = self
                    .jobs
                    .get_mut(&job)
                    .and_then(|s| s.job_mut().runs.get_mut(run))
                    .and_then(|r| r.action_runs.get_mut(&action));
                match action_run {
                    Some(ar) => ar.complete(&mut self.rt, ticket, outcome),
                    None => debug!(%job, run, %action, "completion for a run no longer tracked"),
                }
            }
            Address::Task {
                service,
                instance,
                kind,
            } => {
                let inst = self
                    .services
                    .get_mut(&service)
                    .and_then(|s| s.instances.get_mut(instance));
                match inst {
                    Some(inst) => inst.handle_completion(&mut self.rt, kind, ticket, outcome),
                    None => debug!(%service, instance, "completion for an instance no longer tracked"),
                }
            }
            other => warn!(owner = ?other, "completion with unexpected owner"),
        }
        self.dispatch_events();
    }

    pub fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::RunJob { job, run } => {
                if let Some(sched) = self.jobs.get_mut(&job) {
                    sched.run_job(&mut self.rt, run);
                }
            }
            Timer::Monitor { service, instance } => {
                if let Some(inst) = self
                    .services
                    .get_mut(&service)
                    .and_then(|s| s.instances.get_mut(instance))
                {
                    inst.handle_timer_monitor(&mut self.rt);
                }
            }
            Timer::HangCheck {
                service,
                instance,
                ticket,
            } => {
                if let Some(inst) = self
                    .services
                    .get_mut(&service)
                    .and_then(|s| s.instances.get_mut(instance))
                {
                    inst.handle_hang_check(&mut self.rt, ticket);
                }
            }
        }
        self.dispatch_events();
    }

    /// Handle every timer that is due. Returns how many fired.
    pub fn fire_due(&mut self) -> usize {
        let mut fired = 0;
        while let Some(timer) = self.rt.timers.pop_due() {
            self.handle_timer(timer);
            fired += 1;
        }
        fired
    }

    /// Move the clock forward and fire what came due.
    pub fn advance(&mut self, by: Duration) -> usize {
        self.rt.timers.advance(by);
        self.fire_due()
    }

    /// Drive the controller until `shutdown` resolves, saving state after
    /// every turn that changed something and once more on the way out.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut completions = self
            .completions
            .take()
            .ok_or_else(|| TronError::InvalidConfig("controller loop is already running".into()))?;
        tokio::pin!(shutdown);

        let clock = tokio::time::Instant::now();
        let base = self.rt.timers.elapsed();
        info!(state = %self.state.path().display(), "controller loop started");
        loop {
            self.rt.timers.advance_to(base + clock.elapsed());
            self.fire_due();
            self.save_if_dirty();

            let wait = self.rt.timers.until_next().unwrap_or(IDLE_WAIT);
            tokio::select! {
                _ = &mut shutdown => break,
                Some(completion) = completions.recv() => self.handle_completion(completion),
                _ = tokio::time::sleep(wait) => {}
            }
        }
        self.completions = Some(completions);
        self.save_state()?;
        info!("controller loop stopped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operator API
    // -----------------------------------------------------------------------

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.keys().map(String::as_str).collect()
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }

    pub fn job(&self, name: &str) -> Result<&Job> {
        self.jobs
            .get(name)
            .map(JobScheduler::job)
            .ok_or_else(|| TronError::JobNotFound(name.to_string()))
    }

    pub fn service(&self, name: &str) -> Result<&Service> {
        self.services
            .get(name)
            .ok_or_else(|| TronError::ServiceNotFound(name.to_string()))
    }

    pub fn enable_job(&mut self, name: &str) -> Result<()> {
        let sched = self
            .jobs
            .get_mut(name)
            .ok_or_else(|| TronError::JobNotFound(name.to_string()))?;
        sched.enable(&mut self.rt);
        self.dispatch_events();
        Ok(())
    }

    pub fn disable_job(&mut self, name: &str) -> Result<()> {
        let sched = self
            .jobs
            .get_mut(name)
            .ok_or_else(|| TronError::JobNotFound(name.to_string()))?;
        sched.disable(&mut self.rt);
        self.dispatch_events();
        Ok(())
    }

    /// Start a run of `name` now. Returns the new run numbers.
    pub fn manual_start(&mut self, name: &str, run_time: Option<DateTime<Utc>>) -> Result<Vec<u64>> {
        let sched = self
            .jobs
            .get_mut(name)
            .ok_or_else(|| TronError::JobNotFound(name.to_string()))?;
        let runs = sched.manual_start(&mut self.rt, run_time)?;
        self.dispatch_events();
        Ok(runs)
    }

    pub fn enable_service(&mut self, name: &str) -> Result<()> {
        let svc = self
            .services
            .get_mut(name)
            .ok_or_else(|| TronError::ServiceNotFound(name.to_string()))?;
        let result = svc.enable(&mut self.rt);
        self.dispatch_events();
        result
    }

    pub fn disable_service(&mut self, name: &str) -> Result<()> {
        let svc = self
            .services
            .get_mut(name)
            .ok_or_else(|| TronError::ServiceNotFound(name.to_string()))?;
        svc.disable(&mut self.rt);
        self.dispatch_events();
        Ok(())
    }

    pub fn repair_service(&mut self, name: &str) -> Result<Vec<u32>> {
        let svc = self
            .services
            .get_mut(name)
            .ok_or_else(|| TronError::ServiceNotFound(name.to_string()))?;
        let result = svc.repair(&mut self.rt);
        self.dispatch_events();
        result
    }

    pub fn zap_instance(&mut self, name: &str, instance: u32) -> Result<()> {
        let svc = self
            .services
            .get_mut(name)
            .ok_or_else(|| TronError::ServiceNotFound(name.to_string()))?;
        let result = svc.zap_instance(&mut self.rt, instance);
        self.dispatch_events();
        result
    }

    /// Register an outside observer of a job or service. Its notifications
    /// are collected with [`take_events`](Self::take_events).
    pub fn watch(&mut self, target: &str) -> Result<u32> {
        let address = if self.jobs.contains_key(target) {
            Address::Job(target.to_string())
        } else if self.services.contains_key(target) {
            Address::Service(target.to_string())
        } else {
            return Err(TronError::JobNotFound(target.to_string()));
        };
        let id = self.next_listener;
        self.next_listener += 1;
        self.rt.bus.watch(Address::Listener(id), address);
        Ok(id)
    }

    pub fn take_events(&mut self, listener: u32) -> Vec<Delivery> {
        self.rt.bus.take_recorded(listener)
    }

    /// Stop recording for `listener` and drop what it has not collected.
    pub fn unwatch(&mut self, listener: u32) {
        self.rt.bus.forget(&Address::Listener(listener));
    }
}
