//! A single supervised process of a service.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::command_context::CommandContext;
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::node::{Node, NodeError};
use crate::observer::{
    Address, Event, MonitorNotify, Observable, StartNotify, StopNotify, TaskKind,
};
use crate::runtime::{Runtime, Ticket};
use crate::service::task::{MonitorTask, StartTask, StopTask, TaskController};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Starting,
    Up,
    Monitoring,
    Failed,
    Stopping,
    Down,
    /// Restored from state; nothing known until the first check answers.
    Unknown,
}

impl InstanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Up => "up",
            Self::Monitoring => "monitoring",
            Self::Failed => "failed",
            Self::Stopping => "stopping",
            Self::Down => "down",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Up,
    Down,
    Monitor,
    MonitorFail,
    Stop,
    StopFail,
}

impl InstanceState {
    /// The transition table. `None` means the transition is not valid from
    /// this state.
    pub fn next(self, t: Transition) -> Option<Self> {
        use InstanceState as S;
        use Transition as T;
        let next = match (self, t) {
            (S::Starting, T::Up) => S::Up,
            (S::Starting, T::Down) => S::Down,
            (S::Starting, T::Stop) => S::Stopping,

            (S::Up, T::Monitor) => S::Monitoring,
            (S::Up, T::Down) => S::Down,
            (S::Up, T::Stop) => S::Stopping,

            (S::Monitoring, T::Up) => S::Up,
            (S::Monitoring, T::MonitorFail) => S::Failed,
            (S::Monitoring, T::Down) => S::Down,
            (S::Monitoring, T::Stop) => S::Stopping,

            (S::Failed, T::Monitor) => S::Monitoring,
            (S::Failed, T::Up) => S::Up,
            (S::Failed, T::Down) => S::Down,
            (S::Failed, T::Stop) => S::Stopping,

            (S::Stopping, T::Down) => S::Down,
            (S::Stopping, T::StopFail) => S::Failed,

            (S::Unknown, T::Monitor) => S::Monitoring,
            (S::Unknown, T::Up) => S::Up,
            (S::Unknown, T::Down) => S::Down,
            (S::Unknown, T::Stop) => S::Stopping,
            _ => return None,
        };
        Some(next)
    }
}

/// Persisted per-instance record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_number: u32,
    pub node: String,
}

/// Rendered commands for one instance.
#[derive(Debug, Clone)]
struct Commands {
    start: String,
    monitor: String,
    stop: String,
}

impl Commands {
    fn render(
        config: &ServiceConfig,
        instance: u32,
        node: &dyn Node,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let base = CommandContext::new(now)
            .with("name", &config.name)
            .with("instance_number", instance)
            .with("node", node.hostname());
        let pid_file = base.render(&config.pid_file)?;
        let context = base.with("pid_file", &pid_file);
        Ok(Self {
            start: context.render(&config.command)?,
            monitor: format!("cat {pid_file} | xargs kill -0"),
            stop: format!("cat {pid_file} | xargs kill"),
        })
    }
}

// ---------------------------------------------------------------------------
// ServiceInstance
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ServiceInstance {
    pub service: String,
    pub instance_number: u32,
    node: Arc<dyn Node>,
    state: InstanceState,
    commands: Commands,
    interval: Duration,
    task: TaskController,
}

impl ServiceInstance {
    /// A new instance, STARTING, with its start task ready. Date keys in
    /// the command template render against `now`.
    pub fn create(
        config: &ServiceConfig,
        instance: u32,
        node: Arc<dyn Node>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let commands = Commands::render(config, instance, node.as_ref(), now)?;
        let task = TaskController::Start(StartTask::new(
            &config.name,
            instance,
            Arc::clone(&node),
            commands.start.clone(),
        ));
        Ok(Self {
            service: config.name.clone(),
            instance_number: instance,
            node,
            state: InstanceState::Starting,
            commands,
            interval: Duration::from_secs(config.monitor_interval),
            task,
        })
    }

    /// An instance rebuilt from a record. Its state is UNKNOWN until the
    /// monitor reports.
    pub fn restore(
        config: &ServiceConfig,
        record: &InstanceRecord,
        node: Arc<dyn Node>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mut inst = Self::create(config, record.instance_number, node, now)?;
        inst.state = InstanceState::Unknown;
        inst.task = TaskController::Monitor(inst.monitor_task());
        Ok(inst)
    }

    fn monitor_task(&self) -> MonitorTask {
        MonitorTask::new(
            &self.service,
            self.instance_number,
            Arc::clone(&self.node),
            self.commands.monitor.clone(),
            self.interval,
        )
    }

    fn stop_task(&self) -> StopTask {
        StopTask::new(
            &self.service,
            self.instance_number,
            Arc::clone(&self.node),
            self.commands.stop.clone(),
        )
    }

    pub fn id(&self) -> String {
        format!("{}.{}", self.service, self.instance_number)
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn node(&self) -> &Arc<dyn Node> {
        &self.node
    }

    pub fn task(&self) -> &TaskController {
        &self.task
    }

    pub fn monitor(&self) -> Option<&MonitorTask> {
        match &self.task {
            TaskController::Monitor(m) => Some(m),
            _ => None,
        }
    }

    fn task_address(&self, kind: TaskKind) -> Address {
        Address::Task {
            service: self.service.clone(),
            instance: self.instance_number,
            kind,
        }
    }

    /// Subscribe to all three task kinds; only the active one ever notifies.
    pub fn create_tasks(&self, rt: &mut Runtime) {
        for kind in [TaskKind::Start, TaskKind::Monitor, TaskKind::Stop] {
            rt.bus.watch(self.address(), self.task_address(kind));
        }
    }

    pub fn addresses(&self) -> Vec<Address> {
        let mut out: Vec<Address> = [TaskKind::Start, TaskKind::Monitor, TaskKind::Stop]
            .into_iter()
            .map(|k| self.task_address(k))
            .collect();
        out.push(self.address());
        out
    }

    fn transition(&mut self, rt: &mut Runtime, t: Transition) -> bool {
        let Some(next) = self.state.next(t) else {
            debug!(instance = %self.id(), state = %self.state, transition = ?t, "transition ignored");
            return false;
        };
        if next != self.state {
            info!(instance = %self.id(), from = %self.state, to = %next, "instance state changed");
        }
        self.state = next;
        rt.notify(self.address(), Event::InstanceStateChanged(next));
        true
    }

    pub fn start(&mut self, rt: &mut Runtime) -> bool {
        match (&mut self.task, self.state) {
            (TaskController::Start(task), InstanceState::Starting) => {
                task.start(rt);
                true
            }
            _ => false,
        }
    }

    /// Replace whatever task is running with a stop task and send the kill.
    pub fn stop(&mut self, rt: &mut Runtime) -> bool {
        if self.state.next(Transition::Stop).is_none() {
            return false;
        }
        self.task.cancel(rt);
        let mut stop = self.stop_task();
        self.transition(rt, Transition::Stop);
        stop.kill(rt);
        self.task = TaskController::Stop(stop);
        true
    }

    /// Force the instance down. Nothing is sent to the node; any monitor
    /// still pending is cancelled.
    pub fn zap(&mut self, rt: &mut Runtime) {
        self.task.cancel(rt);
        self.transition(rt, Transition::Stop);
        if self.state != InstanceState::Down {
            self.state = InstanceState::Stopping;
            self.transition(rt, Transition::Down);
        }
    }

    /// Check immediately unless one is already queued or outstanding.
    pub fn start_monitoring(&mut self, rt: &mut Runtime, delay: Duration) {
        if let TaskController::Monitor(m) = &mut self.task {
            m.queue_in(rt, delay);
        }
    }

    pub fn handle_timer_monitor(&mut self, rt: &mut Runtime) {
        if let TaskController::Monitor(m) = &mut self.task {
            m.run(rt);
        }
    }

    pub fn handle_hang_check(&mut self, rt: &mut Runtime, ticket: Ticket) {
        if let TaskController::Monitor(m) = &mut self.task {
            m.run_hang_check(rt, ticket);
        }
    }

    /// A command issued by one of this instance's tasks finished. Results
    /// for a task that is no longer active are dropped.
    pub fn handle_completion(
        &mut self,
        rt: &mut Runtime,
        kind: TaskKind,
        ticket: Ticket,
        outcome: std::result::Result<i32, NodeError>,
    ) {
        if self.task.kind() != kind {
            debug!(instance = %self.id(), ?kind, "result for inactive task dropped");
            return;
        }
        self.task.handle_exit(rt, ticket, outcome);
    }

    /// Map a task notification onto the state machine.
    pub fn handler(&mut self, rt: &mut Runtime, event: &Event) {
        match event {
            Event::StartTask(StartNotify::Started) => self.handle_start_task_complete(rt),
            Event::StartTask(StartNotify::Down) => {
                self.transition(rt, Transition::Down);
            }
            Event::MonitorTask(n) => {
                let t = match n {
                    MonitorNotify::Start => Transition::Monitor,
                    MonitorNotify::Up => Transition::Up,
                    MonitorNotify::Down => Transition::Down,
                    MonitorNotify::Failed => Transition::MonitorFail,
                };
                self.transition(rt, t);
            }
            Event::StopTask(StopNotify::Success) => {
                self.task.cancel(rt);
                self.transition(rt, Transition::Down);
            }
            Event::StopTask(StopNotify::Fail) => {
                self.transition(rt, Transition::StopFail);
            }
            _ => {}
        }
    }

    /// The launch finished. If the instance was stopped meanwhile the new
    /// process is killed, otherwise it is up and monitoring begins.
    fn handle_start_task_complete(&mut self, rt: &mut Runtime) {
        if self.state != InstanceState::Starting {
            let mut stop = self.stop_task();
            stop.kill(rt);
            self.task = TaskController::Stop(stop);
            return;
        }
        self.transition(rt, Transition::Up);
        let mut monitor = self.monitor_task();
        monitor.queue(rt);
        self.task = TaskController::Monitor(monitor);
    }

    pub fn state_data(&self) -> InstanceRecord {
        InstanceRecord {
            instance_number: self.instance_number,
            node: self.node.hostname().to_string(),
        }
    }
}

impl Observable for ServiceInstance {
    fn address(&self) -> Address {
        Address::Instance {
            service: self.service.clone(),
            instance: self.instance_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Timer;
    use crate::testing::{t0, ScriptedNode};

    fn config() -> ServiceConfig {
        ServiceConfig {
            name: "web".into(),
            node: "h1".into(),
            count: 2,
            command: "start-web --pid {pid_file}".into(),
            pid_file: "/var/run/{name}-{instance_number}.pid".into(),
            monitor_interval: 20,
            enabled: true,
        }
    }

    struct Fixture {
        rt: Runtime,
        inst: ServiceInstance,
        node: Arc<ScriptedNode>,
    }

    fn fixture() -> Fixture {
        let node = Arc::new(ScriptedNode::new("h1"));
        let inst = ServiceInstance::create(&config(), 1, node.clone(), t0()).unwrap();
        let (mut rt, _rx) = Runtime::new(t0());
        inst.create_tasks(&mut rt);
        Fixture { rt, inst, node }
    }

    fn pump(f: &mut Fixture) {
        while let Some(d) = f.rt.bus.next_delivery() {
            if d.observer == f.inst.address() {
                f.inst.handler(&mut f.rt, &d.event);
            }
        }
    }

    fn complete(f: &mut Fixture, kind: TaskKind, ticket: Ticket, code: i32) {
        f.rt.take_owner(ticket);
        f.inst.handle_completion(&mut f.rt, kind, ticket, Ok(code));
        pump(f);
    }

    fn fire_timers(f: &mut Fixture) {
        while let Some(timer) = f.rt.timers.pop_due() {
            match timer {
                Timer::Monitor { .. } => f.inst.handle_timer_monitor(&mut f.rt),
                Timer::HangCheck { ticket, .. } => f.inst.handle_hang_check(&mut f.rt, ticket),
                Timer::RunJob { .. } => {}
            }
            pump(f);
        }
    }

    #[test]
    fn commands_are_rendered_from_pid_file() {
        let f = fixture();
        assert_eq!(f.inst.commands.start, "start-web --pid /var/run/web-1.pid");
        assert_eq!(f.inst.commands.monitor, "cat /var/run/web-1.pid | xargs kill -0");
        assert_eq!(f.inst.commands.stop, "cat /var/run/web-1.pid | xargs kill");
    }

    #[test]
    fn start_then_monitor_cycle() {
        let mut f = fixture();
        assert!(f.inst.start(&mut f.rt));
        complete(&mut f, TaskKind::Start, Ticket(0), 0);
        assert_eq!(f.inst.state(), InstanceState::Up);
        assert_eq!(f.inst.task().kind(), TaskKind::Monitor);

        f.rt.timers.advance(Duration::from_secs(20));
        fire_timers(&mut f);
        assert_eq!(f.inst.state(), InstanceState::Monitoring);

        complete(&mut f, TaskKind::Monitor, Ticket(1), 0);
        assert_eq!(f.inst.state(), InstanceState::Up);
        assert_eq!(f.node.commands().len(), 2);
    }

    #[test]
    fn start_dispatch_failure_goes_down() {
        let mut f = fixture();
        f.node.set_refuse(true);
        f.inst.start(&mut f.rt);
        pump(&mut f);
        assert_eq!(f.inst.state(), InstanceState::Down);
    }

    #[test]
    fn hung_check_fails_the_instance_and_late_result_is_ignored() {
        let mut f = fixture();
        f.inst.start(&mut f.rt);
        complete(&mut f, TaskKind::Start, Ticket(0), 0);

        f.rt.timers.advance(Duration::from_secs(20));
        fire_timers(&mut f);
        f.rt.timers.advance(Duration::from_secs(16));
        fire_timers(&mut f);
        assert_eq!(f.inst.state(), InstanceState::Failed);

        // the hung check finally answers; it was abandoned
        f.inst
            .handle_completion(&mut f.rt, TaskKind::Monitor, Ticket(1), Ok(0));
        pump(&mut f);
        assert_eq!(f.inst.state(), InstanceState::Failed);

        // the next check succeeding brings it back
        f.rt.timers.advance(Duration::from_secs(20));
        fire_timers(&mut f);
        complete(&mut f, TaskKind::Monitor, Ticket(2), 0);
        assert_eq!(f.inst.state(), InstanceState::Up);
    }

    #[test]
    fn failed_check_goes_down_without_requeue() {
        let mut f = fixture();
        f.inst.start(&mut f.rt);
        complete(&mut f, TaskKind::Start, Ticket(0), 0);
        f.rt.timers.advance(Duration::from_secs(20));
        fire_timers(&mut f);
        complete(&mut f, TaskKind::Monitor, Ticket(1), 1);
        assert_eq!(f.inst.state(), InstanceState::Down);
        assert_eq!(f.rt.timers.pending_count(), 0);
    }

    #[test]
    fn stop_cancels_monitor_and_goes_down() {
        let mut f = fixture();
        f.inst.start(&mut f.rt);
        complete(&mut f, TaskKind::Start, Ticket(0), 0);
        assert!(f.inst.stop(&mut f.rt));
        pump(&mut f);
        assert_eq!(f.inst.state(), InstanceState::Stopping);
        assert_eq!(f.rt.timers.pending_count(), 0);

        complete(&mut f, TaskKind::Stop, Ticket(1), 0);
        assert_eq!(f.inst.state(), InstanceState::Down);
        assert_eq!(
            f.node.commands().last().map(String::as_str),
            Some("cat /var/run/web-1.pid | xargs kill")
        );
    }

    #[test]
    fn stop_dispatch_failure_is_failed() {
        let mut f = fixture();
        f.inst.start(&mut f.rt);
        complete(&mut f, TaskKind::Start, Ticket(0), 0);
        f.node.set_refuse(true);
        f.inst.stop(&mut f.rt);
        pump(&mut f);
        assert_eq!(f.inst.state(), InstanceState::Failed);
    }

    #[test]
    fn zap_forces_down_and_cancels_monitor() {
        let mut f = fixture();
        f.inst.start(&mut f.rt);
        complete(&mut f, TaskKind::Start, Ticket(0), 0);
        f.inst.zap(&mut f.rt);
        pump(&mut f);
        assert_eq!(f.inst.state(), InstanceState::Down);
        assert_eq!(f.rt.timers.pending_count(), 0);
        assert_eq!(f.node.commands().len(), 1);
    }

    #[test]
    fn result_for_replaced_task_is_dropped() {
        let mut f = fixture();
        f.inst.start(&mut f.rt);
        f.inst.stop(&mut f.rt);
        pump(&mut f);
        // the launch answers after the stop was issued
        f.inst
            .handle_completion(&mut f.rt, TaskKind::Start, Ticket(0), Ok(0));
        pump(&mut f);
        assert_eq!(f.inst.state(), InstanceState::Stopping);
    }

    #[test]
    fn restored_instance_is_unknown_with_monitor() {
        let node = Arc::new(ScriptedNode::new("h1"));
        let record = InstanceRecord {
            instance_number: 3,
            node: "h1".into(),
        };
        let inst = ServiceInstance::restore(&config(), &record, node, t0()).unwrap();
        assert_eq!(inst.state(), InstanceState::Unknown);
        assert_eq!(inst.task().kind(), TaskKind::Monitor);
        assert_eq!(inst.state_data(), record);
    }

    #[test]
    fn transition_table_rejects_invalid_moves() {
        assert_eq!(InstanceState::Down.next(Transition::Up), None);
        assert_eq!(InstanceState::Stopping.next(Transition::Monitor), None);
        assert_eq!(
            InstanceState::Monitoring.next(Transition::MonitorFail),
            Some(InstanceState::Failed)
        );
    }

    #[test]
    fn date_keys_render_against_the_given_time() {
        let mut cfg = config();
        cfg.command = "start-web --log /var/log/web-{shortdate}.log".into();
        let node: Arc<dyn Node> = Arc::new(ScriptedNode::new("h1"));
        let inst = ServiceInstance::create(&cfg, 0, node, t0()).unwrap();
        assert_eq!(
            inst.commands.start,
            "start-web --log /var/log/web-2024-03-01.log"
        );
    }
}
