//! The three controllers a service instance delegates its remote work to.
//!
//! Each task owns at most one outstanding command, identified by ticket.
//! A completion for any other ticket is stale and dropped without a
//! notification.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::eventloop::Callback;
use crate::node::{Node, NodeError};
use crate::observer::{Address, Event, MonitorNotify, Observable, StartNotify, StopNotify, TaskKind};
use crate::runtime::{Runtime, Ticket, Timer};

type Outcome = std::result::Result<i32, NodeError>;

fn task_address(service: &str, instance: u32, kind: TaskKind) -> Address {
    Address::Task {
        service: service.to_string(),
        instance,
        kind,
    }
}

// ---------------------------------------------------------------------------
// StartTask
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct StartTask {
    service: String,
    instance: u32,
    node: Arc<dyn Node>,
    command: String,
    ticket: Option<Ticket>,
}

impl StartTask {
    pub fn new(service: &str, instance: u32, node: Arc<dyn Node>, command: String) -> Self {
        Self {
            service: service.to_string(),
            instance,
            node,
            command,
            ticket: None,
        }
    }

    pub fn start(&mut self, rt: &mut Runtime) {
        match rt.dispatch(self.node.as_ref(), &self.command, self.address()) {
            Ok(ticket) => self.ticket = Some(ticket),
            Err(e) => {
                warn!(service = %self.service, instance = self.instance, error = %e, "start failed to dispatch");
                rt.notify(self.address(), Event::StartTask(StartNotify::Down));
            }
        }
    }

    pub fn handle_exit(&mut self, rt: &mut Runtime, ticket: Ticket, outcome: Outcome) {
        if self.ticket != Some(ticket) {
            return;
        }
        self.ticket = None;
        let notify = match outcome {
            Ok(0) => StartNotify::Started,
            Ok(code) => {
                warn!(service = %self.service, instance = self.instance, code, "start command failed");
                StartNotify::Down
            }
            Err(e) => {
                warn!(service = %self.service, instance = self.instance, error = %e, "start command lost");
                StartNotify::Down
            }
        };
        rt.notify(self.address(), Event::StartTask(notify));
    }

    pub fn cancel(&mut self, rt: &mut Runtime) {
        rt.abandon(self.ticket.take());
    }
}

impl Observable for StartTask {
    fn address(&self) -> Address {
        task_address(&self.service, self.instance, TaskKind::Start)
    }
}

// ---------------------------------------------------------------------------
// MonitorTask
// ---------------------------------------------------------------------------

/// Periodic liveness check with a hang check at four fifths of the interval.
#[derive(Debug)]
pub struct MonitorTask {
    service: String,
    instance: u32,
    node: Arc<dyn Node>,
    command: String,
    interval: Duration,
    callback: Option<Callback>,
    hang_check: Option<Callback>,
    ticket: Option<Ticket>,
}

impl MonitorTask {
    pub fn new(
        service: &str,
        instance: u32,
        node: Arc<dyn Node>,
        command: String,
        interval: Duration,
    ) -> Self {
        Self {
            service: service.to_string(),
            instance,
            node,
            command,
            interval,
            callback: None,
            hang_check: None,
            ticket: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn hang_check_delay(&self) -> Duration {
        self.interval.saturating_mul(4) / 5
    }

    pub fn is_queued(&self, rt: &Runtime) -> bool {
        self.callback.is_some_and(|cb| rt.timers.is_active(cb))
    }

    pub fn is_outstanding(&self) -> bool {
        self.ticket.is_some()
    }

    /// Check again after one interval. An interval of zero never checks.
    pub fn queue(&mut self, rt: &mut Runtime) {
        self.queue_in(rt, self.interval);
    }

    pub fn queue_in(&mut self, rt: &mut Runtime, delay: Duration) {
        if self.interval.is_zero() || self.is_queued(rt) {
            return;
        }
        let timer = Timer::Monitor {
            service: self.service.clone(),
            instance: self.instance,
        };
        self.callback = Some(rt.call_later(delay, timer));
    }

    pub fn run(&mut self, rt: &mut Runtime) {
        self.callback = None;
        if self.ticket.is_some() {
            warn!(service = %self.service, instance = self.instance, "monitor still outstanding, skipping");
            return;
        }
        rt.notify(self.address(), Event::MonitorTask(MonitorNotify::Start));
        match rt.dispatch(self.node.as_ref(), &self.command, self.address()) {
            Ok(ticket) => {
                self.ticket = Some(ticket);
                let timer = Timer::HangCheck {
                    service: self.service.clone(),
                    instance: self.instance,
                    ticket,
                };
                self.hang_check = Some(rt.call_later(self.hang_check_delay(), timer));
            }
            Err(e) => {
                warn!(service = %self.service, instance = self.instance, error = %e, "monitor failed to dispatch");
                rt.notify(self.address(), Event::MonitorTask(MonitorNotify::Failed));
                self.queue(rt);
            }
        }
    }

    /// The check behind `ticket` has not answered in time. The check is
    /// abandoned, so its eventual completion is ignored, and the next one is
    /// queued.
    pub fn run_hang_check(&mut self, rt: &mut Runtime, ticket: Ticket) {
        if self.ticket != Some(ticket) {
            return;
        }
        self.hang_check = None;
        warn!(service = %self.service, instance = self.instance, "monitor hung");
        rt.abandon(self.ticket.take());
        rt.notify(self.address(), Event::MonitorTask(MonitorNotify::Failed));
        self.queue(rt);
    }

    pub fn handle_exit(&mut self, rt: &mut Runtime, ticket: Ticket, outcome: Outcome) {
        if self.ticket != Some(ticket) {
            debug!(service = %self.service, instance = self.instance, "stale monitor result");
            return;
        }
        self.ticket = None;
        rt.cancel(self.hang_check.take());
        match outcome {
            Ok(0) => {
                rt.notify(self.address(), Event::MonitorTask(MonitorNotify::Up));
                self.queue(rt);
            }
            _ => {
                info!(service = %self.service, instance = self.instance, "monitor reports down");
                rt.notify(self.address(), Event::MonitorTask(MonitorNotify::Down));
            }
        }
    }

    pub fn cancel(&mut self, rt: &mut Runtime) {
        rt.cancel(self.callback.take());
        rt.cancel(self.hang_check.take());
        rt.abandon(self.ticket.take());
    }
}

impl Observable for MonitorTask {
    fn address(&self) -> Address {
        task_address(&self.service, self.instance, TaskKind::Monitor)
    }
}

// ---------------------------------------------------------------------------
// StopTask
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct StopTask {
    service: String,
    instance: u32,
    node: Arc<dyn Node>,
    command: String,
    ticket: Option<Ticket>,
}

impl StopTask {
    pub fn new(service: &str, instance: u32, node: Arc<dyn Node>, command: String) -> Self {
        Self {
            service: service.to_string(),
            instance,
            node,
            command,
            ticket: None,
        }
    }

    pub fn kill(&mut self, rt: &mut Runtime) -> bool {
        match rt.dispatch(self.node.as_ref(), &self.command, self.address()) {
            Ok(ticket) => {
                self.ticket = Some(ticket);
                true
            }
            Err(e) => {
                warn!(service = %self.service, instance = self.instance, error = %e, "stop failed to dispatch");
                rt.notify(self.address(), Event::StopTask(StopNotify::Fail));
                false
            }
        }
    }

    pub fn handle_exit(&mut self, rt: &mut Runtime, ticket: Ticket, outcome: Outcome) {
        if self.ticket != Some(ticket) {
            return;
        }
        self.ticket = None;
        let notify = match outcome {
            Ok(0) => StopNotify::Success,
            Ok(code) => {
                error!(service = %self.service, instance = self.instance, code, "stop command exited non-zero");
                StopNotify::Success
            }
            Err(e) => {
                warn!(service = %self.service, instance = self.instance, error = %e, "stop command lost");
                StopNotify::Fail
            }
        };
        rt.notify(self.address(), Event::StopTask(notify));
    }

    pub fn cancel(&mut self, rt: &mut Runtime) {
        rt.abandon(self.ticket.take());
    }
}

impl Observable for StopTask {
    fn address(&self) -> Address {
        task_address(&self.service, self.instance, TaskKind::Stop)
    }
}

// ---------------------------------------------------------------------------
// TaskController
// ---------------------------------------------------------------------------

/// The one task an instance is driving right now.
#[derive(Debug)]
pub enum TaskController {
    Start(StartTask),
    Monitor(MonitorTask),
    Stop(StopTask),
}

impl TaskController {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Start(_) => TaskKind::Start,
            Self::Monitor(_) => TaskKind::Monitor,
            Self::Stop(_) => TaskKind::Stop,
        }
    }

    pub fn cancel(&mut self, rt: &mut Runtime) {
        match self {
            Self::Start(t) => t.cancel(rt),
            Self::Monitor(t) => t.cancel(rt),
            Self::Stop(t) => t.cancel(rt),
        }
    }

    pub fn handle_exit(&mut self, rt: &mut Runtime, ticket: Ticket, outcome: Outcome) {
        match self {
            Self::Start(t) => t.handle_exit(rt, ticket, outcome),
            Self::Monitor(t) => t.handle_exit(rt, ticket, outcome),
            Self::Stop(t) => t.handle_exit(rt, ticket, outcome),
        }
    }
}
