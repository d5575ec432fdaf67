//! The single execution context every state machine runs in.
//!
//! [`Runtime`] bundles the timer loop, the event bus and the table of
//! outstanding remote commands. Entity methods take `&mut Runtime`, so all
//! state changes happen on the controller loop with no locking.
//!
//! Dispatching a command returns a [`Ticket`] recorded against the owner's
//! [`Address`]. The command's future is spawned onto tokio and its exit code
//! comes back through the completion channel. An owner that stops caring
//! about a command (check abandoned, task replaced) drops the ticket; the
//! eventual completion then finds no owner and is discarded.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::eventloop::{Callback, EventLoop};
use crate::node::{Node, NodeError};
use crate::observer::{Address, Event, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub ticket: Ticket,
    pub outcome: Result<i32, NodeError>,
}

impl Completion {
    pub fn exited(ticket: Ticket, code: i32) -> Self {
        Self {
            ticket,
            outcome: Ok(code),
        }
    }
}

/// Deferred work understood by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timer {
    RunJob { job: String, run: u64 },
    Monitor { service: String, instance: u32 },
    HangCheck {
        service: String,
        instance: u32,
        ticket: Ticket,
    },
}

#[derive(Debug)]
pub struct Runtime {
    pub timers: EventLoop<Timer>,
    pub bus: EventBus,
    owners: HashMap<Ticket, Address>,
    next_ticket: u64,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Runtime {
    pub fn new(origin: DateTime<Utc>) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let rt = Self {
            timers: EventLoop::new(origin),
            bus: EventBus::new(),
            owners: HashMap::new(),
            next_ticket: 0,
            completions: tx,
        };
        (rt, rx)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.timers.now()
    }

    pub fn call_later(&mut self, delay: Duration, timer: Timer) -> Callback {
        self.timers.call_later(delay, timer)
    }

    pub fn call_at(&mut self, when: DateTime<Utc>, timer: Timer) -> Callback {
        self.timers.call_at(when, timer)
    }

    pub fn cancel(&mut self, callback: Option<Callback>) {
        if let Some(cb) = callback {
            self.timers.cancel(cb);
        }
    }

    pub fn notify(&mut self, source: Address, event: Event) {
        self.bus.notify(source, event);
    }

    /// Issue `command` on `node` for `owner`. An `Err` means the command was
    /// never issued.
    pub fn dispatch(
        &mut self,
        node: &dyn Node,
        command: &str,
        owner: Address,
    ) -> Result<Ticket, NodeError> {
        let execution = node.run(command)?;
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;
        self.owners.insert(ticket, owner);

        // outside a runtime (sync tests) completions are delivered by hand
        if tokio::runtime::Handle::try_current().is_ok() {
            let tx = self.completions.clone();
            tokio::spawn(async move {
                let outcome = execution.await;
                let _ = tx.send(Completion { ticket, outcome });
            });
        }
        debug!(ticket = ticket.0, host = node.hostname(), "dispatched");
        Ok(ticket)
    }

    /// Claim the owner of a finished command. `None` if it was abandoned.
    pub fn take_owner(&mut self, ticket: Ticket) -> Option<Address> {
        self.owners.remove(&ticket)
    }

    /// Stop caring about a command; its completion will be ignored.
    pub fn abandon(&mut self, ticket: Option<Ticket>) {
        if let Some(t) = ticket {
            self.owners.remove(&t);
        }
    }

    pub fn outstanding(&self) -> usize {
        self.owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{t0, ScriptedNode};

    fn owner() -> Address {
        Address::ActionRun {
            job: "j".into(),
            run: 0,
            action: "a".into(),
        }
    }

    #[test]
    fn tickets_are_unique_and_owned() {
        let (mut rt, _rx) = Runtime::new(t0());
        let node = ScriptedNode::new("h");
        let a = rt.dispatch(&node, "one", owner()).unwrap();
        let b = rt.dispatch(&node, "two", owner()).unwrap();
        assert_ne!(a, b);
        assert_eq!(rt.outstanding(), 2);
        assert_eq!(rt.take_owner(a), Some(owner()));
        assert_eq!(rt.take_owner(a), None);
    }

    #[test]
    fn refused_dispatch_issues_no_ticket() {
        let (mut rt, _rx) = Runtime::new(t0());
        let node = ScriptedNode::new("h");
        node.set_refuse(true);
        assert!(rt.dispatch(&node, "x", owner()).is_err());
        assert_eq!(rt.outstanding(), 0);
    }

    #[test]
    fn abandoned_ticket_has_no_owner() {
        let (mut rt, _rx) = Runtime::new(t0());
        let node = ScriptedNode::new("h");
        let t = rt.dispatch(&node, "x", owner()).unwrap();
        rt.abandon(Some(t));
        assert_eq!(rt.take_owner(t), None);
    }

    #[tokio::test]
    async fn completions_arrive_on_the_channel() {
        let (mut rt, mut rx) = Runtime::new(t0());
        let node = crate::node::LocalNode::new("localhost");
        let t = rt.dispatch(&node, "exit 2", owner()).unwrap();
        let c = rx.recv().await.unwrap();
        assert_eq!(c, Completion::exited(t, 2));
    }
}
