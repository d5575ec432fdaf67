//! Publish/subscribe wiring between controller entities.
//!
//! Entities never hold references to each other. Each one has an
//! [`Address`]; watching is a relation between addresses kept in the
//! [`EventBus`]. `notify` snapshots the watchers of the source at that moment
//! and queues one [`Delivery`] per watcher, which the controller drains and
//! routes to the watcher's handler before the loop turn ends. Because the
//! watcher list is copied, a watcher that unsubscribes while handling an
//! event does not disturb deliveries already queued.
//!
//! Deliveries to an outside [`Address::Listener`] are held until it drains
//! them, at most [`RECORDED_LIMIT`] per listener with the oldest dropped
//! first.

use std::collections::{HashMap, VecDeque};

use crate::service::instance::InstanceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
    Start,
    Monitor,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    ActionRun {
        job: String,
        run: u64,
        action: String,
    },
    JobRun {
        job: String,
        run: u64,
    },
    Job(String),
    Task {
        service: String,
        instance: u32,
        kind: TaskKind,
    },
    Instance {
        service: String,
        instance: u32,
    },
    Service(String),
    StateHandler,
    /// An outside observer; deliveries are recorded instead of routed.
    Listener(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartNotify {
    Started,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorNotify {
    Start,
    Up,
    Down,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopNotify {
    Success,
    Fail,
}

/// Event tokens. Variants carry their payload, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ActionRunStarted { action: String },
    ActionRunDone { action: String },
    JobRunStarted,
    JobRunStartFailed,
    JobRunDone,
    JobRunStateChanged,
    JobRunQueued { run: u64 },
    JobRunCancelled { run: u64 },
    JobReconfigured,
    JobStateRestored,
    JobStateChanged,
    StartTask(StartNotify),
    MonitorTask(MonitorNotify),
    StopTask(StopNotify),
    InstanceStateChanged(InstanceState),
    ServiceStateChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub source: Address,
    pub observer: Address,
    pub event: Event,
}

/// Undrained deliveries kept per listener.
pub const RECORDED_LIMIT: usize = 1000;

#[derive(Debug, Default)]
pub struct EventBus {
    watchers: HashMap<Address, Vec<Address>>,
    queue: VecDeque<Delivery>,
    recorded: HashMap<u32, VecDeque<Delivery>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// `observer` starts receiving notifications from `observable`.
    /// Watching twice is a no-op.
    pub fn watch(&mut self, observer: Address, observable: Address) {
        let list = self.watchers.entry(observable).or_default();
        if !list.contains(&observer) {
            list.push(observer);
        }
    }

    pub fn unwatch(&mut self, observer: &Address, observable: &Address) {
        if let Some(list) = self.watchers.get_mut(observable) {
            list.retain(|o| o != observer);
        }
    }

    /// Drop every relation involving `address`, in either direction. A
    /// forgotten listener also loses what it has not drained.
    pub fn forget(&mut self, address: &Address) {
        if let Address::Listener(id) = address {
            self.recorded.remove(id);
        }
        self.watchers.remove(address);
        for list in self.watchers.values_mut() {
            list.retain(|o| o != address);
        }
    }

    pub fn watchers_of(&self, observable: &Address) -> &[Address] {
        self.watchers
            .get(observable)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn notify(&mut self, source: Address, event: Event) {
        let Some(list) = self.watchers.get(&source) else {
            return;
        };
        for observer in list.clone() {
            let delivery = Delivery {
                source: source.clone(),
                observer,
                event: event.clone(),
            };
            if let Address::Listener(id) = delivery.observer {
                let held = self.recorded.entry(id).or_default();
                if held.len() >= RECORDED_LIMIT {
                    held.pop_front();
                }
                held.push_back(delivery);
            } else {
                self.queue.push_back(delivery);
            }
        }
    }

    pub fn next_delivery(&mut self) -> Option<Delivery> {
        self.queue.pop_front()
    }

    /// Drain what a [`Address::Listener`] has received so far.
    pub fn take_recorded(&mut self, listener: u32) -> Vec<Delivery> {
        self.recorded
            .remove(&listener)
            .map(Vec::from)
            .unwrap_or_default()
    }
}

/// Anything that can be watched.
pub trait Observable {
    fn address(&self) -> Address;

    fn attach(&self, bus: &mut EventBus, observer: Address) {
        bus.watch(observer, self.address());
    }

    fn notify(&self, bus: &mut EventBus, event: Event) {
        bus.notify(self.address(), event);
    }
}
