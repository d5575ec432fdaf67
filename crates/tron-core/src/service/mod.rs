//! Long-running services: a configured number of supervised instances.

pub mod collection;
pub mod instance;
pub mod task;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ServiceConfig;
use crate::error::{Result, TronError};
use crate::node::NodePoolStore;
use crate::observer::{Address, Event, Observable};
use crate::runtime::Runtime;

pub use collection::ServiceInstanceCollection;
pub use instance::{InstanceRecord, InstanceState, ServiceInstance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Disabled,
    Starting,
    Up,
    Degraded,
    Failed,
    Stopping,
    Down,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "DISABLED",
            Self::Starting => "STARTING",
            Self::Up => "UP",
            Self::Degraded => "DEGRADED",
            Self::Failed => "FAILED",
            Self::Stopping => "STOPPING",
            Self::Down => "DOWN",
        };
        f.write_str(s)
    }
}

/// Persisted per-service state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    pub enabled: bool,
    pub instances: Vec<InstanceRecord>,
}

#[derive(Debug)]
pub struct Service {
    pub name: String,
    config: ServiceConfig,
    pub enabled: bool,
    pub instances: ServiceInstanceCollection,
}

impl Service {
    pub fn from_config(config: &ServiceConfig, pools: &NodePoolStore) -> Result<Self> {
        let pool = pools.get(&config.node)?;
        // surface template errors at construction rather than first start
        let node = Arc::clone(&pool.nodes()[0]);
        ServiceInstance::create(config, 0, node, DateTime::<Utc>::UNIX_EPOCH)?;
        Ok(Self {
            name: config.name.clone(),
            config: config.clone(),
            enabled: config.enabled,
            instances: ServiceInstanceCollection::new(config.clone(), pool),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn status(&self) -> ServiceStatus {
        use InstanceState as S;
        let inst = &self.instances;
        if inst.any(S::Stopping) {
            return ServiceStatus::Stopping;
        }
        if !self.enabled {
            return ServiceStatus::Disabled;
        }
        if inst.is_empty() || inst.all(S::Down) {
            return ServiceStatus::Down;
        }
        if inst.all(S::Failed) {
            return ServiceStatus::Failed;
        }
        let up = inst
            .iter()
            .all(|i| matches!(i.state(), S::Up | S::Monitoring));
        if up && inst.missing() == 0 {
            return ServiceStatus::Up;
        }
        let troubled = inst.any(S::Failed) || inst.any(S::Down) || inst.missing() > 0;
        if inst.any(S::Starting) && !troubled {
            return ServiceStatus::Starting;
        }
        ServiceStatus::Degraded
    }

    /// Create and start every missing instance.
    fn start_missing(&mut self, rt: &mut Runtime) -> Result<Vec<u32>> {
        let created = self.instances.create_missing(rt)?;
        let address = self.address();
        for &n in &created {
            if let Some(inst) = self.instances.get_mut(n) {
                inst.attach(&mut rt.bus, address.clone());
                inst.start(rt);
            }
        }
        Ok(created)
    }

    pub fn enable(&mut self, rt: &mut Runtime) -> Result<()> {
        self.enabled = true;
        self.instances.clear_failed(rt);
        self.instances.clear_down(rt);
        let started = self.start_missing(rt)?;
        info!(service = %self.name, started = started.len(), "service enabled");
        rt.notify(self.address(), Event::ServiceStateChanged);
        Ok(())
    }

    pub fn disable(&mut self, rt: &mut Runtime) {
        self.enabled = false;
        for inst in self.instances.iter_mut() {
            inst.stop(rt);
        }
        info!(service = %self.name, "service disabled");
        rt.notify(self.address(), Event::ServiceStateChanged);
    }

    /// Replace failed instances.
    pub fn repair(&mut self, rt: &mut Runtime) -> Result<Vec<u32>> {
        let cleared = self.instances.clear_failed(rt);
        let started = if self.enabled {
            self.start_missing(rt)?
        } else {
            Vec::new()
        };
        info!(service = %self.name, cleared = cleared.len(), started = started.len(), "service repaired");
        rt.notify(self.address(), Event::ServiceStateChanged);
        Ok(started)
    }

    pub fn zap_instance(&mut self, rt: &mut Runtime, number: u32) -> Result<()> {
        let inst = self
            .instances
            .get_mut(number)
            .ok_or_else(|| TronError::InstanceNotFound {
                service: self.name.clone(),
                instance: number,
            })?;
        inst.zap(rt);
        Ok(())
    }

    /// An instance changed state. Instances left over from a shrink are
    /// dropped once they are down.
    pub fn handle_instance_event(&mut self, rt: &mut Runtime, event: &Event) {
        if let Event::InstanceStateChanged(state) = event {
            if *state == InstanceState::Down {
                self.instances.clear_excess(rt);
            }
            rt.notify(self.address(), Event::ServiceStateChanged);
        }
    }

    pub fn state_data(&self) -> ServiceState {
        ServiceState {
            enabled: self.enabled,
            instances: self.instances.state_data(),
        }
    }

    pub fn restore_state(&mut self, rt: &mut Runtime, state: &ServiceState) -> Result<()> {
        self.enabled = state.enabled;
        let restored = self.instances.restore_state(rt, &state.instances)?;
        let address = self.address();
        for n in &restored {
            if let Some(inst) = self.instances.get(*n) {
                inst.attach(&mut rt.bus, address.clone());
            }
        }
        info!(service = %self.name, instances = restored.len(), "service state restored");
        Ok(())
    }

    /// Start checking restored instances right away and fill any gaps.
    /// Restored instances above the count are stopped instead.
    pub fn resume(&mut self, rt: &mut Runtime) -> Result<()> {
        for inst in self.instances.excess_mut() {
            inst.stop(rt);
        }
        self.instances.clear_excess(rt);
        for inst in self.instances.iter_mut() {
            if inst.state() == InstanceState::Unknown {
                inst.start_monitoring(rt, Duration::ZERO);
            }
        }
        if self.enabled {
            self.start_missing(rt)?;
        }
        Ok(())
    }

    /// Take over a newer definition. Instances above the new count are
    /// stopped and removed once down; missing ones are started. Returns
    /// false when unchanged.
    pub fn update_from(&mut self, rt: &mut Runtime, other: Service) -> Result<bool> {
        if self.config == other.config {
            return Ok(false);
        }
        info!(service = %self.name, "service reconfigured");
        let Service {
            config, instances, ..
        } = other;
        let pool = instances.node_pool();
        self.instances.update_config(config.clone(), pool);
        self.config = config;
        for inst in self.instances.excess_mut() {
            inst.stop(rt);
        }
        self.instances.clear_excess(rt);
        if self.enabled {
            self.start_missing(rt)?;
        }
        rt.notify(self.address(), Event::ServiceStateChanged);
        Ok(true)
    }
}

impl Observable for Service {
    fn address(&self) -> Address {
        Address::Service(self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::TaskKind;
    use crate::runtime::Ticket;
    use crate::testing::{store_with, t0, ScriptedNode};

    fn config() -> ServiceConfig {
        ServiceConfig {
            name: "web".into(),
            node: "batch".into(),
            count: 2,
            command: "start-web".into(),
            pid_file: "/tmp/{name}-{instance_number}.pid".into(),
            monitor_interval: 20,
            enabled: true,
        }
    }

    struct Fixture {
        rt: Runtime,
        svc: Service,
        nodes: Vec<Arc<ScriptedNode>>,
        store: NodePoolStore,
    }

    fn fixture() -> Fixture {
        let (store, nodes) = store_with(&["h1", "h2"]);
        let svc = Service::from_config(&config(), &store).unwrap();
        let (rt, _rx) = Runtime::new(t0());
        Fixture {
            rt,
            svc,
            nodes,
            store,
        }
    }

    fn pump(f: &mut Fixture) {
        while let Some(d) = f.rt.bus.next_delivery() {
            match d.observer {
                Address::Instance { instance, .. } => {
                    if let Some(i) = f.svc.instances.get_mut(instance) {
                        i.handler(&mut f.rt, &d.event);
                    }
                }
                Address::Service(_) => f.svc.handle_instance_event(&mut f.rt, &d.event),
                _ => {}
            }
        }
    }

    fn complete(f: &mut Fixture, instance: u32, kind: TaskKind, ticket: u64, code: i32) {
        f.rt.take_owner(Ticket(ticket));
        if let Some(i) = f.svc.instances.get_mut(instance) {
            i.handle_completion(&mut f.rt, kind, Ticket(ticket), Ok(code));
        }
        pump(f);
    }

    #[test]
    fn enable_starts_instances_and_reports_up() {
        let mut f = fixture();
        f.svc.enable(&mut f.rt).unwrap();
        pump(&mut f);
        assert_eq!(f.svc.status(), ServiceStatus::Starting);
        assert_eq!(f.nodes[0].commands(), ["start-web"]);
        assert_eq!(f.nodes[1].commands(), ["start-web"]);

        complete(&mut f, 0, TaskKind::Start, 0, 0);
        assert_eq!(f.svc.status(), ServiceStatus::Starting);
        complete(&mut f, 1, TaskKind::Start, 1, 0);
        assert_eq!(f.svc.status(), ServiceStatus::Up);
    }

    #[test]
    fn failed_start_degrades_and_repair_replaces() {
        let mut f = fixture();
        f.svc.enable(&mut f.rt).unwrap();
        complete(&mut f, 0, TaskKind::Start, 0, 0);
        complete(&mut f, 1, TaskKind::Start, 1, 0);

        // instance 1 hangs on its check, then cannot be stopped
        f.nodes[1].set_refuse(true);
        f.svc.instances.get_mut(1).unwrap().stop(&mut f.rt);
        pump(&mut f);
        assert_eq!(
            f.svc.instances.get(1).unwrap().state(),
            InstanceState::Failed
        );
        assert_eq!(f.svc.status(), ServiceStatus::Degraded);

        f.nodes[1].set_refuse(false);
        assert_eq!(f.svc.repair(&mut f.rt).unwrap(), [1]);
        pump(&mut f);
        assert_eq!(
            f.svc.instances.get(1).unwrap().state(),
            InstanceState::Starting
        );
    }

    #[test]
    fn disable_stops_everything() {
        let mut f = fixture();
        f.svc.enable(&mut f.rt).unwrap();
        complete(&mut f, 0, TaskKind::Start, 0, 0);
        complete(&mut f, 1, TaskKind::Start, 1, 0);
        f.svc.disable(&mut f.rt);
        pump(&mut f);
        assert_eq!(f.svc.status(), ServiceStatus::Stopping);
        complete(&mut f, 0, TaskKind::Stop, 2, 0);
        complete(&mut f, 1, TaskKind::Stop, 3, 0);
        assert_eq!(f.svc.status(), ServiceStatus::Disabled);
        assert!(f.svc.instances.all(InstanceState::Down));
    }

    #[test]
    fn zap_unknown_instance_errors() {
        let mut f = fixture();
        assert!(matches!(
            f.svc.zap_instance(&mut f.rt, 9),
            Err(TronError::InstanceNotFound { instance: 9, .. })
        ));
    }

    #[test]
    fn restore_then_resume_checks_immediately() {
        let mut f = fixture();
        let state = ServiceState {
            enabled: true,
            instances: vec![InstanceRecord {
                instance_number: 0,
                node: "h2".into(),
            }],
        };
        f.svc.restore_state(&mut f.rt, &state).unwrap();
        assert_eq!(f.svc.state_data(), state);

        f.svc.resume(&mut f.rt).unwrap();
        // instance 1 was missing and is started; instance 0 is checked now
        assert_eq!(f.svc.instances.len(), 2);
        assert!(matches!(
            f.rt.timers.pop_due(),
            Some(crate::runtime::Timer::Monitor { instance: 0, .. })
        ));
    }

    #[test]
    fn update_from_shrinks_and_grows() {
        let mut f = fixture();
        f.svc.enable(&mut f.rt).unwrap();
        complete(&mut f, 0, TaskKind::Start, 0, 0);
        complete(&mut f, 1, TaskKind::Start, 1, 0);
        assert_eq!(f.svc.status(), ServiceStatus::Up);

        let mut cfg = config();
        cfg.count = 1;
        let smaller = Service::from_config(&cfg, &f.store).unwrap();
        assert!(f.svc.update_from(&mut f.rt, smaller).unwrap());
        pump(&mut f);
        assert_eq!(
            f.svc.instances.get(1).unwrap().state(),
            InstanceState::Stopping
        );
        assert_eq!(f.svc.status(), ServiceStatus::Stopping);

        let same = Service::from_config(&cfg, &f.store).unwrap();
        assert!(!f.svc.update_from(&mut f.rt, same).unwrap());

        // the stop finishes: instance 1 is gone and the service is whole
        complete(&mut f, 1, TaskKind::Stop, 2, 0);
        assert_eq!(f.svc.instances.len(), 1);
        assert!(f.svc.instances.get(1).is_none());
        assert_eq!(f.svc.instances.missing(), 0);
        assert_eq!(f.svc.status(), ServiceStatus::Up);

        // growing again restarts number 1
        let bigger = Service::from_config(&config(), &f.store).unwrap();
        assert!(f.svc.update_from(&mut f.rt, bigger).unwrap());
        pump(&mut f);
        assert_eq!(
            f.svc.instances.get(1).unwrap().state(),
            InstanceState::Starting
        );
        assert_eq!(f.svc.status(), ServiceStatus::Starting);
        complete(&mut f, 1, TaskKind::Start, 3, 0);
        assert_eq!(f.svc.status(), ServiceStatus::Up);
    }

    #[test]
    fn resume_stops_restored_instances_above_count() {
        let mut f = fixture();
        let state = ServiceState {
            enabled: true,
            instances: vec![
                InstanceRecord {
                    instance_number: 0,
                    node: "h1".into(),
                },
                InstanceRecord {
                    instance_number: 1,
                    node: "h2".into(),
                },
                InstanceRecord {
                    instance_number: 4,
                    node: "h1".into(),
                },
            ],
        };
        f.svc.restore_state(&mut f.rt, &state).unwrap();
        f.svc.resume(&mut f.rt).unwrap();
        pump(&mut f);
        assert_eq!(
            f.svc.instances.get(4).unwrap().state(),
            InstanceState::Stopping
        );

        complete(&mut f, 4, TaskKind::Stop, 0, 0);
        let numbers: Vec<u32> = f.svc.instances.iter().map(|i| i.instance_number).collect();
        assert_eq!(numbers, [0, 1]);
    }
}
