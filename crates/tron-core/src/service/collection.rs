//! The instances of one service, kept sorted by instance number.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::node::{node_selector, NodePool};
use crate::runtime::Runtime;
use crate::service::instance::{InstanceRecord, InstanceState, ServiceInstance};

#[derive(Debug)]
pub struct ServiceInstanceCollection {
    config: ServiceConfig,
    node_pool: Arc<NodePool>,
    instances: Vec<ServiceInstance>,
}

impl ServiceInstanceCollection {
    pub fn new(config: ServiceConfig, node_pool: Arc<NodePool>) -> Self {
        Self {
            config,
            node_pool,
            instances: Vec::new(),
        }
    }

    pub fn update_config(&mut self, config: ServiceConfig, node_pool: Arc<NodePool>) {
        self.config = config;
        self.node_pool = node_pool;
    }

    pub fn node_pool(&self) -> Arc<NodePool> {
        Arc::clone(&self.node_pool)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceInstance> {
        self.instances.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServiceInstance> {
        self.instances.iter_mut()
    }

    pub fn get(&self, number: u32) -> Option<&ServiceInstance> {
        self.instances.iter().find(|i| i.instance_number == number)
    }

    pub fn get_mut(&mut self, number: u32) -> Option<&mut ServiceInstance> {
        self.instances.iter_mut().find(|i| i.instance_number == number)
    }

    /// How many numbers below the configured count have no instance.
    pub fn missing(&self) -> usize {
        (0..self.config.count)
            .filter(|n| self.get(*n).is_none())
            .count()
    }

    pub fn count(&self) -> u32 {
        self.config.count
    }

    /// Smallest unused number below the configured count.
    pub fn next_instance_number(&self) -> Option<u32> {
        (0..self.config.count).find(|n| self.get(*n).is_none())
    }

    /// Create an instance for every free number below the count. Returns
    /// the new numbers; they still have to be started.
    pub fn create_missing(&mut self, rt: &mut Runtime) -> Result<Vec<u32>> {
        let mut created = Vec::new();
        while self.missing() > 0 {
            let Some(number) = self.next_instance_number() else {
                break;
            };
            let node = node_selector(&self.node_pool, None);
            let instance = ServiceInstance::create(&self.config, number, node, rt.now())?;
            instance.create_tasks(rt);
            info!(instance = %instance.id(), host = instance.node().hostname(), "instance created");
            self.instances.push(instance);
            created.push(number);
        }
        self.sort();
        Ok(created)
    }

    /// Evict instances in `state` so their numbers can be reused.
    fn clear(&mut self, rt: &mut Runtime, state: InstanceState) -> Vec<u32> {
        let mut cleared = Vec::new();
        self.instances.retain(|i| {
            if i.state() != state {
                return true;
            }
            for address in i.addresses() {
                rt.bus.forget(&address);
            }
            cleared.push(i.instance_number);
            false
        });
        cleared
    }

    pub fn clear_failed(&mut self, rt: &mut Runtime) -> Vec<u32> {
        self.clear(rt, InstanceState::Failed)
    }

    pub fn clear_down(&mut self, rt: &mut Runtime) -> Vec<u32> {
        self.clear(rt, InstanceState::Down)
    }

    /// Evict DOWN instances numbered at or above the count. They were
    /// stopped by a shrink and have no slot to come back to.
    pub fn clear_excess(&mut self, rt: &mut Runtime) -> Vec<u32> {
        let count = self.config.count;
        let mut cleared = Vec::new();
        self.instances.retain(|i| {
            if i.instance_number < count || i.state() != InstanceState::Down {
                return true;
            }
            for address in i.addresses() {
                rt.bus.forget(&address);
            }
            cleared.push(i.instance_number);
            false
        });
        if !cleared.is_empty() {
            info!(service = %self.config.name, instances = ?cleared, "excess instances removed");
        }
        cleared
    }

    /// Instances numbered at or above the count.
    pub fn excess_mut(&mut self) -> impl Iterator<Item = &mut ServiceInstance> {
        let count = self.config.count;
        self.instances
            .iter_mut()
            .filter(move |i| i.instance_number >= count)
    }

    /// Rebuild instances from records, re-resolving each node by hostname.
    /// Returns the restored numbers.
    pub fn restore_state(&mut self, rt: &mut Runtime, records: &[InstanceRecord]) -> Result<Vec<u32>> {
        let mut restored = Vec::new();
        for record in records {
            if self.get(record.instance_number).is_some() {
                warn!(service = %self.config.name, instance = record.instance_number, "duplicate instance record");
                continue;
            }
            let node = node_selector(&self.node_pool, Some(record.node.as_str()));
            let instance = ServiceInstance::restore(&self.config, record, node, rt.now())?;
            instance.create_tasks(rt);
            self.instances.push(instance);
            restored.push(record.instance_number);
        }
        self.sort();
        Ok(restored)
    }

    /// Whether every instance is in `state`. False when there are none.
    pub fn all(&self, state: InstanceState) -> bool {
        !self.instances.is_empty() && self.instances.iter().all(|i| i.state() == state)
    }

    pub fn any(&self, state: InstanceState) -> bool {
        self.instances.iter().any(|i| i.state() == state)
    }

    pub fn state_data(&self) -> Vec<InstanceRecord> {
        self.instances.iter().map(ServiceInstance::state_data).collect()
    }

    fn sort(&mut self) {
        self.instances.sort_by_key(|i| i.instance_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{Address, Observable};
    use crate::testing::{store_with, t0};

    fn config(count: u32) -> ServiceConfig {
        ServiceConfig {
            name: "web".into(),
            node: "batch".into(),
            count,
            command: "start".into(),
            pid_file: "/tmp/{name}-{instance_number}.pid".into(),
            monitor_interval: 20,
            enabled: true,
        }
    }

    fn collection(count: u32) -> (ServiceInstanceCollection, Runtime) {
        let (store, _) = store_with(&["h1", "h2"]);
        let pool = store.get("batch").unwrap();
        let (rt, _rx) = Runtime::new(t0());
        (ServiceInstanceCollection::new(config(count), pool), rt)
    }

    #[test]
    fn create_missing_fills_smallest_numbers_and_is_idempotent() {
        let (mut c, mut rt) = collection(3);
        assert_eq!(c.create_missing(&mut rt).unwrap(), [0, 1, 2]);
        assert!(c.create_missing(&mut rt).unwrap().is_empty());
        assert_eq!(c.missing(), 0);
        assert_eq!(c.next_instance_number(), None);

        let hosts: Vec<&str> = c.iter().map(|i| i.node().hostname()).collect();
        assert_eq!(hosts, ["h1", "h2", "h1"]);
    }

    #[test]
    fn failed_instances_are_cleared_and_recreated() {
        let (mut c, mut rt) = collection(3);
        c.create_missing(&mut rt).unwrap();
        // instance 1 is forced down
        let inst = c.get_mut(1).unwrap();
        inst.zap(&mut rt);
        assert_eq!(c.clear_down(&mut rt), [1]);
        assert_eq!(c.next_instance_number(), Some(1));
        assert!(rt
            .bus
            .watchers_of(&Address::Task {
                service: "web".into(),
                instance: 1,
                kind: crate::observer::TaskKind::Start
            })
            .is_empty());
        assert_eq!(c.create_missing(&mut rt).unwrap(), [1]);
        let numbers: Vec<u32> = c.iter().map(|i| i.instance_number).collect();
        assert_eq!(numbers, [0, 1, 2]);
        assert!(c.clear_failed(&mut rt).is_empty());
    }

    #[test]
    fn restore_resolves_nodes_by_hostname() {
        let (mut c, mut rt) = collection(2);
        let records = vec![
            InstanceRecord {
                instance_number: 1,
                node: "h2".into(),
            },
            InstanceRecord {
                instance_number: 0,
                node: "h2".into(),
            },
        ];
        assert_eq!(c.restore_state(&mut rt, &records).unwrap(), [1, 0]);
        assert!(c.all(InstanceState::Unknown));
        assert_eq!(c.get(0).unwrap().node().hostname(), "h2");
        let mut expected = records.clone();
        expected.reverse();
        assert_eq!(c.state_data(), expected);
        assert_eq!(c.get(1).unwrap().address(), Address::Instance {
            service: "web".into(),
            instance: 1
        });
    }

    #[test]
    fn missing_counts_free_numbers_below_count() {
        let (mut c, mut rt) = collection(2);
        let records = vec![
            InstanceRecord {
                instance_number: 0,
                node: "h1".into(),
            },
            InstanceRecord {
                instance_number: 3,
                node: "h1".into(),
            },
        ];
        c.restore_state(&mut rt, &records).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c.missing(), 1);
        assert_eq!(c.create_missing(&mut rt).unwrap(), [1]);
        assert_eq!(c.missing(), 0);

        // 3 is above the count but only leaves once it is down
        assert!(c.clear_excess(&mut rt).is_empty());
        c.get_mut(3).unwrap().zap(&mut rt);
        assert_eq!(c.clear_excess(&mut rt), [3]);
        let numbers: Vec<u32> = c.iter().map(|i| i.instance_number).collect();
        assert_eq!(numbers, [0, 1]);
    }

    #[test]
    fn all_is_false_when_empty() {
        let (c, _) = collection(2);
        assert!(!c.all(InstanceState::Up));
        assert_eq!(c.missing(), 2);
    }
}
