//! Cluster topology as seen by the scheduler.
//!
//! Placement decisions only need three answers: who we are, whether we lead, and which
//! instances are eligible. Running without a topology is valid; placement restrictions
//! are then ignored.

use std::sync::{
    RwLock,
    atomic::{AtomicBool, Ordering},
};

pub trait Topology: Send + Sync {
    fn local_instance_id(&self) -> String;

    fn is_leader(&self) -> bool;

    /// Instances that may run scheduled work, in no particular order.
    fn eligible_instances(&self) -> Vec<String>;
}

/// A fixed topology that tests and single-process deployments can drive by hand.
#[derive(Debug)]
pub struct StaticTopology {
    local_id: String,
    leader: AtomicBool,
    instances: RwLock<Vec<String>>,
}

impl StaticTopology {
    pub fn new(local_id: impl Into<String>, instances: Vec<String>, leader: bool) -> Self {
        Self {
            local_id: local_id.into(),
            leader: AtomicBool::new(leader),
            instances: RwLock::new(instances),
        }
    }

    /// A cluster of one that leads itself.
    pub fn single(local_id: impl Into<String>) -> Self {
        let local_id = local_id.into();
        Self::new(local_id.clone(), vec![local_id], true)
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Release);
    }

    pub fn set_instances(&self, instances: Vec<String>) {
        match self.instances.write() {
            Ok(mut guard) => *guard = instances,
            Err(poisoned) => *poisoned.into_inner() = instances,
        }
    }
}

impl Topology for StaticTopology {
    fn local_instance_id(&self) -> String {
        self.local_id.clone()
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    fn eligible_instances(&self) -> Vec<String> {
        match self.instances.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
