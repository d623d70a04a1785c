//! Leader election seam.
//!
//! The topology manager registers one [`SingletonService`] per device with
//! an [`ElectionProvider`]; the provider calls back `become_leader` on at
//! most one node per service group and `become_follower` on the others.
//!
//! [`InProcessElection`] is a stand-in provider for nodes sharing a process:
//! per group the earliest registered node leads until it deregisters or
//! leadership is transferred explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ElectionError;

/// A service that runs in leader mode on exactly one node.
#[async_trait]
pub trait SingletonService: Send + Sync + 'static {
    /// Election group; one leader per group cluster-wide.
    fn group(&self) -> String;

    async fn become_leader(&self);

    async fn become_follower(&self);
}

/// Handle returned by a successful registration.
pub trait ElectionRegistration: Send + Sync {
    /// Leave the group. Leadership passes to another candidate, if any.
    fn close(&self) -> Result<(), ElectionError>;
}

pub trait ElectionProvider: Send + Sync {
    /// Cluster address of the local node.
    fn local_address(&self) -> &str;

    fn register(
        &self,
        service: Arc<dyn SingletonService>,
    ) -> Result<Box<dyn ElectionRegistration>, ElectionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleCommand {
    Lead,
    Follow,
}

struct Candidate {
    id: u64,
    address: String,
    commands: mpsc::UnboundedSender<RoleCommand>,
}

impl Candidate {
    fn send(&self, command: RoleCommand) {
        if self.commands.send(command).is_err() {
            debug!(address = %self.address, ?command, "role command dropped");
        }
    }
}

#[derive(Default)]
struct ElectionState {
    /// Candidates per group; the first one leads.
    groups: HashMap<String, Vec<Candidate>>,
    next_id: u64,
    fail_registrations: usize,
}

/// In-process election shared by every node of a simulated cluster.
#[derive(Clone)]
pub struct InProcessElection {
    address: String,
    state: Arc<Mutex<ElectionState>>,
}

impl InProcessElection {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            state: Arc::new(Mutex::new(ElectionState::default())),
        }
    }

    /// Another node taking part in the same elections.
    pub fn for_node(&self, address: &str) -> Self {
        Self {
            address: address.to_string(),
            state: Arc::clone(&self.state),
        }
    }

    /// Make the next `count` registrations fail, whichever node attempts them.
    pub fn set_fail_registrations(&self, count: usize) {
        self.state.lock().fail_registrations = count;
    }

    /// Current leader address of `group`.
    pub fn leader_of(&self, group: &str) -> Option<String> {
        self.state
            .lock()
            .groups
            .get(group)
            .and_then(|c| c.first())
            .map(|c| c.address.clone())
    }

    /// Move leadership of `group` to the candidate registered from `address`.
    ///
    /// Returns false when no such candidate exists or it already leads.
    pub fn transfer_leadership(&self, group: &str, address: &str) -> bool {
        let mut state = self.state.lock();
        let Some(candidates) = state.groups.get_mut(group) else {
            return false;
        };
        let Some(index) = candidates.iter().position(|c| c.address == address) else {
            return false;
        };
        if index == 0 {
            return false;
        }

        candidates[0].send(RoleCommand::Follow);
        let next = candidates.remove(index);
        next.send(RoleCommand::Lead);
        candidates.insert(0, next);
        info!(%group, leader = %address, "leadership transferred");
        true
    }
}

impl ElectionProvider for InProcessElection {
    fn local_address(&self) -> &str {
        &self.address
    }

    fn register(
        &self,
        service: Arc<dyn SingletonService>,
    ) -> Result<Box<dyn ElectionRegistration>, ElectionError> {
        let group = service.group();
        let mut state = self.state.lock();

        if state.fail_registrations > 0 {
            state.fail_registrations -= 1;
            warn!(%group, address = %self.address, "injected registration failure");
            return Err(ElectionError::Rejected(format!(
                "registration of {group} refused"
            )));
        }

        let candidates = state.groups.entry(group.clone()).or_default();
        if candidates.iter().any(|c| c.address == self.address) {
            return Err(ElectionError::AlreadyRegistered(group));
        }
        let leads = candidates.is_empty();

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    RoleCommand::Lead => service.become_leader().await,
                    RoleCommand::Follow => service.become_follower().await,
                }
            }
        });

        state.next_id += 1;
        let candidate = Candidate {
            id: state.next_id,
            address: self.address.clone(),
            commands: tx,
        };
        candidate.send(if leads {
            RoleCommand::Lead
        } else {
            RoleCommand::Follow
        });
        let id = candidate.id;
        state
            .groups
            .entry(group.clone())
            .or_default()
            .push(candidate);

        debug!(%group, address = %self.address, leads, "election registration accepted");
        Ok(Box::new(InProcessRegistration {
            group,
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

struct InProcessRegistration {
    group: String,
    id: u64,
    state: Arc<Mutex<ElectionState>>,
}

impl ElectionRegistration for InProcessRegistration {
    fn close(&self) -> Result<(), ElectionError> {
        let mut state = self.state.lock();
        let Some(candidates) = state.groups.get_mut(&self.group) else {
            return Ok(());
        };
        let Some(index) = candidates.iter().position(|c| c.id == self.id) else {
            return Ok(());
        };

        candidates.remove(index);
        if index == 0 {
            if let Some(next) = candidates.first() {
                info!(group = %self.group, leader = %next.address, "leadership handed over");
                next.send(RoleCommand::Lead);
            }
        }
        if candidates.is_empty() {
            state.groups.remove(&self.group);
        }
        Ok(())
    }
}
