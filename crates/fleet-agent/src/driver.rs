//! The agent driver seam.
//!
//! Wire protocols to hypervisor agents live behind [`AgentDriver`]. The
//! control plane only needs to send a command to a host and wait for the
//! answer.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use fleet_state::{HostId, VmId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Commands the control plane sends to a host agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    CheckHealth,
    StartVm { vm_id: VmId, name: String },
    StopVm { vm_id: VmId },
    MigrateVm { vm_id: VmId, destination: HostId },
    ExpungeVm { vm_id: VmId },
}

/// An agent's reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub success: bool,
    pub details: String,
}

impl Answer {
    pub fn ok() -> Self {
        Self {
            success: true,
            details: String::new(),
        }
    }

    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            success: false,
            details: details.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("host {0} unreachable")]
    Unreachable(HostId),

    #[error("command to host {0} timed out")]
    Timeout(HostId),
}

/// Sends commands to host agents.
pub trait AgentDriver: Send + Sync {
    fn send_command(
        &self,
        host_id: HostId,
        command: Command,
    ) -> BoxFuture<'_, Result<Answer, DriverError>>;
}

/// In-process driver used by tests and the daemon's `--simulate` mode.
///
/// Every host answers successfully unless marked down or given a scripted
/// failure.
#[derive(Default)]
pub struct SimulatedDriver {
    down: Mutex<HashSet<HostId>>,
    scripted: Mutex<HashMap<HostId, Vec<Answer>>>,
    sent: Mutex<Vec<(HostId, Command)>>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `host_id` unreachable (`false`) or reachable again (`true`).
    pub fn set_reachable(&self, host_id: HostId, reachable: bool) {
        let mut down = self.down.lock().unwrap_or_else(PoisonError::into_inner);
        if reachable {
            down.remove(&host_id);
        } else {
            down.insert(host_id);
        }
    }

    /// Queue an answer for the next command to `host_id`.
    pub fn script(&self, host_id: HostId, answer: Answer) {
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(host_id)
            .or_default()
            .push(answer);
    }

    /// Every command sent so far, in order.
    pub fn sent(&self) -> Vec<(HostId, Command)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn answer(&self, host_id: HostId, command: Command) -> Result<Answer, DriverError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((host_id, command.clone()));
        if self
            .down
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&host_id)
        {
            return Err(DriverError::Unreachable(host_id));
        }
        let scripted = {
            let mut scripted = self.scripted.lock().unwrap_or_else(PoisonError::into_inner);
            scripted
                .get_mut(&host_id)
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0))
        };
        let answer = scripted.unwrap_or_else(Answer::ok);
        debug!(host_id, ?command, success = answer.success, "simulated agent answered");
        Ok(answer)
    }
}

impl AgentDriver for SimulatedDriver {
    fn send_command(
        &self,
        host_id: HostId,
        command: Command,
    ) -> BoxFuture<'_, Result<Answer, DriverError>> {
        let result = self.answer(host_id, command);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answers_ok_by_default() {
        let driver = SimulatedDriver::new();
        let answer = driver.send_command(1, Command::CheckHealth).await.unwrap();
        assert!(answer.success);
        assert_eq!(driver.sent(), vec![(1, Command::CheckHealth)]);
    }

    #[tokio::test]
    async fn unreachable_hosts_error() {
        let driver = SimulatedDriver::new();
        driver.set_reachable(2, false);
        assert_eq!(
            driver.send_command(2, Command::CheckHealth).await,
            Err(DriverError::Unreachable(2))
        );
        driver.set_reachable(2, true);
        assert!(driver.send_command(2, Command::CheckHealth).await.is_ok());
    }

    #[tokio::test]
    async fn scripted_answers_are_consumed_in_order() {
        let driver = SimulatedDriver::new();
        driver.script(3, Answer::failed("disk full"));
        let first = driver
            .send_command(3, Command::StartVm { vm_id: 1, name: "vm-1".into() })
            .await
            .unwrap();
        assert_eq!(first, Answer::failed("disk full"));
        assert!(driver.send_command(3, Command::StopVm { vm_id: 1 }).await.unwrap().success);
    }
}
