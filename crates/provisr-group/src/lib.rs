//! Provisr Process Groups
//!
//! A group starts a named set of specs as one unit: on the first member
//! failure everything started earlier in the call is stopped again, in
//! reverse order, so a failed group start leaves nothing running.

use provisr_core::constants::DEFAULT_STOP_WAIT;
use provisr_core::{validate_name, Error, GroupSpec, ProcessStatus, Result};
use provisr_manager::Manager;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// Group orchestrator over a shared manager
pub struct Group {
    manager: Manager,
}

impl Group {
    pub fn new(manager: Manager) -> Self {
        Self { manager }
    }

    /// Start every member in caller-supplied order, all-or-nothing.
    ///
    /// Members are not re-sorted by priority here; the caller's order is
    /// authoritative. On the first failure, members started by this call
    /// are stopped in reverse order and the error names the group and
    /// the failing member.
    pub async fn start(&self, gs: &GroupSpec) -> Result<()> {
        info!("Starting group '{}' ({} members)", gs.name, gs.members.len());
        let mut started: Vec<String> = Vec::new();

        for member in &gs.members {
            match self.manager.start(member.clone()).await {
                Ok(()) => started.push(member.name.clone()),
                Err(e) => {
                    warn!(
                        "Group '{}': member '{}' failed to start, rolling back {} member(s)",
                        gs.name,
                        member.name,
                        started.len()
                    );
                    for name in started.iter().rev() {
                        if let Err(stop_err) = self.manager.stop(name, DEFAULT_STOP_WAIT).await {
                            warn!("Group '{}': rollback stop of '{}' failed: {}", gs.name, name, stop_err);
                        }
                    }
                    return Err(Error::GroupStartFailed {
                        group: gs.name.clone(),
                        member: member.name.clone(),
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(())
    }

    /// Stop every member unconditionally.
    ///
    /// Keeps going past failures; the first error is returned after all
    /// members were attempted.
    pub async fn stop(&self, gs: &GroupSpec, wait: Duration) -> Result<()> {
        let mut first_err = None;
        for member in &gs.members {
            if let Err(e) = self.manager.stop(&member.name, wait).await {
                warn!("Group '{}': failed to stop '{}': {}", gs.name, member.name, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Map each member base name to its instance statuses.
    ///
    /// Unlike stop, a member whose status cannot be resolved aborts the
    /// whole call.
    pub fn status(&self, gs: &GroupSpec) -> Result<HashMap<String, Vec<ProcessStatus>>> {
        let mut map = HashMap::new();
        for member in &gs.members {
            if !validate_name(&member.name) {
                return Err(Error::invalid_spec(
                    member.name.clone(),
                    "member name is not a valid process name",
                ));
            }
            map.insert(member.name.clone(), self.manager.status_all(&member.name));
        }
        Ok(map)
    }
}
