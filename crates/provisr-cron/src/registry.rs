//! Registry of named cronjobs - the management surface

use parking_lot::RwLock;
use provisr_core::{Error, Result};
use provisr_events::SinkSet;
use provisr_manager::Manager;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use crate::cronjob::{CronJob, CronJobSpec, CronJobStatus};

/// Owns every registered cronjob; reads return snapshots, writes are
/// serialized by the registry lock.
pub struct CronRegistry {
    manager: Manager,
    sinks: SinkSet,
    cronjobs: RwLock<HashMap<String, CronJob>>,
}

impl CronRegistry {
    pub fn new(manager: Manager, sinks: SinkSet) -> Self {
        Self {
            manager,
            sinks,
            cronjobs: RwLock::new(HashMap::new()),
        }
    }

    /// Create and schedule a cronjob; duplicate names are an error
    pub fn create(&self, spec: CronJobSpec) -> Result<CronJob> {
        let name = spec.name.clone();
        let cronjob = CronJob::new(spec, self.manager.clone(), self.sinks.clone())?;
        {
            let mut cronjobs = self.cronjobs.write();
            if cronjobs.contains_key(&name) {
                return Err(Error::CronJobExists(name));
            }
            cronjobs.insert(name.clone(), cronjob.clone());
        }
        cronjob.start()?;
        info!("CronJob '{}' created", name);
        Ok(cronjob)
    }

    pub fn get(&self, name: &str) -> Option<CronJob> {
        self.cronjobs.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<CronJob> {
        let mut cronjobs: Vec<CronJob> = self.cronjobs.read().values().cloned().collect();
        cronjobs.sort_by(|a, b| a.name().cmp(b.name()));
        cronjobs
    }

    /// Replace an existing cronjob: the old one is stopped, the new
    /// spec is constructed and scheduled under the same name.
    pub async fn update(&self, spec: CronJobSpec) -> Result<CronJob> {
        let name = spec.name.clone();
        let old = self
            .get(&name)
            .ok_or_else(|| Error::CronJobNotFound(name.clone()))?;

        let new = CronJob::new(spec, self.manager.clone(), self.sinks.clone())?;
        old.stop(Duration::from_secs(3)).await;
        self.cronjobs.write().insert(name.clone(), new.clone());
        new.start()?;
        info!("CronJob '{}' updated", name);
        Ok(new)
    }

    pub fn suspend(&self, name: &str) -> Result<()> {
        let cronjob = self
            .get(name)
            .ok_or_else(|| Error::CronJobNotFound(name.to_string()))?;
        cronjob.suspend();
        Ok(())
    }

    pub fn resume(&self, name: &str) -> Result<()> {
        let cronjob = self
            .get(name)
            .ok_or_else(|| Error::CronJobNotFound(name.to_string()))?;
        cronjob.resume()
    }

    /// Stop and forget a cronjob
    pub async fn delete(&self, name: &str, wait: Duration) -> Result<()> {
        let cronjob = self
            .cronjobs
            .write()
            .remove(name)
            .ok_or_else(|| Error::CronJobNotFound(name.to_string()))?;
        cronjob.stop(wait).await;
        info!("CronJob '{}' deleted", name);
        Ok(())
    }

    pub fn status(&self, name: &str) -> Result<CronJobStatus> {
        let cronjob = self
            .get(name)
            .ok_or_else(|| Error::CronJobNotFound(name.to_string()))?;
        Ok(cronjob.status())
    }

    /// Stop every cronjob; the registry stays usable but empty
    pub async fn shutdown(&self, wait: Duration) {
        info!("CronRegistry shutting down");
        let cronjobs: Vec<CronJob> = self.cronjobs.write().drain().map(|(_, c)| c).collect();
        for cronjob in cronjobs {
            cronjob.stop(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;

    fn registry() -> CronRegistry {
        CronRegistry::new(Manager::new(SinkSet::new()), SinkSet::new())
    }

    fn spec(name: &str) -> CronJobSpec {
        CronJobSpec::new(name, "@every 1h", JobSpec::new("t", "true"))
    }

    #[tokio::test]
    async fn test_create_get_list() {
        let reg = registry();
        reg.create(spec("beta")).unwrap();
        reg.create(spec("alpha")).unwrap();

        assert!(reg.get("alpha").is_some());
        assert!(reg.get("missing").is_none());

        let names: Vec<_> = reg.list().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        reg.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_duplicate_name_errors() {
        let reg = registry();
        reg.create(spec("only")).unwrap();
        assert!(matches!(reg.create(spec("only")), Err(Error::CronJobExists(_))));
        reg.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_invalid_schedule_rejected_before_insert() {
        let reg = registry();
        let mut bad = spec("bad");
        bad.schedule = "whenever".to_string();
        assert!(reg.create(bad).is_err());
        assert!(reg.get("bad").is_none());
    }

    #[tokio::test]
    async fn test_update_replaces() {
        let reg = registry();
        reg.create(spec("job")).unwrap();

        let mut updated = spec("job");
        updated.schedule = "@every 30m".to_string();
        reg.update(updated).await.unwrap();

        let current = reg.get("job").unwrap();
        assert_eq!(current.spec().schedule, "@every 30m");
        assert!(current.is_scheduled());

        reg.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_update_unknown_errors() {
        let reg = registry();
        assert!(matches!(
            reg.update(spec("ghost")).await,
            Err(Error::CronJobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_suspend_resume_via_registry() {
        let reg = registry();
        reg.create(spec("job")).unwrap();

        reg.suspend("job").unwrap();
        assert!(reg.get("job").unwrap().is_suspended());

        reg.resume("job").unwrap();
        assert!(reg.get("job").unwrap().is_scheduled());

        assert!(reg.suspend("ghost").is_err());
        assert!(reg.resume("ghost").is_err());

        reg.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_delete() {
        let reg = registry();
        reg.create(spec("job")).unwrap();
        reg.delete("job", Duration::from_millis(100)).await.unwrap();
        assert!(reg.get("job").is_none());
        assert!(reg.delete("job", Duration::from_millis(100)).await.is_err());
    }

    #[tokio::test]
    async fn test_status() {
        let reg = registry();
        reg.create(spec("job")).unwrap();
        let status = reg.status("job").unwrap();
        assert!(status.active.is_empty());
        assert!(reg.status("ghost").is_err());
        reg.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_shutdown_empties_registry() {
        let reg = registry();
        reg.create(spec("a")).unwrap();
        reg.create(spec("b")).unwrap();
        reg.shutdown(Duration::from_millis(100)).await;
        assert!(reg.list().is_empty());
    }
}
