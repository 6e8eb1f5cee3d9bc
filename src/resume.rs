//! Resume coordinator
//!
//! Collapses concurrent resume requests for one instance into a single
//! underlying resume. The map below is the only cross-request mutable state
//! in the proxy layer: insert-if-absent and delete-on-settle are both
//! performed under its lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::error::{Result, ServerboxError};
use crate::manager::InstanceManager;
use crate::types::{InstanceRecord, InstanceState};

/// A joinable in-flight resume. The error is shared across joiners.
type InFlightResume = Shared<BoxFuture<'static, std::result::Result<(), Arc<ServerboxError>>>>;

pub struct ResumeCoordinator {
    manager: Arc<InstanceManager>,
    inflight: Arc<Mutex<HashMap<String, InFlightResume>>>,
    auto_resume: bool,
    resume_timeout: Duration,
}

impl ResumeCoordinator {
    pub fn new(manager: Arc<InstanceManager>, auto_resume: bool, resume_timeout: Duration) -> Self {
        Self {
            manager,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            auto_resume,
            resume_timeout,
        }
    }

    /// Return a running record for `id`, resuming the instance if needed.
    ///
    /// At most one resume per id runs at a time in this process; late
    /// arrivals join the in-flight one. A waiter that times out does not
    /// cancel the underlying resume — a late completion remains effective
    /// for the next request.
    pub async fn ensure_running(&self, id: &str) -> Result<InstanceRecord> {
        let record = self.manager.get(id).await?;
        if record.state == InstanceState::Running {
            return Ok(record);
        }

        if !self.auto_resume {
            return Err(ServerboxError::InstanceNotRunning(id.to_string()));
        }

        let resume = self.join_or_spawn(id);
        match tokio::time::timeout(self.resume_timeout, resume).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(instance_id = %id, error = %e, "resume failed");
                return Err(ServerboxError::InstanceNotRunning(id.to_string()));
            }
            Err(_) => {
                tracing::warn!(
                    instance_id = %id,
                    timeout_ms = self.resume_timeout.as_millis() as u64,
                    "timed out waiting for resume"
                );
                return Err(ServerboxError::InstanceNotRunning(id.to_string()));
            }
        }

        let record = self.manager.get(id).await?;
        if record.state == InstanceState::Running {
            Ok(record)
        } else {
            Err(ServerboxError::InstanceNotRunning(id.to_string()))
        }
    }

    /// Join the in-flight resume for `id`, or start one.
    fn join_or_spawn(&self, id: &str) -> InFlightResume {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = inflight.get(id) {
            return existing.clone();
        }

        // The resume itself runs on a detached task so dropped waiters never
        // stall it.
        let manager = self.manager.clone();
        let task_id = id.to_string();
        let timeout = self.resume_timeout;
        let task = tokio::spawn(async move {
            manager
                .resume(&task_id, Some(timeout))
                .await
                .map(|_| ())
                .map_err(Arc::new)
        });

        let resume: InFlightResume = async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => Err(Arc::new(ServerboxError::InstanceNotRunning(format!(
                    "resume task aborted: {join_error}"
                )))),
            }
        }
        .boxed()
        .shared();

        inflight.insert(id.to_string(), resume.clone());

        // Settlement watcher: drives the shared future to completion even if
        // every waiter gives up, and clears the map slot when it settles.
        let watcher_map = self.inflight.clone();
        let watcher_id = id.to_string();
        let watched = resume.clone();
        tokio::spawn(async move {
            let _ = watched.await;
            watcher_map
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&watcher_id);
        });

        resume
    }
}
