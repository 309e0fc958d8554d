use crate::component::Component;
use crate::instance::Instance;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Mutable record of a single component's replacement task: created when
/// the task starts, updated only by its owning task, read by the
/// orchestrator only after the task has finished.
#[derive(Debug, Clone)]
pub struct ComponentRun {
    pub component: Component,
    pub start: DateTime<Utc>,
    pub finish: Option<DateTime<Utc>>,
    pub success: bool,
    pub starting_instances: Vec<Instance>,
    pub asg_names: Vec<String>,
    pub last_error: Option<String>,
}

impl ComponentRun {
    pub fn start(component: Component, starting_instances: Vec<Instance>, asg_names: Vec<String>) -> Self {
        ComponentRun {
            component,
            start: Utc::now(),
            finish: None,
            success: false,
            starting_instances,
            asg_names,
            last_error: None,
        }
    }

    pub fn finish_ok(mut self) -> Self {
        self.finish = Some(Utc::now());
        self.success = true;
        self
    }

    pub fn finish_err(mut self, message: String) -> Self {
        self.finish = Some(Utc::now());
        self.success = false;
        self.last_error = Some(message);
        self
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finish.unwrap_or_else(Utc::now) - self.start
    }
}

/// Process-wide state for a single run: append-only list of ComponentRuns
/// guarded by a single mutex, plus the flags recording whether the
/// autoscaler/terminator deployments were toggled off.
pub struct RunState {
    pub global_start: DateTime<Utc>,
    pub inventory: Vec<Instance>,
    runs: Mutex<Vec<ComponentRun>>,
    pub autoscaler_toggled: Mutex<bool>,
    pub terminator_toggled: Mutex<bool>,
}

impl RunState {
    /// `autoscaler_toggled`/`terminator_toggled` default to `true` (meaning
    /// "no toggle failure"), since a component set that never targets
    /// `k8s-node` never attempts either toggle and must not count as a
    /// failure on that basis alone.
    pub fn new(inventory: Vec<Instance>) -> Self {
        RunState {
            global_start: Utc::now(),
            inventory,
            runs: Mutex::new(Vec::new()),
            autoscaler_toggled: Mutex::new(true),
            terminator_toggled: Mutex::new(true),
        }
    }

    pub fn record(&self, run: ComponentRun) {
        self.runs.lock().unwrap().push(run);
    }

    /// Takes a point-in-time snapshot for summarizing; the orchestrator
    /// must not read `runs` directly while tasks may still be writing.
    pub fn snapshot(&self) -> Vec<ComponentRun> {
        self.runs.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_run_marks_success_and_finish_time_together() {
        let run = ComponentRun::start(Component::Etcd, vec![], vec!["asg-1".to_string()]);
        let run = run.finish_ok();
        assert!(run.success);
        assert!(run.finish.is_some());
    }

    #[test]
    fn component_run_records_the_failure_message() {
        let run = ComponentRun::start(Component::Etcd, vec![], vec![]);
        let run = run.finish_err("boom".to_string());
        assert!(!run.success);
        assert_eq!(run.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn run_state_snapshot_reflects_recorded_runs() {
        let state = RunState::new(vec![]);
        state.record(ComponentRun::start(Component::Etcd, vec![], vec![]).finish_ok());
        state.record(ComponentRun::start(Component::K8sMaster, vec![], vec![]).finish_ok());
        assert_eq!(state.snapshot().len(), 2);
    }
}
