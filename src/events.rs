use crate::component::Component;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

/// Coarse phase of a component's replacement, attached to every log line and
/// error raised while that phase is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Startup,
    Preparing,
    Replacing,
    Finalizing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Startup => "startup",
            Stage::Preparing => "preparing",
            Stage::Replacing => "replacing",
            Stage::Finalizing => "finalizing",
        };
        f.write_str(s)
    }
}

/// Structured context carried by every engine error and every structured log
/// event so a single run's output can be correlated end to end.
#[derive(Debug, Clone)]
pub struct EventDetails {
    pub execution_id: Uuid,
    pub component: Option<Component>,
    pub stage: Stage,
    pub timestamp: DateTime<Utc>,
}

impl EventDetails {
    pub fn new(execution_id: Uuid, component: Option<Component>, stage: Stage) -> Self {
        EventDetails {
            execution_id,
            component,
            stage,
            timestamp: Utc::now(),
        }
    }

    pub fn for_component(execution_id: Uuid, component: Component, stage: Stage) -> Self {
        Self::new(execution_id, Some(component), stage)
    }

    pub fn startup(execution_id: Uuid) -> Self {
        Self::new(execution_id, None, Stage::Startup)
    }
}

impl fmt::Display for EventDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.component {
            Some(c) => write!(f, "[{}][component={c}][stage={}]", self.execution_id, self.stage),
            None => write!(f, "[{}][stage={}]", self.execution_id, self.stage),
        }
    }
}
