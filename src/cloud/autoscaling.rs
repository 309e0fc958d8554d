use crate::errors::CommandError;
use crate::runtime::block_on;
use aws_sdk_autoscaling::Client as AutoscalingSdkClient;
use std::fmt;

/// The subset of ASG scaling processes the engine ever suspends or resumes.
/// `AZRebalance` is suspended so the ASG doesn't fight the engine's own
/// terminations; `Terminate`/`Launch` are suspended around the cut-over
/// window in the verify-then-terminate strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingProcess {
    AZRebalance,
    Terminate,
    Launch,
}

impl ScalingProcess {
    fn as_str(&self) -> &'static str {
        match self {
            ScalingProcess::AZRebalance => "AZRebalance",
            ScalingProcess::Terminate => "Terminate",
            ScalingProcess::Launch => "Launch",
        }
    }
}

impl fmt::Display for ScalingProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendResumeAction {
    Suspend,
    Resume,
}

/// Thin collaborator boundary over the cloud's scaling-group API, mockable
/// for unit tests.
pub trait AutoscalingClient: Send + Sync {
    fn set_processes(
        &self,
        asg_name: &str,
        action: SuspendResumeAction,
        processes: &[ScalingProcess],
    ) -> Result<(), CommandError>;

    fn get_desired_count(&self, asg_name: &str) -> Result<i32, CommandError>;

    fn set_desired_count(&self, asg_name: &str, desired: i32) -> Result<(), CommandError>;

    fn get_instance_count(&self, asg_name: &str) -> Result<usize, CommandError>;
}

/// Real `AutoscalingClient` backed by `aws-sdk-autoscaling`.
pub struct AwsAutoscalingClient {
    sdk: AutoscalingSdkClient,
}

impl AwsAutoscalingClient {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        AwsAutoscalingClient {
            sdk: AutoscalingSdkClient::new(sdk_config),
        }
    }
}

impl AutoscalingClient for AwsAutoscalingClient {
    fn set_processes(
        &self,
        asg_name: &str,
        action: SuspendResumeAction,
        processes: &[ScalingProcess],
    ) -> Result<(), CommandError> {
        let names: Vec<String> = processes.iter().map(|p| p.to_string()).collect();
        block_on(async {
            match action {
                SuspendResumeAction::Suspend => {
                    self.sdk
                        .suspend_processes()
                        .auto_scaling_group_name(asg_name)
                        .set_scaling_processes(Some(names))
                        .send()
                        .await
                        .map_err(|e| {
                            CommandError::new(format!("suspend_processes({asg_name}) failed"), Some(e.to_string()))
                        })?;
                }
                SuspendResumeAction::Resume => {
                    self.sdk
                        .resume_processes()
                        .auto_scaling_group_name(asg_name)
                        .set_scaling_processes(Some(names))
                        .send()
                        .await
                        .map_err(|e| {
                            CommandError::new(format!("resume_processes({asg_name}) failed"), Some(e.to_string()))
                        })?;
                }
            }
            Ok(())
        })
    }

    fn get_desired_count(&self, asg_name: &str) -> Result<i32, CommandError> {
        block_on(async {
            let response = self
                .sdk
                .describe_auto_scaling_groups()
                .auto_scaling_group_names(asg_name)
                .send()
                .await
                .map_err(|e| {
                    CommandError::new(format!("describe_auto_scaling_groups({asg_name}) failed"), Some(e.to_string()))
                })?;

            response
                .auto_scaling_groups()
                .first()
                .map(|g| g.desired_capacity())
                .ok_or_else(|| CommandError::new_from_safe_message(format!("auto scaling group {asg_name} not found")))
        })
    }

    fn set_desired_count(&self, asg_name: &str, desired: i32) -> Result<(), CommandError> {
        block_on(async {
            self.sdk
                .set_desired_capacity()
                .auto_scaling_group_name(asg_name)
                .desired_capacity(desired)
                .honor_cooldown(false)
                .send()
                .await
                .map_err(|e| {
                    CommandError::new(format!("set_desired_capacity({asg_name}, {desired}) failed"), Some(e.to_string()))
                })?;
            Ok(())
        })
    }

    fn get_instance_count(&self, asg_name: &str) -> Result<usize, CommandError> {
        block_on(async {
            let response = self
                .sdk
                .describe_auto_scaling_groups()
                .auto_scaling_group_names(asg_name)
                .send()
                .await
                .map_err(|e| {
                    CommandError::new(format!("describe_auto_scaling_groups({asg_name}) failed"), Some(e.to_string()))
                })?;

            Ok(response
                .auto_scaling_groups()
                .first()
                .map(|g| g.instances().len())
                .unwrap_or(0))
        })
    }
}

/// The engine's single point of contact with a scaling group: suspend/resume
/// a fixed set of disruptive processes around a replacement window, and
/// read/adjust desired capacity for the scale-out strategy.
pub struct ASGControl<C: AutoscalingClient> {
    pub(crate) client: C,
}

impl<C: AutoscalingClient> ASGControl<C> {
    pub fn new(client: C) -> Self {
        ASGControl { client }
    }

    pub fn suspend(&self, asg_name: &str, processes: &[ScalingProcess]) -> Result<(), CommandError> {
        self.client.set_processes(asg_name, SuspendResumeAction::Suspend, processes)
    }

    pub fn resume(&self, asg_name: &str, processes: &[ScalingProcess]) -> Result<(), CommandError> {
        self.client.set_processes(asg_name, SuspendResumeAction::Resume, processes)
    }

    pub fn get_desired_count(&self, asg_name: &str) -> Result<i32, CommandError> {
        self.client.get_desired_count(asg_name)
    }

    pub fn set_desired_count(&self, asg_name: &str, desired: i32) -> Result<(), CommandError> {
        self.client.set_desired_count(asg_name, desired)
    }

    pub fn get_instance_count(&self, asg_name: &str) -> Result<usize, CommandError> {
        self.client.get_instance_count(asg_name)
    }

    pub fn suspend_many(&self, asg_names: &[String], processes: &[ScalingProcess]) -> Result<(), CommandError> {
        for asg in asg_names {
            self.suspend(asg, processes)?;
        }
        Ok(())
    }

    /// Best-effort: a failure to resume one ASG is logged and does not stop
    /// the rest from being attempted.
    pub fn resume_many(&self, asg_names: &[String], processes: &[ScalingProcess]) {
        for asg in asg_names {
            if let Err(e) = self.resume(asg, processes) {
                tracing::warn!(asg = asg.as_str(), error = %e, "failed to resume ASG processes");
            }
        }
    }

    /// Runs `action` with `suspend_processes` suspended on every named ASG,
    /// resuming `resume_processes` on every exit path including panics and
    /// early returns. The two process lists may differ (Strategy B suspends
    /// `{AZRebalance,Terminate}` up front but resumes `{AZRebalance,Terminate,Launch}`
    /// at task exit).
    pub fn with_many_suspended<T>(
        &self,
        asg_names: &[String],
        suspend_processes: &[ScalingProcess],
        resume_processes: &[ScalingProcess],
        action: impl FnOnce() -> Result<T, CommandError>,
    ) -> Result<T, CommandError> {
        // Guard is built before `suspend_many` runs, so an ASG that fails
        // partway through the suspend pass is still covered by the resume
        // pass below.
        let asg_names_owned = asg_names.to_vec();
        let resume_processes_owned = resume_processes.to_vec();
        let _guard = scopeguard::guard((), move |_| {
            self.resume_many(&asg_names_owned, &resume_processes_owned);
        });

        self.suspend_many(asg_names, suspend_processes)?;
        action()
    }
}
