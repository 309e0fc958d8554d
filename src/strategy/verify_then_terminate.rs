use crate::cloud::autoscaling::{ASGControl, AutoscalingClient, ScalingProcess};
use crate::cloud::ec2::Ec2Client;
use crate::component::Component;
use crate::errors::RollerError;
use crate::events::EventDetails;
use crate::instance::Instance;
use crate::kubernetes::{DeploymentScaler, NodeControl};
use crate::orchestrator::{AUTOSCALER_DEPLOYMENT, AUTOSCALER_NAMESPACE};
use crate::replacement_finder::ReplacementFinder;
use chrono::Utc;
use std::time::Duration;

const DEFAULT_TAIL_THRESHOLD: usize = 10;
const DEFAULT_QUIESCENCE: Duration = Duration::from_secs(60);
const DEFAULT_RECONCILE_POLL: Duration = Duration::from_secs(30);
const DEFAULT_RECONCILE_ITERATIONS: u32 = 30;

/// Large-batch rolling replacement via capacity doubling: scale every ASG
/// out to twice its starting size in steps, verify the new instances, then
/// cordon/drain/terminate the old ones in a single cut-over. Used for
/// `k8s-node`.
pub struct VerifyThenTerminate<'a, A: AutoscalingClient, C: Ec2Client> {
    pub asg_control: &'a ASGControl<A>,
    pub finder: &'a ReplacementFinder<C>,
    pub node_control: &'a NodeControl,
    pub deployment_scaler: &'a DeploymentScaler,
    pub step_size: usize,
    pub tail_threshold: usize,
    pub termination_wait_period: Duration,
}

impl<'a, A: AutoscalingClient, C: Ec2Client> VerifyThenTerminate<'a, A, C> {
    pub fn new(
        asg_control: &'a ASGControl<A>,
        finder: &'a ReplacementFinder<C>,
        node_control: &'a NodeControl,
        deployment_scaler: &'a DeploymentScaler,
        step_size: usize,
        termination_wait_period: Duration,
    ) -> Self {
        VerifyThenTerminate {
            asg_control,
            finder,
            node_control,
            deployment_scaler,
            step_size,
            tail_threshold: DEFAULT_TAIL_THRESHOLD,
            termination_wait_period,
        }
    }

    pub fn run(
        &self,
        component: Component,
        starting_instances: &[Instance],
        asg_names: &[String],
        event_details: EventDetails,
    ) -> Result<(), Box<RollerError>> {
        let starting_desired = self.read_uniform_desired_capacity(asg_names, starting_instances.len(), event_details.clone())?;

        let suspend = [ScalingProcess::AZRebalance, ScalingProcess::Terminate];
        let resume = [ScalingProcess::AZRebalance, ScalingProcess::Terminate, ScalingProcess::Launch];

        // Guard is built before `suspend_many` runs so an ASG that fails
        // partway through suspension is still resumed.
        let asg_names_owned = asg_names.to_vec();
        let resume_owned = resume.to_vec();
        let _guard = scopeguard::guard((), |_| {
            self.asg_control.resume_many(&asg_names_owned, &resume_owned);
        });

        self.asg_control
            .suspend_many(asg_names, &suspend)
            .map_err(|e| RollerError::upstream(event_details.clone(), e))?;

        self.scale_out_then_cut_over(component, starting_instances, asg_names, starting_desired, event_details)
    }

    fn read_uniform_desired_capacity(
        &self,
        asg_names: &[String],
        starting_count: usize,
        event_details: EventDetails,
    ) -> Result<i32, Box<RollerError>> {
        let mut desired = None;
        for asg in asg_names {
            let d = self
                .asg_control
                .get_desired_count(asg)
                .map_err(|e| RollerError::upstream(event_details.clone(), e))?;
            match desired {
                None => desired = Some(d),
                Some(existing) if existing != d => {
                    return Err(RollerError::consistency(
                        event_details,
                        format!("ASG {asg} desired capacity {d} disagrees with {existing} seen on an earlier ASG"),
                    ));
                }
                _ => {}
            }
        }

        let desired = desired.unwrap_or(0);
        if desired as usize != starting_count {
            return Err(RollerError::consistency(
                event_details,
                format!("starting instance count {starting_count} does not match ASG desired capacity {desired}"),
            ));
        }
        Ok(desired)
    }

    fn scale_out_then_cut_over(
        &self,
        component: Component,
        starting_instances: &[Instance],
        asg_names: &[String],
        starting_desired: i32,
        event_details: EventDetails,
    ) -> Result<(), Box<RollerError>> {
        let target = starting_desired * 2;
        let mut current = starting_desired;

        while current != target {
            if let Err(e) = self.deployment_scaler.set_replicas(AUTOSCALER_NAMESPACE, AUTOSCALER_DEPLOYMENT, 0) {
                tracing::warn!(error = %e, "failed to re-assert autoscaler disabled before a scale-out step");
            }

            let remaining = target - current;
            let (next_target, batch_size) = if (remaining as usize) < self.tail_threshold {
                (target, remaining as usize)
            } else {
                (current + self.step_size as i32, self.step_size)
            };

            let creation_time = Utc::now();
            for asg in asg_names {
                self.asg_control
                    .set_desired_count(asg, next_target)
                    .map_err(|e| RollerError::upstream(event_details.clone(), e))?;
            }

            let found = self.finder.find(component, creation_time, batch_size, event_details.clone())?;
            self.finder.verify_with_partial_retry(component, found, event_details.clone())?;

            current = next_target;
        }

        self.cut_over(starting_instances, asg_names, starting_desired, event_details)
    }

    fn cut_over(
        &self,
        starting_instances: &[Instance],
        asg_names: &[String],
        starting_desired: i32,
        event_details: EventDetails,
    ) -> Result<(), Box<RollerError>> {
        let ids: Vec<String> = starting_instances.iter().map(|i| i.id.clone()).collect();

        // Cordon/drain failures are logged, not propagated: the old
        // instances are about to be terminated regardless, and capacity
        // must still be restored on the way out.
        if let Err(e) = self.node_control.cordon(&ids, event_details.clone()) {
            tracing::warn!(error = %e, "failed to cordon nodes before cut-over");
        }
        if let Err(e) = self.node_control.drain(&ids, event_details.clone()) {
            tracing::warn!(error = %e, "failed to drain nodes before cut-over");
        }

        self.finder.sleep_for(DEFAULT_QUIESCENCE);

        self.asg_control
            .suspend_many(asg_names, &[ScalingProcess::Launch])
            .map_err(|e| RollerError::upstream(event_details.clone(), e))?;
        self.asg_control
            .resume_many(asg_names, &[ScalingProcess::Terminate]);

        for id in &ids {
            self.finder
                .terminate_instance(id)
                .map_err(|e| RollerError::upstream(event_details.clone(), e))?;
            self.finder.sleep_for(self.termination_wait_period);
        }

        for asg in asg_names {
            self.wait_for_instance_count(asg, starting_desired as usize, event_details.clone())?;
            self.asg_control
                .set_desired_count(asg, starting_desired)
                .map_err(|e| RollerError::upstream(event_details.clone(), e))?;
        }

        Ok(())
    }

    fn wait_for_instance_count(&self, asg: &str, target: usize, event_details: EventDetails) -> Result<(), Box<RollerError>> {
        for iteration in 0..DEFAULT_RECONCILE_ITERATIONS {
            let count = self
                .asg_control
                .get_instance_count(asg)
                .map_err(|e| RollerError::upstream(event_details.clone(), e))?;
            if count == target {
                return Ok(());
            }
            if iteration + 1 < DEFAULT_RECONCILE_ITERATIONS {
                self.finder.sleep_for(DEFAULT_RECONCILE_POLL);
            }
        }
        Err(RollerError::drain_timeout(
            event_details,
            format!("ASG {asg} did not reconcile to {target} instances within the drain budget"),
        ))
    }
}
