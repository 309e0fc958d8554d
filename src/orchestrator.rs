use crate::cloud::autoscaling::{ASGControl, AutoscalingClient};
use crate::cloud::ec2::{Ec2Client, InstanceQuery};
use crate::component::Component;
use crate::config::Config;
use crate::errors::RollerError;
use crate::events::{EventDetails, Stage};
use crate::instance::Instance;
use crate::kubernetes::{DeploymentScaler, NodeControl};
use crate::replacement_finder::ReplacementFinder;
use crate::run_state::{ComponentRun, RunState};
use crate::strategy::{TerminateThenVerify, VerifyThenTerminate};
use std::sync::mpsc;
use uuid::Uuid;

pub(crate) const AUTOSCALER_NAMESPACE: &str = "kube-system";
pub(crate) const AUTOSCALER_DEPLOYMENT: &str = "cluster-autoscaler";
const TERMINATOR_NAMESPACE: &str = "kube-system";
const TERMINATOR_DEPLOYMENT: &str = "node-terminator";

/// Drives a single run: discovers per-component inventory, toggles the
/// autoscaler/terminator deployments, runs each targeted component's
/// strategy (gating `k8s-node` on every `k8s-master` task's completion),
/// and produces the final summary.
pub struct Orchestrator<'a, A: AutoscalingClient, C: Ec2Client> {
    pub config: &'a Config,
    pub asg_control: &'a ASGControl<A>,
    pub finder: &'a ReplacementFinder<C>,
    pub node_control: &'a NodeControl,
    pub deployment_scaler: &'a DeploymentScaler,
    pub execution_id: Uuid,
}

impl<'a, A: AutoscalingClient, C: Ec2Client> Orchestrator<'a, A, C> {
    pub fn run(&self) -> RunState {
        let inventory = self.discover_inventory();
        let run_state = RunState::new(inventory.values().flatten().cloned().collect());

        self.toggle_deployments(0, &run_state);

        std::thread::scope(|scope| {
            let master_done = if self.config.wants(Component::K8sMaster) {
                let (tx, rx) = mpsc::channel::<()>();
                if let Some(starting) = inventory.get(&Component::K8sMaster).cloned() {
                    let run_state = &run_state;
                    scope.spawn(move || {
                        let run = self.run_master_or_etcd(Component::K8sMaster, starting);
                        run_state.record(run);
                        let _ = tx.send(());
                    });
                } else {
                    let _ = tx.send(());
                }
                Some(rx)
            } else {
                None
            };

            if self.config.wants(Component::Etcd) {
                if let Some(starting) = inventory.get(&Component::Etcd).cloned() {
                    let run_state = &run_state;
                    scope.spawn(move || {
                        let run = self.run_master_or_etcd(Component::Etcd, starting);
                        run_state.record(run);
                    });
                }
            }

            if self.config.wants(Component::K8sNode) {
                if let Some(starting) = inventory.get(&Component::K8sNode).cloned() {
                    let run_state = &run_state;
                    scope.spawn(move || {
                        if let Some(rx) = master_done {
                            let _ = rx.recv();
                        }
                        let run = self.run_node(starting);
                        run_state.record(run);
                    });
                }
            }
        });

        self.toggle_deployments(1, &run_state);
        run_state
    }

    fn discover_inventory(&self) -> std::collections::HashMap<Component, Vec<Instance>> {
        let mut inventory = std::collections::HashMap::new();
        for component in self.config.target_components.clone() {
            match self.finder.list_component_instances(component) {
                Ok(instances) => {
                    inventory.insert(component, instances);
                }
                Err(e) => {
                    tracing::error!(component = %component, error = %e, "failed to discover component inventory");
                }
            }
        }
        inventory
    }

    fn asg_names_for(instances: &[Instance]) -> Vec<String> {
        InstanceQuery::<C>::unique_tag_values("aws:autoscaling:groupName", instances)
            .into_iter()
            .filter(|name| !name.is_empty())
            .collect()
    }

    fn run_master_or_etcd(&self, component: Component, starting_instances: Vec<Instance>) -> ComponentRun {
        let asg_names = Self::asg_names_for(&starting_instances);
        let event_details = EventDetails::for_component(self.execution_id, component, Stage::Replacing);

        let strategy = TerminateThenVerify {
            asg_control: self.asg_control,
            finder: self.finder,
        };

        let run = ComponentRun::start(component, starting_instances.clone(), asg_names.clone());
        match strategy.run(component, &starting_instances, &asg_names, event_details) {
            Ok(()) => run.finish_ok(),
            Err(e) => run.finish_err(e.to_string()),
        }
    }

    fn run_node(&self, starting_instances: Vec<Instance>) -> ComponentRun {
        let asg_names = Self::asg_names_for(&starting_instances);
        let event_details = EventDetails::for_component(self.execution_id, Component::K8sNode, Stage::Replacing);

        let strategy = VerifyThenTerminate::new(
            self.asg_control,
            self.finder,
            self.node_control,
            self.deployment_scaler,
            self.config.termination_batch_nodes_size,
            self.config.termination_wait_period,
        );

        let run = ComponentRun::start(Component::K8sNode, starting_instances.clone(), asg_names.clone());
        match strategy.run(Component::K8sNode, &starting_instances, &asg_names, event_details) {
            Ok(()) => run.finish_ok(),
            Err(e) => run.finish_err(e.to_string()),
        }
    }

    /// Scales the autoscaler and terminator deployments; only attempted
    /// when `k8s-node` is targeted. A toggle failure is logged and marks
    /// the run state but never aborts the replacement work itself.
    fn toggle_deployments(&self, replicas: i32, run_state: &RunState) {
        if !self.config.wants(Component::K8sNode) {
            return;
        }

        let mut ok = true;
        if let Err(e) = self.deployment_scaler.set_replicas(AUTOSCALER_NAMESPACE, AUTOSCALER_DEPLOYMENT, replicas) {
            tracing::warn!(error = %e, "failed to toggle cluster-autoscaler deployment");
            ok = false;
        }
        if let Err(e) = self.deployment_scaler.set_replicas(TERMINATOR_NAMESPACE, TERMINATOR_DEPLOYMENT, replicas) {
            tracing::warn!(error = %e, "failed to toggle node-terminator deployment");
            ok = false;
        }

        // AND against any earlier toggle call so a failure on either the
        // disable or the restore step sticks for the rest of the run.
        *run_state.autoscaler_toggled.lock().unwrap() &= ok;
        *run_state.terminator_toggled.lock().unwrap() &= ok;
    }
}

/// Renders the final per-component status report posted to the
/// notification sink.
pub fn summarize(run_state: &RunState) -> String {
    let mut lines = vec![format!("cluster-roller run started {}", run_state.global_start)];

    for run in run_state.snapshot() {
        let status = if run.success { "success" } else { "failure" };
        lines.push(format!(
            "{}: {status} ({}s){}",
            run.component,
            run.duration().num_seconds(),
            run.last_error.map(|e| format!(" - {e}")).unwrap_or_default(),
        ));
    }

    lines.push(format!(
        "autoscaler toggled: {}, terminator toggled: {}",
        *run_state.autoscaler_toggled.lock().unwrap(),
        *run_state.terminator_toggled.lock().unwrap(),
    ));

    lines.join("\n")
}

/// Overall process exit status: zero only when every ComponentRun
/// succeeded and no deployment toggle failed.
pub fn overall_success(run_state: &RunState) -> bool {
    run_state.snapshot().iter().all(|r| r.success)
        && *run_state.autoscaler_toggled.lock().unwrap()
        && *run_state.terminator_toggled.lock().unwrap()
}

