use crate::cloud::autoscaling::{AutoscalingClient, ASGControl, ScalingProcess};
use crate::cloud::ec2::Ec2Client;
use crate::component::Component;
use crate::errors::RollerError;
use crate::events::EventDetails;
use crate::instance::Instance;
use crate::replacement_finder::ReplacementFinder;
use chrono::Utc;

/// Small-batch rolling replacement: terminate one instance, find and
/// verify exactly one replacement, repeat. Used for `k8s-master` and
/// `etcd`, whose ASGs are small enough that in-place churn is acceptable.
pub struct TerminateThenVerify<'a, A: AutoscalingClient, C: Ec2Client> {
    pub asg_control: &'a ASGControl<A>,
    pub finder: &'a ReplacementFinder<C>,
}

impl<'a, A: AutoscalingClient, C: Ec2Client> TerminateThenVerify<'a, A, C> {
    pub fn run(
        &self,
        component: Component,
        starting_instances: &[Instance],
        asg_names: &[String],
        event_details: EventDetails,
    ) -> Result<(), Box<RollerError>> {
        let suspend = [ScalingProcess::AZRebalance];

        // Guard is built before `suspend_many` runs so an ASG that fails
        // partway through suspension is still resumed.
        let asg_names_owned = asg_names.to_vec();
        let suspend_owned = suspend.to_vec();
        let _guard = scopeguard::guard((), |_| {
            self.asg_control.resume_many(&asg_names_owned, &suspend_owned);
        });

        self.asg_control
            .suspend_many(asg_names, &suspend)
            .map_err(|e| RollerError::upstream(event_details.clone(), e))?;

        self.guarded_roll(component, starting_instances, event_details)
    }

    fn guarded_roll(
        &self,
        component: Component,
        starting_instances: &[Instance],
        event_details: EventDetails,
    ) -> Result<(), Box<RollerError>> {
        if component == Component::Etcd {
            self.etcd_pre_check(starting_instances, event_details.clone())?;
        }
        self.roll(component, starting_instances, event_details)
    }

    fn roll(
        &self,
        component: Component,
        starting_instances: &[Instance],
        event_details: EventDetails,
    ) -> Result<(), Box<RollerError>> {
        for instance in starting_instances {
            let terminate_time = Utc::now();
            self.finder
                .terminate_instance(&instance.id)
                .map_err(|e| RollerError::upstream(event_details.clone(), e))?;

            let found = self.finder.find(component, terminate_time, 1, event_details.clone())?;
            self.finder.verify_with_partial_retry(component, found, event_details.clone())?;
        }
        Ok(())
    }

    /// `etcd`-only: every starting instance must carry `healthy=True` before
    /// any termination is issued, to preserve quorum.
    fn etcd_pre_check(&self, starting_instances: &[Instance], event_details: EventDetails) -> Result<(), Box<RollerError>> {
        for instance in starting_instances {
            let health = self
                .finder
                .get_instance_health(&instance.id)
                .map_err(|e| RollerError::upstream(event_details.clone(), e))?;
            if health != "True" {
                return Err(RollerError::health_prerequisite(
                    event_details,
                    format!("etcd instance {} is not healthy (healthy={health})", instance.id),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::autoscaling::SuspendResumeAction;
    use crate::cloud::ec2::{InstancePage, InstanceQuery};
    use crate::errors::CommandError;
    use crate::instance::Filter;
    use std::cell::RefCell;
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use uuid::Uuid;

    fn event_details() -> EventDetails {
        EventDetails::for_component(Uuid::nil(), Component::Etcd, crate::events::Stage::Replacing)
    }

    fn instance(id: &str) -> Instance {
        Instance::new(id, Utc::now(), BTreeMap::new())
    }

    struct FakeAutoscaling {
        suspended: RefCell<Vec<String>>,
        resumed: RefCell<Vec<String>>,
        fail_suspend_for: Option<&'static str>,
    }

    impl AutoscalingClient for FakeAutoscaling {
        fn set_processes(&self, asg_name: &str, action: SuspendResumeAction, _processes: &[ScalingProcess]) -> Result<(), CommandError> {
            match action {
                SuspendResumeAction::Suspend => {
                    if self.fail_suspend_for == Some(asg_name) {
                        return Err(CommandError::new_from_safe_message(format!("suspend failed for {asg_name}")));
                    }
                    self.suspended.borrow_mut().push(asg_name.to_string());
                }
                SuspendResumeAction::Resume => self.resumed.borrow_mut().push(asg_name.to_string()),
            }
            Ok(())
        }
        fn get_desired_count(&self, _asg_name: &str) -> Result<i32, CommandError> {
            Ok(0)
        }
        fn set_desired_count(&self, _asg_name: &str, _desired: i32) -> Result<(), CommandError> {
            Ok(())
        }
        fn get_instance_count(&self, _asg_name: &str) -> Result<usize, CommandError> {
            Ok(0)
        }
    }

    struct FakeEc2 {
        pages: RefCell<VecDeque<Vec<Instance>>>,
        health: RefCell<HashMap<String, &'static str>>,
    }

    impl Ec2Client for FakeEc2 {
        fn describe_instances_page(&self, _filters: &[Filter], _next_token: Option<&str>) -> Result<InstancePage, CommandError> {
            Ok(InstancePage {
                instances: self.pages.borrow_mut().pop_front().unwrap_or_default(),
                next_token: None,
            })
        }
        fn describe_tags(&self, filters: &[Filter]) -> Result<BTreeMap<String, String>, CommandError> {
            let id = filters.iter().find(|f| f.name == "resource-id").and_then(|f| f.values.first()).cloned().unwrap_or_default();
            let mut tags = BTreeMap::new();
            tags.insert("healthy".to_string(), self.health.borrow().get(id.as_str()).copied().unwrap_or("Unset").to_string());
            Ok(tags)
        }
        fn terminate_instance(&self, _id: &str) -> Result<(), CommandError> {
            Ok(())
        }
    }

    #[test]
    fn etcd_pre_check_rejects_when_any_instance_is_unhealthy() {
        let ec2 = FakeEc2 {
            pages: RefCell::new(VecDeque::new()),
            health: RefCell::new(HashMap::from([("i-1", "True"), ("i-2", "False")])),
        };
        let query = InstanceQuery::new(ec2, vec![], "NEW".to_string());
        let finder = ReplacementFinder::new(query);
        let autoscaling = FakeAutoscaling {
            suspended: RefCell::new(Vec::new()),
            resumed: RefCell::new(Vec::new()),
            fail_suspend_for: None,
        };
        let asg_control = ASGControl::new(autoscaling);

        let strategy = TerminateThenVerify {
            asg_control: &asg_control,
            finder: &finder,
        };

        let starting = vec![instance("i-1"), instance("i-2")];
        let err = strategy.etcd_pre_check(&starting, event_details()).unwrap_err();
        assert!(matches!(*err, RollerError::HealthPrerequisite { .. }));
    }

    #[test]
    fn az_rebalance_is_always_resumed_even_when_pre_check_fails() {
        let ec2 = FakeEc2 {
            pages: RefCell::new(VecDeque::new()),
            health: RefCell::new(HashMap::from([("i-1", "False")])),
        };
        let query = InstanceQuery::new(ec2, vec![], "NEW".to_string());
        let finder = ReplacementFinder::new(query);
        let autoscaling = FakeAutoscaling {
            suspended: RefCell::new(Vec::new()),
            resumed: RefCell::new(Vec::new()),
            fail_suspend_for: None,
        };
        let asg_control = ASGControl::new(autoscaling);
        let strategy = TerminateThenVerify {
            asg_control: &asg_control,
            finder: &finder,
        };

        let starting = vec![instance("i-1")];
        let asgs = vec!["asg-1".to_string()];
        let result = strategy.run(Component::Etcd, &starting, &asgs, event_details());
        assert!(result.is_err());
        assert_eq!(asg_control.client.resumed.borrow().len(), 1);
    }

    #[test]
    fn every_asg_is_resumed_even_when_suspend_fails_partway_through() {
        let ec2 = FakeEc2 {
            pages: RefCell::new(VecDeque::new()),
            health: RefCell::new(HashMap::new()),
        };
        let query = InstanceQuery::new(ec2, vec![], "NEW".to_string());
        let finder = ReplacementFinder::new(query);
        let autoscaling = FakeAutoscaling {
            suspended: RefCell::new(Vec::new()),
            resumed: RefCell::new(Vec::new()),
            fail_suspend_for: Some("asg-2"),
        };
        let asg_control = ASGControl::new(autoscaling);
        let strategy = TerminateThenVerify {
            asg_control: &asg_control,
            finder: &finder,
        };

        let asgs = vec!["asg-1".to_string(), "asg-2".to_string(), "asg-3".to_string()];
        let result = strategy.run(Component::K8sMaster, &[], &asgs, event_details());
        assert!(result.is_err());
        assert_eq!(asg_control.client.suspended.borrow().len(), 1);
        assert_eq!(asg_control.client.resumed.borrow().len(), 3);
    }
}
