use crate::cloud::ec2::{Ec2Client, InstanceQuery};
use crate::component::Component;
use crate::errors::RollerError;
use crate::events::EventDetails;
use crate::instance::Filter;
use crate::runtime::block_on;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ITERATIONS: u32 = 30;
const DEFAULT_TERMINATION_SLEEP: Duration = Duration::from_secs(30);
const MAX_PARTIAL_RETRIES: u8 = 2;

/// Polls for replacement instances and verifies their health, with the
/// partial-failure retry policy layered on top of plain verification.
/// Poll cadence is a field rather than a constant so tests can drive many
/// iterations without actually sleeping.
pub struct ReplacementFinder<C: Ec2Client> {
    query: InstanceQuery<C>,
    poll_interval: Duration,
    max_iterations: u32,
    termination_sleep: Duration,
    attempts: Mutex<HashMap<Component, u8>>,
}

impl<C: Ec2Client> ReplacementFinder<C> {
    pub fn new(query: InstanceQuery<C>) -> Self {
        ReplacementFinder {
            query,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            termination_sleep: DEFAULT_TERMINATION_SLEEP,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_polling(query: InstanceQuery<C>, poll_interval: Duration, max_iterations: u32, termination_sleep: Duration) -> Self {
        ReplacementFinder {
            query,
            poll_interval,
            max_iterations,
            termination_sleep,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn sleep(&self, duration: Duration) {
        block_on(tokio::time::sleep(duration));
    }

    /// Exposed so strategies can reuse the same sleep mechanism for their
    /// own fixed waits (drain quiescence, inter-termination delay) without
    /// each spinning up its own runtime bridge.
    pub fn sleep_for(&self, duration: Duration) {
        self.sleep(duration);
    }

    pub fn get_instance_health(&self, id: &str) -> Result<String, crate::errors::CommandError> {
        self.query.get_instance_health(id)
    }

    pub fn terminate_instance(&self, id: &str) -> Result<(), crate::errors::CommandError> {
        self.query.terminate_instance(id)
    }

    /// Lists the current instances tagged for `component`, used once at
    /// run start to build each ComponentRun's starting inventory.
    pub fn list_component_instances(&self, component: Component) -> Result<Vec<crate::instance::Instance>, crate::errors::CommandError> {
        self.query.list_by_filters(vec![Filter::tag("ServiceComponent", component.tag_value())])
    }

    /// Polls until `count` instances of `component` launched after
    /// `reference_time` have been seen, deduplicating across polls by id.
    pub fn find(
        &self,
        component: Component,
        reference_time: DateTime<Utc>,
        count: usize,
        event_details: EventDetails,
    ) -> Result<Vec<String>, Box<RollerError>> {
        let mut found: BTreeSet<String> = BTreeSet::new();

        for iteration in 0..self.max_iterations {
            let instances = self
                .query
                .list_by_filters(vec![Filter::tag("ServiceComponent", component.tag_value())])
                .map_err(|e| RollerError::upstream(event_details.clone(), e))?;

            for instance in instances {
                if instance.launch_time > reference_time {
                    found.insert(instance.id.clone());
                }
            }

            if found.len() >= count {
                break;
            }
            if iteration + 1 < self.max_iterations {
                self.sleep(self.poll_interval);
            }
        }

        if found.len() < count {
            return Err(RollerError::replacement_timeout(
                event_details,
                format!("found {}/{count} replacement instances for {component}", found.len()),
            ));
        }

        Ok(found.into_iter().take(count).collect())
    }

    /// Plain health verification with no retry: returns the set still
    /// pending when it gives up, alongside the pass/fail result.
    pub fn verify(
        &self,
        ids: Vec<String>,
        event_details: EventDetails,
    ) -> (Vec<String>, Result<(), Box<RollerError>>) {
        let starting_len = ids.len();
        let mut pending = ids;

        for iteration in 0..self.max_iterations {
            let mut still_pending = Vec::new();
            for id in &pending {
                match self.query.get_instance_health(id) {
                    Ok(health) if health == "True" => {}
                    Ok(_) => still_pending.push(id.clone()),
                    Err(e) => return (pending, Err(RollerError::upstream(event_details, e))),
                }
            }
            pending = still_pending;

            if pending.is_empty() {
                return (pending, Ok(()));
            }
            if iteration + 1 < self.max_iterations {
                self.sleep(self.poll_interval);
            }
        }

        let remaining = pending.len();
        let message = format!("{remaining} of {starting_len} instances still unhealthy after the verify budget");
        let err = RollerError::verify_timeout(event_details, message);
        (pending, Err(err))
    }

    /// Verifies `ids`, and on a timeout that qualifies under the
    /// partial-retry policy, terminates the still-unhealthy instances and
    /// recursively finds/verifies their replacements. Capped at two retry
    /// attempts per component, counted in a process-local table.
    pub fn verify_with_partial_retry(
        &self,
        component: Component,
        ids: Vec<String>,
        event_details: EventDetails,
    ) -> Result<(), Box<RollerError>> {
        let starting_len = ids.len();
        let (remaining, result) = self.verify(ids, event_details.clone());

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                let failed = remaining.len();
                if !Self::qualifies_for_retry(starting_len, failed) {
                    return Err(err);
                }

                if !self.reserve_retry_attempt(component) {
                    return Err(err);
                }

                for id in &remaining {
                    self.query
                        .terminate_instance(id)
                        .map_err(|e| RollerError::upstream(event_details.clone(), e))?;
                    self.sleep(self.termination_sleep);
                }

                let replacements = self.find(component, Utc::now(), failed, event_details.clone())?;
                self.verify_with_partial_retry(component, replacements, event_details)
            }
        }
    }

    fn qualifies_for_retry(starting: usize, failed: usize) -> bool {
        if starting > 2 {
            (failed as f64) / (starting as f64) <= 0.25
        } else {
            failed == 1
        }
    }

    fn reserve_retry_attempt(&self, component: Component) -> bool {
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(component).or_insert(0);
        if *count >= MAX_PARTIAL_RETRIES {
            return false;
        }
        *count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::ec2::InstancePage;
    use crate::instance::Instance;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::collections::VecDeque;
    use uuid::Uuid;

    fn event_details() -> EventDetails {
        EventDetails::for_component(Uuid::nil(), Component::Etcd, crate::events::Stage::Replacing)
    }

    fn instance(id: &str, launch_time: DateTime<Utc>) -> Instance {
        Instance::new(id, launch_time, BTreeMap::new())
    }

    struct ScriptedEc2Client {
        pages: RefCell<VecDeque<Vec<Instance>>>,
        health: RefCell<HashMap<String, VecDeque<&'static str>>>,
        terminated: RefCell<Vec<String>>,
    }

    impl ScriptedEc2Client {
        fn new() -> Self {
            ScriptedEc2Client {
                pages: RefCell::new(VecDeque::new()),
                health: RefCell::new(HashMap::new()),
                terminated: RefCell::new(Vec::new()),
            }
        }

        fn push_page(&self, instances: Vec<Instance>) {
            self.pages.borrow_mut().push_back(instances);
        }

        fn script_health(&self, id: &str, sequence: Vec<&'static str>) {
            self.health.borrow_mut().insert(id.to_string(), sequence.into());
        }
    }

    impl Ec2Client for ScriptedEc2Client {
        fn describe_instances_page(
            &self,
            _filters: &[Filter],
            _next_token: Option<&str>,
        ) -> Result<InstancePage, crate::errors::CommandError> {
            let instances = self.pages.borrow_mut().pop_front().unwrap_or_default();
            Ok(InstancePage {
                instances,
                next_token: None,
            })
        }

        fn describe_tags(&self, filters: &[Filter]) -> Result<BTreeMap<String, String>, crate::errors::CommandError> {
            let id = filters
                .iter()
                .find(|f| f.name == "resource-id")
                .and_then(|f| f.values.first())
                .cloned()
                .unwrap_or_default();
            let mut health = self.health.borrow_mut();
            let value = health.get_mut(&id).and_then(|seq| seq.pop_front()).unwrap_or("Unset");
            let mut tags = BTreeMap::new();
            tags.insert("healthy".to_string(), value.to_string());
            Ok(tags)
        }

        fn terminate_instance(&self, id: &str) -> Result<(), crate::errors::CommandError> {
            self.terminated.borrow_mut().push(id.to_string());
            Ok(())
        }
    }

    fn finder(client: ScriptedEc2Client) -> ReplacementFinder<ScriptedEc2Client> {
        let query = InstanceQuery::new(client, vec![], "v2".to_string());
        ReplacementFinder::with_polling(query, Duration::from_millis(0), 3, Duration::from_millis(0))
    }

    #[test]
    fn find_dedupes_across_polls_and_stops_at_count() {
        let client = ScriptedEc2Client::new();
        let t0 = Utc::now();
        client.push_page(vec![instance("i-1", t0 + chrono::Duration::seconds(1))]);
        client.push_page(vec![
            instance("i-1", t0 + chrono::Duration::seconds(1)),
            instance("i-2", t0 + chrono::Duration::seconds(2)),
        ]);
        let f = finder(client);
        let found = f.find(Component::Etcd, t0, 2, event_details()).unwrap();
        assert_eq!(found, vec!["i-1".to_string(), "i-2".to_string()]);
    }

    #[test]
    fn find_times_out_with_replacement_timeout() {
        let client = ScriptedEc2Client::new();
        let t0 = Utc::now();
        for _ in 0..3 {
            client.push_page(vec![]);
        }
        let f = finder(client);
        let err = f.find(Component::Etcd, t0, 1, event_details()).unwrap_err();
        assert!(matches!(*err, RollerError::ReplacementTimeout { .. }));
    }

    #[test]
    fn verify_succeeds_once_every_instance_reports_healthy() {
        let client = ScriptedEc2Client::new();
        client.script_health("i-1", vec!["True"]);
        let f = finder(client);
        let (remaining, result) = f.verify(vec!["i-1".to_string()], event_details());
        assert!(result.is_ok());
        assert!(remaining.is_empty());
    }

    #[test]
    fn verify_times_out_when_an_instance_never_turns_healthy() {
        let client = ScriptedEc2Client::new();
        client.script_health("i-1", vec!["False", "False", "False"]);
        let f = finder(client);
        let (remaining, result) = f.verify(vec!["i-1".to_string()], event_details());
        assert!(matches!(*result.unwrap_err(), RollerError::VerifyTimeout { .. }));
        assert_eq!(remaining, vec!["i-1".to_string()]);
    }

    #[test]
    fn partial_retry_qualifies_at_the_small_set_boundary() {
        assert!(ReplacementFinder::<ScriptedEc2Client>::qualifies_for_retry(2, 1));
        assert!(!ReplacementFinder::<ScriptedEc2Client>::qualifies_for_retry(2, 2));
    }

    #[test]
    fn partial_retry_qualifies_under_the_quarter_threshold() {
        assert!(ReplacementFinder::<ScriptedEc2Client>::qualifies_for_retry(8, 2));
        assert!(!ReplacementFinder::<ScriptedEc2Client>::qualifies_for_retry(8, 3));
    }

    #[test]
    fn retry_attempts_are_capped_at_two_per_component() {
        let client = ScriptedEc2Client::new();
        let f = finder(client);
        assert!(f.reserve_retry_attempt(Component::Etcd));
        assert!(f.reserve_retry_attempt(Component::Etcd));
        assert!(!f.reserve_retry_attempt(Component::Etcd));
    }

    #[test]
    fn retry_attempt_counters_are_tracked_independently_per_component() {
        let client = ScriptedEc2Client::new();
        let f = finder(client);
        assert!(f.reserve_retry_attempt(Component::Etcd));
        assert!(f.reserve_retry_attempt(Component::K8sMaster));
    }
}
