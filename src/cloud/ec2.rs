use crate::errors::CommandError;
use crate::instance::{Filter, Instance};
use crate::runtime::block_on;
use aws_sdk_ec2::Client as Ec2SdkClient;
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;

/// One page of a `DescribeInstances`-style paged listing.
pub struct InstancePage {
    pub instances: Vec<Instance>,
    pub next_token: Option<String>,
}

/// Thin collaborator boundary over the cloud's instance API. Kept mockable
/// so `InstanceQuery` can be unit tested without a live account.
pub trait Ec2Client: Send + Sync {
    fn describe_instances_page(
        &self,
        filters: &[Filter],
        next_token: Option<&str>,
    ) -> Result<InstancePage, CommandError>;

    fn describe_tags(&self, filters: &[Filter]) -> Result<BTreeMap<String, String>, CommandError>;

    fn terminate_instance(&self, id: &str) -> Result<(), CommandError>;
}

/// Real `Ec2Client` backed by `aws-sdk-ec2`.
pub struct AwsEc2Client {
    sdk: Ec2SdkClient,
}

impl AwsEc2Client {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        AwsEc2Client {
            sdk: Ec2SdkClient::new(sdk_config),
        }
    }

    fn to_sdk_filters(filters: &[Filter]) -> Vec<aws_sdk_ec2::types::Filter> {
        filters
            .iter()
            .map(|f| {
                aws_sdk_ec2::types::Filter::builder()
                    .name(&f.name)
                    .set_values(Some(f.values.clone()))
                    .build()
            })
            .collect()
    }
}

impl Ec2Client for AwsEc2Client {
    fn describe_instances_page(
        &self,
        filters: &[Filter],
        next_token: Option<&str>,
    ) -> Result<InstancePage, CommandError> {
        block_on(async {
            let mut request = self.sdk.describe_instances().set_filters(Some(Self::to_sdk_filters(filters)));
            if let Some(token) = next_token {
                request = request.next_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| CommandError::new("describe_instances failed".to_string(), Some(e.to_string())))?;

            let mut instances = Vec::new();
            for reservation in response.reservations() {
                for sdk_instance in reservation.instances() {
                    let id = match sdk_instance.instance_id() {
                        Some(id) => id.to_string(),
                        None => continue,
                    };
                    let launch_time = sdk_instance
                        .launch_time()
                        .and_then(|t| Utc.timestamp_opt(t.secs(), 0).single())
                        .unwrap_or_else(Utc::now);
                    let tags: BTreeMap<String, String> = sdk_instance
                        .tags()
                        .iter()
                        .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
                        .collect();
                    instances.push(Instance::new(id, launch_time, tags));
                }
            }

            Ok(InstancePage {
                instances,
                next_token: response.next_token().map(|s| s.to_string()),
            })
        })
    }

    fn describe_tags(&self, filters: &[Filter]) -> Result<BTreeMap<String, String>, CommandError> {
        block_on(async {
            let response = self
                .sdk
                .describe_tags()
                .set_filters(Some(Self::to_sdk_filters(filters)))
                .send()
                .await
                .map_err(|e| CommandError::new("describe_tags failed".to_string(), Some(e.to_string())))?;

            Ok(response
                .tags()
                .iter()
                .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
                .collect())
        })
    }

    fn terminate_instance(&self, id: &str) -> Result<(), CommandError> {
        block_on(async {
            self.sdk
                .terminate_instances()
                .instance_ids(id)
                .send()
                .await
                .map_err(|e| CommandError::new(format!("terminate_instances({id}) failed"), Some(e.to_string())))?;
            Ok(())
        })
    }
}

/// Paged listing, tag-based filtering and by-component grouping over a set
/// of instances. Holds the engine-wide filters (cluster tag, running state)
/// that are merged into every caller-supplied filter set.
pub struct InstanceQuery<C: Ec2Client> {
    client: C,
    global_filters: Vec<Filter>,
    build_tag: String,
}

impl<C: Ec2Client> InstanceQuery<C> {
    pub fn new(client: C, global_filters: Vec<Filter>, build_tag: String) -> Self {
        InstanceQuery {
            client,
            global_filters,
            build_tag,
        }
    }

    /// Pages through the cloud API until it returns an empty continuation
    /// token, then applies a client-side negative filter on the build tag
    /// (the cloud API has no "tag value not equal to X" filter).
    pub fn list_by_filters(&self, filters: Vec<Filter>) -> Result<Vec<Instance>, CommandError> {
        let mut merged = filters;
        merged.extend(self.global_filters.iter().cloned());

        if merged.is_empty() {
            return Err(CommandError::new_from_safe_message(
                "cannot pass a zero-length filter list to the cloud API".to_string(),
            ));
        }

        let mut results = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let page = self.client.describe_instances_page(&merged, next_token.as_deref())?;
            results.extend(page.instances);
            next_token = page.next_token;
            if next_token.is_none() {
                break;
            }
        }

        Ok(Self::not_matching_tag_value("version", &self.build_tag, &results))
    }

    pub fn get_instance_health(&self, id: &str) -> Result<String, CommandError> {
        let filters = vec![Filter::new("tag:healthy", "*"), Filter::new("resource-id", id)];
        let tags = self.client.describe_tags(&filters)?;
        Ok(tags.get("healthy").cloned().unwrap_or_else(|| "Unset".to_string()))
    }

    pub fn terminate_instance(&self, id: &str) -> Result<(), CommandError> {
        self.client.terminate_instance(id)
    }

    /// Iterates instances and, for each, scans tags once: the first
    /// occurrence of the key fixes the match/no-match decision, a missing
    /// key is treated as an empty-string value.
    pub fn matching_tag(tag: &str, value: &str, inverse: bool, instances: &[Instance]) -> Vec<Instance> {
        instances
            .iter()
            .filter(|instance| {
                let tag_match = instance.tag(tag).map(|v| v == value).unwrap_or(false);
                tag_match != inverse
            })
            .cloned()
            .collect()
    }

    pub fn not_matching_tag_value(tag: &str, value: &str, instances: &[Instance]) -> Vec<Instance> {
        Self::matching_tag(tag, value, true, instances)
    }

    /// Preserves insertion order, first-seen wins. Instances missing the
    /// tag contribute an empty-string entry the first time they're seen —
    /// a known quirk inherited from the reference implementation (see
    /// SPEC_FULL.md §9).
    pub fn unique_tag_values(tag: &str, instances: &[Instance]) -> Vec<String> {
        let mut seen = Vec::new();
        for instance in instances {
            let value = instance.tag(tag).unwrap_or_default().to_string();
            if !seen.contains(&value) {
                seen.push(value);
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn instance(id: &str, pairs: &[(&str, &str)]) -> Instance {
        Instance::new(id, Utc::now(), tags(pairs))
    }

    struct FakeEc2Client {
        pages: RefCell<VecDeque<InstancePage>>,
        health: BTreeMap<String, String>,
        terminated: RefCell<Vec<String>>,
    }

    impl FakeEc2Client {
        fn single_page(instances: Vec<Instance>) -> Self {
            let mut pages = VecDeque::new();
            pages.push_back(InstancePage {
                instances,
                next_token: None,
            });
            FakeEc2Client {
                pages: RefCell::new(pages),
                health: BTreeMap::new(),
                terminated: RefCell::new(Vec::new()),
            }
        }
    }

    impl Ec2Client for FakeEc2Client {
        fn describe_instances_page(
            &self,
            _filters: &[Filter],
            _next_token: Option<&str>,
        ) -> Result<InstancePage, CommandError> {
            self.pages
                .borrow_mut()
                .pop_front()
                .ok_or_else(|| CommandError::new_from_safe_message("no more pages".to_string()))
        }

        fn describe_tags(&self, _filters: &[Filter]) -> Result<BTreeMap<String, String>, CommandError> {
            Ok(self.health.clone())
        }

        fn terminate_instance(&self, id: &str) -> Result<(), CommandError> {
            self.terminated.borrow_mut().push(id.to_string());
            Ok(())
        }
    }

    #[test]
    fn list_by_filters_rejects_empty_filter_set() {
        let query = InstanceQuery::new(FakeEc2Client::single_page(vec![]), vec![], "NEW".to_string());
        let err = query.list_by_filters(vec![]).unwrap_err();
        assert!(err.message.contains("zero-length"));
    }

    #[test]
    fn list_by_filters_excludes_instances_on_the_target_build_tag() {
        let instances = vec![
            instance("i-old", &[("version", "OLD")]),
            instance("i-new", &[("version", "NEW")]),
        ];
        let query = InstanceQuery::new(FakeEc2Client::single_page(instances), vec![], "NEW".to_string());
        let result = query.list_by_filters(vec![Filter::tag("ServiceComponent", "k8s-master")]).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "i-old");
    }

    #[test]
    fn matching_tag_uses_first_occurrence_only() {
        // BTreeMap can't carry duplicate keys, so emulate the "first tag
        // wins" rule at the matching_tag level using the single stored value.
        let instances = vec![instance("i-1", &[("ServiceComponent", "etcd")])];
        let matched = InstanceQuery::<FakeEc2Client>::matching_tag("ServiceComponent", "etcd", false, &instances);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn matching_tag_missing_key_counts_as_empty_string() {
        let instances = vec![instance("i-1", &[])];
        let matched = InstanceQuery::<FakeEc2Client>::matching_tag("healthy", "", false, &instances);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn inverse_match_selects_absent_or_different_value() {
        let instances = vec![
            instance("i-true", &[("healthy", "True")]),
            instance("i-false", &[("healthy", "False")]),
            instance("i-none", &[]),
        ];
        let not_healthy = InstanceQuery::<FakeEc2Client>::matching_tag("healthy", "True", true, &instances);
        let ids: Vec<_> = not_healthy.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i-false", "i-none"]);
    }

    #[test]
    fn unique_tag_values_preserves_first_seen_order_including_empty_bucket() {
        let instances = vec![
            instance("i-1", &[("aws:autoscaling:groupName", "asg-a")]),
            instance("i-2", &[]),
            instance("i-3", &[("aws:autoscaling:groupName", "asg-a")]),
            instance("i-4", &[("aws:autoscaling:groupName", "asg-b")]),
        ];
        let values = InstanceQuery::<FakeEc2Client>::unique_tag_values("aws:autoscaling:groupName", &instances);
        assert_eq!(values, vec!["asg-a".to_string(), "".to_string(), "asg-b".to_string()]);
    }

    #[test]
    fn get_instance_health_defaults_to_unset() {
        let mut client = FakeEc2Client::single_page(vec![]);
        client.health = BTreeMap::new();
        let query = InstanceQuery::new(client, vec![], "NEW".to_string());
        assert_eq!(query.get_instance_health("i-1").unwrap(), "Unset");
    }
}
