use crate::component::Component;
use crate::errors::RollerError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_TERMINATION_WAIT_PERIOD_SECONDS: u64 = 5;
const DEFAULT_TERMINATION_BATCH_NODES_SIZE: usize = 5;
const DEFAULT_SCALE_OUT_TAIL_THRESHOLD: usize = 10;

/// Validated, immutable configuration for a single run. Constructed once at
/// startup; every field has already been checked by the time the rest of
/// the engine sees it.
#[derive(Debug, Clone)]
pub struct Config {
    pub cluster: String,
    pub aws_account: Option<String>,
    pub aws_profile: Option<String>,
    pub aws_region: String,
    pub ansible_version: String,
    pub kubernetes_server: String,
    pub kubernetes_token: String,
    pub target_components: Vec<Component>,
    pub termination_wait_period: Duration,
    pub termination_batch_nodes_size: usize,
    pub scale_out_tail_threshold: usize,
    pub slack_webhook: String,
    pub datadog_api_key: String,
    pub datadog_app_key: String,
    pub log_verbosity: u8,
}

impl Config {
    /// Loads and validates configuration from the process environment.
    /// Collects every missing/invalid field in one pass rather than
    /// stopping at the first, so an operator sees the whole list at once.
    pub fn from_env() -> Result<Self, Box<RollerError>> {
        Self::from_getter(|key| env::var(key).ok())
    }

    pub fn from_getter(get: impl Fn(&str) -> Option<String>) -> Result<Self, Box<RollerError>> {
        let mut problems: Vec<String> = Vec::new();

        let cluster = require(&get, "CLUSTER", &mut problems);
        let aws_account = get("AWS_ACCOUNT").filter(|v| !v.is_empty());
        let aws_profile = get("AWS_PROFILE").filter(|v| !v.is_empty());
        if aws_account.is_none() && aws_profile.is_none() {
            problems.push("set one of AWS_ACCOUNT or AWS_PROFILE".to_string());
        }
        let aws_region = require(&get, "AWS_REGION", &mut problems);
        let ansible_version = require(&get, "ANSIBLE_VERSION", &mut problems);
        let kubernetes_server = require(&get, "KUBERNETES_SERVER", &mut problems);
        let kubernetes_token = require(&get, "KUBERNETES_TOKEN", &mut problems);
        let slack_webhook = require(&get, "SLACK_WEBHOOK", &mut problems);
        let datadog_api_key = require(&get, "DATADOG_API_KEY", &mut problems);
        let datadog_app_key = require(&get, "DATADOG_APP_KEY", &mut problems);

        let target_components = match parse_components(get("ROLLER_COMPONENTS").as_deref()) {
            Ok(components) => components,
            Err(unknown) => {
                problems.push(format!("ROLLER_COMPONENTS contains unknown component '{unknown}'"));
                Vec::new()
            }
        };

        let termination_wait_period = get("TERMINATION_WAIT_PERIOD_SECONDS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TERMINATION_WAIT_PERIOD_SECONDS);
        let termination_batch_nodes_size = get("TERMINATION_BATCH_NODES_SIZE")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_TERMINATION_BATCH_NODES_SIZE);
        let log_verbosity = get("ROLLER_LOG_LEVEL")
            .and_then(|v| v.parse::<u8>().ok())
            .unwrap_or(1);

        if !problems.is_empty() {
            return Err(RollerError::fatal(format!(
                "invalid configuration:\n{}",
                problems.iter().map(|p| format!("  - {p}")).collect::<Vec<_>>().join("\n")
            )));
        }

        Ok(Config {
            cluster: cluster.unwrap(),
            aws_account,
            aws_profile,
            aws_region: aws_region.unwrap(),
            ansible_version: ansible_version.unwrap(),
            kubernetes_server: kubernetes_server.unwrap(),
            kubernetes_token: kubernetes_token.unwrap(),
            target_components,
            termination_wait_period: Duration::from_secs(termination_wait_period),
            termination_batch_nodes_size,
            scale_out_tail_threshold: DEFAULT_SCALE_OUT_TAIL_THRESHOLD,
            slack_webhook: slack_webhook.unwrap(),
            datadog_api_key: datadog_api_key.unwrap(),
            datadog_app_key: datadog_app_key.unwrap(),
            log_verbosity,
        })
    }

    /// The identifier consumed in cloud filters: `<account>-<region>-<cluster>`.
    /// `AWS_ACCOUNT` is preferred when present; `AWS_PROFILE` is used as the
    /// account segment otherwise.
    pub fn kubernetes_cluster_id(&self) -> String {
        let account = self
            .aws_account
            .as_deref()
            .or(self.aws_profile.as_deref())
            .unwrap_or_default();
        format!("{account}-{}-{}", self.aws_region, self.cluster)
    }

    pub fn wants(&self, component: Component) -> bool {
        self.target_components.contains(&component)
    }
}

fn require(get: &impl Fn(&str) -> Option<String>, key: &str, problems: &mut Vec<String>) -> Option<String> {
    match get(key).filter(|v| !v.is_empty()) {
        Some(v) => Some(v),
        None => {
            problems.push(format!("set the {key} environment variable"));
            None
        }
    }
}

/// Parses `ROLLER_COMPONENTS`. Pure function of its input: calling it twice
/// with the same string always returns the same list in the same order.
fn parse_components(raw: Option<&str>) -> Result<Vec<Component>, String> {
    match raw {
        None | Some("") => Ok(Component::all().to_vec()),
        Some(csv) => csv
            .split(',')
            .map(str::trim)
            .map(|s| Component::from_str(s).map_err(|_| s.to_string()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn full_env() -> HashMap<&'static str, &'static str> {
        let mut env = HashMap::new();
        env.insert("CLUSTER", "infra");
        env.insert("AWS_ACCOUNT", "123456789012");
        env.insert("AWS_REGION", "us-east-1");
        env.insert("ANSIBLE_VERSION", "deadbeef");
        env.insert("KUBERNETES_SERVER", "https://k8s.example.com");
        env.insert("KUBERNETES_TOKEN", "token");
        env.insert("SLACK_WEBHOOK", "https://hooks.example.com/x");
        env.insert("DATADOG_API_KEY", "apikey");
        env.insert("DATADOG_APP_KEY", "appkey");
        env
    }

    #[test]
    fn loads_a_fully_specified_config() {
        let env = full_env();
        let config = Config::from_getter(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.cluster, "infra");
        assert_eq!(config.kubernetes_cluster_id(), "123456789012-us-east-1-infra");
        assert_eq!(config.target_components.len(), 3);
    }

    #[test]
    fn fails_fatal_when_required_vars_are_missing() {
        let env: HashMap<&str, &str> = HashMap::new();
        let err = Config::from_getter(|k| env.get(k).map(|v| v.to_string())).unwrap_err();
        assert!(matches!(*err, RollerError::Fatal { .. }));
    }

    #[test]
    fn accepts_aws_profile_in_place_of_aws_account() {
        let mut env = full_env();
        env.remove("AWS_ACCOUNT");
        env.insert("AWS_PROFILE", "dev");
        let config = Config::from_getter(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.kubernetes_cluster_id(), "dev-us-east-1-infra");
    }

    #[test]
    fn parses_roller_components_subset() {
        let mut env = full_env();
        env.insert("ROLLER_COMPONENTS", "k8s-master,etcd");
        let config = Config::from_getter(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.target_components, vec![Component::K8sMaster, Component::Etcd]);
    }

    #[test]
    fn component_parsing_is_idempotent() {
        let first = parse_components(Some("k8s-node,etcd")).unwrap();
        let second = parse_components(Some("k8s-node,etcd")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_unknown_component_in_roller_components() {
        let mut env = full_env();
        env.insert("ROLLER_COMPONENTS", "k8s-node,not-a-component");
        let err = Config::from_getter(|k| env.get(k).map(|v| v.to_string())).unwrap_err();
        assert!(matches!(*err, RollerError::Fatal { .. }));
    }
}
