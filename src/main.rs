use cluster_roller::cloud::autoscaling::{ASGControl, AwsAutoscalingClient};
use cluster_roller::cloud::ec2::{AwsEc2Client, InstanceQuery};
use cluster_roller::config::Config;
use cluster_roller::downtime::DowntimeWindow;
use cluster_roller::errors::RollerError;
use cluster_roller::instance::Filter;
use cluster_roller::kubernetes::{DeploymentScaler, NodeControl};
use cluster_roller::notify::SlackNotifier;
use cluster_roller::orchestrator::{overall_success, summarize, Orchestrator};
use cluster_roller::replacement_finder::ReplacementFinder;
use cluster_roller::runtime::block_on;
use kube::config::{AuthInfo, Kubeconfig, NamedCluster, NamedContext};
use std::process::ExitCode;
use uuid::Uuid;

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    cluster_roller::logging::init(config.log_verbosity);
    let execution_id = Uuid::new_v4();
    tracing::info!(execution_id = %execution_id, cluster = %config.cluster, "starting cluster-roller run");

    match run(&config, execution_id) {
        Ok(success) => {
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "fatal error before any replacement began");
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Config, execution_id: Uuid) -> Result<bool, Box<RollerError>> {
    let sdk_config = block_on(aws_config::from_env().region(aws_config::Region::new(config.aws_region.clone())).load());

    let ec2_client = AwsEc2Client::new(&sdk_config);
    let global_filters = vec![
        Filter::tag("KubernetesCluster", config.kubernetes_cluster_id()),
        Filter::new("instance-state-name", "running"),
    ];
    let query = InstanceQuery::new(ec2_client, global_filters, config.ansible_version.clone());
    let finder = ReplacementFinder::new(query);

    let autoscaling_client = AwsAutoscalingClient::new(&sdk_config);
    let asg_control = ASGControl::new(autoscaling_client);

    let kube_client = build_kube_client(config)?;
    let node_control = NodeControl::new(kube_client.clone());
    let deployment_scaler = DeploymentScaler::new(kube_client);

    let downtime = DowntimeWindow::new(config.datadog_api_key.clone(), config.datadog_app_key.clone());
    let downtime_id = downtime.start(&config.cluster).ok();
    if downtime_id.is_none() {
        tracing::warn!("failed to open downtime window; continuing without it");
    }

    let orchestrator = Orchestrator {
        config,
        asg_control: &asg_control,
        finder: &finder,
        node_control: &node_control,
        deployment_scaler: &deployment_scaler,
        execution_id,
    };
    let run_state = orchestrator.run();

    if let Some(id) = downtime_id {
        if let Err(e) = downtime.end(id) {
            tracing::warn!(error = %e, "failed to close downtime window");
        }
    }

    let summary = summarize(&run_state);
    tracing::info!("{summary}");

    let notifier = SlackNotifier::new(config.slack_webhook.clone());
    if let Err(e) = notifier.post(&summary) {
        tracing::warn!(error = %e, "failed to post run summary to the notification sink");
    }

    Ok(overall_success(&run_state))
}

fn build_kube_client(config: &Config) -> Result<kube::Client, Box<RollerError>> {
    let cluster_name = "cluster-roller".to_string();
    let kubeconfig = Kubeconfig {
        clusters: vec![NamedCluster {
            name: cluster_name.clone(),
            cluster: Some(kube::config::Cluster {
                server: Some(config.kubernetes_server.clone()),
                insecure_skip_tls_verify: Some(false),
                ..Default::default()
            }),
        }],
        contexts: vec![NamedContext {
            name: cluster_name.clone(),
            context: Some(kube::config::Context {
                cluster: cluster_name.clone(),
                user: cluster_name.clone(),
                ..Default::default()
            }),
        }],
        current_context: Some(cluster_name.clone()),
        auth_infos: vec![kube::config::NamedAuthInfo {
            name: cluster_name,
            auth_info: Some(AuthInfo {
                token: Some(config.kubernetes_token.clone().into()),
                ..Default::default()
            }),
        }],
        ..Default::default()
    };

    block_on(async {
        let options = kube::config::KubeConfigOptions::default();
        let client_config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| RollerError::fatal(format!("failed to build kubernetes client config: {e}")))?;
        kube::Client::try_from(client_config).map_err(|e| RollerError::fatal(format!("failed to build kubernetes client: {e}")))
    })
}
