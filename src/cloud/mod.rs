pub mod autoscaling;
pub mod ec2;

pub use autoscaling::{ASGControl, AutoscalingClient, AwsAutoscalingClient, ScalingProcess, SuspendResumeAction};
pub use ec2::{AwsEc2Client, Ec2Client, InstanceQuery};
