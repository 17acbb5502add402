//! The compute stack: an ECS cluster running a load balanced Fargate service
//! whose tasks mount a shared EFS filesystem.
//!
//! Declaration happens in four ordered steps. The network is resolved first
//! and nothing is declared unless it resolves. Storage, compute and service
//! follow, and the permission edge between the service and the filesystem is
//! declared last because it needs both endpoints.

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::app::App;
use crate::config::{Config, EnvName};
use crate::lookup::{self, NetworkHandle, NetworkRegistry, Reference};
use crate::network;
use crate::template::{self, tag, Output, Resource, ResourceRef, Stack, Template};

pub const STACK_PREFIX: &str = "CdkEcsFargate";

/// Default port of the NFS protocol EFS speaks.
pub const NFS_PORT: u16 = 2049;

/// Actions needed to open an ECS Exec session, and nothing else.
pub const EXEC_ACTIONS: [&str; 4] = [
    "ssmmessages:CreateControlChannel",
    "ssmmessages:CreateDataChannel",
    "ssmmessages:OpenControlChannel",
    "ssmmessages:OpenDataChannel",
];

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("network lookup failed: {0}")]
    NetworkNotFound(#[source] lookup::Error),

    #[error("Resolved network belongs to stack {found}, expected {expected}")]
    NetworkMismatch { expected: String, found: String },

    #[error("Network `{0}` has no public subnets")]
    EmptyNetwork(String),

    #[error("Invalid compute properties: {0}")]
    InvalidProps(String),

    #[error(transparent)]
    Template(#[from] template::Error),
}

/// Stack id of the compute stack of an environment, e.g. `CdkEcsFargate-dev`.
pub fn stack_id(env_name: EnvName) -> String {
    format!("{}-{}", STACK_PREFIX, env_name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePolicy {
    After7Days,
    After14Days,
    After30Days,
    After60Days,
    After90Days,
}

impl LifecyclePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePolicy::After7Days => "AFTER_7_DAYS",
            LifecyclePolicy::After14Days => "AFTER_14_DAYS",
            LifecyclePolicy::After30Days => "AFTER_30_DAYS",
            LifecyclePolicy::After60Days => "AFTER_60_DAYS",
            LifecyclePolicy::After90Days => "AFTER_90_DAYS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceMode {
    GeneralPurpose,
    MaxIo,
}

impl PerformanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PerformanceMode::GeneralPurpose => "generalPurpose",
            PerformanceMode::MaxIo => "maxIO",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThroughputMode {
    Bursting,
    Elastic,
}

impl ThroughputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThroughputMode::Bursting => "bursting",
            ThroughputMode::Elastic => "elastic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemProps {
    /// Value of the `Name` tag. Default `CdkEfs`.
    pub name: String,
    /// Default `true`.
    pub encrypted: bool,
    /// Transition to infrequent access. Default 14 days.
    pub lifecycle_policy: LifecyclePolicy,
    /// Default general purpose.
    pub performance_mode: PerformanceMode,
    /// Default bursting.
    pub throughput_mode: ThroughputMode,
}

impl Default for FileSystemProps {
    fn default() -> Self {
        Self {
            name: String::from("CdkEfs"),
            encrypted: true,
            lifecycle_policy: LifecyclePolicy::After14Days,
            performance_mode: PerformanceMode::GeneralPurpose,
            throughput_mode: ThroughputMode::Bursting,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProps {
    /// CPU units. Default 256.
    pub cpu: u32,
    /// Default 512.
    pub memory_mib: u32,
    /// Name of the EFS volume inside the task. Default `efs`.
    pub volume_name: String,
    /// Default `true`.
    pub transit_encryption: bool,
}

impl Default for TaskProps {
    fn default() -> Self {
        Self {
            cpu: 256,
            memory_mib: 512,
            volume_name: String::from("efs"),
            transit_encryption: true,
        }
    }
}

impl TaskProps {
    /// Fargate only accepts fixed cpu/memory pairs.
    fn validate(&self) -> Result<(), Error> {
        let valid_memory: Vec<u32> = match self.cpu {
            256 => vec![512, 1024, 2048],
            512 => (1..=4).map(|gib| gib * 1024).collect(),
            1024 => (2..=8).map(|gib| gib * 1024).collect(),
            2048 => (4..=16).map(|gib| gib * 1024).collect(),
            4096 => (8..=30).map(|gib| gib * 1024).collect(),
            cpu => {
                return Err(Error::InvalidProps(format!(
                    "{} is not a Fargate cpu size",
                    cpu
                )))
            }
        };

        if !valid_memory.contains(&self.memory_mib) {
            return Err(Error::InvalidProps(format!(
                "{} MiB is not valid with {} cpu units",
                self.memory_mib, self.cpu
            )));
        }
        if self.volume_name.is_empty() {
            return Err(Error::InvalidProps(String::from("volume name is empty")));
        }

        return Ok(());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerProps {
    /// Container name. Default `MyContainerDefinition`.
    pub name: String,
    /// Registry image. Default `coderaiser/cloudcmd`.
    pub image: String,
    /// Default 8000.
    pub container_port: u16,
    /// Default `false`.
    pub readonly_root_filesystem: bool,
    /// Where the filesystem root is mounted. Default `/data`.
    pub mount_path: String,
    /// Default `false`.
    pub mount_read_only: bool,
}

impl Default for ContainerProps {
    fn default() -> Self {
        Self {
            name: String::from("MyContainerDefinition"),
            image: String::from("coderaiser/cloudcmd"),
            container_port: 8000,
            readonly_root_filesystem: false,
            mount_path: String::from("/data"),
            mount_read_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceProps {
    /// Default 2.
    pub desired_count: u32,
    /// Default `true`.
    pub assign_public_ip: bool,
    /// Pinned because the engine's `LATEST` lags behind. Default `1.4.0`.
    pub platform_version: String,
    /// Default `true`.
    pub enable_execute_command: bool,
    /// Target group deregistration delay in seconds. Default 30.
    pub deregistration_delay_seconds: u32,
    /// Public HTTP port of the load balancer. Default 80.
    pub listener_port: u16,
    /// Default 60.
    pub health_check_grace_period_seconds: u32,
}

impl Default for ServiceProps {
    fn default() -> Self {
        Self {
            desired_count: 2,
            assign_public_ip: true,
            platform_version: String::from("1.4.0"),
            enable_execute_command: true,
            deregistration_delay_seconds: 30,
            listener_port: 80,
            health_check_grace_period_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputeProps {
    /// Default `CdkCluster`.
    pub cluster_name: Option<String>,
    pub file_system: FileSystemProps,
    pub task: TaskProps,
    pub container: ContainerProps,
    pub service: ServiceProps,
}

impl ComputeProps {
    pub fn cluster_name(&self) -> &str {
        self.cluster_name.as_deref().unwrap_or("CdkCluster")
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.task.validate()?;

        if self.container.image.is_empty() {
            return Err(Error::InvalidProps(String::from("container image is empty")));
        }
        if self.container.container_port == 0 || self.service.listener_port == 0 {
            return Err(Error::InvalidProps(String::from("ports must be non-zero")));
        }
        if !self.container.mount_path.starts_with('/') {
            return Err(Error::InvalidProps(format!(
                "mount path `{}` must be absolute",
                self.container.mount_path
            )));
        }
        // Elastic load balancing caps the delay at one hour.
        if self.service.deregistration_delay_seconds > 3600 {
            return Err(Error::InvalidProps(format!(
                "deregistration delay of {}s exceeds 3600s",
                self.service.deregistration_delay_seconds
            )));
        }
        if self.service.platform_version.is_empty() {
            return Err(Error::InvalidProps(String::from("platform version is empty")));
        }

        return Ok(());
    }
}

struct FileSystem {
    resource: ResourceRef,
    security_group: ResourceRef,
    mount_targets: Vec<ResourceRef>,
}

struct FargateService {
    service: ResourceRef,
    security_group: ResourceRef,
}

fn security_group(
    template: &mut Template,
    logical_id: &str,
    description: &str,
    vpc_id: &Value,
) -> Result<ResourceRef, Error> {
    let group = template.add(
        logical_id,
        Resource::new(
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": description,
                "VpcId": vpc_id,
                "SecurityGroupEgress": [{
                    "CidrIp": "0.0.0.0/0",
                    "Description": "Allow all outbound traffic by default",
                    "IpProtocol": "-1",
                }],
            }),
        ),
    )?;

    return Ok(group);
}

fn prepare_file_system(
    template: &mut Template,
    id: &str,
    network: &NetworkHandle,
    props: &FileSystemProps,
) -> Result<FileSystem, Error> {
    let vpc_id = network.vpc_id.to_value();
    let group = security_group(
        template,
        "MyEfsFileSystemEfsSecurityGroup",
        &format!("{}/MyEfsFileSystem/EfsSecurityGroup", id),
        &vpc_id,
    )?;

    let file_system = template.add(
        "MyEfsFileSystem",
        Resource::new(
            "AWS::EFS::FileSystem",
            json!({
                "Encrypted": props.encrypted,
                "FileSystemTags": [tag("Name", &props.name)],
                "LifecyclePolicies": [{ "TransitionToIA": props.lifecycle_policy.as_str() }],
                "PerformanceMode": props.performance_mode.as_str(),
                "ThroughputMode": props.throughput_mode.as_str(),
            }),
        ),
    )?;

    let mut mount_targets = Vec::with_capacity(network.public_subnet_ids.len());
    for (index, subnet) in network.public_subnet_ids.iter().enumerate() {
        let target = template.add(
            &format!("MyEfsFileSystemEfsMountTarget{}", index + 1),
            Resource::new(
                "AWS::EFS::MountTarget",
                json!({
                    "FileSystemId": file_system.reference(),
                    "SecurityGroups": [group.get_att("GroupId")],
                    "SubnetId": subnet.to_value(),
                }),
            ),
        )?;
        mount_targets.push(target);
    }

    return Ok(FileSystem {
        resource: file_system,
        security_group: group,
        mount_targets,
    });
}

fn prepare_task_definition(
    template: &mut Template,
    id: &str,
    file_system: &FileSystem,
    props: &ComputeProps,
) -> Result<ResourceRef, Error> {
    let statement = json!({
        "Action": EXEC_ACTIONS,
        "Effect": "Allow",
        "Resource": "*",
    });
    let role = template.add(
        "TaskRole",
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": {
                    "Statement": [{
                        "Action": "sts:AssumeRole",
                        "Effect": "Allow",
                        "Principal": { "Service": "ecs-tasks.amazonaws.com" },
                    }],
                    "Version": "2012-10-17",
                },
                "Policies": [{
                    "PolicyName": "TaskPolicies",
                    "PolicyDocument": {
                        "Statement": [statement],
                        "Version": "2012-10-17",
                    },
                }],
            }),
        ),
    )?;

    let task = &props.task;
    let container = &props.container;
    let transit_encryption = if task.transit_encryption { "ENABLED" } else { "DISABLED" };

    let task_definition = template.add(
        "MyTaskDefinition",
        Resource::new(
            "AWS::ECS::TaskDefinition",
            json!({
                "ContainerDefinitions": [{
                    "Essential": true,
                    "Image": container.image,
                    "MountPoints": [{
                        "ContainerPath": container.mount_path,
                        "ReadOnly": container.mount_read_only,
                        "SourceVolume": task.volume_name,
                    }],
                    "Name": container.name,
                    "PortMappings": [{
                        "ContainerPort": container.container_port,
                        "Protocol": "tcp",
                    }],
                    "ReadonlyRootFilesystem": container.readonly_root_filesystem,
                }],
                "Cpu": task.cpu.to_string(),
                "Family": format!("{}MyTaskDefinition", id.replace('-', "")),
                "Memory": task.memory_mib.to_string(),
                "NetworkMode": "awsvpc",
                "RequiresCompatibilities": ["FARGATE"],
                "TaskRoleArn": role.get_att("Arn"),
                "Volumes": [{
                    "EFSVolumeConfiguration": {
                        "FilesystemId": file_system.resource.reference(),
                        "TransitEncryption": transit_encryption,
                    },
                    "Name": task.volume_name,
                }],
            }),
        ),
    )?;

    return Ok(task_definition);
}

fn prepare_service(
    template: &mut Template,
    id: &str,
    network: &NetworkHandle,
    cluster: &ResourceRef,
    task_definition: &ResourceRef,
    file_system: &FileSystem,
    props: &ComputeProps,
) -> Result<FargateService, Error> {
    let service_props = &props.service;
    let container_port = props.container.container_port;
    let listener_port = service_props.listener_port;
    let vpc_id = network.vpc_id.to_value();
    let subnets = network.public_subnet_values();

    let lb_group = template.add(
        "Service01LBSecurityGroup",
        Resource::new(
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": format!("Automatically created Security Group for ELB {}Service01LB", id),
                "VpcId": vpc_id,
                "SecurityGroupIngress": [{
                    "CidrIp": "0.0.0.0/0",
                    "Description": format!("Allow from anyone on port {}", listener_port),
                    "FromPort": listener_port,
                    "IpProtocol": "tcp",
                    "ToPort": listener_port,
                }],
            }),
        ),
    )?;

    let load_balancer = template.add(
        "Service01LB",
        Resource::new(
            "AWS::ElasticLoadBalancingV2::LoadBalancer",
            json!({
                "LoadBalancerAttributes": [{ "Key": "deletion_protection.enabled", "Value": "false" }],
                "Scheme": "internet-facing",
                "SecurityGroups": [lb_group.get_att("GroupId")],
                "Subnets": subnets,
                "Type": "application",
            }),
        ),
    )?;

    let target_group = template.add(
        "Service01LBPublicListenerECSGroup",
        Resource::new(
            "AWS::ElasticLoadBalancingV2::TargetGroup",
            json!({
                "Port": listener_port,
                "Protocol": "HTTP",
                "TargetGroupAttributes": [{
                    "Key": "deregistration_delay.timeout_seconds",
                    "Value": service_props.deregistration_delay_seconds.to_string(),
                }],
                "TargetType": "ip",
                "VpcId": vpc_id,
            }),
        ),
    )?;

    let listener = template.add(
        "Service01LBPublicListener",
        Resource::new(
            "AWS::ElasticLoadBalancingV2::Listener",
            json!({
                "DefaultActions": [{ "TargetGroupArn": target_group.reference(), "Type": "forward" }],
                "LoadBalancerArn": load_balancer.reference(),
                "Port": listener_port,
                "Protocol": "HTTP",
            }),
        ),
    )?;

    let service_group = security_group(
        template,
        "Service01ServiceSecurityGroup",
        &format!("{}/Service01/Service/SecurityGroup", id),
        &vpc_id,
    )?;

    template.add(
        "Service01LBSecurityGroupEgressToService",
        Resource::new(
            "AWS::EC2::SecurityGroupEgress",
            json!({
                "Description": "Load balancer to target",
                "DestinationSecurityGroupId": service_group.get_att("GroupId"),
                "FromPort": container_port,
                "GroupId": lb_group.get_att("GroupId"),
                "IpProtocol": "tcp",
                "ToPort": container_port,
            }),
        ),
    )?;

    template.add(
        "Service01ServiceSecurityGroupIngressFromLB",
        Resource::new(
            "AWS::EC2::SecurityGroupIngress",
            json!({
                "Description": "Load balancer to target",
                "FromPort": container_port,
                "GroupId": service_group.get_att("GroupId"),
                "IpProtocol": "tcp",
                "SourceSecurityGroupId": lb_group.get_att("GroupId"),
                "ToPort": container_port,
            }),
        ),
    )?;

    let assign_public_ip = if service_props.assign_public_ip { "ENABLED" } else { "DISABLED" };
    let mut service = Resource::new(
        "AWS::ECS::Service",
        json!({
            "Cluster": cluster.reference(),
            "DeploymentConfiguration": { "MaximumPercent": 200, "MinimumHealthyPercent": 50 },
            "DesiredCount": service_props.desired_count,
            "EnableECSManagedTags": false,
            "EnableExecuteCommand": service_props.enable_execute_command,
            "HealthCheckGracePeriodSeconds": service_props.health_check_grace_period_seconds,
            "LaunchType": "FARGATE",
            "LoadBalancers": [{
                "ContainerName": props.container.name,
                "ContainerPort": container_port,
                "TargetGroupArn": target_group.reference(),
            }],
            "NetworkConfiguration": {
                "AwsvpcConfiguration": {
                    "AssignPublicIp": assign_public_ip,
                    "SecurityGroups": [service_group.get_att("GroupId")],
                    "Subnets": subnets,
                },
            },
            "PlatformVersion": service_props.platform_version,
            "TaskDefinition": task_definition.reference(),
        }),
    )
    .depends_on(&listener)
    .depends_on(&target_group);
    // Tasks fail to start while the mount targets are still being created.
    for mount_target in &file_system.mount_targets {
        service = service.depends_on(mount_target);
    }
    let service = template.add("Service01Service", service)?;

    template.add_output(
        "Service01LoadBalancerDNS",
        Output {
            description: None,
            value: load_balancer.get_att("DNSName"),
            export: None,
        },
    )?;
    template.add_output(
        "Service01ServiceURL",
        Output {
            description: None,
            value: json!({ "Fn::Join": ["", ["http://", load_balancer.get_att("DNSName")]] }),
            export: None,
        },
    )?;

    return Ok(FargateService {
        service,
        security_group: service_group,
    });
}

/// Lets the service reach the filesystem on the NFS port.
fn allow_default_port_from(
    template: &mut Template,
    file_system: &FileSystem,
    service: &FargateService,
) -> Result<ResourceRef, Error> {
    let edge = template.add(
        "MyEfsFileSystemEfsSecurityGroupIngressFromService",
        Resource::new(
            "AWS::EC2::SecurityGroupIngress",
            json!({
                "Description": format!("from {}:{}", service.service.logical_id(), NFS_PORT),
                "FromPort": NFS_PORT,
                "GroupId": file_system.security_group.get_att("GroupId"),
                "IpProtocol": "tcp",
                "SourceSecurityGroupId": service.security_group.get_att("GroupId"),
                "ToPort": NFS_PORT,
            }),
        ),
    )?;

    return Ok(edge);
}

/// Builds the compute template for `config`, resolving its network in
/// `networks`.
pub fn synthesize(
    id: &str,
    config: &Config,
    networks: &NetworkRegistry,
    props: &ComputeProps,
) -> Result<Stack, Error> {
    props.validate()?;

    let network_stack = network::stack_id(config.env_name());
    let network = match networks.lookup(&network::network_name(&network_stack)) {
        Ok(handle) => handle,
        Err(error) => return Err(Error::NetworkNotFound(error)),
    };
    if network.stack_id != network_stack {
        return Err(Error::NetworkMismatch {
            expected: network_stack,
            found: network.stack_id.clone(),
        });
    }
    if network.public_subnet_ids.is_empty() {
        return Err(Error::EmptyNetwork(network.name.clone()));
    }
    debug!(stack = id, network = %network.name, "resolved network");

    let mut template = Template::new(&format!(
        "Load balanced Fargate service with shared EFS storage ({})",
        config.env_name()
    ));

    let file_system = prepare_file_system(&mut template, id, network, &props.file_system)?;

    let cluster = template.add(
        "EcsCluster",
        Resource::new(
            "AWS::ECS::Cluster",
            json!({ "ClusterName": props.cluster_name() }),
        ),
    )?;
    let task_definition = prepare_task_definition(&mut template, id, &file_system, props)?;

    let service = prepare_service(
        &mut template,
        id,
        network,
        &cluster,
        &task_definition,
        &file_system,
        props,
    )?;
    allow_default_port_from(&mut template, &file_system, &service)?;

    template.validate_references()?;

    // Exports only resolve once the network stack of this assembly is deployed.
    let dependencies = match network.vpc_id {
        Reference::Import(_) => vec![network.stack_id.clone()],
        Reference::Literal(_) => Vec::new(),
    };

    return Ok(Stack {
        id: id.to_string(),
        env: config.env().clone(),
        template,
        dependencies,
    });
}

/// Declares the compute stack `id` in `app`.
///
/// The app is left untouched when any step fails.
pub fn declare(app: &mut App, id: &str, config: &Config) -> Result<(), Error> {
    let mut stack = synthesize(id, config, app.networks(), &ComputeProps::default())?;
    // A network resolved from a saved context may belong to an earlier run.
    stack
        .dependencies
        .retain(|dependency| app.stack(dependency).is_some());

    info!(
        stack = id,
        resources = stack.template.resources.len(),
        depends_on = ?stack.dependencies,
        "declared compute stack"
    );
    app.add_stack(stack);

    return Ok(());
}
