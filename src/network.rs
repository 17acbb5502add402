//! The network stack: one VPC with a single public subnet tier.

use std::net::Ipv4Addr;

use serde_json::{json, Value};
use tracing::info;

use crate::app::App;
use crate::config::{Config, EnvName};
use crate::lookup::{NetworkHandle, Reference};
use crate::template::{self, select_az, tag, Output, Resource, Stack, Template};

pub const STACK_PREFIX: &str = "CdkVpc";
pub const CONSTRUCT_ID: &str = "Vpc";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Invalid CIDR block `{0}`")]
    InvalidCidr(String),

    #[error("Cannot fit {requested} /{mask} subnets into {cidr}, room for {available}")]
    SubnetAllocation {
        cidr: String,
        mask: u8,
        requested: u32,
        available: u64,
    },

    #[error("Invalid network properties: {0}")]
    InvalidProps(String),

    #[error(transparent)]
    Template(#[from] template::Error),
}

/// Stack id of the network stack of an environment, e.g. `CdkVpc-dev`.
pub fn stack_id(env_name: EnvName) -> String {
    format!("{}-{}", STACK_PREFIX, env_name)
}

/// Name consumers resolve the network by, e.g. `CdkVpc-dev/Vpc`.
pub fn network_name(stack_id: &str) -> String {
    format!("{}/{}", stack_id, CONSTRUCT_ID)
}

pub fn vpc_export(stack_id: &str) -> String {
    format!("{}:VpcId", stack_id)
}

/// Export of the `index`-th (1-based) public subnet.
pub fn subnet_export(stack_id: &str, index: u32) -> String {
    format!("{}:{}", stack_id, subnet_output(index))
}

pub fn subnet_output(index: u32) -> String {
    format!("PublicSubnet{}Id", index)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkProps {
    /// Address block of the VPC. Default `10.0.0.0/16`.
    pub cidr: String,

    /// Prefix length of every subnet. Default `24`.
    pub subnet_cidr_mask: u8,

    /// Name of the public subnet group, used in logical ids. Default `public`.
    pub subnet_name: String,
}

impl Default for NetworkProps {
    fn default() -> Self {
        Self {
            cidr: String::from("10.0.0.0/16"),
            subnet_cidr_mask: 24,
            subnet_name: String::from("public"),
        }
    }
}

impl NetworkProps {
    pub fn validate(&self) -> Result<(), Error> {
        if !(16..=28).contains(&self.subnet_cidr_mask) {
            return Err(Error::InvalidProps(format!(
                "subnet mask /{} is outside /16../28",
                self.subnet_cidr_mask
            )));
        }
        if self.subnet_name.is_empty() || !self.subnet_name.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(Error::InvalidProps(format!(
                "subnet group name `{}` must be alphanumeric",
                self.subnet_name
            )));
        }

        return Ok(());
    }
}

fn parse_cidr(cidr: &str) -> Result<(u32, u8), Error> {
    let invalid = || Error::InvalidCidr(cidr.to_string());

    let (address, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let address: Ipv4Addr = address.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }

    let netmask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    return Ok((u32::from(address) & netmask, prefix));
}

/// Splits `cidr` into `count` consecutive blocks of prefix length `mask`.
pub fn allocate_subnets(cidr: &str, mask: u8, count: u32) -> Result<Vec<String>, Error> {
    let (base, prefix) = parse_cidr(cidr)?;
    if mask < prefix || mask > 32 {
        return Err(Error::InvalidCidr(format!("{} split into /{}", cidr, mask)));
    }

    let block = 1u64 << (32 - mask);
    let available = 1u64 << (mask - prefix);
    if u64::from(count) > available {
        return Err(Error::SubnetAllocation {
            cidr: cidr.to_string(),
            mask,
            requested: count,
            available,
        });
    }

    let subnets = (0..u64::from(count))
        .map(|index| {
            let start = Ipv4Addr::from((u64::from(base) + index * block) as u32);
            format!("{}/{}", start, mask)
        })
        .collect();

    return Ok(subnets);
}

/// Builds the network template for `config` without touching any app.
///
/// `az_count` is passed through as is; whether the region offers that many
/// zones is only known when the template is applied.
pub fn synthesize(
    id: &str,
    config: &Config,
    props: &NetworkProps,
) -> Result<(Stack, NetworkHandle), Error> {
    props.validate()?;
    let name = network_name(id);
    let subnet_blocks = allocate_subnets(&props.cidr, props.subnet_cidr_mask, config.az_count())?;

    let mut template = Template::new(&format!(
        "VPC with {} public subnets ({})",
        config.az_count(),
        config.env_name()
    ));

    let vpc = template.add(
        CONSTRUCT_ID,
        Resource::new(
            "AWS::EC2::VPC",
            json!({
                "CidrBlock": props.cidr,
                "EnableDnsHostnames": true,
                "EnableDnsSupport": true,
                "InstanceTenancy": "default",
                "Tags": [tag("Name", &name)],
            }),
        ),
    )?;

    let igw = template.add(
        &format!("{}IGW", CONSTRUCT_ID),
        Resource::new(
            "AWS::EC2::InternetGateway",
            json!({ "Tags": [tag("Name", &name)] }),
        ),
    )?;

    let attachment = template.add(
        &format!("{}VPCGW", CONSTRUCT_ID),
        Resource::new(
            "AWS::EC2::VPCGatewayAttachment",
            json!({
                "VpcId": vpc.reference(),
                "InternetGatewayId": igw.reference(),
            }),
        ),
    )?;

    let mut public_subnet_ids = Vec::with_capacity(subnet_blocks.len());
    for (index, block) in subnet_blocks.iter().enumerate() {
        let number = index as u32 + 1;
        let prefix = format!("{}{}Subnet{}", CONSTRUCT_ID, props.subnet_name, number);
        let subnet_path = format!("{}/{}Subnet{}", name, props.subnet_name, number);

        let subnet = template.add(
            &format!("{}Subnet", prefix),
            Resource::new(
                "AWS::EC2::Subnet",
                json!({
                    "VpcId": vpc.reference(),
                    "CidrBlock": block,
                    "AvailabilityZone": select_az(index),
                    "MapPublicIpOnLaunch": true,
                    "Tags": [
                        tag("aws-cdk:subnet-name", &props.subnet_name),
                        tag("aws-cdk:subnet-type", "Public"),
                        tag("Name", &subnet_path),
                    ],
                }),
            ),
        )?;

        let route_table = template.add(
            &format!("{}RouteTable", prefix),
            Resource::new(
                "AWS::EC2::RouteTable",
                json!({
                    "VpcId": vpc.reference(),
                    "Tags": [tag("Name", &subnet_path)],
                }),
            ),
        )?;

        template.add(
            &format!("{}RouteTableAssociation", prefix),
            Resource::new(
                "AWS::EC2::SubnetRouteTableAssociation",
                json!({
                    "RouteTableId": route_table.reference(),
                    "SubnetId": subnet.reference(),
                }),
            ),
        )?;

        // Routes through the gateway fail until it is attached.
        template.add(
            &format!("{}DefaultRoute", prefix),
            Resource::new(
                "AWS::EC2::Route",
                json!({
                    "RouteTableId": route_table.reference(),
                    "DestinationCidrBlock": "0.0.0.0/0",
                    "GatewayId": igw.reference(),
                }),
            )
            .depends_on(&attachment),
        )?;

        template.add_output(
            &subnet_output(number),
            export_output(subnet.reference(), subnet_export(id, number)),
        )?;
        public_subnet_ids.push(Reference::Import(subnet_export(id, number)));
    }

    template.add_output("VpcId", export_output(vpc.reference(), vpc_export(id)))?;
    template.validate_references()?;

    let handle = NetworkHandle {
        name,
        stack_id: id.to_string(),
        az_count: config.az_count(),
        vpc_id: Reference::Import(vpc_export(id)),
        public_subnet_ids,
    };
    let stack = Stack {
        id: id.to_string(),
        env: config.env().clone(),
        template,
        dependencies: Vec::new(),
    };

    return Ok((stack, handle));
}

fn export_output(value: Value, export_name: String) -> Output {
    Output {
        description: None,
        value,
        export: Some(template::Export { name: export_name }),
    }
}

/// Declares the network stack `id` in `app` and registers its network.
///
/// Declaring the same id again replaces the earlier declaration.
pub fn declare(app: &mut App, id: &str, config: &Config) -> Result<NetworkHandle, Error> {
    let (stack, handle) = synthesize(id, config, &NetworkProps::default())?;

    info!(
        stack = id,
        network = %handle.name,
        subnets = handle.public_subnet_ids.len(),
        "declared network stack"
    );
    app.add_stack(stack);
    app.networks_mut().register(handle.clone());

    return Ok(handle);
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{allocate_subnets, declare, network_name, stack_id, synthesize, Error, NetworkProps};
    use crate::app::App;
    use crate::config::{Config, ConfigEntry, ConfigRegistry, EnvName};
    use crate::lookup::Reference;

    fn config_with_azs(az_count: u32) -> Config {
        Config::new(
            EnvName::Dev,
            ConfigEntry {
                account: String::from("123456789012"),
                region: String::from("eu-west-1"),
                az_count,
            },
        )
        .unwrap()
    }

    #[test]
    fn names_follow_the_convention() {
        assert_eq!(stack_id(EnvName::Dev), "CdkVpc-dev");
        assert_eq!(stack_id(EnvName::Prd), "CdkVpc-prd");
        assert_eq!(network_name("CdkVpc-dev"), "CdkVpc-dev/Vpc");
    }

    #[test]
    fn allocates_consecutive_blocks() {
        assert_eq!(
            allocate_subnets("10.0.0.0/16", 24, 3).unwrap(),
            vec!["10.0.0.0/24", "10.0.1.0/24", "10.0.2.0/24"]
        );
        assert_eq!(
            allocate_subnets("10.1.0.0/20", 22, 2).unwrap(),
            vec!["10.1.0.0/22", "10.1.4.0/22"]
        );
    }

    #[test]
    fn rejects_allocations_that_do_not_fit() {
        match allocate_subnets("10.0.0.0/23", 24, 3).err().unwrap() {
            Error::SubnetAllocation { available, .. } => assert_eq!(available, 2),
            _ => panic!("Expected `SubnetAllocation` error"),
        }
        assert!(allocate_subnets("10.0.0/16", 24, 1).is_err());
        assert!(allocate_subnets("10.0.0.0/16", 8, 1).is_err());
    }

    #[test]
    fn rejects_invalid_props() {
        let props = NetworkProps {
            subnet_name: String::from("pub-lic"),
            ..NetworkProps::default()
        };

        match synthesize("CdkVpc-dev", &config_with_azs(2), &props).err().unwrap() {
            Error::InvalidProps(_) => {}
            _ => panic!("Expected `InvalidProps` error"),
        }
    }

    #[test]
    fn vpc_is_tagged_with_the_network_name() {
        let (stack, handle) =
            synthesize("CdkVpc-dev", &config_with_azs(2), &NetworkProps::default()).unwrap();

        let vpc = &stack.template.resources["Vpc"];
        assert_eq!(vpc.resource_type, "AWS::EC2::VPC");
        assert_eq!(vpc.properties["Tags"][0]["Value"], "CdkVpc-dev/Vpc");
        assert_eq!(handle.name, "CdkVpc-dev/Vpc");
        assert_eq!(
            handle.vpc_id,
            Reference::Import(String::from("CdkVpc-dev:VpcId"))
        );
        assert_eq!(
            stack.template.outputs["VpcId"].export.as_ref().unwrap().name,
            "CdkVpc-dev:VpcId"
        );
    }

    #[test]
    fn default_routes_wait_for_the_gateway_attachment() {
        let (stack, _) =
            synthesize("CdkVpc-dev", &config_with_azs(1), &NetworkProps::default()).unwrap();

        let route = &stack.template.resources["VpcpublicSubnet1DefaultRoute"];
        assert_eq!(route.depends_on, vec![String::from("VpcVPCGW")]);
        assert_eq!(route.properties["DestinationCidrBlock"], "0.0.0.0/0");
    }

    #[test]
    fn declaring_twice_is_idempotent() {
        let config = ConfigRegistry::builtin().get(EnvName::Dev).clone();
        let (first, _) = synthesize("CdkVpc-dev", &config, &NetworkProps::default()).unwrap();
        let (second, _) = synthesize("CdkVpc-dev", &config, &NetworkProps::default()).unwrap();
        assert_eq!(
            first.template.to_json().unwrap(),
            second.template.to_json().unwrap()
        );

        let mut app = App::new();
        declare(&mut app, "CdkVpc-dev", &config).unwrap();
        declare(&mut app, "CdkVpc-dev", &config).unwrap();
        assert_eq!(app.stacks().count(), 1);
        assert_eq!(app.networks().len(), 1);
        assert_eq!(
            app.stack("CdkVpc-dev").unwrap().template.resources_of_type("AWS::EC2::VPC").count(),
            1
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            .. ProptestConfig::default()
        })]

        #[test]
        fn declares_one_public_subnet_per_az(az_count in 1u32..=32) {
            let (stack, handle) =
                synthesize("CdkVpc-dev", &config_with_azs(az_count), &NetworkProps::default())
                    .unwrap();

            let subnets: Vec<_> = stack.template.resources_of_type("AWS::EC2::Subnet").collect();
            prop_assert_eq!(subnets.len(), az_count as usize);
            for (_, subnet) in &subnets {
                prop_assert_eq!(&subnet.properties["MapPublicIpOnLaunch"], &serde_json::json!(true));
                prop_assert_eq!(&subnet.properties["Tags"][1]["Value"], &serde_json::json!("Public"));
            }
            prop_assert_eq!(handle.public_subnet_ids.len(), az_count as usize);
            prop_assert_eq!(handle.az_count, az_count);
        }
    }
}
