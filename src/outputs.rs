use std::collections::HashMap;

use aws_types::region::Region;
use tracing::{info, warn};

use crate::config::Config;
use crate::lookup::{NetworkHandle, NetworkRegistry, Reference};
use crate::network;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Service error ocurred: {0}.")]
    ServiceError(String),

    #[error("Unknown error ocurred: {0}.")]
    UnknownError(String),

    #[error("Stack {0} not found")]
    NotFoundError(String),

    #[error("Stack {0} has no output `{1}`")]
    MissingOutputError(String, String),
}

/// A deployed CloudFormation stack.
pub struct DeployedStack {
    pub stack_name: String,

    client: aws_sdk_cloudformation::Client,
}

impl DeployedStack {
    pub async fn new(stack_name: &str, region: &str) -> Self {
        let sdk_config = aws_config::from_env()
            .region(Region::new(region.to_string()))
            .load()
            .await;
        let client = aws_sdk_cloudformation::Client::new(&sdk_config);

        return Self {
            stack_name: stack_name.to_string(),
            client,
        };
    }

    /// Output key/value pairs of the stack.
    pub async fn get_outputs(&self) -> Result<HashMap<String, String>, Error> {
        let result = self
            .client
            .describe_stacks()
            .stack_name(&self.stack_name)
            .send()
            .await;

        let result = match result {
            Ok(data) => data,
            Err(aws_sdk_cloudformation::types::SdkError::ServiceError { err, .. }) => {
                return Err(classify_service_error(
                    &self.stack_name,
                    err.code(),
                    err.message(),
                    err.to_string(),
                ));
            }
            Err(err) => return Err(Error::UnknownError(err.to_string())),
        };

        let stacks = result.stacks().unwrap_or_else(|| &[]);
        let stack = match stacks.first() {
            Some(stack) => stack,
            None => return Err(Error::NotFoundError(self.stack_name.clone())),
        };

        let outputs = stack
            .outputs()
            .unwrap_or_else(|| &[])
            .iter()
            .fold(HashMap::new(), |mut acc, output| {
                if let (Some(key), Some(value)) = (output.output_key(), output.output_value()) {
                    acc.insert(key.to_string(), value.to_string());
                }
                acc
            });

        return Ok(outputs);
    }
}

/// CloudFormation reports a missing stack as a `ValidationError` whose
/// message says the stack does not exist.
fn classify_service_error(
    stack_name: &str,
    code: Option<&str>,
    message: Option<&str>,
    rendered: String,
) -> Error {
    let missing = code == Some("ValidationError")
        && message.map_or(false, |message| message.contains("does not exist"));
    if missing {
        return Error::NotFoundError(stack_name.to_string());
    }

    return Error::ServiceError(rendered);
}

/// Builds the handle of a deployed network stack from its outputs.
///
/// The subnet count is whatever the stack exports: `PublicSubnet1Id`,
/// `PublicSubnet2Id`, ... up to the first gap.
pub fn network_from_outputs(
    stack_name: &str,
    outputs: &HashMap<String, String>,
) -> Result<NetworkHandle, Error> {
    let vpc_id = match outputs.get("VpcId") {
        Some(value) => Reference::Literal(value.clone()),
        None => {
            return Err(Error::MissingOutputError(
                stack_name.to_string(),
                String::from("VpcId"),
            ))
        }
    };

    let public_subnet_ids: Vec<Reference> = (1..)
        .map_while(|index| outputs.get(&network::subnet_output(index)))
        .map(|value| Reference::Literal(value.clone()))
        .collect();
    if public_subnet_ids.is_empty() {
        return Err(Error::MissingOutputError(
            stack_name.to_string(),
            network::subnet_output(1),
        ));
    }
    let az_count = public_subnet_ids.len() as u32;

    return Ok(NetworkHandle {
        name: network::network_name(stack_name),
        stack_id: stack_name.to_string(),
        az_count,
        vpc_id,
        public_subnet_ids,
    });
}

/// Looks up the deployed network stack of `config`'s environment.
pub async fn fetch_network(config: &Config) -> Result<NetworkHandle, Error> {
    let stack_name = network::stack_id(config.env_name());
    let stack = DeployedStack::new(&stack_name, &config.env().region).await;

    let outputs = stack.get_outputs().await?;
    let handle = network_from_outputs(&stack_name, &outputs)?;
    if handle.az_count != config.az_count() {
        warn!(
            stack = %stack_name,
            deployed = handle.az_count,
            configured = config.az_count(),
            "deployed network spans a different number of availability zones than configured"
        );
    }

    return Ok(handle);
}

/// Looks up the deployed networks of every config concurrently and registers
/// the ones found. Lookups that fail are logged and skipped.
pub async fn fetch_networks(configs: &[&Config], registry: &mut NetworkRegistry) {
    let lookups = configs.iter().map(|config| fetch_network(config));
    let results = futures::future::join_all(lookups).await;

    for (config, result) in configs.iter().zip(results) {
        match result {
            Ok(handle) => {
                info!(env = %config.env_name(), network = %handle.name, "resolved deployed network");
                registry.register(handle);
            }
            Err(error) => {
                warn!(env = %config.env_name(), %error, "deployed network lookup failed");
            }
        }
    }
}
