//! The app holds every declared stack and the networks they can resolve, and
//! builds the stacks of each environment in order.

use std::collections::BTreeMap;

use tracing::{error, info};

use crate::compute;
use crate::config::{self, Config, ConfigRegistry, EnvName};
use crate::lookup::NetworkRegistry;
use crate::network;
use crate::template::Stack;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Stack {stack}: {source}")]
    Network {
        stack: String,
        #[source]
        source: network::Error,
    },

    #[error("Stack {stack}: {source}")]
    Compute {
        stack: String,
        #[source]
        source: compute::Error,
    },

    #[error(transparent)]
    Config(#[from] config::Error),
}

/// Which stacks of an environment to declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Selection {
    #[default]
    All,
    Network,
    /// Compute only; its network has to be resolvable from the registry.
    Compute,
}

#[derive(Debug, Default)]
pub struct App {
    stacks: BTreeMap<String, Stack>,
    networks: NetworkRegistry,
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from networks resolved outside this run.
    pub fn with_networks(networks: NetworkRegistry) -> Self {
        Self {
            stacks: BTreeMap::new(),
            networks,
        }
    }

    /// Adds `stack`, replacing a stack with the same id.
    pub fn add_stack(&mut self, stack: Stack) {
        self.stacks.insert(stack.id.clone(), stack);
    }

    pub fn stack(&self, id: &str) -> Option<&Stack> {
        self.stacks.get(id)
    }

    pub fn stacks(&self) -> impl Iterator<Item = &Stack> {
        self.stacks.values()
    }

    pub fn networks(&self) -> &NetworkRegistry {
        &self.networks
    }

    pub fn networks_mut(&mut self) -> &mut NetworkRegistry {
        &mut self.networks
    }
}

/// Declares the network stack, then the compute stack, of one environment.
pub fn build_env_stacks(app: &mut App, config: &Config, selection: Selection) -> Result<(), Error> {
    let env_name = config.env_name();

    if selection != Selection::Compute {
        let stack = network::stack_id(env_name);
        if let Err(source) = network::declare(app, &stack, config) {
            return Err(Error::Network { stack, source });
        }
    }

    if selection != Selection::Network {
        let stack = compute::stack_id(env_name);
        if let Err(source) = compute::declare(app, &stack, config) {
            return Err(Error::Compute { stack, source });
        }
    }

    return Ok(());
}

/// Builds every environment in `env_names`.
///
/// Environments are independent: a failure is recorded and the remaining
/// environments are still built.
pub fn build_all(
    app: &mut App,
    registry: &ConfigRegistry,
    env_names: &[EnvName],
    selection: Selection,
) -> Vec<(EnvName, Result<(), Error>)> {
    env_names
        .iter()
        .map(|&env_name| {
            let result = build_env_stacks(app, registry.get(env_name), selection);
            match &result {
                Ok(_) => info!(env = %env_name, "environment declared"),
                Err(error) => error!(env = %env_name, %error, "environment failed"),
            }
            (env_name, result)
        })
        .collect()
}

/// Resolves environment names given on the command line.
///
/// Every name is checked before any stack is declared.
pub fn resolve_env_names(names: &[String]) -> Result<Vec<EnvName>, Error> {
    if names.is_empty() {
        return Ok(EnvName::ALL.to_vec());
    }

    let mut env_names = Vec::with_capacity(names.len());
    for name in names {
        let env_name: EnvName = name.parse()?;
        if !env_names.contains(&env_name) {
            env_names.push(env_name);
        }
    }

    return Ok(env_names);
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{build_all, build_env_stacks, resolve_env_names, App, Error, Selection};
    use crate::compute;
    use crate::config::{self, ConfigRegistry, EnvName};
    use crate::lookup;

    #[test]
    fn dev_end_to_end() {
        let registry = ConfigRegistry::builtin();
        let mut app = App::new();

        build_env_stacks(&mut app, registry.get(EnvName::Dev), Selection::All).unwrap();

        let network = app.stack("CdkVpc-dev").unwrap();
        assert_eq!(
            network.template.resources["Vpc"].properties["Tags"][0]["Value"],
            json!("CdkVpc-dev/Vpc")
        );
        assert_eq!(network.template.resources_of_type("AWS::EC2::Subnet").count(), 2);

        let compute = app.stack("CdkEcsFargate-dev").unwrap();
        assert_eq!(
            compute.template.resources["Service01Service"].properties["DesiredCount"],
            json!(2)
        );
        assert_eq!(compute.env.account, "123456789012");
    }

    #[test]
    fn compute_without_network_reports_the_stack() {
        let registry = ConfigRegistry::builtin();
        let mut app = App::new();

        let error = build_env_stacks(&mut app, registry.get(EnvName::Prd), Selection::Compute)
            .err()
            .unwrap();
        assert_eq!(
            error,
            Error::Compute {
                stack: String::from("CdkEcsFargate-prd"),
                source: compute::Error::NetworkNotFound(lookup::Error::NetworkNotFound(
                    String::from("CdkVpc-prd/Vpc")
                )),
            }
        );
        assert_eq!(
            error.to_string(),
            "Stack CdkEcsFargate-prd: network lookup failed: \
             Network `CdkVpc-prd/Vpc` not found: no stack has declared it under that name"
        );
        assert_eq!(app.stacks().count(), 0);
    }

    #[test]
    fn unknown_environment_fails_before_any_stack() {
        let result = resolve_env_names(&[String::from("dev"), String::from("staging")]);

        assert_eq!(
            result.err().unwrap(),
            Error::Config(config::Error::UnknownEnvironment(String::from("staging")))
        );
    }

    #[test]
    fn defaults_to_every_environment() {
        assert_eq!(resolve_env_names(&[]).unwrap(), vec![EnvName::Dev, EnvName::Prd]);
        assert_eq!(
            resolve_env_names(&[String::from("prd"), String::from("prd")]).unwrap(),
            vec![EnvName::Prd]
        );
    }

    #[test]
    fn failed_environment_does_not_affect_others() {
        let registry = ConfigRegistry::builtin();
        let mut app = App::new();
        build_env_stacks(&mut app, registry.get(EnvName::Dev), Selection::Network).unwrap();

        let results = build_all(
            &mut app,
            &registry,
            &[EnvName::Prd, EnvName::Dev],
            Selection::Compute,
        );

        assert!(results[0].1.is_err());
        assert!(results[1].1.is_ok());
        assert!(app.stack("CdkEcsFargate-prd").is_none());
        assert!(app.stack("CdkEcsFargate-dev").is_some());
    }

    #[test]
    fn builds_both_environments_in_isolation() {
        let registry = ConfigRegistry::builtin();
        let mut app = App::new();

        let results = build_all(&mut app, &registry, &EnvName::ALL, Selection::All);
        assert!(results.iter().all(|(_, result)| result.is_ok()));
        assert_eq!(app.stacks().count(), 4);

        let prd = app.stack("CdkEcsFargate-prd").unwrap();
        assert_eq!(prd.dependencies, vec![String::from("CdkVpc-prd")]);
        assert_eq!(
            prd.template.resources_of_type("AWS::EFS::MountTarget").count(),
            3
        );
        assert_eq!(prd.env.region, "eu-west-1");
    }
}
