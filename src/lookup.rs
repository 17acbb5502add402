use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, fs, io, path::Path};
use tracing::{debug, info};

use crate::network;
use crate::template::import_value;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Network `{0}` not found: no stack has declared it under that name")]
    NetworkNotFound(String),

    #[error("Parsing error in lookup context {0}: {1}")]
    ParsingError(String, String),

    #[error("Invalid network `{0}` in lookup context: {1}")]
    InvalidEntry(String, String),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

/// Identifier of a network resource as seen from a consuming stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reference {
    /// Physical id of an already deployed resource.
    Literal(String),

    /// Name of a CloudFormation export of a stack in the same assembly.
    Import(String),
}

impl Reference {
    pub fn to_value(&self) -> Value {
        match self {
            Reference::Literal(id) => Value::String(id.clone()),
            Reference::Import(export_name) => import_value(export_name),
        }
    }
}

/// Typed result of declaring (or looking up) a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHandle {
    pub name: String,
    pub stack_id: String,
    pub az_count: u32,
    pub vpc_id: Reference,
    pub public_subnet_ids: Vec<Reference>,
}

impl NetworkHandle {
    pub fn public_subnet_values(&self) -> Vec<Value> {
        self.public_subnet_ids.iter().map(Reference::to_value).collect()
    }

    /// Checks the handle against the naming convention of its stack.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |reason: String| Err(Error::InvalidEntry(self.name.clone(), reason));

        if self.name != network::network_name(&self.stack_id) {
            return invalid(format!("name does not belong to stack {}", self.stack_id));
        }
        if self.az_count == 0 || self.public_subnet_ids.len() != self.az_count as usize {
            return invalid(format!(
                "{} public subnets for {} availability zones",
                self.public_subnet_ids.len(),
                self.az_count
            ));
        }
        if let Reference::Import(export_name) = &self.vpc_id {
            if *export_name != network::vpc_export(&self.stack_id) {
                return invalid(format!("VPC import `{}` is not exported by {}", export_name, self.stack_id));
            }
        }
        for (index, subnet) in self.public_subnet_ids.iter().enumerate() {
            if let Reference::Import(export_name) = subnet {
                if *export_name != network::subnet_export(&self.stack_id, index as u32 + 1) {
                    return invalid(format!(
                        "subnet import `{}` is not exported by {}",
                        export_name, self.stack_id
                    ));
                }
            }
        }

        return Ok(());
    }
}

/// Networks resolvable by name.
///
/// Filled by network stacks declared in this run, by deployed stack lookups
/// and by a persisted context file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkRegistry {
    networks: BTreeMap<String, NetworkHandle>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` under its name, replacing an earlier registration.
    pub fn register(&mut self, handle: NetworkHandle) {
        debug!(name = %handle.name, stack = %handle.stack_id, "registering network");
        self.networks.insert(handle.name.clone(), handle);
    }

    pub fn lookup(&self, name: &str) -> Result<&NetworkHandle, Error> {
        match self.networks.get(name) {
            Some(handle) => Ok(handle),
            None => Err(Error::NetworkNotFound(name.to_string())),
        }
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    /// Loads a context file. A missing file yields an empty registry.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = match fs::read_to_string(path) {
            Ok(raw_contents) => raw_contents,
            Err(error) => match error.kind() {
                io::ErrorKind::NotFound => return Ok(Self::new()),
                _ => return Err(Error::Unknown(error.to_string())),
            },
        };

        let registry: Self = match serde_json::from_str(&contents) {
            Ok(data) => data,
            Err(error) => {
                return Err(Error::ParsingError(
                    path.display().to_string(),
                    error.to_string(),
                ))
            }
        };

        for (name, handle) in &registry.networks {
            if *name != handle.name {
                return Err(Error::InvalidEntry(
                    name.clone(),
                    format!("entry describes network `{}`", handle.name),
                ));
            }
            handle.validate()?;
        }

        info!(path = %path.display(), networks = registry.len(), "loaded lookup context");
        return Ok(registry);
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let contents = match serde_json::to_string_pretty(self) {
            Ok(contents) => contents,
            Err(error) => return Err(Error::Unknown(error.to_string())),
        };

        match fs::write(path, contents) {
            Ok(_) => Ok(()),
            Err(error) => Err(Error::Unknown(error.to_string())),
        }
    }
}
