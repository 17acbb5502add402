//! CloudFormation template model.
//!
//! Templates are built from `serde_json::Value` property bags keyed by
//! logical id. All maps are ordered, so serializing the same declaration twice
//! yields the same bytes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::AccountEnvironment;

pub const FORMAT_VERSION: &str = "2010-09-09";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Logical id `{0}` is declared twice")]
    DuplicateLogicalId(String),

    #[error("`{from}` references `{to}`, which is not declared in this template")]
    DanglingReference { from: String, to: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,

    pub description: String,

    pub resources: BTreeMap<String, Resource>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    #[serde(rename = "Type")]
    pub resource_type: String,

    pub properties: Value,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl Resource {
    pub fn new(resource_type: &str, properties: Value) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            properties,
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, resource: &ResourceRef) -> Self {
        self.depends_on.push(resource.logical_id.clone());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub value: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<Export>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Export {
    pub name: String,
}

/// Handle to a resource declared in a template.
///
/// Only [`Template::add`] hands these out, so a handle always names a
/// resource that exists in the template it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    logical_id: String,
}

impl ResourceRef {
    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn reference(&self) -> Value {
        json!({ "Ref": self.logical_id })
    }

    pub fn get_att(&self, attribute: &str) -> Value {
        json!({ "Fn::GetAtt": [self.logical_id, attribute] })
    }
}

/// Value of another stack's export, resolved by the provisioning engine.
pub fn import_value(export_name: &str) -> Value {
    json!({ "Fn::ImportValue": export_name })
}

/// The `index`-th availability zone of the stack's region.
pub fn select_az(index: usize) -> Value {
    json!({ "Fn::Select": [index, { "Fn::GetAZs": "" }] })
}

pub fn tag(key: &str, value: &str) -> Value {
    json!({ "Key": key, "Value": value })
}

impl Template {
    pub fn new(description: &str) -> Self {
        Self {
            format_version: String::from(FORMAT_VERSION),
            description: description.to_string(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, logical_id: &str, resource: Resource) -> Result<ResourceRef, Error> {
        if self.resources.contains_key(logical_id) {
            return Err(Error::DuplicateLogicalId(logical_id.to_string()));
        }

        debug!(logical_id, resource_type = %resource.resource_type, "declaring resource");
        self.resources.insert(logical_id.to_string(), resource);

        return Ok(ResourceRef {
            logical_id: logical_id.to_string(),
        });
    }

    pub fn add_output(&mut self, name: &str, output: Output) -> Result<(), Error> {
        if self.outputs.contains_key(name) {
            return Err(Error::DuplicateLogicalId(name.to_string()));
        }

        self.outputs.insert(name.to_string(), output);
        return Ok(());
    }

    /// All resources of the given CloudFormation type.
    pub fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Resource)> + 'a {
        self.resources
            .iter()
            .filter(move |(_, resource)| resource.resource_type == resource_type)
    }

    /// Checks that every `Ref`, `Fn::GetAtt` and `DependsOn` targets a
    /// resource of this template. Pseudo parameters (`AWS::*`) are allowed.
    pub fn validate_references(&self) -> Result<(), Error> {
        let declared: BTreeSet<&str> = self.resources.keys().map(String::as_str).collect();

        for (logical_id, resource) in &self.resources {
            for target in &resource.depends_on {
                if !declared.contains(target.as_str()) {
                    return Err(Error::DanglingReference {
                        from: logical_id.clone(),
                        to: target.clone(),
                    });
                }
            }
            check_value(logical_id, &resource.properties, &declared)?;
        }

        for (name, output) in &self.outputs {
            check_value(name, &output.value, &declared)?;
        }

        return Ok(());
    }

    pub fn to_json(&self) -> Result<String, Error> {
        match serde_json::to_string_pretty(self) {
            Ok(contents) => Ok(contents),
            Err(error) => Err(Error::SerializationError(error.to_string())),
        }
    }
}

fn check_value(from: &str, value: &Value, declared: &BTreeSet<&str>) -> Result<(), Error> {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(target)) = map.get("Ref") {
                check_target(from, target, declared)?;
            }
            if let Some(Value::Array(args)) = map.get("Fn::GetAtt") {
                if let Some(Value::String(target)) = args.first() {
                    check_target(from, target, declared)?;
                }
            }
            for nested in map.values() {
                check_value(from, nested, declared)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                check_value(from, item, declared)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn check_target(from: &str, target: &str, declared: &BTreeSet<&str>) -> Result<(), Error> {
    if target.starts_with("AWS::") || declared.contains(target) {
        return Ok(());
    }

    return Err(Error::DanglingReference {
        from: from.to_string(),
        to: target.to_string(),
    });
}

/// A named, independently deployable template bound to an account/region.
#[derive(Debug, Clone, PartialEq)]
pub struct Stack {
    pub id: String,
    pub env: AccountEnvironment,
    pub template: Template,

    /// Ids of stacks that must be deployed before this one.
    pub dependencies: Vec<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Error, Output, Resource, Template};

    #[test]
    fn rejects_duplicate_logical_ids() {
        let mut template = Template::new("test");
        template
            .add("Bucket", Resource::new("AWS::S3::Bucket", json!({})))
            .unwrap();

        let result = template.add("Bucket", Resource::new("AWS::S3::Bucket", json!({})));
        assert_eq!(
            result.err().unwrap(),
            Error::DuplicateLogicalId(String::from("Bucket"))
        );
    }

    #[test]
    fn detects_dangling_references() {
        let mut template = Template::new("test");
        template
            .add(
                "Policy",
                Resource::new(
                    "AWS::S3::BucketPolicy",
                    json!({ "Bucket": { "Ref": "Missing" } }),
                ),
            )
            .unwrap();

        match template.validate_references().err().unwrap() {
            Error::DanglingReference { from, to } => {
                assert_eq!(from, "Policy");
                assert_eq!(to, "Missing");
            }
            _ => panic!("Expected `DanglingReference` error"),
        }
    }

    #[test]
    fn accepts_resolved_references_and_pseudo_parameters() {
        let mut template = Template::new("test");
        let bucket = template
            .add("Bucket", Resource::new("AWS::S3::Bucket", json!({})))
            .unwrap();
        template
            .add(
                "Policy",
                Resource::new(
                    "AWS::S3::BucketPolicy",
                    json!({
                        "Bucket": bucket.reference(),
                        "Region": { "Ref": "AWS::Region" },
                    }),
                )
                .depends_on(&bucket),
            )
            .unwrap();
        template
            .add_output(
                "BucketArn",
                Output {
                    description: None,
                    value: bucket.get_att("Arn"),
                    export: None,
                },
            )
            .unwrap();

        assert!(template.validate_references().is_ok());
    }

    #[test]
    fn serializes_with_cloudformation_keys() {
        let mut template = Template::new("test");
        template
            .add("Bucket", Resource::new("AWS::S3::Bucket", json!({})))
            .unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&template.to_json().unwrap()).unwrap();
        assert_eq!(value["AWSTemplateFormatVersion"], "2010-09-09");
        assert_eq!(value["Resources"]["Bucket"]["Type"], "AWS::S3::Bucket");
        assert!(value.get("Outputs").is_none());
        assert!(value["Resources"]["Bucket"].get("DependsOn").is_none());
    }
}
