//! Declares the network and compute stacks of each deployment environment
//! and synthesizes them into CloudFormation templates.
//!
//! Each environment gets two stacks, applied in order:
//!
//! * `CdkVpc-<env>`: a VPC with one public subnet per availability zone.
//! * `CdkEcsFargate-<env>`: a load balanced Fargate service whose tasks mount
//!   an encrypted EFS filesystem. It resolves its VPC through a
//!   [`lookup::NetworkRegistry`] keyed by `CdkVpc-<env>/Vpc`.

pub mod app;
pub mod compute;
pub mod config;
pub mod lookup;
pub mod network;
pub mod outputs;
pub mod template;
pub mod writer;
