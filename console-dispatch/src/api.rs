//! Contracts the dispatch layer consumes from the vendor cloud SDK.
//!
//! Nothing in this module talks to a network. A real deployment implements
//! [`CloudApi`] on top of the vendor client; tests and the demo console use
//! [`crate::simulated::SimulatedCloud`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use console_core::error::Result;
use serde::Serialize;

use crate::datacenter::DatacenterId;

pub type ServerId = u64;

/// Closed set of VM flavors a datacenter can create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmVariant {
    Smart,
    Pro,
}

impl fmt::Display for VmVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmVariant::Smart => write!(f, "smart"),
            VmVariant::Pro => write!(f, "pro"),
        }
    }
}

/// Fixed hardware packages offered for smart VMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageSize {
    Small,
    Medium,
    Large,
    ExtraLarge,
}

impl FromStr for PackageSize {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "small" => Ok(PackageSize::Small),
            "medium" => Ok(PackageSize::Medium),
            "large" => Ok(PackageSize::Large),
            "extralarge" => Ok(PackageSize::ExtraLarge),
            other => Err(format!(
                "unknown package '{}', expected one of: small, medium, large, extralarge",
                other
            )),
        }
    }
}

impl fmt::Display for PackageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PackageSize::Small => "small",
            PackageSize::Medium => "medium",
            PackageSize::Large => "large",
            PackageSize::ExtraLarge => "extralarge",
        };
        f.write_str(name)
    }
}

/// A server as reported by a datacenter search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmRef {
    pub server_id: ServerId,
    pub name: String,
    pub variant: VmVariant,
    pub template_id: String,
    pub ip_addresses: Vec<String>,
    pub powered_on: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicIp {
    pub resource_id: String,
    pub address: String,
}

/// A VM template offered by a datacenter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Template {
    pub template_id: String,
    pub name: String,
    pub hypervisor: u32,
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, hypervisor {})", self.template_id, self.name, self.hypervisor)
    }
}

/// A job the remote side has not finished yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingJob {
    pub job_id: u64,
    pub server_name: String,
    pub operation: String,
}

/// Result of looking up the job attached to a server name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobLookup {
    Pending(u64),
    NotFound,
}

/// Builder for one VM creation call.
///
/// Smart creators only honour [`VmCreator::set_package`]; pro creators use
/// the CPU, RAM, disk and public IP setters.
#[async_trait]
pub trait VmCreator: Send {
    fn set_package(&mut self, size: PackageSize);
    fn set_cpu_count(&mut self, count: u32);
    fn set_ram_amount(&mut self, gigabytes: u32);
    fn attach_disk(&mut self, size_gb: u32);
    fn attach_public_ip(&mut self, resource_id: &str);

    /// Submits the creation. `Ok(false)` means the remote side refused it.
    async fn commit(&mut self, endpoint: &str) -> Result<bool>;
}

/// One authenticated session against a remote datacenter.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> Result<()>;

    /// Base URL creation requests are committed to.
    fn endpoint(&self) -> String;

    async fn list_pending_jobs(&self) -> Result<Vec<PendingJob>>;
    async fn find_job(&self, server_name: &str) -> Result<JobLookup>;
    async fn power_on(&self, id: ServerId) -> Result<()>;
    async fn power_off(&self, id: ServerId) -> Result<()>;
    async fn delete(&self, id: ServerId) -> Result<()>;

    /// Servers whose name contains `pattern`, or every server when `None`.
    async fn query_vms(&self, pattern: Option<&str>) -> Result<Vec<VmRef>>;

    /// Templates whose name contains `name`, optionally limited to one hypervisor.
    async fn find_template(&self, name: &str, hypervisor: Option<u32>) -> Result<Vec<Template>>;

    async fn purchase_public_ip(&self) -> Result<PublicIp>;
    async fn refresh_server_list(&self) -> Result<()>;

    fn new_creator(
        &self,
        variant: VmVariant,
        name: &str,
        template_id: &str,
        admin_password: &str,
    ) -> Box<dyn VmCreator>;
}

/// Opens sessions for datacenters by identifier.
pub trait CloudConnector: Send + Sync {
    fn connect(&self, datacenter: &DatacenterId) -> Result<Arc<dyn CloudApi>>;
}

impl<F> CloudConnector for F
where
    F: Fn(&DatacenterId) -> Result<Arc<dyn CloudApi>> + Send + Sync,
{
    fn connect(&self, datacenter: &DatacenterId) -> Result<Arc<dyn CloudApi>> {
        self(datacenter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_names_round_trip_through_display() {
        for package in [
            PackageSize::Small,
            PackageSize::Medium,
            PackageSize::Large,
            PackageSize::ExtraLarge,
        ] {
            assert_eq!(package.to_string().parse::<PackageSize>(), Ok(package));
        }
    }

    #[test]
    fn unknown_package_lists_the_choices() {
        let err = "huge".parse::<PackageSize>().unwrap_err();
        assert!(err.contains("extralarge"));
    }
}
