//! VM creation requests and the throttled creation pool.

mod worker;

use std::collections::HashSet;
use std::fmt;

use rand::Rng;
use serde::Serialize;

use crate::api::{PackageSize, VmVariant};
use crate::datacenter::DatacenterId;
use crate::error::{DispatchError, Result};

pub use worker::{CreationOutcome, CreationPool, CreationPoolSettings, CreationState, CreationStats};

/// Pro VMs accept at most this many virtual disks.
pub const MAX_DISKS: usize = 4;

/// Size of the primary disk when the operator gives none.
pub const DEFAULT_PRIMARY_DISK_GB: u32 = 10;

const NAME_SUFFIX_LEN: usize = 6;
const NAME_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmartParams {
    pub package: PackageSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProParams {
    pub cpu_count: u32,
    pub ram_gb: u32,
    /// Disk sizes in GB. The first entry is the primary disk; later zero
    /// entries are skipped.
    pub disks_gb: Vec<u32>,
    pub buy_public_ip: bool,
}

impl Default for ProParams {
    fn default() -> Self {
        Self {
            cpu_count: 1,
            ram_gb: 1,
            disks_gb: vec![DEFAULT_PRIMARY_DISK_GB],
            buy_public_ip: false,
        }
    }
}

/// Variant-specific part of a creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CreationSpec {
    Smart(SmartParams),
    Pro(ProParams),
}

impl CreationSpec {
    pub fn variant(&self) -> VmVariant {
        match self {
            CreationSpec::Smart(_) => VmVariant::Smart,
            CreationSpec::Pro(_) => VmVariant::Pro,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            CreationSpec::Smart(_) => Ok(()),
            CreationSpec::Pro(pro) => {
                if pro.cpu_count == 0 {
                    return Err(invalid("a pro VM needs at least one CPU"));
                }
                if pro.ram_gb == 0 {
                    return Err(invalid("a pro VM needs at least 1 GB of RAM"));
                }
                match pro.disks_gb.first() {
                    None | Some(0) => {
                        return Err(invalid("the primary disk must be larger than 0 GB"))
                    }
                    Some(_) => {}
                }
                if pro.disks_gb.len() > MAX_DISKS {
                    return Err(invalid(format!(
                        "at most {} disks can be attached, got {}",
                        MAX_DISKS,
                        pro.disks_gb.len()
                    )));
                }
                Ok(())
            }
        }
    }
}

/// What the operator asked for: `number` identical VMs on one datacenter.
#[derive(Clone)]
pub struct CreationBatch {
    pub datacenter: DatacenterId,
    pub name: String,
    pub template_id: String,
    pub admin_password: String,
    pub number: usize,
    pub spec: CreationSpec,
}

impl CreationBatch {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("the VM name must not be empty"));
        }
        if self.template_id.trim().is_empty() {
            return Err(invalid("a template id is required"));
        }
        if self.number == 0 {
            return Err(invalid("the number of VMs must be at least 1"));
        }
        self.spec.validate()
    }

    /// Validates the batch and splits it into one request per instance.
    pub fn expand(&self) -> Result<Vec<CreationRequest>> {
        self.expand_with(&mut rand::rng())
    }

    pub fn expand_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<CreationRequest>> {
        self.validate()?;
        Ok(instance_names(&self.name, self.number, rng)
            .into_iter()
            .map(|name| CreationRequest {
                datacenter: self.datacenter.clone(),
                name,
                template_id: self.template_id.clone(),
                admin_password: self.admin_password.clone(),
                spec: self.spec.clone(),
            })
            .collect())
    }
}

impl fmt::Debug for CreationBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreationBatch")
            .field("datacenter", &self.datacenter)
            .field("name", &self.name)
            .field("template_id", &self.template_id)
            .field("admin_password", &"<redacted>")
            .field("number", &self.number)
            .field("spec", &self.spec)
            .finish()
    }
}

/// One VM to create, with its final name already assigned.
#[derive(Clone)]
pub struct CreationRequest {
    pub datacenter: DatacenterId,
    pub name: String,
    pub template_id: String,
    pub admin_password: String,
    pub spec: CreationSpec,
}

impl fmt::Debug for CreationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreationRequest")
            .field("datacenter", &self.datacenter)
            .field("name", &self.name)
            .field("template_id", &self.template_id)
            .field("admin_password", &"<redacted>")
            .field("spec", &self.spec)
            .finish()
    }
}

/// Names for a batch of `number` instances.
///
/// A single instance keeps `base` as is. Larger batches get
/// `<base>-<6 random letters>`, unique within the batch.
pub fn instance_names<R: Rng + ?Sized>(base: &str, number: usize, rng: &mut R) -> Vec<String> {
    if number == 1 {
        return vec![base.to_string()];
    }

    let mut seen = HashSet::with_capacity(number);
    let mut names = Vec::with_capacity(number);
    while names.len() < number {
        let candidate = format!("{}-{}", base, random_suffix(rng));
        if seen.insert(candidate.clone()) {
            names.push(candidate);
        }
    }
    names
}

fn random_suffix<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_CHARSET[rng.random_range(0..NAME_CHARSET.len())] as char)
        .collect()
}

fn invalid(message: impl Into<String>) -> DispatchError {
    DispatchError::InvalidRequest(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pro_batch(number: usize) -> CreationBatch {
        CreationBatch {
            datacenter: DatacenterId::from("1"),
            name: "web".into(),
            template_id: "ubuntu-22".into(),
            admin_password: "hunter2".into(),
            number,
            spec: CreationSpec::Pro(ProParams::default()),
        }
    }

    #[test]
    fn batch_names_are_unique_and_suffixed() {
        let mut rng = StdRng::seed_from_u64(7);
        let names = instance_names("web", 50, &mut rng);
        assert_eq!(names.len(), 50);
        assert_eq!(names.iter().collect::<HashSet<_>>().len(), 50);
        for name in &names {
            let suffix = name.strip_prefix("web-").unwrap();
            assert_eq!(suffix.len(), 6);
            assert!(suffix.chars().all(|c| c.is_ascii_alphabetic()));
        }
    }

    #[test]
    fn single_instance_keeps_the_literal_name() {
        let requests = pro_batch(1).expand().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].name, "web");
    }

    #[test]
    fn zero_instances_are_refused() {
        let err = pro_batch(0).expand().unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(_)));
    }

    #[test]
    fn pro_requirements_are_checked() {
        let mut batch = pro_batch(1);
        batch.spec = CreationSpec::Pro(ProParams {
            disks_gb: vec![0],
            ..ProParams::default()
        });
        assert!(batch.validate().unwrap_err().to_string().contains("primary disk"));

        batch.spec = CreationSpec::Pro(ProParams {
            disks_gb: vec![10, 20, 30, 40, 50],
            ..ProParams::default()
        });
        assert!(batch.validate().unwrap_err().to_string().contains("at most 4"));

        batch.spec = CreationSpec::Pro(ProParams {
            cpu_count: 0,
            ..ProParams::default()
        });
        assert!(batch.validate().is_err());

        batch.spec = CreationSpec::Pro(ProParams {
            disks_gb: vec![10, 0, 20],
            ..ProParams::default()
        });
        assert!(batch.validate().is_ok());
    }

    #[test]
    fn debug_output_hides_the_password() {
        let batch = pro_batch(2);
        assert!(!format!("{:?}", batch).contains("hunter2"));
        let requests = batch.expand().unwrap();
        assert!(!format!("{:?}", requests[0]).contains("hunter2"));
    }
}
