//! Multi-step workflows built from fan-out calls.

use std::collections::BTreeSet;

use tracing::info;

use crate::api::{Template, VmRef};
use crate::datacenter::DatacenterId;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::operation::{DatacenterOp, DeferredOperation};
use crate::report::DispatchReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    On,
    Off,
}

impl PowerAction {
    fn op(self, vm: &VmRef) -> DatacenterOp {
        match self {
            PowerAction::On => DatacenterOp::PowerOn(vm.server_id),
            PowerAction::Off => DatacenterOp::PowerOff(vm.server_id),
        }
    }
}

/// What each step of [`Dispatcher::delete_matching`] did.
#[derive(Debug, Default)]
pub struct DeleteReport {
    pub matched: Vec<(DatacenterId, VmRef)>,
    pub powered_off: DispatchReport,
    pub drained: DispatchReport,
    pub deleted: DispatchReport,
    pub refreshed: DispatchReport,
}

impl DeleteReport {
    pub fn succeeded(&self) -> bool {
        self.powered_off.succeeded()
            && self.drained.succeeded()
            && self.deleted.succeeded()
            && self.refreshed.succeeded()
    }
}

impl Dispatcher {
    /// One datacenter when given, otherwise every logged-in one.
    fn targets(&self, datacenter: Option<&DatacenterId>) -> Result<Vec<DatacenterId>> {
        match datacenter {
            Some(id) => {
                self.require_logged_in(id)?;
                Ok(vec![id.clone()])
            }
            None => Ok(self.registry().list_logged_in()),
        }
    }

    /// Searches for servers whose name contains `pattern`.
    pub async fn find_vms(
        &self,
        pattern: Option<&str>,
        datacenter: Option<&DatacenterId>,
    ) -> Result<DispatchReport> {
        let targets = self.targets(datacenter)?;
        self.run_on(
            &targets,
            DatacenterOp::QueryVms {
                pattern: pattern.map(str::to_string),
            },
        )
        .await
    }

    /// Servers that own `ip`, tagged with their datacenter.
    pub async fn find_ip(
        &self,
        ip: &str,
        datacenter: Option<&DatacenterId>,
    ) -> Result<Vec<(DatacenterId, VmRef)>> {
        let targets = self.targets(datacenter)?;
        Ok(self
            .run_on(&targets, DatacenterOp::FindIp(ip.to_string()))
            .await?
            .vms())
    }

    /// Looks up templates on one logged-in datacenter.
    pub async fn find_template(
        &self,
        datacenter: &DatacenterId,
        name: &str,
        hypervisor: Option<u32>,
    ) -> Result<Vec<Template>> {
        let handle = self.require_logged_in(datacenter)?;
        let templates = handle.api().find_template(name, hypervisor).await?;
        info!(%datacenter, name, ?hypervisor, found = templates.len(), "Template search");
        Ok(templates)
    }

    pub async fn power_off_matching(
        &self,
        pattern: &str,
        datacenter: Option<&DatacenterId>,
    ) -> Result<DispatchReport> {
        self.power_matching(PowerAction::Off, pattern, datacenter)
            .await
    }

    pub async fn power_on_matching(
        &self,
        pattern: &str,
        datacenter: Option<&DatacenterId>,
    ) -> Result<DispatchReport> {
        self.power_matching(PowerAction::On, pattern, datacenter)
            .await
    }

    /// Queues one power action per matching server and waits for all of them.
    pub async fn power_matching(
        &self,
        action: PowerAction,
        pattern: &str,
        datacenter: Option<&DatacenterId>,
    ) -> Result<DispatchReport> {
        let matched = self.find_vms(Some(pattern), datacenter).await?.vms();
        info!(?action, pattern, matched = matched.len(), "Changing power state");
        self.run_batch(per_vm(&matched, |vm| action.op(vm))).await
    }

    /// Powers off every matching server, waits for the affected datacenters
    /// to finish their jobs, deletes the servers and refreshes the lists.
    pub async fn delete_matching(
        &self,
        pattern: &str,
        datacenter: Option<&DatacenterId>,
    ) -> Result<DeleteReport> {
        let matched = self.find_vms(Some(pattern), datacenter).await?.vms();
        if matched.is_empty() {
            return Ok(DeleteReport::default());
        }
        let affected: Vec<DatacenterId> = matched
            .iter()
            .map(|(dc, _)| dc.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        info!(pattern, matched = matched.len(), datacenters = affected.len(), "Deleting servers");

        let powered_off = self
            .run_batch(per_vm(&matched, |vm| DatacenterOp::PowerOff(vm.server_id)))
            .await?;
        let drained = self
            .run_on(&affected, DatacenterOp::WaitForPendingJobs)
            .await?;
        let deleted = self
            .run_batch(per_vm(&matched, |vm| DatacenterOp::Delete(vm.server_id)))
            .await?;
        let refreshed = self
            .run_on(&affected, DatacenterOp::RefreshServerList)
            .await?;

        Ok(DeleteReport {
            matched,
            powered_off,
            drained,
            deleted,
            refreshed,
        })
    }
}

fn per_vm(
    matched: &[(DatacenterId, VmRef)],
    op: impl Fn(&VmRef) -> DatacenterOp,
) -> Vec<DeferredOperation> {
    matched
        .iter()
        .map(|(dc, vm)| DeferredOperation::new(dc.clone(), op(vm)))
        .collect()
}
