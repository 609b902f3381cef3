use std::sync::{Arc, Mutex, PoisonError};

use crate::api::VmRef;
use crate::datacenter::DatacenterId;
use crate::error::DispatchError;
use crate::operation::OpOutput;

/// Result of one dispatched item.
#[derive(Debug)]
pub struct ItemOutcome {
    pub datacenter: DatacenterId,
    pub operation: String,
    pub result: Result<OpOutput, DispatchError>,
}

impl ItemOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Collected outcomes of one dispatch call, ordered by datacenter.
#[derive(Debug, Default)]
pub struct DispatchReport {
    outcomes: Vec<ItemOutcome>,
}

impl DispatchReport {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// True when every item finished without error. An empty report counts as success.
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(ItemOutcome::succeeded)
    }

    pub fn outcomes(&self) -> &[ItemOutcome] {
        &self.outcomes
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.succeeded())
    }

    /// Every VM returned by a successful item, tagged with its datacenter.
    pub fn vms(&self) -> Vec<(DatacenterId, VmRef)> {
        self.outcomes
            .iter()
            .filter_map(|outcome| outcome.result.as_ref().ok().map(|out| (outcome, out)))
            .flat_map(|(outcome, output)| {
                output
                    .vms()
                    .iter()
                    .map(move |vm| (outcome.datacenter.clone(), vm.clone()))
            })
            .collect()
    }

    pub fn into_outcomes(self) -> Vec<ItemOutcome> {
        self.outcomes
    }
}

impl From<Vec<ItemOutcome>> for DispatchReport {
    fn from(mut outcomes: Vec<ItemOutcome>) -> Self {
        // Workers finish in any order; present results deterministically.
        outcomes.sort_by(|a, b| a.datacenter.cmp(&b.datacenter));
        Self { outcomes }
    }
}

/// Shared slots workers write item outcomes into.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResultSlots {
    outcomes: Arc<Mutex<Vec<ItemOutcome>>>,
}

impl ResultSlots {
    pub(crate) fn record(&self, outcome: ItemOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outcome);
    }

    pub(crate) fn take(&self) -> DispatchReport {
        let outcomes = std::mem::take(
            &mut *self.outcomes.lock().unwrap_or_else(PoisonError::into_inner),
        );
        DispatchReport::from(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::VmVariant;

    fn vm(id: u64, name: &str) -> VmRef {
        VmRef {
            server_id: id,
            name: name.to_string(),
            variant: VmVariant::Pro,
            template_id: "tmpl".to_string(),
            ip_addresses: vec![],
            powered_on: true,
        }
    }

    #[test]
    fn sorts_by_datacenter_and_flattens_vms() {
        let slots = ResultSlots::default();
        slots.record(ItemOutcome {
            datacenter: DatacenterId::from("2"),
            operation: "query_vms".into(),
            result: Ok(OpOutput::Vms(vec![vm(7, "db")])),
        });
        slots.record(ItemOutcome {
            datacenter: DatacenterId::from("1"),
            operation: "query_vms".into(),
            result: Ok(OpOutput::Vms(vec![vm(1, "web"), vm(2, "web2")])),
        });

        let report = slots.take();
        assert_eq!(report.outcomes()[0].datacenter, DatacenterId::from("1"));
        let names: Vec<String> = report.vms().into_iter().map(|(_, vm)| vm.name).collect();
        assert_eq!(names, vec!["web", "web2", "db"]);
        assert!(report.succeeded());
    }

    #[test]
    fn one_failure_fails_the_report() {
        let report = DispatchReport::from(vec![
            ItemOutcome {
                datacenter: DatacenterId::from("1"),
                operation: "power_off".into(),
                result: Ok(OpOutput::Done),
            },
            ItemOutcome {
                datacenter: DatacenterId::from("2"),
                operation: "power_off".into(),
                result: Err(DispatchError::Panicked("boom".into())),
            },
        ]);
        assert!(!report.succeeded());
        assert_eq!(report.failures().count(), 1);
    }

    #[test]
    fn empty_report_is_a_success() {
        assert!(DispatchReport::default().succeeded());
    }
}
