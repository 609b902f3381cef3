// Handlers for console commands

use anyhow::Result;
use console_core::{
    console_error, console_error_with_details, console_info, console_println, console_progress,
    console_success, console_warning,
};
use console_dispatch::{
    CreationBatch, CreationOutcome, CreationSpec, DatacenterId, DatacenterOp, DispatchReport,
    Dispatcher, ItemOutcome, OpOutput, ProParams, SmartParams, VmRef,
};
use tracing::debug;

use crate::cli::{ConsoleCommand, CreateCommand};

/// Whether the prompt loop keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

#[must_use = "command execution results should be handled"]
pub async fn execute_command(dispatcher: &Dispatcher, command: ConsoleCommand) -> Result<Flow> {
    match command {
        ConsoleCommand::Login {
            dc,
            username,
            password,
        } => {
            debug!("Handling login command for {}", dc);
            handle_login(dispatcher, &dc, &username, &password).await?;
        }
        ConsoleCommand::Showvm { dc, name } => {
            let dc = dc.map(DatacenterId::from);
            let report = dispatcher.find_vms(name.as_deref(), dc.as_ref()).await?;
            print_vm_report(&report);
        }
        ConsoleCommand::Findip { ip, dc } => {
            let dc = dc.map(DatacenterId::from);
            let owners = dispatcher.find_ip(&ip, dc.as_ref()).await?;
            if owners.is_empty() {
                console_warning!("No VM owns {}", ip);
            }
            for (datacenter, vm) in &owners {
                console_println!("Datacenter {}: {}", datacenter, format_vm(vm));
            }
        }
        ConsoleCommand::Findtemplate {
            template,
            datacenter,
            hypervisor,
        } => {
            let dc = DatacenterId::from(datacenter);
            let templates = dispatcher.find_template(&dc, &template, hypervisor).await?;
            if templates.is_empty() {
                console_warning!("No template matches '{}' on datacenter {}", template, dc);
            }
            for found in &templates {
                console_println!("{}", found);
            }
        }
        ConsoleCommand::Poweroff { name, dc } => {
            let dc = dc.map(DatacenterId::from);
            let report = dispatcher.power_off_matching(&name, dc.as_ref()).await?;
            print_per_vm(&name, &report);
        }
        ConsoleCommand::Poweron { name, dc } => {
            let dc = dc.map(DatacenterId::from);
            let report = dispatcher.power_on_matching(&name, dc.as_ref()).await?;
            print_per_vm(&name, &report);
        }
        ConsoleCommand::Deletevm { name, dc } => {
            let dc = dc.map(DatacenterId::from);
            let report = dispatcher.delete_matching(&name, dc.as_ref()).await?;
            if report.matched.is_empty() {
                console_warning!("No VM matches '{}'", name);
            } else {
                print_failures(&report.powered_off);
                print_failures(&report.drained);
                print_outcomes(&report.deleted);
                print_failures(&report.refreshed);
            }
        }
        ConsoleCommand::Create { variant } => {
            let batch = creation_batch(variant);
            let names = dispatcher.enqueue_creation(&batch)?;
            console_info!(
                "Queued creation of {} {} VM(s) on datacenter {}: {}",
                names.len(),
                batch.spec.variant(),
                batch.datacenter,
                names.join(", ")
            );
        }
        ConsoleCommand::Jobs => {
            let report = dispatcher
                .run_for_all_logged_in(DatacenterOp::PendingJobs)
                .await?;
            warn_if_nothing_logged_in(&report);
            for outcome in report.outcomes() {
                match &outcome.result {
                    Ok(OpOutput::PendingJobs(jobs)) => {
                        console_println!("Datacenter {}: {} pending job(s)", outcome.datacenter, jobs.len());
                        for job in jobs {
                            console_println!("  #{} {} {}", job.job_id, job.operation, job.server_name);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => console_error!("Datacenter {}: {}", outcome.datacenter, e),
                }
            }
        }
        ConsoleCommand::Wait => {
            let outstanding = dispatcher.creations().outstanding();
            if outstanding > 0 {
                console_progress!("Waiting for {} creation(s)...", outstanding);
            }
            dispatcher.join_creations().await;
            for outcome in dispatcher.take_creation_outcomes() {
                print_creation(&outcome);
            }
        }
        ConsoleCommand::Exit => return Ok(Flow::Exit),
    }
    Ok(Flow::Continue)
}

async fn handle_login(
    dispatcher: &Dispatcher,
    dc: &str,
    username: &str,
    password: &str,
) -> Result<()> {
    if dc.eq_ignore_ascii_case("all") {
        for (id, result) in dispatcher.login_all(username, password).await {
            match result {
                Ok(()) => console_success!("Logged in to datacenter {}", id),
                Err(e) => console_error!("Datacenter {}: {}", id, e),
            }
        }
        return Ok(());
    }

    let id = DatacenterId::from(dc);
    dispatcher.login(&id, username, password).await?;
    console_success!("Logged in to datacenter {}", id);
    Ok(())
}

fn creation_batch(command: CreateCommand) -> CreationBatch {
    match command {
        CreateCommand::Smart {
            dc,
            name,
            template,
            admin_pwd,
            number,
            package,
        } => CreationBatch {
            datacenter: DatacenterId::from(dc),
            name,
            template_id: template,
            admin_password: admin_pwd,
            number,
            spec: CreationSpec::Smart(SmartParams { package }),
        },
        CreateCommand::Pro {
            dc,
            name,
            template,
            admin_pwd,
            cpu_qty,
            ram_qty,
            number,
            disk1,
            disk2,
            disk3,
            disk4,
            buyip,
        } => {
            let mut disks_gb = vec![disk1];
            disks_gb.extend([disk2, disk3, disk4].into_iter().flatten());
            CreationBatch {
                datacenter: DatacenterId::from(dc),
                name,
                template_id: template,
                admin_password: admin_pwd,
                number,
                spec: CreationSpec::Pro(ProParams {
                    cpu_count: cpu_qty,
                    ram_gb: ram_qty,
                    disks_gb,
                    buy_public_ip: buyip,
                }),
            }
        }
    }
}

fn format_vm(vm: &VmRef) -> String {
    format!(
        "{:>6}  {:<28} {:<6} {:<4} {}",
        vm.server_id,
        vm.name,
        vm.variant.to_string(),
        if vm.powered_on { "on" } else { "off" },
        vm.ip_addresses.join(", ")
    )
}

fn print_vm_report(report: &DispatchReport) {
    warn_if_nothing_logged_in(report);
    for outcome in report.outcomes() {
        match &outcome.result {
            Ok(output) => {
                console_println!("Datacenter {} ({} VM(s))", outcome.datacenter, output.vms().len());
                for vm in output.vms() {
                    console_println!("  {}", format_vm(vm));
                }
            }
            Err(e) => console_error!("Datacenter {}: {}", outcome.datacenter, e),
        }
    }
}

fn warn_if_nothing_logged_in(report: &DispatchReport) {
    if report.is_empty() {
        console_warning!("No datacenter is logged in. Use: login --dc <id|all>");
    }
}

/// One line per item, naming the datacenter and the operation.
fn outcome_line(outcome: &ItemOutcome) -> String {
    format!("Datacenter {}: {}", outcome.datacenter, outcome.operation)
}

fn print_outcome(outcome: &ItemOutcome) {
    match &outcome.result {
        Ok(_) => console_success!("{} done", outcome_line(outcome)),
        Err(e) => console_error_with_details!(
            format!("{} failed", outcome_line(outcome)),
            [e.to_string()]
        ),
    }
}

fn print_outcomes(report: &DispatchReport) {
    report.outcomes().iter().for_each(print_outcome);
}

fn print_failures(report: &DispatchReport) {
    report.failures().for_each(print_outcome);
}

fn print_per_vm(pattern: &str, report: &DispatchReport) {
    if report.is_empty() {
        console_warning!("No VM matches '{}'", pattern);
    }
    print_outcomes(report);
}

fn print_creation(outcome: &CreationOutcome) {
    match &outcome.result {
        Ok(()) => console_success!(
            "Creation of VM: {} on datacenter {} Done.",
            outcome.name,
            outcome.datacenter
        ),
        Err(e) => console_error_with_details!(
            format!(
                "Cannot create VM {} on datacenter {}",
                outcome.name, outcome.datacenter
            ),
            [e.to_string()]
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use console_dispatch::simulated::SimulatedConnector;
    use console_dispatch::DispatcherSettings;
    use std::sync::Arc;

    fn dispatcher() -> Dispatcher {
        let connector = Arc::new(SimulatedConnector::default().with_demo_servers());
        let mut settings = DispatcherSettings::default();
        settings.datacenters = vec![DatacenterId::from("1"), DatacenterId::from("2")];
        Dispatcher::start(settings, connector)
    }

    #[tokio::test]
    async fn test_exit_stops_the_loop() {
        let dispatcher = dispatcher();
        let flow = execute_command(&dispatcher, ConsoleCommand::Exit).await.unwrap();
        assert_eq!(flow, Flow::Exit);
    }

    #[tokio::test]
    async fn test_login_all_logs_into_every_configured_datacenter() {
        let dispatcher = dispatcher();
        let command = ConsoleCommand::Login {
            dc: "all".into(),
            username: "op".into(),
            password: "pw".into(),
        };
        let flow = execute_command(&dispatcher, command).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(dispatcher.registry().list_logged_in().len(), 2);
    }

    #[tokio::test]
    async fn test_create_without_login_fails() {
        let dispatcher = dispatcher();
        let command = ConsoleCommand::Create {
            variant: CreateCommand::Smart {
                dc: "1".into(),
                name: "web".into(),
                template: "ubuntu".into(),
                admin_pwd: "pw".into(),
                number: 2,
                package: console_dispatch::PackageSize::Small,
            },
        };
        assert!(execute_command(&dispatcher, command).await.is_err());
    }

    #[tokio::test]
    async fn test_findtemplate_searches_one_datacenter() {
        let dispatcher = dispatcher();
        let login = ConsoleCommand::Login {
            dc: "1".into(),
            username: "op".into(),
            password: "pw".into(),
        };
        execute_command(&dispatcher, login).await.unwrap();

        let found = ConsoleCommand::Findtemplate {
            template: "debian".into(),
            datacenter: "1".into(),
            hypervisor: None,
        };
        assert_eq!(execute_command(&dispatcher, found).await.unwrap(), Flow::Continue);

        let elsewhere = ConsoleCommand::Findtemplate {
            template: "debian".into(),
            datacenter: "2".into(),
            hypervisor: None,
        };
        assert!(execute_command(&dispatcher, elsewhere).await.is_err());
    }

    #[tokio::test]
    async fn test_power_results_are_reported_per_vm() {
        let dispatcher = dispatcher();
        dispatcher.login_all("op", "pw").await;
        let report = dispatcher
            .power_off_matching("web", None)
            .await
            .unwrap();

        let lines: Vec<String> = report.outcomes().iter().map(outcome_line).collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Datacenter 1: power_off server "));
        assert!(lines[3].starts_with("Datacenter 2: power_off server "));
        assert_eq!(lines.iter().collect::<std::collections::HashSet<_>>().len(), 4);
    }

    #[test]
    fn test_pro_batch_collects_optional_disks() {
        let batch = creation_batch(CreateCommand::Pro {
            dc: "3".into(),
            name: "db".into(),
            template: "debian".into(),
            admin_pwd: "pw".into(),
            cpu_qty: 4,
            ram_qty: 8,
            number: 1,
            disk1: 40,
            disk2: None,
            disk3: Some(100),
            disk4: None,
            buyip: true,
        });
        match batch.spec {
            CreationSpec::Pro(pro) => {
                assert_eq!(pro.disks_gb, vec![40, 100]);
                assert!(pro.buy_public_ip);
            }
            other => panic!("Expected a pro spec, got {:?}", other),
        }
    }
}
