// CLI argument parsing and the interactive command grammar

use clap::{Parser, Subcommand};
use console_dispatch::PackageSize;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "cloud-console")]
#[command(about = "Operator console for VMs spread over several datacenters")]
#[command(version)]
pub struct Args {
    /// Path to a custom console configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,
}

/// One line typed at the console prompt.
#[derive(Debug, Clone, Parser)]
#[command(name = "console", no_binary_name = true, disable_version_flag = true)]
pub struct ConsoleLine {
    #[command(subcommand)]
    pub command: ConsoleCommand,
}

impl ConsoleLine {
    pub fn parse_line(line: &str) -> Result<Self, clap::Error> {
        Self::try_parse_from(line.split_whitespace())
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum ConsoleCommand {
    /// Log into one datacenter, or every configured one with `--dc all`
    Login {
        /// Datacenter id, or "all"
        #[arg(long)]
        dc: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
    /// List servers, optionally filtered by name
    Showvm {
        #[arg(long)]
        dc: Option<String>,
        /// Part of the server name to match
        #[arg(long)]
        name: Option<String>,
    },
    /// Find the server that owns an IP address
    Findip {
        ip: String,
        #[arg(long)]
        dc: Option<String>,
    },
    /// Search the templates of one datacenter
    Findtemplate {
        /// Part of the template name to match
        #[arg(long)]
        template: String,
        #[arg(long, visible_alias = "dc")]
        datacenter: String,
        /// Only templates for this hypervisor id
        #[arg(long)]
        hypervisor: Option<u32>,
    },
    /// Power off every server whose name matches
    Poweroff {
        #[arg(long)]
        name: String,
        #[arg(long)]
        dc: Option<String>,
    },
    /// Power on every server whose name matches
    Poweron {
        #[arg(long)]
        name: String,
        #[arg(long)]
        dc: Option<String>,
    },
    /// Power off and delete every server whose name matches
    Deletevm {
        #[arg(long)]
        name: String,
        #[arg(long)]
        dc: Option<String>,
    },
    /// Queue VM creation
    Create {
        #[command(subcommand)]
        variant: CreateCommand,
    },
    /// Show pending remote jobs per datacenter
    Jobs,
    /// Wait for queued creations to finish
    Wait,
    /// Leave the console
    #[command(alias = "quit")]
    Exit,
}

#[derive(Debug, Clone, Subcommand)]
pub enum CreateCommand {
    /// Create smart VMs from a fixed package
    Smart {
        dc: String,
        name: String,
        template: String,
        admin_pwd: String,
        number: usize,
        /// small, medium, large or extralarge
        package: PackageSize,
    },
    /// Create pro VMs with custom hardware
    Pro {
        #[arg(long)]
        dc: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        template: String,
        #[arg(long = "adminpwd")]
        admin_pwd: String,
        #[arg(long = "cpuqty", default_value_t = 1)]
        cpu_qty: u32,
        /// RAM in GB
        #[arg(long = "ramqty", default_value_t = 1)]
        ram_qty: u32,
        #[arg(long, default_value_t = 1)]
        number: usize,
        /// Primary disk size in GB
        #[arg(long, default_value_t = 10)]
        disk1: u32,
        #[arg(long)]
        disk2: Option<u32>,
        #[arg(long)]
        disk3: Option<u32>,
        #[arg(long)]
        disk4: Option<u32>,
        /// Buy a public IP for each VM
        #[arg(long)]
        buyip: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_accept_config_and_debug() {
        let args = Args::try_parse_from(["cloud-console", "--config", "/tmp/c.yaml", "-d"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/tmp/c.yaml")));
        assert!(args.debug);
    }

    #[test]
    fn test_login_requires_credentials() {
        assert!(ConsoleLine::parse_line("login --dc 1").is_err());
        let line = ConsoleLine::parse_line("login --dc all --username op --password pw").unwrap();
        match line.command {
            ConsoleCommand::Login { dc, .. } => assert_eq!(dc, "all"),
            other => panic!("Expected login, got {:?}", other),
        }
    }

    #[test]
    fn test_create_smart_is_positional() {
        let line = ConsoleLine::parse_line("create smart 2 web ubuntu Secret1 3 large").unwrap();
        match line.command {
            ConsoleCommand::Create {
                variant: CreateCommand::Smart { number, package, .. },
            } => {
                assert_eq!(number, 3);
                assert_eq!(package, PackageSize::Large);
            }
            other => panic!("Expected create smart, got {:?}", other),
        }
        assert!(ConsoleLine::parse_line("create smart 2 web ubuntu Secret1 3 huge").is_err());
    }

    #[test]
    fn test_create_pro_defaults() {
        let line = ConsoleLine::parse_line(
            "create pro --dc 1 --name db --template debian --adminpwd Secret1 --disk2 50 --buyip",
        )
        .unwrap();
        match line.command {
            ConsoleCommand::Create {
                variant:
                    CreateCommand::Pro {
                        cpu_qty,
                        ram_qty,
                        number,
                        disk1,
                        disk2,
                        disk3,
                        buyip,
                        ..
                    },
            } => {
                assert_eq!((cpu_qty, ram_qty, number, disk1), (1, 1, 1, 10));
                assert_eq!(disk2, Some(50));
                assert_eq!(disk3, None);
                assert!(buyip);
            }
            other => panic!("Expected create pro, got {:?}", other),
        }
    }

    #[test]
    fn test_findtemplate_needs_template_and_datacenter() {
        assert!(ConsoleLine::parse_line("findtemplate --template ubuntu").is_err());
        let line =
            ConsoleLine::parse_line("findtemplate --template ubuntu --datacenter 2 --hypervisor 4")
                .unwrap();
        match line.command {
            ConsoleCommand::Findtemplate {
                template,
                datacenter,
                hypervisor,
            } => {
                assert_eq!(template, "ubuntu");
                assert_eq!(datacenter, "2");
                assert_eq!(hypervisor, Some(4));
            }
            other => panic!("Expected findtemplate, got {:?}", other),
        }
        assert!(ConsoleLine::parse_line("findtemplate --template ubuntu --dc 1").is_ok());
    }

    #[test]
    fn test_unknown_command_is_an_error() {
        assert!(ConsoleLine::parse_line("reboot --all").is_err());
        assert!(matches!(
            ConsoleLine::parse_line("quit").unwrap().command,
            ConsoleCommand::Exit
        ));
    }
}
