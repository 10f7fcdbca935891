//! brgnet main entry point
//!
//! One invocation performs one engine operation and exits with a code that
//! classifies the outcome (see `BrgError::exit_code`).

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error};

use brgnet::config::{EngineConfig, DEFAULT_CONFIG_PATH};
use brgnet::engine::{AddInterface, ChangeSet, PeerSpec};
use brgnet::logging::init_logging;
use brgnet::model::{IpFamily, LinkState, LogLevel, LogSink, Protocol, Variant};
use brgnet::store::StateStore;
use brgnet::wireguard::ObfuscationParams;
use brgnet::{BrgError, Reconciler, APP_NAME, VERSION};

/// Tunnel configuration reconciliation engine
#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = VERSION, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Simulate kernel and packet filter changes
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Toggle {
    Enable,
    Disable,
}

impl Toggle {
    fn enabled(self) -> bool {
        matches!(self, Toggle::Enable)
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PortAction {
    Allow,
    Deny,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LinkArg {
    Up,
    Down,
}

impl From<LinkArg> for LinkState {
    fn from(arg: LinkArg) -> Self {
        match arg {
            LinkArg::Up => LinkState::Up,
            LinkArg::Down => LinkState::Down,
        }
    }
}

#[derive(Subcommand, Debug)]
enum PeerCommand {
    /// Create a peer or replace its settings
    Set {
        /// Interface name
        name: String,
        /// Peer public key
        public_key: String,
        /// Allowed IPs (repeat or comma-separate)
        #[arg(short, long = "allowed-ips", required = true)]
        allowed_ips: Vec<String>,
        /// Endpoint as IP:port
        #[arg(short, long)]
        endpoint: Option<String>,
        /// Persistent keepalive in seconds
        #[arg(short, long, allow_negative_numbers = true)]
        keepalive: Option<i64>,
        /// Read a preshared key from stdin
        #[arg(long)]
        preshared_key_stdin: bool,
    },
    /// Remove a peer
    Remove {
        /// Interface name
        name: String,
        /// Peer public key
        public_key: String,
    },
}

#[derive(Subcommand, Debug)]
enum AddressCommand {
    /// Bind an address
    Add {
        /// Interface name
        name: String,
        /// Address with prefix, e.g. 10.10.10.254/24
        address: String,
    },
    /// Unbind an address
    Remove {
        /// Interface name
        name: String,
        /// Address with prefix
        address: String,
    },
}

#[derive(Subcommand, Debug)]
enum GetCommand {
    /// One interface
    Interface {
        /// Interface name
        name: String,
    },
    /// Addresses of one interface, or of all
    Addresses {
        /// Interface name
        name: Option<String>,
    },
    /// Peers of one interface, or of all
    Peers {
        /// Interface name
        name: Option<String>,
    },
    /// Forwarding toggles
    Forwarding,
    /// Allowed inbound ports
    Ports,
    /// NAT rules
    Nat,
    /// Forwarding-block rules
    Firewall,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an interface (down, without keys)
    Add {
        /// Interface name
        name: String,
        /// Protocol variant: standard or obfuscated
        #[arg(long, default_value = "standard")]
        variant: Variant,
        /// MTU
        #[arg(long)]
        mtu: Option<u16>,
        /// Directory for the interface log file
        #[arg(long)]
        log_dir: PathBuf,
        /// Log level: silent, error or debug
        #[arg(long, default_value = "error")]
        log_level: LogLevel,
        /// Write the log as JSON lines
        #[arg(long)]
        json_log: bool,
        /// Obfuscation parameters as JSON, or "auto" to generate them
        #[arg(long)]
        obfuscation: Option<String>,
    },
    /// Bring an interface up or down
    Link {
        /// Interface name
        name: String,
        /// Desired state
        state: LinkArg,
    },
    /// Set the UDP listen port
    Port {
        /// Interface name
        name: String,
        /// Port (0 lets the kernel choose)
        port: u16,
    },
    /// Install a private key read from stdin, or generate one
    Key {
        /// Interface name
        name: String,
        /// Read the private key from stdin instead of generating it
        #[arg(long)]
        stdin: bool,
    },
    /// Manage peers
    #[command(subcommand)]
    Peer(PeerCommand),
    /// Manage address bindings
    #[command(subcommand)]
    Address(AddressCommand),
    /// Change the MTU
    Mtu {
        /// Interface name
        name: String,
        /// MTU
        mtu: u16,
    },
    /// Replace the obfuscation parameters of an obfuscated interface
    Obfuscation {
        /// Interface name
        name: String,
        /// Parameters as JSON, or "auto" to generate them
        params: String,
    },
    /// Enable or disable a NAT rule
    Nat {
        /// Enable or disable
        action: Toggle,
        /// Source subnet
        subnet: String,
        /// Egress interface (any when omitted)
        #[arg(long)]
        egress: Option<String>,
        /// Interface on whose behalf the rule is set
        #[arg(long)]
        interface: Option<String>,
    },
    /// Enable or disable a forwarding-block rule
    Firewall {
        /// Enable or disable
        action: Toggle,
        /// Source subnet
        subnet: String,
        /// Egress interface (any when omitted)
        #[arg(long)]
        egress: Option<String>,
        /// Interface on whose behalf the rule is set
        #[arg(long)]
        interface: Option<String>,
    },
    /// Enable or disable kernel forwarding
    Forwarding {
        /// ipv4 or ipv6
        family: IpFamily,
        /// Enable or disable
        action: Toggle,
    },
    /// Allow or deny an inbound port
    FirewallPort {
        /// Allow or deny
        action: PortAction,
        /// tcp or udp
        protocol: Protocol,
        /// Port
        port: u16,
    },
    /// Apply a JSON change set read from a file ("-" for stdin)
    Apply {
        /// Interface name
        name: String,
        /// Change set file
        file: PathBuf,
    },
    /// Delete an interface
    Delete {
        /// Interface name
        name: String,
    },
    /// Re-drive kernel state toward the stored state
    Reconcile {
        /// Interface name (everything when omitted)
        name: Option<String>,
    },
    /// Show state
    #[command(subcommand)]
    Get(GetCommand),
    /// Generate a key pair without storing it
    Genkey,
}

impl Commands {
    /// Interface whose log sink receives this command's output
    fn interface(&self) -> Option<&str> {
        match self {
            Commands::Add { name, .. }
            | Commands::Link { name, .. }
            | Commands::Port { name, .. }
            | Commands::Key { name, .. }
            | Commands::Mtu { name, .. }
            | Commands::Obfuscation { name, .. }
            | Commands::Apply { name, .. }
            | Commands::Delete { name } => Some(name.as_str()),
            Commands::Peer(PeerCommand::Set { name, .. })
            | Commands::Peer(PeerCommand::Remove { name, .. })
            | Commands::Address(AddressCommand::Add { name, .. })
            | Commands::Address(AddressCommand::Remove { name, .. }) => Some(name.as_str()),
            Commands::Nat { interface, .. } | Commands::Firewall { interface, .. } => {
                interface.as_deref()
            }
            Commands::Reconcile { name } => name.as_deref(),
            _ => None,
        }
    }

    /// Whether `NotFound` means the command's goal is already reached
    fn is_removal(&self) -> bool {
        matches!(
            self,
            Commands::Peer(PeerCommand::Remove { .. })
                | Commands::Address(AddressCommand::Remove { .. })
                | Commands::Delete { .. }
                | Commands::Nat {
                    action: Toggle::Disable,
                    ..
                }
                | Commands::Firewall {
                    action: Toggle::Disable,
                    ..
                }
        )
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match EngineConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", APP_NAME, e);
            return ExitCode::from(e.exit_code() as u8);
        }
    };
    config.dry_run |= cli.dry_run;

    let sink = log_sink(&config, &cli.command);
    let target = cli.command.interface().map(str::to_string);
    let logging = init_logging(cli.verbose, sink.as_ref().zip(target.as_deref())).or_else(|e| {
        eprintln!("{}: interface log unavailable: {}", APP_NAME, e);
        init_logging(cli.verbose, None)
    });
    if let Err(e) = logging {
        eprintln!("{}: {}", APP_NAME, e);
        return ExitCode::from(e.exit_code() as u8);
    }

    debug!("{} v{} with config {:?}", APP_NAME, VERSION, cli.config);

    let removal = cli.command.is_removal();
    match run(config, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e.downcast_ref::<BrgError>().map_or(1, BrgError::exit_code);
            if removal && code == BrgError::NotFound(String::new()).exit_code() {
                debug!("Nothing to remove: {:#}", e);
                return ExitCode::SUCCESS;
            }
            error!("{:#}", e);
            ExitCode::from(code as u8)
        }
    }
}

/// Log sink for the command's interface: the request's own for `add`, the
/// stored one otherwise
fn log_sink(config: &EngineConfig, command: &Commands) -> Option<LogSink> {
    if let Commands::Add {
        log_dir,
        log_level,
        json_log,
        ..
    } = command
    {
        return Some(LogSink {
            dir: log_dir.clone(),
            level: *log_level,
            json: *json_log,
        });
    }

    let name = command.interface()?;
    let store = StateStore::open(&config.state_dir).ok()?;
    store.load_interface(name).ok().flatten().map(|r| r.log)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_stdin_line(what: &str) -> anyhow::Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .with_context(|| format!("Failed to read {} from stdin", what))?;
    Ok(line.trim().to_string())
}

fn parse_obfuscation(value: &str) -> brgnet::Result<ObfuscationParams> {
    if value == "auto" {
        return Ok(ObfuscationParams::generate());
    }
    serde_json::from_str(value).map_err(|e| {
        BrgError::InvalidArgument(format!("Invalid obfuscation parameter block: {}", e))
    })
}

fn read_change_set(file: &Path) -> anyhow::Result<ChangeSet> {
    let data = if file.as_os_str() == "-" {
        let mut data = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut data)
            .context("Failed to read change set from stdin")?;
        data
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read change set {:?}", file))?
    };
    serde_json::from_str(&data)
        .map_err(|e| BrgError::InvalidArgument(format!("Invalid change set: {}", e)).into())
}

/// Run the CLI command
async fn run(config: EngineConfig, command: Commands) -> anyhow::Result<()> {
    let engine = Reconciler::from_config(config)?;
    let query = engine.query();

    match command {
        Commands::Add {
            name,
            variant,
            mtu,
            log_dir,
            log_level,
            json_log,
            obfuscation,
        } => {
            let obfuscation = obfuscation.as_deref().map(parse_obfuscation).transpose()?;
            engine
                .add_interface(AddInterface {
                    name,
                    variant,
                    mtu,
                    log: LogSink {
                        dir: log_dir,
                        level: log_level,
                        json: json_log,
                    },
                    obfuscation,
                })
                .await?;
        }
        Commands::Link { name, state } => {
            engine.set_link(&name, state.into()).await?;
        }
        Commands::Port { name, port } => {
            engine.set_port(&name, port).await?;
        }
        Commands::Key { name, stdin } => {
            let key = if stdin {
                Some(read_stdin_line("private key")?)
            } else {
                None
            };
            let public = engine.set_private_key(&name, key.as_deref()).await?;
            println!("{}", public);
        }
        Commands::Peer(PeerCommand::Set {
            name,
            public_key,
            allowed_ips,
            endpoint,
            keepalive,
            preshared_key_stdin,
        }) => {
            let preshared_key = if preshared_key_stdin {
                Some(read_stdin_line("preshared key")?)
            } else {
                None
            };
            let spec = PeerSpec {
                public_key,
                allowed_ips,
                endpoint,
                keepalive,
                preshared_key,
            };
            engine.upsert_peer(&name, &spec).await?;
        }
        Commands::Peer(PeerCommand::Remove { name, public_key }) => {
            engine.remove_peer(&name, &public_key).await?;
        }
        Commands::Address(AddressCommand::Add { name, address }) => {
            engine.add_address(&name, &address).await?;
        }
        Commands::Address(AddressCommand::Remove { name, address }) => {
            engine.remove_address(&name, &address).await?;
        }
        Commands::Mtu { name, mtu } => {
            engine.set_mtu(&name, mtu).await?;
        }
        Commands::Obfuscation { name, params } => {
            engine.set_obfuscation(&name, parse_obfuscation(&params)?).await?;
        }
        Commands::Nat {
            action,
            subnet,
            egress,
            interface,
        } => {
            engine
                .set_nat(
                    &subnet,
                    egress.as_deref(),
                    action.enabled(),
                    interface.as_deref(),
                )
                .await?;
        }
        Commands::Firewall {
            action,
            subnet,
            egress,
            interface,
        } => {
            engine
                .set_firewall_rule(
                    &subnet,
                    egress.as_deref(),
                    action.enabled(),
                    interface.as_deref(),
                )
                .await?;
        }
        Commands::Forwarding { family, action } => {
            engine.set_forwarding(family, action.enabled()).await?;
        }
        Commands::FirewallPort {
            action,
            protocol,
            port,
        } => {
            engine
                .set_firewall_port(protocol, port, matches!(action, PortAction::Allow))
                .await?;
        }
        Commands::Apply { name, file } => {
            let changes = read_change_set(&file)?;
            engine.apply(&name, &changes).await?;
        }
        Commands::Delete { name } => {
            engine.delete_interface(&name).await?;
        }
        Commands::Reconcile { name: Some(name) } => {
            engine.reconcile(&name).await?;
        }
        Commands::Reconcile { name: None } => {
            let report = engine.reconcile_all().await?;
            for (name, e) in &report.failures {
                error!("{}: {}", name, e);
            }
            if let Some(e) = report.global {
                return Err(e.into());
            }
            if let Some((_, e)) = report.failures.into_iter().next() {
                return Err(e.into());
            }
        }
        Commands::Get(get) => match get {
            GetCommand::Interface { name } => print_json(&query.get_interface(&name).await?)?,
            GetCommand::Addresses { name: Some(name) } => {
                print_json(&query.get_addresses(&name).await?)?
            }
            GetCommand::Addresses { name: None } => {
                print_json(&query.get_global_addresses().await?)?
            }
            GetCommand::Peers { name: Some(name) } => print_json(&query.get_peers(&name).await?)?,
            GetCommand::Peers { name: None } => print_json(&query.get_global_peers().await?)?,
            GetCommand::Forwarding => print_json(&query.get_forwarding().await?)?,
            GetCommand::Ports => print_json(&query.get_firewall_ports().await?)?,
            GetCommand::Nat => print_json(&query.get_nat().await?)?,
            GetCommand::Firewall => print_json(&query.get_firewall_rules().await?)?,
        },
        Commands::Genkey => print_json(&query.generate_keypair())?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use brgnet::ErrorKind;

    #[test]
    fn test_cli_parses_peer_set() {
        let cli = Cli::try_parse_from([
            "brgnet",
            "peer",
            "set",
            "wg0",
            "7cnFoHH7r0p3ZLlOqVSkCuUjDDT/xRTjwrCl6ElbRkY=",
            "-a",
            "10.0.0.2/32",
            "-k",
            "-5",
        ])
        .unwrap();
        assert_eq!(cli.command.interface(), Some("wg0"));
        assert!(!cli.command.is_removal());
    }

    #[test]
    fn test_removal_commands() {
        let cli = Cli::try_parse_from(["brgnet", "nat", "disable", "10.0.0.0/24"]).unwrap();
        assert!(cli.command.is_removal());
        assert_eq!(cli.command.interface(), None);

        let cli = Cli::try_parse_from(["brgnet", "delete", "wg0"]).unwrap();
        assert!(cli.command.is_removal());
    }

    #[test]
    fn test_variant_and_family_arguments() {
        let cli = Cli::try_parse_from([
            "brgnet", "add", "awg0", "--variant", "awg", "--log-dir", "/tmp",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Add {
                variant: Variant::Obfuscated,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["brgnet", "forwarding", "ipv7", "enable"]).is_err());
    }

    #[test]
    fn test_obfuscation_argument() {
        assert!(parse_obfuscation("auto").unwrap().validate().is_ok());
        assert_eq!(
            parse_obfuscation("{").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }
}
