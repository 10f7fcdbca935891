//! Linux platform implementation
//!
//! Process spawning plus the `ip` (iproute2) operations shared by both
//! tunnel variants: link lifecycle, MTU and address bindings.

use crate::error::{BrgError, Result};
use crate::model::Cidr;
use crate::platform::CommandRunner;
use serde::Deserialize;
use std::io::Write;
use std::net::IpAddr;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info};

/// Runs commands on the host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    /// Create a new system runner
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> Result<String> {
        debug!("Executing command: {} {:?}", program, args);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = cmd.spawn().map_err(|e| {
            BrgError::AdapterFailure(format!(
                "Failed to execute {} {}: {}",
                program,
                args.join(" "),
                e
            ))
        })?;

        // Feed stdin while the output pipes are drained, so a child that
        // fills stdout before reading all of its input cannot stall us
        let pipe = child.stdin.take();
        let (written, output) = std::thread::scope(|scope| {
            let writer = scope.spawn(move || match (pipe, stdin) {
                // Dropping the handle closes the pipe so the child sees EOF
                (Some(mut pipe), Some(data)) => pipe.write_all(data.as_bytes()),
                _ => Ok(()),
            });
            let output = child.wait_with_output();
            (writer.join(), output)
        });

        let output = output.map_err(|e| {
            BrgError::AdapterFailure(format!("Failed to wait for {}: {}", program, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BrgError::AdapterFailure(format!(
                "Command failed: {} {}: {}",
                program,
                args.join(" "),
                stderr.trim()
            )));
        }

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(BrgError::AdapterFailure(format!(
                    "Failed to write stdin of {}: {}",
                    program, e
                )))
            }
            Err(_) => {
                return Err(BrgError::Internal(format!(
                    "stdin writer for {} panicked",
                    program
                )))
            }
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Link flags and MTU as reported by `ip -j addr show`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Administratively up
    pub up: bool,
    /// Current MTU
    pub mtu: Option<u16>,
    /// Bound addresses with their host part
    pub addresses: Vec<Cidr>,
}

#[derive(Debug, Deserialize)]
struct IpLink {
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: Option<u16>,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    local: Option<IpAddr>,
    prefixlen: Option<u8>,
}

/// Parse the JSON printed by `ip -j addr show dev <name>`
pub fn parse_ip_addr_json(json: &str) -> Result<Option<LinkInfo>> {
    let links: Vec<IpLink> = serde_json::from_str(json.trim()).map_err(|e| {
        BrgError::AdapterFailure(format!("Unexpected `ip -j addr` output: {}", e))
    })?;

    let Some(link) = links.into_iter().next() else {
        return Ok(None);
    };

    let mut addresses = Vec::new();
    for info in link.addr_info {
        if let (Some(addr), Some(prefix)) = (info.local, info.prefixlen) {
            addresses.push(Cidr::new(addr, prefix)?);
        }
    }

    Ok(Some(LinkInfo {
        up: link.flags.iter().any(|f| f == "UP"),
        mtu: link.mtu,
        addresses,
    }))
}

/// iproute2 front-end
#[derive(Clone)]
pub struct IpRoute {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl IpRoute {
    /// Wrap `runner`, invoking `program` (normally `ip`)
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    fn ip(&self, args: &[&str]) -> Result<String> {
        self.runner.run(&self.program, args, None)
    }

    /// Whether a link with this name exists
    pub fn link_exists(&self, name: &str) -> bool {
        self.ip(&["link", "show", "dev", name]).is_ok()
    }

    /// Create a link of the given kind (`wireguard`, `amneziawg`)
    pub fn link_add(&self, name: &str, kind: &str) -> Result<()> {
        info!("Creating {} interface: {}", kind, name);
        self.ip(&["link", "add", "dev", name, "type", kind])?;
        Ok(())
    }

    /// Delete a link; a missing link is not an error
    pub fn link_del(&self, name: &str) -> Result<()> {
        if !self.link_exists(name) {
            debug!("Interface {} does not exist", name);
            return Ok(());
        }

        self.ip(&["link", "delete", "dev", name])?;
        info!("Interface {} destroyed", name);
        Ok(())
    }

    /// Bring a link up or down
    pub fn link_set(&self, name: &str, up: bool) -> Result<()> {
        info!(
            "Bringing interface {} {}",
            name,
            if up { "up" } else { "down" }
        );
        self.ip(&["link", "set", "dev", name, if up { "up" } else { "down" }])?;
        Ok(())
    }

    /// Set the link MTU
    pub fn set_mtu(&self, name: &str, mtu: u16) -> Result<()> {
        info!("Setting MTU for interface {}: {}", name, mtu);
        self.ip(&["link", "set", "dev", name, "mtu", &mtu.to_string()])?;
        Ok(())
    }

    /// Read flags, MTU and addresses of a link
    pub fn link_info(&self, name: &str) -> Result<LinkInfo> {
        let out = self.ip(&["-j", "addr", "show", "dev", name])?;
        parse_ip_addr_json(&out)?
            .ok_or_else(|| BrgError::AdapterFailure(format!("Interface {} not reported", name)))
    }

    /// Make the bound addresses equal to `desired`, touching only the difference
    pub fn sync_addresses(&self, name: &str, desired: &[Cidr]) -> Result<()> {
        let current = self.link_info(name)?.addresses;

        for stale in current.iter().filter(|a| !desired.contains(a)) {
            debug!("Removing address {} from {}", stale, name);
            self.ip(&["addr", "del", &stale.to_string(), "dev", name])?;
        }

        for missing in desired.iter().filter(|a| !current.contains(a)) {
            debug!("Adding address {} to {}", missing, name);
            self.ip(&["addr", "add", &missing.to_string(), "dev", name])?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::RecordingRunner;

    const WG0_JSON: &str = r#"[{"ifindex":7,"ifname":"wg0","flags":["POINTOPOINT","NOARP","UP","LOWER_UP"],"mtu":1420,"qdisc":"noqueue","operstate":"UNKNOWN","group":"default","txqlen":1000,"link_type":"none","addr_info":[{"family":"inet","local":"10.10.10.254","prefixlen":24,"scope":"global","label":"wg0","valid_life_time":4294967295,"preferred_life_time":4294967295},{"family":"inet6","local":"fd00::1","prefixlen":64,"scope":"global"}]}]"#;

    #[test]
    fn test_parse_ip_addr_json() {
        let info = parse_ip_addr_json(WG0_JSON).unwrap().unwrap();
        assert!(info.up);
        assert_eq!(info.mtu, Some(1420));
        assert_eq!(info.addresses.len(), 2);
        assert_eq!(info.addresses[0].to_string(), "10.10.10.254/24");
    }

    #[test]
    fn test_large_stdin_is_fed_while_output_drains() {
        let payload: String = (0..20_000)
            .map(|i| format!("AllowedIPs = 10.{}.{}.0/24\n", i / 256 % 256, i % 256))
            .collect();
        assert!(payload.len() > 256 * 1024);

        let echoed = SystemRunner::new().run("cat", &[], Some(&payload)).unwrap();
        assert_eq!(echoed.len(), payload.len());
        assert_eq!(echoed, payload);
    }

    #[test]
    fn test_failed_command_reports_stderr() {
        let err = SystemRunner::new()
            .run("sh", &["-c", "echo 'Unable to modify interface' >&2; exit 1"], Some("x"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AdapterFailure);
        assert!(err.to_string().contains("Unable to modify interface"));
    }

    #[test]
    fn test_parse_down_link_without_addresses() {
        let json = r#"[{"ifname":"wg1","flags":["POINTOPOINT","NOARP"],"mtu":1420,"addr_info":[]}]"#;
        let info = parse_ip_addr_json(json).unwrap().unwrap();
        assert!(!info.up);
        assert!(info.addresses.is_empty());
        assert!(parse_ip_addr_json("[]").unwrap().is_none());
    }

    #[test]
    fn test_sync_addresses_applies_difference() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("ip -j addr show dev wg0", WG0_JSON);
        let ip = IpRoute::new(runner.clone(), "ip");

        let desired: Vec<Cidr> = vec!["10.10.10.254/24".parse().unwrap(), "10.20.0.1/16".parse().unwrap()];
        ip.sync_addresses("wg0", &desired).unwrap();

        let lines = runner.command_lines();
        assert_eq!(
            lines,
            vec![
                "ip -j addr show dev wg0",
                "ip addr del fd00::1/64 dev wg0",
                "ip addr add 10.20.0.1/16 dev wg0",
            ]
        );
    }

    #[test]
    fn test_link_del_skips_missing() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail("ip link show", "Device \"wg9\" does not exist.");
        let ip = IpRoute::new(runner.clone(), "ip");
        ip.link_del("wg9").unwrap();
        assert_eq!(runner.calls().len(), 1);
    }
}
