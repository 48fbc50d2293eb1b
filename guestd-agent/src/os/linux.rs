//! Linux implementations of the OS collaborator traits, shelling out to
//! the iproute2 and util-linux tools.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{ClockOps, InterfaceOps, NetInterface, OsError, OsLoginOps, RouteOps};

/// Routing protocol number stamped on agent-owned routes so listing can
/// tell them apart from routes configured elsewhere.
const ROUTE_PROTO: &str = "66";

async fn run(program: &str, args: &[&str]) -> Result<String, OsError> {
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(OsError::Command(format!(
            "{} {}: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Interface enumeration via `ip -o link show`.
pub struct LinuxInterfaces;

#[async_trait]
impl InterfaceOps for LinuxInterfaces {
    async fn list(&self) -> Result<Vec<NetInterface>, OsError> {
        let stdout = run("ip", &["-o", "link", "show"]).await?;
        Ok(parse_link_lines(&stdout))
    }
}

// One interface per line: "2: eth0: <...> ... link/ether aa:bb:... brd ...".
fn parse_link_lines(stdout: &str) -> Vec<NetInterface> {
    let mut interfaces = Vec::new();
    for line in stdout.lines() {
        let mut fields = line.split_whitespace();
        let Some(index) = fields
            .next()
            .and_then(|f| f.trim_end_matches(':').parse::<u32>().ok())
        else {
            continue;
        };
        let Some(name) = fields.next() else { continue };
        let name = name.trim_end_matches(':');
        // VLAN devices show up as "eth0.2@eth0".
        let name = name.split('@').next().unwrap_or(name).to_string();

        let rest: Vec<&str> = fields.collect();
        let Some(pos) = rest.iter().position(|f| *f == "link/ether") else {
            // Loopback and tunnel devices carry no hardware address.
            continue;
        };
        let Some(mac) = rest.get(pos + 1) else { continue };

        interfaces.push(NetInterface {
            name,
            index,
            mac: mac.to_string(),
        });
    }
    interfaces
}

/// Local-route management via `ip route`, scoped to the agent's protocol
/// number. The route table itself is the authoritative record.
pub struct LinuxRoutes;

#[async_trait]
impl RouteOps for LinuxRoutes {
    async fn list_routes(&self, iface: &NetInterface) -> Result<Vec<String>, OsError> {
        let stdout = run(
            "ip",
            &[
                "route", "list", "table", "local", "type", "local", "dev", iface.name.as_str(),
                "scope", "host", "proto", ROUTE_PROTO,
            ],
        )
        .await?;
        Ok(parse_route_lines(&stdout))
    }

    async fn add_route(&self, entry: &str, iface: &NetInterface) -> Result<(), OsError> {
        let result = run(
            "ip",
            &[
                "route", "add", "to", "local", entry, "scope", "host", "dev", iface.name.as_str(),
                "proto", ROUTE_PROTO,
            ],
        )
        .await;
        match result {
            Ok(_) => Ok(()),
            // Already configured counts as converged.
            Err(OsError::Command(msg)) if msg.contains("File exists") => {
                debug!(entry = %entry, dev = %iface.name, "route already present");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_route(&self, entry: &str, iface: &NetInterface) -> Result<(), OsError> {
        run(
            "ip",
            &[
                "route", "delete", "to", "local", entry, "scope", "host", "dev", iface.name.as_str(),
                "proto", ROUTE_PROTO,
            ],
        )
        .await
        .map(|_| ())
    }
}

// Lines look like "local 10.0.0.5 proto 66 scope host"; the address is
// the token after the leading type keyword.
fn parse_route_lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match fields.next()? {
                "local" | "broadcast" | "unicast" => fields.next(),
                first => Some(first),
            }
            .map(str::to_string)
        })
        .collect()
}

/// Clock resync via the hardware clock.
pub struct LinuxClock;

#[async_trait]
impl ClockOps for LinuxClock {
    async fn sync_time(&self) -> Result<(), OsError> {
        run("hwclock", &["--hctosys"]).await.map(|_| ())
    }
}

/// OS-login toggle via the distro's control helper.
pub struct LinuxOsLogin;

#[async_trait]
impl OsLoginOps for LinuxOsLogin {
    async fn apply(&self, enabled: bool, two_factor: bool) -> Result<(), OsError> {
        let mut args = vec![if enabled { "activate" } else { "deactivate" }];
        if enabled && two_factor {
            args.push("--twofactor");
        }
        run("oslogin-control", &args).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_link_output() {
        let stdout = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT group default qlen 1000\\    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1460 qdisc mq state UP mode DEFAULT group default qlen 1000\\    link/ether 42:01:0a:00:00:02 brd ff:ff:ff:ff:ff:ff
3: eth0.2@eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1460 qdisc noqueue state UP mode DEFAULT group default qlen 1000\\    link/ether 42:01:0a:00:00:03 brd ff:ff:ff:ff:ff:ff
";
        let interfaces = parse_link_lines(stdout);
        assert_eq!(interfaces.len(), 2);
        assert_eq!(interfaces[0].name, "eth0");
        assert_eq!(interfaces[0].index, 2);
        assert_eq!(interfaces[0].mac, "42:01:0a:00:00:02");
        assert_eq!(interfaces[1].name, "eth0.2");
    }

    #[test]
    fn parses_route_output() {
        let stdout = "\
local 10.0.0.5 proto 66 scope host
local 10.0.0.6 proto 66 scope host
";
        assert_eq!(parse_route_lines(stdout), vec!["10.0.0.5", "10.0.0.6"]);
    }

    #[test]
    fn parses_route_output_without_type_keyword() {
        assert_eq!(
            parse_route_lines("10.1.0.0/24 proto 66 scope host\n"),
            vec!["10.1.0.0/24"]
        );
    }
}
