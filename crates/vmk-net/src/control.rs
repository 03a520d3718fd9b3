//! Line-oriented administrative protocol.
//!
//! One request per line, words separated by whitespace. Every reply starts
//! with the upper-case [`ReturnStatus`] name, optionally followed by a
//! message, then any output lines.
//!
//! ```text
//! create <name> <ports> <null|loopback|hub|switch|bond>
//! destroy <name>
//! link <portset> <uplink>
//! unlink <portset> <uplink>
//! dev <portset> <ClearStats|Discover>
//! bond <name> <add|delete> <slave>
//! bond <name> show
//! show <portset>
//! list
//! uplinks
//! help
//! ```

use std::fmt::{self, Write as _};
use std::str::FromStr;

use tracing::debug;

use crate::device::NetType;
use crate::net::{DeviceCommand, Net};
use crate::status::{NetError, NetResult, ReturnStatus};

pub const HELP: &str = "\
create <name> <ports> <null|loopback|hub|switch|bond>
destroy <name>
link <portset> <uplink>
unlink <portset> <uplink>
dev <portset> <ClearStats|Discover>
bond <name> <add|delete> <slave>
bond <name> show
show <portset>
list
uplinks
help
";

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Create {
        name: String,
        ports: usize,
        kind: NetType,
    },
    Destroy {
        name: String,
    },
    Link {
        portset: String,
        uplink: String,
    },
    Unlink {
        portset: String,
        uplink: String,
    },
    Device {
        portset: String,
        command: DeviceCommand,
    },
    /// Raw line handed to the bond's administrative entry.
    BondWrite {
        bond: String,
        line: String,
    },
    BondRead {
        bond: String,
    },
    Show {
        portset: String,
    },
    List,
    Uplinks,
    Help,
}

fn expect_args(verb: &str, args: &[&str], n: usize) -> NetResult<()> {
    if args.len() == n {
        Ok(())
    } else {
        Err(NetError::bad_param(format!(
            "'{verb}' takes {n} argument(s), got {}",
            args.len()
        )))
    }
}

impl FromStr for Command {
    type Err = NetError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, args)) = words.split_first() else {
            return Err(NetError::bad_param("empty request"));
        };
        let cmd = match verb {
            "create" => {
                expect_args(verb, args, 3)?;
                let ports = args[1]
                    .parse()
                    .map_err(|_| NetError::bad_param(format!("bad port count '{}'", args[1])))?;
                Command::Create {
                    name: args[0].to_string(),
                    ports,
                    kind: args[2].parse()?,
                }
            }
            "destroy" => {
                expect_args(verb, args, 1)?;
                Command::Destroy {
                    name: args[0].to_string(),
                }
            }
            "link" | "unlink" => {
                expect_args(verb, args, 2)?;
                let (portset, uplink) = (args[0].to_string(), args[1].to_string());
                if verb == "link" {
                    Command::Link { portset, uplink }
                } else {
                    Command::Unlink { portset, uplink }
                }
            }
            "dev" => {
                expect_args(verb, args, 2)?;
                Command::Device {
                    portset: args[0].to_string(),
                    command: args[1].parse()?,
                }
            }
            "bond" => match args {
                [bond, "show"] => Command::BondRead {
                    bond: bond.to_string(),
                },
                [bond, rest @ ..] if !rest.is_empty() => Command::BondWrite {
                    bond: bond.to_string(),
                    line: rest.join(" "),
                },
                _ => return Err(NetError::bad_param("usage: bond <name> <add|delete> <slave>")),
            },
            "show" => {
                expect_args(verb, args, 1)?;
                Command::Show {
                    portset: args[0].to_string(),
                }
            }
            "list" => Command::List,
            "uplinks" => Command::Uplinks,
            "help" => Command::Help,
            other => return Err(NetError::bad_param(format!("unknown command '{other}'"))),
        };
        Ok(cmd)
    }
}

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: ReturnStatus,
    pub message: Option<String>,
    pub output: String,
}

impl Reply {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            status: ReturnStatus::Ok,
            message: None,
            output: output.into(),
        }
    }

    pub fn error(err: &NetError) -> Self {
        Self {
            status: err.status(),
            message: Some(err.to_string()),
            output: String::new(),
        }
    }
}

impl<T: Into<String>> From<NetResult<T>> for Reply {
    fn from(result: NetResult<T>) -> Self {
        match result {
            Ok(output) => Reply::ok(output),
            Err(e) => Reply::error(&e),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status.as_str())?;
        if let Some(message) = &self.message {
            write!(f, " {message}")?;
        }
        writeln!(f)?;
        f.write_str(&self.output)?;
        if !self.output.is_empty() && !self.output.ends_with('\n') {
            writeln!(f)?;
        }
        Ok(())
    }
}

fn list(net: &Net) -> String {
    let mut out = String::new();
    for info in net.portset_info() {
        let kind = info.kind.map(|k| k.keyword()).unwrap_or("-");
        let _ = writeln!(
            out,
            "{:>4} {:<32} {:<9} {}/{}",
            info.index, info.name, kind, info.ports_in_use, info.num_ports
        );
    }
    out
}

/// Runs one parsed request against `net`.
pub fn execute(net: &Net, cmd: &Command) -> Reply {
    debug!(?cmd, "control request");
    match cmd {
        Command::Create { name, ports, kind } => net
            .create(name, *ports, *kind)
            .map(|index| format!("{name} index {index}"))
            .into(),
        Command::Destroy { name } => net.destroy(name).map(|()| String::new()).into(),
        Command::Link { portset, uplink } => net
            .connect_uplink_port(portset, uplink)
            .map(|port| format!("{uplink} on port {port}"))
            .into(),
        Command::Unlink { portset, uplink } => net
            .disconnect_uplink_port(portset, uplink)
            .map(|()| String::new())
            .into(),
        Command::Device { portset, command } => net
            .device_command(portset, *command)
            .map(|()| String::new())
            .into(),
        Command::BondWrite { bond, line } => net
            .bond_admin_write(bond, line)
            .map(|()| String::new())
            .into(),
        Command::BondRead { bond } => net.bond_admin_read(bond).into(),
        Command::Show { portset } => net.portset_report(portset).into(),
        Command::List => Reply::ok(list(net)),
        Command::Uplinks => Reply::ok(net.uplink_report()),
        Command::Help => Reply::ok(HELP),
    }
}

/// Parses and runs one request line.
pub fn handle_line(net: &Net, line: &str) -> Reply {
    match line.parse::<Command>() {
        Ok(cmd) => execute(net, &cmd),
        Err(e) => Reply::error(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uplink::UplinkData;
    use pretty_assertions::assert_eq;

    fn net() -> Net {
        let net = Net::new(8).unwrap();
        net.set_lower_layer(UplinkData {
            pkt_hdr_size: 64,
            max_sg_length: 16,
        });
        net
    }

    #[test]
    fn test_parse_requests() {
        assert_eq!(
            "create hub0 16 hub".parse::<Command>().unwrap(),
            Command::Create {
                name: "hub0".into(),
                ports: 16,
                kind: NetType::Hubbed
            }
        );
        assert_eq!(
            "bond bond0 add  vmnic1".parse::<Command>().unwrap(),
            Command::BondWrite {
                bond: "bond0".into(),
                line: "add vmnic1".into()
            }
        );
        assert_eq!(
            "dev hub0 Discover".parse::<Command>().unwrap(),
            Command::Device {
                portset: "hub0".into(),
                command: DeviceCommand::Discover
            }
        );
        for bad in ["", "create hub0 x hub", "create hub0 4 bridge", "frobnicate", "bond bond0"] {
            assert_eq!(
                bad.parse::<Command>().unwrap_err().status(),
                ReturnStatus::BadParam,
                "{bad:?}"
            );
        }
    }

    #[test]
    fn test_replies_carry_status() {
        let net = net();
        let reply = handle_line(&net, "create hub0 8 hub");
        assert_eq!(reply.status, ReturnStatus::Ok);
        assert!(reply.to_string().starts_with("OK\nhub0 index "));

        let reply = handle_line(&net, "create hub0 8 hub");
        assert_eq!(reply.status, ReturnStatus::Exists);
        assert!(reply.to_string().starts_with("EXISTS "));

        assert_eq!(handle_line(&net, "destroy nope").status, ReturnStatus::NotFound);
        assert!(handle_line(&net, "list").output.contains("hub0"));
    }

    #[test]
    fn test_bond_session() {
        let net = net();
        assert_eq!(handle_line(&net, "create bond0 16 bond").status, ReturnStatus::Ok);
        // not present yet, the slot is reserved
        assert_eq!(
            handle_line(&net, "bond bond0 add vmnic0").status,
            ReturnStatus::Ok
        );
        assert_eq!(
            handle_line(&net, "bond bond0 add vmnic0").status,
            ReturnStatus::Exists
        );
        assert_eq!(
            handle_line(&net, "bond bond0 add eth0").status,
            ReturnStatus::BadParam
        );
        assert_eq!(
            handle_line(&net, "bond bond0 show").output,
            "slave[0] = vmnic0, status = disconnected\n"
        );
        assert_eq!(
            handle_line(&net, "bond bond0 delete vmnic0").status,
            ReturnStatus::Ok
        );
        assert_eq!(handle_line(&net, "bond bond0 show").output, "");
        assert_eq!(
            handle_line(&net, "bond missing show").status,
            ReturnStatus::NotFound
        );
    }
}
