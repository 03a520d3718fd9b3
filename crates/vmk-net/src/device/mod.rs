//! Switching policies.
//!
//! Every active portset runs exactly one policy out of a closed set. A
//! policy decides where inbound batches go ([`PortsetPolicy::dispatch`]),
//! reacts to per-port life-cycle events through [`PortHooks`] and, for the
//! policies that have a bottom device, manages uplink claims.
//!
//! # Locking
//!
//! Every policy callback runs with the portset's exclusive lock held.
//! Activation, deactivation and uplink management additionally run with the
//! global lock held and receive the global state through [`AdminCtx`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Weak;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::pktlist::PacketList;
use crate::port::PortId;
use crate::portset::{PortHooks, PortTable, Portset, Upcall};
use crate::status::{NetError, NetResult};
use crate::uplink::{UplinkAction, UplinkData, UplinkStatus, UplinkTable};

pub mod bond;
pub mod hub;
pub mod loopback;
pub mod nulldev;
pub mod switch;

pub use bond::{Bond, BondRegistry, FirstConnected, Slave, SlaveSelector, NICTEAMING_MAX_SLAVE_NUM};
pub use hub::Hub;
pub use loopback::Loopback;
pub use nulldev::NullDev;
pub use switch::EtherSwitch;

/// Policy kinds a portset can be created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetType {
    Null,
    Loopback,
    #[serde(rename = "hub")]
    Hubbed,
    #[serde(rename = "switch")]
    EtherSwitched,
    Bond,
}

impl NetType {
    pub const ALL: [NetType; 5] = [
        NetType::Null,
        NetType::Loopback,
        NetType::Hubbed,
        NetType::EtherSwitched,
        NetType::Bond,
    ];

    /// Keyword used in configuration and on the control protocol.
    pub fn keyword(&self) -> &'static str {
        match self {
            NetType::Null => "null",
            NetType::Loopback => "loopback",
            NetType::Hubbed => "hub",
            NetType::EtherSwitched => "switch",
            NetType::Bond => "bond",
        }
    }
}

impl fmt::Display for NetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl FromStr for NetType {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NetType::ALL
            .into_iter()
            .find(|t| t.keyword().eq_ignore_ascii_case(s))
            .ok_or_else(|| NetError::bad_param(format!("unknown portset type '{s}'")))
    }
}

/// Global state lent to a policy for administrative callbacks.
pub struct AdminCtx<'a> {
    pub(crate) uplinks: &'a mut UplinkTable,
    pub(crate) bonds: &'a mut BondRegistry,
    /// Names of the administrative handles currently published.
    pub(crate) admin: &'a mut BTreeSet<String>,
    /// Wiring work for other portsets, applied after this lock drops.
    pub(crate) actions: &'a mut Vec<UplinkAction>,
    /// Capabilities of the lower networking layer; zero until initialized.
    pub(crate) lower: UplinkData,
    pub(crate) portset: Weak<Portset>,
}

/// Capability set every switching policy implements.
pub trait PortsetPolicy: PortHooks + Send + Sync {
    fn net_type(&self) -> NetType;

    /// Runs once the policy is installed. On error the caller deactivates
    /// the portset, so partial work need not be undone here.
    fn activate(&mut self, _table: &mut PortTable, _ctx: &mut AdminCtx<'_>) -> NetResult<()> {
        Ok(())
    }

    /// Routes one inbound batch from `src`. Whatever is left in `list`
    /// afterwards is completed by the caller.
    fn dispatch(
        &mut self,
        table: &mut PortTable,
        src: PortId,
        list: &mut PacketList,
        upcalls: &mut Vec<Upcall>,
    ) -> NetResult<()>;

    /// Undoes activation. Must cope with a policy that never finished
    /// activating.
    fn deactivate(&mut self, _table: &mut PortTable, _ctx: &mut AdminCtx<'_>) {}

    /// Opens a port and claims the named uplink device for it.
    fn uplink_connect(
        &mut self,
        _table: &mut PortTable,
        name: &str,
        _ctx: &mut AdminCtx<'_>,
    ) -> NetResult<PortId> {
        Err(NetError::failure(format!(
            "{} portsets take no uplink ({name})",
            self.net_type()
        )))
    }

    fn uplink_disconnect(
        &mut self,
        _table: &mut PortTable,
        name: &str,
        _ctx: &mut AdminCtx<'_>,
    ) -> NetResult<()> {
        Err(NetError::failure(format!(
            "{} portsets take no uplink ({name})",
            self.net_type()
        )))
    }

    /// Link state change of a device claimed by one of this portset's ports.
    fn uplink_notify(
        &mut self,
        _table: &mut PortTable,
        _port_id: PortId,
        _data: UplinkData,
        _status: UplinkStatus,
    ) {
    }

    fn clear_stats(&mut self) {}

    fn write_report(&self, _table: &PortTable, _out: &mut String) -> fmt::Result {
        Ok(())
    }
}

/// The policy installed on an active portset.
pub enum PortsetDevice {
    Null(NullDev),
    Loopback(Loopback),
    Hub(Hub),
    Switch(EtherSwitch),
    Bond(Bond),
}

impl PortsetDevice {
    pub fn new(kind: NetType, table: &PortTable) -> Self {
        match kind {
            NetType::Null => PortsetDevice::Null(NullDev::new()),
            NetType::Loopback => PortsetDevice::Loopback(Loopback::new()),
            NetType::Hubbed => PortsetDevice::Hub(Hub::new()),
            NetType::EtherSwitched => PortsetDevice::Switch(EtherSwitch::new()),
            NetType::Bond => PortsetDevice::Bond(Bond::new(table.name(), table.num_ports())),
        }
    }

    pub fn net_type(&self) -> NetType {
        self.policy().net_type()
    }

    pub fn policy(&self) -> &dyn PortsetPolicy {
        match self {
            PortsetDevice::Null(d) => d,
            PortsetDevice::Loopback(d) => d,
            PortsetDevice::Hub(d) => d,
            PortsetDevice::Switch(d) => d,
            PortsetDevice::Bond(d) => d,
        }
    }

    pub fn policy_mut(&mut self) -> &mut dyn PortsetPolicy {
        match self {
            PortsetDevice::Null(d) => d,
            PortsetDevice::Loopback(d) => d,
            PortsetDevice::Hub(d) => d,
            PortsetDevice::Switch(d) => d,
            PortsetDevice::Bond(d) => d,
        }
    }

    pub fn hooks(&mut self) -> &mut dyn PortHooks {
        match self {
            PortsetDevice::Null(d) => d,
            PortsetDevice::Loopback(d) => d,
            PortsetDevice::Hub(d) => d,
            PortsetDevice::Switch(d) => d,
            PortsetDevice::Bond(d) => d,
        }
    }

    pub fn as_bond(&self) -> Option<&Bond> {
        match self {
            PortsetDevice::Bond(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_bond_mut(&mut self) -> Option<&mut Bond> {
        match self {
            PortsetDevice::Bond(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_hub(&self) -> Option<&Hub> {
        match self {
            PortsetDevice::Hub(h) => Some(h),
            _ => None,
        }
    }
}

/// Enables an uplink port that has just claimed `name`. If the enable fails,
/// the claim is dropped and the port disconnected again.
pub(crate) fn enable_claimed_uplink(
    table: &mut PortTable,
    id: PortId,
    name: &str,
    hooks: &mut dyn PortHooks,
    uplinks: &mut UplinkTable,
) -> NetResult<()> {
    if let Err(e) = table.enable_port(id, hooks) {
        warn!(portset = table.name(), uplink = name, error = %e, "cannot enable uplink port");
        let _ = uplinks.unregister(table, id, name);
        let _ = table.disconnect_port(id, hooks);
        return Err(e);
    }
    Ok(())
}

impl fmt::Debug for PortsetDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PortsetDevice").field(&self.net_type()).finish()
    }
}
