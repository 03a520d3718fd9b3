//! Learning Ethernet switch.
//!
//! Source addresses are learned per port. Frames to a known unicast address
//! go to that port only; broadcast, multicast and unknown destinations are
//! flooded the way the hub does it, uplink last.

use std::collections::HashMap;
use std::fmt::{self, Write as _};

use tracing::{debug, trace};

use super::hub::{install_filters, Hub};
use super::{AdminCtx, NetType, PortsetPolicy};
use crate::eth::EthAddress;
use crate::pkt::Packet;
use crate::pktlist::PacketList;
use crate::port::{Port, PortId};
use crate::portset::{PortHooks, PortTable, Upcall};
use crate::status::NetResult;
use crate::uplink::{UplinkData, UplinkStatus};

/// Forwarding counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchStats {
    pub learned: u64,
    pub forwarded: u64,
    pub flooded: u64,
    /// Frames addressed back to the port they came from.
    pub reflected: u64,
}

pub struct EtherSwitch {
    hub: Hub,
    mac_table: HashMap<EthAddress, PortId>,
    stats: SwitchStats,
}

impl Default for EtherSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl EtherSwitch {
    pub fn new() -> Self {
        Self {
            hub: Hub::new(),
            mac_table: HashMap::new(),
            stats: SwitchStats::default(),
        }
    }

    pub fn lookup(&self, addr: &EthAddress) -> Option<PortId> {
        self.mac_table.get(addr).copied()
    }

    pub fn stats(&self) -> SwitchStats {
        self.stats
    }

    pub fn uplink_port(&self) -> PortId {
        self.hub.uplink_port()
    }

    fn learn(&mut self, src: PortId, list: &PacketList) {
        for addr in list.iter().filter_map(Packet::src_mac) {
            if addr.is_multicast() {
                continue;
            }
            if self.mac_table.insert(addr, src) != Some(src) {
                trace!(%addr, port = %src, "learned");
                self.stats.learned += 1;
            }
        }
    }

    fn destination(&self, pkt: &Packet) -> Option<PortId> {
        pkt.dst_mac()
            .filter(EthAddress::is_unicast)
            .and_then(|addr| self.lookup(&addr))
    }
}

impl PortHooks for EtherSwitch {
    fn port_disconnect(&mut self, port: &mut Port) {
        let id = port.id();
        self.mac_table.retain(|_, p| *p != id);
    }

    fn port_eth_frp_update(&mut self, port: &mut Port) -> NetResult<()> {
        install_filters(port)
    }
}

impl PortsetPolicy for EtherSwitch {
    fn net_type(&self) -> NetType {
        NetType::EtherSwitched
    }

    fn dispatch(
        &mut self,
        table: &mut PortTable,
        src: PortId,
        list: &mut PacketList,
        upcalls: &mut Vec<Upcall>,
    ) -> NetResult<()> {
        self.learn(src, list);

        let mut targets: Vec<PortId> = list.iter().filter_map(|p| self.destination(p)).collect();
        targets.sort_unstable();
        targets.dedup();
        for target in targets {
            let mut sub = list.take_matching(|p| self.destination(p) == Some(target));
            if target == src {
                self.stats.reflected += sub.count() as u64;
                sub.complete_all();
                continue;
            }
            match table.port_mut(target).filter(|p| p.is_output_active()) {
                Some(port) => {
                    self.stats.forwarded += sub.count() as u64;
                    if let Err(e) = port.output(&mut sub) {
                        debug!(port = %target, error = %e, "switch output failed");
                    }
                    sub.complete_all();
                }
                // stale entry, let the flood find it
                None => list.join(&mut sub),
            }
        }

        if !list.is_empty() {
            self.stats.flooded += list.count() as u64;
            self.hub.dispatch(table, src, list, upcalls)?;
        }
        Ok(())
    }

    fn deactivate(&mut self, table: &mut PortTable, ctx: &mut AdminCtx<'_>) {
        self.hub.deactivate(table, ctx);
        self.mac_table.clear();
    }

    fn uplink_connect(
        &mut self,
        table: &mut PortTable,
        name: &str,
        ctx: &mut AdminCtx<'_>,
    ) -> NetResult<PortId> {
        self.hub.uplink_connect(table, name, ctx)
    }

    fn uplink_disconnect(
        &mut self,
        table: &mut PortTable,
        name: &str,
        ctx: &mut AdminCtx<'_>,
    ) -> NetResult<()> {
        let port = self.hub.uplink_port();
        self.hub.uplink_disconnect(table, name, ctx)?;
        self.mac_table.retain(|_, p| *p != port);
        Ok(())
    }

    fn uplink_notify(
        &mut self,
        table: &mut PortTable,
        port_id: PortId,
        data: UplinkData,
        status: UplinkStatus,
    ) {
        if status == UplinkStatus::Down {
            self.mac_table.retain(|_, p| *p != port_id);
        }
        self.hub.uplink_notify(table, port_id, data, status);
    }

    fn clear_stats(&mut self) {
        self.stats = SwitchStats::default();
    }

    fn write_report(&self, table: &PortTable, out: &mut String) -> fmt::Result {
        self.hub.write_report(table, out)?;
        let s = &self.stats;
        writeln!(
            out,
            "learned {} forwarded {} flooded {} reflected {}",
            s.learned, s.forwarded, s.flooded, s.reflected
        )?;
        let mut entries: Vec<_> = self.mac_table.iter().collect();
        entries.sort();
        for (addr, port) in entries {
            writeln!(out, "   {addr} -> {port}")?;
        }
        Ok(())
    }
}
