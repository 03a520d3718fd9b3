//! Portsets: named containers of ports driven by one switching policy.
//!
//! A [`Portset`] is a fixed slot in the registry. While active it holds a
//! [`PortTable`] and the policy ([`PortsetDevice`]) that decides where
//! inbound packets go. Both live behind the portset's exclusive lock, which
//! guards every port-table mutation and every policy callback, on the
//! administrative path and on the data path alike.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::device::{AdminCtx, PortsetDevice};
use crate::eth::EthFrp;
use crate::port::{Port, PortId};
use crate::pktlist::PacketList;
use crate::status::{NetError, NetResult};
use crate::uplink::{self, UplinkAction, UplinkDevice, UplinkStatus};

pub const MAX_NUM_PORTSETS: usize = 1024;
pub const MAX_NUM_PORTS_PER_SET: usize = 1024;
pub const MAX_PORTSET_NAMELEN: usize = 31;

/// Splits a 32-bit port ID into portset index and per-portset generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortIdLayout {
    num_portsets: usize,
    set_bits: u32,
}

impl PortIdLayout {
    /// Sizes the registry. The count is clamped to [`MAX_NUM_PORTSETS`] and
    /// rounded up to a power of two.
    pub fn new(num_portsets: usize) -> NetResult<Self> {
        if num_portsets == 0 {
            return Err(NetError::bad_param("number of portsets must be positive"));
        }
        let num_portsets = num_portsets.min(MAX_NUM_PORTSETS).next_power_of_two();
        Ok(Self {
            num_portsets,
            set_bits: num_portsets.trailing_zeros(),
        })
    }

    pub fn num_portsets(&self) -> usize {
        self.num_portsets
    }

    fn set_field(&self) -> u32 {
        if self.set_bits == 0 {
            0
        } else {
            ((self.num_portsets - 1) as u32) << (32 - self.set_bits)
        }
    }

    fn compose(&self, set_index: usize, gen: u32) -> PortId {
        let set_part = if self.set_bits == 0 {
            0
        } else {
            (set_index as u32) << (32 - self.set_bits)
        };
        PortId((gen & !self.set_field()) | set_part)
    }

    /// Registry slot a port ID belongs to.
    pub fn portset_index(&self, id: PortId) -> usize {
        if self.set_bits == 0 {
            0
        } else {
            (id.0 >> (32 - self.set_bits)) as usize
        }
    }
}

/// Per-port callbacks a policy may implement.
pub trait PortHooks {
    /// Called after a slot is reserved; failure undoes the connect.
    fn port_connect(&mut self, _port: &mut Port) -> NetResult<()> {
        Ok(())
    }

    fn port_disconnect(&mut self, _port: &mut Port) {}

    /// Failure leaves the port disabled.
    fn port_enable(&mut self, _port: &mut Port) -> NetResult<()> {
        Ok(())
    }

    fn port_disable(&mut self, _port: &mut Port, _force: bool) -> NetResult<()> {
        Ok(())
    }

    /// Called after the port's frame routing policy changed.
    fn port_eth_frp_update(&mut self, _port: &mut Port) -> NetResult<()> {
        Ok(())
    }
}

/// Hooks used while no policy is installed.
pub(crate) struct NoHooks;

impl PortHooks for NoHooks {}

/// Packets a policy forwards to a port of another portset. Delivered by
/// the caller after the current portset lock is dropped.
#[derive(Debug)]
pub struct Upcall {
    pub port_id: PortId,
    pub list: PacketList,
}

/// Ports of one portset plus the bookkeeping shared by all policies.
pub struct PortTable {
    index: usize,
    layout: PortIdLayout,
    name: String,
    active: bool,
    portgen: u32,
    port_mask: u32,
    ports: Vec<Port>,
    in_use: usize,
    uplink_impl_size: usize,
    uplink_dev: Option<Arc<UplinkDevice>>,
}

impl PortTable {
    pub(crate) fn new(index: usize, layout: PortIdLayout) -> Self {
        Self {
            index,
            layout,
            name: String::new(),
            active: false,
            portgen: 0,
            port_mask: 0,
            ports: Vec::new(),
            in_use: 0,
            uplink_impl_size: 0,
            uplink_dev: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    pub fn ports_in_use(&self) -> usize {
        self.in_use
    }

    /// Header room the portset's bottom device needs in front of frames.
    pub fn uplink_impl_size(&self) -> usize {
        self.uplink_impl_size
    }

    pub fn set_uplink_impl_size(&mut self, size: usize) {
        self.uplink_impl_size = size;
    }

    /// Last uplink device wired to one of this portset's ports.
    pub fn uplink_device(&self) -> Option<&Arc<UplinkDevice>> {
        self.uplink_dev.as_ref()
    }

    pub(crate) fn set_uplink_device(&mut self, dev: Option<Arc<UplinkDevice>>) {
        self.uplink_dev = dev;
    }

    /// Returns the rounded-up port count.
    pub(crate) fn activate(&mut self, name: &str, num_ports: usize) -> usize {
        let num_ports = num_ports.next_power_of_two();
        self.name = name.to_string();
        self.active = true;
        self.port_mask = (num_ports - 1) as u32;
        self.ports = (0..num_ports).map(|_| Port::new()).collect();
        self.in_use = 0;
        self.uplink_impl_size = 0;
        self.uplink_dev = None;
        num_ports
    }

    /// Returns the slot to the free state. The generation counter survives
    /// so IDs from this activation stay invalid in the next one.
    pub(crate) fn reset(&mut self) {
        self.name.clear();
        self.active = false;
        self.port_mask = 0;
        self.ports = Vec::new();
        self.in_use = 0;
        self.uplink_impl_size = 0;
        self.uplink_dev = None;
    }

    fn generate_port_id(&mut self) -> PortId {
        loop {
            let id = self.layout.compose(self.index, self.portgen);
            self.portgen = self.portgen.wrapping_add(1);
            if id.is_valid() {
                return id;
            }
        }
    }

    fn slot(&self, id: PortId) -> usize {
        (id.0 & self.port_mask) as usize
    }

    /// Looks up a connected port by full ID; stale IDs miss.
    pub fn port(&self, id: PortId) -> Option<&Port> {
        if !self.active || self.layout.portset_index(id) != self.index {
            return None;
        }
        self.ports
            .get(self.slot(id))
            .filter(|p| p.id() == id && p.is_in_use())
    }

    pub fn port_mut(&mut self, id: PortId) -> Option<&mut Port> {
        if !self.active || self.layout.portset_index(id) != self.index {
            return None;
        }
        let slot = self.slot(id);
        self.ports
            .get_mut(slot)
            .filter(|p| p.id() == id && p.is_in_use())
    }

    /// Connected ports in slot order.
    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter().filter(|p| p.is_in_use())
    }

    pub fn port_ids(&self) -> Vec<PortId> {
        self.ports().map(Port::id).collect()
    }

    /// Reserves a free slot and runs the policy's connect hook.
    pub fn connect_port(&mut self, hooks: &mut dyn PortHooks) -> NetResult<PortId> {
        for _ in 0..self.ports.len() {
            let id = self.generate_port_id();
            let slot = self.slot(id);
            let port = &mut self.ports[slot];
            if !port.is_available() {
                continue;
            }
            port.connect(id)?;
            if let Err(e) = hooks.port_connect(port) {
                warn!(portset = %self.name, port = %id, error = %e, "policy refused port");
                port.disconnect();
                return Err(e);
            }
            self.in_use += 1;
            debug!(portset = %self.name, port = %id, "port connected");
            return Ok(id);
        }
        Err(NetError::no_resources(format!(
            "all {} ports of {} in use",
            self.ports.len(),
            self.name
        )))
    }

    pub fn disconnect_port(&mut self, id: PortId, hooks: &mut dyn PortHooks) -> NetResult<()> {
        if !self.active || self.layout.portset_index(id) != self.index {
            return Err(NetError::InvalidHandle { port_id: id.0 });
        }
        let slot = self.slot(id);
        let Some(port) = self.ports.get_mut(slot).filter(|p| p.id() == id) else {
            return Err(NetError::InvalidHandle { port_id: id.0 });
        };
        if !port.is_in_use() {
            return Err(NetError::IsDisconnected { port_id: id.0 });
        }
        if port.is_enabled() {
            port.begin_disable();
            // forced disable cannot fail
            let _ = hooks.port_disable(port, true);
            port.finish_disable();
        }
        hooks.port_disconnect(port);
        port.disconnect();
        self.in_use -= 1;
        debug!(portset = %self.name, port = %id, "port disconnected");
        Ok(())
    }

    /// Enables a connected port once its policy wiring is complete.
    pub fn enable_port(&mut self, id: PortId, hooks: &mut dyn PortHooks) -> NetResult<()> {
        let port = self
            .port_mut(id)
            .ok_or(NetError::InvalidHandle { port_id: id.0 })?;
        if port.is_enabled() {
            return Ok(());
        }
        if let Err(e) = hooks.port_enable(port) {
            port.begin_disable();
            let _ = hooks.port_disable(port, true);
            port.finish_disable();
            return Err(e);
        }
        port.mark_enabled();
        Ok(())
    }

    /// Disables a port. An unforced disable the policy refuses leaves the
    /// port in the pending state with its chains intact.
    pub fn disable_port(
        &mut self,
        id: PortId,
        force: bool,
        hooks: &mut dyn PortHooks,
    ) -> NetResult<()> {
        let port = self
            .port_mut(id)
            .ok_or(NetError::InvalidHandle { port_id: id.0 })?;
        port.begin_disable();
        let result = hooks.port_disable(port, force);
        if result.is_ok() || force {
            port.finish_disable();
            return Ok(());
        }
        result
    }

    pub fn update_eth_frp(
        &mut self,
        id: PortId,
        frp: EthFrp,
        hooks: &mut dyn PortHooks,
    ) -> NetResult<()> {
        let port = self
            .port_mut(id)
            .ok_or(NetError::InvalidHandle { port_id: id.0 })?;
        port.eth_frp = frp;
        hooks.port_eth_frp_update(port)
    }

    pub fn clear_stats(&mut self) {
        for port in self.ports.iter_mut().filter(|p| p.is_in_use()) {
            port.clear_stats();
        }
    }

    pub fn write_report(&self, out: &mut String) -> fmt::Result {
        writeln!(
            out,
            "portset #{} {}: {} ports, {} in use, uplink hdr {}",
            self.index,
            self.name,
            self.ports.len(),
            self.in_use,
            self.uplink_impl_size
        )?;
        for port in self.ports() {
            port.write_report(out)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PortTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortTable")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("num_ports", &self.ports.len())
            .field("in_use", &self.in_use)
            .finish()
    }
}

/// Everything guarded by a portset's exclusive lock.
pub struct PortsetState {
    pub table: PortTable,
    pub(crate) device: Option<PortsetDevice>,
}

impl PortsetState {
    pub fn device(&self) -> Option<&PortsetDevice> {
        self.device.as_ref()
    }

    pub fn connect_port(&mut self) -> NetResult<PortId> {
        match self.device.as_mut() {
            Some(dev) => self.table.connect_port(dev.hooks()),
            None => self.table.connect_port(&mut NoHooks),
        }
    }

    pub fn disconnect_port(&mut self, id: PortId) -> NetResult<()> {
        match self.device.as_mut() {
            Some(dev) => self.table.disconnect_port(id, dev.hooks()),
            None => self.table.disconnect_port(id, &mut NoHooks),
        }
    }

    pub fn enable_port(&mut self, id: PortId) -> NetResult<()> {
        match self.device.as_mut() {
            Some(dev) => self.table.enable_port(id, dev.hooks()),
            None => self.table.enable_port(id, &mut NoHooks),
        }
    }

    pub fn disable_port(&mut self, id: PortId, force: bool) -> NetResult<()> {
        match self.device.as_mut() {
            Some(dev) => self.table.disable_port(id, force, dev.hooks()),
            None => self.table.disable_port(id, force, &mut NoHooks),
        }
    }

    pub fn update_eth_frp(&mut self, id: PortId, frp: EthFrp) -> NetResult<()> {
        match self.device.as_mut() {
            Some(dev) => self.table.update_eth_frp(id, frp, dev.hooks()),
            None => self.table.update_eth_frp(id, frp, &mut NoHooks),
        }
    }

    /// Hands a batch to the policy's dispatch function.
    pub(crate) fn portset_input(
        &mut self,
        src: PortId,
        list: &mut PacketList,
        upcalls: &mut Vec<Upcall>,
    ) -> NetResult<()> {
        match self.device.as_mut() {
            Some(dev) => dev.policy_mut().dispatch(&mut self.table, src, list, upcalls),
            None => {
                list.release_all();
                Err(NetError::failure(format!("portset {} has no policy", self.table.name())))
            }
        }
    }

    /// Accepts a batch from the client of port `id`: input chain, dispatch,
    /// then completion of whatever nobody consumed.
    pub(crate) fn port_input(
        &mut self,
        id: PortId,
        list: &mut PacketList,
        upcalls: &mut Vec<Upcall>,
    ) -> NetResult<()> {
        list.set_may_modify(true);
        let Some(port) = self.table.port_mut(id) else {
            list.release_all();
            return Err(NetError::InvalidHandle { port_id: id.0 });
        };
        let pkts = list.count() as u64;
        let mut result = Ok(());
        if port.is_input_active() {
            port.client_stats.pkts_tx_ok += pkts;
            port.client_stats.bytes_tx_ok += list.byte_count() as u64;
            result = port.input_chain.start(id, list);
            if result.is_ok() {
                result = self.portset_input(id, list, upcalls);
            }
        } else {
            port.client_stats.dropped_tx += pkts;
        }
        match self.table.port_mut(id) {
            Some(port) => port.io_complete(list),
            None => list.complete_all(),
        }
        result
    }

    /// Wires or unwires a claimed port and tells the policy about it.
    pub(crate) fn apply_uplink_action(&mut self, action: UplinkAction) {
        match action {
            UplinkAction::Connect { port_id, device } => {
                if device.uplink_port() != port_id || device.is_notified() {
                    return;
                }
                match uplink::connect_port_to_device(&mut self.table, port_id, &device) {
                    Ok(()) => {
                        info!(device = device.name(), port = %port_id, "uplink up");
                        if let Some(dev) = self.device.as_mut() {
                            dev.policy_mut().uplink_notify(
                                &mut self.table,
                                port_id,
                                device.data(),
                                UplinkStatus::Up,
                            );
                        }
                    }
                    Err(e) => {
                        warn!(device = device.name(), port = %port_id, error = %e, "cannot connect uplink")
                    }
                }
            }
            UplinkAction::Disconnect { port_id, device } => {
                let notified = device.is_notified();
                uplink::disconnect_port_from_device(&mut self.table, port_id, &device);
                if notified {
                    info!(device = device.name(), port = %port_id, "uplink down");
                    if let Some(dev) = self.device.as_mut() {
                        dev.policy_mut().uplink_notify(
                            &mut self.table,
                            port_id,
                            device.data(),
                            UplinkStatus::Down,
                        );
                    }
                }
            }
        }
    }

    /// Tears the portset down: policy first, then any ports it left.
    pub(crate) fn deactivate(&mut self, ctx: &mut AdminCtx<'_>) {
        let name = self.table.name().to_string();
        match self.device.take() {
            Some(mut dev) => {
                dev.policy_mut().deactivate(&mut self.table, ctx);
                for id in self.table.port_ids() {
                    let _ = self.table.disconnect_port(id, dev.hooks());
                }
            }
            None => {
                for id in self.table.port_ids() {
                    let _ = self.table.disconnect_port(id, &mut NoHooks);
                }
            }
        }
        self.table.reset();
        info!(portset = %name, "portset deactivated");
    }

    pub fn write_report(&self, out: &mut String) -> fmt::Result {
        if let Some(dev) = self.device.as_ref() {
            writeln!(out, "type: {}", dev.net_type())?;
        }
        self.table.write_report(out)?;
        if let Some(dev) = self.device.as_ref() {
            dev.policy().write_report(&self.table, out)?;
        }
        Ok(())
    }
}

/// One registry slot.
pub struct Portset {
    index: usize,
    state: RwLock<PortsetState>,
}

impl Portset {
    pub(crate) fn new(index: usize, layout: PortIdLayout) -> Self {
        Self {
            index,
            state: RwLock::new(PortsetState {
                table: PortTable::new(index, layout),
                device: None,
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Takes the exclusive lock.
    pub fn lock_excl(&self) -> RwLockWriteGuard<'_, PortsetState> {
        self.state.write()
    }

    /// Shared access for reports.
    pub fn lock_shared(&self) -> RwLockReadGuard<'_, PortsetState> {
        self.state.read()
    }
}

impl fmt::Debug for Portset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Portset").field("index", &self.index).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ReturnStatus;

    fn table(num_ports: usize) -> PortTable {
        let layout = PortIdLayout::new(128).unwrap();
        let mut table = PortTable::new(5, layout);
        table.activate("vswitch0", num_ports);
        table
    }

    #[test]
    fn test_layout_rounds_and_clamps() {
        assert_eq!(PortIdLayout::new(100).unwrap().num_portsets(), 128);
        assert_eq!(PortIdLayout::new(5000).unwrap().num_portsets(), 1024);
        assert_eq!(
            PortIdLayout::new(0).unwrap_err().status(),
            ReturnStatus::BadParam
        );
        let single = PortIdLayout::new(1).unwrap();
        assert_eq!(single.portset_index(single.compose(0, 77)), 0);
    }

    #[test]
    fn test_port_id_encodes_portset_index() {
        let mut t = table(8);
        let id = t.connect_port(&mut NoHooks).unwrap();
        assert!(id.is_valid());
        assert_eq!(t.layout.portset_index(id), 5);
        assert_eq!(t.num_ports(), 8);
        assert!(t.port(id).is_some());
    }

    #[test]
    fn test_ports_round_up_and_exhaust() {
        let mut t = table(3);
        assert_eq!(t.num_ports(), 4);
        for _ in 0..4 {
            t.connect_port(&mut NoHooks).unwrap();
        }
        let err = t.connect_port(&mut NoHooks).unwrap_err();
        assert_eq!(err.status(), ReturnStatus::NoResources);
        assert_eq!(t.ports_in_use(), 4);
    }

    #[test]
    fn test_stale_id_is_rejected() {
        let mut t = table(4);
        let id = t.connect_port(&mut NoHooks).unwrap();
        t.disconnect_port(id, &mut NoHooks).unwrap();
        assert!(t.port(id).is_none());
        assert_eq!(
            t.disconnect_port(id, &mut NoHooks).unwrap_err().status(),
            ReturnStatus::IsDisconnected
        );

        // a new connection in the same slot gets a different ID
        let mut reused = None;
        for _ in 0..4 {
            let next = t.connect_port(&mut NoHooks).unwrap();
            if t.slot(next) == t.slot(id) {
                reused = Some(next);
            }
        }
        let reused = reused.unwrap();
        assert_ne!(reused, id);
        assert_eq!(
            t.disconnect_port(id, &mut NoHooks).unwrap_err().status(),
            ReturnStatus::InvalidHandle
        );
    }

    #[test]
    fn test_generation_survives_reset() {
        let mut t = table(2);
        let first = t.connect_port(&mut NoHooks).unwrap();
        t.reset();
        t.activate("vswitch0", 2);
        let second = t.connect_port(&mut NoHooks).unwrap();
        assert_ne!(first, second);
        assert!(t.port(first).is_none());
    }

    struct RefuseEnable;

    impl PortHooks for RefuseEnable {
        fn port_enable(&mut self, _port: &mut Port) -> NetResult<()> {
            Err(NetError::failure("not wired"))
        }
    }

    #[test]
    fn test_enable_failure_leaves_port_disabled() {
        let mut t = table(2);
        let id = t.connect_port(&mut NoHooks).unwrap();
        assert!(t.enable_port(id, &mut RefuseEnable).is_err());
        let port = t.port(id).unwrap();
        assert!(!port.is_enabled());
        assert!(!port.is_input_active());

        t.enable_port(id, &mut NoHooks).unwrap();
        assert!(t.port(id).unwrap().is_output_active());
        t.disable_port(id, false, &mut NoHooks).unwrap();
        assert!(!t.port(id).unwrap().is_input_active());
    }
}
