//! The switching context and its public entry points.
//!
//! [`Net`] owns the portset registry, the uplink tree and the bond registry.
//!
//! # Locking
//!
//! - The global lock guards the name directory, the uplink tree, the bond
//!   registry and the administrative handles. Every administrative entry
//!   point holds it for its whole duration.
//! - Each portset has its own exclusive lock. Administrative paths take it
//!   after the global lock and never hold two portset locks at once: work a
//!   device event causes on another portset is queued as an
//!   [`UplinkAction`] and applied after the first portset lock is dropped.
//! - The data path takes only portset locks. A batch moving up a level
//!   (bond to parent) is queued as an [`Upcall`] and delivered once the
//!   current lock is dropped. Transmit nests downward only, parent portset
//!   first, then the bond it transmits through.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::device::{AdminCtx, BondRegistry, NetType, PortsetDevice, SlaveSelector};
use crate::eth::EthFrp;
use crate::pktlist::PacketList;
use crate::port::{Port, PortId};
use crate::portset::{
    PortIdLayout, Portset, PortsetState, Upcall, MAX_NUM_PORTS_PER_SET, MAX_PORTSET_NAMELEN,
};
use crate::status::{NetError, NetResult};
use crate::uplink::{
    DeviceConnectArgs, DeviceFlags, UplinkAction, UplinkData, UplinkDevice, UplinkTable,
};

/// Per-portset commands of the legacy device entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    ClearStats,
    Discover,
}

impl std::str::FromStr for DeviceCommand {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ClearStats" => Ok(DeviceCommand::ClearStats),
            "Discover" => Ok(DeviceCommand::Discover),
            other => Err(NetError::bad_param(format!("unknown device command '{other}'"))),
        }
    }
}

/// Summary of one active portset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortsetInfo {
    pub index: usize,
    pub name: String,
    pub kind: Option<NetType>,
    pub num_ports: usize,
    pub ports_in_use: usize,
    pub uplink_impl_size: usize,
}

struct GlobalState {
    directory: BTreeMap<String, usize>,
    uplinks: UplinkTable,
    bonds: BondRegistry,
    admin_entries: BTreeSet<String>,
    lower: UplinkData,
}

/// Switching context.
pub struct Net {
    layout: PortIdLayout,
    portsets: Box<[Arc<Portset>]>,
    global: Mutex<GlobalState>,
}

impl Net {
    /// Creates a registry for `num_portsets` portsets, clamped and rounded
    /// up to a power of two.
    pub fn new(num_portsets: usize) -> NetResult<Self> {
        let layout = PortIdLayout::new(num_portsets)?;
        let portsets = (0..layout.num_portsets())
            .map(|i| Arc::new(Portset::new(i, layout)))
            .collect();
        info!(num_portsets = layout.num_portsets(), "net initialized");
        Ok(Self {
            layout,
            portsets,
            global: Mutex::new(GlobalState {
                directory: BTreeMap::new(),
                uplinks: UplinkTable::new(),
                bonds: BondRegistry::default(),
                admin_entries: BTreeSet::new(),
                lower: UplinkData::default(),
            }),
        })
    }

    pub fn num_portsets(&self) -> usize {
        self.layout.num_portsets()
    }

    /// Records the capabilities of the lower networking layer. Bonds cannot
    /// be activated before this is called with a non-zero header size.
    pub fn set_lower_layer(&self, caps: UplinkData) {
        info!(
            pkt_hdr_size = caps.pkt_hdr_size,
            max_sg_length = caps.max_sg_length,
            "lower layer capabilities set"
        );
        self.global.lock().lower = caps;
    }

    pub fn lower_layer(&self) -> UplinkData {
        self.global.lock().lower
    }

    fn portset_for(&self, id: PortId) -> NetResult<&Arc<Portset>> {
        self.portsets
            .get(self.layout.portset_index(id))
            .ok_or(NetError::InvalidHandle { port_id: id.0 })
    }

    fn lookup(global: &GlobalState, name: &str) -> NetResult<usize> {
        global
            .directory
            .get(name)
            .copied()
            .ok_or_else(|| NetError::not_found(format!("portset {name}")))
    }

    /// Runs `f` under the portset lock with the global state lent out, then
    /// applies whatever uplink work it queued.
    fn with_admin<R>(
        &self,
        global: &mut GlobalState,
        index: usize,
        f: impl FnOnce(&mut PortsetState, &mut AdminCtx<'_>) -> R,
    ) -> R {
        let ps = &self.portsets[index];
        let mut actions = Vec::new();
        let result = {
            let mut state = ps.lock_excl();
            let mut ctx = AdminCtx {
                uplinks: &mut global.uplinks,
                bonds: &mut global.bonds,
                admin: &mut global.admin_entries,
                actions: &mut actions,
                lower: global.lower,
                portset: Arc::downgrade(ps),
            };
            f(&mut state, &mut ctx)
        };
        self.apply_uplink_actions(actions);
        result
    }

    /// Applies queued wiring work, one portset lock at a time.
    fn apply_uplink_actions(&self, actions: Vec<UplinkAction>) {
        for action in actions {
            let port_id = action.port_id();
            match self.portset_for(port_id) {
                Ok(ps) => ps.lock_excl().apply_uplink_action(action),
                Err(_) => debug!(port = %port_id, "uplink action for unknown portset"),
            }
        }
    }

    /// Activates a portset running `kind`.
    #[instrument(skip(self))]
    pub fn create(&self, name: &str, num_ports: usize, kind: NetType) -> NetResult<usize> {
        if name.is_empty() || name.len() > MAX_PORTSET_NAMELEN {
            return Err(NetError::bad_param(format!(
                "portset name '{name}' must be 1 to {MAX_PORTSET_NAMELEN} bytes"
            )));
        }
        if num_ports == 0 || num_ports > MAX_NUM_PORTS_PER_SET {
            return Err(NetError::bad_param(format!(
                "port count {num_ports} out of range 1..={MAX_NUM_PORTS_PER_SET}"
            )));
        }

        let mut global = self.global.lock();
        if global.directory.contains_key(name) {
            return Err(NetError::exists(format!("portset {name}")));
        }
        let index = self
            .portsets
            .iter()
            .position(|ps| !ps.lock_shared().table.is_active())
            .ok_or_else(|| {
                NetError::no_resources(format!("all {} portsets in use", self.portsets.len()))
            })?;

        let result = self.with_admin(&mut global, index, |state, ctx| {
            let rounded = state.table.activate(name, num_ports);
            let mut device = PortsetDevice::new(kind, &state.table);
            let activated = device.policy_mut().activate(&mut state.table, ctx);
            state.device = Some(device);
            match activated {
                Ok(()) => {
                    info!(portset = name, index, num_ports = rounded, %kind, "portset activated");
                    Ok(())
                }
                Err(e) => {
                    warn!(portset = name, error = %e, "activation failed");
                    state.deactivate(ctx);
                    Err(e)
                }
            }
        });
        result?;
        global.directory.insert(name.to_string(), index);
        Ok(index)
    }

    /// Deactivates the named portset.
    #[instrument(skip(self))]
    pub fn destroy(&self, name: &str) -> NetResult<()> {
        let mut global = self.global.lock();
        let index = Self::lookup(&global, name)?;
        global.directory.remove(name);
        self.with_admin(&mut global, index, |state, ctx| state.deactivate(ctx));
        Ok(())
    }

    /// Opens an uplink port on the named portset and claims `uplink` for it.
    #[instrument(skip(self))]
    pub fn connect_uplink_port(&self, portset: &str, uplink: &str) -> NetResult<PortId> {
        let mut global = self.global.lock();
        let index = Self::lookup(&global, portset)?;
        self.with_admin(&mut global, index, |state, ctx| {
            let device = state
                .device
                .as_mut()
                .ok_or_else(|| NetError::failure(format!("portset {portset} has no policy")))?;
            device
                .policy_mut()
                .uplink_connect(&mut state.table, uplink, ctx)
        })
    }

    #[instrument(skip(self))]
    pub fn disconnect_uplink_port(&self, portset: &str, uplink: &str) -> NetResult<()> {
        let mut global = self.global.lock();
        let index = Self::lookup(&global, portset)?;
        self.with_admin(&mut global, index, |state, ctx| {
            let device = state
                .device
                .as_mut()
                .ok_or_else(|| NetError::failure(format!("portset {portset} has no policy")))?;
            device
                .policy_mut()
                .uplink_disconnect(&mut state.table, uplink, ctx)
        })
    }

    /// Connects a client port. The port starts disabled.
    pub fn connect_port(&self, portset: &str) -> NetResult<PortId> {
        let global = self.global.lock();
        let index = Self::lookup(&global, portset)?;
        let id = self.portsets[index].lock_excl().connect_port()?;
        debug!(portset, port = %id, "client port connected");
        Ok(id)
    }

    fn with_state<R>(
        &self,
        id: PortId,
        f: impl FnOnce(&mut PortsetState) -> NetResult<R>,
    ) -> NetResult<R> {
        let _global = self.global.lock();
        let ps = self.portset_for(id)?;
        let mut state = ps.lock_excl();
        if !state.table.is_active() {
            return Err(NetError::InvalidHandle { port_id: id.0 });
        }
        f(&mut state)
    }

    pub fn disconnect_port(&self, id: PortId) -> NetResult<()> {
        self.with_state(id, |state| state.disconnect_port(id))
    }

    pub fn enable_port(&self, id: PortId) -> NetResult<()> {
        self.with_state(id, |state| state.enable_port(id))
    }

    pub fn disable_port(&self, id: PortId, force: bool) -> NetResult<()> {
        self.with_state(id, |state| state.disable_port(id, force))
    }

    pub fn update_eth_frp(&self, id: PortId, frp: EthFrp) -> NetResult<()> {
        self.with_state(id, |state| state.update_eth_frp(id, frp))
    }

    /// Runs `f` on a connected port, e.g. to install the client's receive
    /// link on its output chain.
    pub fn with_port<R>(&self, id: PortId, f: impl FnOnce(&mut Port) -> R) -> NetResult<R> {
        self.with_state(id, |state| {
            state
                .table
                .port_mut(id)
                .map(f)
                .ok_or(NetError::InvalidHandle { port_id: id.0 })
        })
    }

    /// Injects a batch from the client of port `id`.
    ///
    /// Every packet in `list` is forwarded, completed or released by the
    /// time this returns; `list` is left empty. The result is that of the
    /// first hop.
    pub fn port_input(&self, id: PortId, list: &mut PacketList) -> NetResult<()> {
        let mut batch = PacketList::new();
        batch.join(list);
        let mut queue = VecDeque::from([Upcall {
            port_id: id,
            list: batch,
        }]);
        let mut first = None;
        while let Some(Upcall {
            port_id,
            mut list,
        }) = queue.pop_front()
        {
            let mut upcalls = Vec::new();
            let result = match self.portset_for(port_id) {
                Ok(ps) => ps.lock_excl().port_input(port_id, &mut list, &mut upcalls),
                Err(e) => {
                    list.release_all();
                    Err(e)
                }
            };
            if let Err(e) = &result {
                debug!(port = %port_id, error = %e, "port input failed");
            }
            first.get_or_insert(result);
            queue.extend(upcalls);
        }
        first.unwrap_or(Ok(()))
    }

    /// Receive path of an uplink driver: the batch enters the switch through
    /// the port that claimed `device`.
    pub fn receive(&self, device: &UplinkDevice, list: &mut PacketList) -> NetResult<()> {
        let port_id = device.uplink_port();
        if !port_id.is_valid() || !device.is_notified() {
            debug!(device = device.name(), pkts = list.count(), "device not wired, releasing");
            list.release_all();
            return Err(NetError::not_found(format!(
                "port for device {}",
                device.name()
            )));
        }
        self.port_input(port_id, list)
    }

    fn with_uplinks<R>(
        &self,
        f: impl FnOnce(&mut UplinkTable, &mut Vec<UplinkAction>) -> R,
    ) -> R {
        let mut global = self.global.lock();
        let mut actions = Vec::new();
        let result = f(&mut global.uplinks, &mut actions);
        self.apply_uplink_actions(actions);
        result
    }

    /// A driver registers a device it found.
    #[instrument(skip(self, args), fields(device = %args.name))]
    pub fn device_connected(&self, args: DeviceConnectArgs) -> NetResult<Arc<UplinkDevice>> {
        self.with_uplinks(|uplinks, _| uplinks.set_device_connected(args))
    }

    /// A driver opened its device; a port that already claimed it gets wired.
    pub fn device_open(&self, name: &str) -> NetResult<()> {
        self.with_uplinks(|uplinks, actions| uplinks.device_open(name, actions))
    }

    /// A driver lost its device; the claimant is told it went down.
    pub fn device_disconnected(&self, name: &str) -> NetResult<()> {
        self.with_uplinks(|uplinks, actions| uplinks.device_disconnected(name, actions))
    }

    pub fn post_module_init(&self, module_id: i32) -> usize {
        let opened = self.with_uplinks(|uplinks, actions| uplinks.post_module_init(module_id, actions));
        info!(module_id, opened, "module devices opened");
        opened
    }

    pub fn pre_module_unload(&self, module_id: i32) -> usize {
        let closed =
            self.with_uplinks(|uplinks, actions| uplinks.pre_module_unload(module_id, actions));
        info!(module_id, closed, "module devices disconnected");
        closed
    }

    pub fn uplink_device(&self, name: &str) -> Option<Arc<UplinkDevice>> {
        self.global.lock().uplinks.device(name).cloned()
    }

    /// Portset index of the named bond.
    pub fn find_bond_by_name(&self, name: &str) -> Option<usize> {
        self.global.lock().bonds.find(name)
    }

    pub fn bond_names(&self) -> Vec<String> {
        self.global.lock().bonds.names()
    }

    pub fn admin_entries(&self) -> Vec<String> {
        self.global.lock().admin_entries.iter().cloned().collect()
    }

    fn bond_index(global: &GlobalState, name: &str) -> NetResult<usize> {
        if !global.admin_entries.contains(&format!("bond/{name}")) {
            return Err(NetError::not_found(format!("bond {name}")));
        }
        global
            .bonds
            .find(name)
            .ok_or_else(|| NetError::not_found(format!("bond {name}")))
    }

    /// Writes one line to the named bond's administrative entry.
    #[instrument(skip(self))]
    pub fn bond_admin_write(&self, bond: &str, line: &str) -> NetResult<()> {
        let mut global = self.global.lock();
        let index = Self::bond_index(&global, bond)?;
        self.with_admin(&mut global, index, |state, ctx| {
            match state.device.as_mut().and_then(|d| d.as_bond_mut()) {
                Some(b) => b.admin_write(&mut state.table, line, ctx),
                None => Err(NetError::not_found(format!("bond {bond}"))),
            }
        })
    }

    /// Reads the named bond's slave table.
    pub fn bond_admin_read(&self, bond: &str) -> NetResult<String> {
        let global = self.global.lock();
        let index = Self::bond_index(&global, bond)?;
        let state = self.portsets[index].lock_shared();
        state
            .device()
            .and_then(PortsetDevice::as_bond)
            .map(|b| b.admin_read())
            .ok_or_else(|| NetError::not_found(format!("bond {bond}")))
    }

    /// Replaces the named bond's slave selection strategy.
    pub fn set_slave_selector(&self, bond: &str, selector: Arc<dyn SlaveSelector>) -> NetResult<()> {
        let global = self.global.lock();
        let index = Self::bond_index(&global, bond)?;
        let mut state = self.portsets[index].lock_excl();
        let b = state
            .device
            .as_mut()
            .and_then(|d| d.as_bond_mut())
            .ok_or_else(|| NetError::not_found(format!("bond {bond}")))?;
        b.set_selector(selector);
        Ok(())
    }

    /// Runs a legacy device command against the named portset.
    #[instrument(skip(self))]
    pub fn device_command(&self, portset: &str, command: DeviceCommand) -> NetResult<()> {
        let mut global = self.global.lock();
        let index = Self::lookup(&global, portset)?;
        match command {
            DeviceCommand::ClearStats => {
                let mut state = self.portsets[index].lock_excl();
                state.table.clear_stats();
                if let Some(device) = state.device.as_mut() {
                    device.policy_mut().clear_stats();
                }
                info!(portset, "stats cleared");
                Ok(())
            }
            DeviceCommand::Discover => {
                let pending: Vec<String> = global
                    .uplinks
                    .claimed_by(portset)
                    .into_iter()
                    .filter(|d| {
                        let flags = d.flags();
                        flags.contains(DeviceFlags::PRESENT) && !flags.contains(DeviceFlags::OPENED)
                    })
                    .map(|d| d.name().to_string())
                    .collect();
                if pending.is_empty() {
                    return Err(NetError::bad_param(format!(
                        "nothing to discover on {portset}"
                    )));
                }
                let mut actions = Vec::new();
                let mut result = Ok(());
                for name in &pending {
                    if let Err(e) = global.uplinks.device_open(name, &mut actions) {
                        warn!(portset, device = %name, error = %e, "discover open failed");
                        result = Err(e);
                    }
                }
                drop(global);
                self.apply_uplink_actions(actions);
                result
            }
        }
    }

    /// Summary of every active portset in registry order.
    pub fn portset_info(&self) -> Vec<PortsetInfo> {
        let _global = self.global.lock();
        self.portsets
            .iter()
            .filter_map(|ps| {
                let state = ps.lock_shared();
                state.table.is_active().then(|| PortsetInfo {
                    index: ps.index(),
                    name: state.table.name().to_string(),
                    kind: state.device().map(PortsetDevice::net_type),
                    num_ports: state.table.num_ports(),
                    ports_in_use: state.table.ports_in_use(),
                    uplink_impl_size: state.table.uplink_impl_size(),
                })
            })
            .collect()
    }

    /// Textual status of the named portset.
    pub fn portset_report(&self, portset: &str) -> NetResult<String> {
        let global = self.global.lock();
        let index = Self::lookup(&global, portset)?;
        let mut out = String::new();
        self.portsets[index]
            .lock_shared()
            .write_report(&mut out)
            .map_err(|_| NetError::failure("report formatting failed"))?;
        Ok(out)
    }

    /// Textual dump of the uplink tree.
    pub fn uplink_report(&self) -> String {
        let global = self.global.lock();
        let mut out = String::new();
        if global.uplinks.write_report(&mut out).is_err() {
            warn!("uplink report formatting failed");
        }
        out
    }

    /// Deactivates every bond, always taking the registry head again since
    /// each deactivation shrinks the registry.
    pub fn bond_mod_cleanup(&self) {
        info!("unloading nicteaming devices");
        let mut global = self.global.lock();
        while let Some(entry) = global.bonds.head().cloned() {
            info!(bond = %entry.name, "deactivating");
            global.directory.remove(&entry.name);
            self.with_admin(&mut global, entry.portset, |state, ctx| state.deactivate(ctx));
            if global.bonds.find(&entry.name) == Some(entry.portset) {
                // deactivation must unlist the bond, drop it by hand otherwise
                global.bonds.remove(&entry.name);
            }
        }
        info!("nicteaming devices unloaded");
    }

    /// Deactivates every remaining portset.
    pub fn mod_cleanup(&self) {
        self.bond_mod_cleanup();
        let mut global = self.global.lock();
        let active: Vec<(String, usize)> = global
            .directory
            .iter()
            .map(|(name, index)| (name.clone(), *index))
            .collect();
        for (name, index) in active {
            global.directory.remove(&name);
            self.with_admin(&mut global, index, |state, ctx| state.deactivate(ctx));
        }
        info!(devices = global.uplinks.devices().count(), "net cleaned up");
    }
}

impl std::fmt::Debug for Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Net")
            .field("num_portsets", &self.layout.num_portsets())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ReturnStatus;

    fn net() -> Net {
        let net = Net::new(16).unwrap();
        net.set_lower_layer(UplinkData {
            pkt_hdr_size: 64,
            max_sg_length: 16,
        });
        net
    }

    #[test]
    fn test_create_validates_arguments() {
        let net = net();
        let status = |r: NetResult<usize>| r.unwrap_err().status();
        assert_eq!(status(net.create("", 8, NetType::Hubbed)), ReturnStatus::BadParam);
        assert_eq!(
            status(net.create(&"x".repeat(32), 8, NetType::Hubbed)),
            ReturnStatus::BadParam
        );
        assert_eq!(status(net.create("hub0", 0, NetType::Hubbed)), ReturnStatus::BadParam);
        assert_eq!(status(net.create("hub0", 1025, NetType::Hubbed)), ReturnStatus::BadParam);

        net.create(&"x".repeat(31), 8, NetType::Hubbed).unwrap();
        net.create("hub0", 5, NetType::Hubbed).unwrap();
        assert_eq!(status(net.create("hub0", 8, NetType::Null)), ReturnStatus::Exists);

        let info = net.portset_info();
        let hub = info.iter().find(|i| i.name == "hub0").unwrap();
        assert_eq!(hub.num_ports, 8);
        assert_eq!(hub.kind, Some(NetType::Hubbed));
    }

    #[test]
    fn test_registry_fills_up() {
        let net = Net::new(2).unwrap();
        net.create("a", 4, NetType::Null).unwrap();
        net.create("b", 4, NetType::Null).unwrap();
        assert_eq!(
            net.create("c", 4, NetType::Null).unwrap_err().status(),
            ReturnStatus::NoResources
        );
        net.destroy("a").unwrap();
        net.create("c", 4, NetType::Null).unwrap();
        assert_eq!(net.destroy("a").unwrap_err().status(), ReturnStatus::NotFound);
    }

    #[test]
    fn test_bond_without_lower_layer_is_torn_down() {
        let net = Net::new(4).unwrap();
        let err = net.create("bond0", 8, NetType::Bond).unwrap_err();
        assert_eq!(err.status(), ReturnStatus::Failure);
        assert!(net.portset_info().is_empty());
        assert!(net.find_bond_by_name("bond0").is_none());
        // the slot is free again
        net.create("null0", 4, NetType::Null).unwrap();
    }

    #[test]
    fn test_port_ids_carry_portset_index() {
        let net = net();
        let a = net.create("a", 4, NetType::Null).unwrap();
        let b = net.create("b", 4, NetType::Null).unwrap();
        let pa = net.connect_port("a").unwrap();
        let pb = net.connect_port("b").unwrap();
        assert_eq!(net.layout.portset_index(pa), a);
        assert_eq!(net.layout.portset_index(pb), b);
        net.disconnect_port(pa).unwrap();
        assert_eq!(
            net.disconnect_port(pa).unwrap_err().status(),
            ReturnStatus::IsDisconnected
        );
    }

    #[test]
    fn test_device_commands() {
        let net = net();
        net.create("hub0", 4, NetType::Hubbed).unwrap();
        net.device_command("hub0", DeviceCommand::ClearStats).unwrap();
        assert_eq!(
            net.device_command("hub0", DeviceCommand::Discover)
                .unwrap_err()
                .status(),
            ReturnStatus::BadParam
        );
        assert_eq!(
            "Reset".parse::<DeviceCommand>().unwrap_err().status(),
            ReturnStatus::BadParam
        );
    }
}
