//! NIC teaming.
//!
//! A bond portset aggregates up to [`NICTEAMING_MAX_SLAVE_NUM`] uplinks
//! (slaves) and presents itself upward as one composite uplink device named
//! after the portset. Every slave gets a port on the bond's own portset,
//! wired to the slave's device through the uplink tree.
//!
//! # Data path
//!
//! - Transmit: the parent portset hands a batch to the bond's device. The
//!   batch is partitioned by selected slave, each partition keeping the
//!   original relative order, and each partition goes out its slave's port.
//! - Receive: a batch arriving on any slave port is forwarded, whole, to the
//!   port of the parent portset that claimed the bond's device. Without such
//!   a port the batch is released.
//!
//! # Slave table
//!
//! Occupied slots are packed at the front. Detaching a slave moves the last
//! occupied slot into the hole, so slots must always be looked up by name
//! under the portset lock and never remembered by index.

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use super::{enable_claimed_uplink, AdminCtx, NetType, PortsetPolicy};
use crate::pkt::Packet;
use crate::pktlist::PacketList;
use crate::port::PortId;
use crate::portset::{PortHooks, PortTable, Portset, Upcall};
use crate::status::{NetError, NetResult};
use crate::uplink::{
    DeviceConnectArgs, DeviceType, NetFunctions, UplinkData, UplinkDevice, UplinkStatus,
};

pub const NICTEAMING_MAX_SLAVE_NUM: usize = 10;

/// Module ID the bond's composite device registers with.
pub const BOND_MODULE_ID: i32 = 0;

/// One slot of the slave table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slave {
    /// Position in the table; fixed for the life of the slot.
    pub index: usize,
    /// Port on the bond's portset, or the `num_ports` sentinel when empty.
    pub uplink_port: PortId,
    pub uplink_name: String,
    /// The slave's device is present and wired to its port.
    pub connected: bool,
}

impl Slave {
    fn empty(index: usize, num_ports: usize) -> Self {
        Self {
            index,
            uplink_port: PortId(num_ports as u32),
            uplink_name: String::new(),
            connected: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.uplink_name.is_empty()
    }
}

/// Picks the slave a packet leaves through.
///
/// Must be a pure function of the packet and the table, and must return
/// `None` when no slave is usable.
pub trait SlaveSelector: Send + Sync {
    fn name(&self) -> &str;

    fn select(&self, pkt: &Packet, slaves: &[Slave]) -> Option<usize>;
}

/// Everything goes out the first connected slave in table order.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstConnected;

impl SlaveSelector for FirstConnected {
    fn name(&self) -> &str {
        "first-connected"
    }

    fn select(&self, _pkt: &Packet, slaves: &[Slave]) -> Option<usize> {
        slaves.iter().position(|s| s.connected)
    }
}

/// Bond data path counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BondStats {
    pub tx_batches: u64,
    pub tx_pkts: u64,
    pub tx_failures: u64,
    pub rx_pkts: u64,
    pub rx_forwarded: u64,
    pub rx_released: u64,
}

/// Registry entry naming a bond and the portset slot it lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondEntry {
    pub name: String,
    pub portset: usize,
}

/// All activated bonds. Guarded by the global lock.
#[derive(Debug, Default)]
pub struct BondRegistry {
    entries: Vec<BondEntry>,
}

impl BondRegistry {
    pub fn insert_front(&mut self, name: &str, portset: usize) {
        self.entries.insert(
            0,
            BondEntry {
                name: name.to_string(),
                portset,
            },
        );
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        before != self.entries.len()
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.portset)
    }

    pub fn head(&self) -> Option<&BondEntry> {
        self.entries.first()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Names a bond accepts as slaves.
pub fn is_valid_slave_name(name: &str) -> bool {
    name.starts_with("bond") || name.starts_with("vmnic")
}

/// Driver side of the bond's composite device.
///
/// Open and close run while the bond's own portset is locked, so they only
/// touch the shared counter. Transmit comes from a parent portset and takes
/// the bond's lock itself.
struct BondFunctions {
    name: String,
    portset: Weak<Portset>,
    opens: Arc<AtomicU32>,
}

impl NetFunctions for BondFunctions {
    fn start_tx(&self, list: &mut PacketList) -> NetResult<()> {
        let ps = self
            .portset
            .upgrade()
            .ok_or_else(|| NetError::failure(format!("bond {} is gone", self.name)))?;
        let mut guard = ps.lock_excl();
        let state = &mut *guard;
        match state.device.as_mut().and_then(|d| d.as_bond_mut()) {
            Some(bond) if bond.name == self.name => bond.start_tx(&mut state.table, list),
            _ => Err(NetError::failure(format!(
                "portset {} no longer runs bond {}",
                state.table.name(),
                self.name
            ))),
        }
    }

    fn open(&self) -> NetResult<()> {
        self.opens.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn close(&self) -> NetResult<()> {
        let _ = self
            .opens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        Ok(())
    }
}

/// Bond policy state.
pub struct Bond {
    name: String,
    num_ports: usize,
    slaves: Vec<Slave>,
    total: usize,
    uplink_dev: Option<Arc<UplinkDevice>>,
    admin_entry: Option<String>,
    in_list: bool,
    opens: Arc<AtomicU32>,
    selector: Arc<dyn SlaveSelector>,
    stats: BondStats,
}

impl Bond {
    pub fn new(name: &str, num_ports: usize) -> Self {
        Self {
            name: name.to_string(),
            num_ports,
            slaves: (0..NICTEAMING_MAX_SLAVE_NUM)
                .map(|i| Slave::empty(i, num_ports))
                .collect(),
            total: 0,
            uplink_dev: None,
            admin_entry: None,
            in_list: false,
            opens: Arc::new(AtomicU32::new(0)),
            selector: Arc::new(FirstConnected),
            stats: BondStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The whole fixed-size table, empty slots included.
    pub fn slaves(&self) -> &[Slave] {
        &self.slaves
    }

    /// Occupied slots.
    pub fn active_slaves(&self) -> &[Slave] {
        &self.slaves[..self.total]
    }

    pub fn total_slaves(&self) -> usize {
        self.total
    }

    pub fn uplink_device(&self) -> Option<&Arc<UplinkDevice>> {
        self.uplink_dev.as_ref()
    }

    pub fn admin_entry(&self) -> Option<&str> {
        self.admin_entry.as_deref()
    }

    pub fn is_in_list(&self) -> bool {
        self.in_list
    }

    pub fn is_open(&self) -> bool {
        self.opens.load(Ordering::Acquire) > 0
    }

    pub fn stats(&self) -> BondStats {
        self.stats
    }

    pub fn selector_name(&self) -> &str {
        self.selector.name()
    }

    pub fn set_selector(&mut self, selector: Arc<dyn SlaveSelector>) {
        info!(bond = %self.name, selector = selector.name(), "slave selector replaced");
        self.selector = selector;
    }

    fn find_slave(&self, name: &str) -> Option<usize> {
        self.active_slaves()
            .iter()
            .position(|s| s.uplink_name == name)
    }

    /// Usable slave for `pkt`, if any.
    pub fn select(&self, pkt: &Packet) -> Option<usize> {
        self.selector
            .select(pkt, self.active_slaves())
            .filter(|&i| i < self.total && self.slaves[i].connected)
    }

    /// Transmits `list` partition by partition. Partitions already handed to
    /// their slaves stay sent. When no slave is usable the remaining packets
    /// stay in `list` and the call fails. When a slave's driver rejects its
    /// partition, that partition is released and the packets not yet
    /// partitioned stay in `list`, in order.
    pub(crate) fn start_tx(&mut self, table: &mut PortTable, list: &mut PacketList) -> NetResult<()> {
        while let Some(head) = list.head().and_then(|r| list.get(r)) {
            let Some(idx) = self.select(head) else {
                debug!(bond = %self.name, pkts = list.count(), "no usable slave device");
                self.stats.tx_failures += 1;
                return Err(NetError::failure(format!(
                    "bond {} has no usable slave",
                    self.name
                )));
            };
            let port_id = self.slaves[idx].uplink_port;
            let Some(port) = table.port_mut(port_id) else {
                warn!(bond = %self.name, slave = %self.slaves[idx].uplink_name, "no uplink port yet for slave");
                self.stats.tx_failures += 1;
                return Err(NetError::failure(format!(
                    "slave {} of {} has no port",
                    self.slaves[idx].uplink_name, self.name
                )));
            };
            let mut sub = list.take_matching(|p| self.select(p) == Some(idx));
            let pkts = sub.count() as u64;
            if let Err(e) = port.output(&mut sub) {
                sub.release_all();
                self.stats.tx_failures += 1;
                return Err(e);
            }
            sub.complete_all();
            self.stats.tx_batches += 1;
            self.stats.tx_pkts += pkts;
        }
        Ok(())
    }

    /// Handles one line written to the bond's administrative entry:
    /// `add <slave>` or `delete <slave>`.
    pub fn admin_write(
        &mut self,
        table: &mut PortTable,
        line: &str,
        ctx: &mut AdminCtx<'_>,
    ) -> NetResult<()> {
        let argv: Vec<&str> = line.split_whitespace().take(3).collect();
        if argv.len() != 2 {
            debug!(bond = %self.name, argc = argv.len(), "wrong number of args, expected 2");
            return Err(NetError::bad_param(format!(
                "expected '<add|delete> <slave>', got {} args",
                argv.len()
            )));
        }
        let (verb, slave) = (argv[0], argv[1]);
        info!(bond = %self.name, verb, slave, "slave command");
        match verb {
            "add" if is_valid_slave_name(slave) => self.uplink_connect(table, slave, ctx).map(|_| ()),
            "delete" if is_valid_slave_name(slave) => self.uplink_disconnect(table, slave, ctx),
            _ => {
                warn!(bond = %self.name, verb, slave, "command not supported");
                Err(NetError::bad_param(format!("unsupported command '{verb} {slave}'")))
            }
        }
    }

    /// Contents of the bond's administrative entry.
    pub fn admin_read(&self) -> String {
        let mut out = String::new();
        for slave in self.active_slaves() {
            let _ = writeln!(
                out,
                "slave[{}] = {}, status = {}",
                slave.index,
                slave.uplink_name,
                if slave.connected { "connected" } else { "disconnected" }
            );
        }
        out
    }
}

impl PortHooks for Bond {}

impl PortsetPolicy for Bond {
    fn net_type(&self) -> NetType {
        NetType::Bond
    }

    fn activate(&mut self, table: &mut PortTable, ctx: &mut AdminCtx<'_>) -> NetResult<()> {
        if ctx.lower.pkt_hdr_size == 0 {
            warn!(bond = %self.name, "lower networking layer is not initialized");
            return Err(NetError::failure(
                "lower networking layer has no capabilities yet",
            ));
        }

        let functions = Arc::new(BondFunctions {
            name: self.name.clone(),
            portset: ctx.portset.clone(),
            opens: Arc::clone(&self.opens),
        });
        let dev = ctx
            .uplinks
            .set_device_connected(DeviceConnectArgs {
                name: self.name.clone(),
                kind: DeviceType::Bond,
                module_id: BOND_MODULE_ID,
                functions,
                data: ctx.lower,
            })
            .map_err(|e| {
                warn!(bond = %self.name, error = %e, "failed to create a bottom device");
                e
            })?;
        self.uplink_dev = Some(dev);
        ctx.uplinks.device_open(&self.name, ctx.actions)?;

        let entry = format!("bond/{}", self.name);
        ctx.admin.insert(entry.clone());
        self.admin_entry = Some(entry);

        ctx.bonds.insert_front(&self.name, table.index());
        self.in_list = true;
        info!(bond = %self.name, "bond activated");
        Ok(())
    }

    fn dispatch(
        &mut self,
        _table: &mut PortTable,
        src: PortId,
        list: &mut PacketList,
        upcalls: &mut Vec<Upcall>,
    ) -> NetResult<()> {
        self.stats.rx_pkts += list.count() as u64;
        let upward = self
            .uplink_dev
            .as_ref()
            .map(|d| d.uplink_port())
            .filter(PortId::is_valid);
        match upward {
            Some(port_id) => {
                self.stats.rx_forwarded += list.count() as u64;
                let mut forward = PacketList::new();
                forward.join(list);
                upcalls.push(Upcall {
                    port_id,
                    list: forward,
                });
            }
            None => {
                debug!(bond = %self.name, port = %src, pkts = list.count(), "bond not wired upward, releasing");
                self.stats.rx_released += list.count() as u64;
                list.release_all();
            }
        }
        Ok(())
    }

    fn deactivate(&mut self, table: &mut PortTable, ctx: &mut AdminCtx<'_>) {
        info!(bond = %self.name, slaves = self.total, "deactivating bond");
        if self.in_list {
            ctx.bonds.remove(&self.name);
            self.in_list = false;
        }
        if let Some(entry) = self.admin_entry.take() {
            ctx.admin.remove(&entry);
        }
        while self.total > 0 {
            let name = self.slaves[0].uplink_name.clone();
            if self.uplink_disconnect(table, &name, ctx).is_err() {
                break;
            }
        }
        if let Some(dev) = self.uplink_dev.take() {
            ctx.uplinks.do_device_disconnected(&dev, ctx.actions);
        }
        debug_assert!(!self.in_list);
        debug_assert!(self.admin_entry.is_none());
        debug_assert_eq!(self.total, 0);
    }

    fn uplink_connect(
        &mut self,
        table: &mut PortTable,
        name: &str,
        ctx: &mut AdminCtx<'_>,
    ) -> NetResult<PortId> {
        if self.find_slave(name).is_some() {
            warn!(slave = name, bond = %self.name, "already a member");
            return Err(NetError::exists(format!("slave {name} of {}", self.name)));
        }
        if self.total >= NICTEAMING_MAX_SLAVE_NUM {
            return Err(NetError::limit_exceeded(format!(
                "{} already has {NICTEAMING_MAX_SLAVE_NUM} slaves",
                self.name
            )));
        }
        let slot = self.total;
        if self.slaves[slot].connected {
            warn!(bond = %self.name, slot, "slave slot is already connected");
            return Err(NetError::failure(format!(
                "slot {slot} of {} is already connected",
                self.name
            )));
        }

        let id = table.connect_port(self).map_err(|e| {
            warn!(bond = %self.name, error = %e, "cannot open port");
            e
        })?;
        match ctx.uplinks.register(table, id, name, DeviceType::PortsetBond) {
            Ok(data) => {
                enable_claimed_uplink(table, id, name, self, ctx.uplinks)?;
                self.slaves[slot] = Slave {
                    index: slot,
                    uplink_port: id,
                    uplink_name: name.to_string(),
                    connected: true,
                };
                table.set_uplink_impl_size(data.pkt_hdr_size);
                self.total += 1;
                info!(bond = %self.name, slave = name, port = %id, "slave attached");
            }
            Err(e) if e.is_not_found() => {
                self.slaves[slot] = Slave {
                    index: slot,
                    uplink_port: id,
                    uplink_name: name.to_string(),
                    connected: false,
                };
                self.total += 1;
                info!(bond = %self.name, slave = name, port = %id, "slave reserved, device not present yet");
            }
            Err(e) => {
                let _ = table.disconnect_port(id, self);
                warn!(bond = %self.name, slave = name, error = %e, "failed to claim uplink device");
                return Err(NetError::failure(format!(
                    "{} cannot claim {name}: {e}",
                    self.name
                )));
            }
        }
        Ok(id)
    }

    fn uplink_disconnect(
        &mut self,
        table: &mut PortTable,
        name: &str,
        ctx: &mut AdminCtx<'_>,
    ) -> NetResult<()> {
        if self.total == 0 {
            warn!(bond = %self.name, "no slave to be removed");
            return Err(NetError::failure(format!("{} has no slaves", self.name)));
        }
        let Some(idx) = self.find_slave(name) else {
            warn!(bond = %self.name, slave = name, "cannot find slave");
            return Err(NetError::failure(format!(
                "{name} is not a slave of {}",
                self.name
            )));
        };

        let port = self.slaves[idx].uplink_port;
        if let Err(e) = ctx.uplinks.unregister(table, port, name) {
            debug!(bond = %self.name, slave = name, error = %e, "unregister failed");
        }
        if let Err(e) = table.disconnect_port(port, self) {
            debug!(bond = %self.name, slave = name, error = %e, "port disconnect failed");
        }

        let last = self.total - 1;
        if idx != last {
            let moved = self.slaves[last].clone();
            let hole = &mut self.slaves[idx];
            hole.uplink_port = moved.uplink_port;
            hole.uplink_name = moved.uplink_name;
            hole.connected = moved.connected;
        }
        self.slaves[last] = Slave::empty(last, self.num_ports);
        self.total -= 1;
        info!(bond = %self.name, slave = name, remaining = self.total, "slave detached");
        Ok(())
    }

    fn uplink_notify(
        &mut self,
        table: &mut PortTable,
        port_id: PortId,
        data: UplinkData,
        status: UplinkStatus,
    ) {
        info!(
            bond = %self.name,
            port = %port_id,
            max_sg_length = data.max_sg_length,
            pkt_hdr_size = data.pkt_hdr_size,
            ?status,
            "device notification"
        );
        let total = self.total;
        let Some(slave) = self.slaves[..total]
            .iter_mut()
            .find(|s| s.uplink_port == port_id)
        else {
            return;
        };
        slave.connected = status == UplinkStatus::Up;
        if status == UplinkStatus::Up {
            table.set_uplink_impl_size(data.pkt_hdr_size);
            if let Err(e) = table.enable_port(port_id, self) {
                warn!(bond = %self.name, port = %port_id, error = %e, "cannot enable slave port");
            }
        }
    }

    fn clear_stats(&mut self) {
        self.stats = BondStats::default();
    }

    fn write_report(&self, _table: &PortTable, out: &mut String) -> fmt::Result {
        let s = &self.stats;
        writeln!(
            out,
            "bond {}: {} slave(s), selector {}, device {}",
            self.name,
            self.total,
            self.selector.name(),
            if self.is_open() { "open" } else { "closed" }
        )?;
        out.push_str(&self.admin_read());
        writeln!(
            out,
            "tx batches {} pkts {} failures {}, rx seen {} forwarded {} released {}",
            s.tx_batches,
            s.tx_pkts,
            s.tx_failures,
            s.rx_pkts,
            s.rx_forwarded,
            s.rx_released
        )
    }
}
