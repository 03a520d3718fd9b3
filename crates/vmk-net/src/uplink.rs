//! Uplink devices and the uplink tree.
//!
//! An uplink is a bottom-side NIC, either a physical device registered by its
//! driver or a composite device such as a bond presenting itself upward. The
//! [`UplinkTable`] tracks which portset port has claimed which device:
//! unclaimed devices hang off the root, claimed devices sit under the node of
//! the claiming portset.
//!
//! Claiming happens synchronously from the claimant's own policy hook, so the
//! claimant's port table is at hand. Device-side events (a device opening or
//! going away) may concern a portset other than the one currently locked;
//! those are returned as [`UplinkAction`]s and applied once that lock has
//! been dropped.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::eth::EthAddress;
use crate::iochain::{ChainCall, ChainRank};
use crate::port::PortId;
use crate::portset::PortTable;
use crate::pktlist::PacketList;
use crate::status::{NetError, NetResult};

pub const INVALID_MODULE_ID: i32 = -1;

/// Name of the terminal link that hands packets to a device.
pub const UPLINK_OUTPUT: &str = "UplinkOutput";

/// What a node of the uplink tree stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Physical NIC
    Leaf,
    /// Composite device presented by a bond portset
    Bond,
    /// Named by a claim before any driver showed up
    Unknown,
    /// Claim node of a switching portset
    PortsetToplevel,
    /// Claim node of a bond portset
    PortsetBond,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceType::Leaf => "leaf",
            DeviceType::Bond => "bond",
            DeviceType::Unknown => "unknown",
            DeviceType::PortsetToplevel => "portset",
            DeviceType::PortsetBond => "bond-portset",
        };
        f.write_str(s)
    }
}

bitflags! {
    /// Device life-cycle flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceFlags: u32 {
        /// Not claimed by any port
        const AVAILABLE = 0x01;
        /// A driver registered the device
        const PRESENT = 0x02;
        const OPENED = 0x04;
        /// Wired to its claimant and the claimant was told it is up
        const EVENT_NOTIFIED = 0x08;
    }
}

/// Capabilities a device reports to its claimant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UplinkData {
    /// Header room the device needs in front of each frame
    pub pkt_hdr_size: usize,
    pub max_sg_length: usize,
}

/// Link state reported to the claimant's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkStatus {
    Up,
    Down,
}

/// Driver entry points of an uplink device.
///
/// `start_tx` runs with the claimant's portset lock held and must not call
/// back into the switch synchronously.
pub trait NetFunctions: Send + Sync {
    /// Takes ownership of whatever packets it removes from `list`.
    fn start_tx(&self, list: &mut PacketList) -> NetResult<()>;

    fn open(&self) -> NetResult<()> {
        Ok(())
    }

    fn close(&self) -> NetResult<()> {
        Ok(())
    }

    fn mac_addr(&self) -> Option<EthAddress> {
        None
    }
}

struct DeviceInner {
    kind: DeviceType,
    flags: DeviceFlags,
    module_id: i32,
    functions: Option<Arc<dyn NetFunctions>>,
    data: UplinkData,
}

/// One uplink device. Handles stay valid for the life of the table.
pub struct UplinkDevice {
    name: String,
    uplink_port: AtomicU32,
    inner: Mutex<DeviceInner>,
}

impl UplinkDevice {
    fn new(name: &str, kind: DeviceType, flags: DeviceFlags) -> Self {
        Self {
            name: name.to_string(),
            uplink_port: AtomicU32::new(PortId::INVALID.0),
            inner: Mutex::new(DeviceInner {
                kind,
                flags,
                module_id: INVALID_MODULE_ID,
                functions: None,
                data: UplinkData::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Port that claimed the device, or [`PortId::INVALID`].
    pub fn uplink_port(&self) -> PortId {
        PortId(self.uplink_port.load(Ordering::Acquire))
    }

    fn set_uplink_port(&self, id: PortId) {
        self.uplink_port.store(id.0, Ordering::Release);
    }

    pub fn kind(&self) -> DeviceType {
        self.inner.lock().kind
    }

    pub fn flags(&self) -> DeviceFlags {
        self.inner.lock().flags
    }

    pub fn module_id(&self) -> i32 {
        self.inner.lock().module_id
    }

    pub fn data(&self) -> UplinkData {
        self.inner.lock().data
    }

    pub fn is_notified(&self) -> bool {
        self.flags().contains(DeviceFlags::EVENT_NOTIFIED)
    }

    fn update_flags(&self, f: impl FnOnce(&mut DeviceFlags)) {
        f(&mut self.inner.lock().flags);
    }

    fn functions(&self) -> Option<Arc<dyn NetFunctions>> {
        self.inner.lock().functions.clone()
    }

    /// Hands `list` to the driver.
    pub fn start_tx(&self, list: &mut PacketList) -> NetResult<()> {
        match self.functions() {
            Some(functions) => functions.start_tx(list),
            None => Err(NetError::failure(format!("{} has no driver", self.name))),
        }
    }

    pub fn mac_addr(&self) -> Option<EthAddress> {
        self.functions()?.mac_addr()
    }
}

impl fmt::Debug for UplinkDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("UplinkDevice")
            .field("name", &self.name)
            .field("uplink_port", &self.uplink_port())
            .field("kind", &inner.kind)
            .field("flags", &inner.flags)
            .finish()
    }
}

/// Terminal output link of a port wired to a device.
struct UplinkOutput {
    device: Arc<UplinkDevice>,
}

impl ChainCall for UplinkOutput {
    fn name(&self) -> &str {
        UPLINK_OUTPUT
    }

    fn call(&self, _port: PortId, list: &mut PacketList) -> NetResult<()> {
        self.device.start_tx(list)
    }
}

/// Cross-portset work produced by device events.
#[derive(Debug)]
pub enum UplinkAction {
    /// Wire the claimant port to the device and report it up.
    Connect {
        port_id: PortId,
        device: Arc<UplinkDevice>,
    },
    /// Unwire the claimant port and report it down if it was up.
    Disconnect {
        port_id: PortId,
        device: Arc<UplinkDevice>,
    },
}

impl UplinkAction {
    pub fn port_id(&self) -> PortId {
        match self {
            UplinkAction::Connect { port_id, .. } | UplinkAction::Disconnect { port_id, .. } => {
                *port_id
            }
        }
    }
}

/// Arguments of [`UplinkTable::set_device_connected`].
pub struct DeviceConnectArgs {
    pub name: String,
    pub kind: DeviceType,
    pub module_id: i32,
    pub functions: Arc<dyn NetFunctions>,
    pub data: UplinkData,
}

/// Inserts the device's output link into the port's output chain.
pub(crate) fn connect_port_to_device(
    table: &mut PortTable,
    port_id: PortId,
    dev: &Arc<UplinkDevice>,
) -> NetResult<()> {
    let flags = dev.flags();
    if !flags.contains(DeviceFlags::PRESENT | DeviceFlags::OPENED) {
        debug!(device = dev.name(), "device is either not present or not opened");
        return Err(NetError::failure(format!(
            "device {} is not present and opened",
            dev.name()
        )));
    }
    let port = table
        .port_mut(port_id)
        .ok_or_else(|| NetError::failure(format!("no port {port_id} for {}", dev.name())))?;
    port.output_chain.insert_call(
        ChainRank::Terminal,
        Arc::new(UplinkOutput {
            device: Arc::clone(dev),
        }),
        true,
    )?;
    port.set_uplink(Some(dev.name().to_string()));
    dev.update_flags(|f| f.insert(DeviceFlags::EVENT_NOTIFIED));
    table.set_uplink_device(Some(Arc::clone(dev)));
    debug!(device = dev.name(), port = %port_id, "port wired to device");
    Ok(())
}

/// Removes the device's output link, if it was wired.
pub(crate) fn disconnect_port_from_device(
    table: &mut PortTable,
    port_id: PortId,
    dev: &Arc<UplinkDevice>,
) {
    if !dev.is_notified() {
        return;
    }
    dev.update_flags(|f| f.remove(DeviceFlags::EVENT_NOTIFIED));
    if let Some(port) = table.port_mut(port_id) {
        port.output_chain.remove_call(UPLINK_OUTPUT);
        port.set_uplink(None);
    }
    if table
        .uplink_device()
        .is_some_and(|current| Arc::ptr_eq(current, dev))
    {
        table.set_uplink_device(None);
    }
}

struct DeviceNode {
    device: Arc<UplinkDevice>,
    claimed_by: Option<String>,
}

struct ClaimNode {
    kind: DeviceType,
    children: Vec<String>,
}

/// Registry of uplink devices and their claims.
#[derive(Default)]
pub struct UplinkTable {
    devices: BTreeMap<String, DeviceNode>,
    claims: BTreeMap<String, ClaimNode>,
}

impl UplinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self, name: &str) -> Option<&Arc<UplinkDevice>> {
        self.devices.get(name).map(|n| &n.device)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<UplinkDevice>> {
        self.devices.values().map(|n| &n.device)
    }

    /// Portset that claimed `name`, if any.
    pub fn claimant(&self, name: &str) -> Option<&str> {
        self.devices.get(name)?.claimed_by.as_deref()
    }

    /// Devices claimed by ports of `portset`.
    pub fn claimed_by(&self, portset: &str) -> Vec<Arc<UplinkDevice>> {
        self.claims
            .get(portset)
            .map(|claim| {
                claim
                    .children
                    .iter()
                    .filter_map(|name| self.device(name).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Would `portset` claiming `device` close a loop? Bond devices share
    /// their portset's name, so a claim edge leads from a bond device to the
    /// devices its own portset claims.
    fn would_cycle(&self, portset: &str, device: &str) -> bool {
        let mut stack = vec![device.to_string()];
        let mut seen = Vec::new();
        while let Some(name) = stack.pop() {
            if name == portset {
                return true;
            }
            if seen.contains(&name) {
                continue;
            }
            if let Some(claim) = self.claims.get(&name) {
                stack.extend(claim.children.iter().cloned());
            }
            seen.push(name);
        }
        false
    }

    /// Claims `dev_name` for `port_id` of the portset owning `table`.
    ///
    /// Returns the device data when the port could be wired right away and
    /// `NotFound` when the claim is recorded but no driver has registered the
    /// device yet. A failed wiring attempt drops the claim again.
    pub fn register(
        &mut self,
        table: &mut PortTable,
        port_id: PortId,
        dev_name: &str,
        claim_kind: DeviceType,
    ) -> NetResult<UplinkData> {
        let portset = table.name().to_string();
        if portset.is_empty() {
            return Err(NetError::failure(format!(
                "no portset for uplink port {port_id}"
            )));
        }

        match self.devices.get(dev_name) {
            Some(node) => {
                let dev = &node.device;
                if !dev.flags().contains(DeviceFlags::AVAILABLE) {
                    if dev.uplink_port() == port_id {
                        debug!(device = dev_name, port = %port_id, "already claimed by this port");
                        return Ok(dev.data());
                    }
                    let owner = node.claimed_by.clone().unwrap_or_default();
                    warn!(device = dev_name, owner = %owner, "device already claimed");
                    return Err(NetError::no_resources(format!(
                        "{dev_name} already claimed by {owner}"
                    )));
                }
            }
            None => {
                let device = Arc::new(UplinkDevice::new(
                    dev_name,
                    DeviceType::Unknown,
                    DeviceFlags::AVAILABLE,
                ));
                self.devices.insert(
                    dev_name.to_string(),
                    DeviceNode {
                        device,
                        claimed_by: None,
                    },
                );
            }
        }

        if self.would_cycle(&portset, dev_name) {
            warn!(device = dev_name, portset = %portset, "claim would create a loop");
            return Err(NetError::failure(format!(
                "{portset} claiming {dev_name} creates a loop"
            )));
        }

        if let Some(claim) = self.claims.get(&portset) {
            let already = claim
                .children
                .iter()
                .filter_map(|name| self.devices.get(name))
                .find(|n| n.device.uplink_port() == port_id);
            if let Some(n) = already {
                return Err(NetError::failure(format!(
                    "uplink port {port_id} has already claimed {}",
                    n.device.name()
                )));
            }
        }

        let dev = self.attach_claim(&portset, claim_kind, dev_name, port_id)?;
        if !dev.flags().contains(DeviceFlags::PRESENT) {
            info!(device = dev_name, port = %port_id, "device not present yet, claim recorded");
            return Err(NetError::not_found(format!("uplink device {dev_name}")));
        }
        match connect_port_to_device(table, port_id, &dev) {
            Ok(()) => Ok(dev.data()),
            Err(e) => {
                self.detach_claim(&portset, dev_name);
                Err(e)
            }
        }
    }

    fn attach_claim(
        &mut self,
        portset: &str,
        claim_kind: DeviceType,
        dev_name: &str,
        port_id: PortId,
    ) -> NetResult<Arc<UplinkDevice>> {
        let node = self
            .devices
            .get_mut(dev_name)
            .ok_or_else(|| NetError::not_found(format!("uplink device {dev_name}")))?;
        node.claimed_by = Some(portset.to_string());
        let dev = Arc::clone(&node.device);
        let claim = self
            .claims
            .entry(portset.to_string())
            .or_insert_with(|| ClaimNode {
                kind: claim_kind,
                children: Vec::new(),
            });
        claim.kind = claim_kind;
        claim.children.push(dev_name.to_string());
        dev.set_uplink_port(port_id);
        dev.update_flags(|f| f.remove(DeviceFlags::AVAILABLE));
        Ok(dev)
    }

    fn detach_claim(&mut self, portset: &str, dev_name: &str) {
        if let Some(claim) = self.claims.get_mut(portset) {
            claim.children.retain(|c| c != dev_name);
            if claim.children.is_empty() {
                self.claims.remove(portset);
            }
        }
        if let Some(node) = self.devices.get_mut(dev_name) {
            node.claimed_by = None;
            node.device.set_uplink_port(PortId::INVALID);
            node.device
                .update_flags(|f| f.insert(DeviceFlags::AVAILABLE));
        }
    }

    /// Drops the claim `port_id` holds on `dev_name`, unwiring the port if
    /// it was wired. Fine for claims that never got wired.
    pub fn unregister(
        &mut self,
        table: &mut PortTable,
        port_id: PortId,
        dev_name: &str,
    ) -> NetResult<()> {
        let portset = table.name().to_string();
        let claim = self.claims.get(&portset).ok_or_else(|| {
            NetError::failure(format!("portset {portset} is not in the uplink tree"))
        })?;
        if !claim.children.iter().any(|c| c == dev_name) {
            return Err(NetError::failure(format!(
                "{dev_name} is not associated with uplink port {port_id}"
            )));
        }
        let dev = self
            .device(dev_name)
            .cloned()
            .ok_or_else(|| NetError::not_found(format!("uplink device {dev_name}")))?;
        if dev.flags().contains(DeviceFlags::AVAILABLE) {
            return Err(NetError::failure(format!(
                "{dev_name} has already been relinquished"
            )));
        }
        if dev.uplink_port() != port_id {
            return Err(NetError::failure(format!(
                "{dev_name} is associated with port {}, not {port_id}",
                dev.uplink_port()
            )));
        }
        if dev.flags().contains(DeviceFlags::PRESENT) {
            disconnect_port_from_device(table, port_id, &dev);
        }
        self.detach_claim(&portset, dev_name);
        debug!(device = dev_name, port = %port_id, "claim dropped");
        Ok(())
    }

    /// Marks a device present, creating it if no claim named it before.
    pub fn set_device_connected(
        &mut self,
        args: DeviceConnectArgs,
    ) -> NetResult<Arc<UplinkDevice>> {
        let DeviceConnectArgs {
            name,
            kind,
            module_id,
            functions,
            data,
        } = args;
        let device = match self.devices.get(&name) {
            Some(node) => {
                let dev = Arc::clone(&node.device);
                let mut inner = dev.inner.lock();
                if inner.flags.contains(DeviceFlags::PRESENT) {
                    return Err(NetError::failure(format!("device {name} is already present")));
                }
                if inner.kind == DeviceType::Unknown {
                    inner.kind = kind;
                }
                inner.flags.insert(DeviceFlags::PRESENT);
                inner.module_id = module_id;
                inner.functions = Some(functions);
                inner.data = data;
                drop(inner);
                dev
            }
            None => {
                let dev = Arc::new(UplinkDevice::new(
                    &name,
                    kind,
                    DeviceFlags::AVAILABLE | DeviceFlags::PRESENT,
                ));
                {
                    let mut inner = dev.inner.lock();
                    inner.module_id = module_id;
                    inner.functions = Some(functions);
                    inner.data = data;
                }
                self.devices.insert(
                    name.clone(),
                    DeviceNode {
                        device: Arc::clone(&dev),
                        claimed_by: None,
                    },
                );
                dev
            }
        };
        info!(device = %name, %kind, module_id, "uplink device connected");
        Ok(device)
    }

    /// Opens the device and, if a port already claimed it, queues the
    /// wiring of that port.
    pub fn device_open(&mut self, name: &str, actions: &mut Vec<UplinkAction>) -> NetResult<()> {
        let dev = self
            .device(name)
            .cloned()
            .ok_or_else(|| NetError::not_found(format!("uplink device {name}")))?;
        let flags = dev.flags();
        if !flags.contains(DeviceFlags::PRESENT) {
            return Err(NetError::failure(format!("device {name} is not present")));
        }
        if !flags.contains(DeviceFlags::OPENED) {
            let opened = match dev.functions() {
                Some(functions) => functions.open(),
                None => Err(NetError::failure(format!("{name} has no driver"))),
            };
            if let Err(e) = opened {
                warn!(device = name, error = %e, "open failed");
                self.do_device_disconnected(&dev, actions);
                return Err(e);
            }
            dev.update_flags(|f| f.insert(DeviceFlags::OPENED));
            debug!(device = name, "device opened");
        }
        let flags = dev.flags();
        if !flags.contains(DeviceFlags::AVAILABLE) && !flags.contains(DeviceFlags::EVENT_NOTIFIED) {
            actions.push(UplinkAction::Connect {
                port_id: dev.uplink_port(),
                device: dev,
            });
        }
        Ok(())
    }

    /// Takes a device out of service. Its claim survives so that the same
    /// port is wired again when the device comes back.
    pub fn do_device_disconnected(
        &mut self,
        dev: &Arc<UplinkDevice>,
        actions: &mut Vec<UplinkAction>,
    ) {
        let flags = dev.flags();
        if !flags.contains(DeviceFlags::AVAILABLE) {
            debug!(device = dev.name(), port = %dev.uplink_port(), "breaking association");
            actions.push(UplinkAction::Disconnect {
                port_id: dev.uplink_port(),
                device: Arc::clone(dev),
            });
        }
        let functions = {
            let mut inner = dev.inner.lock();
            inner.flags.remove(DeviceFlags::PRESENT);
            inner.data = UplinkData::default();
            if inner.flags.contains(DeviceFlags::OPENED) {
                inner.flags.remove(DeviceFlags::OPENED);
                inner.functions.take()
            } else {
                inner.functions.take();
                None
            }
        };
        if let Some(functions) = functions {
            if let Err(e) = functions.close() {
                warn!(device = dev.name(), error = %e, "close failed");
            }
        }
        info!(device = dev.name(), "uplink device disconnected");
    }

    pub fn device_disconnected(
        &mut self,
        name: &str,
        actions: &mut Vec<UplinkAction>,
    ) -> NetResult<()> {
        let dev = self
            .device(name)
            .cloned()
            .ok_or_else(|| NetError::not_found(format!("uplink device {name}")))?;
        self.do_device_disconnected(&dev, actions);
        Ok(())
    }

    fn module_devices(&self, module_id: i32) -> Vec<Arc<UplinkDevice>> {
        self.devices()
            .filter(|d| d.module_id() == module_id && d.flags().contains(DeviceFlags::PRESENT))
            .cloned()
            .collect()
    }

    /// Opens every present device of a freshly loaded driver module.
    pub fn post_module_init(&mut self, module_id: i32, actions: &mut Vec<UplinkAction>) -> usize {
        let mut opened = 0;
        for dev in self.module_devices(module_id) {
            if self.device_open(dev.name(), actions).is_ok() {
                opened += 1;
            }
        }
        opened
    }

    /// Disconnects every device of a driver module about to be unloaded.
    pub fn pre_module_unload(&mut self, module_id: i32, actions: &mut Vec<UplinkAction>) -> usize {
        let devices = self.module_devices(module_id);
        for dev in &devices {
            self.do_device_disconnected(dev, actions);
        }
        devices.len()
    }

    /// Textual dump of every device and its flags.
    pub fn write_report(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "{:<18} {:<16} {:>10}", "Uplink Port", "Device Name", "Flags")?;
        for dev in self.devices() {
            let flags = dev.flags();
            writeln!(
                out,
                "{:<18} {:<16} {}{}{}{}",
                dev.uplink_port().to_string(),
                dev.name(),
                if flags.contains(DeviceFlags::AVAILABLE) { "A" } else { "NA" },
                if flags.contains(DeviceFlags::PRESENT) { ", P" } else { ", NP" },
                if flags.contains(DeviceFlags::OPENED) { ", O" } else { ", NO" },
                if flags.contains(DeviceFlags::EVENT_NOTIFIED) { ", NS" } else { ", NNS" },
            )?;
        }
        write!(
            out,
            "Legend:\n\tA:  Available NA:  Not available\n\tP:  Present   NP:  Absent\n\tO:  Opened    NO:  Closed\n\tNS: Notified  NNS: Not notified\n"
        )
    }

    /// Kind of the claim node of `portset`, if it claims anything.
    pub fn claim_kind(&self, portset: &str) -> Option<DeviceType> {
        self.claims.get(portset).map(|c| c.kind)
    }
}

impl fmt::Debug for UplinkTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UplinkTable")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("claims", &self.claims.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::pkt::Packet;

    /// Driver double that records every transmit call.
    #[derive(Default)]
    pub struct MockNic {
        pub sent: Mutex<Vec<Vec<u64>>>,
        pub opens: AtomicU32,
        pub closes: AtomicU32,
        pub fail_open: bool,
        pub fail_tx: bool,
    }

    impl MockNic {
        pub fn batches(&self) -> Vec<Vec<u64>> {
            self.sent.lock().clone()
        }
    }

    impl NetFunctions for MockNic {
        fn start_tx(&self, list: &mut PacketList) -> NetResult<()> {
            if self.fail_tx {
                return Err(NetError::failure("transmit refused"));
            }
            let tags: Vec<u64> = list.drain().map(|p: Packet| {
                let tag = p.tag();
                p.complete();
                tag
            }).collect();
            self.sent.lock().push(tags);
            Ok(())
        }

        fn open(&self) -> NetResult<()> {
            if self.fail_open {
                return Err(NetError::failure("open refused"));
            }
            self.opens.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn close(&self) -> NetResult<()> {
            self.closes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    pub fn leaf_args(name: &str, nic: Arc<MockNic>) -> DeviceConnectArgs {
        DeviceConnectArgs {
            name: name.to_string(),
            kind: DeviceType::Leaf,
            module_id: 7,
            functions: nic,
            data: UplinkData {
                pkt_hdr_size: 32,
                max_sg_length: 8,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{leaf_args, MockNic};
    use super::*;
    use crate::portset::{NoHooks, PortIdLayout};
    use crate::status::ReturnStatus;

    fn table(name: &str, index: usize) -> PortTable {
        let mut t = PortTable::new(index, PortIdLayout::new(16).unwrap());
        t.activate(name, 8);
        t
    }

    fn present_and_open(uplinks: &mut UplinkTable, name: &str) -> Arc<MockNic> {
        let nic = Arc::new(MockNic::default());
        uplinks.set_device_connected(leaf_args(name, nic.clone())).unwrap();
        let mut actions = Vec::new();
        uplinks.device_open(name, &mut actions).unwrap();
        assert!(actions.is_empty());
        nic
    }

    #[test]
    fn test_register_present_device_wires_port() {
        let mut uplinks = UplinkTable::new();
        let nic = present_and_open(&mut uplinks, "vmnic0");
        let mut t = table("hub0", 1);
        let port = t.connect_port(&mut NoHooks).unwrap();

        let data = uplinks
            .register(&mut t, port, "vmnic0", DeviceType::PortsetToplevel)
            .unwrap();
        assert_eq!(data.pkt_hdr_size, 32);
        let dev = uplinks.device("vmnic0").unwrap().clone();
        assert_eq!(dev.uplink_port(), port);
        assert!(dev.is_notified());
        assert_eq!(uplinks.claimant("vmnic0"), Some("hub0"));
        assert_eq!(t.port(port).unwrap().uplink(), Some("vmnic0"));
        assert!(nic.opens.load(Ordering::Relaxed) == 1);

        // the same port claiming again is fine
        assert!(uplinks
            .register(&mut t, port, "vmnic0", DeviceType::PortsetToplevel)
            .is_ok());
    }

    #[test]
    fn test_register_absent_device_records_claim() {
        let mut uplinks = UplinkTable::new();
        let mut t = table("bond0", 2);
        let port = t.connect_port(&mut NoHooks).unwrap();
        let err = uplinks
            .register(&mut t, port, "vmnic1", DeviceType::PortsetBond)
            .unwrap_err();
        assert_eq!(err.status(), ReturnStatus::NotFound);
        let dev = uplinks.device("vmnic1").unwrap().clone();
        assert_eq!(dev.kind(), DeviceType::Unknown);
        assert!(!dev.flags().contains(DeviceFlags::AVAILABLE));

        // the driver shows up later: open queues the wiring of the claimant
        let nic = Arc::new(MockNic::default());
        uplinks.set_device_connected(leaf_args("vmnic1", nic)).unwrap();
        assert_eq!(dev.kind(), DeviceType::Leaf);
        let mut actions = Vec::new();
        uplinks.device_open("vmnic1", &mut actions).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].port_id(), port);
    }

    #[test]
    fn test_claim_by_other_port_is_refused() {
        let mut uplinks = UplinkTable::new();
        present_and_open(&mut uplinks, "vmnic0");
        let mut a = table("hub0", 1);
        let mut b = table("hub1", 2);
        let pa = a.connect_port(&mut NoHooks).unwrap();
        let pb = b.connect_port(&mut NoHooks).unwrap();
        uplinks
            .register(&mut a, pa, "vmnic0", DeviceType::PortsetToplevel)
            .unwrap();
        let err = uplinks
            .register(&mut b, pb, "vmnic0", DeviceType::PortsetToplevel)
            .unwrap_err();
        assert_eq!(err.status(), ReturnStatus::NoResources);
    }

    #[test]
    fn test_present_but_closed_device_drops_claim() {
        let mut uplinks = UplinkTable::new();
        uplinks
            .set_device_connected(leaf_args("vmnic0", Arc::new(MockNic::default())))
            .unwrap();
        let mut t = table("hub0", 1);
        let port = t.connect_port(&mut NoHooks).unwrap();
        let err = uplinks
            .register(&mut t, port, "vmnic0", DeviceType::PortsetToplevel)
            .unwrap_err();
        assert_eq!(err.status(), ReturnStatus::Failure);
        assert!(uplinks
            .device("vmnic0")
            .unwrap()
            .flags()
            .contains(DeviceFlags::AVAILABLE));
        assert_eq!(uplinks.claimant("vmnic0"), None);
    }

    #[test]
    fn test_unregister_returns_device_to_root() {
        let mut uplinks = UplinkTable::new();
        present_and_open(&mut uplinks, "vmnic0");
        let mut t = table("hub0", 1);
        let port = t.connect_port(&mut NoHooks).unwrap();
        uplinks
            .register(&mut t, port, "vmnic0", DeviceType::PortsetToplevel)
            .unwrap();
        uplinks.unregister(&mut t, port, "vmnic0").unwrap();
        let dev = uplinks.device("vmnic0").unwrap();
        assert!(dev.flags().contains(DeviceFlags::AVAILABLE));
        assert!(!dev.is_notified());
        assert!(t.port(port).unwrap().output_chain.is_empty());
        assert_eq!(
            uplinks.unregister(&mut t, port, "vmnic0").unwrap_err().status(),
            ReturnStatus::Failure
        );
    }

    #[test]
    fn test_cycle_is_refused() {
        let mut uplinks = UplinkTable::new();
        // bondA claims bondB's device, then bondB tries to claim bondA's
        let mut a = table("bondA", 1);
        let mut b = table("bondB", 2);
        let pa = a.connect_port(&mut NoHooks).unwrap();
        let pb = b.connect_port(&mut NoHooks).unwrap();
        let _ = uplinks.register(&mut a, pa, "bondB", DeviceType::PortsetBond);
        let err = uplinks
            .register(&mut b, pb, "bondA", DeviceType::PortsetBond)
            .unwrap_err();
        assert_eq!(err.status(), ReturnStatus::Failure);
    }

    #[test]
    fn test_disconnect_queues_unwire_and_closes() {
        let mut uplinks = UplinkTable::new();
        let nic = present_and_open(&mut uplinks, "vmnic0");
        let mut t = table("hub0", 1);
        let port = t.connect_port(&mut NoHooks).unwrap();
        uplinks
            .register(&mut t, port, "vmnic0", DeviceType::PortsetToplevel)
            .unwrap();
        let mut actions = Vec::new();
        uplinks.device_disconnected("vmnic0", &mut actions).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(nic.closes.load(Ordering::Relaxed), 1);
        let flags = uplinks.device("vmnic0").unwrap().flags();
        assert!(!flags.contains(DeviceFlags::PRESENT));
        assert!(!flags.contains(DeviceFlags::OPENED));
    }

    #[test]
    fn test_failed_open_disconnects() {
        let mut uplinks = UplinkTable::new();
        let nic = Arc::new(MockNic {
            fail_open: true,
            ..MockNic::default()
        });
        uplinks.set_device_connected(leaf_args("vmnic0", nic)).unwrap();
        let mut actions = Vec::new();
        assert!(uplinks.device_open("vmnic0", &mut actions).is_err());
        assert!(!uplinks
            .device("vmnic0")
            .unwrap()
            .flags()
            .contains(DeviceFlags::PRESENT));
    }

    #[test]
    fn test_module_hooks_and_report() {
        let mut uplinks = UplinkTable::new();
        for name in ["vmnic0", "vmnic1"] {
            uplinks
                .set_device_connected(leaf_args(name, Arc::new(MockNic::default())))
                .unwrap();
        }
        let mut actions = Vec::new();
        assert_eq!(uplinks.post_module_init(7, &mut actions), 2);
        assert_eq!(uplinks.post_module_init(8, &mut actions), 0);

        let mut report = String::new();
        uplinks.write_report(&mut report).unwrap();
        assert!(report.contains("vmnic0"));
        assert!(report.contains("A, P, O, NNS"));
        assert!(report.contains("Legend:"));

        assert_eq!(uplinks.pre_module_unload(7, &mut actions), 2);
        assert!(actions.is_empty());
    }
}
