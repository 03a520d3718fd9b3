//! Switch ports.
//!
//! A [`Port`] is one endpoint of a connection into a portset. It owns three
//! I/O chains (input, output and notify), its frame routing policy and the
//! counters kept on behalf of its client. Port state transitions that need
//! the owning policy's cooperation live on [`crate::portset::PortTable`].

use std::fmt::{self, Write as _};

use bitflags::bitflags;

use crate::eth::EthFrp;
use crate::iochain::IoChain;
use crate::pktlist::PacketList;
use crate::status::NetResult;

/// 32-bit port handle. The portset index lives in the top bits and a
/// generation counter in the rest; 0 is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct PortId(pub u32);

impl PortId {
    pub const INVALID: PortId = PortId(0);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

bitflags! {
    /// Connection state of a port.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PortFlags: u32 {
        /// Slot is connected
        const IN_USE = 0x0001;
        /// Traffic flows in both directions
        const ENABLED = 0x0002;
        /// Disable in progress; input still drains
        const DISABLE_PENDING = 0x0004;
    }
}

/// Counters kept for the port's client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortClientStats {
    /// Packets the client handed to the switch
    pub pkts_tx_ok: u64,
    pub bytes_tx_ok: u64,
    /// Packets the switch delivered to the client
    pub pkts_rx_ok: u64,
    pub bytes_rx_ok: u64,
    pub dropped_tx: u64,
    pub dropped_rx: u64,
}

/// One switch port.
pub struct Port {
    id: PortId,
    flags: PortFlags,
    pub input_chain: IoChain,
    pub output_chain: IoChain,
    pub notify_chain: IoChain,
    pub client_stats: PortClientStats,
    pub eth_frp: EthFrp,
    uplink: Option<String>,
}

impl Default for Port {
    fn default() -> Self {
        Self::new()
    }
}

impl Port {
    pub(crate) fn new() -> Self {
        Self {
            id: PortId::INVALID,
            flags: PortFlags::empty(),
            input_chain: IoChain::new(),
            output_chain: IoChain::new(),
            notify_chain: IoChain::new(),
            client_stats: PortClientStats::default(),
            eth_frp: EthFrp::open(),
            uplink: None,
        }
    }

    /// Last ID assigned to this slot. Still set after disconnect so that a
    /// stale handle can be told apart from a never-issued one.
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn flags(&self) -> PortFlags {
        self.flags
    }

    pub fn is_in_use(&self) -> bool {
        self.flags.contains(PortFlags::IN_USE)
    }

    pub fn is_available(&self) -> bool {
        !self.is_in_use()
    }

    pub fn is_enabled(&self) -> bool {
        self.flags.contains(PortFlags::ENABLED)
    }

    /// Input keeps draining while a disable is pending.
    pub fn is_input_active(&self) -> bool {
        self.flags
            .intersects(PortFlags::ENABLED | PortFlags::DISABLE_PENDING)
    }

    pub fn is_output_active(&self) -> bool {
        self.is_enabled()
    }

    /// Name of the uplink device this port is wired to, if any.
    pub fn uplink(&self) -> Option<&str> {
        self.uplink.as_deref()
    }

    pub(crate) fn set_uplink(&mut self, name: Option<String>) {
        self.uplink = name;
    }

    pub(crate) fn connect(&mut self, id: PortId) -> NetResult<()> {
        if self.is_in_use() {
            return Err(crate::status::NetError::busy(format!("port {}", self.id)));
        }
        *self = Port::new();
        self.id = id;
        self.flags = PortFlags::IN_USE;
        Ok(())
    }

    pub(crate) fn disconnect(&mut self) {
        let id = self.id;
        self.release_chains();
        *self = Port::new();
        self.id = id;
    }

    pub(crate) fn mark_enabled(&mut self) {
        self.flags.insert(PortFlags::ENABLED);
    }

    pub(crate) fn begin_disable(&mut self) {
        self.flags.insert(PortFlags::DISABLE_PENDING);
        self.flags.remove(PortFlags::ENABLED);
    }

    pub(crate) fn finish_disable(&mut self) {
        self.release_chains();
        self.flags.remove(PortFlags::DISABLE_PENDING);
    }

    fn release_chains(&mut self) {
        self.input_chain.release();
        self.output_chain.release();
        self.notify_chain.release();
    }

    /// Runs the output chain on `list`. Whatever the chain leaves behind
    /// stays in `list` for the caller to complete.
    pub fn output(&mut self, list: &mut PacketList) -> NetResult<()> {
        let pkts = list.count() as u64;
        let bytes = list.byte_count() as u64;
        let result = self.output_chain.start(self.id, list);
        match result {
            Ok(()) => {
                self.client_stats.pkts_rx_ok += pkts;
                self.client_stats.bytes_rx_ok += bytes;
            }
            Err(_) => self.client_stats.dropped_rx += pkts,
        }
        result
    }

    /// Hands leftovers to the notify chain, then completes them.
    pub fn io_complete(&mut self, list: &mut PacketList) {
        if list.is_empty() {
            return;
        }
        if !self.notify_chain.is_empty() {
            // a failing notify link only stops the chain
            let _ = self.notify_chain.start(self.id, list);
        }
        list.complete_all();
    }

    pub fn clear_stats(&mut self) {
        self.client_stats = PortClientStats::default();
        self.eth_frp.output_filter.clear_stats();
        self.eth_frp.input_filter.clear_stats();
        self.input_chain.clear_stats();
        self.output_chain.clear_stats();
        self.notify_chain.clear_stats();
    }

    /// Human-readable status dump.
    pub fn write_report(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "port {} flags {:?}", self.id, self.flags)?;
        if let Some(uplink) = &self.uplink {
            writeln!(out, "uplink: {uplink}")?;
        }
        let frp = &self.eth_frp;
        writeln!(
            out,
            "eth output filter: {:?} passed {:?} blocked {:?}",
            frp.output_filter.flags, frp.output_filter.passed, frp.output_filter.blocked
        )?;
        writeln!(
            out,
            "eth input filter: {:?} passed {:?} blocked {:?}",
            frp.input_filter.flags, frp.input_filter.passed, frp.input_filter.blocked
        )?;
        self.input_chain.write_report("input chain", out)?;
        self.output_chain.write_report("output chain", out)?;
        self.notify_chain.write_report("notify chain", out)?;
        let s = &self.client_stats;
        writeln!(
            out,
            "client: tx {} pkts {} bytes, rx {} pkts {} bytes, dropped tx {} rx {}",
            s.pkts_tx_ok, s.bytes_tx_ok, s.pkts_rx_ok, s.bytes_rx_ok, s.dropped_tx, s.dropped_rx
        )
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("uplink", &self.uplink)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iochain::testutil::Capture;
    use crate::iochain::ChainRank;
    use crate::pkt::Packet;
    use std::sync::Arc;

    #[test]
    fn test_connect_twice_is_busy() {
        let mut port = Port::new();
        port.connect(PortId(5)).unwrap();
        assert!(port.is_in_use());
        assert!(!port.is_enabled());
        let err = port.connect(PortId(6)).unwrap_err();
        assert_eq!(err.status(), crate::status::ReturnStatus::Busy);
    }

    #[test]
    fn test_disable_pending_keeps_input_active() {
        let mut port = Port::new();
        port.connect(PortId(5)).unwrap();
        port.mark_enabled();
        assert!(port.is_output_active());
        port.begin_disable();
        assert!(port.is_input_active());
        assert!(!port.is_output_active());
        port.finish_disable();
        assert!(!port.is_input_active());
    }

    #[test]
    fn test_disconnect_keeps_id_and_drops_chains() {
        let mut port = Port::new();
        port.connect(PortId(9)).unwrap();
        port.output_chain
            .insert_call(ChainRank::Terminal, Arc::new(Capture::default()), true)
            .unwrap();
        port.disconnect();
        assert_eq!(port.id(), PortId(9));
        assert!(port.is_available());
        assert!(port.output_chain.is_empty());
    }

    #[test]
    fn test_output_counts_delivery() {
        let mut port = Port::new();
        port.connect(PortId(3)).unwrap();
        let capture = Arc::new(Capture::default());
        port.output_chain
            .insert_call(ChainRank::Terminal, capture.clone(), true)
            .unwrap();
        let mut list: PacketList = (0..2).map(|t| Packet::new(vec![0u8; 100]).with_tag(t)).collect();
        port.output(&mut list).unwrap();
        assert_eq!(capture.tags(), vec![0, 1]);
        assert_eq!(port.client_stats.pkts_rx_ok, 2);
        assert_eq!(port.client_stats.bytes_rx_ok, 200);

        let mut report = String::new();
        port.write_report(&mut report).unwrap();
        assert!(report.contains("-> 5:Capture"));
    }
}
