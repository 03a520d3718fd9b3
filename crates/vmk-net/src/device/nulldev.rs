//! Null policy: every packet is counted and completed, nothing is forwarded.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use super::{NetType, PortsetPolicy};
use crate::iochain::{ChainCall, ChainRank};
use crate::pktlist::PacketList;
use crate::port::{Port, PortId};
use crate::portset::{PortHooks, PortTable, Upcall};
use crate::status::NetResult;

struct InputCounter {
    count: Arc<AtomicU64>,
}

impl ChainCall for InputCounter {
    fn name(&self) -> &str {
        "NullDevInputCounter"
    }

    fn call(&self, _port: PortId, list: &mut PacketList) -> NetResult<()> {
        self.count.fetch_add(list.count() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Sink portset.
#[derive(Default)]
pub struct NullDev {
    counts: BTreeMap<PortId, Arc<AtomicU64>>,
}

impl NullDev {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets received from `port` since connect or the last stats clear.
    pub fn count(&self, port: PortId) -> Option<u64> {
        self.counts.get(&port).map(|c| c.load(Ordering::Relaxed))
    }
}

impl PortHooks for NullDev {
    fn port_connect(&mut self, port: &mut Port) -> NetResult<()> {
        let count = Arc::new(AtomicU64::new(0));
        port.input_chain.insert_call(
            ChainRank::PreFilter,
            Arc::new(InputCounter {
                count: Arc::clone(&count),
            }),
            false,
        )?;
        self.counts.insert(port.id(), count);
        Ok(())
    }

    fn port_disconnect(&mut self, port: &mut Port) {
        self.counts.remove(&port.id());
    }
}

impl PortsetPolicy for NullDev {
    fn net_type(&self) -> NetType {
        NetType::Null
    }

    fn dispatch(
        &mut self,
        _table: &mut PortTable,
        src: PortId,
        list: &mut PacketList,
        _upcalls: &mut Vec<Upcall>,
    ) -> NetResult<()> {
        trace!(port = %src, pkts = list.count(), "null dispatch");
        list.complete_all();
        Ok(())
    }

    fn clear_stats(&mut self) {
        for count in self.counts.values() {
            count.store(0, Ordering::Relaxed);
        }
    }

    fn write_report(&self, _table: &PortTable, out: &mut String) -> fmt::Result {
        for (port, count) in &self.counts {
            writeln!(out, "port {port}: {} pkts", count.load(Ordering::Relaxed))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkt::testutil::Recorder;
    use crate::pkt::{Disposition, Packet};
    use crate::portset::PortIdLayout;

    #[test]
    fn test_counts_and_completes() {
        let mut table = PortTable::new(1, PortIdLayout::new(4).unwrap());
        table.activate("null0", 4);
        let mut dev = NullDev::new();
        let id = table.connect_port(&mut dev).unwrap();
        table.enable_port(id, &mut dev).unwrap();

        let recorder = Arc::new(Recorder::default());
        let mut list: PacketList = (0..3)
            .map(|t| Packet::new(vec![0u8; 64]).with_tag(t).with_completion(recorder.clone()))
            .collect();
        let port = table.port_mut(id).unwrap();
        port.input_chain.start(id, &mut list).unwrap();
        dev.dispatch(&mut table, id, &mut list, &mut Vec::new()).unwrap();

        assert!(list.is_empty());
        assert_eq!(recorder.count(Disposition::Completed), 3);
        assert_eq!(dev.count(id), Some(3));
        dev.clear_stats();
        assert_eq!(dev.count(id), Some(0));

        table.disconnect_port(id, &mut dev).unwrap();
        assert_eq!(dev.count(id), None);
    }
}
