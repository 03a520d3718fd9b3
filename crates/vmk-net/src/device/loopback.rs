//! Loopback policy: a batch leaves through the port it came in on.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{NetType, PortsetPolicy};
use crate::iochain::{ChainCall, ChainRank};
use crate::pktlist::PacketList;
use crate::port::{Port, PortId};
use crate::portset::{PortHooks, PortTable, Upcall};
use crate::status::NetResult;

/// Per-port loopback counters.
#[derive(Debug, Default)]
pub struct LoopbackStats {
    pub input: AtomicU64,
    pub output: AtomicU64,
    pub complete: AtomicU64,
}

impl LoopbackStats {
    fn clear(&self) {
        self.input.store(0, Ordering::Relaxed);
        self.output.store(0, Ordering::Relaxed);
        self.complete.store(0, Ordering::Relaxed);
    }

    /// `(input, output, complete)`.
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.input.load(Ordering::Relaxed),
            self.output.load(Ordering::Relaxed),
            self.complete.load(Ordering::Relaxed),
        )
    }
}

#[derive(Clone, Copy)]
enum Counter {
    Input,
    Output,
    Complete,
}

struct CountLink {
    counter: Counter,
    stats: Arc<LoopbackStats>,
}

impl ChainCall for CountLink {
    fn name(&self) -> &str {
        match self.counter {
            Counter::Input => "LoopbackInput",
            Counter::Output => "LoopbackOutput",
            Counter::Complete => "LoopbackComplete",
        }
    }

    fn call(&self, _port: PortId, list: &mut PacketList) -> NetResult<()> {
        let n = list.count() as u64;
        let field = match self.counter {
            Counter::Input => &self.stats.input,
            Counter::Output => &self.stats.output,
            Counter::Complete => &self.stats.complete,
        };
        field.fetch_add(n, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Default)]
pub struct Loopback {
    stats: BTreeMap<PortId, Arc<LoopbackStats>>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self, port: PortId) -> Option<&LoopbackStats> {
        self.stats.get(&port).map(Arc::as_ref)
    }
}

impl PortHooks for Loopback {
    fn port_connect(&mut self, port: &mut Port) -> NetResult<()> {
        let stats = Arc::new(LoopbackStats::default());
        let link = |counter| {
            Arc::new(CountLink {
                counter,
                stats: Arc::clone(&stats),
            })
        };
        port.input_chain
            .insert_call(ChainRank::PreFilter, link(Counter::Input), false)?;
        port.output_chain
            .insert_call(ChainRank::PostQueue, link(Counter::Output), false)?;
        port.notify_chain
            .insert_call(ChainRank::PostQueue, link(Counter::Complete), false)?;
        self.stats.insert(port.id(), stats);
        Ok(())
    }

    fn port_disconnect(&mut self, port: &mut Port) {
        self.stats.remove(&port.id());
    }
}

impl PortsetPolicy for Loopback {
    fn net_type(&self) -> NetType {
        NetType::Loopback
    }

    fn dispatch(
        &mut self,
        table: &mut PortTable,
        src: PortId,
        list: &mut PacketList,
        _upcalls: &mut Vec<Upcall>,
    ) -> NetResult<()> {
        match table.port_mut(src) {
            Some(port) if port.is_output_active() => port.output(list),
            _ => Ok(()),
        }
    }

    fn clear_stats(&mut self) {
        self.stats.values().for_each(|s| s.clear());
    }

    fn write_report(&self, _table: &PortTable, out: &mut String) -> fmt::Result {
        for (port, stats) in &self.stats {
            let (input, output, complete) = stats.snapshot();
            writeln!(
                out,
                "port {port}: in {input} out {output} complete {complete}"
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iochain::testutil::Capture;
    use crate::pkt::Packet;
    use crate::portset::PortIdLayout;

    #[test]
    fn test_batch_goes_back_out_its_port() {
        let mut table = PortTable::new(2, PortIdLayout::new(4).unwrap());
        table.activate("lo0", 2);
        let mut dev = Loopback::new();
        let id = table.connect_port(&mut dev).unwrap();
        let other = table.connect_port(&mut dev).unwrap();
        table.enable_port(id, &mut dev).unwrap();
        table.enable_port(other, &mut dev).unwrap();
        let capture = Arc::new(Capture::default());
        let other_capture = Arc::new(Capture::default());
        table
            .port_mut(id)
            .unwrap()
            .output_chain
            .insert_call(ChainRank::Terminal, capture.clone(), true)
            .unwrap();
        table
            .port_mut(other)
            .unwrap()
            .output_chain
            .insert_call(ChainRank::Terminal, other_capture.clone(), true)
            .unwrap();

        let mut list: PacketList = (0..2).map(|t| Packet::new(vec![0u8; 60]).with_tag(t)).collect();
        dev.dispatch(&mut table, id, &mut list, &mut Vec::new()).unwrap();
        assert_eq!(capture.tags(), vec![0, 1]);
        assert!(other_capture.tags().is_empty());
        assert_eq!(dev.stats(id).unwrap().snapshot(), (0, 2, 0));
    }
}
