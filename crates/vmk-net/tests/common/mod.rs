//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use vmk_net::{
    ChainCall, ChainRank, DeviceConnectArgs, DeviceType, Disposition, Net, NetFunctions,
    NetResult, Packet, PacketCompletion, PacketList, PortId, UplinkData, UplinkDevice,
};

pub const CLIENT_A: [u8; 6] = [0x00, 0x50, 0x56, 0x00, 0x00, 0x01];
pub const CLIENT_B: [u8; 6] = [0x00, 0x50, 0x56, 0x00, 0x00, 0x02];
pub const REMOTE: [u8; 6] = [0x00, 0x1b, 0x21, 0x00, 0x00, 0x99];
pub const BROADCAST: [u8; 6] = [0xff; 6];

pub fn net(num_portsets: usize) -> Net {
    let net = Net::new(num_portsets).unwrap();
    net.set_lower_layer(UplinkData {
        pkt_hdr_size: 64,
        max_sg_length: 16,
    });
    net
}

/// Physical NIC stand-in: records the tag of every transmitted packet.
#[derive(Default)]
pub struct FakeNic {
    pub sent: Mutex<Vec<u64>>,
}

impl FakeNic {
    pub fn sent(&self) -> Vec<u64> {
        self.sent.lock().clone()
    }
}

impl NetFunctions for FakeNic {
    fn start_tx(&self, list: &mut PacketList) -> NetResult<()> {
        let mut sent = self.sent.lock();
        for pkt in list.drain() {
            sent.push(pkt.tag());
            pkt.complete();
        }
        Ok(())
    }
}

/// Registers and opens a NIC the way a driver would.
pub fn plug_nic(net: &Net, name: &str) -> (Arc<FakeNic>, Arc<UplinkDevice>) {
    let nic = Arc::new(FakeNic::default());
    let dev = net
        .device_connected(DeviceConnectArgs {
            name: name.to_string(),
            kind: DeviceType::Leaf,
            module_id: 3,
            functions: nic.clone(),
            data: UplinkData {
                pkt_hdr_size: 32,
                max_sg_length: 8,
            },
        })
        .unwrap();
    net.device_open(name).unwrap();
    (nic, dev)
}

/// Terminal link standing in for a virtual NIC's receive queue.
#[derive(Default)]
pub struct Inbox {
    pub received: Mutex<Vec<u64>>,
}

impl Inbox {
    pub fn tags(&self) -> Vec<u64> {
        self.received.lock().clone()
    }
}

impl ChainCall for Inbox {
    fn name(&self) -> &str {
        "Inbox"
    }

    fn call(&self, _port: PortId, list: &mut PacketList) -> NetResult<()> {
        let mut received = self.received.lock();
        for pkt in list.drain() {
            received.push(pkt.tag());
            pkt.complete();
        }
        Ok(())
    }
}

/// Connects and enables a client port with an inbox on its output chain.
pub fn client(net: &Net, portset: &str) -> (PortId, Arc<Inbox>) {
    let id = net.connect_port(portset).unwrap();
    net.enable_port(id).unwrap();
    let inbox = Arc::new(Inbox::default());
    net.with_port(id, |port| {
        port.output_chain
            .insert_call(ChainRank::Terminal, inbox.clone(), true)
    })
    .unwrap()
    .unwrap();
    (id, inbox)
}

/// Records how each packet was disposed of.
#[derive(Default)]
pub struct Completions {
    pub events: Mutex<Vec<(u64, Disposition)>>,
}

impl Completions {
    pub fn tags(&self, disposition: Disposition) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter(|(_, d)| *d == disposition)
            .map(|(t, _)| *t)
            .collect()
    }
}

impl PacketCompletion for Completions {
    fn dispose(&self, tag: u64, disposition: Disposition) {
        self.events.lock().push((tag, disposition));
    }
}

pub fn frame(dst: [u8; 6], src: [u8; 6], tag: u64) -> Packet {
    let mut bytes = vec![0u8; 60];
    bytes[0..6].copy_from_slice(&dst);
    bytes[6..12].copy_from_slice(&src);
    Packet::new(bytes).with_tag(tag)
}

/// Builds a batch whose disposals land in `completions`.
pub fn batch(
    completions: &Arc<Completions>,
    dst: [u8; 6],
    src: [u8; 6],
    tags: impl IntoIterator<Item = u64>,
) -> PacketList {
    tags.into_iter()
        .map(|t| frame(dst, src, t).with_completion(completions.clone()))
        .collect()
}
