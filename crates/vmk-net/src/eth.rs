//! Ethernet addresses and per-port frame filters.

use std::fmt;

use bitflags::bitflags;
use tracing::trace;

/// 48-bit MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct EthAddress(pub [u8; 6]);

impl EthAddress {
    pub const BROADCAST: EthAddress = EthAddress([0xff; 6]);

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 6] = bytes.try_into().ok()?;
        Some(EthAddress(arr))
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit set, broadcast included.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }

    /// Index into the 64-bit lance logical address filter: the low six bits
    /// of the Ethernet CRC of the address, bit-reversed.
    pub fn ladrf_hash(&self) -> u8 {
        const POLY: u32 = 0x04c1_1db7;
        let mut crc: u32 = 0xffff_ffff;
        for &byte in &self.0 {
            let mut bits = byte;
            for _ in 0..8 {
                let carry = (crc >> 31) ^ u32::from(bits & 0x01);
                crc <<= 1;
                if carry & 0x01 != 0 {
                    crc ^= POLY;
                }
                bits >>= 1;
            }
        }
        let mut hash = (crc & 1) as u8;
        for _ in 0..5 {
            crc >>= 1;
            hash = (hash << 1) | (crc & 1) as u8;
        }
        hash
    }
}

impl fmt::Display for EthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

bitflags! {
    /// Which frame classes a filter passes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EthFilterFlags: u32 {
        /// Directed frames matching the unicast address
        const UNICAST = 0x0001;
        /// Multicast frames in the exact list
        const MULTICAST = 0x0002;
        /// Every multicast frame
        const ALLMULTI = 0x0004;
        const BROADCAST = 0x0008;
        /// No filtering at all
        const PROMISC = 0x0010;
        /// Fall back on the logical address filter for multicast
        const USE_LADRF = 0x0020;
    }
}

/// Frame counts by destination class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EthStats {
    pub unicast_frames: u64,
    pub broadcast_frames: u64,
    pub multicast_frames: u64,
}

/// Destination-address filter, modelled on a NIC receive filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EthFilter {
    pub flags: EthFilterFlags,
    pub unicast_addr: EthAddress,
    pub multicast_addrs: Vec<EthAddress>,
    /// 64-bit logical address filter, indexed by [`EthAddress::ladrf_hash`].
    pub ladrf: [u8; 8],
    pub passed: EthStats,
    pub blocked: EthStats,
}

impl EthFilter {
    /// A filter that passes everything.
    pub fn promiscuous() -> Self {
        Self {
            flags: EthFilterFlags::PROMISC,
            ..Self::default()
        }
    }

    /// The usual station filter: own address plus broadcast.
    pub fn station(addr: EthAddress) -> Self {
        Self {
            flags: EthFilterFlags::UNICAST | EthFilterFlags::BROADCAST,
            unicast_addr: addr,
            ..Self::default()
        }
    }

    pub fn is_promiscuous(&self) -> bool {
        self.flags.contains(EthFilterFlags::PROMISC)
    }

    /// Sets the logical address filter bit for `addr`.
    pub fn ladrf_add(&mut self, addr: &EthAddress) {
        let hash = addr.ladrf_hash();
        self.ladrf[usize::from(hash >> 3)] |= 1 << (hash & 0x07);
    }

    fn ladrf_match(&self, addr: &EthAddress) -> bool {
        if !self.flags.contains(EthFilterFlags::USE_LADRF) {
            return false;
        }
        let hash = addr.ladrf_hash();
        self.ladrf[usize::from(hash >> 3)] & (1 << (hash & 0x07)) != 0
    }

    /// Decides whether a frame addressed to `addr` passes, updating the
    /// passed/blocked counters.
    pub fn run(&mut self, addr: &EthAddress) -> bool {
        let promisc = self.flags.contains(EthFilterFlags::PROMISC);
        let pass = if addr.is_unicast() {
            let pass = (promisc || *addr == self.unicast_addr)
                && self
                    .flags
                    .intersects(EthFilterFlags::UNICAST | EthFilterFlags::PROMISC);
            bump(&mut self.passed, &mut self.blocked, pass).unicast_frames += 1;
            pass
        } else if addr.is_broadcast() {
            let pass = self
                .flags
                .intersects(EthFilterFlags::PROMISC | EthFilterFlags::BROADCAST);
            bump(&mut self.passed, &mut self.blocked, pass).broadcast_frames += 1;
            pass
        } else {
            let listed = if promisc {
                true
            } else if self.flags.contains(EthFilterFlags::MULTICAST) {
                self.multicast_addrs.contains(addr)
            } else {
                self.flags.contains(EthFilterFlags::ALLMULTI)
            };
            let pass = listed || self.ladrf_match(addr);
            bump(&mut self.passed, &mut self.blocked, pass).multicast_frames += 1;
            pass
        };
        trace!(%addr, pass, "eth filter");
        pass
    }

    pub fn clear_stats(&mut self) {
        self.passed = EthStats::default();
        self.blocked = EthStats::default();
    }
}

fn bump<'a>(passed: &'a mut EthStats, blocked: &'a mut EthStats, pass: bool) -> &'a mut EthStats {
    if pass {
        passed
    } else {
        blocked
    }
}

/// Frame routing policy of one port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EthFrp {
    /// Applied to frames leaving the switch through the port.
    pub output_filter: EthFilter,
    /// Applied to frames the port's client injects.
    pub input_filter: EthFilter,
    pub vlan_id: u16,
}

impl EthFrp {
    /// A policy that filters nothing, which is what a fresh port gets.
    pub fn open() -> Self {
        Self {
            output_filter: EthFilter::promiscuous(),
            input_filter: EthFilter::promiscuous(),
            vlan_id: 0,
        }
    }
}
