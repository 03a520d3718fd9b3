//! Virtual switching core with NIC teaming.
//!
//! This crate provides the pieces a host uses to connect virtual NICs to
//! each other and to physical uplinks:
//!
//! - [`PacketList`]: ordered batch of packets, the unit every path moves
//! - [`IoChain`]: ranked filter/queue/terminal links run over a batch
//! - [`Port`] / [`Portset`]: connection points grouped under one policy
//! - [`UplinkTable`]: registry of physical or virtual devices and the
//!   ports that claimed them
//! - [`Bond`]: a portset whose bottom device load-balances across slave
//!   uplinks
//! - [`Net`]: the context owning all of the above, and the entry points
//!
//! # Architecture
//!
//! Packets flow in batches:
//!
//! 1. A client (or an uplink driver) hands a [`PacketList`] to [`Net::port_input`]
//! 2. The port's input chain runs, then the portset's policy dispatches the batch
//! 3. Destination ports run their output chains; an uplink port ends in the
//!    device's transmit function
//! 4. A bond device's transmit partitions the batch across its slaves
//! 5. Whatever nobody consumed is completed back to the producer
//!
//! Administrative requests arrive through [`Net`] directly or as text lines
//! via [`control::handle_line`].
//!
//! # Example
//!
//! ```ignore
//! use vmk_net::{Net, NetType, UplinkData};
//!
//! let net = Net::new(16)?;
//! net.set_lower_layer(UplinkData { pkt_hdr_size: 64, max_sg_length: 16 });
//! net.create("bond0", 16, NetType::Bond)?;
//! net.bond_admin_write("bond0", "add vmnic0")?;
//! net.create("vswitch0", 64, NetType::EtherSwitched)?;
//! net.connect_uplink_port("vswitch0", "bond0")?;
//! ```

pub mod config;
pub mod control;
pub mod device;
pub mod eth;
pub mod iochain;
pub mod legacy;
pub mod net;
pub mod pkt;
pub mod pktlist;
pub mod port;
pub mod portset;
pub mod status;
pub mod uplink;

pub use config::{Config, ConfigError};
pub use device::{Bond, NetType, PortsetPolicy, SlaveSelector};
pub use eth::{EthAddress, EthFilter, EthFrp};
pub use iochain::{ChainCall, ChainRank, IoChain};
pub use net::{DeviceCommand, Net, PortsetInfo};
pub use pkt::{Disposition, Packet, PacketCompletion};
pub use pktlist::PacketList;
pub use port::{Port, PortId};
pub use portset::Portset;
pub use status::{NetError, NetResult, ReturnStatus};
pub use uplink::{
    DeviceConnectArgs, DeviceType, NetFunctions, UplinkData, UplinkDevice, UplinkStatus,
    UplinkTable,
};
