//! Bootstrap of the pre-named hub and bond pairs older teaming setups expect.

use tracing::{info, warn};

use crate::device::NetType;
use crate::net::Net;
use crate::status::NetResult;

/// Ports of every legacy portset.
pub const LEGACY_NUM_PORTS: usize = 33;

/// A hub whose single uplink is the bond of the same pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyPair {
    pub hub: &'static str,
    pub bond: &'static str,
}

pub const LEGACY_BONDS: [LegacyPair; 10] = [
    LegacyPair { hub: "bond0", bond: "legacyBond0" },
    LegacyPair { hub: "bond1", bond: "legacyBond1" },
    LegacyPair { hub: "bond2", bond: "legacyBond2" },
    LegacyPair { hub: "bond3", bond: "legacyBond3" },
    LegacyPair { hub: "bond4", bond: "legacyBond4" },
    LegacyPair { hub: "bond5", bond: "legacyBond5" },
    LegacyPair { hub: "bond6", bond: "legacyBond6" },
    LegacyPair { hub: "bond7", bond: "legacyBond7" },
    LegacyPair { hub: "bond8", bond: "legacyBond8" },
    LegacyPair { hub: "bond9", bond: "legacyBond9" },
];

fn create_pair(net: &Net, pair: &LegacyPair) -> NetResult<()> {
    net.create(pair.hub, LEGACY_NUM_PORTS, NetType::Hubbed)?;
    net.create(pair.bond, LEGACY_NUM_PORTS, NetType::Bond)?;
    net.connect_uplink_port(pair.hub, pair.bond)?;
    Ok(())
}

/// Creates every legacy pair. A pair that fails is logged and skipped;
/// returns how many came up.
pub fn legacy_init(net: &Net) -> usize {
    let mut created = 0;
    for pair in &LEGACY_BONDS {
        match create_pair(net, pair) {
            Ok(()) => created += 1,
            Err(e) => warn!(hub = pair.hub, bond = pair.bond, error = %e, "legacy bond setup failed"),
        }
    }
    info!(created, "legacy bonds initialized");
    created
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uplink::UplinkData;

    #[test]
    fn test_pairs_are_distinct() {
        let mut names: Vec<&str> = LEGACY_BONDS.iter().flat_map(|p| [p.hub, p.bond]).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 20);
    }

    #[test]
    fn test_legacy_init_wires_hubs_to_bonds() {
        let net = Net::new(32).unwrap();
        net.set_lower_layer(UplinkData {
            pkt_hdr_size: 64,
            max_sg_length: 16,
        });
        assert_eq!(legacy_init(&net), 10);
        assert_eq!(net.bond_names().len(), 10);
        assert_eq!(net.find_bond_by_name("legacyBond3"), net.portset_info().iter().find(|i| i.name == "legacyBond3").map(|i| i.index));
        let hub = net.uplink_device("legacyBond3").unwrap();
        assert!(hub.uplink_port().is_valid());
        assert!(hub.is_notified());
        assert!(net.admin_entries().contains(&"bond/legacyBond0".to_string()));
    }

    #[test]
    fn test_legacy_init_without_lower_layer_keeps_hubs() {
        let net = Net::new(32).unwrap();
        assert_eq!(legacy_init(&net), 0);
        assert!(net.bond_names().is_empty());
        assert_eq!(net.portset_info().len(), 10);
    }
}
