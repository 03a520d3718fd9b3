//! Portset life cycle and the non-teaming policies, driven through `Net`.

mod common;

use std::sync::Arc;

use common::*;
use pretty_assertions::assert_eq;
use vmk_net::control::handle_line;
use vmk_net::{
    Disposition, EthAddress, EthFilter, EthFrp, Net, NetType, PortId, ReturnStatus,
};

#[test]
fn test_learning_switch_through_net() {
    let net = net(8);
    net.create("vswitch0", 8, NetType::EtherSwitched).unwrap();
    let (a, inbox_a) = client(&net, "vswitch0");
    let (b, inbox_b) = client(&net, "vswitch0");
    let (_c, inbox_c) = client(&net, "vswitch0");

    let done = Arc::new(Completions::default());
    // unknown destination floods
    net.port_input(a, &mut batch(&done, CLIENT_B, CLIENT_A, [1]))
        .unwrap();
    assert_eq!(inbox_b.tags(), vec![1]);
    assert_eq!(inbox_c.tags(), vec![1]);

    // the reply goes straight back to A
    net.port_input(b, &mut batch(&done, CLIENT_A, CLIENT_B, [2]))
        .unwrap();
    assert_eq!(inbox_a.tags(), vec![2]);
    assert_eq!(inbox_c.tags(), vec![1]);

    assert_eq!(done.tags(Disposition::Completed), vec![1, 2]);
}

#[test]
fn test_hub_output_filter_follows_frp() {
    let net = net(8);
    net.create("hub0", 8, NetType::Hubbed).unwrap();
    let (a, _) = client(&net, "hub0");
    let (b, inbox_b) = client(&net, "hub0");
    net.update_eth_frp(
        b,
        EthFrp {
            output_filter: EthFilter::station(EthAddress(CLIENT_B)),
            ..EthFrp::open()
        },
    )
    .unwrap();

    let done = Arc::new(Completions::default());
    let mut list = batch(&done, CLIENT_B, CLIENT_A, [1]);
    list.join(&mut batch(&done, REMOTE, CLIENT_A, [2]));
    list.join(&mut batch(&done, BROADCAST, CLIENT_A, [3]));
    net.port_input(a, &mut list).unwrap();

    assert_eq!(inbox_b.tags(), vec![1, 3]);
    // filtering happens on clones; every original is completed
    assert_eq!(done.tags(Disposition::Completed), vec![1, 2, 3]);
}

#[test]
fn test_loopback_returns_to_sender() {
    let net = net(4);
    net.create("lo0", 4, NetType::Loopback).unwrap();
    let (a, inbox_a) = client(&net, "lo0");
    let (_b, inbox_b) = client(&net, "lo0");

    let done = Arc::new(Completions::default());
    net.port_input(a, &mut batch(&done, REMOTE, CLIENT_A, [5, 6]))
        .unwrap();
    assert_eq!(inbox_a.tags(), vec![5, 6]);
    assert!(inbox_b.tags().is_empty());
}

#[test]
fn test_null_portset_completes_everything() {
    let net = net(4);
    net.create("null0", 4, NetType::Null).unwrap();
    let (a, _) = client(&net, "null0");
    let done = Arc::new(Completions::default());
    net.port_input(a, &mut batch(&done, REMOTE, CLIENT_A, 0..3))
        .unwrap();
    assert_eq!(done.tags(Disposition::Completed), vec![0, 1, 2]);
    assert!(net.portset_report("null0").unwrap().contains("type: null"));
}

#[test]
fn test_disabled_port_drops_input() {
    let net = net(4);
    net.create("hub0", 4, NetType::Hubbed).unwrap();
    let (a, _) = client(&net, "hub0");
    let (_b, inbox_b) = client(&net, "hub0");
    net.disable_port(a, false).unwrap();

    let done = Arc::new(Completions::default());
    net.port_input(a, &mut batch(&done, BROADCAST, CLIENT_A, [1]))
        .unwrap();
    assert!(inbox_b.tags().is_empty());
    assert_eq!(done.tags(Disposition::Completed), vec![1]);
}

#[test]
fn test_stale_port_ids_are_rejected() {
    let net = net(4);
    net.create("hub0", 4, NetType::Hubbed).unwrap();
    let a = net.connect_port("hub0").unwrap();
    net.disconnect_port(a).unwrap();
    let reused = net.connect_port("hub0").unwrap();
    assert_ne!(a, reused);

    let done = Arc::new(Completions::default());
    let err = net
        .port_input(a, &mut batch(&done, BROADCAST, CLIENT_A, [1]))
        .unwrap_err();
    assert_eq!(err.status(), ReturnStatus::InvalidHandle);
    assert_eq!(done.tags(Disposition::Released), vec![1]);

    assert_eq!(
        net.enable_port(PortId(0)).unwrap_err().status(),
        ReturnStatus::InvalidHandle
    );
}

#[test]
fn test_destroy_releases_the_slot() {
    let net = net(2);
    net.create("a", 4, NetType::Hubbed).unwrap();
    let port = net.connect_port("a").unwrap();
    net.destroy("a").unwrap();
    assert_eq!(
        net.disconnect_port(port).unwrap_err().status(),
        ReturnStatus::InvalidHandle
    );
    net.create("a", 4, NetType::Hubbed).unwrap();
    net.create("b", 4, NetType::Hubbed).unwrap();
}

#[test]
fn test_hub_uplink_to_nic_and_back() {
    let net = net(4);
    net.create("hub0", 8, NetType::Hubbed).unwrap();
    assert_eq!(
        handle_line(&net, "link hub0 vmnic4").status,
        ReturnStatus::Ok
    );
    // one uplink per hub
    assert_eq!(
        handle_line(&net, "link hub0 vmnic5").status,
        ReturnStatus::Failure
    );
    let (nic, dev) = plug_nic(&net, "vmnic4");
    let (a, inbox_a) = client(&net, "hub0");

    let done = Arc::new(Completions::default());
    net.port_input(a, &mut batch(&done, REMOTE, CLIENT_A, [1, 2]))
        .unwrap();
    assert_eq!(nic.sent(), vec![1, 2]);

    net.receive(&dev, &mut batch(&done, CLIENT_A, REMOTE, [3]))
        .unwrap();
    assert_eq!(inbox_a.tags(), vec![3]);

    assert_eq!(
        handle_line(&net, "unlink hub0 vmnic4").status,
        ReturnStatus::Ok
    );
    assert!(!dev.is_notified());
    assert!(net.uplink_report().contains("vmnic4"));
}

#[test]
fn test_discover_opens_claimed_devices() {
    let net = net(4);
    net.create("hub0", 8, NetType::Hubbed).unwrap();
    net.connect_uplink_port("hub0", "vmnic0").unwrap();
    let nic = Arc::new(FakeNic::default());
    let dev = net
        .device_connected(vmk_net::DeviceConnectArgs {
            name: "vmnic0".into(),
            kind: vmk_net::DeviceType::Leaf,
            module_id: 9,
            functions: nic,
            data: vmk_net::UplinkData {
                pkt_hdr_size: 32,
                max_sg_length: 8,
            },
        })
        .unwrap();
    assert!(!dev.is_notified());

    assert_eq!(
        handle_line(&net, "dev hub0 Discover").status,
        ReturnStatus::Ok
    );
    assert!(dev.is_notified());
    // nothing left to open
    assert_eq!(
        handle_line(&net, "dev hub0 Discover").status,
        ReturnStatus::BadParam
    );
}

#[test]
fn test_module_hooks_cycle_devices() {
    let net = net(4);
    net.create("hub0", 8, NetType::Hubbed).unwrap();
    net.connect_uplink_port("hub0", "vmnic0").unwrap();
    let (_, dev) = plug_nic(&net, "vmnic0");
    assert!(dev.is_notified());

    assert_eq!(net.pre_module_unload(3), 1);
    assert!(!dev.is_notified());
    assert_eq!(net.post_module_init(3), 0);
}

#[test]
fn test_traffic_and_admin_run_concurrently() {
    let net = net(8);
    net.create("bond0", 16, NetType::Bond).unwrap();
    net.create("vswitch0", 32, NetType::Hubbed).unwrap();
    net.connect_uplink_port("vswitch0", "bond0").unwrap();
    let (nic0, _) = plug_nic(&net, "vmnic0");
    net.bond_admin_write("bond0", "add vmnic0").unwrap();
    let (_, dev1) = plug_nic(&net, "vmnic1");
    let clients: Vec<_> = (0..4).map(|_| client(&net, "vswitch0")).collect();
    let done = Arc::new(Completions::default());

    std::thread::scope(|s| {
        for (i, (port, _)) in clients.iter().enumerate() {
            let (net, done) = (&net, &done);
            s.spawn(move || {
                for round in 0..50u64 {
                    let tag = (i as u64) * 1000 + round;
                    let _ = net.port_input(*port, &mut batch(done, REMOTE, CLIENT_A, [tag]));
                }
            });
        }
        s.spawn(|| {
            for _ in 0..20 {
                let _ = net.bond_admin_write("bond0", "add vmnic1");
                let _ = net.receive(&dev1, &mut batch(&done, BROADCAST, REMOTE, [9999]));
                let _ = net.bond_admin_write("bond0", "delete vmnic1");
            }
        });
    });

    // every packet was disposed of exactly once
    let events = done.events.lock();
    assert_eq!(events.len(), 4 * 50 + 20);
    assert!(events.iter().all(|(_, d)| *d == Disposition::Completed || *d == Disposition::Released));
    drop(events);

    // vmnic0 keeps slot 0 through every add and delete of vmnic1, so each
    // client packet leaves through it, in per-client order
    let sent = nic0.sent();
    assert_eq!(sent.len(), 4 * 50);
    for i in 0..4u64 {
        let from_client: Vec<u64> = sent.iter().copied().filter(|t| t / 1000 == i).collect();
        let expected: Vec<u64> = (0..50).map(|round| i * 1000 + round).collect();
        assert_eq!(from_client, expected);
    }
    let client_released: Vec<u64> = done
        .tags(Disposition::Released)
        .into_iter()
        .filter(|t| *t != 9999)
        .collect();
    assert!(client_released.is_empty());
    assert_eq!(
        net.bond_admin_read("bond0").unwrap(),
        "slave[0] = vmnic0, status = connected\n"
    );
}
