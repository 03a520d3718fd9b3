//! Hub policy: every batch is flooded to every other port.
//!
//! Ports other than the uplink see the batch as read-only, so chains that
//! want to consume packets work on their own clone. The uplink goes last and
//! is the only destination allowed to take packets out of the original list.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{enable_claimed_uplink, AdminCtx, NetType, PortsetPolicy};
use crate::eth::EthFilter;
use crate::iochain::{ChainCall, ChainRank};
use crate::pktlist::PacketList;
use crate::port::{Port, PortId};
use crate::portset::{PortHooks, PortTable, Upcall};
use crate::status::{NetError, NetResult};
use crate::uplink::{DeviceType, UplinkData, UplinkStatus};

pub(crate) const OUTPUT_FILTER: &str = "HubPortOutputFilter";
pub(crate) const INPUT_FILTER: &str = "HubPortInputFilter";

/// Drops frames the port's filter does not pass. Output filters look at
/// the destination address, input filters at the source.
pub(crate) struct FilterLink {
    name: &'static str,
    by_source: bool,
    filter: Mutex<EthFilter>,
}

impl FilterLink {
    pub(crate) fn output(filter: EthFilter) -> Self {
        Self {
            name: OUTPUT_FILTER,
            by_source: false,
            filter: Mutex::new(filter),
        }
    }

    pub(crate) fn input(filter: EthFilter) -> Self {
        Self {
            name: INPUT_FILTER,
            by_source: true,
            filter: Mutex::new(filter),
        }
    }
}

impl ChainCall for FilterLink {
    fn name(&self) -> &str {
        self.name
    }

    fn call(&self, _port: PortId, list: &mut PacketList) -> NetResult<()> {
        let mut filter = self.filter.lock();
        list.take_matching(|pkt| {
            let addr = if self.by_source {
                pkt.src_mac()
            } else {
                pkt.dst_mac()
            };
            !addr.is_some_and(|a| filter.run(&a))
        })
        .release_all();
        Ok(())
    }
}

/// Reinstalls a port's filter links after its frame routing policy changed.
pub(crate) fn install_filters(port: &mut Port) -> NetResult<()> {
    port.output_chain.remove_call(OUTPUT_FILTER);
    port.input_chain.remove_call(INPUT_FILTER);
    let frp = port.eth_frp.clone();
    if frp.output_filter.is_promiscuous() {
        info!(port = %port.id(), "promiscuous mode enabled");
    } else {
        port.output_chain.insert_call(
            ChainRank::Filter,
            Arc::new(FilterLink::output(frp.output_filter)),
            true,
        )?;
    }
    if !frp.input_filter.is_promiscuous() {
        port.input_chain.insert_call(
            ChainRank::Filter,
            Arc::new(FilterLink::input(frp.input_filter)),
            true,
        )?;
        debug!(port = %port.id(), "input filter installed");
    }
    Ok(())
}

/// Sends `list` to every output-active port but `src` and `uplink`, with the
/// list marked read-only for the duration.
pub(crate) fn flood(table: &mut PortTable, src: PortId, uplink: PortId, list: &mut PacketList) {
    let may_modify = list.may_modify();
    list.set_may_modify(false);
    for id in table.port_ids() {
        if id == src || id == uplink {
            continue;
        }
        if let Some(port) = table.port_mut(id).filter(|p| p.is_output_active()) {
            if let Err(e) = port.output(list) {
                debug!(port = %id, error = %e, "hub output failed");
            }
        }
    }
    list.set_may_modify(may_modify);
}

/// Single-uplink flooding hub.
pub struct Hub {
    uplink_port: PortId,
    uplink_name: Option<String>,
    connected: bool,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            uplink_port: PortId::INVALID,
            uplink_name: None,
            connected: false,
        }
    }

    pub fn uplink_port(&self) -> PortId {
        self.uplink_port
    }

    pub fn uplink_name(&self) -> Option<&str> {
        self.uplink_name.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn reset_uplink(&mut self) {
        self.uplink_port = PortId::INVALID;
        self.uplink_name = None;
        self.connected = false;
    }
}

impl PortHooks for Hub {
    fn port_eth_frp_update(&mut self, port: &mut Port) -> NetResult<()> {
        install_filters(port)
    }
}

impl PortsetPolicy for Hub {
    fn net_type(&self) -> NetType {
        NetType::Hubbed
    }

    fn dispatch(
        &mut self,
        table: &mut PortTable,
        src: PortId,
        list: &mut PacketList,
        _upcalls: &mut Vec<Upcall>,
    ) -> NetResult<()> {
        flood(table, src, self.uplink_port, list);
        if !self.connected {
            debug!(portset = table.name(), "uplink port disconnected");
            return Ok(());
        }
        if self.uplink_port != src {
            if let Some(port) = table
                .port_mut(self.uplink_port)
                .filter(|p| p.is_output_active())
            {
                if let Err(e) = port.output(list) {
                    debug!(portset = table.name(), error = %e, "uplink output failed");
                }
            }
        }
        Ok(())
    }

    fn deactivate(&mut self, table: &mut PortTable, ctx: &mut AdminCtx<'_>) {
        if let Some(name) = self.uplink_name.clone() {
            if self.uplink_port.is_valid() {
                debug!(portset = table.name(), uplink = %name, "closing uplink port");
                let _ = ctx.uplinks.unregister(table, self.uplink_port, &name);
                let _ = table.disconnect_port(self.uplink_port, self);
            }
        }
        self.reset_uplink();
    }

    fn uplink_connect(
        &mut self,
        table: &mut PortTable,
        name: &str,
        ctx: &mut AdminCtx<'_>,
    ) -> NetResult<PortId> {
        if self.uplink_port.is_valid() {
            warn!(portset = table.name(), "uplink port is already connected to a device");
            return Err(NetError::failure(format!(
                "{} already has uplink {}",
                table.name(),
                self.uplink_name.as_deref().unwrap_or_default()
            )));
        }
        let id = table.connect_port(self)?;
        match ctx
            .uplinks
            .register(table, id, name, DeviceType::PortsetToplevel)
        {
            Ok(data) => {
                enable_claimed_uplink(table, id, name, self, ctx.uplinks)?;
                self.uplink_port = id;
                self.uplink_name = Some(name.to_string());
                self.connected = true;
                table.set_uplink_impl_size(data.pkt_hdr_size);
                info!(portset = table.name(), uplink = name, "hub connected to uplink");
                Ok(id)
            }
            Err(e) if e.is_not_found() => {
                self.uplink_port = id;
                self.uplink_name = Some(name.to_string());
                self.connected = false;
                info!(portset = table.name(), uplink = name, "uplink yet to come up");
                Ok(id)
            }
            Err(e) => {
                let _ = table.disconnect_port(id, self);
                warn!(portset = table.name(), uplink = name, error = %e, "failed to claim uplink device");
                Err(NetError::failure(format!(
                    "{} cannot claim {name}: {e}",
                    table.name()
                )))
            }
        }
    }

    fn uplink_disconnect(
        &mut self,
        table: &mut PortTable,
        name: &str,
        ctx: &mut AdminCtx<'_>,
    ) -> NetResult<()> {
        if self.uplink_name.as_deref() != Some(name) {
            warn!(portset = table.name(), uplink = name, "cannot disconnect");
            return Err(NetError::failure(format!(
                "{name} is not the uplink of {}",
                table.name()
            )));
        }
        let _ = ctx.uplinks.unregister(table, self.uplink_port, name);
        let _ = table.disconnect_port(self.uplink_port, self);
        self.reset_uplink();
        info!(portset = table.name(), uplink = name, "hub uplink detached");
        Ok(())
    }

    fn uplink_notify(
        &mut self,
        table: &mut PortTable,
        port_id: PortId,
        data: UplinkData,
        status: UplinkStatus,
    ) {
        if port_id != self.uplink_port {
            return;
        }
        match status {
            UplinkStatus::Up => {
                self.connected = true;
                table.set_uplink_impl_size(data.pkt_hdr_size);
                if let Err(e) = table.enable_port(port_id, self) {
                    warn!(portset = table.name(), error = %e, "cannot enable uplink port");
                }
            }
            UplinkStatus::Down => {
                self.connected = false;
                table.set_uplink_impl_size(0);
            }
        }
    }

    fn write_report(&self, _table: &PortTable, out: &mut String) -> fmt::Result {
        writeln!(
            out,
            "uplink: {} port {} {}",
            self.uplink_name.as_deref().unwrap_or("none"),
            self.uplink_port,
            if self.connected { "connected" } else { "disconnected" }
        )
    }
}
