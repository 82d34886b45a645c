// ── rtnetlink session ──

use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::AddressFamily;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{LinkAttribute, LinkLayerType};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteProtocol, RouteScope,
};
use rtnetlink::{Handle, IpVersion};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{InterfaceSubnet, Netlink, ROUTE_METRIC, RouteSubnet, SystemSubnets};
use crate::error::CoreError;

struct Session {
    handle: Handle,
    task: JoinHandle<()>,
}

impl Session {
    fn open() -> Result<Self, CoreError> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| CoreError::network("open netlink session", e))?;
        Ok(Self {
            handle,
            task: tokio::spawn(connection),
        })
    }
}

/// Long-lived rtnetlink connection shared by all tunnel operations.
///
/// Must be created inside a Tokio runtime.
pub struct RtNetlink {
    session: Mutex<Session>,
}

impl RtNetlink {
    pub fn new() -> Result<Self, CoreError> {
        Ok(Self {
            session: Mutex::new(Session::open()?),
        })
    }

    fn handle(&self) -> Handle {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle
            .clone()
    }

    async fn link_names(&self) -> Result<Vec<(u32, String, bool)>, CoreError> {
        let mut links = self.handle().link().get().execute();
        let mut out = Vec::new();
        while let Some(msg) = links
            .try_next()
            .await
            .map_err(|e| CoreError::network("list links", e))?
        {
            let name = msg.attributes.iter().find_map(|a| match a {
                LinkAttribute::IfName(n) => Some(n.clone()),
                _ => None,
            });
            if let Some(name) = name {
                let loopback = msg.header.link_layer_type == LinkLayerType::Loopback;
                out.push((msg.header.index, name, loopback));
            }
        }
        Ok(out)
    }
}

impl Drop for RtNetlink {
    fn drop(&mut self) {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .task
            .abort();
    }
}

fn errno(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(msg) => Some(-msg.raw_code()),
        _ => None,
    }
}

fn route_message(index: u32, dst: IpNet) -> RouteMessage {
    let mut message = RouteMessage::default();
    message.header.destination_prefix_length = dst.prefix_len();
    message.header.table = RouteHeader::RT_TABLE_MAIN;
    match dst.network() {
        IpAddr::V4(v4) => {
            message.header.address_family = AddressFamily::Inet;
            message
                .attributes
                .push(RouteAttribute::Destination(RouteAddress::Inet(v4)));
        }
        IpAddr::V6(v6) => {
            message.header.address_family = AddressFamily::Inet6;
            message
                .attributes
                .push(RouteAttribute::Destination(RouteAddress::Inet6(v6)));
        }
    }
    message.attributes.push(RouteAttribute::Oif(index));
    message.attributes.push(RouteAttribute::Priority(ROUTE_METRIC));
    message
}

fn route_address(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}

#[async_trait]
impl Netlink for RtNetlink {
    async fn link_index(&self, name: &str) -> Result<Option<u32>, CoreError> {
        let mut links = self
            .handle()
            .link()
            .get()
            .match_name(name.to_owned())
            .execute();
        match links.try_next().await {
            Ok(link) => Ok(link.map(|l| l.header.index)),
            Err(e) if errno(&e) == Some(libc::ENODEV) => Ok(None),
            Err(e) => Err(CoreError::network(format!("look up {name}"), e)),
        }
    }

    async fn create_wireguard(&self, name: &str) -> Result<u32, CoreError> {
        self.handle()
            .link()
            .add()
            .wireguard(name.to_owned())
            .execute()
            .await
            .map_err(|e| CoreError::network(format!("create interface {name}"), e))?;
        self.link_index(name).await?.ok_or_else(|| {
            CoreError::network(
                format!("create interface {name}"),
                "interface created but not found",
            )
        })
    }

    async fn delete_link(&self, index: u32) -> Result<(), CoreError> {
        self.handle()
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| CoreError::network(format!("delete link {index}"), e))
    }

    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<(), CoreError> {
        self.handle()
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(|e| CoreError::network("set MTU", e))
    }

    async fn set_up(&self, index: u32) -> Result<(), CoreError> {
        self.handle()
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| CoreError::network("set interface up", e))
    }

    async fn add_address(&self, index: u32, addr: IpNet) -> Result<(), CoreError> {
        self.handle()
            .address()
            .add(index, addr.addr(), addr.prefix_len())
            .execute()
            .await
            .map_err(|e| CoreError::network(format!("add address {addr}"), e))
    }

    async fn delete_address(&self, index: u32, addr: IpNet) -> Result<(), CoreError> {
        let handle = self.handle();
        let mut found = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .set_address_filter(addr.addr())
            .set_prefix_length_filter(addr.prefix_len())
            .execute();
        let Some(msg) = found
            .try_next()
            .await
            .map_err(|e| CoreError::network(format!("look up address {addr}"), e))?
        else {
            return Ok(());
        };
        handle
            .address()
            .del(msg)
            .execute()
            .await
            .map_err(|e| CoreError::network(format!("delete address {addr}"), e))
    }

    async fn add_route(&self, index: u32, dst: IpNet) -> Result<(), CoreError> {
        let handle = self.handle();
        let result = match dst.trunc() {
            IpNet::V4(net) => {
                let mut req = handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(net.addr(), net.prefix_len())
                    .output_interface(index)
                    .protocol(RouteProtocol::Static)
                    .scope(RouteScope::Link);
                req.message_mut()
                    .attributes
                    .push(RouteAttribute::Priority(ROUTE_METRIC));
                req.execute().await
            }
            IpNet::V6(net) => {
                let mut req = handle
                    .route()
                    .add()
                    .v6()
                    .destination_prefix(net.addr(), net.prefix_len())
                    .output_interface(index)
                    .protocol(RouteProtocol::Static)
                    .scope(RouteScope::Link);
                req.message_mut()
                    .attributes
                    .push(RouteAttribute::Priority(ROUTE_METRIC));
                req.execute().await
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if errno(&e) == Some(libc::EEXIST) => {
                debug!(cidr = %dst, "route already exists");
                Ok(())
            }
            Err(e) => Err(CoreError::network(format!("add route {dst}"), e)),
        }
    }

    async fn delete_route(&self, index: u32, dst: IpNet) -> Result<(), CoreError> {
        match self
            .handle()
            .route()
            .del(route_message(index, dst))
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if matches!(errno(&e), Some(libc::ESRCH | libc::ENOENT)) => Ok(()),
            Err(e) => Err(CoreError::network(format!("delete route {dst}"), e)),
        }
    }

    async fn reconnect(&self) -> Result<(), CoreError> {
        let fresh = Session::open()?;
        let old = std::mem::replace(
            &mut *self.session.lock().unwrap_or_else(PoisonError::into_inner),
            fresh,
        );
        old.task.abort();
        debug!("netlink session reconnected");
        Ok(())
    }

    async fn system_subnets(&self, exclude: &[&str]) -> Result<SystemSubnets, CoreError> {
        let links = self.link_names().await?;
        let name_of = |index: u32| {
            links
                .iter()
                .find(|(i, _, _)| *i == index)
                .map_or_else(|| format!("if{index}"), |(_, n, _)| n.clone())
        };
        let skipped = |index: u32| {
            links
                .iter()
                .find(|(i, _, _)| *i == index)
                .is_some_and(|(_, n, lo)| *lo || exclude.contains(&n.as_str()))
        };

        let handle = self.handle();
        let mut subnets = SystemSubnets::default();

        let mut addrs = handle.address().get().execute();
        while let Some(msg) = addrs
            .try_next()
            .await
            .map_err(|e| CoreError::network("list addresses", e))?
        {
            if skipped(msg.header.index) {
                continue;
            }
            let local = msg.attributes.iter().find_map(|a| match a {
                AddressAttribute::Local(ip) => Some(*ip),
                _ => None,
            });
            let addr = local.or_else(|| {
                msg.attributes.iter().find_map(|a| match a {
                    AddressAttribute::Address(ip) => Some(*ip),
                    _ => None,
                })
            });
            if let Some(ip) = addr
                && let Ok(net) = IpNet::new(ip, msg.header.prefix_len)
            {
                subnets.interfaces.push(InterfaceSubnet {
                    interface: name_of(msg.header.index),
                    cidr: net.trunc(),
                });
            }
        }

        for version in [IpVersion::V4, IpVersion::V6] {
            let mut routes = handle.route().get(version).execute();
            while let Some(route) = routes
                .try_next()
                .await
                .map_err(|e| CoreError::network("list routes", e))?
            {
                if route.header.table != RouteHeader::RT_TABLE_MAIN {
                    continue;
                }
                let mut dst = None;
                let mut oif = 0;
                let mut gateway = None;
                for attr in &route.attributes {
                    match attr {
                        RouteAttribute::Destination(a) => dst = route_address(a),
                        RouteAttribute::Oif(i) => oif = *i,
                        RouteAttribute::Gateway(a) => gateway = route_address(a),
                        _ => {}
                    }
                }
                let Some(dst) = dst else { continue };
                let interface = if oif == 0 { String::new() } else { name_of(oif) };
                if exclude.contains(&interface.as_str()) {
                    continue;
                }
                let Ok(cidr) = IpNet::new(dst, route.header.destination_prefix_length) else {
                    continue;
                };
                subnets.routes.push(RouteSubnet {
                    interface,
                    cidr,
                    gateway: gateway.map(|g| g.to_string()),
                    protocol: format!("{:?}", route.header.protocol).to_lowercase(),
                });
            }
        }

        Ok(subnets)
    }
}
