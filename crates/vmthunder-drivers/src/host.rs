//! Host address discovery

use std::net::{Ipv4Addr, SocketAddrV4};

use tracing::debug;
use vmthunder_common::config::HostConfig;

use crate::error::{DriverError, DriverResult};

/// Address this host advertises to the tracker and its children.
///
/// An explicitly configured address wins; otherwise the IPv4 address of
/// the configured interface is used.
pub fn advertised_address(config: &HostConfig) -> DriverResult<String> {
    if let Some(address) = config.address.as_ref().filter(|a| !a.is_empty()) {
        return Ok(address.clone());
    }
    interface_ipv4(&config.interface).map(|ip| ip.to_string())
}

/// IPv4 address of interface `name`
#[cfg(unix)]
pub fn interface_ipv4(name: &str) -> DriverResult<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)?;
    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            let ip = *SocketAddrV4::from(*sin).ip();
            debug!(interface = %name, %ip, "resolved interface address");
            return Ok(ip);
        }
    }
    Err(DriverError::InterfaceNotFound(name.to_string()))
}

#[cfg(not(unix))]
pub fn interface_ipv4(name: &str) -> DriverResult<Ipv4Addr> {
    Err(DriverError::InterfaceNotFound(name.to_string()))
}
