//! UDP socket creation and platform socket plumbing.

use crate::config::SocketConfig;
use crate::error::{MuxError, Result};
use log::debug;
use mio::net::UdpSocket;
use std::io;
use std::net::{IpAddr, SocketAddr};

/// bind a non-blocking UDP socket per the supplied configuration,
/// walking the configured port range until a bind succeeds.
pub(crate) fn bind_udp(config: &SocketConfig) -> Result<UdpSocket> {
    let (begin, end) = config.port_range;
    if begin == 0 {
        return bind_port(config.bind_addr, 0);
    }

    let mut last = io::Error::new(io::ErrorKind::AddrInUse, "no free port in range");
    for port in begin..=end {
        match bind_port(config.bind_addr, port) {
            Ok(socket) => return Ok(socket),
            Err(MuxError::Socket(e)) => last = e,
            Err(e) => return Err(e),
        }
    }
    Err(MuxError::Socket(last))
}

fn bind_port(addr: IpAddr, port: u16) -> Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(SocketAddr::new(addr, port)).map_err(MuxError::Socket)?;
    socket.set_nonblocking(true).map_err(MuxError::Socket)?;
    if let Ok(bound) = socket.local_addr() {
        debug!("bound UDP socket to {}", bound);
    }
    Ok(UdpSocket::from_std(socket))
}

/// apply a differentiated-services marking to the socket.
#[cfg(unix)]
pub(crate) fn set_diffserv(socket: &UdpSocket, ds: u32) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let (level, option) = match socket.local_addr()? {
        SocketAddr::V4(_) => (libc::IPPROTO_IP, libc::IP_TOS),
        SocketAddr::V6(_) => (libc::IPPROTO_IPV6, libc::IPV6_TCLASS),
    };
    let value = ds as libc::c_int;
    // safety: the fd is owned by `socket` and the value outlives the call
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn set_diffserv(_socket: &UdpSocket, _ds: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "diffserv marking not supported on this platform",
    ))
}

/// unmap v4-mapped IPv6 source addresses reported by dual-stack sockets.
pub(crate) fn normalize(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        v4 => v4,
    }
}

/// enumerate the local addresses the socket is reachable on.
///
/// a wildcard bind expands to one record per interface address of the
/// matching family; the bound port is carried over.
pub(crate) fn local_addrs(socket: &UdpSocket) -> Result<Vec<SocketAddr>> {
    let bound = socket.local_addr().map_err(MuxError::Socket)?;
    if !bound.ip().is_unspecified() {
        return Ok(vec![bound]);
    }
    Ok(interface_addrs(bound.port(), bound.is_ipv6()))
}

#[cfg(unix)]
fn interface_addrs(port: u16, want_v6: bool) -> Vec<SocketAddr> {
    let mut out: Vec<SocketAddr> = Vec::new();
    let mut loopback: Vec<SocketAddr> = Vec::new();

    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    // safety: getifaddrs allocates the list, released with freeifaddrs below
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return fallback_loopback(port, want_v6);
    }

    let mut cursor = ifap;
    while !cursor.is_null() {
        // safety: nodes are valid until freeifaddrs
        let ifa = unsafe { &*cursor };
        cursor = ifa.ifa_next;

        if ifa.ifa_addr.is_null() {
            continue;
        }
        // safety: ifa_addr points at a sockaddr of the family it declares
        let Some(ip) = (unsafe { sockaddr_to_ip(ifa.ifa_addr) }) else {
            continue;
        };
        if ip.is_ipv6() != want_v6 {
            continue;
        }
        // link-local v6 addresses need scope ids and are not usable records
        if let IpAddr::V6(v6) = ip {
            if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                continue;
            }
        }
        let record = SocketAddr::new(ip, port);
        if ip.is_loopback() {
            loopback.push(record);
        } else {
            out.push(record);
        }
    }
    // safety: ifap came from getifaddrs
    unsafe { libc::freeifaddrs(ifap) };

    if out.is_empty() {
        out = loopback;
    }
    if out.is_empty() {
        out = fallback_loopback(port, want_v6);
    }
    out
}

#[cfg(not(unix))]
fn interface_addrs(port: u16, want_v6: bool) -> Vec<SocketAddr> {
    fallback_loopback(port, want_v6)
}

fn fallback_loopback(port: u16, want_v6: bool) -> Vec<SocketAddr> {
    let ip = if want_v6 {
        IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)
    } else {
        IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
    };
    vec![SocketAddr::new(ip, port)]
}

/// convert a raw sockaddr to an IpAddr.
#[cfg(unix)]
unsafe fn sockaddr_to_ip(addr: *const libc::sockaddr) -> Option<IpAddr> {
    match (*addr).sa_family as libc::c_int {
        libc::AF_INET => {
            let addr4 = &*(addr as *const libc::sockaddr_in);
            Some(IpAddr::V4(std::net::Ipv4Addr::from(u32::from_be(
                addr4.sin_addr.s_addr,
            ))))
        }
        libc::AF_INET6 => {
            let addr6 = &*(addr as *const libc::sockaddr_in6);
            Some(IpAddr::V6(std::net::Ipv6Addr::from(addr6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}
