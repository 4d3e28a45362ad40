//! CIDR based route selection, relevant rfc1519, rfc4632.
//!
use crate::layer::{Error, Result};
use crate::managed::Slice;
use crate::wire::{IpAddress, IpCidr, IpVersion};

/// Size of the fixed IPv4 header.
const IPV4_HEADER_LEN: u16 = 20;

/// Size of the fixed IPv6 header.
const IPV6_HEADER_LEN: u16 = 40;

/// Size of a tcp header without options.
const TCP_HEADER_LEN: u16 = 20;

/// Identifies an outgoing interface of the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct InterfaceId(pub u8);

/// The answer of a route lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Path {
    /// The local address to use as source.
    pub local: IpAddress,

    /// The interface to send from.
    pub interface: InterfaceId,
}

/// A prefix of addresses reachable through an interface.
#[derive(Debug, Clone, Copy)]
pub struct Route {
    /// The network targetted by the route.
    pub net: IpCidr,

    /// Our own address on that network.
    pub source: IpAddress,

    /// The interface connected to the network.
    pub interface: InterfaceId,

    /// Maximum transmission unit of the link, `0` when unknown.
    pub mtu: u16,
}

impl Route {
    /// A route without specified target.
    ///
    /// May be used as a placeholder for storage. It matches only the unspecified address itself.
    pub fn unspecified() -> Self {
        Route {
            net: IpCidr::new(IpAddress::UNSPECIFIED_V4, 32),
            source: IpAddress::UNSPECIFIED_V4,
            interface: InterfaceId::default(),
            mtu: 0,
        }
    }

    /// Returns a route matching all addresses of the source's version.
    ///
    /// This route is a worst match for all addresses so that it can be used as a sink, for
    /// example.
    pub fn default_via(source: IpAddress, interface: InterfaceId, mtu: u16) -> Self {
        Route {
            net: IpCidr::new(IpAddress::any(source.version()), 0),
            source,
            interface,
            mtu,
        }
    }
}

/// A routing table.
///
/// # Examples
///
/// On systems with heap, this table can be created with:
///
/// ```rust
/// use tcpcb::layer::ip::{Route, Routes};
///
/// let routes_storage = vec![Route::unspecified(); 10];
/// let mut routes = Routes::new(routes_storage);
/// ```
///
/// On systems without heap, use:
///
/// ```rust
/// use tcpcb::layer::ip::{Route, Routes};
///
/// let mut routes_storage = [Route::unspecified(); 10];
/// let mut routes = Routes::new(&mut routes_storage[..]);
/// ```
#[derive(Debug)]
pub struct Routes<'a> {
    storage: Slice<'a, Route>,
    len: usize,
}

impl<'a> Routes<'a> {
    /// Creates an empty routing table.
    ///
    /// The storage is not touched but no element within it is used for route searching.
    pub fn new<T>(storage: T) -> Self
        where T: Into<Slice<'a, Route>>
    {
        Routes { storage: storage.into(), len: 0 }
    }

    /// Append a route to the table.
    pub fn add_route(&mut self, route: Route) -> Result<()> {
        match self.storage.get_mut(self.len) {
            Some(place) => {
                *place = route;
                self.len += 1;
                Ok(())
            },
            None => Err(Error::Exhausted),
        }
    }

    /// The routes in use.
    pub fn routes(&self) -> &[Route] {
        &self.storage[..self.len]
    }

    /// Find the most specific route towards an address.
    pub fn lookup(&self, addr: IpAddress) -> Option<&Route> {
        // The rules say to find the subnet with longest prefix.
        let mut best_match: Option<&Route> = None;
        for route in self.routes() {
            if !route.net.contains(addr) {
                continue;
            }

            let best = best_match.get_or_insert(route);
            if best.net.prefix_len() < route.net.prefix_len() {
                *best = route;
            }
        }
        best_match
    }

    /// Choose the local address and interface for reaching `remote`.
    pub fn path(&self, remote: IpAddress) -> Option<Path> {
        self.lookup(remote).map(|route| Path {
            local: route.source,
            interface: route.interface,
        })
    }

    /// Bound a maximum segment size by the MTU on the path to `remote`.
    ///
    /// Unknown routes and routes without a known MTU leave the segment size as is.
    pub fn effective_mss(&self, mss: u16, remote: IpAddress) -> u16 {
        let mtu = match self.lookup(remote) {
            Some(route) if route.mtu > 0 => route.mtu,
            _ => return mss,
        };

        let header = match remote.version() {
            IpVersion::Ipv4 => IPV4_HEADER_LEN,
            IpVersion::Ipv6 => IPV6_HEADER_LEN,
        } + TCP_HEADER_LEN;

        mss.min(mtu.saturating_sub(header))
    }
}
