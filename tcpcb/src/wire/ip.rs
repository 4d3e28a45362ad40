use core::fmt;

/// Internet protocol version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    /// Version 4.
    Ipv4,
    /// Version 6.
    Ipv6,
}

/// An internet protocol address of either version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Address {
    /// An IPv4 address in network byte order.
    Ipv4([u8; 4]),
    /// An IPv6 address in network byte order.
    Ipv6([u8; 16]),
}

/// A network prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Cidr {
    address: Address,
    prefix_len: u8,
}

impl Version {
    /// The maximum prefix length of addresses of this version.
    pub fn address_bits(self) -> u8 {
        match self {
            Version::Ipv4 => 32,
            Version::Ipv6 => 128,
        }
    }
}

impl Address {
    /// The unspecified IPv4 address `0.0.0.0`.
    pub const UNSPECIFIED_V4: Address = Address::Ipv4([0; 4]);

    /// The unspecified IPv6 address `::`.
    pub const UNSPECIFIED_V6: Address = Address::Ipv6([0; 16]);

    /// Construct an IPv4 address from its four octets.
    pub const fn v4(a: u8, b: u8, c: u8, d: u8) -> Self {
        Address::Ipv4([a, b, c, d])
    }

    /// The unspecified (any) address of a version.
    pub fn any(version: Version) -> Self {
        match version {
            Version::Ipv4 => Address::UNSPECIFIED_V4,
            Version::Ipv6 => Address::UNSPECIFIED_V6,
        }
    }

    /// The version of this address.
    pub fn version(&self) -> Version {
        match self {
            Address::Ipv4(_) => Version::Ipv4,
            Address::Ipv6(_) => Version::Ipv6,
        }
    }

    /// Query whether the address is the unspecified address of its version.
    pub fn is_unspecified(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }

    /// The octets of the address in network byte order.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Address::Ipv4(bytes) => &bytes[..],
            Address::Ipv6(bytes) => &bytes[..],
        }
    }
}

impl Default for Address {
    fn default() -> Self {
        Address::UNSPECIFIED_V4
    }
}

impl Default for Version {
    fn default() -> Self {
        Version::Ipv4
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::Ipv4([a, b, c, d]) => write!(f, "{}.{}.{}.{}", a, b, c, d),
            Address::Ipv6(bytes) => {
                for (idx, pair) in bytes.chunks(2).enumerate() {
                    if idx > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{:x}", u16::from(pair[0]) << 8 | u16::from(pair[1]))?;
                }
                Ok(())
            },
        }
    }
}

impl Cidr {
    /// Create a prefix from an address and the number of leading bits that are significant.
    ///
    /// # Panics
    /// This function panics if the prefix length is larger than the address.
    pub fn new(address: Address, prefix_len: u8) -> Self {
        assert!(prefix_len <= address.version().address_bits());
        Cidr { address, prefix_len }
    }

    /// The address the prefix was created with.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The number of significant leading bits.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Query whether an address lies within the prefix.
    ///
    /// Addresses of the other version are never contained.
    pub fn contains(&self, address: Address) -> bool {
        if address.version() != self.address.version() {
            return false;
        }

        let full = usize::from(self.prefix_len / 8);
        let rest = self.prefix_len % 8;
        let (ours, theirs) = (self.address.as_bytes(), address.as_bytes());

        if ours[..full] != theirs[..full] {
            return false;
        }

        if rest == 0 {
            return true;
        }

        let mask = !(0xffu8 >> rest);
        ours[full] & mask == theirs[full] & mask
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}
