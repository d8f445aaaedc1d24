//! IPv6 addressing types shared across the engine.

use std::fmt::{self, Display};

/// An IPv6 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ipv6Address([u8; 16]);

impl Ipv6Address {
    /// The unspecified address `::`.
    pub const UNSPECIFIED: Self = Self([0u8; 16]);

    /// The loopback address `::1`.
    pub const LOOPBACK: Self = Self([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

    /// Creates a new address from its sixteen octets.
    pub const fn new(address: [u8; 16]) -> Self {
        Self(address)
    }

    /// Gets the address as a `[u8; 16]`.
    pub fn to_bytes(self) -> [u8; 16] {
        self.0
    }

    /// Whether this is the unspecified address `::`.
    pub fn is_unspecified(self) -> bool {
        self == Self::UNSPECIFIED
    }

    /// The address as eight big-endian hextets.
    pub fn hextets(self) -> [u16; 8] {
        let mut out = [0u16; 8];
        for (i, pair) in self.0.chunks_exact(2).enumerate() {
            out[i] = u16::from_be_bytes([pair[0], pair[1]]);
        }
        out
    }
}

impl Display for Ipv6Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hextets = self.hextets();
        for (i, hextet) in hextets.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:x}", hextet)?;
        }
        Ok(())
    }
}

impl From<[u8; 16]> for Ipv6Address {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl From<Ipv6Address> for [u8; 16] {
    fn from(address: Ipv6Address) -> Self {
        address.0
    }
}

impl From<u128> for Ipv6Address {
    fn from(n: u128) -> Self {
        Self(n.to_be_bytes())
    }
}

impl From<Ipv6Address> for u128 {
    fn from(address: Ipv6Address) -> Self {
        u128::from_be_bytes(address.0)
    }
}

/// An IPv6 address paired with a TCP port: one end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SocketAddr {
    pub address: Ipv6Address,
    pub port: u16,
}

impl SocketAddr {
    pub const fn new(address: Ipv6Address, port: u16) -> Self {
        Self { address, port }
    }
}

impl Display for SocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]:{}", self.address, self.port)
    }
}

/// The pair of socket addresses that identifies a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Endpoints {
    /// The local end
    pub local: SocketAddr,
    /// The remote end
    pub remote: SocketAddr,
}

impl Endpoints {
    pub const fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self { local, remote }
    }

    /// The identifier the remote TCP would use for this connection.
    pub const fn reverse(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

impl Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}
