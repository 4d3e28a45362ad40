//! Initial sequence number generation.
//!
//! By default the generator is a plain counter advanced by the tick counter on every use, which is
//! monotonic but predictable. A generator created with a secret key additionally offsets every
//! number by a keyed hash of the connection tuple, as recommended by rfc6528. The hash function
//! is SipHash-2-4 from:
//!
//! > SipHash: a fast short-input PRF, Jean-Philippe Aumasson and Daniel J. Bernstein
use byteorder::{ByteOrder, LittleEndian, NetworkEndian};

use crate::time::Ticks;
use crate::wire::{IpAddress, TcpSeqNumber};

/// The addressing of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FourTuple {
    /// Our address.
    pub local: IpAddress,
    /// The peer address.
    pub remote: IpAddress,
    /// Our port.
    pub local_port: u16,
    /// The peer port.
    pub remote_port: u16,
}

/// An initial sequence number generator.
///
/// > ISN = M + SipHash-2-4(secretkey, localip, localport, remoteip, remoteport)
///
/// where `M` is a counter advanced by the current tick on every call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IsnGenerator {
    counter: u32,
    keys: Option<(u64, u64)>,
}

// Yes, that's the initial values, as ASCII text.
const IV: [&[u8; 8]; 4] = [
    b"somepseu",
    b"dorandom",
    b"lygenera",
    b"tedbytes"];

/// The counter value before the first use.
const INITIAL_COUNTER: u32 = 6510;

struct State {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

impl IsnGenerator {
    /// A generator without a secret.
    pub fn counter() -> Self {
        IsnGenerator {
            counter: INITIAL_COUNTER,
            keys: None,
        }
    }

    /// Create a generator by deriving a key from the standard `RandomState`.
    ///
    /// This is done by individually hashing the numbers `0u64` and `1u64` each with the same
    /// hasher created from a new instance of `RandomState`. The two output tags are then used as
    /// the internal key state.
    #[cfg(feature = "std")]
    pub fn from_std_hash() -> Self {
        use std::hash::{Hasher, BuildHasher};
        use std::collections::hash_map::RandomState;

        let hash = RandomState::new().build_hasher();
        let x0 = {
            let mut hash = hash.clone();
            hash.write_u64(0);
            hash.finish()
        };
        let x1 = {
            let mut hash = hash.clone();
            hash.write_u64(1);
            hash.finish()
        };

        IsnGenerator {
            counter: INITIAL_COUNTER,
            keys: Some((x0, x1)),
        }
    }

    /// Create a generator with some pre-defined secret key.
    ///
    /// Really, create the key with some cryptographic random means or derive them from some other
    /// key with a key derivation function.
    pub fn from_secret_key_bytes(bytes: [u8; 16]) -> Self {
        let a = LittleEndian::read_u64(&bytes[..8]);
        let b = LittleEndian::read_u64(&bytes[8..]);
        IsnGenerator {
            counter: INITIAL_COUNTER,
            keys: Some((a, b)),
        }
    }

    /// Get the next initial sequence number.
    ///
    /// The counter part advances by `now` on every call. Without a known tuple, or without a
    /// secret, the counter is all there is.
    pub fn next(&mut self, connection: Option<&FourTuple>, now: Ticks) -> TcpSeqNumber {
        self.counter = self.counter.wrapping_add(now.0);
        let offset = match (self.keys, connection) {
            (Some((k0, k1)), Some(connection)) => Self::hash(k0, k1, connection) as u32,
            _ => 0,
        };
        TcpSeqNumber(self.counter.wrapping_add(offset))
    }

    fn hash(k0: u64, k1: u64, connection: &FourTuple) -> u64 {
        let mut state = State::init(k0, k1);

        match (connection.local, connection.remote) {
            (IpAddress::Ipv4(here), IpAddress::Ipv4(there)) => {
                let m = u64::from(NetworkEndian::read_u32(&here))
                    | u64::from(NetworkEndian::read_u32(&there)) << 32;
                let p = u64::from(connection.local_port)
                    | u64::from(connection.remote_port) << 16
                    // Message length = 12
                    | 12_u64 << 56;
                state.absorb(m);
                state.absorb(p);
            },
            (IpAddress::Ipv6(here), IpAddress::Ipv6(there)) => {
                let p = u64::from(connection.local_port)
                    | u64::from(connection.remote_port) << 16
                    // Message length = 36
                    | 36_u64 << 56;
                state.absorb(NetworkEndian::read_u64(&here[..8]));
                state.absorb(NetworkEndian::read_u64(&here[8..]));
                state.absorb(NetworkEndian::read_u64(&there[..8]));
                state.absorb(NetworkEndian::read_u64(&there[8..]));
                state.absorb(p);
            },
            // Mixed tuples only arise from dual-stack listeners with mapped addresses.
            (IpAddress::Ipv4(here), IpAddress::Ipv6(there)) => {
                let m0 = u64::from(NetworkEndian::read_u32(&here))
                    | u64::from(connection.local_port) << 32
                    | u64::from(connection.remote_port) << 48;
                // Message length = 24
                let p = 24_u64 << 56;
                state.absorb(m0);
                state.absorb(NetworkEndian::read_u64(&there[..8]));
                state.absorb(NetworkEndian::read_u64(&there[8..]));
                state.absorb(p);
            },
            (IpAddress::Ipv6(here), IpAddress::Ipv4(there)) => {
                let m2 = u64::from(NetworkEndian::read_u32(&there))
                    | u64::from(connection.local_port) << 32
                    | u64::from(connection.remote_port) << 48;
                // Message length = 24
                let p = 24_u64 << 56;
                state.absorb(NetworkEndian::read_u64(&here[..8]));
                state.absorb(NetworkEndian::read_u64(&here[8..]));
                state.absorb(m2);
                state.absorb(p);
            },
        }

        state.finalize()
    }
}

impl Default for IsnGenerator {
    fn default() -> Self {
        IsnGenerator::counter()
    }
}

impl State {
    const SIP_C: usize = 2;
    const SIP_D: usize = 4;

    fn init(k0: u64, k1: u64) -> Self {
        State {
            v0: u64::from_be_bytes(*IV[0]) ^ k0,
            v1: u64::from_be_bytes(*IV[1]) ^ k1,
            v2: u64::from_be_bytes(*IV[2]) ^ k0,
            v3: u64::from_be_bytes(*IV[3]) ^ k1,
        }
    }

    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    /// Process a single 8-byte block of the message.
    ///
    /// The length block is absorbed explicitly by the callers.
    fn absorb(&mut self, m: u64) {
        self.v3 ^= m;
        (0..Self::SIP_C).for_each(|_| self.round());
        self.v0 ^= m;
    }

    fn finalize(mut self) -> u64 {
        self.v2 ^= 0xff;
        (0..Self::SIP_D).for_each(|_| self.round());
        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }
}
