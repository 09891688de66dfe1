/// Transport session identifiers.
///
/// A GSI is a 6-byte globally unique source identifier; a TSI is the GSI
/// concatenated with the 16-bit source port. Equality and hashing are
/// bitwise, so a TSI can key the peer table directly.

use std::fmt;

use rand::Rng;

/// Global Source Identifier.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Gsi([u8; 6]);

impl Gsi {
    pub const fn from_bytes(bytes: [u8; 6]) -> Self {
        Gsi(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Draw a random GSI; used when the host supplies none at create time.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        let mut b = [0u8; 6];
        rng.fill(&mut b);
        Gsi(b)
    }
}

impl fmt::Display for Gsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Dotted-decimal, the conventional PGM rendering.
        write!(
            f,
            "{}.{}.{}.{}.{}.{}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for Gsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Transport Session Identifier: GSI plus source port.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Tsi {
    pub gsi: Gsi,
    pub sport: u16,
}

impl Tsi {
    pub const fn new(gsi: Gsi, sport: u16) -> Self {
        Tsi { gsi, sport }
    }
}

impl fmt::Display for Tsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.gsi, self.sport)
    }
}

impl fmt::Debug for Tsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
