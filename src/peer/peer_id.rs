use std::fmt;

use rand::Rng as _;

use crate::constants::CLIENT_PREFIX;

/// A 20-byte peer identifier: client prefix plus random suffix.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        let prefix = CLIENT_PREFIX.as_bytes();
        id[..prefix.len()].copy_from_slice(prefix);
        rand::rng().fill(&mut id[prefix.len()..]);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The client tag between the prefix dashes, if Azureus-style.
    pub fn client_tag(&self) -> Option<&str> {
        if self.0[0] == b'-' && self.0[7] == b'-' {
            std::str::from_utf8(&self.0[1..7]).ok()
        } else {
            None
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tag) = self.client_tag() {
            write!(f, "PeerId({tag})")
        } else {
            write!(f, "PeerId({:02x?})", &self.0[..8])
        }
    }
}
