//! Stream identifiers

use crate::packet::ProtoError;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;
use std::str::FromStr;

/// Width of a stream id on the wire (without the terminator)
pub const STREAM_ID_LEN: usize = 6;

/// Identifier of one multiplexed local TCP connection.
///
/// Always exactly [`STREAM_ID_LEN`] ASCII alphanumeric characters. The peer
/// receiving a packet reads a fixed-width id field, so the width cannot vary.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId([u8; STREAM_ID_LEN]);

impl StreamId {
    /// Generate a random id over the 62-symbol alphabet `0-9A-Za-z`
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; STREAM_ID_LEN];
        for byte in bytes.iter_mut() {
            *byte = rng.sample(Alphanumeric);
        }
        Self(bytes)
    }

    /// Generate a random id, regenerating while `is_taken` reports a collision
    pub fn generate_unique(mut is_taken: impl FnMut(&StreamId) -> bool) -> Self {
        loop {
            let id = Self::random();
            if !is_taken(&id) {
                return id;
            }
        }
    }

    /// Build an id from raw wire bytes
    pub fn from_bytes(bytes: [u8; STREAM_ID_LEN]) -> Result<Self, ProtoError> {
        if bytes.iter().all(u8::is_ascii_alphanumeric) {
            Ok(Self(bytes))
        } else {
            Err(ProtoError::InvalidStreamId(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        }
    }

    pub fn as_bytes(&self) -> &[u8; STREAM_ID_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Construction only admits ASCII alphanumerics.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.as_str())
    }
}

impl FromStr for StreamId {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; STREAM_ID_LEN] = s
            .as_bytes()
            .try_into()
            .map_err(|_| ProtoError::InvalidStreamId(s.to_string()))?;
        Self::from_bytes(bytes)
    }
}

impl TryFrom<&str> for StreamId {
    type Error = ProtoError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}
