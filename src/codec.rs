use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{AggregatorError, Result};
use crate::session::PeerStatus;

/// One peer's contribution to a [`CombinedFrame`]: its decoded payload and
/// current connectivity status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerEntry {
    pub d: rmpv::Value,
    pub s: u8,
}

impl PeerEntry {
    pub fn new(decoded: rmpv::Value, status: PeerStatus) -> Self {
        Self {
            d: decoded,
            s: status.as_u8(),
        }
    }
}

/// The time-aligned map emitted once per aggregator tick: a wall-clock
/// timestamp plus one entry per roster slot, keyed by `short_name`.
///
/// Serialized and deserialized by hand rather than via `#[serde(flatten)]`:
/// flatten makes the derive emit `serialize_map(None)` (length unknown ahead
/// of time), which `rmp_serde` cannot encode since msgpack maps carry their
/// length up front. Building the map explicitly lets us pass the real length
/// (`1 + peers.len()`) to `serialize_map`.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedFrame {
    pub t: f64,
    pub peers: BTreeMap<String, PeerEntry>,
}

impl Serialize for CombinedFrame {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1 + self.peers.len()))?;
        map.serialize_entry("t", &self.t)?;
        for (short_name, entry) in &self.peers {
            map.serialize_entry(short_name, entry)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for CombinedFrame {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct CombinedFrameVisitor;

        impl<'de> serde::de::Visitor<'de> for CombinedFrameVisitor {
            type Value = CombinedFrame;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a map with a \"t\" timestamp and one entry per peer")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut t: Option<f64> = None;
                let mut peers = BTreeMap::new();
                while let Some(key) = map.next_key::<String>()? {
                    if key == "t" {
                        t = Some(map.next_value()?);
                    } else {
                        peers.insert(key, map.next_value()?);
                    }
                }
                let t = t.ok_or_else(|| serde::de::Error::missing_field("t"))?;
                Ok(CombinedFrame { t, peers })
            }
        }

        deserializer.deserialize_map(CombinedFrameVisitor)
    }
}

/// Decode a single peer's raw notification payload (msgpack) into a generic
/// value. The schema of individual sensor payloads is opaque to the
/// aggregator; it only needs to round-trip them.
pub fn decode_payload(peer: &str, raw: &[u8]) -> Result<rmpv::Value> {
    rmpv::decode::read_value(&mut &raw[..]).map_err(|e| AggregatorError::Decode {
        peer: peer.to_string(),
        reason: e.to_string(),
    })
}

/// Encode a combined frame as msgpack.
pub fn encode_frame(frame: &CombinedFrame) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(frame).map_err(|e| AggregatorError::Publish {
        reason: format!("msgpack encode failed: {e}"),
    })
}

/// Decode msgpack bytes back into a combined frame. Used by tests and by any
/// future consumer-side tooling that needs to verify round-trip fidelity.
pub fn decode_frame(raw: &[u8]) -> Result<CombinedFrame> {
    rmp_serde::from_slice(raw).map_err(|e| AggregatorError::Decode {
        peer: "<combined frame>".to_string(),
        reason: e.to_string(),
    })
}

/// Compress msgpack bytes using the LZ4 *frame* format, the streaming,
/// self-describing encoding any standard `lz4.frame`-compatible reader can
/// decompress (unlike the bare LZ4 block format with a size prefix).
pub fn compress(data: &[u8]) -> Vec<u8> {
    use std::io::Write;

    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
    encoder
        .write_all(data)
        .expect("writing into an in-memory buffer cannot fail");
    encoder
        .finish()
        .expect("finishing an in-memory frame encoder cannot fail")
}

/// Decompress bytes produced by [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    use std::io::Read;

    let mut decoder = lz4_flex::frame::FrameDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| AggregatorError::Decode {
            peer: "<combined frame>".to_string(),
            reason: format!("lz4 frame decompress failed: {e}"),
        })?;
    Ok(out)
}
