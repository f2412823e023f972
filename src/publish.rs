use tracing::error;

use crate::backend::PeripheralBackend;
use crate::codec::{compress, encode_frame, CombinedFrame};
use crate::error::Result;

/// Encode, compress, and push one combined frame to the peripheral.
///
/// Oversize frames are logged, not dropped: the consumer decides whether to
/// accept a notification past its expected MTU.
pub async fn publish(
    backend: &dyn PeripheralBackend,
    frame: &CombinedFrame,
    mtu_ceiling: usize,
) -> Result<()> {
    let bytes = encode_frame(frame)?;
    let compressed = compress(&bytes);

    if compressed.len() >= mtu_ceiling {
        error!(
            size = compressed.len(),
            mtu_ceiling, "combined frame exceeds MTU ceiling, publishing anyway"
        );
    }

    backend.update(compressed).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AggregatorError;
    use crate::session::PeerStatus;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct RecordingPeripheral {
        last_update: Mutex<Option<Vec<u8>>>,
        reject: bool,
    }

    #[async_trait]
    impl PeripheralBackend for RecordingPeripheral {
        async fn register_service(&self, _service_uuid: Uuid, _characteristic_uuid: Uuid) -> Result<()> {
            Ok(())
        }
        async fn update(&self, value: Vec<u8>) -> Result<()> {
            if self.reject {
                return Err(AggregatorError::Publish {
                    reason: "backend rejected update".into(),
                });
            }
            *self.last_update.lock().unwrap() = Some(value);
            Ok(())
        }
        async fn register_advertisement(&self, _name: String, _service_uuids: Vec<Uuid>, _appearance: u16) -> Result<()> {
            Ok(())
        }
        async fn restart_adapter(&self) -> Result<()> {
            Ok(())
        }
    }

    fn sample_frame() -> CombinedFrame {
        let mut peers = std::collections::BTreeMap::new();
        peers.insert(
            "LA".to_string(),
            crate::codec::PeerEntry::new(rmpv::Value::from(1), PeerStatus::Connected),
        );
        CombinedFrame { t: 100.0, peers }
    }

    #[tokio::test]
    async fn publishes_compressed_bytes_to_the_backend() {
        let backend = RecordingPeripheral {
            last_update: Mutex::new(None),
            reject: false,
        };
        publish(&backend, &sample_frame(), 512).await.unwrap();
        assert!(backend.last_update.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn oversize_frame_is_still_published() {
        let backend = RecordingPeripheral {
            last_update: Mutex::new(None),
            reject: false,
        };
        // A ceiling of 1 byte is guaranteed to be exceeded by any real frame.
        publish(&backend, &sample_frame(), 1).await.unwrap();
        assert!(backend.last_update.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn backend_rejection_surfaces_as_publish_error() {
        let backend = RecordingPeripheral {
            last_update: Mutex::new(None),
            reject: true,
        };
        let err = publish(&backend, &sample_frame(), 512).await.unwrap_err();
        assert!(matches!(err, AggregatorError::Publish { .. }));
    }
}
