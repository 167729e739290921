//! Batched fleet updates.
//!
//! The coordinator accumulates the envelopes produced by one simulation
//! step (time, spawns, despawns, position updates) and publishes them to
//! the fleet manager as a single JSON array on the `sumo/update` topic.

use serde::{Deserialize, Serialize};

use crate::{Envelope, Result};

/// An ordered batch of envelopes published as one `sumo/update` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateBatch(Vec<Envelope>);

impl UpdateBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an envelope to the batch.
    pub fn push(&mut self, envelope: Envelope) {
        self.0.push(envelope);
    }

    /// Whether the batch contains no envelopes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of envelopes in the batch.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Envelopes in insertion order.
    pub fn envelopes(&self) -> &[Envelope] {
        &self.0
    }

    /// Encode the batch to its JSON wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a batch from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl IntoIterator for UpdateBatch {
    type Item = Envelope;
    type IntoIter = std::vec::IntoIter<Envelope>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{DeleteVehicle, TimeSync};

    #[test]
    fn batch_round_trip_preserves_order() {
        let mut batch = UpdateBatch::new();
        batch.push(Envelope::Time(TimeSync { time: 1.0 }));
        batch.push(Envelope::DeleteVehicle(DeleteVehicle {
            sumo_id: "v.0".into(),
            colosseum_id: 3,
        }));

        let bytes = batch.encode().unwrap();
        let parsed = UpdateBatch::decode(&bytes).unwrap();

        assert_eq!(parsed, batch);
        assert_eq!(parsed.len(), 2);
        assert!(matches!(parsed.envelopes()[0], Envelope::Time(_)));
    }

    #[test]
    fn wire_shape_is_json_array() {
        let mut batch = UpdateBatch::new();
        batch.push(Envelope::StartSimulation {});

        let raw: serde_json::Value = serde_json::from_slice(&batch.encode().unwrap()).unwrap();
        assert!(raw.is_array());
        assert_eq!(raw[0]["type"], "start_simulation");
    }
}
