//! Synchronous RPC over the asynchronous bus.
//!
//! [`RpcBridge::call`] publishes an `api_call` envelope on this vehicle's
//! call topic, suspends the caller on a one-shot channel, and resumes it
//! when the response dispatch path feeds the matching `api_return` into
//! [`RpcBridge::complete`]. Correlation is by transaction id.
//!
//! # Invariants
//!
//! - Transaction id allocation and pending-slot registration happen in one
//!   critical section, so a response can never arrive before its slot
//!   exists.
//! - A transaction id is never reused; at most one response is accepted
//!   per id; exactly one caller is resumed per completed transaction.
//! - The only cancellation path is the runtime-wide shutdown signal. There
//!   is no per-call deadline: a lost response parks the caller until
//!   shutdown.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::Bytes;
use fleetlink_bus::Bus;
use fleetlink_proto::{ApiCall, ApiCode, ApiReturn, Envelope, topics};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// RPC bridge failures.
#[derive(Debug, Error)]
pub enum RpcError {
    /// A response arrived for a transaction that is not pending: either an
    /// id that was never issued, or one already resolved (duplicate
    /// delivery). Both indicate an internal-consistency violation the
    /// runtime treats as fatal.
    #[error("response for unknown or already-resolved transaction {0}")]
    UnknownTransaction(u64),

    /// The outbound call envelope could not be encoded.
    #[error(transparent)]
    Encode(#[from] fleetlink_proto::ProtoError),

    /// The call envelope could not be handed to the bus.
    #[error("call publish failed: {0}")]
    Publish(#[from] fleetlink_bus::BusError),
}

/// Pending-transaction table. Counter and map live under one lock so
/// allocation and registration are a single atomic step.
#[derive(Debug, Default)]
struct PendingTable {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Value>>,
}

/// Per-vehicle RPC facade over the bus.
#[derive(Debug)]
pub struct RpcBridge {
    vehicle_id: String,
    call_topic: String,
    bus: Arc<dyn Bus>,
    table: Mutex<PendingTable>,
    shutdown: watch::Receiver<bool>,
}

impl RpcBridge {
    /// Create a bridge publishing calls on `apicall/{vehicle_id}`.
    ///
    /// `shutdown` is the runtime-wide stop signal; a blocked call observes
    /// it and returns `None`.
    pub fn new(vehicle_id: &str, bus: Arc<dyn Bus>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            vehicle_id: vehicle_id.to_owned(),
            call_topic: topics::api_call(vehicle_id),
            bus,
            table: Mutex::new(PendingTable::default()),
            shutdown,
        }
    }

    /// Vehicle this bridge belongs to.
    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    /// Invoke a remote simulation-control operation and wait for its
    /// result.
    ///
    /// Publishes exactly one call envelope; no retries. Returns `Ok(None)`
    /// when the runtime shut down before a response arrived.
    pub async fn call(
        &self,
        api_code: ApiCode,
        parameters: Value,
    ) -> Result<Option<Value>, RpcError> {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Ok(None);
        }

        let (transaction_id, mut rx) = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            let id = table.next_id;
            table.next_id += 1;
            let (tx, rx) = oneshot::channel();
            table.pending.insert(id, tx);
            (id, rx)
        };

        let envelope = Envelope::ApiCall(ApiCall {
            sumo_id: self.vehicle_id.clone(),
            api_code,
            transaction_id,
            parameters,
        });
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(error) => {
                self.forget(transaction_id);
                return Err(error.into());
            },
        };

        tracing::debug!(
            vehicle = %self.vehicle_id,
            %api_code,
            transaction_id,
            "publishing API call"
        );
        if let Err(error) = self.bus.publish(&self.call_topic, Bytes::from(bytes)).await {
            self.forget(transaction_id);
            return Err(error.into());
        }

        loop {
            tokio::select! {
                result = &mut rx => {
                    // A dropped sender without a value can only mean the
                    // slot was torn down during shutdown.
                    return Ok(result.ok());
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.forget(transaction_id);
                        tracing::debug!(
                            vehicle = %self.vehicle_id,
                            transaction_id,
                            "abandoning call on shutdown"
                        );
                        return Ok(None);
                    }
                },
            }
        }
    }

    /// Resolve a pending transaction with the response carried by `ret`.
    ///
    /// Responses addressed to another vehicle are ignored (shared-broker
    /// safety). A response for an unknown or already-resolved transaction
    /// is [`RpcError::UnknownTransaction`], which the caller must treat as
    /// fatal.
    pub fn complete(&self, ret: &ApiReturn) -> Result<(), RpcError> {
        if ret.sumo_id != self.vehicle_id {
            return Ok(());
        }

        let sender = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.pending.remove(&ret.transaction_id)
        };

        let Some(sender) = sender else {
            if *self.shutdown.borrow() {
                // The caller already abandoned the wait; nothing to corrupt.
                return Ok(());
            }
            return Err(RpcError::UnknownTransaction(ret.transaction_id));
        };

        // Send can only fail if the caller left during shutdown.
        let _ = sender.send(ret.response.clone());
        Ok(())
    }

    /// Number of transactions currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).pending.len()
    }

    fn forget(&self, transaction_id: u64) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.pending.remove(&transaction_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use fleetlink_bus::MemoryBus;
    use fleetlink_proto::MessageKind;
    use serde_json::json;

    use super::*;

    fn bridge_with_shutdown() -> (Arc<RpcBridge>, watch::Sender<bool>, MemoryBus) {
        let bus = MemoryBus::new();
        let (tx, rx) = watch::channel(false);
        let bridge = Arc::new(RpcBridge::new("v.0", Arc::new(bus.clone()), rx));
        (bridge, tx, bus)
    }

    /// Echo responder: answers every call on `apicall/v.0` with the
    /// transaction id embedded in the response value.
    async fn spawn_echo_responder(bus: &MemoryBus) {
        let mut sub = bus.subscribe(&topics::api_call("v.0")).await.unwrap();
        let bus = bus.clone();
        tokio::spawn(async move {
            while let Some(message) = sub.recv().await {
                let Ok(Envelope::ApiCall(call)) =
                    Envelope::decode(&message.payload, MessageKind::ApiCall)
                else {
                    continue;
                };
                let response = Envelope::ApiReturn(ApiReturn {
                    sumo_id: call.sumo_id.clone(),
                    api_code: call.api_code,
                    transaction_id: call.transaction_id,
                    response: json!({ "echo": call.transaction_id }),
                });
                let bytes = response.encode().unwrap();
                bus.publish(&topics::api_response(&call.sumo_id), Bytes::from(bytes))
                    .await
                    .unwrap();
            }
        });
    }

    /// Dispatch loop a runtime would normally run: feed responses into the
    /// bridge.
    async fn spawn_response_dispatch(bus: &MemoryBus, bridge: Arc<RpcBridge>) {
        let mut sub = bus.subscribe(&topics::api_response("v.0")).await.unwrap();
        tokio::spawn(async move {
            while let Some(message) = sub.recv().await {
                let Ok(Envelope::ApiReturn(ret)) =
                    Envelope::decode(&message.payload, MessageKind::ApiReturn)
                else {
                    continue;
                };
                bridge.complete(&ret).unwrap();
            }
        });
    }

    #[tokio::test]
    async fn concurrent_calls_are_isolated_by_transaction_id() {
        let (bridge, _shutdown, bus) = bridge_with_shutdown();
        spawn_echo_responder(&bus).await;
        spawn_response_dispatch(&bus, Arc::clone(&bridge)).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let bridge = Arc::clone(&bridge);
            handles.push(tokio::spawn(async move {
                bridge.call(ApiCode::ReadState, Value::Null).await.unwrap()
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            let echoed = result["echo"].as_u64().unwrap();
            // Every caller got a distinct transaction's result
            assert!(seen.insert(echoed));
        }
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_blocked_caller() {
        let (bridge, shutdown, _bus) = bridge_with_shutdown();

        let caller = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.call(ApiCode::ReadState, Value::Null).await })
        };

        // Give the call time to publish and park
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_millis(200), caller)
            .await
            .expect("caller must be released promptly")
            .unwrap()
            .unwrap();
        assert!(result.is_none());
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn call_after_shutdown_returns_none_without_publishing() {
        let (bridge, shutdown, bus) = bridge_with_shutdown();
        let mut sub = bus.subscribe(&topics::api_call("v.0")).await.unwrap();

        shutdown.send(true).unwrap();
        let result = bridge.call(ApiCode::ReadState, Value::Null).await.unwrap();
        assert!(result.is_none());

        // Nothing went out on the call topic
        drop(bus);
        let quiet = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn unknown_transaction_is_a_protocol_violation() {
        let (bridge, _shutdown, _bus) = bridge_with_shutdown();

        let stray = ApiReturn {
            sumo_id: "v.0".into(),
            api_code: ApiCode::ReadState,
            transaction_id: 999,
            response: Value::Null,
        };
        assert!(matches!(
            bridge.complete(&stray),
            Err(RpcError::UnknownTransaction(999))
        ));
    }

    #[tokio::test]
    async fn duplicate_response_is_a_protocol_violation() {
        let (bridge, _shutdown, _bus) = bridge_with_shutdown();

        let caller = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.call(ApiCode::ReadState, Value::Null).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ret = ApiReturn {
            sumo_id: "v.0".into(),
            api_code: ApiCode::ReadState,
            transaction_id: 0,
            response: json!("true"),
        };
        bridge.complete(&ret).unwrap();
        assert_eq!(caller.await.unwrap().unwrap(), Some(json!("true")));

        // Same transaction a second time: the slot is gone
        assert!(matches!(
            bridge.complete(&ret),
            Err(RpcError::UnknownTransaction(0))
        ));
    }

    #[tokio::test]
    async fn responses_for_other_vehicles_are_ignored() {
        let (bridge, _shutdown, _bus) = bridge_with_shutdown();

        let foreign = ApiReturn {
            sumo_id: "v.9".into(),
            api_code: ApiCode::ReadState,
            transaction_id: 42,
            response: Value::Null,
        };
        bridge.complete(&foreign).unwrap();
    }

    #[tokio::test]
    async fn transaction_ids_are_monotonic_and_never_reused() {
        let (bridge, _shutdown, bus) = bridge_with_shutdown();
        spawn_echo_responder(&bus).await;
        spawn_response_dispatch(&bus, Arc::clone(&bridge)).await;

        for expected in 0..5u64 {
            let result = bridge.call(ApiCode::ReadState, Value::Null).await.unwrap().unwrap();
            assert_eq!(result["echo"].as_u64().unwrap(), expected);
        }
    }
}
