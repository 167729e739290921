//! Coordinator step loop.
//!
//! Owns the simulator, the node lease registry and the set of managed
//! vehicles. Each cycle serves queued API calls until the step deadline,
//! advances the simulation, reconciles vehicle arrivals and departures
//! against the lease pool, and publishes the resulting update batch on
//! `sumo/update`.
//!
//! In test mode the coordinator also hosts the vehicle runtimes
//! in-process, so a complete platoon run needs nothing but the in-memory
//! bus.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use fleetlink_bus::{Bus, BusMessage, Subscription};
use fleetlink_proto::{
    ApiCall, DeleteVehicle, Envelope, MessageKind, NewVehicle, PositionUpdate, TimeSync,
    UpdateBatch, topics,
};
use fleetlink_vehicle::{FormationConfig, VehicleConfig, VehicleHandle, VehicleRuntime};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    ApiInterpreter, CoordinatorError, NodeLeaseRegistry, SimulationApi, StepSnapshot,
};

/// Queue depth between the per-vehicle call forwarders and the step loop.
const CALL_QUEUE: usize = 256;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Size of the execution node pool.
    pub node_count: usize,
    /// Simulation step length; also the real-time pacing of the loop.
    pub step_length: Duration,
    /// Host vehicle runtimes in-process and relay beacons over the bus.
    pub test_mode: bool,
    /// Application announced in `new_vehicle` envelopes; `None` in test
    /// mode.
    pub application: Option<String>,
    /// Application parameters forwarded verbatim in `new_vehicle`
    /// envelopes.
    pub parameters: Option<Value>,
    /// Block until a `start_simulation` signal arrives on
    /// `colosseum/update` before stepping.
    pub wait_for_start: bool,
    /// Stop once simulation time reaches this bound; `None` runs until a
    /// `stop_simulation` signal.
    pub run_until: Option<f64>,
}

struct ManagedVehicle {
    colosseum_id: u32,
    forwarder: JoinHandle<()>,
    runtime: Option<VehicleHandle>,
}

/// The simulation-side coordinator.
pub struct Coordinator<S: SimulationApi> {
    sim: S,
    config: CoordinatorConfig,
    bus: Arc<dyn Bus>,
    registry: NodeLeaseRegistry,
    managed: HashMap<String, ManagedVehicle>,
}

impl<S: SimulationApi> Coordinator<S> {
    /// Create a coordinator over `sim` with a fresh lease pool.
    pub fn new(sim: S, config: CoordinatorConfig, bus: Arc<dyn Bus>) -> Self {
        let registry = NodeLeaseRegistry::new(config.node_count);
        Self { sim, config, bus, registry, managed: HashMap::new() }
    }

    /// Node lease registry, for inspection.
    pub fn registry(&self) -> &NodeLeaseRegistry {
        &self.registry
    }

    /// Run the step loop until a stop signal or the configured time bound.
    pub async fn run(mut self) -> Result<(), CoordinatorError> {
        let mut control = self.bus.subscribe(topics::COLOSSEUM_UPDATE).await?;
        let (call_tx, mut call_rx) = mpsc::channel::<ApiCall>(CALL_QUEUE);

        if self.config.wait_for_start && !self.await_start(&mut control).await {
            return Ok(());
        }
        tracing::info!(
            nodes = self.config.node_count,
            step_length_ms = self.config.step_length.as_millis(),
            test_mode = self.config.test_mode,
            "coordinator started"
        );

        let mut stopping = false;
        while !stopping {
            let deadline = tokio::time::Instant::now() + self.config.step_length;
            loop {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => break,
                    call = call_rx.recv() => {
                        if let Some(call) = call {
                            self.serve_call(&call).await;
                        }
                    },
                    message = control.recv() => {
                        match message {
                            None => {
                                stopping = true;
                                break;
                            },
                            Some(message) if is_stop(&message) => {
                                stopping = true;
                                break;
                            },
                            Some(_) => {},
                        }
                    },
                }
            }
            if stopping {
                break;
            }

            let snapshot = self.sim.step()?;
            self.publish_step(&snapshot, &call_tx).await?;

            if let Some(limit) = self.config.run_until {
                if snapshot.time >= limit {
                    tracing::info!(time = snapshot.time, "simulation time bound reached");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Wait for the start signal. Returns `false` when the run was
    /// cancelled before it began.
    async fn await_start(&self, control: &mut Subscription) -> bool {
        tracing::info!("waiting for start signal");
        loop {
            let Some(message) = control.recv().await else {
                return false;
            };
            match Envelope::decode_any(&message.payload) {
                Ok(Envelope::StartSimulation {}) => return true,
                Ok(Envelope::StopSimulation {}) => return false,
                Ok(_) => {},
                Err(error) => {
                    tracing::debug!(%error, "discarding malformed control message");
                },
            }
        }
    }

    /// Serve one API call; a dropped call produces no response.
    async fn serve_call(&mut self, call: &ApiCall) {
        let Some(ret) = ApiInterpreter::serve(&mut self.sim, call) else {
            return;
        };
        let topic = topics::api_response(&ret.sumo_id);
        let encoded = match Envelope::ApiReturn(ret).encode() {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(%error, "response encode failed");
                return;
            },
        };
        if let Err(error) = self.bus.publish(&topic, Bytes::from(encoded)).await {
            tracing::warn!(%topic, %error, "response publish failed");
        }
    }

    /// Reconcile the step snapshot against the managed set and publish the
    /// update batch: time, departures, arrivals, positions, in that order.
    async fn publish_step(
        &mut self,
        snapshot: &StepSnapshot,
        call_tx: &mpsc::Sender<ApiCall>,
    ) -> Result<(), CoordinatorError> {
        let present: HashSet<&str> =
            snapshot.vehicles.iter().map(|vehicle| vehicle.sumo_id.as_str()).collect();
        let departed: Vec<String> = self
            .managed
            .keys()
            .filter(|sumo_id| !present.contains(sumo_id.as_str()))
            .cloned()
            .collect();

        let mut batch = UpdateBatch::new();
        batch.push(Envelope::Time(TimeSync { time: snapshot.time }));

        for sumo_id in departed {
            if let Some(delete) = self.evict(&sumo_id).await {
                batch.push(Envelope::DeleteVehicle(delete));
            }
        }

        for vehicle in &snapshot.vehicles {
            if self.managed.contains_key(&vehicle.sumo_id) {
                continue;
            }
            if let Some(new) = self.admit(&vehicle.sumo_id, call_tx).await {
                batch.push(Envelope::NewVehicle(new));
            }
        }

        for vehicle in &snapshot.vehicles {
            if let Some(managed) = self.managed.get(&vehicle.sumo_id) {
                batch.push(Envelope::PositionUpdate(PositionUpdate {
                    colosseum_id: managed.colosseum_id,
                    x: vehicle.x,
                    y: vehicle.y,
                    crs: None,
                }));
            }
        }

        self.bus.publish(topics::SUMO_UPDATE, Bytes::from(batch.encode()?)).await?;
        Ok(())
    }

    /// Lease a node to an arriving vehicle and start managing it.
    ///
    /// A vehicle that arrives while the pool is exhausted stays unmanaged;
    /// it keeps driving in the simulation but gets no node. A vehicle
    /// whose plumbing fails to start gets its lease back immediately and
    /// is likewise left unmanaged; the run continues.
    async fn admit(
        &mut self,
        sumo_id: &str,
        call_tx: &mpsc::Sender<ApiCall>,
    ) -> Option<NewVehicle> {
        let Some(colosseum_id) = self.registry.assign(sumo_id) else {
            tracing::warn!(vehicle = %sumo_id, "node pool exhausted, vehicle left unmanaged");
            return None;
        };

        let managed = match self.start_managed(sumo_id, colosseum_id, call_tx).await {
            Ok(managed) => managed,
            Err(error) => {
                self.registry.release(sumo_id);
                tracing::warn!(
                    vehicle = %sumo_id,
                    %error,
                    "vehicle could not be managed, lease released"
                );
                return None;
            },
        };

        tracing::info!(vehicle = %sumo_id, node = colosseum_id, "vehicle admitted");
        self.managed.insert(sumo_id.to_owned(), managed);
        Some(NewVehicle {
            sumo_id: sumo_id.to_owned(),
            colosseum_id,
            application: self.config.application.clone(),
            parameters: self.config.parameters.clone(),
        })
    }

    /// Start the per-vehicle plumbing: the call forwarder and, in test
    /// mode, the in-process runtime. On failure nothing is left running.
    async fn start_managed(
        &self,
        sumo_id: &str,
        colosseum_id: u32,
        call_tx: &mpsc::Sender<ApiCall>,
    ) -> Result<ManagedVehicle, CoordinatorError> {
        let sub = self.bus.subscribe(&topics::api_call(sumo_id)).await?;
        let forwarder = tokio::spawn(forward_calls(sub, call_tx.clone()));

        let runtime = if self.config.test_mode {
            let parameters = self.config.parameters.clone().unwrap_or(Value::Null);
            let spawned = FormationConfig::from_parameters(&parameters)
                .map(|formation| VehicleConfig::test_mode(sumo_id, colosseum_id, formation));
            let config = match spawned {
                Ok(config) => config,
                Err(error) => {
                    forwarder.abort();
                    return Err(error.into());
                },
            };
            match VehicleRuntime::spawn(config, Arc::clone(&self.bus)).await {
                Ok(handle) => Some(handle),
                Err(error) => {
                    forwarder.abort();
                    return Err(error.into());
                },
            }
        } else {
            None
        };

        Ok(ManagedVehicle { colosseum_id, forwarder, runtime })
    }

    /// Release a departed vehicle's node and tear down its plumbing.
    async fn evict(&mut self, sumo_id: &str) -> Option<DeleteVehicle> {
        let managed = self.managed.remove(sumo_id)?;
        managed.forwarder.abort();
        if let Some(runtime) = managed.runtime {
            runtime.stop().await;
        }
        self.registry.release(sumo_id);
        tracing::info!(vehicle = %sumo_id, node = managed.colosseum_id, "vehicle evicted");
        Some(DeleteVehicle { sumo_id: sumo_id.to_owned(), colosseum_id: managed.colosseum_id })
    }

    async fn shutdown(&mut self) {
        let vehicles: Vec<String> = self.managed.keys().cloned().collect();
        for sumo_id in vehicles {
            self.evict(&sumo_id).await;
        }
        tracing::info!("coordinator stopped");
    }
}

/// Forward decoded API calls from one vehicle's call topic into the step
/// loop's queue.
///
/// The caller named in the envelope must match the vehicle the topic
/// belongs to; a call claiming another vehicle's identity is misrouted and
/// dropped.
async fn forward_calls(mut sub: Subscription, call_tx: mpsc::Sender<ApiCall>) {
    while let Some(message) = sub.recv().await {
        match Envelope::decode(&message.payload, MessageKind::ApiCall) {
            Ok(Envelope::ApiCall(call)) => {
                if topics::api_call_vehicle(&message.topic) != Some(call.sumo_id.as_str()) {
                    tracing::debug!(
                        topic = %message.topic,
                        vehicle = %call.sumo_id,
                        "discarding misrouted API call"
                    );
                    continue;
                }
                if call_tx.send(call).await.is_err() {
                    break;
                }
            },
            Ok(_) => {},
            Err(error) => {
                tracing::debug!(%error, "discarding malformed API call");
            },
        }
    }
}

fn is_stop(message: &BusMessage) -> bool {
    matches!(Envelope::decode_any(&message.payload), Ok(Envelope::StopSimulation {}))
}
