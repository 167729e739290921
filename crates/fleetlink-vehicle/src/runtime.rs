//! Async shell of the vehicle application.
//!
//! [`VehicleRuntime::spawn`] starts the background tasks of one vehicle:
//!
//! - a response dispatch task draining `apiresponse/{id}` into the
//!   [`RpcBridge`];
//! - a peer-data task consuming beacons (from `directcomm/{id}` in test
//!   mode, from the datagram link otherwise) sequentially, so per-neighbor
//!   link state updates stay ordered;
//! - a beaconing loop publishing this vehicle's kinematic state downstream;
//! - for followers, one silence monitor task per tracked neighbor link;
//! - for the leader, a policy tick task driving the speed profile.
//!
//! The response and peer-data paths must be separate tasks: a policy
//! reacting to peer data issues blocking RPC calls whose responses arrive
//! on the other subscription.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use fleetlink_bus::{Bus, Datagram, Subscription, UdpLink};
use fleetlink_proto::{ApiCode, Envelope, MessageKind, VehicleData, topics};
use serde_json::Value;
use std::net::SocketAddr;
use tokio::{sync::mpsc, sync::watch, task::JoinHandle};

use crate::{
    ControllerPolicy, DEFAULT_SILENCE_THRESHOLD, FollowerPolicy, FormationConfig, LeaderPolicy,
    LinkMonitor, PacketLog, PolicyAction, Role, RpcBridge, VehicleError, controller_for_mode,
};

/// Tick period of the leader's policy clock.
const POLICY_TICK: Duration = Duration::from_millis(500);

/// Configuration of one vehicle runtime.
#[derive(Debug, Clone)]
pub struct VehicleConfig {
    /// This vehicle's simulator identifier.
    pub sumo_id: String,
    /// Execution node leased to it.
    pub colosseum_id: u32,
    /// Platoon formation parameters.
    pub formation: FormationConfig,
    /// Relay peer beacons over the bus instead of the datagram link.
    pub test_mode: bool,
    /// Datagram peers, used when `test_mode` is false.
    pub peers: Vec<SocketAddr>,
    /// Local datagram bind address, used when `test_mode` is false.
    pub datagram_bind: Option<SocketAddr>,
    /// Directory for the per-vehicle append log; `None` disables logging.
    pub log_dir: Option<PathBuf>,
    /// Silence threshold for the link monitor.
    pub silence_threshold: Duration,
}

impl VehicleConfig {
    /// Test-mode configuration: beacons relay over the bus, no datagram
    /// link, no append log.
    pub fn test_mode(sumo_id: &str, colosseum_id: u32, formation: FormationConfig) -> Self {
        Self {
            sumo_id: sumo_id.to_owned(),
            colosseum_id,
            formation,
            test_mode: true,
            peers: Vec::new(),
            datagram_bind: None,
            log_dir: None,
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
        }
    }
}

/// Shared state of a running vehicle.
struct Shared {
    sumo_id: String,
    role: Role,
    config: VehicleConfig,
    bus: Arc<dyn Bus>,
    bridge: RpcBridge,
    policy: Mutex<Box<dyn ControllerPolicy>>,
    /// Present for followers only; leaders have no cooperative dependency
    /// and never degrade.
    monitor: Option<Mutex<LinkMonitor>>,
    log: Option<PacketLog>,
    datagram: Option<UdpLink>,
    shutdown: watch::Sender<bool>,
}

/// The vehicle application runtime.
pub struct VehicleRuntime;

impl VehicleRuntime {
    /// Start the runtime for one vehicle. Must be called inside a tokio
    /// runtime.
    pub async fn spawn(
        config: VehicleConfig,
        bus: Arc<dyn Bus>,
    ) -> Result<VehicleHandle, VehicleError> {
        let role = config.formation.role_of(&config.sumo_id)?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let bridge = RpcBridge::new(&config.sumo_id, Arc::clone(&bus), shutdown_rx.clone());

        let policy: Box<dyn ControllerPolicy> = if role.is_leader {
            Box::new(LeaderPolicy::new(&config.formation))
        } else {
            Box::new(FollowerPolicy::new(&role))
        };

        let monitor = (!role.is_leader).then(|| {
            Mutex::new(LinkMonitor::new(
                role.tracked_neighbors(),
                config.silence_threshold,
                Instant::now(),
            ))
        });

        let log = match &config.log_dir {
            Some(dir) => Some(PacketLog::create(dir, &config.sumo_id)?),
            None => None,
        };

        let response_sub = bus.subscribe(&topics::api_response(&config.sumo_id)).await?;
        let direct_sub = if config.test_mode {
            Some(bus.subscribe(&topics::direct_comm(&config.sumo_id)).await?)
        } else {
            None
        };
        let (datagram, datagram_rx) = match (config.test_mode, config.datagram_bind) {
            (false, Some(bind)) => {
                let (link, rx) = UdpLink::bind(bind).await?;
                (Some(link), Some(rx))
            },
            _ => (None, None),
        };

        let shared = Arc::new(Shared {
            sumo_id: config.sumo_id.clone(),
            role,
            config,
            bus,
            bridge,
            policy: Mutex::new(policy),
            monitor,
            log,
            datagram,
            shutdown,
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(response_task(
            Arc::clone(&shared),
            response_sub,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(peer_task(
            Arc::clone(&shared),
            direct_sub,
            datagram_rx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(beacon_task(Arc::clone(&shared), shutdown_rx.clone())));

        if shared.role.is_leader {
            tasks.push(tokio::spawn(leader_tick_task(Arc::clone(&shared), shutdown_rx.clone())));
        } else {
            for neighbor in shared.role.tracked_neighbors() {
                tasks.push(tokio::spawn(silence_task(
                    Arc::clone(&shared),
                    neighbor,
                    shutdown_rx.clone(),
                )));
            }
        }

        Ok(VehicleHandle { shared, tasks })
    }
}

/// Handle to a running vehicle runtime.
pub struct VehicleHandle {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl VehicleHandle {
    /// Vehicle this handle controls.
    pub fn sumo_id(&self) -> &str {
        &self.shared.sumo_id
    }

    /// Node the vehicle is bound to.
    pub fn colosseum_id(&self) -> u32 {
        self.shared.config.colosseum_id
    }

    /// Local address of the datagram link, when one is bound.
    pub fn datagram_addr(&self) -> Option<SocketAddr> {
        self.shared.datagram.as_ref().and_then(|link| link.local_addr().ok())
    }

    /// Signal the runtime to stop without waiting for the tasks.
    pub fn signal_stop(&self) {
        let _ = self.shared.shutdown.send(true);
    }

    /// Stop the runtime and wait for every background task to exit.
    pub async fn stop(self) {
        self.signal_stop();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Execute policy actions as remote API calls, in order.
async fn execute_actions(shared: &Shared, actions: Vec<PolicyAction>) {
    for action in actions {
        match shared.bridge.call(action.api_code, action.parameters).await {
            Ok(_) => {},
            Err(error) => {
                tracing::warn!(vehicle = %shared.sumo_id, %error, "API call failed");
            },
        }
    }
}

/// Drain `apiresponse/{id}` into the RPC bridge.
///
/// An unknown or duplicate transaction id is an internal-consistency
/// violation: the runtime is stopped immediately rather than risking a
/// misdelivered result.
async fn response_task(
    shared: Arc<Shared>,
    mut sub: Subscription,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            },
            message = sub.recv() => {
                let Some(message) = message else { break };
                match Envelope::decode(&message.payload, MessageKind::ApiReturn) {
                    Ok(Envelope::ApiReturn(ret)) => {
                        if let Err(error) = shared.bridge.complete(&ret) {
                            tracing::error!(
                                vehicle = %shared.sumo_id,
                                %error,
                                "fatal response dispatch failure, stopping runtime"
                            );
                            let _ = shared.shutdown.send(true);
                            break;
                        }
                    },
                    Ok(_) => {},
                    Err(error) => {
                        tracing::debug!(
                            vehicle = %shared.sumo_id,
                            %error,
                            "discarding malformed response"
                        );
                    },
                }
            },
        }
    }
}

/// Consume peer beacons sequentially from the bus and/or datagram link.
async fn peer_task(
    shared: Arc<Shared>,
    mut direct_sub: Option<Subscription>,
    mut datagram_rx: Option<mpsc::Receiver<Datagram>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            },
            message = recv_direct(&mut direct_sub) => {
                let Some(message) = message else { break };
                if let Some(data) = decode_beacon(&shared, &message.payload) {
                    handle_beacon(&shared, data).await;
                }
            },
            datagram = recv_datagram(&mut datagram_rx) => {
                let Some(datagram) = datagram else { break };
                if let Some(data) = decode_beacon(&shared, &datagram.payload) {
                    // Datagrams reach every peer; only the addressee acts
                    if data.recipient.as_deref() == Some(shared.sumo_id.as_str()) {
                        handle_beacon(&shared, data).await;
                    }
                }
            },
        }
    }
}

async fn recv_direct(sub: &mut Option<Subscription>) -> Option<fleetlink_bus::BusMessage> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_datagram(rx: &mut Option<mpsc::Receiver<Datagram>>) -> Option<Datagram> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn decode_beacon(shared: &Shared, payload: &[u8]) -> Option<VehicleData> {
    match Envelope::decode(payload, MessageKind::VehicleData) {
        Ok(Envelope::VehicleData(data)) => Some(data),
        Ok(_) => None,
        Err(error) => {
            tracing::debug!(vehicle = %shared.sumo_id, %error, "discarding malformed beacon");
            None
        },
    }
}

async fn handle_beacon(shared: &Shared, data: VehicleData) {
    if let Some(log) = &shared.log {
        let payload = serde_json::to_string(&data).unwrap_or_default();
        if let Err(error) = log.log_packet(&data.sender, &payload) {
            tracing::warn!(vehicle = %shared.sumo_id, %error, "packet log write failed");
        }
    }

    // Link accounting first, so a recovery takes effect before the policy
    // pushes this sample into the controller
    if let (Some(monitor), Some(seqn)) = (&shared.monitor, data.seqn) {
        let transition = {
            let mut monitor = monitor.lock().unwrap_or_else(PoisonError::into_inner);
            monitor.record_beacon(&data.sender, seqn, Instant::now())
        };
        if let Some(mode) = transition {
            tracing::info!(vehicle = %shared.sumo_id, ?mode, "peer links recovered");
            execute_actions(shared, vec![controller_for_mode(mode)]).await;
        }
    }

    let actions = {
        let mut policy = shared.policy.lock().unwrap_or_else(PoisonError::into_inner);
        policy.on_peer_data(&data.sender, &data)
    };
    execute_actions(shared, actions).await;
}

/// Periodically read own kinematic state and beacon it downstream.
async fn beacon_task(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.formation.beacon_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut seqn: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            },
            _ = ticker.tick() => {
                if send_beacon(&shared, &mut seqn).await.is_none() {
                    // Shutdown observed inside the blocking call
                    break;
                }
            },
        }
    }
}

/// One beacon cycle. Returns `None` when the runtime is shutting down.
async fn send_beacon(shared: &Shared, seqn: &mut u64) -> Option<()> {
    let state = match shared
        .bridge
        .call(ApiCode::ReadState, Value::String(shared.sumo_id.clone()))
        .await
    {
        Ok(Some(value)) => value,
        Ok(None) => return None,
        Err(error) => {
            tracing::warn!(vehicle = %shared.sumo_id, %error, "state read failed");
            return Some(());
        },
    };

    let mut data = match serde_json::from_value::<Envelope>(state) {
        Ok(Envelope::VehicleData(data)) => data,
        Ok(envelope) => {
            tracing::warn!(
                vehicle = %shared.sumo_id,
                kind = %envelope.kind(),
                "unexpected state read response kind"
            );
            return Some(());
        },
        Err(error) => {
            tracing::warn!(vehicle = %shared.sumo_id, %error, "malformed state read response");
            return Some(());
        },
    };

    if let Some(log) = &shared.log {
        if let Err(error) = log.log_position(data.x, data.y) {
            tracing::warn!(vehicle = %shared.sumo_id, %error, "position log write failed");
        }
    }

    // The tail has no downstream receiver; it only records its position
    if shared.role.is_last {
        return Some(());
    }

    data.sender = shared.sumo_id.clone();
    data.ts = Some(wall_clock());
    data.seqn = Some(*seqn);
    *seqn += 1;

    let targets: Vec<String> = if shared.role.is_leader {
        shared.config.formation.formation.iter().skip(1).cloned().collect()
    } else {
        shared.role.following.iter().cloned().collect()
    };

    for target in targets {
        data.recipient = Some(target.clone());
        let envelope = Envelope::VehicleData(data.clone());
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(vehicle = %shared.sumo_id, %error, "beacon encode failed");
                continue;
            },
        };
        transmit(shared, &target, bytes).await;
    }
    Some(())
}

/// Send one beacon copy to `target`: over the bus in test mode, over the
/// datagram link otherwise (every peer receives it; recipient filtering
/// happens at the receiver).
async fn transmit(shared: &Shared, target: &str, bytes: Vec<u8>) {
    if shared.config.test_mode {
        let topic = topics::direct_comm(target);
        if let Err(error) = shared.bus.publish(&topic, Bytes::from(bytes)).await {
            tracing::warn!(vehicle = %shared.sumo_id, %target, %error, "beacon publish failed");
        }
    } else if let Some(link) = &shared.datagram {
        if let Err(error) = link.broadcast(&shared.config.peers, &bytes).await {
            tracing::warn!(vehicle = %shared.sumo_id, %error, "beacon datagram failed");
        }
    }
}

/// Watch one tracked neighbor link for silence.
async fn silence_task(
    shared: Arc<Shared>,
    neighbor: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(shared.config.formation.beacon_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            },
            _ = ticker.tick() => {
                let Some(monitor) = &shared.monitor else { break };
                let transition = {
                    let mut monitor = monitor.lock().unwrap_or_else(PoisonError::into_inner);
                    monitor.check_silence(&neighbor, Instant::now())
                };
                if let Some(mode) = transition {
                    tracing::warn!(
                        vehicle = %shared.sumo_id,
                        %neighbor,
                        ?mode,
                        "peer link silent, degrading control strategy"
                    );
                    execute_actions(&shared, vec![controller_for_mode(mode)]).await;
                }
            },
        }
    }
}

/// Drive the leader's policy clock.
async fn leader_tick_task(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(POLICY_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            },
            _ = ticker.tick() => {
                let actions = {
                    let mut policy = shared.policy.lock().unwrap_or_else(PoisonError::into_inner);
                    policy.on_tick(Instant::now())
                };
                execute_actions(&shared, actions).await;
            },
        }
    }
}

fn wall_clock() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0.0, |d| d.as_secs_f64())
}
