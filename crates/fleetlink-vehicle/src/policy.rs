//! Control policies.
//!
//! A [`ControllerPolicy`] turns peer data and clock ticks into remote API
//! invocations. Policies are selected at construction from the vehicle's
//! position in the platoon formation: the leader drives the speed profile
//! and consumes no peer data; followers forward leader and preceding
//! vehicle data into their longitudinal controller.

use std::time::{Duration, Instant};

use fleetlink_proto::{ApiCode, VehicleData};
use serde_json::{Value, json};

use crate::{ControllerMode, VehicleError};

/// How long the leader holds each target speed before toggling.
const SPEED_TOGGLE_PERIOD: Duration = Duration::from_secs(10);

/// One remote API invocation requested by a policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyAction {
    /// Operation to invoke.
    pub api_code: ApiCode,
    /// Operation parameters.
    pub parameters: Value,
}

/// Capability interface between the runtime and the control strategy.
pub trait ControllerPolicy: Send {
    /// React to a peer beacon from `source`.
    fn on_peer_data(&mut self, source: &str, data: &VehicleData) -> Vec<PolicyAction>;

    /// React to a periodic clock tick.
    fn on_tick(&mut self, now: Instant) -> Vec<PolicyAction>;
}

/// Platoon formation parameters, parsed from the application parameter
/// object forwarded at spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct FormationConfig {
    /// Platoon members in driving order, head first.
    pub formation: Vec<String>,
    /// Interval between beacons.
    pub beacon_interval: Duration,
    /// Lower bound of the leader's speed profile, m/s.
    pub min_speed: f64,
    /// Upper bound of the leader's speed profile, m/s.
    pub max_speed: f64,
}

impl FormationConfig {
    /// Parse the parameter object:
    /// `{platoon_formation, beacon_interval, min_speed, max_speed}`.
    pub fn from_parameters(parameters: &Value) -> Result<Self, VehicleError> {
        let field = |name: &str| {
            parameters
                .get(name)
                .ok_or_else(|| VehicleError::BadParameters(format!("missing field {name}")))
        };

        let formation = field("platoon_formation")?
            .as_array()
            .ok_or_else(|| VehicleError::BadParameters("platoon_formation is not a list".into()))?
            .iter()
            .map(|v| {
                v.as_str().map(str::to_owned).ok_or_else(|| {
                    VehicleError::BadParameters("platoon_formation entry is not a string".into())
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if formation.is_empty() {
            return Err(VehicleError::BadParameters("platoon_formation is empty".into()));
        }

        let number = |name: &str| {
            field(name)?
                .as_f64()
                .ok_or_else(|| VehicleError::BadParameters(format!("{name} is not a number")))
        };

        Ok(Self {
            formation,
            beacon_interval: Duration::from_secs_f64(number("beacon_interval")?),
            min_speed: number("min_speed")?,
            max_speed: number("max_speed")?,
        })
    }

    /// Resolve the role of `vehicle_id` within the formation.
    pub fn role_of(&self, vehicle_id: &str) -> Result<Role, VehicleError> {
        let position = self
            .formation
            .iter()
            .position(|id| id == vehicle_id)
            .ok_or_else(|| VehicleError::NotInFormation(vehicle_id.to_owned()))?;

        let is_leader = position == 0;
        let is_last = position == self.formation.len() - 1;
        Ok(Role {
            position,
            is_leader,
            is_last,
            leader: (!is_leader).then(|| self.formation[0].clone()),
            preceding: (!is_leader).then(|| self.formation[position - 1].clone()),
            following: (!is_last).then(|| self.formation[position + 1].clone()),
        })
    }
}

/// One vehicle's place in the platoon and its neighbor links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    /// Index in the formation, head = 0.
    pub position: usize,
    /// Heads the platoon; has no cooperative dependency.
    pub is_leader: bool,
    /// Tail of the platoon; has no downstream receiver.
    pub is_last: bool,
    /// Platoon head, absent for the leader itself.
    pub leader: Option<String>,
    /// Vehicle directly ahead, absent for the leader.
    pub preceding: Option<String>,
    /// Vehicle directly behind, absent for the tail.
    pub following: Option<String>,
}

impl Role {
    /// Neighbor links this vehicle tracks for communication loss:
    /// the leader and the preceding vehicle (one link when they coincide).
    pub fn tracked_neighbors(&self) -> Vec<String> {
        let mut neighbors = Vec::new();
        if let Some(leader) = &self.leader {
            neighbors.push(leader.clone());
        }
        if let Some(preceding) = &self.preceding {
            if !neighbors.contains(preceding) {
                neighbors.push(preceding.clone());
            }
        }
        neighbors
    }
}

/// Controller selection for a mode switch.
pub fn controller_for_mode(mode: ControllerMode) -> PolicyAction {
    let controller = match mode {
        ControllerMode::Cooperative => "cacc",
        ControllerMode::Degraded => "acc",
    };
    PolicyAction {
        api_code: ApiCode::ActiveController,
        parameters: json!({ "controller": controller }),
    }
}

/// Leader strategy: oscillate the desired speed between the configured
/// bounds, ignore peer data.
#[derive(Debug)]
pub struct LeaderPolicy {
    min_speed: f64,
    max_speed: f64,
    accelerating: bool,
    last_toggle: Option<Instant>,
}

impl LeaderPolicy {
    /// Create a leader policy from the formation bounds.
    pub fn new(config: &FormationConfig) -> Self {
        Self {
            min_speed: config.min_speed,
            max_speed: config.max_speed,
            accelerating: false,
            last_toggle: None,
        }
    }
}

impl ControllerPolicy for LeaderPolicy {
    fn on_peer_data(&mut self, _source: &str, _data: &VehicleData) -> Vec<PolicyAction> {
        // The leader uses no other vehicle's data
        Vec::new()
    }

    fn on_tick(&mut self, now: Instant) -> Vec<PolicyAction> {
        let due = match self.last_toggle {
            None => true,
            Some(last) => now.duration_since(last) >= SPEED_TOGGLE_PERIOD,
        };
        if !due {
            return Vec::new();
        }

        self.last_toggle = Some(now);
        self.accelerating = !self.accelerating;
        let speed = if self.accelerating { self.max_speed } else { self.min_speed };
        vec![PolicyAction {
            api_code: ApiCode::DesiredSpeed,
            parameters: json!({ "speed": speed }),
        }]
    }
}

/// Follower strategy: forward leader and preceding-vehicle kinematic data
/// into the cooperative controller.
#[derive(Debug)]
pub struct FollowerPolicy {
    leader: Option<String>,
    preceding: Option<String>,
}

impl FollowerPolicy {
    /// Create a follower policy for `role`.
    pub fn new(role: &Role) -> Self {
        Self { leader: role.leader.clone(), preceding: role.preceding.clone() }
    }
}

impl ControllerPolicy for FollowerPolicy {
    fn on_peer_data(&mut self, source: &str, data: &VehicleData) -> Vec<PolicyAction> {
        let payload = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(%error, "dropping unserializable peer data");
                return Vec::new();
            },
        };

        let mut actions = Vec::new();
        if self.leader.as_deref() == Some(source) {
            actions.push(PolicyAction {
                api_code: ApiCode::LeaderData,
                parameters: payload.clone(),
            });
        }
        if self.preceding.as_deref() == Some(source) {
            actions.push(PolicyAction { api_code: ApiCode::FrontData, parameters: payload });
        }
        actions
    }

    fn on_tick(&mut self, _now: Instant) -> Vec<PolicyAction> {
        Vec::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config() -> FormationConfig {
        FormationConfig {
            formation: vec!["v.0".into(), "v.1".into(), "v.2".into()],
            beacon_interval: Duration::from_millis(100),
            min_speed: 15.0,
            max_speed: 25.0,
        }
    }

    fn sample(sender: &str) -> VehicleData {
        VehicleData {
            sumo_id: sender.to_owned(),
            controller_acceleration: 0.1,
            acceleration: 0.1,
            speed: 20.0,
            time: 5.0,
            x: 10.0,
            y: 0.0,
            sender: sender.to_owned(),
            recipient: Some("v.2".into()),
            ts: None,
            seqn: Some(3),
        }
    }

    #[test]
    fn parameters_round_trip_into_config() {
        let parameters = json!({
            "platoon_formation": ["v.0", "v.1", "v.2"],
            "beacon_interval": 0.1,
            "min_speed": 15.0,
            "max_speed": 25.0,
        });
        assert_eq!(FormationConfig::from_parameters(&parameters).unwrap(), config());
    }

    #[test]
    fn missing_parameter_is_rejected() {
        let parameters = json!({ "platoon_formation": ["v.0"] });
        assert!(matches!(
            FormationConfig::from_parameters(&parameters),
            Err(VehicleError::BadParameters(_))
        ));
    }

    #[test]
    fn roles_follow_formation_order() {
        let config = config();

        let head = config.role_of("v.0").unwrap();
        assert!(head.is_leader && !head.is_last);
        assert_eq!(head.following.as_deref(), Some("v.1"));
        assert!(head.leader.is_none() && head.preceding.is_none());

        let middle = config.role_of("v.1").unwrap();
        assert!(!middle.is_leader && !middle.is_last);
        assert_eq!(middle.leader.as_deref(), Some("v.0"));
        assert_eq!(middle.preceding.as_deref(), Some("v.0"));
        assert_eq!(middle.following.as_deref(), Some("v.2"));

        let tail = config.role_of("v.2").unwrap();
        assert!(tail.is_last && !tail.is_leader);
        assert_eq!(tail.preceding.as_deref(), Some("v.1"));
        assert!(tail.following.is_none());

        assert!(matches!(config.role_of("v.9"), Err(VehicleError::NotInFormation(_))));
    }

    #[test]
    fn tracked_neighbors_deduplicate_leader_and_preceding() {
        let config = config();
        // v.1: leader and preceding are both v.0
        assert_eq!(config.role_of("v.1").unwrap().tracked_neighbors(), vec!["v.0".to_owned()]);
        // v.2: distinct leader and preceding
        assert_eq!(
            config.role_of("v.2").unwrap().tracked_neighbors(),
            vec!["v.0".to_owned(), "v.1".to_owned()]
        );
    }

    #[test]
    fn leader_toggles_desired_speed_on_period() {
        let mut policy = LeaderPolicy::new(&config());
        let start = Instant::now();

        let first = policy.on_tick(start);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].api_code, ApiCode::DesiredSpeed);
        assert_eq!(first[0].parameters["speed"], 25.0);

        // Within the hold period: quiet
        assert!(policy.on_tick(start + Duration::from_secs(5)).is_empty());

        let second = policy.on_tick(start + SPEED_TOGGLE_PERIOD);
        assert_eq!(second[0].parameters["speed"], 15.0);
    }

    #[test]
    fn leader_ignores_peer_data() {
        let mut policy = LeaderPolicy::new(&config());
        assert!(policy.on_peer_data("v.1", &sample("v.1")).is_empty());
    }

    #[test]
    fn follower_routes_peer_data_by_source() {
        let config = config();
        let mut policy = FollowerPolicy::new(&config.role_of("v.2").unwrap());

        let from_leader = policy.on_peer_data("v.0", &sample("v.0"));
        assert_eq!(from_leader.len(), 1);
        assert_eq!(from_leader[0].api_code, ApiCode::LeaderData);

        let from_preceding = policy.on_peer_data("v.1", &sample("v.1"));
        assert_eq!(from_preceding.len(), 1);
        assert_eq!(from_preceding[0].api_code, ApiCode::FrontData);

        assert!(policy.on_peer_data("v.9", &sample("v.9")).is_empty());
    }

    #[test]
    fn follower_behind_leader_forwards_both_roles() {
        let config = config();
        // v.1's leader and preceding are the same vehicle
        let mut policy = FollowerPolicy::new(&config.role_of("v.1").unwrap());

        let actions = policy.on_peer_data("v.0", &sample("v.0"));
        let codes: Vec<_> = actions.iter().map(|a| a.api_code).collect();
        assert_eq!(codes, vec![ApiCode::LeaderData, ApiCode::FrontData]);
    }

    #[test]
    fn mode_switch_selects_matching_controller() {
        let degrade = controller_for_mode(ControllerMode::Degraded);
        assert_eq!(degrade.api_code, ApiCode::ActiveController);
        assert_eq!(degrade.parameters["controller"], "acc");

        let recover = controller_for_mode(ControllerMode::Cooperative);
        assert_eq!(recover.parameters["controller"], "cacc");
    }
}
