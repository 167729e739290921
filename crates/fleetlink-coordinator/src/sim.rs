//! Synthetic traffic simulator.
//!
//! A minimal constant-acceleration kinematic model behind the
//! [`SimulationApi`] trait, used by the self-contained demo binary and the
//! integration tests. Vehicles drive a straight line; spawns and despawns
//! are scheduled ahead of time.

use std::collections::HashMap;
use std::time::Duration;

use crate::{SimulationApi, SimulationError, StepSnapshot, StepVehicle, VehicleState};
use fleetlink_proto::VehicleData;

/// Acceleration bound of the synthetic longitudinal controller, m/s^2.
const MAX_ACCELERATION: f64 = 2.5;

#[derive(Debug, Clone)]
struct SimVehicle {
    x: f64,
    y: f64,
    speed: f64,
    desired_speed: f64,
    acceleration: f64,
    controller: String,
    leader_speed: Option<f64>,
}

#[derive(Debug, Clone)]
struct ScheduledSpawn {
    at: f64,
    sumo_id: String,
    x: f64,
    speed: f64,
}

/// Scripted in-process simulator.
#[derive(Debug)]
pub struct SyntheticSim {
    time: f64,
    step_length: f64,
    vehicles: HashMap<String, SimVehicle>,
    spawns: Vec<ScheduledSpawn>,
    despawns: Vec<(f64, String)>,
}

impl SyntheticSim {
    /// Create a simulator advancing `step_length` per step, starting empty
    /// at time zero.
    pub fn new(step_length: Duration) -> Self {
        Self {
            time: 0.0,
            step_length: step_length.as_secs_f64(),
            vehicles: HashMap::new(),
            spawns: Vec::new(),
            despawns: Vec::new(),
        }
    }

    /// Schedule `sumo_id` to appear at simulation time `at`, at position
    /// `x` with initial speed `speed`.
    pub fn schedule_spawn(&mut self, at: f64, sumo_id: &str, x: f64, speed: f64) {
        self.spawns.push(ScheduledSpawn { at, sumo_id: sumo_id.to_owned(), x, speed });
    }

    /// Schedule `sumo_id` to leave the simulation at time `at`.
    pub fn schedule_despawn(&mut self, at: f64, sumo_id: &str) {
        self.despawns.push((at, sumo_id.to_owned()));
    }

    /// Current simulation time, seconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Number of vehicles currently present.
    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    fn vehicle_mut(&mut self, vehicle: &str) -> Result<&mut SimVehicle, SimulationError> {
        self.vehicles
            .get_mut(vehicle)
            .ok_or_else(|| SimulationError::UnknownVehicle(vehicle.to_owned()))
    }

    fn process_schedule(&mut self) {
        let now = self.time;

        let (due, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.spawns).into_iter().partition(|spawn| spawn.at <= now);
        self.spawns = pending;
        for spawn in due {
            self.vehicles.insert(
                spawn.sumo_id,
                SimVehicle {
                    x: spawn.x,
                    y: 0.0,
                    speed: spawn.speed,
                    desired_speed: spawn.speed,
                    acceleration: 0.0,
                    controller: "cacc".to_owned(),
                    leader_speed: None,
                },
            );
        }

        let (due, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.despawns).into_iter().partition(|(at, _)| *at <= now);
        self.despawns = pending;
        for (_, sumo_id) in due {
            self.vehicles.remove(&sumo_id);
        }
    }

    fn integrate(&mut self) {
        let dt = self.step_length;
        for vehicle in self.vehicles.values_mut() {
            // Cooperative controller tracks the leader when it has data;
            // otherwise fall back to the own desired speed
            let target = match (vehicle.controller.as_str(), vehicle.leader_speed) {
                ("cacc", Some(leader_speed)) => leader_speed,
                _ => vehicle.desired_speed,
            };

            let wanted = (target - vehicle.speed) / dt;
            vehicle.acceleration = wanted.clamp(-MAX_ACCELERATION, MAX_ACCELERATION);
            vehicle.speed += vehicle.acceleration * dt;
            vehicle.x += vehicle.speed * dt;
        }
    }
}

impl SimulationApi for SyntheticSim {
    fn read_vehicle_state(&mut self, vehicle: &str) -> Result<VehicleState, SimulationError> {
        let time = self.time;
        let vehicle = self.vehicle_mut(vehicle)?;
        Ok(VehicleState {
            controller_acceleration: vehicle.acceleration,
            acceleration: vehicle.acceleration,
            speed: vehicle.speed,
            time,
            x: vehicle.x,
            y: vehicle.y,
        })
    }

    fn set_leader_data(
        &mut self,
        vehicle: &str,
        data: &VehicleData,
    ) -> Result<(), SimulationError> {
        self.vehicle_mut(vehicle)?.leader_speed = Some(data.speed);
        Ok(())
    }

    fn set_front_data(
        &mut self,
        vehicle: &str,
        _data: &VehicleData,
    ) -> Result<(), SimulationError> {
        // Spacing control is out of scope for the straight-line model;
        // presence of the vehicle is still validated
        self.vehicle_mut(vehicle)?;
        Ok(())
    }

    fn set_desired_speed(&mut self, vehicle: &str, speed: f64) -> Result<(), SimulationError> {
        self.vehicle_mut(vehicle)?.desired_speed = speed;
        Ok(())
    }

    fn set_active_controller(
        &mut self,
        vehicle: &str,
        controller: &str,
    ) -> Result<(), SimulationError> {
        self.vehicle_mut(vehicle)?.controller = controller.to_owned();
        Ok(())
    }

    fn step(&mut self) -> Result<StepSnapshot, SimulationError> {
        self.time += self.step_length;
        self.process_schedule();
        self.integrate();

        let mut vehicles: Vec<StepVehicle> = self
            .vehicles
            .iter()
            .map(|(sumo_id, vehicle)| StepVehicle {
                sumo_id: sumo_id.clone(),
                x: vehicle.x,
                y: vehicle.y,
            })
            .collect();
        vehicles.sort_by(|a, b| a.sumo_id.cmp(&b.sumo_id));

        Ok(StepSnapshot { time: self.time, vehicles })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sim() -> SyntheticSim {
        SyntheticSim::new(Duration::from_millis(100))
    }

    #[test]
    fn scheduled_vehicles_appear_and_disappear_on_time() {
        let mut sim = sim();
        sim.schedule_spawn(0.1, "v.0", 0.0, 20.0);
        sim.schedule_despawn(0.3, "v.0");

        let first = sim.step().unwrap();
        assert_eq!(first.vehicles.len(), 1);
        assert_eq!(first.vehicles[0].sumo_id, "v.0");

        sim.step().unwrap();
        let third = sim.step().unwrap();
        assert!(third.vehicles.is_empty());
    }

    #[test]
    fn vehicles_approach_the_desired_speed() {
        let mut sim = sim();
        sim.schedule_spawn(0.0, "v.0", 0.0, 10.0);
        sim.step().unwrap();

        sim.set_desired_speed("v.0", 30.0).unwrap();
        for _ in 0..200 {
            sim.step().unwrap();
        }

        let state = sim.read_vehicle_state("v.0").unwrap();
        assert!((state.speed - 30.0).abs() < 0.5, "speed was {}", state.speed);
        // Acceleration respects the bound throughout
        assert!(state.controller_acceleration.abs() <= MAX_ACCELERATION);
    }

    #[test]
    fn cooperative_controller_tracks_the_leader() {
        let mut sim = sim();
        sim.schedule_spawn(0.0, "v.1", 0.0, 10.0);
        sim.step().unwrap();

        let leader = VehicleData {
            sumo_id: "v.0".into(),
            controller_acceleration: 0.0,
            acceleration: 0.0,
            speed: 25.0,
            time: 0.0,
            x: 50.0,
            y: 0.0,
            sender: "v.0".into(),
            recipient: None,
            ts: None,
            seqn: None,
        };
        sim.set_leader_data("v.1", &leader).unwrap();
        for _ in 0..100 {
            sim.step().unwrap();
        }
        assert!((sim.read_vehicle_state("v.1").unwrap().speed - 25.0).abs() < 0.5);

        // The degraded controller ignores leader data
        sim.set_active_controller("v.1", "acc").unwrap();
        sim.set_desired_speed("v.1", 15.0).unwrap();
        for _ in 0..100 {
            sim.step().unwrap();
        }
        assert!((sim.read_vehicle_state("v.1").unwrap().speed - 15.0).abs() < 0.5);
    }

    #[test]
    fn unknown_vehicles_are_reported() {
        let mut sim = sim();
        assert!(matches!(
            sim.read_vehicle_state("v.9"),
            Err(SimulationError::UnknownVehicle(_))
        ));
        assert!(matches!(
            sim.set_desired_speed("v.9", 10.0),
            Err(SimulationError::UnknownVehicle(_))
        ));
    }
}
