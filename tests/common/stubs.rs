//! A small space ship simulation used as the [`SimulationHandler`] in integration tests.
//!
//! Physics run on fixed-point integers so every peer computes bit-identical states.

use lockstep_rollback::network::codec;
use lockstep_rollback::{Frame, Input, RollbackError, SimulationHandler};
use serde::{Deserialize, Serialize};

pub const THRUST: u32 = 1;
pub const BRAKE: u32 = 2;
pub const ROTATE_LEFT: u32 = 4;
pub const ROTATE_RIGHT: u32 = 8;
pub const FIRE: u32 = 16;

/// Sixteen headings around the circle, as unit vectors scaled by 256.
const HEADINGS: [(i32, i32); 16] = [
    (256, 0),
    (237, 98),
    (181, 181),
    (98, 237),
    (0, 256),
    (-98, 237),
    (-181, 181),
    (-237, 98),
    (-256, 0),
    (-237, -98),
    (-181, -181),
    (-98, -237),
    (0, -256),
    (98, -237),
    (181, -181),
    (237, -98),
];

const ARENA: i32 = 1 << 20;
const FIRE_COOLDOWN: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ship {
    pub x: i32,
    pub y: i32,
    pub vx: i32,
    pub vy: i32,
    pub heading: u8,
    pub cooldown: u8,
    pub shots: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct World {
    pub frame: i32,
    pub ships: Vec<Ship>,
}

/// The simulation plus a few counters the tests look at.
#[derive(Debug, Default)]
pub struct ShipSim {
    pub world: World,
    pub updates: usize,
    pub loads: usize,
}

impl ShipSim {
    #[must_use]
    pub fn new(ships: usize) -> Self {
        let ships = (0..ships)
            .map(|index| Ship {
                x: index as i32 * 4096,
                heading: (index * 4 % 16) as u8,
                ..Ship::default()
            })
            .collect();
        Self {
            world: World { frame: 0, ships },
            updates: 0,
            loads: 0,
        }
    }
}

fn steer(ship: &mut Ship, buttons: u32) {
    if buttons & ROTATE_LEFT != 0 {
        ship.heading = (ship.heading + 1) % 16;
    }
    if buttons & ROTATE_RIGHT != 0 {
        ship.heading = (ship.heading + 15) % 16;
    }
    let (dx, dy) = HEADINGS[ship.heading as usize];
    if buttons & THRUST != 0 {
        ship.vx += dx / 16;
        ship.vy += dy / 16;
    }
    if buttons & BRAKE != 0 {
        ship.vx -= ship.vx / 4;
        ship.vy -= ship.vy / 4;
    }
    ship.x = (ship.x + ship.vx).rem_euclid(ARENA);
    ship.y = (ship.y + ship.vy).rem_euclid(ARENA);

    ship.cooldown = ship.cooldown.saturating_sub(1);
    if buttons & FIRE != 0 && ship.cooldown == 0 {
        ship.shots += 1;
        ship.cooldown = FIRE_COOLDOWN;
    }
}

impl SimulationHandler for ShipSim {
    fn update(&mut self, inputs: &[Input], frame: Frame) {
        assert_eq!(self.world.frame, frame.as_i32(), "simulated frames out of order");
        for (ship, input) in self.world.ships.iter_mut().zip(inputs) {
            steer(ship, input.data);
        }
        self.world.frame += 1;
        self.updates += 1;
    }

    fn save_state(&self) -> Result<Vec<u8>, RollbackError> {
        codec::encode(&self.world).map_err(|err| RollbackError::Serialization {
            context: err.to_string(),
        })
    }

    fn load_state(&mut self, snapshot: &[u8]) -> Result<(), RollbackError> {
        self.world = codec::decode_value(snapshot).map_err(|err| RollbackError::Serialization {
            context: err.to_string(),
        })?;
        self.loads += 1;
        Ok(())
    }
}

/// A reproducible button pattern for participant `index` at `frame`.
#[must_use]
pub fn scripted_buttons(index: usize, frame: u32) -> u32 {
    let phase = (frame / 7 + index as u32 * 3) % 6;
    match phase {
        0 => THRUST,
        1 => THRUST | ROTATE_LEFT,
        2 => FIRE,
        3 => ROTATE_RIGHT | FIRE,
        4 => BRAKE,
        _ => 0,
    }
}
