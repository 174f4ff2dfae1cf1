//! Engine-level scenarios: rollbacks, the prediction barrier, seeding and disconnects,
//! driven directly on a [`SyncEngine`] with the ship simulation.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

mod common;

use common::stubs::{ShipSim, BRAKE, FIRE, ROTATE_LEFT, THRUST};
use lockstep_rollback::{Frame, Input, RollbackError, SimulationHandler, SyncEngine};

fn straight_run(inputs: &[[u32; 2]]) -> ShipSim {
    let mut sim = ShipSim::new(2);
    for (frame, buttons) in inputs.iter().enumerate() {
        let frame = Frame::new(frame as i32);
        sim.update(
            &[Input::new(frame, buttons[0]), Input::new(frame, buttons[1])],
            frame,
        );
    }
    sim
}

#[test]
fn late_input_rolls_back_to_the_first_wrong_frame() {
    common::init_tracing();
    let mut engine = SyncEngine::new(2, 8).unwrap();
    let mut sim = ShipSim::new(2);

    // five frames with participant 1 predicted as idle
    for _ in 0..5 {
        engine.add_local_input(0, THRUST).unwrap();
        engine.advance(&mut sim).unwrap();
    }
    assert_eq!(sim.loads, 0);

    for frame in 0..5 {
        engine
            .add_remote_input(1, Input::new(Frame::new(frame), FIRE | ROTATE_LEFT))
            .unwrap();
    }
    assert_eq!(engine.first_incorrect_frame(), Frame::new(0));

    engine.add_local_input(0, THRUST).unwrap();
    engine.advance(&mut sim).unwrap();

    assert_eq!(sim.loads, 1);
    assert_eq!(sim.updates, 5 + 5 + 1);
    assert!(engine.first_incorrect_frame().is_null());
    // frame 5 repeats the last confirmed input of participant 1
    let expected = straight_run(&[[THRUST, FIRE | ROTATE_LEFT]; 6]);
    assert_eq!(sim.world, expected.world);
    assert_eq!(engine.last_confirmed_frame(), Frame::new(4));
}

#[test]
fn correct_predictions_do_not_roll_back() {
    let mut engine = SyncEngine::new(2, 8).unwrap();
    let mut sim = ShipSim::new(2);

    engine.add_remote_input(1, Input::new(Frame::new(0), BRAKE)).unwrap();
    for _ in 0..4 {
        engine.add_local_input(0, THRUST).unwrap();
        engine.advance(&mut sim).unwrap();
    }
    for frame in 1..4 {
        engine
            .add_remote_input(1, Input::new(Frame::new(frame), BRAKE))
            .unwrap();
    }
    assert!(engine.first_incorrect_frame().is_null());

    engine.add_local_input(0, THRUST).unwrap();
    engine.advance(&mut sim).unwrap();
    assert_eq!(sim.loads, 0);
    assert_eq!(sim.world, straight_run(&[[THRUST, BRAKE]; 5]).world);
}

#[test]
fn prediction_barrier_refuses_input_without_enqueuing() {
    let mut engine = SyncEngine::new(2, 3).unwrap();
    let mut sim = ShipSim::new(2);

    for _ in 0..2 {
        engine.add_local_input(0, THRUST).unwrap();
        engine.advance(&mut sim).unwrap();
    }
    assert_eq!(
        engine.add_local_input(0, THRUST),
        Err(RollbackError::PredictionBarrier {
            frames_behind: 3,
            max_prediction: 3
        })
    );
    assert_eq!(
        engine.queue(0).unwrap().newest_confirmed_frame(),
        Frame::new(1)
    );

    // one confirmed remote frame opens the window again
    engine.add_remote_input(1, Input::new(Frame::new(0), 0)).unwrap();
    assert_eq!(engine.last_confirmed_frame(), Frame::new(0));
    assert_eq!(engine.add_local_input(0, THRUST), Ok(Frame::new(2)));
    engine.advance(&mut sim).unwrap();
    assert_eq!(engine.current_frame(), Frame::new(3));
}

#[test]
fn seeded_engine_continues_where_the_snapshot_left_off() {
    let script = [THRUST, THRUST | ROTATE_LEFT, FIRE, BRAKE, 0, THRUST, FIRE];
    let mut veteran = SyncEngine::new(2, 8).unwrap();
    let mut veteran_sim = ShipSim::new(2);
    for (frame, buttons) in script.iter().take(6).enumerate() {
        veteran
            .add_remote_input(1, Input::new(Frame::new(frame as i32), *buttons))
            .unwrap();
        veteran.add_local_input(0, *buttons).unwrap();
        veteran.advance(&mut veteran_sim).unwrap();
    }
    let snapshot = veteran.current_snapshot().unwrap().clone();
    assert_eq!(snapshot.frame, Frame::new(6));

    let mut newcomer = SyncEngine::new(2, 8).unwrap();
    let mut newcomer_sim = ShipSim::new(2);
    newcomer
        .seed(snapshot.frame, snapshot.state, &mut newcomer_sim)
        .unwrap();
    assert_eq!(newcomer.current_frame(), Frame::new(6));
    assert_eq!(newcomer.last_confirmed_frame(), Frame::new(5));
    assert_eq!(newcomer_sim.world, veteran_sim.world);

    // the history before the snapshot is absorbed
    for (frame, buttons) in script.iter().take(6).enumerate() {
        assert_eq!(
            newcomer.add_remote_input(0, Input::new(Frame::new(frame as i32), *buttons)),
            Ok(Frame::NULL)
        );
    }
    assert_eq!(
        newcomer.add_remote_input(0, Input::new(Frame::new(6), script[6])),
        Ok(Frame::new(6))
    );
    assert_eq!(newcomer.add_local_input(1, script[6]), Ok(Frame::new(6)));
    newcomer.advance(&mut newcomer_sim).unwrap();

    veteran
        .add_remote_input(1, Input::new(Frame::new(6), script[6]))
        .unwrap();
    veteran.add_local_input(0, script[6]).unwrap();
    veteran.advance(&mut veteran_sim).unwrap();

    assert_eq!(newcomer_sim.world, veteran_sim.world);
    assert_eq!(newcomer_sim.world.frame, 7);
}

#[test]
fn seeding_at_a_negative_frame_is_refused() {
    let mut engine = SyncEngine::new(2, 8).unwrap();
    let mut sim = ShipSim::new(2);
    let state = sim.save_state().unwrap();
    assert!(matches!(
        engine.seed(Frame::NULL, state, &mut sim),
        Err(RollbackError::InvalidFrame { .. })
    ));
}

#[test]
fn disconnected_participant_no_longer_holds_back_confirmation() {
    let mut engine = SyncEngine::new(2, 4).unwrap();
    let mut sim = ShipSim::new(2);

    for frame in 0..3 {
        engine
            .add_remote_input(1, Input::new(Frame::new(frame), THRUST))
            .unwrap();
    }
    for _ in 0..4 {
        engine.add_local_input(0, 0).unwrap();
        engine.advance(&mut sim).unwrap();
    }

    assert_eq!(engine.disconnect_participant(1), Ok(Frame::new(2)));
    assert!(engine.is_disconnected(1));
    assert_eq!(
        engine.add_remote_input(1, Input::new(Frame::new(3), THRUST)),
        Ok(Frame::NULL)
    );

    // far beyond the prediction window of 4 frames
    for _ in 0..20 {
        engine.add_local_input(0, 0).unwrap();
        engine.advance(&mut sim).unwrap();
    }
    assert_eq!(engine.current_frame(), Frame::new(24));
    assert_eq!(engine.last_confirmed_frame(), Frame::new(23));

    let inputs = engine.synchronized_inputs().unwrap();
    assert_eq!(inputs[1], Input::blank(Frame::new(24)));
}

#[test]
fn disconnect_replaces_predicted_input_with_blank_input() {
    let mut engine = SyncEngine::new(2, 8).unwrap();
    let mut sim = ShipSim::new(2);

    engine
        .add_remote_input(1, Input::new(Frame::new(0), FIRE | ROTATE_LEFT))
        .unwrap();
    for _ in 0..5 {
        engine.add_local_input(0, THRUST).unwrap();
        engine.advance(&mut sim).unwrap();
    }
    // frames 1..=4 were simulated with participant 1 predicted as firing and turning
    assert_eq!(engine.disconnect_participant(1), Ok(Frame::new(0)));

    engine.add_local_input(0, THRUST).unwrap();
    engine.advance(&mut sim).unwrap();

    assert_eq!(sim.loads, 1);
    assert_eq!(sim.updates, 5 + 4 + 1);
    let mut expected = vec![[THRUST, FIRE | ROTATE_LEFT]];
    expected.extend([[THRUST, 0]; 5]);
    assert_eq!(sim.world, straight_run(&expected).world);
}

#[test]
fn earlier_disconnect_frame_from_a_peer_rolls_back_further() {
    let mut engine = SyncEngine::new(2, 8).unwrap();
    let mut sim = ShipSim::new(2);

    engine
        .add_remote_input(1, Input::new(Frame::new(0), BRAKE))
        .unwrap();
    for _ in 0..3 {
        engine.add_local_input(0, THRUST).unwrap();
        engine.advance(&mut sim).unwrap();
        let frame = engine.current_frame();
        engine
            .add_remote_input(1, Input::new(frame, FIRE))
            .unwrap();
    }
    assert_eq!(engine.disconnect_participant(1), Ok(Frame::new(3)));
    engine.add_local_input(0, THRUST).unwrap();
    engine.advance(&mut sim).unwrap();
    assert_eq!(engine.last_confirmed_frame(), Frame::new(3));

    // another survivor only ever saw frame 0 of participant 1, but frame 3 is confirmed here
    assert_eq!(
        engine.disconnect_participant_at(1, Frame::new(0)),
        Ok(Frame::new(3))
    );
    assert_eq!(engine.connection_statuses()[1].last_frame, Frame::new(3));
    let loads = sim.loads;
    engine.add_local_input(0, THRUST).unwrap();
    engine.advance(&mut sim).unwrap();
    assert_eq!(sim.loads, loads);
}

#[test]
fn unknown_participant_is_rejected() {
    let mut engine = SyncEngine::new(2, 8).unwrap();
    assert!(matches!(
        engine.add_local_input(2, 0),
        Err(RollbackError::InvalidParticipant { .. })
    ));
    assert!(matches!(
        engine.add_remote_input(5, Input::new(Frame::new(0), 0)),
        Err(RollbackError::InvalidParticipant { .. })
    ));
}
