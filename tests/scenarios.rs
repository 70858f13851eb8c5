use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

use gravity_rails::{
    BodyDesc, BodyHandle, EngineConfig, IntegratorKind, KeplerSolver, Maneuver, OrbitClass, OrbitalElements,
    SimulationState, Vector3,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Sun pinned at the origin plus whatever the test adds
fn world(config: EngineConfig) -> (SimulationState, BodyHandle) {
    let mut sim = SimulationState::new(config).unwrap();
    let sun = sim
        .add_body(BodyDesc::new(1.0, Vector3::zero(), Vector3::zero()))
        .unwrap();
    (sim, sun)
}

// ==================================================================================
// Long-run orbits
// ==================================================================================

#[test]
fn circular_orbit_holds_radius_for_100_periods() {
    let (mut sim, sun) = world(EngineConfig::default());
    let tracer = sim
        .add_body(BodyDesc::new(
            0.0,
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        ))
        .unwrap();

    let mut worst: f64 = 0.0;
    for _ in 0..100 {
        sim.evolve(2.0 * PI).unwrap();
        let r = sim
            .position(tracer)
            .unwrap()
            .distance(&sim.position(sun).unwrap());
        worst = worst.max((r - 1.0).abs());
    }
    assert!(worst < 1e-3, "radius wandered by {}", worst);
    assert!(sim.massless_time() <= sim.massive_time());
}

#[test]
fn tracer_keeps_circular_orbit_around_moving_sun() {
    let mut sim = SimulationState::new(EngineConfig::default()).unwrap();
    let sun = sim
        .add_body(BodyDesc::new(1.0, Vector3::zero(), Vector3::new(1.0, 0.0, 0.0)))
        .unwrap();
    let tracer = sim
        .add_body(BodyDesc::new(
            0.0,
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(1.0, 1.0, 0.0),
        ))
        .unwrap();

    let mut worst: f64 = 0.0;
    for _ in 0..100 {
        sim.evolve(0.1 * PI).unwrap();
        let r = sim
            .position(tracer)
            .unwrap()
            .distance(&sim.position(sun).unwrap());
        worst = worst.max((r - 1.0).abs());
    }
    assert!(worst < 1e-3, "radius wandered by {}", worst);
}

#[test]
fn two_body_ellipse_energy_stays_bounded() {
    let config = EngineConfig::default().with_engine_dt(0.001);
    let (mut sim, _sun) = world(config);
    let mu: f64 = 1.1;
    sim.add_body(BodyDesc::new(
        0.1,
        Vector3::new(1.0, 0.0, 0.0),
        Vector3::new(0.0, 0.8 * mu.sqrt(), 0.0),
    ))
    .unwrap();

    // a = 1 / (2 - 0.64), period = 2 pi sqrt(a^3 / mu)
    let a: f64 = 1.0 / 1.36;
    let period = 2.0 * PI * (a * a * a / mu).sqrt();

    let mut drifts = Vec::new();
    for _ in 0..40 {
        sim.evolve(period / 4.0).unwrap();
        drifts.push(sim.energy_drift());
    }
    assert!(drifts.iter().all(|d| d.abs() < 1e-3), "drifts {:?}", drifts);

    // Bounded oscillation: the last period is no worse than ten times the first
    let first = drifts[..4].iter().fold(0.0f64, |m, d| m.max(d.abs()));
    let last = drifts[36..].iter().fold(0.0f64, |m, d| m.max(d.abs()));
    assert!(last <= 10.0 * first.max(1e-12));
}

// ==================================================================================
// Kepler
// ==================================================================================

#[test]
fn hyperbolic_flyby_reaches_analytic_periapsis() {
    let solver = KeplerSolver::default();
    let mu = 1.0;
    let r0 = Vector3::new(10.0, 0.0, 0.0);
    let v0 = Vector3::new(0.0, 2.0, 0.0);

    let at_epoch = OrbitalElements::from_state(&r0, &v0, mu).unwrap();
    assert!(at_epoch.eccentricity > 1.0);
    assert_eq!(at_epoch.class, OrbitClass::HyperbolicEquatorial);

    // Step back onto the inbound leg, then ask how long until periapsis
    let (r, v) = solver.propagate(&r0, &v0, mu, -5.0).unwrap();
    let inbound = OrbitalElements::from_state(&r, &v, mu).unwrap();
    let ttp = inbound.time_to_periapsis().unwrap();
    assert!((ttp - 5.0).abs() < 1e-6, "time to periapsis {}", ttp);

    let (rp, _) = solver.propagate(&r, &v, mu, ttp).unwrap();
    let expected = inbound.periapsis();
    assert!(((rp.magnitude() - expected) / expected).abs() < 1e-4);
    assert!(((expected - 10.0) / 10.0).abs() < 1e-8);
}

// ==================================================================================
// Maneuvers
// ==================================================================================

#[test]
fn maneuver_inside_a_single_evolve_call() {
    let mut sim = SimulationState::new(EngineConfig::default()).unwrap();
    let ship = sim
        .add_body(BodyDesc::new(
            1.0,
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::zero(),
        ))
        .unwrap();

    let fired = Arc::new(Mutex::new(Vec::new()));
    let log = fired.clone();
    sim.schedule_maneuver(
        ship,
        0.5,
        Vector3::new(0.0, 1.0, 0.0),
        Some(Box::new(move |m: &Maneuver| log.lock().push(m.time))),
    )
    .unwrap();

    sim.evolve(1.0).unwrap();

    assert_eq!(*fired.lock(), vec![0.5]);
    assert_eq!(sim.pending_maneuvers(), 0);
    // Half a unit of coasting after the burn, none before it
    let p = sim.position(ship).unwrap();
    assert!((p.x - 1.0).abs() < 1e-12);
    assert!((p.y - 0.5).abs() < 1e-9, "y = {}", p.y);
    assert_eq!(sim.velocity(ship).unwrap(), Vector3::new(0.0, 1.0, 0.0));

    sim.evolve(1.0).unwrap();
    assert_eq!(fired.lock().len(), 1);
}

// ==================================================================================
// Rails
// ==================================================================================

fn rails_world() -> (SimulationState, BodyHandle, BodyHandle) {
    let mut sim = SimulationState::new(EngineConfig::default()).unwrap();
    let sun = sim
        .add_body(BodyDesc::new(1.0, Vector3::zero(), Vector3::zero()).stationary())
        .unwrap();
    let planet = sim
        .add_body(
            BodyDesc::new(1e-3, Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 1.15, 0.1))
                .on_rails_around(sun),
        )
        .unwrap();
    let moon = sim
        .add_body(
            BodyDesc::new(0.0, Vector3::new(1.01, 0.0, 0.0), Vector3::new(0.0, 1.45, 0.1))
                .on_rails_around(planet),
        )
        .unwrap();
    (sim, planet, moon)
}

#[test]
fn rails_big_jump_matches_small_steps() {
    let (mut big, planet, moon) = rails_world();
    let (mut small, _, _) = rails_world();
    assert!(big.is_on_rails());

    big.evolve(10.0).unwrap();
    for _ in 0..40 {
        small.evolve(0.25).unwrap();
    }
    assert_eq!(big.time(), small.time());
    assert_eq!(big.position(planet).unwrap(), small.position(planet).unwrap());
    assert_eq!(big.position(moon).unwrap(), small.position(moon).unwrap());
    assert_eq!(big.velocity(moon).unwrap(), small.velocity(moon).unwrap());
}

// ==================================================================================
// Registry bookkeeping
// ==================================================================================

#[test]
fn registry_and_integrator_stay_aligned() {
    let mut sim = SimulationState::new(EngineConfig::default()).unwrap();
    let mut rng = StdRng::seed_from_u64(1234);
    let mut masses: HashMap<BodyHandle, f64> = HashMap::new();

    for _ in 0..300 {
        if masses.is_empty() || rng.gen_bool(0.65) {
            let mass = rng.gen_range(1e-6..1e-3);
            let pos = Vector3::new(
                rng.gen_range(-50.0..50.0),
                rng.gen_range(-50.0..50.0),
                rng.gen_range(-50.0..50.0),
            );
            let h = sim.add_body(BodyDesc::new(mass, pos, Vector3::zero())).unwrap();
            masses.insert(h, mass);
        } else {
            let mut live: Vec<BodyHandle> = masses.keys().copied().collect();
            live.sort();
            let h = live[rng.gen_range(0..live.len())];
            sim.remove_body(h).unwrap();
            masses.remove(&h);
        }
    }
    assert!(sim.registry().capacity() > EngineConfig::default().initial_capacity);

    let check = |sim: &SimulationState| {
        let registry = sim.registry();
        assert_eq!(registry.len(), masses.len());
        for i in 0..registry.len() {
            let h = registry.id_at(i).unwrap();
            assert_eq!(Some(h), sim.integrator().id_at(i));
            assert_eq!(registry.mass(i), masses[&h]);
        }
    };
    check(&sim);
    sim.evolve(0.05).unwrap();
    check(&sim);
}

// ==================================================================================
// Regularized three-body
// ==================================================================================

#[test]
fn triple_survives_close_approach() {
    let config = EngineConfig::default().with_integrator(IntegratorKind::Triple);
    let mut sim = SimulationState::new(config).unwrap();
    let bodies = [
        (3.0, Vector3::new(1.0, 3.0, 0.0)),
        (4.0, Vector3::new(-2.0, -1.0, 0.0)),
        (5.0, Vector3::new(1.0, -1.0, 0.0)),
    ];
    let handles: Vec<BodyHandle> = bodies
        .iter()
        .map(|(m, p)| sim.add_body(BodyDesc::new(*m, *p, Vector3::zero())).unwrap())
        .collect();

    let mut closest = f64::INFINITY;
    while sim.time() < 2.0 - 1e-9 {
        sim.evolve(0.01).unwrap();
        for i in 0..3 {
            for j in (i + 1)..3 {
                let d = sim
                    .position(handles[i])
                    .unwrap()
                    .distance(&sim.position(handles[j]).unwrap());
                closest = closest.min(d);
            }
        }
    }
    assert!(closest < 1.0, "closest approach {}", closest);
    assert!(sim.energy_drift().abs() < 1e-5, "drift {}", sim.energy_drift());
    assert!(sim.angular_momentum().magnitude() < 1e-4);
}
