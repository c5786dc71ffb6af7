use std::sync::Arc;

use glam::DVec2;
use num_complex::Complex64;

use tdgl_rs::discretization::{generate_mesh, MeshOptions};
use tdgl_rs::physics::{Parameter, UniformField};
use tdgl_rs::{
    BoundaryConditions, Domain, FieldState, Mesh, Polygon, Runner, SaveCadence, SolverOptions,
    SteadyStateCriterion, TdglParameters, Termination,
};

fn disk(max_edge_length: f64) -> Arc<Mesh> {
    let domain = Domain::new(Polygon::circle("disk", 3.0, 40, [0.0, 0.0]), max_edge_length);
    Arc::new(generate_mesh(&domain, &MeshOptions::default()).unwrap())
}

#[test]
fn superconducting_disk_stays_at_equilibrium() {
    let mesh = disk(0.5);
    let options = SolverOptions {
        steady_state: Some(SteadyStateCriterion {
            window: 1.0,
            tolerance: 1e-6,
        }),
        ..SolverOptions::new(20.0)
    };
    let mut runner =
        Runner::new(mesh.clone(), TdglParameters::default(), BoundaryConditions::new(), options)
            .unwrap();
    let solution = runner
        .run(FieldState::uniform(&mesh, Complex64::new(1.0, 0.0)))
        .unwrap();

    assert_eq!(solution.termination(), Some(Termination::SteadyState));
    assert!(solution.stats().final_time < 20.0);
    let last = solution.final_state().unwrap();
    assert!(last.psi.iter().all(|p| (p.norm() - 1.0).abs() < 1e-6));
    assert!(last.mu.iter().all(|m| m.abs() < 1e-8));
    let obs = &solution.records().last().unwrap().observables;
    assert!(obs.vorticity.iter().all(|v| v.abs() < 1e-9));
}

#[test]
fn strip_above_critical_current_nucleates_vortices() {
    let (length, width) = (16.0, 6.0);
    let domain = Domain::new(Polygon::rectangle("film", length, width, [0.0, 0.0]), 0.8)
        .with_terminal(Polygon::rectangle("source", 0.4, width + 0.4, [-length / 2.0, 0.0]))
        .with_terminal(Polygon::rectangle("drain", 0.4, width + 0.4, [length / 2.0, 0.0]));
    let mesh = Arc::new(generate_mesh(&domain, &MeshOptions::default()).unwrap());

    // Normal spot on the upper edge where vortices enter.
    let weak_spot = DVec2::new(0.0, width / 2.0);
    let params = TdglParameters::default().with_epsilon(Parameter::new(move |r: DVec2| {
        if r.distance(weak_spot) < 1.0 {
            -1.0
        } else {
            1.0
        }
    }));
    let current = 0.5 * width;
    let bcs = BoundaryConditions::new()
        .with_terminal("source", current)
        .with_terminal("drain", -current);
    let options = SolverOptions {
        save_cadence: SaveCadence::EveryTime(0.5),
        ..SolverOptions::new(150.0)
    };
    let mut runner = Runner::new(mesh.clone(), params, bcs, options).unwrap();
    let solution = runner
        .run(FieldState::uniform(&mesh, Complex64::new(1.0, 0.0)))
        .unwrap();
    assert_eq!(solution.termination(), Some(Termination::TimeLimitReached));

    // Cells away from the clamped terminals wind by whole multiples of 2π.
    let inner: Vec<usize> = mesh
        .cells
        .iter()
        .filter(|c| c.circumcenter.x.abs() < length / 2.0 - 2.0)
        .map(|c| c.id)
        .collect();
    let nucleated = solution.records().iter().any(|record| {
        inner
            .iter()
            .any(|&k| record.observables.vorticity[k].abs() > 0.9)
    });
    assert!(nucleated, "no vortex crossed the strip");

    // Moving vortices dissipate: a voltage builds up along the strip.
    let last = solution.final_state().unwrap();
    let source = mesh.terminal("source").unwrap().vertices[0];
    let drain = mesh.terminal("drain").unwrap().vertices[0];
    assert!(last.mu[source] > last.mu[drain]);
}

#[test]
fn tighter_tolerance_takes_more_steps() {
    let mesh = disk(0.6);
    let steps = |tolerance: f64| {
        let options = SolverOptions {
            error_tolerance: tolerance,
            dt_max: 1.0,
            save_cadence: SaveCadence::EveryTime(10.0),
            ..SolverOptions::new(10.0)
        };
        let mut runner =
            Runner::new(mesh.clone(), TdglParameters::default(), BoundaryConditions::new(), options)
                .unwrap();
        runner
            .run(FieldState::uniform(&mesh, Complex64::new(0.3, 0.0)))
            .unwrap()
            .stats()
            .accepted_steps
    };
    let coarse = steps(1e-2);
    let fine = steps(1e-3);
    assert!(fine > coarse, "{fine} <= {coarse}");
}

#[test]
fn disk_in_a_weak_field_screens_the_flux() {
    let mesh = disk(0.5);
    let bz = 0.1;
    let mut runner = Runner::new(
        mesh.clone(),
        TdglParameters::default(),
        BoundaryConditions::new(),
        SolverOptions::new(2.0),
    )
    .unwrap()
    .with_vector_potential(Arc::new(UniformField { bz }));
    let solution = runner
        .run(FieldState::uniform(&mesh, Complex64::new(1.0, 0.0)))
        .unwrap();

    let loop_ = Polygon::circle("loop", 2.0, 32, [0.0, 0.0]);
    let fluxoid = solution.polygon_fluxoid(2.0, &loop_).unwrap();
    // Flux through a radius-2 loop, in flux quanta, up to the edge-chain outline.
    assert!((fluxoid.flux_part - bz * 4.0 / 2.0).abs() < 0.06, "{fluxoid:?}");
    // No vortex inside: the screening current cancels the applied flux.
    assert!(fluxoid.total().abs() < 1e-6, "{fluxoid:?}");
    assert!(fluxoid.supercurrent_part < 0.0);
}
