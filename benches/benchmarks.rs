use std::sync::Arc;

use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use num_complex::Complex64;
use tdgl_rs::discretization::{generate_mesh, MeshOptions};
use tdgl_rs::numerics::linear::KrylovSolver;
use tdgl_rs::numerics::stepper::TimeStepper;
use tdgl_rs::physics::bc::BoundaryConditions;
use tdgl_rs::physics::operators::DiscreteOperators;
use tdgl_rs::physics::tdgl::TdglModel;
use tdgl_rs::physics::{NoField, TdglParameters};
use tdgl_rs::{Domain, FieldState, Mesh, Polygon, SolverOptions};

fn edge_lengths() -> Vec<f64> {
    vec![0.5, 0.25]
}

fn strip(h: f64) -> Domain {
    Domain::new(Polygon::rectangle("film", 12.0, 4.0, [0.0, 0.0]), h)
        .with_terminal(Polygon::rectangle("source", 0.4, 4.4, [-6.0, 0.0]))
        .with_terminal(Polygon::rectangle("drain", 0.4, 4.4, [6.0, 0.0]))
}

fn strip_model(mesh: &Arc<Mesh>) -> TdglModel {
    let bcs = BoundaryConditions::new()
        .with_terminal("source", 0.5)
        .with_terminal("drain", -0.5);
    TdglModel::new(
        mesh.clone(),
        Arc::new(DiscreteOperators::new(mesh)),
        TdglParameters::default(),
        bcs,
        Arc::new(NoField),
        Some(0.0),
    )
    .unwrap()
}

fn bench_mesh_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("mesh_generation");
    for &h in &edge_lengths() {
        let domain = strip(h);
        group.bench_with_input(BenchmarkId::from_parameter(h), &h, |b, &_| {
            b.iter(|| {
                let mesh = generate_mesh(&domain, &MeshOptions::default()).unwrap();
                std::hint::black_box(mesh.num_cells());
            });
        });
    }
    group.finish();
}

fn bench_operator_assembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("operator_assembly");
    for &h in &edge_lengths() {
        let mesh = generate_mesh(&strip(h), &MeshOptions::default()).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(mesh.num_vertices()), &h, |b, &_| {
            b.iter(|| {
                let ops = DiscreteOperators::new(&mesh);
                std::hint::black_box(ops.laplacian.nnz());
            });
        });
    }
    group.finish();
}

fn bench_psi_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("psi_solve");
    for &h in &edge_lengths() {
        let mesh = Arc::new(generate_mesh(&strip(h), &MeshOptions::default()).unwrap());
        let model = strip_model(&mesh);
        let state = model.prepare(FieldState::uniform(&mesh, Complex64::new(0.8, 0.0)));
        let (a_edge, _) = model.edge_potential(0.01);
        let (matrix, rhs) = model.assemble_psi(&state, &a_edge, 0.01);
        let solver = KrylovSolver::new(1e-10, 5000);
        group.bench_with_input(BenchmarkId::from_parameter(mesh.num_vertices()), &h, |b, &_| {
            b.iter(|| {
                let (x, _) = solver.solve(&matrix, &rhs, None).unwrap();
                std::hint::black_box(x);
            });
        });
    }
    group.finish();
}

fn bench_adaptive_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("adaptive_step");
    for &h in &edge_lengths() {
        let mesh = Arc::new(generate_mesh(&strip(h), &MeshOptions::default()).unwrap());
        let model = strip_model(&mesh);
        let state = model.prepare(FieldState::uniform(&mesh, Complex64::new(0.8, 0.0)));
        let stepper = TimeStepper::new(model, &SolverOptions::new(1.0));
        group.bench_with_input(BenchmarkId::from_parameter(mesh.num_vertices()), &h, |b, &_| {
            b.iter_batched(
                || state.clone(),
                |s| std::hint::black_box(stepper.attempt(&s, 0.01)),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_mesh_generation,
    bench_operator_assembly,
    bench_psi_solve,
    bench_adaptive_step
);
criterion_main!(benches);
