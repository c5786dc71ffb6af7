use std::fs;
use std::sync::Arc;

use log::{error, info};
use num_complex::Complex64;

use tdgl_rs::discretization::{generate_mesh, MeshOptions};
use tdgl_rs::physics::Parameter;
use tdgl_rs::processing::csv_writer;
use tdgl_rs::processing::summary::RunSummary;
use tdgl_rs::{
    BoundaryConditions, Domain, FieldState, MeasurementPath, Polygon, Runner, SaveCadence,
    SolutionFile, SolverOptions, TdglParameters,
};

const OUTPUT_DIR: &str = "output/main";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    fs::create_dir_all(OUTPUT_DIR).expect("Failed to create output directory");

    // 16 x 6 strip with current leads on both ends and a weak spot on the upper edge.
    let (length, width) = (16.0, 6.0);
    let domain = Domain::new(Polygon::rectangle("film", length, width, [0.0, 0.0]), 0.6)
        .with_terminal(Polygon::rectangle("source", 0.4, width + 0.4, [-length / 2.0, 0.0]))
        .with_terminal(Polygon::rectangle("drain", 0.4, width + 0.4, [length / 2.0, 0.0]))
        .with_probe_points([-5.0, 0.0], [5.0, 0.0]);
    let mesh = Arc::new(generate_mesh(&domain, &MeshOptions::default()).expect("Mesh generation failed"));
    info!(
        "mesh: {} vertices, {} cells, min angle {:.1} deg",
        mesh.num_vertices(),
        mesh.num_cells(),
        mesh.min_angle_deg()
    );

    let params = TdglParameters::default().with_epsilon(Parameter::new(move |r: glam::DVec2| {
        if (r - glam::DVec2::new(0.0, width / 2.0)).length() < 1.0 {
            0.5
        } else {
            1.0
        }
    }));

    let current = 0.5 * width;
    let bcs = BoundaryConditions::new()
        .with_terminal("source", current)
        .with_terminal("drain", -current);

    let options = SolverOptions {
        save_cadence: SaveCadence::EveryTime(2.0),
        dt_max: 0.1,
        ..SolverOptions::new(100.0)
    };

    let solution_path = format!("{OUTPUT_DIR}/solution.jsonl");
    let mut runner = Runner::new(mesh.clone(), params.clone(), bcs, options)
        .expect("Invalid simulation setup")
        .with_paths(vec![MeasurementPath::line("middle", [0.0, -width], [0.0, width])])
        .with_output(&solution_path);

    let initial = FieldState::uniform(&mesh, Complex64::new(1.0, 0.0));
    let solution = match runner.run(initial) {
        Ok(solution) => solution,
        Err(aborted) => {
            error!("{aborted}");
            *aborted.solution
        }
    };

    let summary = RunSummary::from_solution(&mesh, &params, &solution);
    summary
        .write_to_file(format!("{OUTPUT_DIR}/simulation_summary.txt"))
        .expect("Failed to write summary");
    summary
        .write_json(format!("{OUTPUT_DIR}/simulation_summary.json"))
        .expect("Failed to write summary");
    summary.print_to_console();

    // Read the streamed file back the way a separate viewer process would.
    let file = SolutionFile::open(&solution_path).expect("Failed to read solution file");
    let header = file.header();
    let path_names: Vec<String> = header.paths.iter().map(|p| p.name.clone()).collect();
    csv_writer::write_time_series(
        format!("{OUTPUT_DIR}/time_series.csv"),
        file.records(),
        &header.terminals,
        &path_names,
    )
    .expect("Failed to write time series");

    if let Some(last) = file.record(file.len().saturating_sub(1)) {
        csv_writer::write_vertex_fields(format!("{OUTPUT_DIR}/vertices.csv"), file.mesh_data(), last)
            .expect("Failed to write vertex fields");
        csv_writer::write_edge_fields(format!("{OUTPUT_DIR}/edges.csv"), file.mesh_data(), last)
            .expect("Failed to write edge fields");
    }

    println!("Results saved to {OUTPUT_DIR}/");
}
