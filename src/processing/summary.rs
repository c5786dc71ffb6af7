use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;

use crate::discretization::mesh::Mesh;
use crate::physics::{ParameterSummary, TdglParameters};
use crate::runner::Solution;

#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    // Mesh info
    pub num_vertices: usize,
    pub num_edges: usize,
    pub num_cells: usize,
    pub total_area: f64,
    pub min_angle_deg: f64,
    pub min_edge_length: f64,
    pub max_edge_length: f64,

    // Physics info
    pub parameters: ParameterSummary,
    pub terminals: Vec<String>,

    // Run info
    pub termination: String,
    pub final_time: f64,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub linear_iterations: usize,
    pub min_dt: f64,
    pub max_dt: f64,
    pub wall_time_s: f64,
    pub records: usize,

    // Final observables
    pub final_max_abs_psi: Option<f64>,
    pub final_mean_abs_psi: Option<f64>,
    pub final_vorticity: Option<f64>,
    pub final_probe_voltages: Vec<f64>,
    pub final_probe_phases: Vec<f64>,
}

impl RunSummary {
    pub fn from_solution(mesh: &Mesh, params: &TdglParameters, solution: &Solution) -> Self {
        let (min_edge, max_edge) = mesh.edge_length_range();
        let stats = solution.stats();
        let last = solution.records().last();
        Self {
            num_vertices: mesh.num_vertices(),
            num_edges: mesh.num_edges(),
            num_cells: mesh.num_cells(),
            total_area: mesh.total_area(),
            min_angle_deg: mesh.min_angle_deg(),
            min_edge_length: min_edge,
            max_edge_length: max_edge,
            parameters: params.summary(),
            terminals: mesh.terminals.iter().map(|t| t.name.clone()).collect(),
            termination: solution
                .termination()
                .map(|t| format!("{t:?}"))
                .unwrap_or_else(|| "Aborted".into()),
            final_time: stats.final_time,
            accepted_steps: stats.accepted_steps,
            rejected_steps: stats.rejected_steps,
            linear_iterations: stats.linear_iterations,
            min_dt: stats.min_dt,
            max_dt: stats.max_dt,
            wall_time_s: stats.wall_time.as_secs_f64(),
            records: solution.len(),
            final_max_abs_psi: last.map(|r| r.observables.max_abs_psi),
            final_mean_abs_psi: last.map(|r| r.observables.mean_abs_psi),
            final_vorticity: last.map(|r| r.observables.net_winding()),
            final_probe_voltages: last
                .map(|r| r.observables.probe_voltages.clone())
                .unwrap_or_default(),
            final_probe_phases: last
                .map(|r| r.observables.probe_phases.clone())
                .unwrap_or_default(),
        }
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::from)
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;

        writeln!(file, "{}", "=".repeat(60))?;
        writeln!(file, "TDGL SIMULATION SUMMARY")?;
        writeln!(file, "{}", "=".repeat(60))?;
        writeln!(file)?;

        writeln!(file, "MESH STATISTICS")?;
        writeln!(file, "{}", "-".repeat(60))?;
        writeln!(file, "Number of vertices:  {}", self.num_vertices)?;
        writeln!(file, "Number of edges:     {}", self.num_edges)?;
        writeln!(file, "Number of cells:     {}", self.num_cells)?;
        writeln!(file, "Film area:           {:.6e}", self.total_area)?;
        writeln!(file, "Min angle:           {:.2} deg", self.min_angle_deg)?;
        writeln!(
            file,
            "Edge lengths:        {:.4e} to {:.4e}",
            self.min_edge_length, self.max_edge_length
        )?;
        writeln!(file)?;

        writeln!(file, "PARAMETERS")?;
        writeln!(file, "{}", "-".repeat(60))?;
        writeln!(file, "u:                   {}", self.parameters.u)?;
        writeln!(file, "gamma:               {}", self.parameters.gamma)?;
        match self.parameters.epsilon {
            Some(eps) => writeln!(file, "epsilon:             {eps}")?,
            None => writeln!(file, "epsilon:             position dependent")?,
        }
        if !self.terminals.is_empty() {
            writeln!(file, "Terminals:           {}", self.terminals.join(", "))?;
        }
        writeln!(file)?;

        writeln!(file, "SOLVER PERFORMANCE")?;
        writeln!(file, "{}", "-".repeat(60))?;
        writeln!(file, "Termination:         {}", self.termination)?;
        writeln!(file, "Final time:          {:.6e}", self.final_time)?;
        writeln!(file, "Accepted steps:      {}", self.accepted_steps)?;
        writeln!(file, "Rejected steps:      {}", self.rejected_steps)?;
        writeln!(file, "Krylov iterations:   {}", self.linear_iterations)?;
        writeln!(
            file,
            "Step sizes:          {:.3e} to {:.3e}",
            self.min_dt, self.max_dt
        )?;
        writeln!(file, "Wall time:           {:.3} s", self.wall_time_s)?;
        writeln!(file, "Records:             {}", self.records)?;
        writeln!(file)?;

        if let (Some(max), Some(mean)) = (self.final_max_abs_psi, self.final_mean_abs_psi) {
            writeln!(file, "FINAL STATE")?;
            writeln!(file, "{}", "-".repeat(60))?;
            writeln!(file, "max |psi|:           {max:.6}")?;
            writeln!(file, "mean |psi|:          {mean:.6}")?;
            if let Some(v) = self.final_vorticity {
                writeln!(file, "Net vorticity:       {v:.3}")?;
            }
            for (i, v) in self.final_probe_voltages.iter().enumerate() {
                writeln!(file, "Probe {i} voltage:     {v:.6e}")?;
            }
            for (i, phi) in self.final_probe_phases.iter().enumerate() {
                writeln!(file, "Probe {i} phase diff:  {phi:.6}")?;
            }
            writeln!(file)?;
        }

        writeln!(file, "{}", "=".repeat(60))?;

        Ok(())
    }

    pub fn print_to_console(&self) {
        println!("\n{}", "=".repeat(60));
        println!("SIMULATION SUMMARY");
        println!("{}", "=".repeat(60));
        println!(
            "Mesh:          {} vertices, {} cells",
            self.num_vertices, self.num_cells
        );
        println!(
            "Steps:         {} accepted, {} rejected ({})",
            self.accepted_steps, self.rejected_steps, self.termination
        );
        println!("Final time:    {:.4e}", self.final_time);
        if let Some(max) = self.final_max_abs_psi {
            println!("max |psi|:     {max:.4}");
        }
        println!("{}\n", "=".repeat(60));
    }
}
