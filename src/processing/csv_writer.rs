use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::discretization::mesh::MeshData;
use crate::processing::recorder::SolutionRecord;

/// Write columns of data under the given headers
pub fn write_csv<P: AsRef<Path>>(path: P, headers: &[&str], data: &[Vec<f64>]) -> io::Result<()> {
    if !headers.is_empty() && !data.is_empty() && headers.len() != data.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "Headers count ({}) doesn't match data columns ({})",
                headers.len(),
                data.len()
            ),
        ));
    }

    let mut file = BufWriter::new(File::create(path)?);

    writeln!(file, "{}", headers.join(","))?;

    let n_rows = data.iter().map(|col| col.len()).max().unwrap_or(0);

    for i in 0..n_rows {
        let row: Vec<String> = data
            .iter()
            .map(|col| col.get(i).map(|v| format!("{v:.15e}")).unwrap_or_default())
            .collect();
        writeln!(file, "{}", row.join(","))?;
    }

    file.flush()
}

fn check_len(field: &str, found: usize, expected: usize) -> io::Result<()> {
    if found == expected {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{field} has {found} entries, the mesh has {expected}"),
        ))
    }
}

/// Vertex fields of one record: position, ψ, |ψ| and μ.
pub fn write_vertex_fields<P: AsRef<Path>>(
    path: P,
    mesh: &MeshData,
    record: &SolutionRecord,
) -> io::Result<()> {
    let snapshot = &record.snapshot;
    check_len("psi", snapshot.psi.len(), mesh.vertices.len())?;
    check_len("mu", snapshot.mu.len(), mesh.vertices.len())?;
    write_csv(
        path,
        &["x", "y", "psi_re", "psi_im", "abs_psi", "mu"],
        &[
            mesh.vertices.iter().map(|v| v[0]).collect(),
            mesh.vertices.iter().map(|v| v[1]).collect(),
            snapshot.psi.iter().map(|p| p.re).collect(),
            snapshot.psi.iter().map(|p| p.im).collect(),
            snapshot.psi.iter().map(|p| p.norm()).collect(),
            snapshot.mu.clone(),
        ],
    )
}

/// Edge fields of one record at the edge midpoints.
pub fn write_edge_fields<P: AsRef<Path>>(
    path: P,
    mesh: &MeshData,
    record: &SolutionRecord,
) -> io::Result<()> {
    let obs = &record.observables;
    check_len("supercurrent", obs.supercurrent.len(), mesh.edges.len())?;
    check_len("normal_current", obs.normal_current.len(), mesh.edges.len())?;
    let midpoint = |e: &[usize; 2], axis: usize| {
        0.5 * (mesh.vertices[e[0]][axis] + mesh.vertices[e[1]][axis])
    };
    write_csv(
        path,
        &["x", "y", "supercurrent", "normal_current"],
        &[
            mesh.edges.iter().map(|e| midpoint(e, 0)).collect(),
            mesh.edges.iter().map(|e| midpoint(e, 1)).collect(),
            obs.supercurrent.clone(),
            obs.normal_current.clone(),
        ],
    )
}

/// One row per record: time, |ψ| statistics, net vorticity, then one column per
/// terminal current, probe voltage, probe phase difference and path current.
pub fn write_time_series<P: AsRef<Path>>(
    path: P,
    records: &[SolutionRecord],
    terminal_names: &[String],
    path_names: &[String],
) -> io::Result<()> {
    let probes = records
        .first()
        .map(|r| r.observables.probe_voltages.len())
        .unwrap_or(0);

    let mut headers: Vec<String> = ["time", "max_abs_psi", "mean_abs_psi", "vorticity"]
        .iter()
        .map(|h| h.to_string())
        .collect();
    headers.extend(terminal_names.iter().map(|n| format!("I_{n}")));
    headers.extend((0..probes).map(|i| format!("V_{i}")));
    headers.extend((0..probes).map(|i| format!("dtheta_{i}")));
    headers.extend(path_names.iter().map(|n| format!("I_path_{n}")));

    let column = |f: &dyn Fn(&SolutionRecord) -> f64| records.iter().map(f).collect::<Vec<_>>();
    let mut data = vec![
        column(&|r| r.time),
        column(&|r| r.observables.max_abs_psi),
        column(&|r| r.observables.mean_abs_psi),
        column(&|r| r.observables.net_winding()),
    ];
    for i in 0..terminal_names.len() {
        data.push(column(&|r| r.snapshot.terminal_currents.get(i).copied().unwrap_or(f64::NAN)));
    }
    for i in 0..probes {
        data.push(column(&|r| r.observables.probe_voltages.get(i).copied().unwrap_or(f64::NAN)));
    }
    for i in 0..probes {
        data.push(column(&|r| r.observables.probe_phases.get(i).copied().unwrap_or(f64::NAN)));
    }
    for i in 0..path_names.len() {
        data.push(column(&|r| r.observables.path_currents.get(i).copied().unwrap_or(f64::NAN)));
    }

    let headers: Vec<&str> = headers.iter().map(String::as_str).collect();
    write_csv(path, &headers, &data)
}
