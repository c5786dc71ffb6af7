pub mod generator;
pub mod geometry;
pub mod mesh;

pub use generator::{generate_mesh, MeshOptions};
