//! Finite-volume solver for the time-dependent Ginzburg-Landau equations on
//! two-dimensional superconducting films.
//!
//! The pipeline is: [`discretization::geometry::Domain`] →
//! [`discretization::mesh::Mesh`] → [`physics::operators::DiscreteOperators`] →
//! [`numerics::stepper::TimeStepper`] → [`processing::recorder::SolutionRecorder`],
//! driven by [`runner::Runner`].

pub mod config;
pub mod discretization;
pub mod numerics;
pub mod physics;
pub mod processing;
pub mod runner;

pub use config::{ConfigError, SaveCadence, SolverOptions, SteadyStateCriterion};
pub use discretization::geometry::{Domain, Polygon};
pub use discretization::mesh::{Mesh, MeshGenerationError};
pub use physics::bc::BoundaryConditions;
pub use physics::state::FieldState;
pub use physics::TdglParameters;
pub use processing::{MeasurementPath, SolutionFile};
pub use runner::{CancelToken, RunAbortedError, Runner, SetupError, Solution, Termination};
