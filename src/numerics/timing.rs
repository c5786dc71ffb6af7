//! Per-thread wall-clock accounting of the phases of a run, compiled in with
//! the `timing` feature. Without the feature the wrappers just call through.

use std::time::Duration;

#[cfg(feature = "timing")]
use std::cell::RefCell;

/// The phases of a time step that are timed separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Assembly,
    LinearSolve,
    Observables,
}

impl Phase {
    const ALL: [Phase; 3] = [Phase::Assembly, Phase::LinearSolve, Phase::Observables];

    fn label(self) -> &'static str {
        match self {
            Phase::Assembly => "system assembly",
            Phase::LinearSolve => "linear solves",
            Phase::Observables => "observables",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTotal {
    pub calls: usize,
    pub total: Duration,
}

impl PhaseTotal {
    pub fn mean(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total / self.calls as u32
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimingStats {
    pub phases: [PhaseTotal; 3],
    pub wall_time: Duration,
}

impl TimingStats {
    pub fn phase(&self, phase: Phase) -> PhaseTotal {
        self.phases[phase.slot()]
    }

    /// Time not attributed to any phase (bookkeeping, clamps, I/O hand-off).
    pub fn unaccounted(&self) -> Duration {
        let accounted: Duration = self.phases.iter().map(|p| p.total).sum();
        self.wall_time.saturating_sub(accounted)
    }

    pub fn log_summary(&self) {
        if self.phases.iter().all(|p| p.calls == 0) {
            return;
        }
        log::info!("timing over {:.3}s of wall time", self.wall_time.as_secs_f64());
        for phase in Phase::ALL {
            let t = self.phase(phase);
            log::info!(
                "  {:<16} {:>10.3}ms in {:>7} calls (mean {:.3}ms)",
                phase.label(),
                t.total.as_secs_f64() * 1e3,
                t.calls,
                t.mean().as_secs_f64() * 1e3
            );
        }
        log::info!(
            "  {:<16} {:>10.3}ms",
            "other",
            self.unaccounted().as_secs_f64() * 1e3
        );
    }
}

#[cfg(feature = "timing")]
thread_local! {
    static TIMING: RefCell<TimingStats> = RefCell::new(TimingStats::default());
}

#[cfg(feature = "timing")]
pub fn reset_timing() {
    TIMING.with(|t| *t.borrow_mut() = TimingStats::default());
}

#[cfg(not(feature = "timing"))]
pub fn reset_timing() {}

#[cfg(feature = "timing")]
pub fn timed<F, R>(phase: Phase, f: F) -> R
where
    F: FnOnce() -> R,
{
    let start = std::time::Instant::now();
    let result = f();
    let elapsed = start.elapsed();
    TIMING.with(|t| {
        let mut stats = t.borrow_mut();
        let slot = &mut stats.phases[phase.slot()];
        slot.calls += 1;
        slot.total += elapsed;
    });
    result
}

#[cfg(not(feature = "timing"))]
#[inline]
pub fn timed<F, R>(_phase: Phase, f: F) -> R
where
    F: FnOnce() -> R,
{
    f()
}

pub fn record_assembly<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    timed(Phase::Assembly, f)
}

pub fn record_linear_solve<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    timed(Phase::LinearSolve, f)
}

#[cfg(feature = "timing")]
pub fn finalize_timing(wall_time: Duration) -> TimingStats {
    TIMING.with(|t| {
        let mut stats = t.borrow_mut();
        stats.wall_time = wall_time;
        stats.clone()
    })
}

#[cfg(not(feature = "timing"))]
pub fn finalize_timing(wall_time: Duration) -> TimingStats {
    TimingStats {
        wall_time,
        ..TimingStats::default()
    }
}

pub fn finalize_and_print(wall_time: Duration) {
    finalize_timing(wall_time).log_summary();
}
