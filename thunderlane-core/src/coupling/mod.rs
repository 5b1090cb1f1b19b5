//! Directional α-gain couplings between lanes and the adaptive tuning loop.
//!
//! Mechanism lives here: bound checks, the tuning audit trail and the trend
//! classifier. The policy that proposes new gains is injected through
//! [`AlphaPolicy`].

/// Coupling record, bounds and state machine.
pub mod model;
/// Registry enforcing one coupling per lane pair and ruleset.
pub mod registry;
/// Periodic measure-then-tune loop.
pub mod tuner;

pub use model::{
    AdaptationBounds, CouplingEvent, CouplingFunction, CouplingStatus, CouplingType,
    CrossLaneCoupling, NewCoupling, PerformanceSample, PerformanceTrend, SpatialKernel,
    TuningRecord, transition,
};
pub use registry::CouplingRegistry;
pub use tuner::{AdaptiveTuner, AlphaPolicy, ProportionalPolicy, TuningReport};
