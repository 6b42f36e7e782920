//! Hyperparameter schedules keyed by optimization round.
//!
//! A schedule is either a constant or an ordered list of `(iteration, value)`
//! breakpoints with an interpolation mode. Breakpoints are sorted once when the
//! schedule is built and never change afterwards; queries outside the
//! breakpoint range clamp to the nearest end.
//!
//! JSON form:
//!
//! ```text
//! {"constant": 0.1}
//! {"continuous": [{"iteration": 0, "value": 0.5}, {"iteration": 10, "value": 0.1}]}
//! {"step": [{"iteration": 0, "value": 1.0}, {"iteration": 5, "value": 0.0}]}
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Real;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("schedule needs at least one breakpoint")]
    Empty,
    #[error("breakpoint value at iteration {iteration} is not finite")]
    NonFinite { iteration: i32 },
}

/// How values between two breakpoints are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    /// Hold the earlier breakpoint's value.
    Step,
    /// Linear interpolation between the surrounding breakpoints.
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub iteration: i32,
    pub value: Real,
}

impl From<(i32, Real)> for Breakpoint {
    fn from((iteration, value): (i32, Real)) -> Self {
        Self { iteration, value }
    }
}

/// Breakpoints of a non-constant schedule, sorted by iteration.
///
/// Only built through [`Schedule::varying`] and friends; there is no way to
/// change the breakpoints afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct VaryingSchedule {
    interpolation: Interpolation,
    breakpoints: Vec<Breakpoint>,
}

impl VaryingSchedule {
    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    fn value(&self, iteration: i32) -> Real {
        let breakpoints = self.breakpoints.as_slice();
        // Number of breakpoints at or before `iteration`.
        let after = breakpoints.partition_point(|b| b.iteration <= iteration);
        if after == 0 {
            return breakpoints[0].value;
        }
        if after == breakpoints.len() {
            return breakpoints[after - 1].value;
        }

        let from = &breakpoints[after - 1];
        let to = &breakpoints[after];
        match self.interpolation {
            Interpolation::Step => from.value,
            Interpolation::Continuous => {
                // widened: breakpoints may span the whole i32 range
                let t = (i64::from(iteration) - i64::from(from.iteration)) as Real
                    / (i64::from(to.iteration) - i64::from(from.iteration)) as Real;
                from.value + (to.value - from.value) * t
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ScheduleRepr", into = "ScheduleRepr")]
pub enum Schedule {
    Constant(Real),
    Varying(VaryingSchedule),
}

impl Schedule {
    pub fn constant(value: Real) -> Self {
        Schedule::Constant(value)
    }

    /// Piecewise-constant schedule.
    pub fn step<I, B>(breakpoints: I) -> Result<Self, ScheduleError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Breakpoint>,
    {
        Self::varying(Interpolation::Step, breakpoints)
    }

    /// Piecewise-linear schedule.
    pub fn continuous<I, B>(breakpoints: I) -> Result<Self, ScheduleError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Breakpoint>,
    {
        Self::varying(Interpolation::Continuous, breakpoints)
    }

    pub fn varying<I, B>(interpolation: Interpolation, breakpoints: I) -> Result<Self, ScheduleError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Breakpoint>,
    {
        let mut breakpoints: Vec<Breakpoint> = breakpoints.into_iter().map(Into::into).collect();
        if breakpoints.is_empty() {
            return Err(ScheduleError::Empty);
        }
        if let Some(b) = breakpoints.iter().find(|b| !b.value.is_finite()) {
            return Err(ScheduleError::NonFinite {
                iteration: b.iteration,
            });
        }
        breakpoints.sort_by_key(|b| b.iteration);
        Ok(Schedule::Varying(VaryingSchedule {
            interpolation,
            breakpoints,
        }))
    }

    pub fn interpolation(&self) -> Option<Interpolation> {
        match self {
            Schedule::Constant(_) => None,
            Schedule::Varying(v) => Some(v.interpolation),
        }
    }

    /// Value at optimization round `iteration`.
    pub fn value(&self, iteration: i32) -> Real {
        match self {
            Schedule::Constant(v) => *v,
            Schedule::Varying(v) => v.value(iteration),
        }
    }

    /// Shorthand for [`Schedule::value`] with a round counter.
    pub fn at(&self, iteration: usize) -> Real {
        self.value(i32::try_from(iteration).unwrap_or(i32::MAX))
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Constant(0.0)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ScheduleRepr {
    Constant(Real),
    Step(Vec<Breakpoint>),
    Continuous(Vec<Breakpoint>),
}

impl TryFrom<ScheduleRepr> for Schedule {
    type Error = ScheduleError;

    fn try_from(repr: ScheduleRepr) -> Result<Self, Self::Error> {
        match repr {
            ScheduleRepr::Constant(v) => Ok(Schedule::Constant(v)),
            ScheduleRepr::Step(b) => Schedule::step(b),
            ScheduleRepr::Continuous(b) => Schedule::continuous(b),
        }
    }
}

impl From<Schedule> for ScheduleRepr {
    fn from(schedule: Schedule) -> Self {
        match schedule {
            Schedule::Constant(v) => ScheduleRepr::Constant(v),
            Schedule::Varying(v) => match v.interpolation {
                Interpolation::Step => ScheduleRepr::Step(v.breakpoints),
                Interpolation::Continuous => ScheduleRepr::Continuous(v.breakpoints),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_ignores_iteration() {
        let s = Schedule::constant(2.5);
        for i in [-100, -1, 0, 7, 1_000] {
            assert_eq!(s.value(i), 2.5);
        }
    }

    #[test]
    fn continuous_interpolates_between_breakpoints() {
        let s = Schedule::continuous([(0, 0.5), (10, 0.1)]).unwrap();
        assert_eq!(s.value(0), 0.5);
        assert_eq!(s.value(10), 0.1);
        assert!((s.value(5) - 0.3).abs() < 1e-12);
        assert!((s.value(1) - 0.46).abs() < 1e-12);
        // clamped outside the range
        assert_eq!(s.value(-3), 0.5);
        assert_eq!(s.value(42), 0.1);
    }

    #[test]
    fn step_holds_earlier_value() {
        let s = Schedule::step([(5, 0.0), (0, 1.0)]).unwrap();
        for i in 0..5 {
            assert_eq!(s.value(i), 1.0, "iteration {i}");
        }
        assert_eq!(s.value(5), 0.0);
        assert_eq!(s.value(6), 0.0);
    }

    #[test]
    fn three_breakpoints_pick_the_enclosing_pair() {
        let s = Schedule::continuous([(0, 0.0), (10, 10.0), (20, 0.0)]).unwrap();
        assert!((s.value(5) - 5.0).abs() < 1e-12);
        assert!((s.value(15) - 5.0).abs() < 1e-12);
        assert_eq!(s.at(10), 10.0);
    }

    #[test]
    fn breakpoints_are_sorted_and_read_only() {
        let s = Schedule::continuous([(10, 100.0), (0, 1000.0)]).unwrap();
        let Schedule::Varying(v) = &s else {
            panic!("expected a varying schedule");
        };
        let iterations: Vec<_> = v.breakpoints().iter().map(|b| b.iteration).collect();
        assert_eq!(iterations, [0, 10]);
        assert_eq!(s.interpolation(), Some(Interpolation::Continuous));
        assert_eq!(s.at(0), 1000.0);
        assert_eq!(s.at(5), 550.0);
        assert_eq!(s.at(10), 100.0);
    }

    #[test]
    fn full_range_breakpoints_do_not_overflow() {
        let s = Schedule::continuous([(i32::MIN, 0.0), (i32::MAX, 1.0)]).unwrap();
        let mid = s.value(5);
        assert!((mid - 0.5).abs() < 1e-6, "got {mid}");
        assert_eq!(s.value(i32::MIN), 0.0);
        assert_eq!(s.value(i32::MAX), 1.0);
    }

    #[test]
    fn rejects_empty_breakpoints() {
        let empty: Vec<(i32, Real)> = Vec::new();
        assert_eq!(Schedule::step(empty), Err(ScheduleError::Empty));
    }

    #[test]
    fn json_round_trip_and_validation() {
        let s = Schedule::continuous([(10, 100.0), (0, 1000.0)]).unwrap();
        let json = serde_json::to_string(&s).unwrap();
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);

        let c: Schedule = serde_json::from_str(r#"{"constant": 0.1}"#).unwrap();
        assert_eq!(c, Schedule::constant(0.1));

        let bad = serde_json::from_str::<Schedule>(r#"{"step": []}"#);
        assert!(bad.is_err());
    }
}
