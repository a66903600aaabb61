//! PID controller for closed-loop setpoint corrections.
//!
//! The controller is deterministic: it never samples a clock. The caller
//! passes the elapsed time of each step, so the same sequence of inputs and
//! time steps always yields the same sequence of outputs.
//!
//! Conventions:
//! - `error = target - input`
//! - the derivative acts on the measurement, not on the error, so a target
//!   change does not kick the output
//! - the integral term is clamped to the output limits (anti-windup)

use serde::{Deserialize, Serialize};

/// Contribution of each term to the last output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PidTerms {
    /// Proportional term
    pub p_term: f64,
    /// Integral term
    pub i_term: f64,
    /// Derivative term
    pub d_term: f64,
    /// Clamped sum
    pub output: f64,
}

/// Proportional-integral-derivative controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,
    target: f64,
    limits: (f64, f64),
    integral: f64,
    last_input: Option<f64>,
    last_terms: PidTerms,
}

impl Pid {
    /// Creates a controller with unbounded output.
    pub fn new(kp: f64, ki: f64, kd: f64, target: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            target,
            limits: (f64::NEG_INFINITY, f64::INFINITY),
            integral: 0.0,
            last_input: None,
            last_terms: PidTerms::default(),
        }
    }

    /// Clamps the output (and the integral) to `[min, max]`.
    ///
    /// Swapped bounds are reordered.
    pub fn with_limits(mut self, min: f64, max: f64) -> Self {
        self.limits = if min <= max { (min, max) } else { (max, min) };
        self
    }

    /// Symmetric output limit `[-limit, limit]`.
    pub fn with_symmetric_limit(self, limit: f64) -> Self {
        let limit = limit.abs();
        self.with_limits(-limit, limit)
    }

    /// Current target.
    pub fn target(&self) -> f64 {
        self.target
    }

    /// Changes the target; accumulated state is kept.
    pub fn set_target(&mut self, target: f64) {
        self.target = target;
    }

    /// Gains as `(kp, ki, kd)`.
    pub fn gains(&self) -> (f64, f64, f64) {
        (self.kp, self.ki, self.kd)
    }

    /// Output limits as `(min, max)`.
    pub fn limits(&self) -> (f64, f64) {
        self.limits
    }

    /// Terms of the last update.
    pub fn last_terms(&self) -> PidTerms {
        self.last_terms
    }

    /// Clears the integral and the derivative history.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_input = None;
        self.last_terms = PidTerms::default();
    }

    /// Advances the controller by `dt` seconds with a new measurement.
    ///
    /// A non-positive `dt` skips the integral and derivative contributions
    /// for this step. Non-finite inputs leave the state untouched and return
    /// the previous output.
    pub fn update(&mut self, input: f64, dt: f64) -> f64 {
        if !input.is_finite() {
            return self.last_terms.output;
        }
        let (min, max) = self.limits;
        let error = self.target - input;

        let p_term = self.kp * error;

        if dt > 0.0 {
            self.integral = (self.integral + self.ki * error * dt).clamp(min, max);
        }

        let d_term = match self.last_input {
            Some(last) if dt > 0.0 => -self.kd * (input - last) / dt,
            _ => 0.0,
        };
        self.last_input = Some(input);

        let output = (p_term + self.integral + d_term).clamp(min, max);
        self.last_terms = PidTerms {
            p_term,
            i_term: self.integral,
            d_term,
            output,
        };
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proportional_only_converges_to_gain_times_error() {
        let mut pid = Pid::new(0.2, 0.0, 0.0, 20.0).with_symmetric_limit(6.0);
        let mut output = 0.0;
        for _ in 0..10 {
            output = pid.update(18.0, 60.0);
        }
        assert!((output - 0.4).abs() < 1e-12);
    }

    #[test]
    fn output_is_clamped() {
        let mut pid = Pid::new(0.2, 0.0, 0.0, 100.0).with_symmetric_limit(6.0);
        assert_eq!(pid.update(0.0, 1.0), 6.0);

        pid.set_target(-100.0);
        assert_eq!(pid.update(0.0, 1.0), -6.0);
    }

    #[test]
    fn derivative_acts_on_measurement() {
        let mut pid = Pid::new(0.0, 0.0, 50.0, 20.0).with_symmetric_limit(6.0);
        // First step has no history.
        assert_eq!(pid.update(20.0, 60.0), 0.0);
        // Rising measurement pushes the output down.
        let out = pid.update(20.6, 60.0);
        assert!((out - (-0.5)).abs() < 1e-9);
        assert!((pid.last_terms().d_term - (-0.5)).abs() < 1e-9);
    }

    #[test]
    fn integral_winds_up_to_limit_only() {
        let mut pid = Pid::new(0.0, 1.0, 0.0, 10.0).with_limits(-2.0, 2.0);
        for _ in 0..100 {
            pid.update(0.0, 1.0);
        }
        assert_eq!(pid.last_terms().i_term, 2.0);

        // Recovers as soon as the error flips sign.
        let out = pid.update(11.0, 1.0);
        assert!(out < 2.0);
    }

    #[test]
    fn identical_sequences_give_identical_outputs() {
        let inputs = [19.0, 19.4, 19.9, 20.3, 20.1];
        let run = || {
            let mut pid = Pid::new(0.2, 0.01, 50.0, 20.0).with_symmetric_limit(6.0);
            inputs.iter().map(|&x| pid.update(x, 60.0)).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn reset_and_nan_input() {
        let mut pid = Pid::new(0.2, 0.1, 0.0, 20.0);
        let first = pid.update(18.0, 1.0);
        assert_eq!(pid.update(f64::NAN, 1.0), first);

        pid.reset();
        assert_eq!(pid.last_terms(), PidTerms::default());
        assert_eq!(pid.update(18.0, 1.0), first);
    }
}
