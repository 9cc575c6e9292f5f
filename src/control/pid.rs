// PID force controller
//
// Pure and deterministic: all state is passed in and returned, and the caller supplies dt.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl PidGains {
    pub fn new(kp: f32, ki: f32, kd: f32) -> Self {
        Self { kp, ki, kd }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidLimits {
    /// Bound on the integral accumulator (N·s)
    pub integral_limit: f32,
    /// Bound on the output torque (N·m)
    pub torque_limit: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PidState {
    pub integral: f32,
    pub last_error: f32,
}

/// One controller step from force error to torque command
///
/// The integral is clamped to `±integral_limit` on every step, and the output to
/// `±torque_limit`. A non-positive `dt` contributes neither integral nor derivative.
pub fn step(
    target: f32,
    measured: f32,
    dt: f32,
    gains: &PidGains,
    limits: &PidLimits,
    state: &PidState,
) -> (f32, PidState) {
    let error = target - measured;

    let (integral, derivative) = if dt > 0.0 {
        (
            (state.integral + error * dt).clamp(-limits.integral_limit, limits.integral_limit),
            (error - state.last_error) / dt,
        )
    } else {
        (state.integral, 0.0)
    };

    let output = gains.kp * error + gains.ki * integral + gains.kd * derivative;
    let torque = output.clamp(-limits.torque_limit, limits.torque_limit);

    (
        torque,
        PidState {
            integral,
            last_error: error,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: PidLimits = PidLimits {
        integral_limit: 1.0,
        torque_limit: 10.0,
    };

    #[test]
    fn test_first_step_matches_hand_calculation() {
        let gains = PidGains::new(2.0, 0.1, 0.0);
        let (torque, state) = step(0.15, 0.0, 0.01, &gains, &LIMITS, &PidState::default());

        // 2.0 * 0.15 + 0.1 * (0.15 * 0.01)
        assert!((torque - 0.30015).abs() < 1e-6);
        assert!((state.integral - 0.0015).abs() < 1e-7);
        assert_eq!(state.last_error, 0.15);
    }

    #[test]
    fn test_zero_gains_output_zero() {
        let gains = PidGains::default();
        let mut state = PidState::default();
        for (target, measured) in [(1.0, 0.0), (-50.0, 3.0), (1e6, -1e6)] {
            let (torque, next) = step(target, measured, 0.01, &gains, &LIMITS, &state);
            assert_eq!(torque, 0.0);
            state = next;
        }
    }

    #[test]
    fn test_output_saturates_at_torque_limit() {
        let gains = PidGains::new(2.0, 0.1, 0.01);
        let (high, _) = step(1e4, 0.0, 0.01, &gains, &LIMITS, &PidState::default());
        let (low, _) = step(-1e4, 0.0, 0.01, &gains, &LIMITS, &PidState::default());
        assert_eq!(high, 10.0);
        assert_eq!(low, -10.0);
    }

    #[test]
    fn test_integral_is_clamped() {
        let gains = PidGains::new(0.0, 1.0, 0.0);
        let mut state = PidState::default();
        for _ in 0..1000 {
            state = step(5.0, 0.0, 0.01, &gains, &LIMITS, &state).1;
        }
        assert_eq!(state.integral, 1.0);

        // Unwinds immediately once the error reverses
        let (_, next) = step(0.0, 5.0, 0.01, &gains, &LIMITS, &state);
        assert!((next.integral - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_same_inputs_same_outputs() {
        let gains = PidGains::new(1.5, 0.3, 0.02);
        let inputs = [(0.2, 0.0), (0.2, 0.05), (0.2, 0.12), (0.2, 0.19), (0.2, 0.23)];

        let run = || {
            let mut state = PidState::default();
            inputs
                .iter()
                .map(|&(t, m)| {
                    let (out, next) = step(t, m, 0.01, &gains, &LIMITS, &state);
                    state = next;
                    out
                })
                .collect::<Vec<f32>>()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn test_non_positive_dt_skips_integral_and_derivative() {
        let gains = PidGains::new(1.0, 1.0, 1.0);
        let state = PidState { integral: 0.5, last_error: 0.0 };
        let (torque, next) = step(1.0, 0.0, 0.0, &gains, &LIMITS, &state);
        assert_eq!(torque, 1.5);
        assert_eq!(next.integral, 0.5);
    }
}
