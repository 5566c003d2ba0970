//! Amplitude level smoothing for visualization
//!
//! Raw microphone levels jitter frame to frame. The smoother applies an
//! asymmetric exponential filter so a rendered meter rises quickly on
//! speech onset and decays gently into silence.

/// Default attack coefficient (rise speed)
const DEFAULT_ATTACK: f32 = 0.6;

/// Default release coefficient (decay speed)
const DEFAULT_RELEASE: f32 = 0.15;

/// Asymmetric exponential level smoother
///
/// `step` applies `y += a * (x - y)` where `a` is the attack coefficient
/// when the input is above the current value and the release coefficient
/// otherwise. Attack is larger than release, so the output tracks rising
/// levels quickly and falls slowly.
#[derive(Debug, Clone)]
pub struct LevelSmoother {
    attack: f32,
    release: f32,
    value: f32,
}

impl Default for LevelSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_ATTACK, DEFAULT_RELEASE)
    }
}

impl LevelSmoother {
    /// Create a smoother with explicit coefficients, both in (0, 1)
    #[must_use]
    pub fn new(attack: f32, release: f32) -> Self {
        debug_assert!(attack > 0.0 && attack < 1.0);
        debug_assert!(release > 0.0 && release < 1.0);
        debug_assert!(attack > release);
        Self {
            attack,
            release,
            value: 0.0,
        }
    }

    /// Feed one sample and return the smoothed level
    ///
    /// Input is clamped to [0, 1]; output stays within [0, 1].
    pub fn step(&mut self, sample: f32) -> f32 {
        let x = sample.clamp(0.0, 1.0);
        let a = if x > self.value {
            self.attack
        } else {
            self.release
        };
        self.value += a * (x - self.value);
        self.value
    }

    /// Current smoothed value without advancing the filter
    #[must_use]
    pub const fn value(&self) -> f32 {
        self.value
    }

    /// Reset the filter to zero
    pub const fn reset(&mut self) {
        self.value = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_stays_in_range() {
        let mut smoother = LevelSmoother::default();
        for &x in &[0.0, 1.0, 0.5, 2.0, -1.0, 0.99, 0.01] {
            let y = smoother.step(x);
            assert!((0.0..=1.0).contains(&y), "out of range for input {x}: {y}");
        }
    }

    #[test]
    fn test_converges_to_constant_input() {
        let mut smoother = LevelSmoother::default();
        for _ in 0..200 {
            smoother.step(0.7);
        }
        assert!((smoother.value() - 0.7).abs() < 1e-3);
    }

    #[test]
    fn test_rises_faster_than_it_falls() {
        let mut smoother = LevelSmoother::default();
        let after_rise = smoother.step(1.0);

        let mut falling = LevelSmoother::default();
        for _ in 0..50 {
            falling.step(1.0);
        }
        let peak = falling.value();
        let after_fall = falling.step(0.0);

        assert!(after_rise > 0.5, "attack too slow: {after_rise}");
        assert!(peak - after_fall < after_rise, "release not gentler");
    }

    #[test]
    fn test_reset() {
        let mut smoother = LevelSmoother::default();
        smoother.step(1.0);
        assert!(smoother.value() > 0.0);
        smoother.reset();
        assert!((smoother.value() - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_input_clamped() {
        let mut smoother = LevelSmoother::default();
        for _ in 0..200 {
            smoother.step(5.0);
        }
        assert!(smoother.value() <= 1.0);
    }
}
