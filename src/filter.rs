//! Adaptive low-pass ("One-Euro") filtering of inference channels.
//!
//! Each channel carries an explicit `ChannelState` that `step` consumes and returns.
//! The cutoff frequency rises with the smoothed signal speed:
//!
//! `cutoff = min_cutoff + beta * |dx_hat|`, `alpha(f, dt) = 1 / (1 + 1 / (2*pi*f*dt))`
//!
//! Non-finite samples never enter the state; the previous filtered value is held.

use anyhow::{anyhow, Result};
use std::f64::consts::PI;

/// Derivative cutoff used when none is configured (Hz).
pub const DEFAULT_D_CUTOFF: f64 = 1.0;

/// Floor for the time step between samples (seconds).
pub const MIN_DT: f64 = 1e-6;

/// Tuning constants for one channel group.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FilterParams {
    /// Cutoff at rest (Hz). Lower means smoother but laggier.
    pub min_cutoff: f64,
    /// Speed coefficient. Higher means less lag during fast motion.
    pub beta: f64,
    /// Cutoff for the derivative estimate (Hz).
    pub d_cutoff: f64,
}

impl FilterParams {
    pub fn new(min_cutoff: f64, beta: f64) -> Self {
        Self {
            min_cutoff,
            beta,
            d_cutoff: DEFAULT_D_CUTOFF,
        }
    }

    /// Constants tuned for gaze channels.
    pub fn gaze() -> Self {
        Self::new(2.09, 5.6)
    }

    /// Constants tuned for eyelid channels.
    pub fn eyelid() -> Self {
        Self::new(1.5, 5.0)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.min_cutoff.is_finite() && self.min_cutoff > 0.0) {
            return Err(anyhow!("min_cutoff must be positive, got {}", self.min_cutoff));
        }
        if !(self.beta.is_finite() && self.beta >= 0.0) {
            return Err(anyhow!("beta must be non-negative, got {}", self.beta));
        }
        if !(self.d_cutoff.is_finite() && self.d_cutoff > 0.0) {
            return Err(anyhow!("d_cutoff must be positive, got {}", self.d_cutoff));
        }
        Ok(())
    }
}

/// Filter history for one channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelState {
    /// Last filtered value.
    pub value: f64,
    /// Last smoothed derivative.
    pub derivative: f64,
    /// Timestamp of the last accepted sample (seconds).
    pub timestamp: f64,
}

/// Exponential smoothing coefficient for cutoff `cutoff` (Hz) at step `dt` (s).
pub fn smoothing_factor(cutoff: f64, dt: f64) -> f64 {
    let r = 2.0 * PI * cutoff * dt;
    r / (r + 1.0)
}

/// Advance one channel by one sample.
///
/// The filtered output is the returned state's `value`. `None` in, finite sample
/// out: the channel initializes to the sample unchanged.
pub fn step(
    params: &FilterParams,
    state: Option<ChannelState>,
    sample: f64,
    timestamp: f64,
) -> Option<ChannelState> {
    if !sample.is_finite() || !timestamp.is_finite() {
        return state;
    }
    let Some(prev) = state else {
        return Some(ChannelState {
            value: sample,
            derivative: 0.0,
            timestamp,
        });
    };

    let dt = (timestamp - prev.timestamp).max(MIN_DT);
    let dx = (sample - prev.value) / dt;
    let a_d = smoothing_factor(params.d_cutoff, dt);
    let dx_hat = a_d * dx + (1.0 - a_d) * prev.derivative;

    let cutoff = params.min_cutoff + params.beta * dx_hat.abs();
    let a = smoothing_factor(cutoff, dt);
    let value = a * sample + (1.0 - a) * prev.value;

    Some(ChannelState {
        value,
        derivative: dx_hat,
        timestamp: timestamp.max(prev.timestamp),
    })
}

/// Per-channel filter bank with a fixed channel count.
pub struct TemporalFilter {
    params: Vec<FilterParams>,
    states: Vec<Option<ChannelState>>,
}

impl TemporalFilter {
    /// One `FilterParams` per channel.
    pub fn new(params: Vec<FilterParams>) -> Self {
        let states = vec![None; params.len()];
        Self { params, states }
    }

    /// Build from `(channel_count, params)` groups laid out consecutively.
    pub fn from_groups<I>(groups: I) -> Self
    where
        I: IntoIterator<Item = (usize, FilterParams)>,
    {
        let params = groups
            .into_iter()
            .flat_map(|(count, params)| std::iter::repeat(params).take(count))
            .collect();
        Self::new(params)
    }

    pub fn channels(&self) -> usize {
        self.params.len()
    }

    pub fn state(&self, channel: usize) -> Option<ChannelState> {
        self.states.get(channel).copied().flatten()
    }

    /// Filter one sample per channel taken at `timestamp` (seconds).
    ///
    /// NaN marks a missing sample; that channel's previous value is held.
    /// Channels that have never seen a finite sample yield `None`.
    pub fn apply(&mut self, samples: &[f64], timestamp: f64) -> Result<Vec<Option<f64>>> {
        if samples.len() != self.states.len() {
            return Err(anyhow!(
                "filter has {} channels, received {} samples",
                self.states.len(),
                samples.len()
            ));
        }
        Ok(self
            .states
            .iter_mut()
            .zip(&self.params)
            .zip(samples)
            .map(|((state, params), &sample)| {
                *state = step(params, *state, sample, timestamp);
                state.map(|s| s.value)
            })
            .collect())
    }

    pub fn reset(&mut self) {
        self.states.iter_mut().for_each(|state| *state = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f64 = 1.0 / 60.0;

    fn settle_ticks(beta: f64) -> usize {
        let params = FilterParams::new(1.0, beta);
        let mut state = step(&params, None, 0.0, 0.0);
        let mut ticks = 0;
        while (state.unwrap().value - 1.0).abs() > 0.01 {
            ticks += 1;
            state = step(&params, state, 1.0, ticks as f64 * DT);
            assert!(ticks < 10_000, "filter never settled");
        }
        ticks
    }

    #[test]
    fn first_sample_passes_through() {
        let state = step(&FilterParams::gaze(), None, 0.3125, 4.0).unwrap();
        assert_eq!(state.value, 0.3125);
        assert_eq!(state.derivative, 0.0);
        assert_eq!(state.timestamp, 4.0);
    }

    #[test]
    fn matches_closed_form() {
        let params = FilterParams::gaze();
        let prev = ChannelState {
            value: 0.0,
            derivative: 0.0,
            timestamp: 0.0,
        };
        let out = step(&params, Some(prev), 1.0, DT).unwrap();

        let alpha = |f: f64| 1.0 / (1.0 + 1.0 / (2.0 * PI * f * DT));
        let dx_hat = alpha(DEFAULT_D_CUTOFF) * (1.0 / DT);
        let expected = alpha(2.09 + 5.6 * dx_hat);
        assert!((out.value - expected).abs() < 1e-6);
        assert!((out.value - 0.780_424_26).abs() < 1e-6);
        assert!((out.derivative - dx_hat).abs() < 1e-9);
    }

    #[test]
    fn tiny_dt_stays_near_previous_value() {
        let params = FilterParams::gaze();
        let prev = Some(ChannelState {
            value: 0.0,
            derivative: 0.0,
            timestamp: 10.0,
        });
        let mut last_jump = f64::INFINITY;
        for dt in [1e-2, 1e-3, 1e-4, 1e-5] {
            let jump = step(&params, prev, 1.0, 10.0 + dt).unwrap().value.abs();
            assert!(jump < last_jump, "dt {} jump {} not below {}", dt, jump, last_jump);
            last_jump = jump;
        }
        let zero_dt = step(&params, prev, 1.0, 10.0).unwrap();
        assert!(zero_dt.value.abs() < 1e-3);
        assert!(zero_dt.value.is_finite());
    }

    #[test]
    fn higher_beta_settles_faster() {
        let betas = [0.0, 0.5, 1.0, 5.0];
        let ticks: Vec<usize> = betas.iter().map(|&b| settle_ticks(b)).collect();
        for pair in ticks.windows(2) {
            assert!(pair[1] < pair[0], "settling ticks {:?}", ticks);
        }
    }

    #[test]
    fn non_finite_input_holds_previous_value() {
        let params = FilterParams::gaze();
        let state = step(&params, None, 0.5, 0.0);
        assert_eq!(step(&params, state, f64::NAN, DT), state);
        assert_eq!(step(&params, state, f64::INFINITY, DT), state);
        assert_eq!(step(&params, None, f64::NAN, 0.0), None);
    }

    #[test]
    fn channels_are_independent() {
        let mut filter = TemporalFilter::new(vec![FilterParams::gaze(); 2]);
        filter.apply(&[0.0, 0.0], 0.0).unwrap();
        let moved = filter.apply(&[1.0, 0.0], DT).unwrap();
        assert!(moved[0].unwrap() > 0.5);
        assert_eq!(moved[1], Some(0.0));
    }

    #[test]
    fn bank_holds_missing_channels_and_reports_uninitialized() {
        let mut filter = TemporalFilter::from_groups([(2, FilterParams::gaze()), (1, FilterParams::eyelid())]);
        assert_eq!(filter.channels(), 3);

        let out = filter.apply(&[0.25, f64::NAN, 0.75], 0.0).unwrap();
        assert_eq!(out, vec![Some(0.25), None, Some(0.75)]);

        let out = filter.apply(&[f64::NAN, f64::NAN, f64::NAN], DT).unwrap();
        assert_eq!(out, vec![Some(0.25), None, Some(0.75)]);
        assert_eq!(filter.state(0).unwrap().timestamp, 0.0);
    }

    #[test]
    fn bank_rejects_wrong_arity() {
        let mut filter = TemporalFilter::new(vec![FilterParams::gaze(); 3]);
        assert!(filter.apply(&[0.0, 0.0], 0.0).is_err());
        assert!(filter.apply(&[0.0; 4], 0.0).is_err());
    }

    #[test]
    fn params_validation() {
        assert!(FilterParams::gaze().validate().is_ok());
        assert!(FilterParams::new(0.0, 1.0).validate().is_err());
        assert!(FilterParams::new(1.0, -1.0).validate().is_err());
        assert!(FilterParams::new(1.0, f64::NAN).validate().is_err());
    }
}
