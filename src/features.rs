//! Tremor and bradykinesia features of the kept trials.
//!
//! Every trial is cut into consecutive feature windows of
//! `feature_window_seconds`; each feature window yields one row holding, per
//! placement, six tremor power values, five bradykinesia values for each
//! accelerometer axis and the strongest cross-correlation between two axes.
//! Bradykinesia values are taken from the accelerometer after a zero-phase
//! 3 Hz lowpass.

use crate::alignment::AlignmentOutcome;
use crate::config::AlignmentConfig;
use crate::{Placement, CHANNELS_PER_PLACEMENT, CHANNEL_NAMES};
use chrono::{DateTime, Utc};
use log::debug;
use ndarray::{s, ArrayView1, ArrayView2};
use rustfft::{num_complex::Complex, FftPlanner};
use sci_rs::signal::filter::design::{
    butter_dyn, DigitalFilter, FilterBandType, FilterOutputType, Sos, SosFormatFilter,
};
use sci_rs::signal::filter::sosfiltfilt_dyn;
use std::f32::consts::PI;

const TREMOR_BAND: (f32, f32) = (3.5, 7.5);
const BRADYKINESIA_BAND: (f32, f32) = (0.5, 3.0);
/// AccX, AccY, AccZ
const ACC_CHANNELS: usize = 3;
const BRADYKINESIA_CUTOFF_HZ: f32 = 3.0;
const LOWPASS_ORDER: usize = 4;
const BRADYKINESIA_PREFIXES: [&str; 5] =
    ["bradyPower", "DomFreq", "DomEnergyRatio", "RMS", "AmpRange"];

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    /// Position among the kept slots
    pub slot: usize,
    /// Feature window inside the trial
    pub window: usize,
    pub timestamp: DateTime<Utc>,
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    pub names: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

/// Create a Hann window of the specified size
fn create_hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / size as f32).cos()))
        .collect()
}

/// Welch power spectral density estimate.
///
/// Hann segments of `segment_length` samples with 50% overlap, each detrended
/// by its mean, density scaling, one-sided. Returns `(frequencies, psd)` or
/// `None` when the signal is too short to hold a segment.
pub fn welch_psd(
    signal: ArrayView1<f32>,
    sample_rate: f32,
    segment_length: usize,
) -> Option<(Vec<f32>, Vec<f32>)> {
    let segment_length = segment_length.min(signal.len());
    if segment_length < 2 {
        return None;
    }

    let step = segment_length - segment_length / 2;
    let num_segments = (signal.len() - segment_length) / step + 1;
    let window = create_hann_window(segment_length);
    let scale = 1.0 / (sample_rate * window.iter().map(|w| w * w).sum::<f32>());

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(segment_length);
    let bins = segment_length / 2 + 1;
    let mut psd = vec![0.0f32; bins];

    for i in 0..num_segments {
        let segment = signal.slice(s![i * step..i * step + segment_length]);
        let mean = segment.sum() / segment_length as f32;

        let mut buffer: Vec<Complex<f32>> = segment
            .iter()
            .zip(&window)
            .map(|(&x, &w)| Complex::new((x - mean) * w, 0.0))
            .collect();
        fft.process(&mut buffer);

        for (j, p) in psd.iter_mut().enumerate() {
            *p += buffer[j].norm_sqr();
        }
    }

    // Nyquist only exists as its own bin for even segment lengths
    let last_doubled = if segment_length % 2 == 0 { bins - 1 } else { bins };
    for (j, p) in psd.iter_mut().enumerate() {
        *p *= scale / num_segments as f32;
        if j > 0 && j < last_doubled {
            *p *= 2.0;
        }
    }

    let freqs = (0..bins)
        .map(|j| j as f32 * sample_rate / segment_length as f32)
        .collect();
    Some((freqs, psd))
}

/// Mean natural-log power over the open band `(low, high)`.
fn band_log_power(signal: ArrayView1<f32>, sample_rate: f32, band: (f32, f32)) -> f32 {
    let Some((freqs, psd)) = welch_psd(signal, sample_rate, sample_rate.round() as usize) else {
        return f32::NAN;
    };
    let logs: Vec<f32> = freqs
        .iter()
        .zip(&psd)
        .filter(|&(&f, _)| f > band.0 && f < band.1)
        .map(|(_, p)| p.ln())
        .collect();
    if logs.is_empty() {
        return f32::NAN;
    }
    logs.iter().sum::<f32>() / logs.len() as f32
}

/// Tremor power of every channel in a `samples x 6` window.
pub fn tremor_features(window: ArrayView2<f32>, sample_rate: f32) -> Vec<f32> {
    window
        .columns()
        .into_iter()
        .map(|channel| band_log_power(channel, sample_rate, TREMOR_BAND))
        .collect()
}

/// Magnitude spectrum of the full signal, returned with its bin spacing.
fn magnitude_spectrum(signal: &[f32], sample_rate: f32) -> (Vec<f32>, f32) {
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(signal.len());
    let mut buffer: Vec<Complex<f32>> = signal.iter().map(|&x| Complex::new(x, 0.0)).collect();
    fft.process(&mut buffer);

    let magnitudes = buffer[..signal.len() / 2 + 1].iter().map(|c| c.norm()).collect();
    (magnitudes, sample_rate / signal.len() as f32)
}

/// Butterworth lowpass sections for the bradykinesia band, or `None` when the
/// cutoff is at or above Nyquist and the signal passes unchanged.
fn lowpass_sections(sample_rate: f32) -> Option<Vec<Sos<f32>>> {
    if BRADYKINESIA_CUTOFF_HZ >= sample_rate / 2.0 {
        return None;
    }
    let filter = butter_dyn(
        LOWPASS_ORDER,
        vec![BRADYKINESIA_CUTOFF_HZ],
        Some(FilterBandType::Lowpass),
        Some(false),
        Some(FilterOutputType::Sos),
        Some(sample_rate),
    );
    match filter {
        DigitalFilter::Sos(SosFormatFilter { sos }) => Some(sos),
        _ => None,
    }
}

/// Mean-removed, lowpassed copy of one accelerometer axis.
fn smoothed_axis(channel: ArrayView1<f32>, sections: Option<&[Sos<f32>]>) -> Vec<f32> {
    let mean = channel.sum() / channel.len() as f32;
    let centered: Vec<f32> = channel.iter().map(|x| x - mean).collect();
    match sections {
        // forward-backward filtering needs more samples than its edge padding
        Some(sos) if centered.len() > 3 * (2 * sos.len() + 1) => sosfiltfilt_dyn(centered.iter(), sos),
        _ => centered,
    }
}

fn population_std(signal: &[f32]) -> f32 {
    let mean = signal.iter().sum::<f32>() / signal.len() as f32;
    (signal.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / signal.len() as f32).sqrt()
}

/// Cross-correlation of two equal-length signals over the centered lags
/// `-(n / 2)..n - n / 2`, scaled by the product of their standard deviations.
/// Index `n / 2` holds lag zero. `None` when either signal is flat.
pub fn normalized_cross_correlation(x: &[f32], y: &[f32]) -> Option<Vec<f32>> {
    let n = x.len().min(y.len());
    if n == 0 {
        return None;
    }
    let scale = population_std(&x[..n]) * population_std(&y[..n]);
    if scale <= 0.0 || !scale.is_finite() {
        return None;
    }

    let fft_length = (2 * n - 1).next_power_of_two();
    let mut planner = FftPlanner::new();
    let forward = planner.plan_fft_forward(fft_length);
    let inverse = planner.plan_fft_inverse(fft_length);

    let padded = |signal: &[f32]| -> Vec<Complex<f32>> {
        let mut buffer = vec![Complex::new(0.0, 0.0); fft_length];
        for (b, &v) in buffer.iter_mut().zip(signal) {
            b.re = v;
        }
        buffer
    };
    let mut a = padded(&x[..n]);
    let mut b = padded(&y[..n]);
    forward.process(&mut a);
    forward.process(&mut b);
    let mut product: Vec<Complex<f32>> = a.iter().zip(&b).map(|(p, q)| p * q.conj()).collect();
    inverse.process(&mut product);

    // circular index of lag k is k mod fft_length
    let norm = fft_length as f32 * scale;
    let correlation = (0..n)
        .map(|i| {
            let lag = i as isize - (n / 2) as isize;
            let index = lag.rem_euclid(fft_length as isize) as usize;
            product[index].re / norm
        })
        .collect();
    Some(correlation)
}

/// Strongest normalized cross-correlation over the accelerometer axis pairs
/// and its index in the centered lag range. NaN for both when every pair
/// holds a flat axis.
fn max_cross_correlation(axes: &[Vec<f32>]) -> (f32, f32) {
    let mut best = (f32::NAN, f32::NAN);
    for i in 0..axes.len() {
        for j in i + 1..axes.len() {
            let Some(correlation) = normalized_cross_correlation(&axes[i], &axes[j]) else {
                continue;
            };
            let (location, peak) = correlation
                .iter()
                .enumerate()
                .fold((0, f32::MIN), |top, (k, &c)| if c > top.1 { (k, c) } else { top });
            if best.0.is_nan() || peak > best.0 {
                best = (peak, location as f32);
            }
        }
    }
    best
}

/// Bradykinesia values of the accelerometer axes, five per axis in
/// [`BRADYKINESIA_PREFIXES`] order, followed by MaxCC and MaxCCLoc. Each axis
/// has its mean removed and is lowpassed first.
pub fn bradykinesia_features(window: ArrayView2<f32>, sample_rate: f32) -> Vec<f32> {
    let count = ACC_CHANNELS * BRADYKINESIA_PREFIXES.len() + 2;
    if window.nrows() == 0 {
        return vec![f32::NAN; count];
    }
    let mut features = Vec::with_capacity(count);

    let sections = lowpass_sections(sample_rate);
    let axes: Vec<Vec<f32>> = window
        .columns()
        .into_iter()
        .take(ACC_CHANNELS)
        .map(|channel| smoothed_axis(channel, sections.as_deref()))
        .collect();

    for axis in &axes {
        features.push(band_log_power(
            ArrayView1::from(&axis[..]),
            sample_rate,
            BRADYKINESIA_BAND,
        ));

        let (spectrum, resolution) = magnitude_spectrum(axis, sample_rate);
        let (peak_bin, peak) = spectrum
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, &m)| if m > best.1 { (i, m) } else { best });
        let total: f32 = spectrum.iter().sum();
        features.push(peak_bin as f32 * resolution);
        features.push(if total > 0.0 { peak / total } else { f32::NAN });

        let rms = (axis.iter().map(|x| x * x).sum::<f32>() / axis.len() as f32).sqrt();
        features.push(rms);

        let (min, max) = axis
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), &x| (lo.min(x), hi.max(x)));
        features.push(max - min);
    }

    let (max_cc, max_cc_location) = max_cross_correlation(&axes);
    features.push(max_cc);
    features.push(max_cc_location);
    features
}

/// Column names in row order: per placement, tremor, bradykinesia, then the
/// cross-correlation pair.
pub fn feature_names() -> Vec<String> {
    let mut names = Vec::new();
    for placement in Placement::ALL {
        let suffix = placement.suffix();
        for channel in CHANNEL_NAMES {
            names.push(format!("TremorPower{}{}", channel, suffix));
        }
        for channel in &CHANNEL_NAMES[..ACC_CHANNELS] {
            for prefix in BRADYKINESIA_PREFIXES {
                names.push(format!("{}{}{}", prefix, channel, suffix));
            }
        }
        names.push(format!("MaxCC{}", suffix));
        names.push(format!("MaxCCLoc{}", suffix));
    }
    names
}

/// Computes the feature rows of every kept trial.
pub fn extract_features(outcome: &AlignmentOutcome, config: &AlignmentConfig) -> FeatureTable {
    let sample_rate = config.sample_rate() as f32;
    let feature_length = (config.feature_window_seconds as f64 * config.sample_rate()).round() as usize;
    let mut table = FeatureTable {
        names: feature_names(),
        rows: Vec::new(),
    };
    if feature_length == 0 {
        return table;
    }

    let windows_per_trial = outcome.window_length() / feature_length;
    debug!(
        "Extracting features from {} trials, {} windows of {} samples each",
        outcome.len(),
        windows_per_trial,
        feature_length
    );

    for (slot, trial) in outcome.trials.outer_iter().enumerate() {
        for window in 0..windows_per_trial {
            let rows = window * feature_length..(window + 1) * feature_length;
            let mut values = Vec::with_capacity(table.names.len());
            for placement in Placement::ALL {
                let c0 = placement.index() * CHANNELS_PER_PLACEMENT;
                let block = trial.slice(s![rows.clone(), c0..c0 + CHANNELS_PER_PLACEMENT]);
                values.extend(tremor_features(block, sample_rate));
                values.extend(bradykinesia_features(block, sample_rate));
            }
            table.rows.push(FeatureRow {
                slot,
                window,
                timestamp: outcome.slot_times[slot],
                values,
            });
        }
    }

    table
}
