//! User-facing volume and rate controls mapped onto safe audio parameters.

/// Accepted range of the rate setting.
pub const RATE_RANGE: (f32, f32) = (0.1, 1.9);

/// Largest accepted volume setting.
pub const MAX_VOLUME: f32 = 1.9;

/// Maps a volume setting onto a gain value.
///
/// `0..=1` passes through; `(1, 1.9]` is stretched linearly onto `(1, 10]` so one control
/// spans both attenuation and amplification. Out-of-range settings are clamped first.
pub fn remap_volume(volume: f32) -> f32 {
    if !volume.is_finite() {
        return 1.0;
    }
    let volume = volume.clamp(0.0, MAX_VOLUME);
    if volume > 1.0 {
        volume * 10.0 - 9.0
    } else {
        volume
    }
}

/// Maps a rate setting (0.1..=1.9) onto a playback rate (0.82..=1.45).
///
/// Settings outside that range are clamped, so the result is always positive.
pub fn remap_rate(rate: f32) -> f32 {
    if !rate.is_finite() {
        return 1.0;
    }
    let rate = rate.clamp(RATE_RANGE.0, RATE_RANGE.1);
    if rate < 1.0 {
        rate * 0.2 + 0.8
    } else if rate > 1.0 {
        rate * 0.5 + 0.5
    } else {
        rate
    }
}
