// SPDX-License-Identifier: GPL-2.0-or-later

//! Presentation time is tracked in 100 nanosecond ticks, the native unit of
//! Smooth Streaming and the timescale advertised in DASH segment templates.

/// 100 ns ticks per second.
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// Rescale `value` from `from_scale` units to `to_scale` units
/// without intermediate overflow.
#[must_use]
pub fn rescale(value: u64, to_scale: u64, from_scale: u64) -> u64 {
    assert!(from_scale != 0, "zero timescale");
    let v = u128::from(value) * u128::from(to_scale) / u128::from(from_scale);
    u64::try_from(v).expect("rescaled value fits u64")
}

/// Media timescale units to 100 ns ticks.
#[must_use]
pub fn to_ticks(value: u64, timescale: u32) -> u64 {
    rescale(value, TICKS_PER_SECOND, u64::from(timescale))
}

/// 100 ns ticks to media timescale units.
#[must_use]
pub fn from_ticks(ticks: u64, timescale: u32) -> u64 {
    rescale(ticks, u64::from(timescale), TICKS_PER_SECOND)
}
