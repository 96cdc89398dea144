/// Readings above this are negative temperatures in two's complement
pub const RTD_WRAP_THRESHOLD: f64 = 850.0;
/// Degrees per count
pub const RTD_RESOLUTION: f64 = 0.1;

/// Evaluate a polynomial with Horner's rule
///
/// # Arguments
/// * `coefficients` - Lowest order first; an empty set evaluates to zero
/// * `x` - Raw register value
pub fn horner(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// Temperature of a resistance thermometer register in degrees
///
/// The module reports tenths of a degree; values above 850 are below zero and are unwrapped
/// with an offset of 0.1 * (2^16 - 1).
pub fn rtd_temperature(raw: u16) -> f64 {
    let value = raw as f64 * RTD_RESOLUTION;
    if value > RTD_WRAP_THRESHOLD {
        value - RTD_RESOLUTION * u16::MAX as f64
    } else {
        value
    }
}
