//! Standard normal density and distribution function.

use std::f64::consts::PI;

pub fn pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * PI).sqrt()
}

pub fn cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Complementary error function, fractional error below 1.2e-7.
pub fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87
                                    + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let r = t * poly.exp();
    if x >= 0.0 {
        r
    } else {
        2.0 - r
    }
}

/// Mean of a normal(`mu`, `sigma`) truncated to values above `lower`.
pub fn truncated_mean_above(mu: f64, sigma: f64, lower: f64) -> f64 {
    if sigma <= f64::EPSILON {
        return mu.max(lower);
    }
    let alpha = (lower - mu) / sigma;
    let tail = 1.0 - cdf(alpha);
    if tail <= 1e-12 {
        return lower;
    }
    mu + sigma * pdf(alpha) / tail
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cdf_known_values() {
        assert!((cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((cdf(1.96) - 0.975).abs() < 1e-3);
        assert!((cdf(-1.96) - 0.025).abs() < 1e-3);
    }

    #[test]
    fn test_truncated_mean_exceeds_bound() {
        let m = truncated_mean_above(0.0, 1.0, 1.0);
        assert!(m > 1.0);
        assert!((m - 1.525).abs() < 1e-2);
        assert_eq!(truncated_mean_above(3.0, 0.0, 5.0), 5.0);
    }
}
