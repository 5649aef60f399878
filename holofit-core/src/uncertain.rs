//! Reporting type for a fitted value with (possibly asymmetric) uncertainty.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A value with an upper and lower deviation.
///
/// `minus` only mirrors `plus` when the value was built with
/// [`UncertainValue::symmetric`]; an explicit lower deviation is never replaced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UncertainValue {
    value: f64,
    plus: f64,
    minus: f64,
    n_sigma: f64,
    symmetric: bool,
}

impl UncertainValue {
    /// Value with distinct upper and lower deviations at one sigma.
    pub fn new(value: f64, plus: f64, minus: f64) -> Self {
        Self {
            value,
            plus,
            minus,
            n_sigma: 1.0,
            symmetric: false,
        }
    }

    /// Value whose lower deviation is the same as the upper one.
    pub fn symmetric(value: f64, uncertainty: f64) -> Self {
        Self {
            value,
            plus: uncertainty,
            minus: uncertainty,
            n_sigma: 1.0,
            symmetric: true,
        }
    }

    /// Builder-style helper for a deviation expressed in a different number of sigma.
    pub fn with_n_sigma(mut self, n_sigma: f64) -> Self {
        self.n_sigma = n_sigma;
        self
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Upper deviation
    pub fn plus(&self) -> f64 {
        self.plus
    }

    /// Lower deviation
    pub fn minus(&self) -> f64 {
        self.minus
    }

    /// Number of sigma the deviations represent
    pub fn n_sigma(&self) -> f64 {
        self.n_sigma
    }

    /// True if the lower deviation was omitted at construction.
    pub fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    /// The wider of the two deviations.
    pub fn width(&self) -> f64 {
        self.plus.max(self.minus)
    }

    /// Significant figures used to print the value.
    ///
    /// Enough digits to resolve the value down to its smallest deviation, but never fewer than two.
    fn display_precision(&self) -> usize {
        let smallest = self.plus.min(self.minus);
        let ratio = (self.value / smallest).abs().log10() + 0.6;
        if ratio.is_finite() {
            (ratio.round() as i64).max(2) as usize
        } else {
            2
        }
    }

    /// LaTeX rendering, e.g. `5^{+0.2}_{-0.1}`.
    pub fn to_latex(&self) -> String {
        let value = format_significant(self.value, self.display_precision());
        let deviation = if self.symmetric {
            format!(r" \pm {}", format_significant(self.plus, 2))
        } else {
            format!(
                "^{{+{}}}_{{-{}}}",
                format_significant(self.plus, 2),
                format_significant(self.minus, 2)
            )
        };
        let confidence = if self.n_sigma != 1.0 {
            format!(r" (\mathrm{{{}\ sigma}})", self.n_sigma)
        } else {
            String::new()
        };
        format!("{}{}{}", value, deviation, confidence)
    }
}

impl fmt::Display for UncertainValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = format_significant(self.value, self.display_precision());
        if self.symmetric {
            write!(f, "{} ± {}", value, format_significant(self.plus, 2))?;
        } else {
            write!(
                f,
                "{} +{}/-{}",
                value,
                format_significant(self.plus, 2),
                format_significant(self.minus, 2)
            )?;
        }
        if self.n_sigma != 1.0 {
            write!(f, " ({} sigma)", self.n_sigma)?;
        }
        Ok(())
    }
}

/// Format `x` with `digits` significant figures, dropping trailing zeros.
///
/// Mirrors C's `%g`: scientific notation for very small or very large magnitudes.
pub fn format_significant(x: f64, digits: usize) -> String {
    if x == 0.0 || !x.is_finite() {
        return format!("{}", x);
    }
    let digits = digits.max(1);
    let exponent = x.abs().log10().floor() as i32;

    if exponent < -4 || exponent >= digits as i32 {
        let formatted = format!("{:.*e}", digits - 1, x);
        match formatted.split_once('e') {
            Some((mantissa, exp)) => format!("{}e{}", trim_zeros(mantissa), exp),
            None => formatted,
        }
    } else {
        let decimals = (digits as i32 - 1 - exponent).max(0) as usize;
        trim_zeros(&format!("{:.*}", decimals, x)).to_string()
    }
}

fn trim_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}
