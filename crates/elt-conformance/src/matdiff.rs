//! Error norms between a gold and a test output matrix.

use elt_layout::{ElementBuffer, LayoutError, MatrixLayout};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ErrorReport {
    pub l1_ref: f64,
    pub l1_tst: f64,
    pub l2_abs: f64,
    pub l2_rel: f64,
    pub linf_abs: f64,
    pub linf_rel: f64,
    /// Normalized Frobenius relative error; the pass/fail statistic.
    pub normf_rel: f64,
}

impl ErrorReport {
    /// `NaN` never passes.
    #[must_use]
    pub fn within(&self, bound: f64) -> bool {
        self.normf_rel <= bound
    }
}

/// Signed difference with equal values, equal infinities and NaN pairs
/// collapsing to zero. A lone NaN counts as an infinite miss.
fn element_delta(reference: f64, test: f64) -> f64 {
    if reference == test || (reference.is_nan() && test.is_nan()) {
        0.0
    } else if reference.is_nan() || test.is_nan() {
        f64::INFINITY
    } else {
        reference - test
    }
}

/// Compares the logical `rows x cols` region of both buffers, widened to
/// f64. Padding rows beyond `rows` are ignored.
pub fn compare(
    gold: &ElementBuffer,
    test: &ElementBuffer,
    matrix: MatrixLayout,
) -> Result<ErrorReport, LayoutError> {
    let mut report = ErrorReport::default();
    let mut sum_d2 = 0.0_f64;
    let mut sum_ref2 = 0.0_f64;
    let mut sum_rel2 = 0.0_f64;

    for j in 0..matrix.cols {
        for i in 0..matrix.rows {
            let index = matrix.index(i, j);
            let reference = gold.get_f64(index)?;
            let tested = test.get_f64(index)?;
            let d = element_delta(reference, tested);

            report.l1_ref += reference.abs();
            report.l1_tst += tested.abs();
            sum_d2 += d * d;
            if reference.is_finite() {
                sum_ref2 += reference * reference;
            }
            report.linf_abs = report.linf_abs.max(d.abs());
            if reference != 0.0 && !reference.is_nan() {
                let rel = d / reference;
                sum_rel2 += rel * rel;
                report.linf_rel = report.linf_rel.max(rel.abs());
            }
        }
    }

    report.l2_abs = sum_d2.sqrt();
    report.l2_rel = sum_rel2.sqrt();
    let norm_ref = sum_ref2.sqrt();
    report.normf_rel = if norm_ref == 0.0 {
        report.l2_abs
    } else {
        report.l2_abs / norm_ref
    };
    Ok(report)
}

/// Bytewise equality of the whole buffers, padding included.
#[must_use]
pub fn bytes_identical(gold: &ElementBuffer, test: &ElementBuffer) -> bool {
    gold.tag() == test.tag() && gold.as_bytes() == test.as_bytes()
}
