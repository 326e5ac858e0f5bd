//! Fixed-dimension vector primitives. All embeddings are IEEE-754 doubles;
//! squared distances are used internally and square-rooted only at result
//! boundaries.

use crate::error::{Error, Result};

/// Squared L2 distance. The workhorse for index traversal — comparisons on
/// squared values avoid the square root in hot loops.
pub fn squared_l2(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// L2 (Euclidean) distance.
pub fn l2(a: &[f64], b: &[f64]) -> f64 {
    squared_l2(a, b).sqrt()
}

/// Dot product.
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// L2 norm.
pub fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

/// Cosine similarity. Returns 0.0 when either operand is degenerate
/// (zero norm); callers that care can test with [`is_degenerate`].
pub fn cos(a: &[f64], b: &[f64]) -> f64 {
    let na = norm(a);
    let nb = norm(b);
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot(a, b) / (na * nb)
}

/// A vector is degenerate when its norm is zero — cosine against it is
/// undefined and reported as 0.
pub fn is_degenerate(a: &[f64]) -> bool {
    a.iter().all(|x| *x == 0.0)
}

/// Reject empty and non-finite embeddings before they enter the store.
pub fn validate_embedding(v: &[f64]) -> Result<()> {
    if v.is_empty() {
        return Err(Error::invalid("embedding must not be empty"));
    }
    if let Some(pos) = v.iter().position(|x| !x.is_finite()) {
        return Err(Error::Invalid(format!(
            "embedding component {pos} is not finite ({})",
            v[pos]
        )));
    }
    Ok(())
}
