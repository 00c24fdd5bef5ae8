use std::fmt;
use std::str::FromStr;

use wide::f32x8;

const LANES: usize = 8;

/// Distance between a query and an item vector. Every metric yields a value
/// where smaller means closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
    #[default]
    Euclidean,
    SquaredEuclidean,
    /// `1 - cos(q, x)`; zero-norm vectors are at distance 1 from everything.
    Cosine,
    /// Negated inner product.
    Dot,
}

impl Metric {
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Euclidean => squared_l2_simd(a, b).sqrt(),
            Metric::SquaredEuclidean => squared_l2_simd(a, b),
            Metric::Cosine => {
                let na = dot_simd(a, a).sqrt();
                let nb = dot_simd(b, b).sqrt();
                if na == 0.0 || nb == 0.0 {
                    1.0
                } else {
                    1.0 - dot_simd(a, b) / (na * nb)
                }
            }
            Metric::Dot => -dot_simd(a, b),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Euclidean => "euclidean",
            Metric::SquaredEuclidean => "sqeuclidean",
            Metric::Cosine => "cosine",
            Metric::Dot => "dot",
        }
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            "sqeuclidean" | "l2sq" => Ok(Metric::SquaredEuclidean),
            "cosine" => Ok(Metric::Cosine),
            "dot" | "inner" => Ok(Metric::Dot),
            other => Err(format!(
                "Invalid metric '{}'. Use 'euclidean', 'sqeuclidean', 'cosine' or 'dot'.",
                other
            )),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[inline(always)]
fn load8(s: &[f32]) -> f32x8 {
    f32x8::new([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]])
}

pub fn dot_simd(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let chunks = len / LANES;
    let mut sum = f32x8::splat(0.0);
    for j in 0..chunks {
        let s = j * LANES;
        sum += load8(&a[s..s + LANES]) * load8(&b[s..s + LANES]);
    }
    let mut total = sum.reduce_add();
    for i in chunks * LANES..len {
        total += a[i] * b[i];
    }
    total
}

pub fn squared_l2_simd(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let chunks = len / LANES;
    let mut sum = f32x8::splat(0.0);
    for j in 0..chunks {
        let s = j * LANES;
        let d = load8(&a[s..s + LANES]) - load8(&b[s..s + LANES]);
        sum += d * d;
    }
    let mut total = sum.reduce_add();
    for i in chunks * LANES..len {
        let d = a[i] - b[i];
        total += d * d;
    }
    total
}
