//! Single pass variance accumulation.
//!
//! A population is tracked as `(s, n, t)`: the sum of squared deviations from
//! the mean, the sample count and the sample sum. The variance is `s / n`.
//! Populations recorded on different threads or hosts are combined with the
//! pairwise update of Chan, Golub and LeVeque, which never needs the raw
//! samples.

/// Adds one sample `x` to `s`.
///
/// `n` and `t` must already include `x`.
pub fn add_sample(s: f64, n: u64, t: f64, x: f64) -> f64 {
    if n < 2 {
        return s;
    }
    let n = n as f64;
    let y = n * x - t;
    let out = s + y * y / (n * (n - 1.0));
    if out < 0.0 {
        tracing::warn!(s, n, t, x, out, "add_sample returned a negative sum of squares");
    }
    out
}

/// Combines two populations. Call before adding up the counts and sums.
pub fn add_sum_square(s1: f64, n1: u64, t1: f64, s2: f64, n2: u64, t2: f64) -> f64 {
    let s = match (n1, n2) {
        (_, 0) => s1,
        (0, _) => s2,
        // A single sample is merged as an incremental update.
        (_, 1) => add_sample(s1, n1 + 1, t1 + t2, t2),
        (1, _) => add_sample(s2, n2 + 1, t1 + t2, t1),
        _ => {
            let (f1, f2) = (n1 as f64, n2 as f64);
            let d = (f2 / f1) * t1 - t2;
            let s = s1 + s2 + (f1 / (f2 * (f1 + f2))) * d * d;
            if s < 0.0 {
                tracing::warn!(s1, n1, t1, s2, n2, t2, s, "add_sum_square returned a negative sum of squares");
            }
            s
        }
    };
    if s.is_nan() {
        tracing::warn!(s1, n1, t1, s2, n2, t2, "add_sum_square returned NaN");
    }
    s
}

/// Recovers the sum of squares of the samples added to `(s1, n1, t1)` to make
/// `(s, n, t)`.
///
/// The two snapshots are read without synchronizing with the recording
/// thread, so small inconsistencies are clamped to zero. Returns `NaN` when no
/// samples were added.
pub fn subtract_sum_square(s: f64, n: u64, t: f64, s1: f64, n1: u64, t1: f64) -> f64 {
    let n2 = n.saturating_sub(n1);
    if n1 == 0 {
        return s;
    }
    if n2 == 0 {
        return f64::NAN;
    }
    if n2 == 1 || s < s1 {
        return 0.0;
    }
    let (f1, f2) = (n1 as f64, n2 as f64);
    let t2 = t - t1;
    let d = (f2 / f1) * t1 - t2;
    let s2 = s - s1 - (f1 / (f2 * (f1 + f2))) * d * d;
    if s2.is_nan() {
        tracing::warn!(s, n, t, s1, n1, t1, "subtract_sum_square returned NaN");
        s2
    } else if s2 < 0.0 {
        tracing::trace!(s, n, t, s1, n1, t1, "subtract_sum_square clamped a negative result");
        0.0
    } else {
        s2
    }
}

/// Running `(s, n, t)` triple.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Moments {
    pub s: f64,
    pub n: u64,
    pub t: f64,
}

impl Moments {
    pub fn push(&mut self, x: f64) {
        self.n += 1;
        self.t += x;
        self.s = add_sample(self.s, self.n, self.t, x);
    }

    pub fn merge(&mut self, other: Moments) {
        self.s = add_sum_square(self.s, self.n, self.t, other.s, other.n, other.t);
        self.n += other.n;
        self.t += other.t;
    }

    pub fn variance(&self) -> f64 {
        if self.n == 0 { f64::NAN } else { self.s / self.n as f64 }
    }
}
