//! Accepted-solution history and polynomial projection.
//!
//! All three controllers extrapolate the next initial guess from the last
//! two or three accepted solutions. The parameter attached to each entry is
//! the continuation variable: ramp fraction, swept source value or time.

/// Accepted solution together with its continuation parameter.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub param: f64,
    pub solution: Vec<f64>,
}

/// Polynomial order used for projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    Linear,
    Quadratic,
}

impl Projection {
    fn required_entries(self) -> usize {
        match self {
            Projection::Linear => 2,
            Projection::Quadratic => 3,
        }
    }
}

/// Ring buffer of the three most recent accepted solutions.
#[derive(Debug, Clone, Default)]
pub struct HistoryRing {
    slots: [Option<HistoryEntry>; 3],
    head: usize,
    len: usize,
}

impl HistoryRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.slots = [None, None, None];
        self.head = 0;
        self.len = 0;
    }

    /// Record an accepted solution; the oldest entry is overwritten.
    pub fn push(&mut self, param: f64, solution: &[f64]) {
        self.head = (self.head + 1) % 3;
        match &mut self.slots[self.head] {
            Some(entry) => {
                entry.param = param;
                entry.solution.clear();
                entry.solution.extend_from_slice(solution);
            }
            slot => {
                *slot = Some(HistoryEntry {
                    param,
                    solution: solution.to_vec(),
                })
            }
        }
        self.len = (self.len + 1).min(3);
    }

    /// Entry `age` steps back; 0 is the most recent.
    pub fn get(&self, age: usize) -> Option<&HistoryEntry> {
        if age >= self.len {
            return None;
        }
        self.slots[(self.head + 3 - age) % 3].as_ref()
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.get(0)
    }

    /// Highest projection order the stored history supports.
    pub fn best_projection(&self) -> Option<Projection> {
        match self.len {
            3 => Some(Projection::Quadratic),
            2 => Some(Projection::Linear),
            _ => None,
        }
    }

    /// Weights on the newest, middle and oldest entries that project the
    /// history to `target`.
    pub fn weights(&self, order: Projection, target: f64) -> Option<[f64; 3]> {
        if self.len < order.required_entries() {
            return None;
        }
        let p0 = self.get(0)?.param;
        let p1 = self.get(1)?.param;
        let hn = target - p0;
        let hn1 = p0 - p1;
        let hn2 = match order {
            Projection::Linear => 0.0,
            Projection::Quadratic => p1 - self.get(2)?.param,
        };
        Some(projection_weights(order, hn, hn1, hn2))
    }

    /// Overwrite `out` with the projection of the history to `target`.
    /// Returns false and leaves `out` untouched if history is too short.
    pub fn project(&self, order: Projection, target: f64, out: &mut [f64]) -> bool {
        let Some(w) = self.weights(order, target) else {
            return false;
        };
        let newest = match self.get(0) {
            Some(e) => &e.solution,
            None => return false,
        };
        let middle = match self.get(1) {
            Some(e) => &e.solution,
            None => return false,
        };
        match (order, self.get(2)) {
            (Projection::Quadratic, Some(oldest)) => {
                for (i, xi) in out.iter_mut().enumerate() {
                    *xi = w[0] * newest[i] + w[1] * middle[i] + w[2] * oldest.solution[i];
                }
            }
            _ => {
                for (i, xi) in out.iter_mut().enumerate() {
                    *xi = w[0] * newest[i] + w[1] * middle[i];
                }
            }
        }
        true
    }
}

/// Extrapolation weights for step `hn` beyond the newest point, given the
/// spacings `hn1` (newest to middle) and `hn2` (middle to oldest).
///
/// Linear: `x = (1 + hn/hn1) x1 - hn/hn1 x2`.
/// Quadratic: Lagrange extrapolation through three unequally spaced points.
pub fn projection_weights(order: Projection, hn: f64, hn1: f64, hn2: f64) -> [f64; 3] {
    match order {
        Projection::Linear => {
            let r = hn / hn1;
            [1.0 + r, -r, 0.0]
        }
        Projection::Quadratic => {
            let cn = hn * (hn + 2.0 * hn1 + hn2) / (hn1 * (hn1 + hn2));
            let cn1 = -hn * (hn + hn1 + hn2) / (hn1 * hn2);
            let cn2 = hn * (hn + hn1) / (hn2 * (hn1 + hn2));
            [1.0 + cn, cn1, cn2]
        }
    }
}

/// Replace negative carrier densities in a predicted guess.
///
/// A negative entry falls back to the reference (last accepted) value, or
/// zero if that is negative too.
pub fn clamp_densities(x: &mut [f64], reference: &[f64], density_dofs: &[usize]) {
    for &i in density_dofs {
        if x[i] < 0.0 {
            x[i] = reference[i].max(0.0);
        }
    }
}

/// Bounded LIFO of target values still to be reached after bisection.
#[derive(Debug, Clone)]
pub struct RetryStack {
    pending: Vec<f64>,
    capacity: usize,
}

impl RetryStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    /// Returns false without pushing when the stack is full.
    pub fn push(&mut self, value: f64) -> bool {
        if self.is_full() {
            return false;
        }
        self.pending.push(value);
        true
    }

    pub fn pop(&mut self) -> Option<f64> {
        self.pending.pop()
    }

    pub fn peek(&self) -> Option<f64> {
        self.pending.last().copied()
    }
}
