//! Time-dependent source waveforms (PULSE, SIN, PWL, EXP).

use std::f64::consts::TAU;

#[derive(Debug, Clone, PartialEq)]
pub struct Pulse {
    pub low: f64,
    pub high: f64,
    pub delay: f64,
    pub rise: f64,
    pub fall: f64,
    pub width: f64,
    /// Non-positive means a single pulse.
    pub period: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Waveform {
    Pulse(Pulse),
    Sin {
        offset: f64,
        amplitude: f64,
        freq: f64,
        delay: f64,
        damping: f64,
    },
    /// `(time, value)` breakpoints, ascending in time.
    Pwl(Vec<(f64, f64)>),
    Exp {
        initial: f64,
        pulsed: f64,
        rise_delay: f64,
        rise_tau: f64,
        fall_delay: f64,
        fall_tau: f64,
    },
}

impl Waveform {
    pub fn value_at(&self, t: f64) -> f64 {
        match self {
            Waveform::Pulse(p) => p.value_at(t),
            Waveform::Sin {
                offset,
                amplitude,
                freq,
                delay,
                damping,
            } => {
                if t < *delay {
                    return *offset;
                }
                let age = t - delay;
                offset + amplitude * (TAU * freq * age).sin() * (-age * damping).exp()
            }
            Waveform::Pwl(points) => pwl_value(points, t),
            Waveform::Exp {
                initial,
                pulsed,
                rise_delay,
                rise_tau,
                fall_delay,
                fall_tau,
            } => {
                let swing = pulsed - initial;
                let charge = |delay: f64, tau: f64| {
                    if t < delay {
                        0.0
                    } else {
                        1.0 - (-(t - delay) / tau).exp()
                    }
                };
                initial + swing * (charge(*rise_delay, *rise_tau) - charge(*fall_delay, *fall_tau))
            }
        }
    }
}

impl Pulse {
    pub fn value_at(&self, t: f64) -> f64 {
        if t < self.delay {
            return self.low;
        }
        let mut phase = t - self.delay;
        if self.period > 0.0 {
            phase %= self.period;
        }
        let ramp = |from: f64, to: f64, elapsed: f64, duration: f64| {
            if duration > 0.0 {
                from + (to - from) * elapsed / duration
            } else {
                to
            }
        };
        let top = self.rise + self.width;
        if phase < self.rise {
            ramp(self.low, self.high, phase, self.rise)
        } else if phase < top {
            self.high
        } else if phase < top + self.fall {
            ramp(self.high, self.low, phase - top, self.fall)
        } else {
            self.low
        }
    }
}

fn pwl_value(points: &[(f64, f64)], t: f64) -> f64 {
    let (Some(&(t_first, v_first)), Some(&(t_last, v_last))) = (points.first(), points.last()) else {
        return 0.0;
    };
    if t <= t_first {
        return v_first;
    }
    if t >= t_last {
        return v_last;
    }
    let k = points.partition_point(|&(tk, _)| tk < t);
    let (t0, v0) = points[k - 1];
    let (t1, v1) = points[k];
    v0 + (v1 - v0) * (t - t0) / (t1 - t0)
}
