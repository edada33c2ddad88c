use serde::{Deserialize, Serialize};

/// A scalar setpoint that may change with the timestep.
///
/// In TOML a constant is written as a plain number and a ramp as a list of
/// `[timestep, value]` pairs:
///
/// ```toml
/// temperature = 1.2
/// pressure = [[0, 1.0], [50000, 2.5]]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variant {
    Constant(f64),
    /// Piecewise-linear interpolation through `(timestep, value)` points sorted by
    /// timestep. Values are held constant before the first and after the last point.
    Linear(Vec<(u64, f64)>),
}

impl Variant {
    /// Returns the setpoint at `timestep`.
    pub fn value(&self, timestep: u64) -> f64 {
        match self {
            Variant::Constant(v) => *v,
            Variant::Linear(points) => {
                let Some(&(first_t, first_v)) = points.first() else {
                    return 0.0;
                };
                if timestep <= first_t {
                    return first_v;
                }
                for pair in points.windows(2) {
                    let ((t0, v0), (t1, v1)) = (pair[0], pair[1]);
                    if timestep <= t1 {
                        if t1 == t0 {
                            return v1;
                        }
                        let f = (timestep - t0) as f64 / (t1 - t0) as f64;
                        return v0 + f * (v1 - v0);
                    }
                }
                points[points.len() - 1].1
            }
        }
    }
}

impl From<f64> for Variant {
    fn from(value: f64) -> Self {
        Variant::Constant(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_ignores_timestep() {
        let v = Variant::from(2.5);
        assert_eq!(v.value(0), 2.5);
        assert_eq!(v.value(1_000_000), 2.5);
    }

    #[test]
    fn linear_interpolates_and_clamps() {
        let v = Variant::Linear(vec![(100, 1.0), (200, 3.0), (400, 3.0)]);
        assert!((v.value(0) - 1.0).abs() < 1e-12);
        assert!((v.value(150) - 2.0).abs() < 1e-12);
        assert!((v.value(300) - 3.0).abs() < 1e-12);
        assert!((v.value(9000) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn deserializes_from_toml_scalars_and_ramps() {
        #[derive(Deserialize)]
        struct Setpoints {
            temperature: Variant,
            pressure: Variant,
        }
        let parsed: Setpoints =
            toml::from_str("temperature = 1.5\npressure = [[0, 1.0], [10, 2.0]]").unwrap();
        assert_eq!(parsed.temperature, Variant::Constant(1.5));
        assert_eq!(parsed.pressure, Variant::Linear(vec![(0, 1.0), (10, 2.0)]));
    }
}
