use glam::DVec3;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal, UnitSphere};
use serde::{Deserialize, Serialize};

/// How the 1DSfM projection directions are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionSamplingMethod {
    /// Pick input measurements at random, without replacement.
    SampleInputMeasurements,
    /// Sample a kernel density fitted to the input measurements.
    SampleWithInputDensity,
    /// Sample the unit sphere uniformly.
    #[default]
    SampleWithUniformDensity,
}

/// Kernel width, on the unit sphere, of the input density sampler.
const KDE_BANDWIDTH: f64 = 0.1;

impl ProjectionSamplingMethod {
    /// Draw at most `max_samples` unit directions.
    ///
    /// Measurement based methods return nothing when `measurements` is empty.
    pub fn sample<R: Rng>(
        &self,
        measurements: &[DVec3],
        max_samples: usize,
        rng: &mut R,
    ) -> Vec<DVec3> {
        match self {
            ProjectionSamplingMethod::SampleInputMeasurements => {
                let n = max_samples.min(measurements.len());
                rand::seq::index::sample(rng, measurements.len(), n)
                    .into_iter()
                    .map(|i| measurements[i])
                    .collect()
            }
            ProjectionSamplingMethod::SampleWithInputDensity => {
                if measurements.is_empty() {
                    return Vec::new();
                }
                let mut out = Vec::with_capacity(max_samples);
                while out.len() < max_samples {
                    let center = measurements[rng.random_range(0..measurements.len())];
                    let noise = DVec3::new(
                        rng.sample(StandardNormal),
                        rng.sample(StandardNormal),
                        rng.sample(StandardNormal),
                    );
                    let d = center + KDE_BANDWIDTH * noise;
                    if let Some(d) = d.try_normalize() {
                        out.push(d);
                    }
                }
                out
            }
            ProjectionSamplingMethod::SampleWithUniformDensity => (0..max_samples)
                .map(|_| DVec3::from_array(UnitSphere.sample(rng)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_sample_counts() {
        let mut rng = StdRng::seed_from_u64(0);
        let meas = vec![DVec3::X, DVec3::Y, DVec3::Z];

        let s = ProjectionSamplingMethod::SampleInputMeasurements.sample(&meas, 10, &mut rng);
        assert_eq!(s.len(), 3);
        assert!(s.iter().all(|d| meas.contains(d)));

        let s = ProjectionSamplingMethod::SampleWithUniformDensity.sample(&meas, 50, &mut rng);
        assert_eq!(s.len(), 50);
        assert!(s.iter().all(|d| (d.length() - 1.0).abs() < 1e-9));

        let s = ProjectionSamplingMethod::SampleWithInputDensity.sample(&[], 5, &mut rng);
        assert!(s.is_empty());
    }

    #[test]
    fn test_input_density_stays_close() {
        let mut rng = StdRng::seed_from_u64(1);
        let s = ProjectionSamplingMethod::SampleWithInputDensity.sample(&[DVec3::Z], 200, &mut rng);
        assert_eq!(s.len(), 200);
        let mean_dot = s.iter().map(|d| d.dot(DVec3::Z)).sum::<f64>() / 200.0;
        assert!(mean_dot > 0.95);
    }
}
