use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use strand::{Point, Series, TimeInfo};

pub const DEFAULT_SEED: u64 = 0x_5354_524E_445F_4245; // fixed seed for stable benchmarks

#[derive(Clone, Debug)]
pub struct Metric {
    pub path: String,
    pub step: i64,
    pub values: Vec<Point>,
}

/// `dc{d}.host{h}.cpu` metrics with `points` values each; roughly
/// `gap_ratio` of the values are gaps.
pub fn generate_metrics(
    seed: u64,
    datacenters: usize,
    hosts: usize,
    points: usize,
    step: i64,
    gap_ratio: f64,
) -> Vec<Metric> {
    assert!(step > 0);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut metrics = Vec::with_capacity(datacenters * hosts);

    for d in 0..datacenters {
        for h in 0..hosts {
            let values = (0..points)
                .map(|_| {
                    if rng.random::<f64>() < gap_ratio {
                        None
                    } else {
                        Some(rng.random::<u32>() as f64 * 0.001)
                    }
                })
                .collect();
            metrics.push(Metric {
                path: format!("dc{}.host{}.cpu", d, h),
                step,
                values,
            });
        }
    }

    metrics
}

pub fn to_series(metrics: &[Metric]) -> Vec<Series> {
    metrics
        .iter()
        .map(|m| {
            let end = m.step * m.values.len() as i64;
            Series::new(m.path.clone(), TimeInfo::new(0, end, m.step), m.values.clone())
        })
        .collect()
}
