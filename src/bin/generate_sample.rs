//! Writes a small synthetic measurement: `sample_data.parquet` holds the
//! scalar features and declares `sample_traces.parquet` as a file basin
//! for the fluorescence traces.

use std::collections::BTreeMap;

use rusty_rtdc::{BasinDefinition, Dataset, ExportOptions, FeatureColumn};

const EVENTS: usize = 500;
const TRACE_SAMPLES: usize = 64;

fn gaussian(x: f64, mu: f64, sigma: f64, amplitude: f64) -> f64 {
    amplitude * (-(x - mu).powi(2) / (2.0 * sigma.powi(2))).exp()
}

fn generate_trace(peak: f64, width: f64, noise_level: f64, rng: &mut SimpleRng) -> Vec<f64> {
    (0..TRACE_SAMPLES)
        .map(|i| {
            let t = i as f64;
            gaussian(t, TRACE_SAMPLES as f64 / 2.0, width, peak) + rng.gauss(0.0, noise_level)
        })
        .collect()
}

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let mut rng = SimpleRng::new(42);

    // Two populations: small stiff cells and larger, more deformable ones.
    let mut area_um = Vec::with_capacity(EVENTS);
    let mut deform = Vec::with_capacity(EVENTS);
    let mut bright_avg = Vec::with_capacity(EVENTS);
    let mut fl1_max = Vec::with_capacity(EVENTS);
    let mut trace = Vec::with_capacity(EVENTS);
    for i in 0..EVENTS {
        let (area, def) = if i % 3 == 0 {
            (rng.gauss(120.0, 25.0), rng.gauss(0.06, 0.015))
        } else {
            (rng.gauss(45.0, 8.0), rng.gauss(0.02, 0.005))
        };
        let peak = area * rng.gauss(4.0, 0.5);
        let fl = generate_trace(peak, 4.0 + area / 40.0, 2.0, &mut rng);

        area_um.push(area.max(1.0));
        deform.push(def.clamp(0.0, 1.0));
        bright_avg.push(rng.gauss(110.0, 6.0));
        fl1_max.push(fl.iter().copied().fold(f64::MIN, f64::max));
        trace.push(fl);
    }

    let mut columns = BTreeMap::new();
    columns.insert("area_um".to_string(), FeatureColumn::from(area_um));
    columns.insert("deform".to_string(), FeatureColumn::from(deform));
    columns.insert("bright_avg".to_string(), FeatureColumn::from(bright_avg));
    columns.insert("fl1_max".to_string(), FeatureColumn::from(fl1_max));
    columns.insert("trace".to_string(), FeatureColumn::from(trace));

    let mut ds = Dataset::from_columns("sample", columns)?;
    ds.config_mut().set("experiment", "sample", "synthetic blood")?;
    ds.config_mut().set("experiment", "run index", 1i64)?;
    ds.config_mut().set("imaging", "pixel size", 0.34)?;
    ds.config_mut().set("setup", "channel width", 20.0)?;
    ds.config_mut().set("setup", "chip region", "Channel")?;

    let options = ExportOptions::default().unfiltered().overwrite();
    let traces = ds.export().parquet("sample_traces", &["trace"], &options)?;

    let basin = BasinDefinition::file(["sample_traces.parquet"])
        .with_features(["trace"])
        .with_name("fluorescence traces");
    let main_options = ExportOptions {
        basins: vec![basin],
        ..options
    };
    let data = ds.export().parquet(
        "sample_data",
        &["area_um", "deform", "bright_avg", "fl1_max"],
        &main_options,
    )?;

    println!(
        "Wrote {EVENTS} events to {} ({TRACE_SAMPLES}-sample traces in basin {})",
        data.display(),
        traces.display()
    );
    Ok(())
}
