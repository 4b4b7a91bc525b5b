//! Bitonic Transpose Sort demo
//!
//! Sorts one surface of random RGBA records with the bitonic/transpose network,
//! either on the CPU reference device or on Metal, and compares the timing and
//! the result against Rust's pdqsort on the packed cells.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use rand::Rng;

use bitonic_transpose_sort::{
    ComputeDevice, Element, MetalDevice, ReferenceDevice, SortComponent, SortConfig,
    SortGeometry,
};

/// Longest a single sort may take before the demo gives up.
const RUN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DeviceKind {
    /// CPU emulation of the kernels
    Reference,
    /// Apple GPU (macOS only)
    Metal,
}

#[derive(Debug, Parser)]
#[command(version, about = "Bitonic sort with a matrix-transpose global phase")]
struct Args {
    /// TOML file with the component configuration
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = DeviceKind::Reference)]
    device: DeviceKind,

    /// Number of timed sorts
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    runs: u32,

    /// Save the surface as a bitmap after the last sort
    #[arg(long)]
    save: bool,

    /// Overrides `screenshot_dir` from the config
    #[arg(long)]
    screenshot_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SortConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => SortConfig::default(),
    };
    if let Some(dir) = &args.screenshot_dir {
        config.screenshot_dir = dir.clone();
    }

    println!("Bitonic Transpose Sort");
    println!("======================\n");

    let geometry = SortGeometry::STANDARD;
    println!(
        "Surface: {}x{} ({} elements), {} dispatches per sort",
        geometry.matrix_width(),
        geometry.matrix_height(),
        geometry.num_elements(),
        geometry.dispatch_count()
    );

    println!("\nGenerating random data...");
    let records = random_records(geometry.num_elements() as usize);

    println!("\n--- CPU Sorting (std::sort unstable / pdqsort) ---");
    let mut expected: Vec<u32> = records.iter().map(Element::pack).collect();
    let cpu_start = Instant::now();
    expected.sort_unstable();
    let cpu_duration = cpu_start.elapsed();
    println!("CPU sort time: {:.3} ms", millis(cpu_duration));

    let sort = Sort {
        args: &args,
        config: &config,
        records: &records,
        expected: &expected,
    };
    let best = match args.device {
        DeviceKind::Reference => {
            println!("\n--- Reference Device (rayon) ---");
            sort.run(ReferenceDevice::new(&geometry), |handle| handle.cells())?
        }
        DeviceKind::Metal => {
            println!("\n--- GPU Sorting (Metal) ---");
            sort.run(MetalDevice::new(&geometry)?, metal_cells)?
        }
    };

    println!("\n--- Performance Comparison ---");
    let speedup = cpu_duration.as_secs_f64() / best.as_secs_f64();
    if speedup > 1.0 {
        println!("Network vs CPU: network is {:.2}x faster", speedup);
    } else {
        println!("Network vs CPU: CPU is {:.2}x faster", 1.0 / speedup);
    }
    Ok(())
}

struct Sort<'a> {
    args: &'a Args,
    config: &'a SortConfig,
    records: &'a [Element],
    expected: &'a [u32],
}

impl Sort<'_> {
    /// Run the timed sorts on `device` and return the fastest one.
    fn run<D: ComputeDevice>(
        &self,
        device: D,
        read_cells: impl Fn(&D::SurfaceHandle) -> Vec<u32>,
    ) -> Result<Duration> {
        let component = SortComponent::create(self.config, device)?;
        component.set_input_data(self.records);

        let mut best = Duration::MAX;
        for run in 1..=self.args.runs {
            if self.args.save && run == self.args.runs {
                component.request_save();
            }

            let start = Instant::now();
            component.request_sort([0.0, 0.0, 0.0, 1.0]);
            if !component.wait_for_idle(RUN_TIMEOUT) {
                bail!("sort {} did not finish within {:?}", run, RUN_TIMEOUT);
            }
            let elapsed = start.elapsed();
            if let Some(e) = component.last_error() {
                bail!("sort {} failed: {}", run, e);
            }

            println!("Sort {} time: {:.3} ms", run, millis(elapsed));
            best = best.min(elapsed);
        }

        let cells = read_cells(&component.surface_handle());
        if cells != self.expected {
            bail!("sorted surface does not match the CPU result");
        }
        println!("Sort verified: OK ({} completed)", component.completed_sorts());
        Ok(best)
    }
}

fn random_records(count: usize) -> Vec<Element> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| Element::new(rng.gen(), rng.gen(), rng.gen(), rng.gen()))
        .collect()
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(target_os = "macos")]
fn metal_cells(handle: &<MetalDevice as ComputeDevice>::SurfaceHandle) -> Vec<u32> {
    handle.cells()
}

#[cfg(not(target_os = "macos"))]
fn metal_cells(handle: &<MetalDevice as ComputeDevice>::SurfaceHandle) -> Vec<u32> {
    match *handle {}
}
