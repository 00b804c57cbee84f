use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::str::FromStr;

use batchline_models::CandleOnnxBackend;
use batchline_pipelines::PipelineConfig;
use candle_core::Device;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub enum DeviceOption {
    Cpu,
    Metal,
    Cuda(usize),
}

impl FromStr for DeviceOption {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(DeviceOption::Cpu),
            "metal" => Ok(DeviceOption::Metal),
            s if s.starts_with("cuda:") => {
                let id = s["cuda:".len()..].parse::<usize>()?;
                Ok(DeviceOption::Cuda(id))
            }
            _ => Err(anyhow!("Invalid device option: {}", s)),
        }
    }
}

pub fn get_device(device: &DeviceOption) -> Result<Device> {
    let device = match device {
        DeviceOption::Cuda(device_id) if cfg!(feature = "cuda") => Device::new_cuda(*device_id)?,
        DeviceOption::Metal if cfg!(feature = "metal") => Device::new_metal(0)?,
        _ => Device::Cpu,
    };

    Ok(device)
}

/// Common arguments of the example binaries.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory containing `tokenizer.json`, `config.json` and the `.onnx` model.
    #[arg(short, long)]
    pub model_path: PathBuf,

    /// The model file to load when the directory contains several `.onnx` files.
    #[arg(long)]
    pub onnx_filename: Option<String>,

    /// The device to run the pipeline on: `cpu`, `metal` or `cuda:<id>`.
    #[arg(short, long, default_value = "cpu")]
    pub device: DeviceOption,
}

impl Args {
    pub fn pipeline_config(&self, name: &str) -> PipelineConfig {
        let config = PipelineConfig::new(&self.model_path, name);
        match &self.onnx_filename {
            Some(filename) => config.with_onnx_filename(filename),
            None => config,
        }
    }

    pub fn backend(&self) -> Result<CandleOnnxBackend> {
        let device = get_device(&self.device)?;
        println!("Device: {:?}", device);
        Ok(CandleOnnxBackend::new(&device))
    }
}

/// Logs to stderr, filtered by `RUST_LOG` (`info` by default).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
