#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

use anyhow::Result;
use batchline_examples::{init_tracing, Args};
use batchline_pipelines::{Pipeline, TextClassificationOptions, TextClassificationPipeline};
use clap::Parser;

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let backend = args.backend()?;

    let pipeline = TextClassificationPipeline::new(
        &args.pipeline_config("text-classification"),
        &backend,
        Some(TextClassificationOptions {
            top_k: Some(2),
            ..Default::default()
        }),
    )?;

    let results = pipeline.run_single("This is an awesome library!")?;
    println!("`pipeline.run_single` results: {:?}", results);

    let results = pipeline.run(&[
        "I love this movie".to_string(),
        "The service was terrible".to_string(),
    ])?;
    println!("`pipeline.run` results: {:?}", results);

    Ok(())
}
