#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

use anyhow::Result;
use batchline_examples::{init_tracing, Args};
use batchline_pipelines::{
    AggregationStrategy, Pipeline, TokenClassificationOptions, TokenClassificationPipeline,
};
use clap::Parser;

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let backend = args.backend()?;

    let mut pipeline = TokenClassificationPipeline::new(
        &args.pipeline_config("token-classification"),
        &backend,
        None,
    )?;

    let entities = pipeline.run_single("My name is Gabriel and I live in Madrid")?;
    println!("`pipeline.run_single` results: {:?}", entities);

    let batch_entities = pipeline.run(&[
        "My name is Gabriel and I live in Madrid".to_string(),
        "and I'll be traveling to Japan soon".to_string(),
        "I would like to see the Tokyo Tower".to_string(),
    ])?;
    println!("`pipeline.run` results: {:?}", batch_entities);

    for line in pipeline.get_stats() {
        println!("{}", line);
    }
    pipeline.destroy()?;

    let pipeline = TokenClassificationPipeline::new(
        &args.pipeline_config("token-classification-none"),
        &backend,
        Some(TokenClassificationOptions {
            aggregation_strategy: AggregationStrategy::None,
            ..Default::default()
        }),
    )?;
    let tokens = pipeline.run_single("I would like to see the Tokyo Tower")?;
    println!("Per token results: {:?}", tokens);

    Ok(())
}
