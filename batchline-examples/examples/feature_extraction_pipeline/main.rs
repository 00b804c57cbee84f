#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

use anyhow::Result;
use batchline_examples::{init_tracing, Args};
use batchline_pipelines::{
    Embeddings, FeatureExtractionOptions, FeatureExtractionPipeline, Pipeline, Pooling,
};
use clap::Parser;

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let backend = args.backend()?;

    let pipeline = FeatureExtractionPipeline::new(
        &args.pipeline_config("feature-extraction"),
        &backend,
        Some(FeatureExtractionOptions {
            pooling: Some(Pooling::Mean),
            normalize: true,
        }),
    )?;

    let results = pipeline.run(&[
        "This is an example sentence".to_string(),
        "Each sentence is converted".to_string(),
    ])?;
    if let Embeddings::Pooled(embeddings) = &results {
        for embedding in embeddings {
            println!("dim={} head={:?}", embedding.len(), &embedding[..embedding.len().min(4)]);
        }
    }

    for line in pipeline.get_stats() {
        println!("{}", line);
    }

    Ok(())
}
