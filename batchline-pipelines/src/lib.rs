pub mod feature_extraction;
pub mod pipeline;
pub mod text_classification;
pub mod token_classification;

pub use feature_extraction::{
    Embeddings, FeatureExtractionOptions, FeatureExtractionPipeline, Pooling,
};
pub use pipeline::{BasePipeline, Pipeline, PipelineBatch, PipelineConfig, TokenizedInput};
pub use text_classification::{
    ClassificationFunction, TextClassificationOptions, TextClassificationPipeline,
};
pub use token_classification::{
    AggregationStrategy, Entity, TokenClassificationOptions, TokenClassificationPipeline,
};
