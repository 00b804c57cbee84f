mod common;

use std::sync::Arc;

use batchline::Error;
use batchline_models::TensorInfo;
use batchline_pipelines::{
    Embeddings, FeatureExtractionOptions, FeatureExtractionPipeline, Pipeline, Pooling,
};
use common::*;

/// `[CLS]` maps to `[3, 4]`, padding to `[100, 100]` and any other token to `[1, 0]`.
fn token_embedder() -> MockBackend {
    let forward: ForwardFn = Arc::new(|ids: &[i64], _: &[usize]| {
        ids.iter()
            .flat_map(|&id| match id {
                101 => [3.0, 4.0],
                0 => [100.0, 100.0],
                _ => [1.0, 0.0],
            })
            .collect()
    });
    MockBackend::new(
        bert_inputs(),
        vec![TensorInfo::new("last_hidden_state", vec![-1, -1, 2])],
        forward,
    )
}

fn sentence_embedder() -> MockBackend {
    let forward: ForwardFn = Arc::new(|_: &[i64], dims: &[usize]| [3.0f32, 4.0].repeat(dims[0]));
    MockBackend::new(
        bert_inputs(),
        vec![TensorInfo::new("sentence_embedding", vec![-1, 2])],
        forward,
    )
}

fn pipeline(
    backend: &MockBackend,
    options: FeatureExtractionOptions,
) -> (tempfile::TempDir, FeatureExtractionPipeline) {
    let dir = model_dir(None);
    let base = load_base(&dir, &MockTokenizer::new(), backend).unwrap();
    let pipeline = FeatureExtractionPipeline::from_base(base, Some(options)).unwrap();
    (dir, pipeline)
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-5, "{actual:?} != {expected:?}");
    }
}

fn pooled(embeddings: Embeddings) -> Vec<Vec<f32>> {
    match embeddings {
        Embeddings::Pooled(pooled) => pooled,
        other => panic!("expected pooled embeddings, got {other:?}"),
    }
}

#[test]
fn test_mean_pooling_skips_padding() {
    let options = FeatureExtractionOptions {
        pooling: Some(Pooling::Mean),
        normalize: false,
    };
    let (_dir, pipeline) = pipeline(&token_embedder(), options);
    let embeddings = pooled(
        pipeline
            .run(&strings(&["Paris", "John lives in Paris"]))
            .unwrap(),
    );

    assert_eq!(embeddings.len(), 2);
    // [CLS] Paris [SEP]
    assert_close(&embeddings[0], &[5.0 / 3.0, 4.0 / 3.0]);
    // [CLS] John lives in Paris [SEP]
    assert_close(&embeddings[1], &[8.0 / 6.0, 4.0 / 6.0]);
}

#[test]
fn test_cls_pooling_with_normalization() {
    let options = FeatureExtractionOptions {
        pooling: Some(Pooling::Cls),
        normalize: true,
    };
    let (_dir, pipeline) = pipeline(&token_embedder(), options);
    let embeddings = pooled(pipeline.run_single("John lives").unwrap());
    assert_close(&embeddings[0], &[0.6, 0.8]);
}

#[test]
fn test_token_embeddings_without_pooling() {
    let options = FeatureExtractionOptions {
        pooling: None,
        normalize: false,
    };
    let (_dir, pipeline) = pipeline(&token_embedder(), options);
    let embeddings = pipeline.run(&strings(&["Paris", "John lives"])).unwrap();

    match embeddings {
        Embeddings::Tokens(tokens) => {
            assert_eq!(tokens.len(), 2);
            assert_eq!(tokens[0].len(), 3);
            assert_eq!(tokens[1].len(), 4);
            assert_close(&tokens[0][0], &[3.0, 4.0]);
            assert_close(&tokens[0][1], &[1.0, 0.0]);
        }
        other => panic!("expected token embeddings, got {other:?}"),
    }
}

#[test]
fn test_sentence_embeddings_are_passed_through() {
    let (_dir, pipeline) = pipeline(&sentence_embedder(), FeatureExtractionOptions::default());
    let embeddings = pooled(pipeline.run(&strings(&["John", "Paris"])).unwrap());
    assert_eq!(embeddings.len(), 2);
    assert_close(&embeddings[0], &[0.6, 0.8]);
    assert_close(&embeddings[1], &[0.6, 0.8]);
}

#[test]
fn test_empty_batch() {
    let (_dir, pipeline) = pipeline(&token_embedder(), FeatureExtractionOptions::default());
    assert_eq!(pooled(pipeline.run(&[]).unwrap()), Vec::<Vec<f32>>::new());
}

#[test]
fn test_unknown_output_dimension_is_rejected() {
    let dir = model_dir(None);
    let backend = token_embedder()
        .with_outputs(vec![TensorInfo::new("last_hidden_state", vec![-1, -1, -1])]);
    let base = load_base(&dir, &MockTokenizer::new(), &backend).unwrap();
    let err = FeatureExtractionPipeline::from_base(base, None)
        .err()
        .unwrap();
    assert!(matches!(err, Error::InvalidConfig { .. }));
}
