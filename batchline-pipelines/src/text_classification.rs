use std::collections::HashMap;

use batchline::ops::{sigmoid, softmax};
use batchline::{Error, Result};
use batchline_models::{Backend, ProblemType};

use crate::pipeline::{abort_construction, BasePipeline, Pipeline, PipelineBatch, PipelineConfig};

/// The function applied to the logits of the model to get the scores of each label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationFunction {
    Softmax,
    Sigmoid,
    /// The raw logits are returned.
    None,
}

impl ClassificationFunction {
    fn apply(&self, logits: &[f32]) -> Vec<f32> {
        match self {
            ClassificationFunction::Softmax => softmax(logits),
            ClassificationFunction::Sigmoid => sigmoid(logits),
            ClassificationFunction::None => logits.to_vec(),
        }
    }
}

/// Options for the [`TextClassificationPipeline`].
#[derive(Debug, Clone, Default)]
pub struct TextClassificationOptions {
    /// The function applied to the logits. When not set it is chosen from the `problem_type`
    /// of the model config: `Sigmoid` for multi-label models and models with a single label,
    /// `Softmax` otherwise.
    pub function: Option<ClassificationFunction>,
    /// The number of labels returned for each input, all of them when not set.
    pub top_k: Option<usize>,
}

/// A pipeline for classifying whole sequences (e.g. sentiment analysis).
pub struct TextClassificationPipeline {
    base: BasePipeline,
    id2label: HashMap<usize, String>,
    function: ClassificationFunction,
    top_k: Option<usize>,
}

impl TextClassificationPipeline {
    /// Creates a new `TextClassificationPipeline`.
    ///
    /// # Arguments
    ///
    /// * `config` - The directory and name of the pipeline.
    /// * `backend` - The inference engine used to load the model.
    /// * `options` - Optional parameters of the pipeline.
    ///
    /// # Returns
    ///
    /// The `TextClassificationPipeline` instance.
    pub fn new(
        config: &PipelineConfig,
        backend: &dyn Backend,
        options: Option<TextClassificationOptions>,
    ) -> Result<Self> {
        Self::from_base(BasePipeline::load(config, backend)?, options)
    }

    /// Creates a `TextClassificationPipeline` on top of an already loaded [`BasePipeline`].
    pub fn from_base(base: BasePipeline, options: Option<TextClassificationOptions>) -> Result<Self> {
        let options = options.unwrap_or_default();

        let config = match base.load_pretrained_config() {
            Ok(config) => config,
            Err(err) => return Err(abort_construction(base, err)),
        };
        let id2label = match config.get_id2label() {
            Some(id2label) => id2label.clone(),
            None => {
                let err = base.config_error("id2label not found in model config");
                return Err(abort_construction(base, err));
            }
        };

        let function = options.function.unwrap_or_else(|| {
            if config.get_problem_type() == &ProblemType::MultiLabelClassification
                || config.num_labels() == 1
            {
                ClassificationFunction::Sigmoid
            } else {
                ClassificationFunction::Softmax
            }
        });

        let pipeline = Self {
            base,
            id2label,
            function,
            top_k: options.top_k,
        };
        if let Err(err) = pipeline.validate() {
            return Err(abort_construction(pipeline.base, err));
        }
        tracing::info!(
            "Pipeline '{}': text classification with {} labels ({:?})",
            pipeline.base.get_name(),
            pipeline.id2label.len(),
            pipeline.function
        );
        Ok(pipeline)
    }

    pub fn get_id2label(&self) -> &HashMap<usize, String> {
        &self.id2label
    }

    pub fn get_function(&self) -> ClassificationFunction {
        self.function
    }

    /// Converts the logits of the model into `(label, score)` pairs sorted by descending score,
    /// one list per input.
    pub fn postprocess(&self, batch: PipelineBatch) -> Result<Vec<Vec<(String, f32)>>> {
        let output_dim = self.base.get_output_dim();
        let expected = batch.batch_size() * output_dim;
        if output_dim == 0 || batch.output_tensor.len() != expected {
            return Err(Error::InferenceError(format!(
                "expected an output of {} values for {} inputs and {} labels, got {}",
                expected,
                batch.batch_size(),
                output_dim,
                batch.output_tensor.len()
            )));
        }

        let mut results = Vec::with_capacity(batch.batch_size());
        for (input, logits) in batch.input.iter().zip(batch.output_tensor.chunks_exact(output_dim))
        {
            let scores = self.function.apply(logits);
            let mut labelled = scores
                .into_iter()
                .enumerate()
                .map(|(idx, score)| {
                    self.id2label
                        .get(&idx)
                        .map(|label| (label.clone(), score))
                        .ok_or_else(|| Error::LabelNotFound {
                            input: input.raw.clone(),
                            index: idx,
                        })
                })
                .collect::<Result<Vec<(String, f32)>>>()?;
            labelled.sort_by(|a, b| b.1.total_cmp(&a.1));
            if let Some(top_k) = self.top_k {
                labelled.truncate(top_k);
            }
            results.push(labelled);
        }
        Ok(results)
    }

    /// Classifies a single sequence.
    pub fn run_single<I: Into<String>>(&self, input: I) -> Result<Vec<(String, f32)>> {
        self.run(&[input.into()])?
            .pop()
            .ok_or_else(|| Error::msg("No results after running postprocessing"))
    }
}

impl Pipeline for TextClassificationPipeline {
    type Output = Vec<Vec<(String, f32)>>;

    fn base(&self) -> &BasePipeline {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BasePipeline {
        &mut self.base
    }

    fn run(&self, inputs: &[String]) -> Result<Self::Output> {
        let batch = self.base.preprocess(inputs)?;
        let batch = self.base.forward(batch)?;
        self.postprocess(batch)
    }

    fn validate(&self) -> Result<()> {
        let output_dim = self.base.get_output_dim();
        let mut errors = Vec::new();
        if output_dim == 0 {
            errors.push(
                self.base
                    .config_error("output dimension of the model must be greater than zero"),
            );
        }
        if self.id2label.is_empty() {
            errors.push(self.base.config_error(
                "length of id2label map for text classification must be greater than zero",
            ));
        }
        if self.id2label.len() != output_dim {
            errors.push(self.base.config_error(format!(
                "length of id2label map ({}) does not match model output dimension ({})",
                self.id2label.len(),
                output_dim
            )));
        }
        if self.base.is_per_token_output() {
            errors.push(
                self.base
                    .config_error("text classification requires one output vector per input"),
            );
        }
        match Error::join(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
