use batchline::{Error, Result};
use batchline_models::Backend;
use candle_core::{DType, Device, IndexOp, Tensor, D};

use crate::pipeline::{abort_construction, BasePipeline, Pipeline, PipelineBatch, PipelineConfig};

/// The pooling strategy that will be used to pool the outputs of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pooling {
    /// Mean pooling.
    Mean,
    /// Use the CLS token.
    Cls,
}

/// Options for the [`FeatureExtractionPipeline`].
#[derive(Debug, Clone)]
pub struct FeatureExtractionOptions {
    /// The pooling strategy that will be used to pool the outputs of the model. Only used by
    /// models producing one vector per token.
    pub pooling: Option<Pooling>,
    /// Whether to normalize the outputs.
    pub normalize: bool,
}

impl Default for FeatureExtractionOptions {
    fn default() -> Self {
        Self {
            pooling: Some(Pooling::Mean),
            normalize: true,
        }
    }
}

/// The embeddings produced by a [`FeatureExtractionPipeline`].
#[derive(Debug, Clone, PartialEq)]
pub enum Embeddings {
    /// One vector per input.
    Pooled(Vec<Vec<f32>>),
    /// One vector per token of each input, padding excluded.
    Tokens(Vec<Vec<Vec<f32>>>),
}

/// A pipeline for generating embeddings from input texts.
pub struct FeatureExtractionPipeline {
    base: BasePipeline,
    options: FeatureExtractionOptions,
}

impl FeatureExtractionPipeline {
    /// Creates a new `FeatureExtractionPipeline`.
    ///
    /// # Arguments
    ///
    /// * `config` - The directory and name of the pipeline.
    /// * `backend` - The inference engine used to load the model.
    /// * `options` - Optional feature extraction options.
    ///
    /// # Returns
    ///
    /// The `FeatureExtractionPipeline` instance.
    pub fn new(
        config: &PipelineConfig,
        backend: &dyn Backend,
        options: Option<FeatureExtractionOptions>,
    ) -> Result<Self> {
        Self::from_base(BasePipeline::load(config, backend)?, options)
    }

    /// Creates a `FeatureExtractionPipeline` on top of an already loaded [`BasePipeline`].
    pub fn from_base(base: BasePipeline, options: Option<FeatureExtractionOptions>) -> Result<Self> {
        let pipeline = Self {
            base,
            options: options.unwrap_or_default(),
        };
        if let Err(err) = pipeline.validate() {
            return Err(abort_construction(pipeline.base, err));
        }
        Ok(pipeline)
    }

    fn attention_mask(&self, batch: &PipelineBatch) -> Result<Tensor> {
        let mut mask = Vec::with_capacity(batch.batch_size() * batch.max_sequence);
        for input in &batch.input {
            for j in 0..batch.max_sequence {
                mask.push(input.attention_mask.get(j).map_or(0.0, |&m| m as f32));
            }
        }
        Ok(Tensor::from_vec(
            mask,
            (batch.batch_size(), batch.max_sequence),
            &Device::Cpu,
        )?)
    }

    /// Converts the output of the model into embeddings.
    pub fn postprocess(&self, batch: PipelineBatch) -> Result<Embeddings> {
        let batch_size = batch.batch_size();
        let output_dim = self.base.get_output_dim();
        let per_token = self.base.is_per_token_output();

        if batch_size == 0 {
            return Ok(match (per_token, self.options.pooling) {
                (true, None) => Embeddings::Tokens(Vec::new()),
                _ => Embeddings::Pooled(Vec::new()),
            });
        }

        if !per_token {
            let mut outputs =
                Tensor::from_vec(batch.output_tensor, (batch_size, output_dim), &Device::Cpu)?;
            if self.options.normalize {
                outputs = normalize(&outputs)?;
            }
            return Ok(Embeddings::Pooled(outputs.to_vec2::<f32>()?));
        }

        let attention_mask = self.attention_mask(&batch)?;
        let outputs = Tensor::from_vec(
            batch.output_tensor,
            (batch_size, batch.max_sequence, output_dim),
            &Device::Cpu,
        )?;

        match self.options.pooling {
            Some(pooling) => {
                let mut outputs = match pooling {
                    Pooling::Mean => mean_pooling(&outputs, &attention_mask)?,
                    Pooling::Cls => outputs.i((.., 0))?,
                };
                if self.options.normalize {
                    outputs = normalize(&outputs)?;
                }
                Ok(Embeddings::Pooled(outputs.to_vec2::<f32>()?))
            }
            None => {
                let mut embeddings = Vec::with_capacity(batch_size);
                for (i, input) in batch.input.iter().enumerate() {
                    let length = input.token_ids.len().min(batch.max_sequence);
                    let mut tokens = outputs.i(i)?.narrow(0, 0, length)?;
                    if self.options.normalize {
                        tokens = normalize(&tokens)?;
                    }
                    embeddings.push(tokens.to_vec2::<f32>()?);
                }
                Ok(Embeddings::Tokens(embeddings))
            }
        }
    }

    /// Generates an embedding for a single input text.
    pub fn run_single<I: Into<String>>(&self, input: I) -> Result<Embeddings> {
        self.run(&[input.into()])
    }
}

impl Pipeline for FeatureExtractionPipeline {
    type Output = Embeddings;

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
        let mut errors = Vec::new();
        if self.base.get_output_dim() == 0 {
            errors.push(
                self.base
                    .config_error("output dimension of the model must be greater than zero"),
            );
        }
        let rank = self.base.get_outputs_meta().first().map_or(0, |o| o.rank());
        if rank != 2 && rank != 3 {
            errors.push(self.base.config_error(format!(
                "feature extraction requires a model output of rank 2 or 3, got {}",
                rank
            )));
        }
        match Error::join(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Computes the mean pooling of the outputs.
///
/// # Arguments
///
/// * `outputs` - The model outputs.
/// * `attention_mask` - The attention mask.
///
/// # Returns
///
/// The mean pooled tensor.
fn mean_pooling(outputs: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let input_mask_expanded = attention_mask
        .unsqueeze(D::Minus1)?
        .repeat((1, 1, outputs.dims3()?.2))?
        .to_dtype(outputs.dtype())?;
    Ok(outputs
        .mul(&input_mask_expanded)?
        .sum(1)?
        .broadcast_div(&input_mask_expanded.sum(1)?.clamp(1e-9f64, f64::MAX)?)?)
}

/// L2 normalizes the rows of a 2D tensor.
fn normalize(outputs: &Tensor) -> Result<Tensor> {
    let outputs = outputs.to_dtype(DType::F32)?;
    let norms = outputs.powf(2.)?.sum(1)?.sqrt()?.clamp(1e-12f64, f64::MAX)?;
    Ok(outputs.broadcast_div(&norms.unsqueeze(1)?)?)
}
