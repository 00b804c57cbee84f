use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use batchline::utils::{select_model_file, MODEL_CONFIG_FILE, TOKENIZER_FILE};
use batchline::{Error, Result, Timings};
use batchline_models::{Backend, PretrainedConfig, Session, SessionTensor, TensorInfo};
use batchline_tokenizers::{EncodeOptions, HfTokenizer, Tokenizer};

const INPUT_IDS: &str = "input_ids";
const TOKEN_TYPE_IDS: &str = "token_type_ids";
const ATTENTION_MASK: &str = "attention_mask";

/// Load-time settings shared by every pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// The directory containing `tokenizer.json`, `config.json` and the model file.
    pub model_path: PathBuf,
    /// The name of the pipeline, used in logs, stats and error messages.
    pub name: String,
    /// The model file to load when the directory contains several of them.
    pub onnx_filename: Option<String>,
}

impl PipelineConfig {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(model_path: P, name: S) -> Self {
        Self {
            model_path: model_path.into(),
            name: name.into(),
            onnx_filename: None,
        }
    }

    pub fn with_onnx_filename<S: Into<String>>(mut self, filename: S) -> Self {
        self.onnx_filename = Some(filename.into());
        self
    }
}

/// The tokenization of one input of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedInput {
    pub raw: String,
    pub tokens: Vec<String>,
    pub token_ids: Vec<u32>,
    pub type_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub special_tokens_mask: Vec<u32>,
    pub offsets: Vec<(usize, usize)>,
    /// The index of the last token with a non-zero attention mask.
    pub max_attention_index: usize,
}

/// A batch travelling through `preprocess`, `forward` and `postprocess`. The tensors are
/// flattened in row-major order with shape `(batch_size, max_sequence)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineBatch {
    pub input: Vec<TokenizedInput>,
    pub ids_tensor: Vec<i64>,
    pub type_ids_tensor: Vec<i64>,
    pub attention_masks_tensor: Vec<i64>,
    pub max_sequence: usize,
    /// The flattened output of the model, filled by `forward`.
    pub output_tensor: Vec<f32>,
}

impl PipelineBatch {
    pub fn batch_size(&self) -> usize {
        self.input.len()
    }
}

/// The parts shared by every pipeline: the tokenizer, the inference session and the timings.
/// Task specific pipelines embed a `BasePipeline` and add their own postprocessing.
pub struct BasePipeline {
    name: String,
    model_path: PathBuf,
    model_file: PathBuf,
    tokenizer: Arc<dyn Tokenizer>,
    session: Box<dyn Session>,
    inputs_meta: Vec<TensorInfo>,
    outputs_meta: Vec<TensorInfo>,
    has_token_type_ids: bool,
    has_attention_mask: bool,
    output_dim: usize,
    tokenizer_timings: Timings,
    pipeline_timings: Timings,
    destroyed: bool,
}

impl BasePipeline {
    /// Loads the tokenizer (`tokenizer.json`) and the model found in `config.model_path`.
    ///
    /// # Arguments
    ///
    /// * `config` - The pipeline configuration.
    /// * `backend` - The inference engine used to load the model.
    ///
    /// # Returns
    ///
    /// The loaded `BasePipeline`.
    pub fn load(config: &PipelineConfig, backend: &dyn Backend) -> Result<Self> {
        let tokenizer = HfTokenizer::from_file(config.model_path.join(TOKENIZER_FILE))?;
        Self::load_with_tokenizer(config, Arc::new(tokenizer), backend)
    }

    /// Loads the model found in `config.model_path` and pairs it with an already created
    /// tokenizer. The tokenizer is closed if loading the model fails.
    pub fn load_with_tokenizer(
        config: &PipelineConfig,
        tokenizer: Arc<dyn Tokenizer>,
        backend: &dyn Backend,
    ) -> Result<Self> {
        match Self::load_model(config, Arc::clone(&tokenizer), backend) {
            Ok(pipeline) => Ok(pipeline),
            Err(err) => Err(match tokenizer.close() {
                Ok(()) => err,
                Err(close_err) => err.chain([close_err]),
            }),
        }
    }

    fn load_model(
        config: &PipelineConfig,
        tokenizer: Arc<dyn Tokenizer>,
        backend: &dyn Backend,
    ) -> Result<Self> {
        let model_file = select_model_file(
            &config.name,
            &config.model_path,
            backend.model_extension(),
            config.onnx_filename.as_deref(),
        )?;
        tracing::debug!(
            "Pipeline '{}': loading model file {}",
            config.name,
            model_file.display()
        );
        let model_bytes = fs::read(&model_file)?;

        let (inputs_meta, outputs_meta) = backend.input_output_info(&model_bytes)?;

        let mut has_token_type_ids = false;
        let mut has_attention_mask = false;
        for input in &inputs_meta {
            match input.name.as_str() {
                INPUT_IDS => {}
                TOKEN_TYPE_IDS => has_token_type_ids = true,
                ATTENTION_MASK => has_attention_mask = true,
                other => {
                    return Err(Error::UnsupportedModelInput {
                        pipeline: config.name.clone(),
                        input: other.to_string(),
                    })
                }
            }
        }

        let first_output = outputs_meta.first().ok_or_else(|| Error::InvalidConfig {
            pipeline: config.name.clone(),
            path: model_file.clone(),
            reason: "the model does not declare any output".to_string(),
        })?;
        // Dynamic or missing dimensions leave the output dimension at zero, which the
        // pipelines reject in `validate`
        let output_dim = first_output
            .last_dim()
            .and_then(|dim| usize::try_from(dim).ok())
            .unwrap_or(0);

        let input_names: Vec<String> = inputs_meta.iter().map(|m| m.name.clone()).collect();
        let output_names: Vec<String> = outputs_meta.iter().map(|m| m.name.clone()).collect();
        let session = backend.new_session(&model_bytes, &input_names, &output_names)?;

        tracing::info!(
            "Pipeline '{}': loaded {} (inputs: {:?}, outputs: {:?})",
            config.name,
            model_file.display(),
            input_names,
            output_names
        );

        Ok(Self {
            name: config.name.clone(),
            model_path: config.model_path.clone(),
            model_file,
            tokenizer,
            session,
            inputs_meta,
            outputs_meta,
            has_token_type_ids,
            has_attention_mask,
            output_dim,
            tokenizer_timings: Timings::new(),
            pipeline_timings: Timings::new(),
            destroyed: false,
        })
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn get_model_file(&self) -> &Path {
        &self.model_file
    }

    pub fn get_tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    pub fn get_inputs_meta(&self) -> &[TensorInfo] {
        &self.inputs_meta
    }

    pub fn get_outputs_meta(&self) -> &[TensorInfo] {
        &self.outputs_meta
    }

    pub fn has_token_type_ids(&self) -> bool {
        self.has_token_type_ids
    }

    pub fn has_attention_mask(&self) -> bool {
        self.has_attention_mask
    }

    /// The size of the last dimension of the model output.
    pub fn get_output_dim(&self) -> usize {
        self.output_dim
    }

    /// Whether the model produces one vector per token (`(batch, sequence, dim)`) rather than
    /// one per input (`(batch, dim)`).
    pub fn is_per_token_output(&self) -> bool {
        self.outputs_meta
            .first()
            .map_or(false, |output| output.rank() == 3)
    }

    pub fn get_tokenizer_timings(&self) -> &Timings {
        &self.tokenizer_timings
    }

    pub fn get_pipeline_timings(&self) -> &Timings {
        &self.pipeline_timings
    }

    /// Reads `config.json` from the model directory.
    pub fn load_pretrained_config(&self) -> Result<PretrainedConfig> {
        let path = self.model_path.join(MODEL_CONFIG_FILE);
        PretrainedConfig::from_file(path.clone()).map_err(|e| Error::InvalidConfig {
            pipeline: self.name.clone(),
            path,
            reason: e.to_string(),
        })
    }

    /// Builds an [`Error::InvalidConfig`] for this pipeline.
    pub fn config_error<S: Into<String>>(&self, reason: S) -> Error {
        Error::InvalidConfig {
            pipeline: self.name.clone(),
            path: self.model_path.clone(),
            reason: reason.into(),
        }
    }

    /// Human readable statistics about the time spent tokenizing and running the model.
    pub fn get_stats(&self) -> Vec<String> {
        vec![
            format!("Statistics for pipeline: {}", self.name),
            self.tokenizer_timings.snapshot().describe("Tokenizer"),
            self.pipeline_timings.snapshot().describe("ONNX"),
        ]
    }

    /// Tokenizes the inputs and lays them out as padded tensors.
    ///
    /// # Arguments
    ///
    /// * `inputs` - The sequences to tokenize.
    ///
    /// # Returns
    ///
    /// The [`PipelineBatch`] with its input tensors filled.
    pub fn preprocess(&self, inputs: &[String]) -> Result<PipelineBatch> {
        let start = Instant::now();
        let options = EncodeOptions::all();

        let mut tokenized = Vec::with_capacity(inputs.len());
        let mut max_sequence = 0;
        for input in inputs {
            let encoding = self.tokenizer.encode(input, true, &options)?;
            let max_attention_index = encoding
                .attention_mask
                .iter()
                .rposition(|&mask| mask != 0)
                .unwrap_or(0);
            max_sequence = max_sequence.max(max_attention_index + 1);
            tokenized.push(TokenizedInput {
                raw: input.clone(),
                tokens: encoding.tokens,
                token_ids: encoding.ids,
                type_ids: encoding.type_ids,
                attention_mask: encoding.attention_mask,
                special_tokens_mask: encoding.special_tokens_mask,
                offsets: encoding.offsets,
                max_attention_index,
            });
        }

        self.tokenizer_timings.record(start.elapsed());
        Ok(self.convert_input_to_tensors(tokenized, max_sequence))
    }

    fn convert_input_to_tensors(
        &self,
        inputs: Vec<TokenizedInput>,
        max_sequence: usize,
    ) -> PipelineBatch {
        let tensor_size = inputs.len() * max_sequence;
        let mut ids_tensor = Vec::with_capacity(tensor_size);
        let mut type_ids_tensor = Vec::with_capacity(tensor_size);
        let mut attention_masks_tensor = Vec::with_capacity(tensor_size);

        for input in &inputs {
            for j in 0..max_sequence {
                match input.token_ids.get(j) {
                    Some(&id) => {
                        ids_tensor.push(i64::from(id));
                        type_ids_tensor.push(if self.has_token_type_ids {
                            input.type_ids.get(j).map_or(0, |&t| i64::from(t))
                        } else {
                            0
                        });
                        attention_masks_tensor.push(if self.has_attention_mask {
                            input.attention_mask.get(j).map_or(0, |&m| i64::from(m))
                        } else {
                            0
                        });
                    }
                    None => {
                        ids_tensor.push(0);
                        type_ids_tensor.push(0);
                        attention_masks_tensor.push(0);
                    }
                }
            }
        }

        PipelineBatch {
            input: inputs,
            ids_tensor,
            type_ids_tensor,
            attention_masks_tensor,
            max_sequence,
            output_tensor: Vec::new(),
        }
    }

    /// The shape of the output tensor for a batch.
    fn output_shape(&self, batch: &PipelineBatch) -> Vec<usize> {
        if self.is_per_token_output() {
            vec![batch.batch_size(), batch.max_sequence, self.output_dim]
        } else {
            vec![batch.batch_size(), self.output_dim]
        }
    }

    /// Runs the model on a preprocessed batch. Every tensor allocated for the call is released
    /// before returning, whatever the outcome, and release failures are reported together with
    /// the error that caused the call to fail.
    ///
    /// # Arguments
    ///
    /// * `batch` - The output of [`BasePipeline::preprocess`].
    ///
    /// # Returns
    ///
    /// The batch with `output_tensor` filled.
    pub fn forward(&self, mut batch: PipelineBatch) -> Result<PipelineBatch> {
        if batch.input.is_empty() {
            return Ok(batch);
        }
        let start = Instant::now();

        let mut input_tensors = Vec::with_capacity(self.inputs_meta.len());
        let mut output_tensors = Vec::with_capacity(1);
        let outcome = self.run_session(&batch, &mut input_tensors, &mut output_tensors);

        let release_errors: Vec<Error> = input_tensors
            .into_iter()
            .chain(output_tensors)
            .filter_map(|tensor| self.session.release_tensor(tensor).err())
            .collect();

        match outcome {
            Ok(output) => {
                if let Some(err) = Error::join(release_errors) {
                    return Err(err);
                }
                batch.output_tensor = output;
                self.pipeline_timings.record(start.elapsed());
                Ok(batch)
            }
            Err(err) => Err(err.chain(release_errors)),
        }
    }

    fn run_session(
        &self,
        batch: &PipelineBatch,
        input_tensors: &mut Vec<SessionTensor>,
        output_tensors: &mut Vec<SessionTensor>,
    ) -> Result<Vec<f32>> {
        let input_shape = [batch.batch_size(), batch.max_sequence];
        for input in &self.inputs_meta {
            let data = match input.name.as_str() {
                INPUT_IDS => batch.ids_tensor.clone(),
                TOKEN_TYPE_IDS => batch.type_ids_tensor.clone(),
                ATTENTION_MASK => batch.attention_masks_tensor.clone(),
                other => {
                    return Err(Error::UnsupportedModelInput {
                        pipeline: self.name.clone(),
                        input: other.to_string(),
                    })
                }
            };
            input_tensors.push(
                self.session
                    .new_input_tensor(&input.name, &input_shape, data)?,
            );
        }

        let output = self
            .outputs_meta
            .first()
            .ok_or_else(|| self.config_error("the model does not declare any output"))?;
        let output_shape = self.output_shape(batch);
        tracing::debug!(
            "Pipeline '{}': running batch with input shape {:?} and output shape {:?}",
            self.name,
            input_shape,
            output_shape
        );
        output_tensors.push(self.session.new_output_tensor(&output.name, &output_shape)?);

        self.session.run(input_tensors, output_tensors)?;
        output_tensors[0].to_vec_f32()
    }

    /// Releases the tokenizer and the session. Both are always attempted and every failure is
    /// reported. Calling `destroy` again is a no-op.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        let errors: Vec<Error> = [self.tokenizer.close(), self.session.destroy()]
            .into_iter()
            .filter_map(|result| result.err())
            .collect();
        tracing::info!("Pipeline '{}': destroyed", self.name);
        match Error::join(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for BasePipeline {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            tracing::warn!(
                "Pipeline '{}': failed to release resources: {}",
                self.name,
                err
            );
        }
    }
}

impl std::fmt::Debug for BasePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasePipeline")
            .field("name", &self.name)
            .field("model_file", &self.model_file)
            .field("inputs_meta", &self.inputs_meta)
            .field("outputs_meta", &self.outputs_meta)
            .field("output_dim", &self.output_dim)
            .finish()
    }
}

/// The interface shared by all the task pipelines: `run` chains `preprocess`, `forward` and a
/// task specific postprocessing step.
pub trait Pipeline: Send + Sync {
    type Output;

    fn base(&self) -> &BasePipeline;

    fn base_mut(&mut self) -> &mut BasePipeline;

    /// Runs the pipeline on a batch of inputs.
    fn run(&self, inputs: &[String]) -> Result<Self::Output>;

    /// Checks the task specific invariants of the pipeline, reporting every violation.
    fn validate(&self) -> Result<()>;

    fn get_stats(&self) -> Vec<String> {
        self.base().get_stats()
    }

    fn get_output_dim(&self) -> usize {
        self.base().get_output_dim()
    }

    fn destroy(&mut self) -> Result<()> {
        self.base_mut().destroy()
    }
}

/// Destroys `base` after a failed construction, reporting release failures along with `err`.
pub(crate) fn abort_construction(mut base: BasePipeline, err: Error) -> Error {
    match base.destroy() {
        Ok(()) => err,
        Err(release_err) => err.chain([release_err]),
    }
}
