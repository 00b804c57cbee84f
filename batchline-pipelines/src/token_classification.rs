use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use batchline::ops::{argmax, mean, softmax};
use batchline::{bail, Error, Result};
use batchline_models::Backend;
use serde::Serialize;

use crate::pipeline::{
    abort_construction, BasePipeline, Pipeline, PipelineBatch, PipelineConfig, TokenizedInput,
};

#[derive(Debug, Clone)]
struct PreEntity {
    word: String,
    token_id: u32,
    token_scores: Vec<f32>,
    start: usize,
    end: usize,
    index: usize,
    is_subword: bool,
}

/// A labelled span of the input: a single token, or a group of tokens when the entities are
/// aggregated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[non_exhaustive]
pub struct Entity {
    entity: String,
    score: f32,
    index: usize,
    word: String,
    start: usize,
    end: usize,
    tokens_ids: Vec<u32>,
    is_subword: bool,
}

impl Entity {
    pub fn new(
        entity: String,
        score: f32,
        index: usize,
        word: String,
        start: usize,
        end: usize,
        tokens_ids: Vec<u32>,
        is_subword: bool,
    ) -> Self {
        Self {
            entity,
            score,
            index,
            word,
            start,
            end,
            tokens_ids,
            is_subword,
        }
    }

    pub fn get_word(&self) -> &str {
        &self.word
    }

    pub fn get_entity(&self) -> &str {
        &self.entity
    }

    pub fn get_score(&self) -> f32 {
        self.score
    }

    pub fn get_start(&self) -> usize {
        self.start
    }

    pub fn get_end(&self) -> usize {
        self.end
    }

    /// The position of the (first) token of the entity in the encoded input.
    pub fn get_index(&self) -> usize {
        self.index
    }

    /// The id of the token for ungrouped entities, or of the first token of a group.
    pub fn get_token_id(&self) -> Option<u32> {
        self.tokens_ids.first().copied()
    }

    pub fn get_tokens_ids(&self) -> &[u32] {
        &self.tokens_ids
    }

    pub fn is_subword(&self) -> bool {
        self.is_subword
    }
}

/// How the token predictions are turned into entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationStrategy {
    /// One entity per token.
    None,
    /// Adjacent tokens with the same entity type are merged following the BIO tags.
    Simple,
    First,
    Average,
    Max,
}

impl AggregationStrategy {
    fn is_supported(&self) -> bool {
        matches!(self, AggregationStrategy::None | AggregationStrategy::Simple)
    }
}

impl fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregationStrategy::None => "none",
            AggregationStrategy::Simple => "simple",
            AggregationStrategy::First => "first",
            AggregationStrategy::Average => "average",
            AggregationStrategy::Max => "max",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for AggregationStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(AggregationStrategy::None),
            "simple" => Ok(AggregationStrategy::Simple),
            "first" => Ok(AggregationStrategy::First),
            "average" => Ok(AggregationStrategy::Average),
            "max" => Ok(AggregationStrategy::Max),
            _ => Err(Error::UnknownAggregationStrategy(s.to_string())),
        }
    }
}

/// Options for the [`TokenClassificationPipeline`].
#[derive(Debug, Clone)]
pub struct TokenClassificationOptions {
    /// How token predictions are merged into entities. Defaults to `Simple`.
    pub aggregation_strategy: AggregationStrategy,
    /// Entities with one of these labels are removed from the output. Defaults to `["O"]`, an
    /// empty list is replaced by the default.
    pub ignore_labels: Vec<String>,
}

impl Default for TokenClassificationOptions {
    fn default() -> Self {
        Self {
            aggregation_strategy: AggregationStrategy::Simple,
            ignore_labels: vec!["O".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagPrefix {
    Begin,
    Inside,
}

/// Splits a label into its BIO prefix and its entity type. Labels without a `B-` or `I-` prefix
/// are treated as a continuation of their own type.
fn get_tag(entity_name: &str) -> (TagPrefix, &str) {
    if let Some(tag) = entity_name.strip_prefix("B-") {
        (TagPrefix::Begin, tag)
    } else if let Some(tag) = entity_name.strip_prefix("I-") {
        (TagPrefix::Inside, tag)
    } else {
        (TagPrefix::Inside, entity_name)
    }
}

fn unsupported_strategy(pipeline: &str, path: &Path, strategy: AggregationStrategy) -> Error {
    Error::UnsupportedAggregationStrategy {
        pipeline: pipeline.to_string(),
        path: path.to_path_buf(),
        strategy: strategy.to_string(),
    }
}

/// A pipeline for token classification (e.g. named entity recognition).
pub struct TokenClassificationPipeline {
    base: BasePipeline,
    id2label: HashMap<usize, String>,
    aggregation_strategy: AggregationStrategy,
    ignore_labels: Vec<String>,
}

impl TokenClassificationPipeline {
    /// Creates a new `TokenClassificationPipeline`.
    ///
    /// # Arguments
    ///
    /// * `config` - The directory and name of the pipeline.
    /// * `backend` - The inference engine used to load the model.
    /// * `options` - Optional parameters of the pipeline.
    ///
    /// # Returns
    ///
    /// The `TokenClassificationPipeline` instance.
    pub fn new(
        config: &PipelineConfig,
        backend: &dyn Backend,
        options: Option<TokenClassificationOptions>,
    ) -> Result<Self> {
        let options = options.unwrap_or_default();
        if !options.aggregation_strategy.is_supported() {
            return Err(unsupported_strategy(
                &config.name,
                &config.model_path,
                options.aggregation_strategy,
            ));
        }
        let base = BasePipeline::load(config, backend)?;
        Self::from_base(base, Some(options))
    }

    /// Creates a `TokenClassificationPipeline` on top of an already loaded [`BasePipeline`].
    /// The label map is read from `config.json`. The base pipeline is destroyed if the
    /// configuration is not valid.
    pub fn from_base(base: BasePipeline, options: Option<TokenClassificationOptions>) -> Result<Self> {
        let options = options.unwrap_or_default();
        if !options.aggregation_strategy.is_supported() {
            let err = unsupported_strategy(
                base.get_name(),
                base.get_model_path(),
                options.aggregation_strategy,
            );
            return Err(abort_construction(base, err));
        }

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

        let ignore_labels = if options.ignore_labels.is_empty() {
            TokenClassificationOptions::default().ignore_labels
        } else {
            options.ignore_labels
        };

        let pipeline = Self {
            base,
            id2label,
            aggregation_strategy: options.aggregation_strategy,
            ignore_labels,
        };
        if let Err(err) = pipeline.validate() {
            return Err(abort_construction(pipeline.base, err));
        }
        tracing::info!(
            "Pipeline '{}': token classification with {} labels and {} aggregation",
            pipeline.base.get_name(),
            pipeline.id2label.len(),
            pipeline.aggregation_strategy
        );
        Ok(pipeline)
    }

    pub fn get_id2label(&self) -> &HashMap<usize, String> {
        &self.id2label
    }

    pub fn get_aggregation_strategy(&self) -> AggregationStrategy {
        self.aggregation_strategy
    }

    pub fn get_ignore_labels(&self) -> &[String] {
        &self.ignore_labels
    }

    /// Splits the flat output of the model into one score vector per real token of each input,
    /// dropping the padding positions and applying softmax.
    fn split_scores(&self, batch: &PipelineBatch) -> Result<Vec<Vec<Vec<f32>>>> {
        let output_dim = self.base.get_output_dim();
        let row_size = batch.max_sequence * output_dim;
        let expected = batch.batch_size() * row_size;
        if output_dim == 0 || batch.output_tensor.len() != expected {
            return Err(Error::InferenceError(format!(
                "expected an output of {} values for {} inputs of {} tokens and {} labels, got {}",
                expected,
                batch.batch_size(),
                batch.max_sequence,
                output_dim,
                batch.output_tensor.len()
            )));
        }
        if expected == 0 {
            return Ok(vec![Vec::new(); batch.batch_size()]);
        }

        Ok(batch
            .input
            .iter()
            .zip(batch.output_tensor.chunks_exact(row_size))
            .map(|(input, row)| {
                row.chunks_exact(output_dim)
                    .take(input.token_ids.len())
                    .map(softmax)
                    .collect()
            })
            .collect())
    }

    /// Builds a [`PreEntity`] for every non special token. Fails when the tokenizer did not
    /// return the token text or a valid span of the input for one of them.
    fn gather_pre_entities(
        &self,
        input: &TokenizedInput,
        scores: Vec<Vec<f32>>,
    ) -> Result<Vec<PreEntity>> {
        let sentence = input.raw.as_str();
        let mut pre_entities = Vec::with_capacity(scores.len());
        for (j, token_scores) in scores.into_iter().enumerate() {
            let missing = |field: &str| {
                Error::InferenceError(format!(
                    "tokenizer returned no {} for token {} of input '{}'",
                    field, j, input.raw
                ))
            };
            let special = *input
                .special_tokens_mask
                .get(j)
                .ok_or_else(|| missing("special tokens mask"))?;
            if special != 0 {
                continue;
            }
            let word = input.tokens.get(j).ok_or_else(|| missing("token"))?.clone();
            let (start, end) = *input.offsets.get(j).ok_or_else(|| missing("offsets"))?;
            let token_id = *input.token_ids.get(j).ok_or_else(|| missing("id"))?;
            let word_ref = sentence.get(start..end).ok_or_else(|| {
                Error::InferenceError(format!(
                    "offsets ({}, {}) of token {} are not a valid span of input '{}'",
                    start, end, j, input.raw
                ))
            })?;
            // The token text and the span of the input only differ for sub-word tokens
            // such as `##ton`
            let is_subword = word.len() != word_ref.len();
            pre_entities.push(PreEntity {
                word,
                token_id,
                token_scores,
                start,
                end,
                index: j,
                is_subword,
            });
        }
        Ok(pre_entities)
    }

    fn aggregate(&self, input: &TokenizedInput, pre_entities: Vec<PreEntity>) -> Result<Vec<Entity>> {
        if !self.aggregation_strategy.is_supported() {
            return Err(unsupported_strategy(
                self.base.get_name(),
                self.base.get_model_path(),
                self.aggregation_strategy,
            ));
        }

        let mut entities = Vec::with_capacity(pre_entities.len());
        for pre_entity in pre_entities {
            let (idx, score) = argmax(&pre_entity.token_scores).ok_or_else(|| {
                Error::InferenceError(format!(
                    "empty scores for token {} of input '{}'",
                    pre_entity.index, input.raw
                ))
            })?;
            let entity = self.id2label.get(&idx).ok_or_else(|| Error::LabelNotFound {
                input: input.raw.clone(),
                index: idx,
            })?;
            entities.push(Entity::new(
                entity.clone(),
                score,
                pre_entity.index,
                pre_entity.word,
                pre_entity.start,
                pre_entity.end,
                vec![pre_entity.token_id],
                pre_entity.is_subword,
            ));
        }

        if self.aggregation_strategy == AggregationStrategy::None {
            return Ok(entities);
        }
        self.group_entities(entities)
    }

    fn group_sub_entities(&self, entities: Vec<Entity>) -> Result<Entity> {
        let (first_entity, last_entity) = match (entities.first(), entities.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => bail!("cannot group an empty list of entities"),
        };
        let (_, entity) = get_tag(&first_entity.entity);
        let scores: Vec<f32> = entities.iter().map(|entity| entity.score).collect();
        let token_ids: Vec<u32> = entities
            .iter()
            .flat_map(|entity| entity.tokens_ids.iter().copied())
            .collect();
        // Decoding puts back the separators between words and merges sub-word pieces
        let word = self.base.get_tokenizer().decode(&token_ids, false)?;
        Ok(Entity::new(
            entity.to_string(),
            mean(&scores),
            first_entity.index,
            word,
            first_entity.start,
            last_entity.end,
            token_ids,
            false,
        ))
    }

    /// Groups adjacent entities with the same type. An entity continues the current group when
    /// its type matches and it is not tagged `B-`.
    fn group_entities(&self, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        let mut entity_groups: Vec<Entity> = Vec::new();
        let mut entity_group_disagg: Vec<Entity> = Vec::new();

        for entity in entities {
            let continues_group = match entity_group_disagg.last() {
                None => true,
                Some(last) => {
                    let (bi, tag) = get_tag(&entity.entity);
                    let (_, last_tag) = get_tag(&last.entity);
                    tag == last_tag && bi != TagPrefix::Begin
                }
            };
            if continues_group {
                entity_group_disagg.push(entity);
            } else {
                let group = std::mem::replace(&mut entity_group_disagg, vec![entity]);
                entity_groups.push(self.group_sub_entities(group)?);
            }
        }

        if !entity_group_disagg.is_empty() {
            entity_groups.push(self.group_sub_entities(entity_group_disagg)?);
        }
        Ok(entity_groups)
    }

    fn filter_entities(&self, entities: Vec<Entity>) -> Vec<Entity> {
        entities
            .into_iter()
            .filter(|entity| {
                !entity.entity.is_empty() && !self.ignore_labels.contains(&entity.entity)
            })
            .collect()
    }

    /// Converts the output of the model into entities, one list per input.
    pub fn postprocess(&self, batch: PipelineBatch) -> Result<Vec<Vec<Entity>>> {
        let batch_scores = self.split_scores(&batch)?;
        let mut batch_entities = Vec::with_capacity(batch.batch_size());
        for (input, scores) in batch.input.iter().zip(batch_scores) {
            let pre_entities = self.gather_pre_entities(input, scores)?;
            let entities = self.aggregate(input, pre_entities)?;
            batch_entities.push(self.filter_entities(entities));
        }
        Ok(batch_entities)
    }

    /// Identifies the entities in a single sentence.
    pub fn run_single<I: Into<String>>(&self, input: I) -> Result<Vec<Entity>> {
        self.run(&[input.into()])?
            .pop()
            .ok_or_else(|| Error::msg("No results after running postprocessing"))
    }
}

impl Pipeline for TokenClassificationPipeline {
    type Output = Vec<Vec<Entity>>;

    fn base(&self) -> &BasePipeline {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BasePipeline {
        &mut self.base
    }

    /// Identifies the entities in a list of sentences.
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
                "length of id2label map for token classification must be greater than zero",
            ));
        }
        if self.id2label.len() != output_dim {
            errors.push(self.base.config_error(format!(
                "length of id2label map ({}) does not match model output dimension ({})",
                self.id2label.len(),
                output_dim
            )));
        }
        if !self.base.is_per_token_output() {
            errors.push(
                self.base
                    .config_error("token classification requires a per token model output"),
            );
        }
        match Error::join(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
