#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use batchline::{Error, Result};
use batchline_models::{Backend, Session, SessionTensor, TensorInfo};
use batchline_pipelines::{BasePipeline, PipelineConfig};
use batchline_tokenizers::{EncodeOptions, Encoding, Tokenizer};
use candle_core::{Device, Tensor};
use tempfile::TempDir;

pub const PAD_ID: u32 = 0;
pub const UNK_ID: u32 = 100;
pub const CLS_ID: u32 = 101;
pub const SEP_ID: u32 = 102;

const VOCAB: &[&str] = &[
    "John", "lives", "in", "Paris", "Wash", "##ing", "##ton", "is", "a", "city", "Mary",
];

pub const NER_CONFIG: &str = r#"{
    "id2label": {"0": "O", "1": "B-PER", "2": "I-PER", "3": "B-LOC", "4": "I-LOC"},
    "label2id": {"O": 0, "B-PER": 1, "I-PER": 2, "B-LOC": 3, "I-LOC": 4}
}"#;

pub const O: usize = 0;
pub const B_PER: usize = 1;
pub const I_PER: usize = 2;
pub const B_LOC: usize = 3;
pub const I_LOC: usize = 4;

/// The id the mock tokenizer gives to a word piece.
pub fn token_id(piece: &str) -> u32 {
    match piece {
        "[PAD]" => PAD_ID,
        "[CLS]" => CLS_ID,
        "[SEP]" => SEP_ID,
        _ => VOCAB
            .iter()
            .position(|p| *p == piece)
            .map_or(UNK_ID, |i| 1000 + i as u32),
    }
}

fn piece_of(id: u32) -> String {
    match id {
        PAD_ID => "[PAD]".to_string(),
        CLS_ID => "[CLS]".to_string(),
        SEP_ID => "[SEP]".to_string(),
        id if id >= 1000 && ((id - 1000) as usize) < VOCAB.len() => {
            VOCAB[(id - 1000) as usize].to_string()
        }
        _ => "[UNK]".to_string(),
    }
}

fn split_words(text: &str) -> Vec<(usize, &str)> {
    let mut words = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                words.push((s, &text[s..i]));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        words.push((s, &text[s..]));
    }
    words
}

/// A whitespace word-piece tokenizer with a tiny vocabulary. `Washington` is split into
/// `Wash`, `##ing` and `##ton`.
#[derive(Debug, Default)]
pub struct MockTokenizer {
    pub encode_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub fail_close: AtomicBool,
    pub offsets_past_end: AtomicBool,
}

impl MockTokenizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_close() -> Arc<Self> {
        let tokenizer = Self::default();
        tokenizer.fail_close.store(true, Ordering::SeqCst);
        Arc::new(tokenizer)
    }

    /// A tokenizer whose word offsets point past the end of the input.
    pub fn offsets_past_end() -> Arc<Self> {
        let tokenizer = Self::default();
        tokenizer.offsets_past_end.store(true, Ordering::SeqCst);
        Arc::new(tokenizer)
    }

    fn pieces(word: &str) -> Vec<String> {
        match word {
            "Washington" => vec!["Wash".into(), "##ing".into(), "##ton".into()],
            other => vec![other.to_string()],
        }
    }
}

impl Tokenizer for MockTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool, options: &EncodeOptions) -> Result<Encoding> {
        self.encode_calls.fetch_add(1, Ordering::SeqCst);
        let mut tokens = Vec::new();
        let mut offsets = Vec::new();
        let mut special = Vec::new();
        if add_special_tokens {
            tokens.push("[CLS]".to_string());
            offsets.push((0, 0));
            special.push(1);
        }
        let shift = if self.offsets_past_end.load(Ordering::SeqCst) {
            text.len() + 1
        } else {
            0
        };
        for (start, word) in split_words(text) {
            let mut cursor = start + shift;
            for piece in Self::pieces(word) {
                let len = piece.trim_start_matches("##").len();
                offsets.push((cursor, cursor + len));
                cursor += len;
                tokens.push(piece);
                special.push(0);
            }
        }
        if add_special_tokens {
            tokens.push("[SEP]".to_string());
            offsets.push((0, 0));
            special.push(1);
        }

        let len = tokens.len();
        Ok(Encoding {
            ids: tokens.iter().map(|t| token_id(t)).collect(),
            tokens: if options.return_tokens { tokens } else { Vec::new() },
            type_ids: if options.return_type_ids { vec![0; len] } else { Vec::new() },
            attention_mask: if options.return_attention_mask { vec![1; len] } else { Vec::new() },
            special_tokens_mask: if options.return_special_tokens_mask { special } else { Vec::new() },
            offsets: if options.return_offsets { offsets } else { Vec::new() },
        })
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut text = String::new();
        for &id in ids {
            if skip_special_tokens && matches!(id, PAD_ID | CLS_ID | SEP_ID) {
                continue;
            }
            let piece = piece_of(id);
            match piece.strip_prefix("##") {
                Some(rest) => text.push_str(rest),
                None => {
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    text.push_str(&piece);
                }
            }
        }
        Ok(text)
    }

    fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(Error::msg("mock tokenizer close failed"));
        }
        Ok(())
    }
}

/// Computes the flattened model output from the flattened `input_ids` and the output shape.
pub type ForwardFn = Arc<dyn Fn(&[i64], &[usize]) -> Vec<f32> + Send + Sync>;

/// The inputs fed to one run: name to (shape, values).
pub type RecordedRun = HashMap<String, (Vec<usize>, Vec<i64>)>;

#[derive(Debug, Default)]
pub struct MockState {
    pub runs: Mutex<Vec<RecordedRun>>,
    pub released: AtomicUsize,
    pub destroy_calls: AtomicUsize,
    pub fail_run: AtomicBool,
    pub fail_release: AtomicBool,
    pub fail_destroy: AtomicBool,
}

impl MockState {
    pub fn num_runs(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    pub fn last_run(&self) -> RecordedRun {
        self.runs.lock().unwrap().last().cloned().unwrap()
    }
}

#[derive(Clone)]
pub struct MockBackend {
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
    pub forward: ForwardFn,
    pub state: Arc<MockState>,
}

pub fn bert_inputs() -> Vec<TensorInfo> {
    vec![
        TensorInfo::new("input_ids", vec![-1, -1]),
        TensorInfo::new("attention_mask", vec![-1, -1]),
    ]
}

impl MockBackend {
    pub fn new(inputs: Vec<TensorInfo>, outputs: Vec<TensorInfo>, forward: ForwardFn) -> Self {
        Self {
            inputs,
            outputs,
            forward,
            state: Arc::new(MockState::default()),
        }
    }

    /// A token classifier predicting `tags[id]` (label `0` otherwise) for every token with a
    /// logit of `10.0`.
    pub fn token_classifier(num_labels: usize, tags: &[(u32, usize)]) -> Self {
        let tags: HashMap<i64, usize> = tags
            .iter()
            .map(|&(id, label)| (i64::from(id), label))
            .collect();
        let forward: ForwardFn = Arc::new(move |ids: &[i64], dims: &[usize]| {
            let labels = dims[dims.len() - 1];
            let mut output = Vec::with_capacity(ids.len() * labels);
            for id in ids {
                let label = tags.get(id).copied().unwrap_or(0);
                for k in 0..labels {
                    output.push(if k == label { 10.0 } else { 0.0 });
                }
            }
            output
        });
        Self::new(
            bert_inputs(),
            vec![TensorInfo::new("logits", vec![-1, -1, num_labels as i64])],
            forward,
        )
    }

    /// A sequence classifier returning `logits` for every input.
    pub fn sequence_classifier(logits: Vec<f32>) -> Self {
        let num_labels = logits.len() as i64;
        let forward: ForwardFn = Arc::new(move |_: &[i64], dims: &[usize]| logits.repeat(dims[0]));
        Self::new(
            bert_inputs(),
            vec![TensorInfo::new("logits", vec![-1, num_labels])],
            forward,
        )
    }

    pub fn with_inputs(mut self, inputs: Vec<TensorInfo>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<TensorInfo>) -> Self {
        self.outputs = outputs;
        self
    }
}

impl Backend for MockBackend {
    fn model_extension(&self) -> &str {
        "onnx"
    }

    fn input_output_info(&self, _model: &[u8]) -> Result<(Vec<TensorInfo>, Vec<TensorInfo>)> {
        Ok((self.inputs.clone(), self.outputs.clone()))
    }

    fn new_session(
        &self,
        _model: &[u8],
        _input_names: &[String],
        _output_names: &[String],
    ) -> Result<Box<dyn Session>> {
        Ok(Box::new(MockSession {
            forward: Arc::clone(&self.forward),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockSession {
    forward: ForwardFn,
    state: Arc<MockState>,
}

impl Session for MockSession {
    fn run(&self, inputs: &[SessionTensor], outputs: &mut [SessionTensor]) -> Result<()> {
        let mut run = RecordedRun::new();
        for input in inputs {
            let values = input.tensor().flatten_all()?.to_vec1::<i64>()?;
            run.insert(input.name().to_string(), (input.dims().to_vec(), values));
        }
        let ids = run
            .get("input_ids")
            .map(|(_, values)| values.clone())
            .unwrap_or_default();
        self.state.runs.lock().unwrap().push(run);

        if self.state.fail_run.load(Ordering::SeqCst) {
            return Err(Error::InferenceError("mock run failed".to_string()));
        }
        for output in outputs.iter_mut() {
            let dims = output.dims().to_vec();
            let values = (self.forward)(&ids, &dims);
            output.set_tensor(Tensor::from_vec(values, dims, &Device::Cpu)?)?;
        }
        Ok(())
    }

    fn release_tensor(&self, _tensor: SessionTensor) -> Result<()> {
        self.state.released.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_release.load(Ordering::SeqCst) {
            return Err(Error::msg("mock release failed"));
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.state.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_destroy.load(Ordering::SeqCst) {
            return Err(Error::msg("mock session destroy failed"));
        }
        Ok(())
    }
}

/// A model directory with a `model.onnx` placeholder and an optional `config.json`.
pub fn model_dir(config: Option<&str>) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("model.onnx"), b"mock model").unwrap();
    if let Some(config) = config {
        fs::write(dir.path().join("config.json"), config).unwrap();
    }
    dir
}

pub fn load_base(
    dir: &TempDir,
    tokenizer: &Arc<MockTokenizer>,
    backend: &MockBackend,
) -> Result<BasePipeline> {
    BasePipeline::load_with_tokenizer(
        &PipelineConfig::new(dir.path(), "test"),
        tokenizer.clone(),
        backend,
    )
}

pub fn strings(inputs: &[&str]) -> Vec<String> {
    inputs.iter().map(|s| s.to_string()).collect()
}
