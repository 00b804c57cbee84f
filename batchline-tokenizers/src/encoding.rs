/// Selects which fields [`crate::Tokenizer::encode`] fills in. Fields that are not requested are
/// returned empty. Token ids are always returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncodeOptions {
    pub return_tokens: bool,
    pub return_type_ids: bool,
    pub return_attention_mask: bool,
    pub return_special_tokens_mask: bool,
    pub return_offsets: bool,
}

impl EncodeOptions {
    /// Requests every field of the encoding.
    pub fn all() -> Self {
        Self {
            return_tokens: true,
            return_type_ids: true,
            return_attention_mask: true,
            return_special_tokens_mask: true,
            return_offsets: true,
        }
    }
}

/// The encoding of a single sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Encoding {
    /// The token strings, as produced by the tokenizer model (e.g. `##ton`).
    pub tokens: Vec<String>,
    pub ids: Vec<u32>,
    pub type_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    /// `1` for special tokens such as `[CLS]` and `[SEP]`, `0` otherwise.
    pub special_tokens_mask: Vec<u32>,
    /// Byte offsets `[start, end)` of each token in the input text.
    pub offsets: Vec<(usize, usize)>,
}

impl Encoding {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Builds an [`Encoding`] from a `tokenizers` encoding keeping only the requested fields.
    pub fn from_core(encoding: &tokenizers::Encoding, options: &EncodeOptions) -> Self {
        Self {
            tokens: if options.return_tokens {
                encoding.get_tokens().to_vec()
            } else {
                Vec::new()
            },
            ids: encoding.get_ids().to_vec(),
            type_ids: if options.return_type_ids {
                encoding.get_type_ids().to_vec()
            } else {
                Vec::new()
            },
            attention_mask: if options.return_attention_mask {
                encoding.get_attention_mask().to_vec()
            } else {
                Vec::new()
            },
            special_tokens_mask: if options.return_special_tokens_mask {
                encoding.get_special_tokens_mask().to_vec()
            } else {
                Vec::new()
            },
            offsets: if options.return_offsets {
                encoding.get_offsets().to_vec()
            } else {
                Vec::new()
            },
        }
    }
}
