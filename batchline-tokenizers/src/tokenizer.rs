use crate::encoding::{EncodeOptions, Encoding};
use batchline::{Error, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokenizers::Tokenizer as CoreTokenizer;

/// The contract a tokenizer has to fulfil to be used by the pipelines. Implementations must be
/// safe to call concurrently from several threads.
pub trait Tokenizer: std::fmt::Debug + Send + Sync {
    /// Encodes a sequence.
    ///
    /// # Arguments
    ///
    /// * `text` - The sequence to encode.
    /// * `add_special_tokens` - A flag indicating if special tokens should be added.
    /// * `options` - Which fields of the encoding should be returned.
    ///
    /// # Returns
    ///
    /// The [`Encoding`] of the sequence.
    fn encode(&self, text: &str, add_special_tokens: bool, options: &EncodeOptions)
        -> Result<Encoding>;

    /// Decodes a list of token ids back into text.
    ///
    /// # Arguments
    ///
    /// * `ids` - The token ids to decode.
    /// * `skip_special_tokens` - A flag indicating if special tokens should be removed.
    ///
    /// # Returns
    ///
    /// The decoded text.
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// Releases the resources held by the tokenizer.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A [`Tokenizer`] backed by a `tokenizers::Tokenizer` loaded from a `tokenizer.json` file.
#[derive(Debug)]
pub struct HfTokenizer {
    tokenizer: CoreTokenizer,
    closed: AtomicBool,
}

impl HfTokenizer {
    /// Wraps a `tokenizers::Tokenizer`. Padding is disabled as it is done by the pipelines, while
    /// the truncation configured in `tokenizer.json` is kept.
    pub fn new(mut tokenizer: CoreTokenizer) -> Self {
        tokenizer.with_padding(None);
        Self {
            tokenizer,
            closed: AtomicBool::new(false),
        }
    }

    /// Loads the tokenizer from a `tokenizer.json` file.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        tracing::debug!("Loading tokenizer from {}", file.as_ref().display());
        let tokenizer = CoreTokenizer::from_file(file.as_ref())
            .map_err(|e| Error::TokenizerBuildError(e.to_string()))?;
        Ok(Self::new(tokenizer))
    }

    /// Loads the tokenizer from the contents of a `tokenizer.json` file.
    pub fn from_bytes<B: AsRef<[u8]>>(bytes: B) -> Result<Self> {
        let tokenizer = CoreTokenizer::from_bytes(bytes)
            .map_err(|e| Error::TokenizerBuildError(e.to_string()))?;
        Ok(Self::new(tokenizer))
    }

    pub fn get_tokenizer(&self) -> &CoreTokenizer {
        &self.tokenizer
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::msg("Tokenizer has already been closed."));
        }
        Ok(())
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(
        &self,
        text: &str,
        add_special_tokens: bool,
        options: &EncodeOptions,
    ) -> Result<Encoding> {
        self.ensure_open()?;
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| Error::TokenizerEncodingError(e.to_string()))?;
        Ok(Encoding::from_core(&encoding, options))
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.ensure_open()?;
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| Error::TokenizerDecodingError(e.to_string()))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
