use backtrace::Backtrace;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub struct WrappedError {
    pub error: Box<dyn std::error::Error + Send + Sync>,
    pub backtrace: Backtrace,
}

impl fmt::Display for WrappedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for WrappedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

// `batchline` main error type
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // -----------------------------------
    // Model directory errors
    // -----------------------------------
    #[error("Pipeline '{pipeline}': no .{extension} file detected at {path}. There should be exactly one model file.")]
    ModelFileNotFound {
        pipeline: String,
        path: PathBuf,
        extension: String,
    },

    #[error("Pipeline '{pipeline}': multiple .{extension} files detected at {path} and no model filename specified.")]
    AmbiguousModelFile {
        pipeline: String,
        path: PathBuf,
        extension: String,
    },

    #[error("Pipeline '{pipeline}': model file '{filename}' not found at {path}.")]
    ModelFileNotMatched {
        pipeline: String,
        path: PathBuf,
        filename: String,
    },

    // -----------------------------------
    // Pipeline configuration errors
    // -----------------------------------
    #[error("Pipeline '{pipeline}' configuration invalid ({path}): {reason}")]
    InvalidConfig {
        pipeline: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Pipeline '{pipeline}': model input '{input}' is not supported. Supported inputs are `input_ids`, `token_type_ids` and `attention_mask`.")]
    UnsupportedModelInput { pipeline: String, input: String },

    #[error("Pipeline '{pipeline}' configuration invalid ({path}): aggregation strategy '{strategy}' is not implemented. Only `none` and `simple` are supported.")]
    UnsupportedAggregationStrategy {
        pipeline: String,
        path: PathBuf,
        strategy: String,
    },

    #[error("Unknown aggregation strategy '{0}'. Expected one of `none`, `simple`, `first`, `average` or `max`.")]
    UnknownAggregationStrategy(String),

    // -----------------------------------
    // Tokenizer errors
    // -----------------------------------
    #[error("Tokenizer build error: {0}")]
    TokenizerBuildError(String),

    #[error("Tokenizer encoding error: {0}.")]
    TokenizerEncodingError(String),

    #[error("Tokenizer decoding error: {0}.")]
    TokenizerDecodingError(String),

    // -----------------------------------
    // Inference engine errors
    // -----------------------------------
    #[error("Inference error: {0}")]
    InferenceError(String),

    // -----------------------------------
    // Postprocessing errors
    // -----------------------------------
    #[error("Could not determine entity type for input '{input}', predicted entity index {index}.")]
    LabelNotFound { input: String, index: usize },

    #[error("{0}")]
    Msg(String),

    // Several errors reported together, e.g. when releasing resources
    #[error("{}", display_multiple(.0))]
    Multiple(Vec<Error>),

    // Wrapped errors from other crates
    #[error(transparent)]
    Wrapped(#[from] WrappedError),
}

fn display_multiple(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<String>>()
        .join("\n")
}

impl Error {
    pub fn wrap(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Wrapped(WrappedError {
            error: Box::new(e),
            backtrace: Backtrace::new(),
        })
    }

    pub fn msg<T: std::fmt::Display>(msg: T) -> Self {
        Error::Msg(msg.to_string())
    }

    /// Combines several errors into one.
    ///
    /// Nested [`Error::Multiple`] values are flattened. Returns `None` if there are no errors and
    /// the error itself if there is only one.
    pub fn join<I: IntoIterator<Item = Error>>(errors: I) -> Option<Error> {
        let mut flat = Vec::new();
        for error in errors {
            match error {
                Error::Multiple(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Error::Multiple(flat)),
        }
    }

    /// Combines this error with `others`, keeping this one first.
    pub fn chain<I: IntoIterator<Item = Error>>(self, others: I) -> Error {
        let mut errors = vec![self];
        errors.extend(others);
        match Error::join(errors) {
            Some(error) => error,
            None => Error::Multiple(Vec::new()),
        }
    }

    /// Returns the individual errors contained in this error.
    pub fn errors(&self) -> Vec<&Error> {
        match self {
            Error::Multiple(inner) => inner.iter().collect(),
            other => vec![other],
        }
    }
}

impl From<candle_core::Error> for Error {
    fn from(e: candle_core::Error) -> Self {
        Error::wrap(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::wrap(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::wrap(e)
    }
}

impl From<walkdir::Error> for Error {
    fn from(e: walkdir::Error) -> Self {
        Error::wrap(e)
    }
}

#[macro_export]
macro_rules! bail {
    ($msg:expr) => {
        return Err($crate::error::Error::msg($msg))
    };
}
