pub mod encoding;
pub mod tokenizer;

pub use encoding::{EncodeOptions, Encoding};
pub use tokenizer::{HfTokenizer, Tokenizer};
