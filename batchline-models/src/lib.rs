pub mod backend;
pub mod backends;
pub mod config;

pub use backend::{Backend, Session, SessionTensor, TensorInfo};
pub use backends::onnx::CandleOnnxBackend;
pub use config::{PretrainedConfig, ProblemType};
