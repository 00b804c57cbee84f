use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use batchline::{Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_onnx::onnx::{self, tensor_shape_proto::dimension, type_proto};
use prost::Message;

use crate::backend::{Backend, Session, SessionTensor, TensorInfo};

const ONNX_EXTENSION: &str = "onnx";

/// A [`Backend`] that evaluates ONNX models with `candle-onnx`.
#[derive(Debug, Clone)]
pub struct CandleOnnxBackend {
    device: Device,
}

impl CandleOnnxBackend {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
        }
    }
}

impl Default for CandleOnnxBackend {
    fn default() -> Self {
        Self::new(&Device::Cpu)
    }
}

fn decode_model(model: &[u8]) -> Result<onnx::ModelProto> {
    onnx::ModelProto::decode(model).map_err(Error::wrap)
}

fn get_graph(model: &onnx::ModelProto) -> Result<&onnx::GraphProto> {
    model
        .graph
        .as_ref()
        .ok_or_else(|| Error::msg("ONNX model does not contain a graph"))
}

fn to_tensor_info(value: &onnx::ValueInfoProto) -> TensorInfo {
    let dimensions = match value.r#type.as_ref().and_then(|t| t.value.as_ref()) {
        Some(type_proto::Value::TensorType(tensor)) => tensor
            .shape
            .as_ref()
            .map(|shape| {
                shape
                    .dim
                    .iter()
                    .map(|dim| match dim.value {
                        Some(dimension::Value::DimValue(size)) => size,
                        _ => -1,
                    })
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    TensorInfo::new(value.name.clone(), dimensions)
}

impl Backend for CandleOnnxBackend {
    fn model_extension(&self) -> &str {
        ONNX_EXTENSION
    }

    fn input_output_info(&self, model: &[u8]) -> Result<(Vec<TensorInfo>, Vec<TensorInfo>)> {
        let model = decode_model(model)?;
        let graph = get_graph(&model)?;
        // Older exports list the initializers as graph inputs too
        let initializers: HashSet<&str> = graph
            .initializer
            .iter()
            .map(|tensor| tensor.name.as_str())
            .collect();
        let inputs = graph
            .input
            .iter()
            .filter(|input| !initializers.contains(input.name.as_str()))
            .map(to_tensor_info)
            .collect();
        let outputs = graph.output.iter().map(to_tensor_info).collect();
        Ok((inputs, outputs))
    }

    fn new_session(
        &self,
        model: &[u8],
        input_names: &[String],
        output_names: &[String],
    ) -> Result<Box<dyn Session>> {
        let model = decode_model(model)?;
        get_graph(&model)?;
        tracing::debug!(
            "Creating candle ONNX session with inputs {:?} and outputs {:?} on {:?}",
            input_names,
            output_names,
            self.device
        );
        Ok(Box::new(CandleOnnxSession {
            model,
            device: self.device.clone(),
            input_names: input_names.to_vec(),
            output_names: output_names.to_vec(),
            destroyed: AtomicBool::new(false),
        }))
    }
}

/// A [`Session`] holding a decoded ONNX model.
pub struct CandleOnnxSession {
    model: onnx::ModelProto,
    device: Device,
    input_names: Vec<String>,
    output_names: Vec<String>,
    destroyed: AtomicBool,
}

impl CandleOnnxSession {
    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::InferenceError(
                "session has already been destroyed".to_string(),
            ));
        }
        Ok(())
    }
}

impl Session for CandleOnnxSession {
    fn new_input_tensor(&self, name: &str, shape: &[usize], data: Vec<i64>) -> Result<SessionTensor> {
        let tensor = Tensor::from_vec(data, shape.to_vec(), &self.device)?;
        Ok(SessionTensor::new(name, tensor))
    }

    fn new_output_tensor(&self, name: &str, shape: &[usize]) -> Result<SessionTensor> {
        let tensor = Tensor::zeros(shape.to_vec(), DType::F32, &self.device)?;
        Ok(SessionTensor::new(name, tensor))
    }

    fn run(&self, inputs: &[SessionTensor], outputs: &mut [SessionTensor]) -> Result<()> {
        self.ensure_alive()?;
        let mut feeds = HashMap::new();
        for input in inputs {
            if !self.input_names.iter().any(|name| name == input.name()) {
                return Err(Error::InferenceError(format!(
                    "unknown input '{}'",
                    input.name()
                )));
            }
            feeds.insert(input.name().to_string(), input.tensor().clone());
        }

        let mut results = candle_onnx::simple_eval(&self.model, feeds)
            .map_err(|e| Error::InferenceError(e.to_string()))?;

        for output in outputs.iter_mut() {
            if !self.output_names.iter().any(|name| name == output.name()) {
                return Err(Error::InferenceError(format!(
                    "unknown output '{}'",
                    output.name()
                )));
            }
            let value = results.remove(output.name()).ok_or_else(|| {
                Error::InferenceError(format!("model did not produce output '{}'", output.name()))
            })?;
            output.set_tensor(value.to_dtype(DType::F32)?)?;
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::Release);
        Ok(())
    }
}
