use batchline::{Error, Result};
use candle_core::{DType, Device, Tensor};

/// Name and shape of a model input or output. Dynamic dimensions are reported as `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub dimensions: Vec<i64>,
}

impl TensorInfo {
    pub fn new<S: Into<String>>(name: S, dimensions: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            dimensions,
        }
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    /// The size of the last dimension, if the tensor has one.
    pub fn last_dim(&self) -> Option<i64> {
        self.dimensions.last().copied()
    }
}

/// A named tensor handed to or filled by a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionTensor {
    name: String,
    tensor: Tensor,
}

impl SessionTensor {
    pub fn new<S: Into<String>>(name: S, tensor: Tensor) -> Self {
        Self {
            name: name.into(),
            tensor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn dims(&self) -> &[usize] {
        self.tensor.dims()
    }

    /// Replaces the content of the tensor. The new tensor must have the same shape.
    pub fn set_tensor(&mut self, tensor: Tensor) -> Result<()> {
        if tensor.dims() != self.tensor.dims() {
            return Err(Error::InferenceError(format!(
                "output '{}' has shape {:?} but {:?} was allocated",
                self.name,
                tensor.dims(),
                self.tensor.dims()
            )));
        }
        self.tensor = tensor;
        Ok(())
    }

    /// Returns the content of the tensor flattened in row-major order.
    pub fn to_vec_f32(&self) -> Result<Vec<f32>> {
        Ok(self
            .tensor
            .flatten_all()?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?)
    }
}

/// An inference engine able to inspect and load models.
pub trait Backend: Send + Sync {
    /// The extension (without the leading dot) of the model files this backend can load.
    fn model_extension(&self) -> &str;

    /// Reads the input and output metadata of a model without creating a session.
    ///
    /// # Arguments
    ///
    /// * `model` - The bytes of the model file.
    ///
    /// # Returns
    ///
    /// The inputs and the outputs of the model.
    fn input_output_info(&self, model: &[u8]) -> Result<(Vec<TensorInfo>, Vec<TensorInfo>)>;

    /// Creates an inference session for a model.
    ///
    /// # Arguments
    ///
    /// * `model` - The bytes of the model file.
    /// * `input_names` - The inputs that will be fed on each run.
    /// * `output_names` - The outputs that will be requested on each run.
    ///
    /// # Returns
    ///
    /// The loaded session.
    fn new_session(
        &self,
        model: &[u8],
        input_names: &[String],
        output_names: &[String],
    ) -> Result<Box<dyn Session>>;
}

/// A loaded model. Implementations must support concurrent calls to `run`.
pub trait Session: Send + Sync {
    /// Allocates an `i64` input tensor holding `data` with the given shape.
    fn new_input_tensor(&self, name: &str, shape: &[usize], data: Vec<i64>) -> Result<SessionTensor> {
        let tensor = Tensor::from_vec(data, shape.to_vec(), &Device::Cpu)?;
        Ok(SessionTensor::new(name, tensor))
    }

    /// Allocates a zero filled `f32` output tensor with the given shape.
    fn new_output_tensor(&self, name: &str, shape: &[usize]) -> Result<SessionTensor> {
        let tensor = Tensor::zeros(shape.to_vec(), DType::F32, &Device::Cpu)?;
        Ok(SessionTensor::new(name, tensor))
    }

    /// Runs the model, filling `outputs` in place.
    fn run(&self, inputs: &[SessionTensor], outputs: &mut [SessionTensor]) -> Result<()>;

    /// Releases a tensor allocated by this session.
    fn release_tensor(&self, tensor: SessionTensor) -> Result<()> {
        drop(tensor);
        Ok(())
    }

    /// Releases the session.
    fn destroy(&self) -> Result<()>;
}
