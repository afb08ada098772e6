//! TorchScript inference backend

use std::path::Path;

use ndarray::Array3;
use tch::{CModule, Device, Kind, Tensor};

use crate::classifier::{InferenceError, Model};
use crate::model_loader::ModelLoadError;

/// A TorchScript classification module
pub struct TorchScriptModel {
    module: CModule,
    device: Device,
    softmax: bool,
}

impl TorchScriptModel {
    /// Load a module onto CUDA when available, CPU otherwise
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelLoadError> {
        let device = Device::cuda_if_available();
        let module = CModule::load_on_device(path.as_ref(), device)
            .map_err(|e| ModelLoadError::Backend(e.to_string()))?;
        log::info!("TorchScript module loaded on {device:?}");
        Ok(Self {
            module,
            device,
            softmax: false,
        })
    }

    /// Apply softmax to the raw output, for modules exported without it
    pub fn with_softmax(mut self, softmax: bool) -> Self {
        self.softmax = softmax;
        self
    }

    fn to_tensor(&self, input: &Array3<f32>) -> Result<Tensor, InferenceError> {
        let (h, w, c) = input.dim();
        let contiguous = input.as_standard_layout();
        let data = contiguous
            .as_slice()
            .ok_or_else(|| InferenceError::Invocation("input tensor is not contiguous".into()))?;

        Ok(Tensor::from_slice(data)
            .view([1, h as i64, w as i64, c as i64])
            .permute([0, 3, 1, 2])
            .to_device(self.device))
    }
}

impl Model for TorchScriptModel {
    fn predict(&mut self, input: &Array3<f32>) -> Result<Vec<f64>, InferenceError> {
        let tensor = self.to_tensor(input)?;
        let output = tch::no_grad(|| self.module.forward_ts(&[tensor]))
            .map_err(|e| InferenceError::Invocation(e.to_string()))?;

        let mut scores = output.to_device(Device::Cpu).to_kind(Kind::Double).flatten(0, -1);
        if self.softmax {
            scores = scores.softmax(0, Kind::Double);
        }

        let scores = Vec::<f64>::try_from(&scores).map_err(|e| InferenceError::Invocation(e.to_string()))?;
        if scores.is_empty() {
            return Err(InferenceError::EmptyOutput);
        }
        Ok(scores)
    }
}
