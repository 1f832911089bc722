use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use rten_tensor::Tensor;
use rten_tensor::prelude::*;

use super::Model;

/// A model stored in the rten format
pub struct RtenModel {
    graph: rten::Model,
}

impl RtenModel {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let graph = rten::Model::load_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))?;
        Ok(Self { graph })
    }
}

impl Model for RtenModel {
    fn run(&self, input: ArrayD<f32>) -> anyhow::Result<ArrayD<f32>> {
        let shape = input.shape().to_vec();
        let (values, _) = input.as_standard_layout().into_owned().into_raw_vec_and_offset();
        let tensor = Tensor::from_data(shape.as_slice(), values);
        let output = self
            .graph
            .run_one(tensor.view().into(), None)
            .map_err(|e| anyhow::anyhow!("inference failed: {}", e))?;
        let output: Tensor<f32> = output
            .try_into()
            .map_err(|e| anyhow::anyhow!("model output is not a float tensor: {:?}", e))?;

        Ok(ArrayD::from_shape_vec(IxDyn(output.shape()), output.to_vec())?)
    }
}
