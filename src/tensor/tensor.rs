use crate::error::{CrnnError, Result};

use super::tensor_desc::TensorDesc;

/// Host-resident f32 tensor. Data is row-major in the order of `desc.to_dims()`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub desc: TensorDesc,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(desc: TensorDesc, data: Vec<f32>) -> Result<Self> {
        if desc.num_elements() != data.len() {
            return Err(CrnnError::ShapeMismatch {
                context: "tensor construction".into(),
                expected: format!("{} elements for {}", desc.num_elements(), desc),
                actual: format!("{} elements", data.len()),
            });
        }
        Ok(Self { desc, data })
    }

    pub fn zeros(desc: TensorDesc) -> Self {
        let data = vec![0.0; desc.num_elements()];
        Self { desc, data }
    }

    pub fn dims(&self) -> Vec<usize> {
        self.desc.to_dims()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reinterprets the buffer under a new descriptor with the same element count.
    pub fn reshaped(self, desc: TensorDesc) -> Result<Self> {
        Self::new(desc, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffer() {
        let err = Tensor::new(TensorDesc::new_matrix(2, 3), vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, CrnnError::ShapeMismatch { .. }));
    }

    #[test]
    fn reshape_preserves_data() {
        let t = Tensor::new(TensorDesc::new_tensor4d(1, 1, 2, 3), (0..6).map(|v| v as f32).collect()).unwrap();
        let r = t.clone().reshaped(TensorDesc::new_sequence(1, 3, 2)).unwrap();
        assert_eq!(r.data, t.data);
        assert_eq!(r.dims(), vec![1, 3, 2]);
    }
}
