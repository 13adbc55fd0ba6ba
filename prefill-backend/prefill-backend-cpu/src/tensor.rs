use std::sync::Arc;

use prefill_core::{DType, Tensor};

/// Host tensor. Values are held as `f32` whatever the logical dtype.
#[derive(Clone, Debug)]
pub struct CpuTensor {
    pub(crate) data: Arc<Vec<f32>>,
    pub(crate) shape: Vec<usize>,
    pub(crate) dtype: DType,
}

impl CpuTensor {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        Self::with_dtype(data, shape, DType::F32)
    }

    pub fn with_dtype(data: Vec<f32>, shape: Vec<usize>, dtype: DType) -> Self {
        Self {
            data: Arc::new(data),
            shape,
            dtype,
        }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view; clones the buffer first if it is shared.
    pub fn data_mut(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Tensor for CpuTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_mut_detaches_clones() {
        let a = CpuTensor::new(vec![1.0, 2.0], vec![2]);
        let mut b = a.clone();
        b.data_mut()[0] = 5.0;
        assert_eq!(a.data(), &[1.0, 2.0]);
        assert_eq!(b.data(), &[5.0, 2.0]);
        assert_eq!(b.size_bytes(), 8);
    }
}
