use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Dense row-major `f32` tensor with a stable name (e.g. `dense_0/kernel`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> CoreResult<Self> {
        let name = name.into();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(CoreError::ShapeMismatch(format!(
                "tensor '{}' has shape {:?} ({} elements) but {} values",
                name,
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { name, shape, data })
    }

    pub fn zeros(name: impl Into<String>, shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            name: name.into(),
            shape,
            data: vec![0.0; len],
        }
    }

    /// Rank-0 convenience constructor.
    pub fn scalar(name: impl Into<String>, value: f32) -> Self {
        Self {
            name: name.into(),
            shape: Vec::new(),
            data: vec![value],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn ensure_same_shape(&self, other: &Tensor) -> CoreResult<()> {
        if self.shape != other.shape {
            return Err(CoreError::ShapeMismatch(format!(
                "'{}' {:?} vs '{}' {:?}",
                self.name, self.shape, other.name, other.shape
            )));
        }
        Ok(())
    }

    pub fn add(&self, other: &Tensor) -> CoreResult<Tensor> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> CoreResult<Tensor> {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn scale(&self, factor: f32) -> Tensor {
        Tensor {
            name: self.name.clone(),
            shape: self.shape.clone(),
            data: self.data.iter().map(|v| v * factor).collect(),
        }
    }

    /// `self += alpha * other`
    pub fn add_scaled(&mut self, other: &Tensor, alpha: f32) -> CoreResult<()> {
        self.ensure_same_shape(other)?;
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += alpha * b;
        }
        Ok(())
    }

    pub fn l2_norm(&self) -> f64 {
        self.data
            .iter()
            .map(|v| f64::from(*v) * f64::from(*v))
            .sum::<f64>()
            .sqrt()
    }

    /// Sum of squared element-wise differences.
    pub fn squared_distance(&self, other: &Tensor) -> CoreResult<f64> {
        self.ensure_same_shape(other)?;
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| {
                let d = f64::from(*a) - f64::from(*b);
                d * d
            })
            .sum())
    }

    fn zip_with(&self, other: &Tensor, op: impl Fn(f32, f32) -> f32) -> CoreResult<Tensor> {
        self.ensure_same_shape(other)?;
        Ok(Tensor {
            name: self.name.clone(),
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| op(*a, *b))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_is_checked_on_construction() {
        assert!(Tensor::new("w", vec![2, 2], vec![1.0; 3]).is_err());
        assert_eq!(Tensor::new("w", vec![2, 2], vec![1.0; 4]).unwrap().len(), 4);
    }

    #[test]
    fn test_arithmetic() {
        let a = Tensor::new("w", vec![3], vec![1.0, 2.0, 3.0]).unwrap();
        let b = Tensor::new("w", vec![3], vec![0.5, 0.5, 0.5]).unwrap();
        assert_eq!(a.sub(&b).unwrap().data, vec![0.5, 1.5, 2.5]);
        assert_eq!(a.add(&b).unwrap().data, vec![1.5, 2.5, 3.5]);
        assert_eq!(b.scale(4.0).data, vec![2.0, 2.0, 2.0]);
        assert_eq!(a.squared_distance(&a).unwrap(), 0.0);
    }

    #[test]
    fn test_norm_and_mismatch() {
        let t = Tensor::new("w", vec![2], vec![3.0, 4.0]).unwrap();
        assert!((t.l2_norm() - 5.0).abs() < 1e-9);
        let other = Tensor::zeros("w", vec![3]);
        assert!(matches!(t.sub(&other), Err(CoreError::ShapeMismatch(_))));
    }
}
