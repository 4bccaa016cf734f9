use serde::{Deserialize, Serialize};

use super::Model;
use crate::error::{CoreError, CoreResult};

/// A minibatch of row-major samples.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    pub inputs: Vec<Vec<f32>>,
    pub targets: Vec<Vec<f32>>,
}

impl Batch {
    pub fn new(inputs: Vec<Vec<f32>>, targets: Vec<Vec<f32>>) -> CoreResult<Self> {
        if inputs.len() != targets.len() {
            return Err(CoreError::ShapeMismatch(format!(
                "batch has {} inputs but {} targets",
                inputs.len(),
                targets.len()
            )));
        }
        Ok(Self { inputs, targets })
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct FitReport {
    pub epochs: usize,
    pub samples: usize,
    /// Metrics over the training data after the last epoch.
    pub final_metrics: Evaluation,
}

/// The numeric runtime the federated pipeline treats as opaque.
pub trait Trainer: Send + Sync {
    /// Fit `model` in place. Non-trainable layers must stay untouched.
    fn fit(&self, model: &mut Model, batches: &[Batch], epochs: usize) -> CoreResult<FitReport>;

    fn evaluate(&self, model: &Model, batches: &[Batch]) -> CoreResult<Evaluation>;
}

/// Plain SGD on a stack of linear dense layers with mean-squared-error loss.
#[derive(Debug, Clone, Copy)]
pub struct LinearTrainer {
    pub learning_rate: f32,
}

impl LinearTrainer {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Default for LinearTrainer {
    fn default() -> Self {
        Self::new(0.01)
    }
}

/// (kernel, bias, fan_in, fan_out) view of one dense layer.
fn dense_view(model: &Model, index: usize) -> CoreResult<(&[f32], &[f32], usize, usize)> {
    let layer = &model.layers[index];
    match layer.params.as_slice() {
        [kernel, bias] if kernel.shape.len() == 2 && bias.shape == [kernel.shape[1]] => {
            Ok((&kernel.data, &bias.data, kernel.shape[0], kernel.shape[1]))
        }
        _ => Err(CoreError::ShapeMismatch(format!(
            "layer '{}' is not a dense kernel/bias pair",
            layer.name
        ))),
    }
}

/// Activations of every layer, input first.
fn forward(model: &Model, input: &[f32]) -> CoreResult<Vec<Vec<f32>>> {
    let mut activations = vec![input.to_vec()];
    for index in 0..model.layers.len() {
        let (kernel, bias, fan_in, fan_out) = dense_view(model, index)?;
        let x = &activations[index];
        if x.len() != fan_in {
            return Err(CoreError::ShapeMismatch(format!(
                "layer '{}' expects {} inputs, got {}",
                model.layers[index].name,
                fan_in,
                x.len()
            )));
        }
        let mut out = bias.to_vec();
        for (i, xi) in x.iter().enumerate() {
            let row = &kernel[i * fan_out..(i + 1) * fan_out];
            for (o, w) in out.iter_mut().zip(row) {
                *o += xi * w;
            }
        }
        activations.push(out);
    }
    Ok(activations)
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, v)| if *v > best.1 { (i, *v) } else { best })
        .0
}

fn is_correct(prediction: &[f32], target: &[f32]) -> bool {
    if prediction.len() == 1 {
        (prediction[0] - target[0]).abs() < 0.5
    } else {
        argmax(prediction) == argmax(target)
    }
}

fn check_target(prediction: &[f32], target: &[f32]) -> CoreResult<()> {
    if prediction.len() != target.len() {
        return Err(CoreError::ShapeMismatch(format!(
            "model produces {} outputs, target has {}",
            prediction.len(),
            target.len()
        )));
    }
    Ok(())
}

impl Trainer for LinearTrainer {
    fn fit(&self, model: &mut Model, batches: &[Batch], epochs: usize) -> CoreResult<FitReport> {
        let samples: usize = batches.iter().map(Batch::len).sum();

        for _ in 0..epochs {
            for batch in batches.iter().filter(|b| !b.is_empty()) {
                // Per-layer (kernel, bias) gradient accumulators.
                let mut grads: Vec<(Vec<f32>, Vec<f32>)> = model
                    .layers
                    .iter()
                    .map(|l| {
                        let kernel = l.params.first().map_or(0, |t| t.len());
                        let bias = l.params.get(1).map_or(0, |t| t.len());
                        (vec![0.0; kernel], vec![0.0; bias])
                    })
                    .collect();

                for (input, target) in batch.inputs.iter().zip(&batch.targets) {
                    let activations = forward(model, input)?;
                    let Some(output) = activations.last() else { continue };
                    check_target(output, target)?;

                    let scale = 2.0 / output.len() as f32;
                    let mut upstream: Vec<f32> =
                        output.iter().zip(target).map(|(y, t)| scale * (y - t)).collect();

                    for index in (0..model.layers.len()).rev() {
                        let (kernel, _, fan_in, fan_out) = dense_view(model, index)?;
                        let x = &activations[index];
                        let (kernel_grad, bias_grad) = &mut grads[index];
                        for (b, g) in bias_grad.iter_mut().zip(&upstream) {
                            *b += g;
                        }
                        let mut downstream = vec![0.0; fan_in];
                        for i in 0..fan_in {
                            for j in 0..fan_out {
                                kernel_grad[i * fan_out + j] += x[i] * upstream[j];
                                downstream[i] += kernel[i * fan_out + j] * upstream[j];
                            }
                        }
                        upstream = downstream;
                    }
                }

                let step = self.learning_rate / batch.len() as f32;
                for (layer, (kernel_grad, bias_grad)) in model.layers.iter_mut().zip(&grads) {
                    if !layer.trainable {
                        continue;
                    }
                    for (param, grad) in layer.params.iter_mut().zip([kernel_grad, bias_grad]) {
                        for (w, g) in param.data.iter_mut().zip(grad) {
                            *w -= step * g;
                        }
                    }
                }
            }
        }

        Ok(FitReport {
            epochs,
            samples,
            final_metrics: self.evaluate(model, batches)?,
        })
    }

    fn evaluate(&self, model: &Model, batches: &[Batch]) -> CoreResult<Evaluation> {
        let mut total_loss = 0.0f64;
        let mut correct = 0usize;
        let mut count = 0usize;

        for batch in batches {
            for (input, target) in batch.inputs.iter().zip(&batch.targets) {
                let activations = forward(model, input)?;
                let Some(output) = activations.last() else { continue };
                check_target(output, target)?;

                let mse = output
                    .iter()
                    .zip(target)
                    .map(|(y, t)| f64::from(y - t).powi(2))
                    .sum::<f64>()
                    / output.len() as f64;
                total_loss += mse;
                if is_correct(output, target) {
                    correct += 1;
                }
                count += 1;
            }
        }

        if count == 0 {
            return Ok(Evaluation::default());
        }
        Ok(Evaluation {
            loss: total_loss / count as f64,
            accuracy: correct as f64 / count as f64,
        })
    }
}
