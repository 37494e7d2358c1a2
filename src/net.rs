//! Autoencoder collaborator for the embedding side of deep clustering.
//!
//! The clustering core never touches network internals: it consumes an
//! [`Autoencoder`] through three operations (encode, decode, one optimizer
//! step) and supplies the embedding-space gradient of whatever auxiliary
//! loss it is optimizing. Any differentiable encoder/decoder pair can sit
//! behind the trait.
//!
//! [`DenseAutoencoder`] is the built-in implementation: a small
//! fully-connected network with leaky-ReLU hidden layers, trained by plain
//! backpropagation with an Adam update (Kingma & Ba, 2015) — per-parameter
//! first/second moment estimates with bias correction. It keeps the crate
//! self-contained; heavier engines can be swapped in through the trait.

use crate::error::{Error, Result};
use rand::prelude::*;

/// Differentiable encoder/decoder pair with its own optimizer state.
pub trait Autoencoder {
    /// Dimension of the embedding space. Must match the width of the rows
    /// `encode` returns.
    fn embedding_size(&self) -> usize;

    /// Embed a batch of original-space rows.
    fn encode(&self, batch: &[Vec<f32>]) -> Result<Vec<Vec<f32>>>;

    /// Reconstruct original-space rows from embedded ones.
    fn decode(&self, embedded: &[Vec<f32>]) -> Result<Vec<Vec<f32>>>;

    /// One forward/backward/update pass over the batch.
    ///
    /// The loss is the mean squared reconstruction error plus, when
    /// `embedding_grad` is given, a caller-defined term whose gradient with
    /// respect to each row's embedding is supplied directly (one gradient
    /// row per batch row). `None` makes this a pure reconstruction step,
    /// which is all pretraining needs. Returns the reconstruction loss.
    fn step(
        &mut self,
        batch: &[Vec<f32>],
        embedding_grad: Option<&[Vec<f32>]>,
        learning_rate: f32,
    ) -> Result<f32>;
}

const LEAKY_SLOPE: f32 = 0.01;

#[inline]
fn leaky_relu(x: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        LEAKY_SLOPE * x
    }
}

#[inline]
fn leaky_relu_deriv(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        LEAKY_SLOPE
    }
}

/// One fully-connected layer with its Adam moment estimates.
#[derive(Debug, Clone)]
struct Dense {
    /// Weights, `out_dim x in_dim`, row-major.
    w: Vec<f32>,
    b: Vec<f32>,
    in_dim: usize,
    out_dim: usize,
    m_w: Vec<f32>,
    v_w: Vec<f32>,
    m_b: Vec<f32>,
    v_b: Vec<f32>,
}

/// Per-layer gradient accumulator for one batch.
#[derive(Debug, Clone)]
struct LayerGrad {
    w: Vec<f32>,
    b: Vec<f32>,
}

impl Dense {
    fn new(in_dim: usize, out_dim: usize, rng: &mut StdRng) -> Self {
        // Xavier uniform initialization.
        let limit = (6.0 / (in_dim + out_dim) as f32).sqrt();
        let w = (0..in_dim * out_dim)
            .map(|_| (rng.random::<f32>() * 2.0 - 1.0) * limit)
            .collect();
        Self {
            w,
            b: vec![0.0; out_dim],
            in_dim,
            out_dim,
            m_w: vec![0.0; in_dim * out_dim],
            v_w: vec![0.0; in_dim * out_dim],
            m_b: vec![0.0; out_dim],
            v_b: vec![0.0; out_dim],
        }
    }

    fn zero_grad(&self) -> LayerGrad {
        LayerGrad {
            w: vec![0.0; self.w.len()],
            b: vec![0.0; self.b.len()],
        }
    }

    fn affine(&self, input: &[f32]) -> Vec<f32> {
        let mut out = self.b.clone();
        for (row, out_v) in self.w.chunks_exact(self.in_dim).zip(out.iter_mut()) {
            *out_v += row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>();
        }
        out
    }

    /// Accumulate gradients for one sample; returns the gradient with
    /// respect to the layer input.
    fn backward(&self, input: &[f32], dz: &[f32], grad: &mut LayerGrad) -> Vec<f32> {
        let mut d_input = vec![0.0f32; self.in_dim];
        for (o, &g) in dz.iter().enumerate() {
            grad.b[o] += g;
            let row = &self.w[o * self.in_dim..(o + 1) * self.in_dim];
            let grad_row = &mut grad.w[o * self.in_dim..(o + 1) * self.in_dim];
            for i in 0..self.in_dim {
                grad_row[i] += g * input[i];
                d_input[i] += g * row[i];
            }
        }
        d_input
    }

    fn adam_update(&mut self, grad: &LayerGrad, lr: f32, t: u64, beta1: f32, beta2: f32, eps: f32) {
        let bc1 = 1.0 - beta1.powi(t as i32);
        let bc2 = 1.0 - beta2.powi(t as i32);
        for ((p, g), (m, v)) in self
            .w
            .iter_mut()
            .zip(&grad.w)
            .zip(self.m_w.iter_mut().zip(self.v_w.iter_mut()))
        {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            *p -= lr * (*m / bc1) / ((*v / bc2).sqrt() + eps);
        }
        for ((p, g), (m, v)) in self
            .b
            .iter_mut()
            .zip(&grad.b)
            .zip(self.m_b.iter_mut().zip(self.v_b.iter_mut()))
        {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            *p -= lr * (*m / bc1) / ((*v / bc2).sqrt() + eps);
        }
    }
}

/// Fully-connected autoencoder with leaky-ReLU hidden layers.
///
/// Encoder dimensions run `input -> hidden... -> embedding`, the decoder
/// mirrors them. The embedding layer and the reconstruction output are
/// linear.
#[derive(Debug, Clone)]
pub struct DenseAutoencoder {
    encoder: Vec<Dense>,
    decoder: Vec<Dense>,
    input_dim: usize,
    embedding_size: usize,
    beta1: f32,
    beta2: f32,
    eps: f32,
    step_count: u64,
}

impl DenseAutoencoder {
    /// Build a new autoencoder with freshly initialized weights.
    pub fn new(input_dim: usize, hidden: &[usize], embedding_size: usize, seed: u64) -> Result<Self> {
        if input_dim == 0 {
            return Err(Error::InvalidParameter {
                name: "input_dim",
                message: "must be positive",
            });
        }
        if embedding_size == 0 {
            return Err(Error::InvalidParameter {
                name: "embedding_size",
                message: "must be positive",
            });
        }
        if hidden.contains(&0) {
            return Err(Error::InvalidParameter {
                name: "hidden",
                message: "layer widths must be positive",
            });
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut enc_dims = vec![input_dim];
        enc_dims.extend_from_slice(hidden);
        enc_dims.push(embedding_size);
        let encoder = enc_dims
            .windows(2)
            .map(|w| Dense::new(w[0], w[1], &mut rng))
            .collect();
        let mut dec_dims: Vec<usize> = enc_dims;
        dec_dims.reverse();
        let decoder = dec_dims
            .windows(2)
            .map(|w| Dense::new(w[0], w[1], &mut rng))
            .collect();
        Ok(Self {
            encoder,
            decoder,
            input_dim,
            embedding_size,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step_count: 0,
        })
    }

    fn check_rows(&self, rows: &[Vec<f32>], expected: usize) -> Result<()> {
        if rows.is_empty() {
            return Err(Error::EmptyInput);
        }
        for r in rows {
            if r.len() != expected {
                return Err(Error::DimensionMismatch {
                    expected,
                    found: r.len(),
                });
            }
        }
        Ok(())
    }

    /// Forward through a layer stack, keeping the per-layer inputs and
    /// pre-activations. The stack output is the last pre-activation (the
    /// final layer is linear).
    fn forward_layers(layers: &[Dense], input: &[f32]) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
        let mut inputs: Vec<Vec<f32>> = Vec::with_capacity(layers.len());
        let mut preacts: Vec<Vec<f32>> = Vec::with_capacity(layers.len());
        let mut current = input.to_vec();
        for (li, layer) in layers.iter().enumerate() {
            let z = layer.affine(&current);
            inputs.push(current);
            current = if li + 1 < layers.len() {
                z.iter().copied().map(leaky_relu).collect()
            } else {
                z.clone()
            };
            preacts.push(z);
        }
        (inputs, preacts)
    }

    /// Backward through a layer stack given the gradient with respect to
    /// the stack output; returns the gradient with respect to the input.
    fn backward_layers(
        layers: &[Dense],
        inputs: &[Vec<f32>],
        preacts: &[Vec<f32>],
        mut d_out: Vec<f32>,
        grads: &mut [LayerGrad],
    ) -> Vec<f32> {
        for li in (0..layers.len()).rev() {
            let dz: Vec<f32> = if li + 1 == layers.len() {
                d_out
            } else {
                d_out
                    .iter()
                    .zip(&preacts[li])
                    .map(|(g, &z)| g * leaky_relu_deriv(z))
                    .collect()
            };
            d_out = layers[li].backward(&inputs[li], &dz, &mut grads[li]);
        }
        d_out
    }

    /// Accumulate batch gradients; returns the mean reconstruction loss.
    fn accumulate(
        &self,
        batch: &[Vec<f32>],
        embedding_grad: Option<&[Vec<f32>]>,
        enc_grads: &mut [LayerGrad],
        dec_grads: &mut [LayerGrad],
    ) -> f32 {
        let bsz = batch.len();
        let denom = (bsz * self.input_dim) as f32;
        let mut recon_loss = 0.0f32;
        for (bi, row) in batch.iter().enumerate() {
            let (enc_inputs, enc_preacts) = Self::forward_layers(&self.encoder, row);
            let embedding = enc_preacts[enc_preacts.len() - 1].clone();
            let (dec_inputs, dec_preacts) = Self::forward_layers(&self.decoder, &embedding);
            let recon = &dec_preacts[dec_preacts.len() - 1];

            let mut d_recon = vec![0.0f32; self.input_dim];
            for (d, (r, x)) in recon.iter().zip(row).enumerate() {
                let e = r - x;
                recon_loss += e * e / denom;
                d_recon[d] = 2.0 * e / denom;
            }

            let mut d_embedding =
                Self::backward_layers(&self.decoder, &dec_inputs, &dec_preacts, d_recon, dec_grads);
            if let Some(extra) = embedding_grad {
                for (g, e) in d_embedding.iter_mut().zip(&extra[bi]) {
                    *g += e;
                }
            }
            Self::backward_layers(&self.encoder, &enc_inputs, &enc_preacts, d_embedding, enc_grads);
        }
        recon_loss
    }

    #[cfg(test)]
    fn scalar_loss(&self, batch: &[Vec<f32>], embedding_grad: Option<&[Vec<f32>]>) -> f32 {
        let denom = (batch.len() * self.input_dim) as f32;
        let mut loss = 0.0f32;
        for (bi, row) in batch.iter().enumerate() {
            let (_, enc_preacts) = Self::forward_layers(&self.encoder, row);
            let embedding = &enc_preacts[enc_preacts.len() - 1];
            let (_, dec_preacts) = Self::forward_layers(&self.decoder, embedding);
            let recon = &dec_preacts[dec_preacts.len() - 1];
            for (r, x) in recon.iter().zip(row) {
                loss += (r - x) * (r - x) / denom;
            }
            if let Some(extra) = embedding_grad {
                loss += embedding.iter().zip(&extra[bi]).map(|(z, g)| z * g).sum::<f32>();
            }
        }
        loss
    }
}

impl Autoencoder for DenseAutoencoder {
    fn embedding_size(&self) -> usize {
        self.embedding_size
    }

    fn encode(&self, batch: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        self.check_rows(batch, self.input_dim)?;
        Ok(batch
            .iter()
            .map(|row| {
                let (_, preacts) = Self::forward_layers(&self.encoder, row);
                preacts[preacts.len() - 1].clone()
            })
            .collect())
    }

    fn decode(&self, embedded: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        self.check_rows(embedded, self.embedding_size)?;
        Ok(embedded
            .iter()
            .map(|row| {
                let (_, preacts) = Self::forward_layers(&self.decoder, row);
                preacts[preacts.len() - 1].clone()
            })
            .collect())
    }

    fn step(
        &mut self,
        batch: &[Vec<f32>],
        embedding_grad: Option<&[Vec<f32>]>,
        learning_rate: f32,
    ) -> Result<f32> {
        self.check_rows(batch, self.input_dim)?;
        if let Some(extra) = embedding_grad {
            if extra.len() != batch.len() {
                return Err(Error::DimensionMismatch {
                    expected: batch.len(),
                    found: extra.len(),
                });
            }
            for g in extra {
                if g.len() != self.embedding_size {
                    return Err(Error::DimensionMismatch {
                        expected: self.embedding_size,
                        found: g.len(),
                    });
                }
            }
        }

        let mut enc_grads: Vec<LayerGrad> = self.encoder.iter().map(Dense::zero_grad).collect();
        let mut dec_grads: Vec<LayerGrad> = self.decoder.iter().map(Dense::zero_grad).collect();
        let recon_loss = self.accumulate(batch, embedding_grad, &mut enc_grads, &mut dec_grads);

        self.step_count += 1;
        let t = self.step_count;
        let (b1, b2, eps) = (self.beta1, self.beta2, self.eps);
        for (layer, grad) in self.encoder.iter_mut().zip(&enc_grads) {
            layer.adam_update(grad, learning_rate, t, b1, b2, eps);
        }
        for (layer, grad) in self.decoder.iter_mut().zip(&dec_grads) {
            layer.adam_update(grad, learning_rate, t, b1, b2, eps);
        }
        Ok(recon_loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_batch() -> Vec<Vec<f32>> {
        (0..16)
            .map(|i| {
                let a = i as f32 * 0.37;
                vec![a.sin(), a.cos(), (a * 0.5).sin()]
            })
            .collect()
    }

    #[test]
    fn test_shapes() {
        let ae = DenseAutoencoder::new(3, &[8, 4], 2, 11).unwrap();
        assert_eq!(ae.embedding_size(), 2);
        let batch = toy_batch();
        let z = ae.encode(&batch).unwrap();
        assert_eq!(z.len(), batch.len());
        assert!(z.iter().all(|row| row.len() == 2));
        let recon = ae.decode(&z).unwrap();
        assert!(recon.iter().all(|row| row.len() == 3));
    }

    #[test]
    fn test_dimension_checks() {
        let ae = DenseAutoencoder::new(3, &[4], 2, 0).unwrap();
        assert!(matches!(
            ae.encode(&[vec![1.0, 2.0]]),
            Err(Error::DimensionMismatch { expected: 3, found: 2 })
        ));
        assert!(ae.encode(&[]).is_err());
        assert!(matches!(
            ae.decode(&[vec![1.0, 2.0, 3.0]]),
            Err(Error::DimensionMismatch { expected: 2, found: 3 })
        ));
    }

    #[test]
    fn test_invalid_construction() {
        assert!(DenseAutoencoder::new(0, &[4], 2, 0).is_err());
        assert!(DenseAutoencoder::new(3, &[0], 2, 0).is_err());
        assert!(DenseAutoencoder::new(3, &[4], 0, 0).is_err());
    }

    #[test]
    fn test_reconstruction_loss_decreases() {
        let mut ae = DenseAutoencoder::new(3, &[8], 2, 5).unwrap();
        let batch = toy_batch();
        let first = ae.step(&batch, None, 1e-2).unwrap();
        let mut last = first;
        for _ in 0..300 {
            last = ae.step(&batch, None, 1e-2).unwrap();
        }
        assert!(
            last < first * 0.5,
            "loss did not drop: first {first}, last {last}"
        );
    }

    #[test]
    fn test_embedding_grad_moves_embedding() {
        // A constant positive embedding gradient should push embeddings down.
        let mut ae = DenseAutoencoder::new(2, &[6], 2, 9).unwrap();
        let batch: Vec<Vec<f32>> = vec![vec![0.4, -0.2], vec![-0.3, 0.8]];
        let before: f32 = ae
            .encode(&batch)
            .unwrap()
            .iter()
            .flat_map(|r| r.iter())
            .sum();
        let grad = vec![vec![1.0, 1.0]; batch.len()];
        for _ in 0..50 {
            ae.step(&batch, Some(&grad), 1e-2).unwrap();
        }
        let after: f32 = ae
            .encode(&batch)
            .unwrap()
            .iter()
            .flat_map(|r| r.iter())
            .sum();
        assert!(after < before, "before {before}, after {after}");
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let ae = DenseAutoencoder::new(2, &[3], 2, 3).unwrap();
        let batch: Vec<Vec<f32>> = vec![vec![0.9, -0.6], vec![-0.4, 0.7]];
        let ext = vec![vec![0.3, -0.2], vec![-0.1, 0.25]];

        let mut enc_grads: Vec<LayerGrad> = ae.encoder.iter().map(Dense::zero_grad).collect();
        let mut dec_grads: Vec<LayerGrad> = ae.decoder.iter().map(Dense::zero_grad).collect();
        ae.accumulate(&batch, Some(&ext), &mut enc_grads, &mut dec_grads);

        let eps = 1e-3f32;
        for (li, wi) in [(0usize, 0usize), (0, 5), (1, 2)] {
            let mut plus = ae.clone();
            plus.encoder[li].w[wi] += eps;
            let mut minus = ae.clone();
            minus.encoder[li].w[wi] -= eps;
            let fd = (plus.scalar_loss(&batch, Some(&ext))
                - minus.scalar_loss(&batch, Some(&ext)))
                / (2.0 * eps);
            let analytic = enc_grads[li].w[wi];
            assert!(
                (fd - analytic).abs() < 1e-3 + 0.05 * fd.abs(),
                "layer {li} weight {wi}: fd {fd}, analytic {analytic}"
            );
        }
    }
}
