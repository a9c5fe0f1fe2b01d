use ndarray::linalg::{general_mat_mul, general_mat_vec_mul};
use ndarray::{s, Array1, Array4, ArrayView4, Axis, Ix1, Ix4, Zip};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::RngCore;
use rayon::prelude::*;
use tracing::debug;

use super::config::{Activation, Conv2dConfig, Padding};
use super::error::{expect_rank, shape_mismatch, CapsError, Result};
use super::parameter::{LayerGradients, Parameter};

impl Activation {
    pub fn apply(self, v: f32) -> f32 {
        match self {
            Activation::ReLU => v.max(0.0),
            Activation::LeakyReLU(alpha) => {
                if v > 0.0 {
                    v
                } else {
                    alpha * v
                }
            }
            Activation::Sigmoid => 1.0 / (1.0 + (-v).exp()),
            Activation::Tanh => v.tanh(),
            Activation::None => v,
        }
    }

    /// Dérivée en fonction de la pré-activation.
    pub fn derivative(self, v: f32) -> f32 {
        match self {
            Activation::ReLU => {
                if v > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyReLU(alpha) => {
                if v > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Activation::Sigmoid => {
                let sig = 1.0 / (1.0 + (-v).exp());
                sig * (1.0 - sig)
            }
            Activation::Tanh => 1.0 - v.tanh().powi(2),
            Activation::None => 1.0,
        }
    }
}

/// Géométrie d'une dimension spatiale après convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub output: usize,
    pub pad_before: usize,
}

/// Arithmétique de convolution sur une dimension (`valid` / `same`).
pub fn conv_output_len(input: usize, kernel: usize, stride: usize, padding: Padding) -> Result<ConvGeometry> {
    if input == 0 {
        return Err(shape_mismatch("dimension spatiale vide"));
    }
    match padding {
        Padding::Valid => {
            if input < kernel {
                return Err(shape_mismatch(format!(
                    "entrée de taille {input} plus petite que le noyau {kernel}"
                )));
            }
            Ok(ConvGeometry {
                output: (input - kernel) / stride + 1,
                pad_before: 0,
            })
        }
        Padding::Same => {
            let output = input.div_ceil(stride);
            let pad_total = ((output - 1) * stride + kernel).saturating_sub(input);
            Ok(ConvGeometry {
                output,
                pad_before: pad_total / 2,
            })
        }
    }
}

/// Borne de Glorot uniforme: sqrt(6 / (fan_in + fan_out)).
pub(crate) fn glorot_limit(fan_in: usize, fan_out: usize) -> f32 {
    (6.0 / (fan_in + fan_out) as f32).sqrt()
}

/// Position d'entrée correspondant à (sortie, décalage noyau), hors padding.
#[inline]
pub(crate) fn input_index(out: usize, offset: usize, stride: usize, pad: usize, len: usize) -> Option<usize> {
    (out * stride + offset)
        .checked_sub(pad)
        .filter(|&index| index < len)
}

struct Conv2dWeights {
    input_channels: usize,
    kernel: Parameter,
    bias: Option<Parameter>,
}

/// Convolution 2D, format (batch, rows, cols, channels).
///
/// Noyau (kh, kw, in_channels, filters), initialisation Glorot uniforme,
/// biais à zéro.
pub struct Conv2d {
    config: Conv2dConfig,
    weights: Option<Conv2dWeights>,
}

impl Conv2d {
    pub fn new(config: Conv2dConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            weights: None,
        })
    }

    pub fn config(&self) -> &Conv2dConfig {
        &self.config
    }

    pub fn is_built(&self) -> bool {
        self.weights.is_some()
    }

    pub fn build(&mut self, input_shape: &[usize]) -> Result<()> {
        self.build_with_rng(input_shape, &mut rand::thread_rng())
    }

    pub fn build_with_rng(&mut self, input_shape: &[usize], rng: &mut dyn RngCore) -> Result<()> {
        expect_rank(input_shape, 4)?;
        let input_channels = input_shape[3];
        let (kh, kw) = self.config.kernel_size;
        let filters = self.config.filters;

        let limit = glorot_limit(kh * kw * input_channels, kh * kw * filters);
        let kernel = Array4::random_using((kh, kw, input_channels, filters), Uniform::new(-limit, limit), rng);
        let bias = self
            .config
            .use_bias
            .then(|| Parameter::new("conv2d/bias", Array1::<f32>::zeros(filters).into_dyn()));

        debug!(
            input = ?input_shape,
            kernel = ?(kh, kw, input_channels, filters),
            "Conv2d construite"
        );
        self.weights = Some(Conv2dWeights {
            input_channels,
            kernel: Parameter::new("conv2d/kernel", kernel.into_dyn()),
            bias,
        });
        Ok(())
    }

    pub fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        expect_rank(input_shape, 4)?;
        let rows = conv_output_len(input_shape[1], self.config.kernel_size.0, self.config.strides.0, self.config.padding)?;
        let cols = conv_output_len(input_shape[2], self.config.kernel_size.1, self.config.strides.1, self.config.padding)?;
        Ok(vec![input_shape[0], rows.output, cols.output, self.config.filters])
    }

    fn geometry(&self, in_rows: usize, in_cols: usize) -> Result<(ConvGeometry, ConvGeometry)> {
        let (kh, kw) = self.config.kernel_size;
        let (sh, sw) = self.config.strides;
        Ok((
            conv_output_len(in_rows, kh, sh, self.config.padding)?,
            conv_output_len(in_cols, kw, sw, self.config.padding)?,
        ))
    }

    pub fn call(&self, input: &ArrayView4<f32>) -> Result<Array4<f32>> {
        let weights = self.weights.as_ref().ok_or(CapsError::NotBuilt("Conv2d"))?;
        let mut output = self.pre_activation(weights, input)?;
        let activation = self.config.activation;
        output.par_mapv_inplace(|v| activation.apply(v));
        Ok(output)
    }

    fn pre_activation(&self, weights: &Conv2dWeights, input: &ArrayView4<f32>) -> Result<Array4<f32>> {
        let (batch_size, in_rows, in_cols, in_channels) = input.dim();
        if in_channels != weights.input_channels {
            return Err(shape_mismatch(format!(
                "Conv2d construite pour {} canaux, reçu {in_channels}",
                weights.input_channels
            )));
        }

        let (kh, kw) = self.config.kernel_size;
        let (sh, sw) = self.config.strides;
        let (rows, cols) = self.geometry(in_rows, in_cols)?;
        let filters = self.config.filters;

        let kernel = weights.kernel.value().view().into_dimensionality::<Ix4>()?;
        let bias = match &weights.bias {
            Some(bias) => bias.value().view().into_dimensionality::<Ix1>()?.to_owned(),
            None => Array1::zeros(filters),
        };

        let mut output = Array4::zeros((batch_size, rows.output, cols.output, filters));

        // Convolution parallélisée par batch
        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut out_batch)| {
                let image = input.index_axis(Axis(0), b);
                for oh in 0..rows.output {
                    for ow in 0..cols.output {
                        let mut acc = out_batch.slice_mut(s![oh, ow, ..]);
                        acc.assign(&bias);
                        for i in 0..kh {
                            let Some(ih) = input_index(oh, i, sh, rows.pad_before, in_rows) else {
                                continue;
                            };
                            for j in 0..kw {
                                let Some(iw) = input_index(ow, j, sw, cols.pad_before, in_cols) else {
                                    continue;
                                };
                                let pixel = image.slice(s![ih, iw, ..]);
                                let taps = kernel.slice(s![i, j, .., ..]);
                                general_mat_vec_mul(1.0, &taps.t(), &pixel, 1.0, &mut acc);
                            }
                        }
                    }
                }
            });

        Ok(output)
    }

    /// Rétropropagation à partir de l'entrée du forward.
    ///
    /// Gradients non moyennés sur le batch; `params` suit l'ordre de
    /// `parameters()` (noyau, puis biais).
    pub fn backward(&self, input: &ArrayView4<f32>, grad_output: &ArrayView4<f32>) -> Result<LayerGradients<Ix4>> {
        let weights = self.weights.as_ref().ok_or(CapsError::NotBuilt("Conv2d"))?;
        let pre_activation = self.pre_activation(weights, input)?;
        if pre_activation.shape() != grad_output.shape() {
            return Err(shape_mismatch(format!(
                "gradient {:?} pour une sortie {:?}",
                grad_output.shape(),
                pre_activation.shape()
            )));
        }

        // Gradient à travers l'activation
        let activation = self.config.activation;
        let mut grad = grad_output.to_owned();
        Zip::from(&mut grad)
            .and(&pre_activation)
            .for_each(|g, &v| *g *= activation.derivative(v));

        let (_, in_rows, in_cols, _) = input.dim();
        let (kh, kw) = self.config.kernel_size;
        let (sh, sw) = self.config.strides;
        let (rows, cols) = self.geometry(in_rows, in_cols)?;
        let kernel = weights.kernel.value().view().into_dimensionality::<Ix4>()?;

        let mut grad_input = Array4::zeros(input.raw_dim());
        let grad_kernel = grad_input
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .map(|(b, mut grad_image)| {
                let image = input.index_axis(Axis(0), b);
                let mut grad_kernel = Array4::<f32>::zeros(kernel.raw_dim());
                for oh in 0..rows.output {
                    for ow in 0..cols.output {
                        let g = grad.slice(s![b, oh, ow, ..]);
                        for i in 0..kh {
                            let Some(ih) = input_index(oh, i, sh, rows.pad_before, in_rows) else {
                                continue;
                            };
                            for j in 0..kw {
                                let Some(iw) = input_index(ow, j, sw, cols.pad_before, in_cols) else {
                                    continue;
                                };
                                let pixel = image.slice(s![ih, iw, ..]);
                                let taps = kernel.slice(s![i, j, .., ..]);
                                // ∂noyau[i, j] += pixel ⊗ g ; ∂pixel += noyau[i, j] · g
                                general_mat_mul(
                                    1.0,
                                    &pixel.insert_axis(Axis(1)),
                                    &g.view().insert_axis(Axis(0)),
                                    1.0,
                                    &mut grad_kernel.slice_mut(s![i, j, .., ..]),
                                );
                                general_mat_vec_mul(1.0, &taps, &g, 1.0, &mut grad_image.slice_mut(s![ih, iw, ..]));
                            }
                        }
                    }
                }
                grad_kernel
            })
            .reduce(|| Array4::zeros(kernel.raw_dim()), |a, b| a + b);

        let mut params = vec![grad_kernel.into_dyn()];
        if weights.bias.is_some() {
            let grad_bias = grad.sum_axis(Axis(0)).sum_axis(Axis(0)).sum_axis(Axis(0));
            params.push(grad_bias.into_dyn());
        }
        Ok(LayerGradients {
            input: grad_input,
            params,
        })
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        self.weights
            .iter()
            .flat_map(|w| std::iter::once(&w.kernel).chain(w.bias.as_ref()))
            .collect()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.weights
            .iter_mut()
            .flat_map(|w| std::iter::once(&mut w.kernel).chain(w.bias.as_mut()))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn set_weights(&mut self, kernel: Array4<f32>, bias: Option<Array1<f32>>) {
        let input_channels = kernel.dim().2;
        self.weights = Some(Conv2dWeights {
            input_channels,
            kernel: Parameter::new("conv2d/kernel", kernel.into_dyn()),
            bias: bias.map(|b| Parameter::new("conv2d/bias", b.into_dyn())),
        });
    }
}
