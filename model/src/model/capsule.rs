use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array, Array1, Array4, Array5, ArrayView, ArrayView4, ArrayView5, Axis, Dimension, Ix1, Ix4, Ix5, Ix6};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::RngCore;
use rayon::prelude::*;
use tracing::debug;

use super::activations::{squash, squash_backward};
use super::config::{CapsConv2dConfig, CapsConvConfig, Conv2dConfig, LayerConfig};
use super::error::{expect_rank, shape_mismatch, CapsError, Result};
use super::layers::{conv_output_len, glorot_limit, input_index, Conv2d};
use super::parameter::{LayerGradients, Parameter};
use super::routing::{ConvRouting, DynamicRouting, RoutingSchedule};

/// Capacité commune aux couches à routage dynamique.
///
/// Cycle de vie en deux temps: `build(input_shape)` dérive l'état dépendant
/// de la forme, puis `call` calcule. Appeler `call` avant `build` échoue.
pub trait CapsuleRoutingLayer: Send + Sync {
    type OutputDim: Dimension;

    fn build(&mut self, input_shape: &[usize]) -> Result<()> {
        self.build_with_rng(input_shape, &mut rand::thread_rng())
    }

    fn build_with_rng(&mut self, input_shape: &[usize], rng: &mut dyn RngCore) -> Result<()>;

    fn is_built(&self) -> bool;

    fn call(&self, inputs: &ArrayView5<f32>) -> Result<Array<f32, Self::OutputDim>>;

    /// Rétropropagation à travers les prédictions et toutes les itérations
    /// du routage, à partir des entrées du forward. Gradients non moyennés
    /// sur le batch.
    fn backward(
        &self,
        inputs: &ArrayView5<f32>,
        grad_output: &ArrayView<f32, Self::OutputDim>,
    ) -> Result<LayerGradients<Ix5>>;

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>>;

    /// Configuration sérialisable, champs de build compris.
    fn get_config(&self) -> LayerConfig;

    fn routing(&self) -> &DynamicRouting;

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;
}

/// Capsules primaires: convolution à `caps_filters * caps_dims` canaux,
/// découpée en capsules puis squashée.
pub struct CapsConv2d {
    config: CapsConv2dConfig,
    conv: Conv2d,
}

impl CapsConv2d {
    pub fn new(config: CapsConv2dConfig) -> Result<Self> {
        config.validate()?;
        let conv = Conv2d::new(Conv2dConfig {
            filters: config.caps_filters * config.caps_dims,
            kernel_size: config.kernel_size,
            strides: config.strides,
            padding: config.padding,
            activation: Default::default(),
            use_bias: true,
        })?;
        Ok(Self { config, conv })
    }

    pub fn from_config(config: &LayerConfig) -> Result<Self> {
        match config {
            LayerConfig::CapsConv2d(c) => Self::new(c.clone()),
            other => Err(CapsError::InvalidConfig(format!(
                "CapsConv2d attendu, reçu {}",
                other.class_name()
            ))),
        }
    }

    pub fn is_built(&self) -> bool {
        self.conv.is_built()
    }

    pub fn build(&mut self, input_shape: &[usize]) -> Result<()> {
        self.build_with_rng(input_shape, &mut rand::thread_rng())
    }

    pub fn build_with_rng(&mut self, input_shape: &[usize], rng: &mut dyn RngCore) -> Result<()> {
        self.conv.build_with_rng(input_shape, rng)
    }

    pub fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let mut shape = self.conv.output_shape(input_shape)?;
        shape.pop();
        shape.extend([self.config.caps_filters, self.config.caps_dims]);
        Ok(shape)
    }

    /// (batch, rows, cols, channels) → (batch, rows', cols', caps_filters, caps_dims)
    pub fn call(&self, inputs: &ArrayView4<f32>) -> Result<Array5<f32>> {
        let features = self.conv.call(inputs)?;
        let (batch, rows, cols, _) = features.dim();
        let capsules = features.into_shape_with_order((batch, rows, cols, self.config.caps_filters, self.config.caps_dims))?;
        squash(&capsules, Axis(4))
    }

    /// Rétropropagation: squash, découpage en capsules, puis convolution.
    pub fn backward(&self, inputs: &ArrayView4<f32>, grad_output: &ArrayView5<f32>) -> Result<LayerGradients<Ix4>> {
        let features = self.conv.call(inputs)?;
        let (batch, rows, cols, channels) = features.dim();
        let capsules = features.into_shape_with_order((batch, rows, cols, self.config.caps_filters, self.config.caps_dims))?;
        let grad_features = squash_backward(&capsules, grad_output, Axis(4))?.into_shape_with_order((batch, rows, cols, channels))?;
        self.conv.backward(inputs, &grad_features.view())
    }

    pub fn get_config(&self) -> LayerConfig {
        LayerConfig::CapsConv2d(self.config.clone())
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        self.conv.parameters()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.conv.parameters_mut()
    }
}

struct CapsConvWeights {
    input_caps_filters: usize,
    input_caps_dims: usize,
    /// (kh, kw, input_caps_dims, caps_filters * caps_dims)
    kernel: Parameter,
    bias: Parameter,
}

/// Couche capsule-vers-capsule convolutive.
///
/// Convolution 3D à une seule entrée dont le noyau et le pas couvrent tout
/// l'axe `input_caps_dims`: chaque capsule d'entrée produit, à chaque
/// position, une prédiction par (caps_filters, caps_dims), avec des poids
/// partagés entre capsules d'entrée. Le routage se fait ensuite position par
/// position sur l'axe des capsules d'entrée.
pub struct CapsConv {
    config: CapsConvConfig,
    routing: DynamicRouting,
    weights: Option<CapsConvWeights>,
}

impl CapsConv {
    pub fn new(config: CapsConvConfig) -> Result<Self> {
        config.validate()?;
        let routing = DynamicRouting::new(config.routing_iter, RoutingSchedule::Standard)?;
        Ok(Self {
            config,
            routing,
            weights: None,
        })
    }

    pub fn from_config(config: &LayerConfig) -> Result<Self> {
        match config {
            LayerConfig::CapsConv(c) => Self::new(CapsConvConfig {
                input_caps_filters: None,
                input_caps_dims: None,
                ..c.clone()
            }),
            other => Err(CapsError::InvalidConfig(format!(
                "CapsConv attendu, reçu {}",
                other.class_name()
            ))),
        }
    }

    fn filters(&self) -> usize {
        self.config.caps_filters * self.config.caps_dims
    }

    fn built_for(&self, inputs: &ArrayView5<f32>) -> Result<&CapsConvWeights> {
        let weights = self.weights.as_ref().ok_or(CapsError::NotBuilt("CapsConv"))?;
        let (_, _, _, input_caps_filters, input_caps_dims) = inputs.dim();
        if (input_caps_filters, input_caps_dims) != (weights.input_caps_filters, weights.input_caps_dims) {
            return Err(shape_mismatch(format!(
                "CapsConv construite pour des capsules ({}, {}), reçu ({input_caps_filters}, {input_caps_dims})",
                weights.input_caps_filters, weights.input_caps_dims
            )));
        }
        Ok(weights)
    }

    /// Prédictions (batch, rows', cols', input_caps_filters, caps_filters, caps_dims).
    fn predict(&self, weights: &CapsConvWeights, inputs: &ArrayView5<f32>) -> Result<Array<f32, Ix6>> {
        let (batch_size, in_rows, in_cols, input_caps_filters, _) = inputs.dim();
        let (kh, kw) = self.config.kernel_size;
        let (sh, sw) = self.config.strides;
        let rows = conv_output_len(in_rows, kh, sh, self.config.padding)?;
        let cols = conv_output_len(in_cols, kw, sw, self.config.padding)?;
        let filters = self.filters();

        let kernel = weights.kernel.value().view().into_dimensionality::<Ix4>()?;
        let bias = weights.bias.value().view().into_dimensionality::<Ix1>()?;

        let mut output = Array5::zeros((batch_size, rows.output, cols.output, input_caps_filters, filters));

        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut out_batch)| {
                let capsules = inputs.index_axis(Axis(0), b);
                for oh in 0..rows.output {
                    for ow in 0..cols.output {
                        // (input_caps_filters, filters)
                        let mut acc = out_batch.slice_mut(s![oh, ow, .., ..]);
                        acc.assign(&bias);
                        for i in 0..kh {
                            let Some(ih) = input_index(oh, i, sh, rows.pad_before, in_rows) else {
                                continue;
                            };
                            for j in 0..kw {
                                let Some(iw) = input_index(ow, j, sw, cols.pad_before, in_cols) else {
                                    continue;
                                };
                                // (input_caps_filters, input_caps_dims) · (input_caps_dims, filters)
                                let patch = capsules.slice(s![ih, iw, .., ..]);
                                let taps = kernel.slice(s![i, j, .., ..]);
                                general_mat_mul(1.0, &patch, &taps, 1.0, &mut acc);
                            }
                        }
                    }
                }
            });

        Ok(output.into_shape_with_order((
            batch_size,
            rows.output,
            cols.output,
            input_caps_filters,
            self.config.caps_filters,
            self.config.caps_dims,
        ))?)
    }
}

impl CapsuleRoutingLayer for CapsConv {
    type OutputDim = Ix5;

    fn build_with_rng(&mut self, input_shape: &[usize], rng: &mut dyn RngCore) -> Result<()> {
        expect_rank(input_shape, 5)?;
        let input_caps_filters = input_shape[3];
        let input_caps_dims = input_shape[4];
        if input_caps_filters == 0 || input_caps_dims == 0 {
            return Err(shape_mismatch(format!("capsules d'entrée vides: {input_shape:?}")));
        }
        let (kh, kw) = self.config.kernel_size;
        let filters = self.filters();

        // Noyau 3D (kh, kw, input_caps_dims) sur un seul canal d'entrée
        let receptive = kh * kw * input_caps_dims;
        let limit = glorot_limit(receptive, receptive * filters);
        let kernel = Array4::random_using((kh, kw, input_caps_dims, filters), Uniform::new(-limit, limit), rng);

        debug!(
            input = ?input_shape,
            kernel = ?(kh, kw, input_caps_dims),
            strides = ?(self.config.strides.0, self.config.strides.1, input_caps_dims),
            filters,
            "CapsConv construite"
        );

        self.config.input_caps_filters = Some(input_caps_filters);
        self.config.input_caps_dims = Some(input_caps_dims);
        self.weights = Some(CapsConvWeights {
            input_caps_filters,
            input_caps_dims,
            kernel: Parameter::new("caps_conv/kernel", kernel.into_dyn()),
            bias: Parameter::new("caps_conv/bias", Array1::<f32>::zeros(filters).into_dyn()),
        });
        Ok(())
    }

    fn is_built(&self) -> bool {
        self.weights.is_some()
    }

    fn call(&self, inputs: &ArrayView5<f32>) -> Result<Array5<f32>> {
        let weights = self.built_for(inputs)?;
        let prediction = self.predict(weights, inputs)?;
        self.routing.route(&ConvRouting::new(prediction.view()))
    }

    fn backward(&self, inputs: &ArrayView5<f32>, grad_output: &ArrayView5<f32>) -> Result<LayerGradients<Ix5>> {
        let weights = self.built_for(inputs)?;
        let prediction = self.predict(weights, inputs)?;
        let grad_prediction = self
            .routing
            .route_backward(&ConvRouting::new(prediction.view()), grad_output)?;

        let (_, in_rows, in_cols, _, _) = inputs.dim();
        let (batch_size, rows, cols, input_caps_filters, _, _) = grad_prediction.dim();
        let (kh, kw) = self.config.kernel_size;
        let (sh, sw) = self.config.strides;
        let row_geometry = conv_output_len(in_rows, kh, sh, self.config.padding)?;
        let col_geometry = conv_output_len(in_cols, kw, sw, self.config.padding)?;
        // (batch, rows', cols', input_caps_filters, filters)
        let grad_prediction = grad_prediction.to_shape((batch_size, rows, cols, input_caps_filters, self.filters()))?;
        let kernel = weights.kernel.value().view().into_dimensionality::<Ix4>()?;

        let mut grad_input = Array5::zeros(inputs.raw_dim());
        let grad_kernel = grad_input
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .map(|(b, mut grad_capsules)| {
                let capsules = inputs.index_axis(Axis(0), b);
                let mut grad_kernel = Array4::<f32>::zeros(kernel.raw_dim());
                for oh in 0..rows {
                    for ow in 0..cols {
                        // (input_caps_filters, filters)
                        let g = grad_prediction.slice(s![b, oh, ow, .., ..]);
                        for i in 0..kh {
                            let Some(ih) = input_index(oh, i, sh, row_geometry.pad_before, in_rows) else {
                                continue;
                            };
                            for j in 0..kw {
                                let Some(iw) = input_index(ow, j, sw, col_geometry.pad_before, in_cols) else {
                                    continue;
                                };
                                let patch = capsules.slice(s![ih, iw, .., ..]);
                                let taps = kernel.slice(s![i, j, .., ..]);
                                // ∂noyau[i, j] += patchᵀ · g ; ∂patch += g · noyau[i, j]ᵀ
                                general_mat_mul(1.0, &patch.t(), &g, 1.0, &mut grad_kernel.slice_mut(s![i, j, .., ..]));
                                general_mat_mul(1.0, &g, &taps.t(), 1.0, &mut grad_capsules.slice_mut(s![ih, iw, .., ..]));
                            }
                        }
                    }
                }
                grad_kernel
            })
            .reduce(|| Array4::zeros(kernel.raw_dim()), |a, b| a + b);

        let grad_bias = grad_prediction
            .sum_axis(Axis(0))
            .sum_axis(Axis(0))
            .sum_axis(Axis(0))
            .sum_axis(Axis(0));
        Ok(LayerGradients {
            input: grad_input,
            params: vec![grad_kernel.into_dyn(), grad_bias.into_dyn()],
        })
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        expect_rank(input_shape, 5)?;
        let rows = conv_output_len(input_shape[1], self.config.kernel_size.0, self.config.strides.0, self.config.padding)?;
        let cols = conv_output_len(input_shape[2], self.config.kernel_size.1, self.config.strides.1, self.config.padding)?;
        Ok(vec![
            input_shape[0],
            rows.output,
            cols.output,
            self.config.caps_filters,
            self.config.caps_dims,
        ])
    }

    fn get_config(&self) -> LayerConfig {
        LayerConfig::CapsConv(self.config.clone())
    }

    fn routing(&self) -> &DynamicRouting {
        &self.routing
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.weights.iter().flat_map(|w| [&w.kernel, &w.bias]).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.weights
            .iter_mut()
            .flat_map(|w| [&mut w.kernel, &mut w.bias])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::Padding;
    use ndarray::{Array1, Array4, Array5, IntoDimension};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(2017)
    }

    fn capsule_input(shape: (usize, usize, usize, usize, usize)) -> Array5<f32> {
        Array5::from_shape_fn(shape, |(b, r, c, f, d)| {
            (((b * 31 + r * 17 + c * 13 + f * 7 + d * 3) % 19) as f32 - 9.0) * 0.05
        })
    }

    #[test]
    fn test_primary_capsules_shape_and_norms() {
        let mut layer = CapsConv2d::new(CapsConv2dConfig::new(32, 8, 9).with_strides(2)).unwrap();
        layer.build_with_rng(&[1, 20, 20, 256], &mut rng()).unwrap();
        let input = Array4::from_shape_fn((1, 20, 20, 256), |(_, r, c, ch)| ((r + c + ch) % 7) as f32 * 0.1);
        let output = layer.call(&input.view()).unwrap();
        assert_eq!(output.dim(), (1, 6, 6, 32, 8));
        for capsule in output.lanes(Axis(4)) {
            assert!(capsule.dot(&capsule).sqrt() < 1.0);
        }
        assert_eq!(layer.output_shape(&[1, 20, 20, 256]).unwrap(), vec![1, 6, 6, 32, 8]);
    }

    #[test]
    fn test_primary_capsules_group_channels_in_order() {
        let mut layer = CapsConv2d::new(CapsConv2dConfig::new(2, 2, 1)).unwrap();
        layer.build_with_rng(&[1, 1, 1, 1], &mut rng()).unwrap();
        // Noyau identité pondérée: canal k = (k + 1) * x
        layer.conv.set_weights(
            Array4::from_shape_fn((1, 1, 1, 4), |(_, _, _, k)| (k + 1) as f32),
            Some(Array1::zeros(4)),
        );
        let output = layer.call(&Array4::ones((1, 1, 1, 1)).view()).unwrap();
        // capsule 1 = squash((3, 4))
        assert!((output[[0, 0, 0, 1, 0]] - 0.6 * 25.0 / 26.0).abs() < 1e-5);
        assert!((output[[0, 0, 0, 1, 1]] - 0.8 * 25.0 / 26.0).abs() < 1e-5);
    }

    #[test]
    fn test_caps_conv_requires_rank_five() {
        let mut layer = CapsConv::new(CapsConvConfig::new(4, 6, 3, 3)).unwrap();
        assert!(matches!(
            layer.build(&[2, 6, 6, 64]),
            Err(CapsError::RankMismatch { expected: 5, got: 4 })
        ));
        assert!(!layer.is_built());
    }

    #[test]
    fn test_caps_conv_rejects_empty_input_capsules() {
        let mut layer = CapsConv::new(CapsConvConfig::new(4, 6, 3, 3)).unwrap();
        assert!(matches!(layer.build(&[1, 5, 5, 3, 0]), Err(CapsError::ShapeMismatch(_))));
        assert!(matches!(layer.build(&[1, 5, 5, 0, 4]), Err(CapsError::ShapeMismatch(_))));
        assert!(!layer.is_built());
    }

    #[test]
    fn test_caps_conv_rejects_zero_iterations() {
        assert!(matches!(
            CapsConv::new(CapsConvConfig::new(4, 6, 0, 3)),
            Err(CapsError::InvalidRoutingIterations(0))
        ));
    }

    #[test]
    fn test_caps_conv_call_before_build() {
        let layer = CapsConv::new(CapsConvConfig::new(4, 6, 3, 3)).unwrap();
        let input = capsule_input((1, 5, 5, 8, 4));
        assert!(matches!(layer.call(&input.view()), Err(CapsError::NotBuilt("CapsConv"))));
    }

    #[test]
    fn test_caps_conv_output_follows_conv_arithmetic() {
        let mut layer = CapsConv::new(CapsConvConfig::new(4, 6, 3, 3).with_strides(2)).unwrap();
        layer.build_with_rng(&[2, 7, 7, 8, 4], &mut rng()).unwrap();
        let output = layer.call(&capsule_input((2, 7, 7, 8, 4)).view()).unwrap();
        assert_eq!(output.dim(), (2, 3, 3, 4, 6));
        assert!(output.iter().all(|v| v.is_finite()));
        for capsule in output.lanes(Axis(4)) {
            assert!(capsule.dot(&capsule).sqrt() < 1.0);
        }
    }

    #[test]
    fn test_caps_conv_same_padding_keeps_grid() {
        let config = CapsConvConfig::new(2, 4, 2, 3).with_padding(Padding::Same);
        let mut layer = CapsConv::new(config).unwrap();
        layer.build_with_rng(&[1, 5, 5, 3, 4], &mut rng()).unwrap();
        let output = layer.call(&capsule_input((1, 5, 5, 3, 4)).view()).unwrap();
        assert_eq!(output.dim(), (1, 5, 5, 2, 4));
        assert_eq!(layer.output_shape(&[1, 5, 5, 3, 4]).unwrap(), vec![1, 5, 5, 2, 4]);
    }

    #[test]
    fn test_caps_conv_prediction_contracts_capsule_axis() {
        let mut layer = CapsConv::new(CapsConvConfig::new(1, 2, 1, 1)).unwrap();
        layer.build_with_rng(&[1, 1, 1, 2, 3], &mut rng()).unwrap();
        let input = capsule_input((1, 1, 1, 2, 3));
        let weights = layer.weights.as_ref().unwrap();
        let prediction = layer.predict(weights, &input.view()).unwrap();
        assert_eq!(prediction.dim(), (1, 1, 1, 2, 1, 2));

        let kernel = weights.kernel.value();
        for t in 0..2 {
            for u in 0..2 {
                let expected: f32 = (0..3).map(|d| input[[0, 0, 0, t, d]] * kernel[[0, 0, d, u]]).sum();
                assert!((prediction[[0, 0, 0, t, 0, u]] - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_caps_conv_single_iteration_is_one_squash() {
        let config = CapsConvConfig::new(2, 3, 1, 2);
        let mut layer = CapsConv::new(config.clone()).unwrap();
        assert_eq!(layer.routing().aggregation_steps(), 1);
        layer.build_with_rng(&[1, 3, 3, 2, 2], &mut rng()).unwrap();
        let input = capsule_input((1, 3, 3, 2, 2)).mapv(|v| v * 10.0);
        let output = layer.call(&input.view()).unwrap();

        // Logits nuls: couplage uniforme 1 / (rows * cols * caps_filters)
        let prediction = layer.predict(layer.weights.as_ref().unwrap(), &input.view()).unwrap();
        let (_, rows, cols, _, caps_filters, _) = prediction.dim();
        let uniform = 1.0 / (rows * cols * caps_filters) as f32;
        let expected = squash(&(prediction.sum_axis(Axis(3)) * uniform), Axis(4)).unwrap();
        for (a, b) in output.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6);
        }

        // Mêmes poids, deux itérations: le couplage n'est plus uniforme
        let mut twice = CapsConv::new(CapsConvConfig { routing_iter: 2, ..config }).unwrap();
        twice.build_with_rng(&[1, 3, 3, 2, 2], &mut rng()).unwrap();
        let routed = twice.call(&input.view()).unwrap();
        assert!(routed.iter().zip(output.iter()).any(|(a, b)| (a - b).abs() > 1e-6));
    }

    fn coeff(index: &[usize]) -> f32 {
        let flat: usize = index.iter().enumerate().map(|(k, i)| (2 * k + 3) * i).sum();
        (flat % 7) as f32 * 0.3 - 0.9
    }

    fn weighted_sum<D: Dimension>(output: &Array<f32, D>) -> f32 {
        output.indexed_iter().map(|(index, v)| v * coeff(index.into_dimension().slice())).sum()
    }

    #[test]
    fn test_caps_conv_backward_matches_finite_difference() {
        let mut layer = CapsConv::new(CapsConvConfig::new(2, 3, 2, 2).with_padding(Padding::Same)).unwrap();
        layer.build_with_rng(&[2, 3, 3, 2, 3], &mut rng()).unwrap();
        let input = capsule_input((2, 3, 3, 2, 3)).mapv(|v| v * 4.0);
        let output = layer.call(&input.view()).unwrap();
        let grad_output = Array5::from_shape_fn(output.raw_dim(), |(b, r, c, f, d)| coeff(&[b, r, c, f, d]));
        let grads = layer.backward(&input.view(), &grad_output.view()).unwrap();
        assert_eq!(grads.input.dim(), input.dim());
        assert_eq!(grads.params[1].shape(), &[6]);

        let h = 1e-2;
        for index in [[0, 0, 0, 0, 0], [0, 1, 2, 1, 2], [1, 2, 2, 0, 1]] {
            let (mut plus, mut minus) = (input.clone(), input.clone());
            plus[index] += h;
            minus[index] -= h;
            let numeric = (weighted_sum(&layer.call(&plus.view()).unwrap())
                - weighted_sum(&layer.call(&minus.view()).unwrap()))
                / (2.0 * h);
            let analytic = grads.input[index];
            assert!((analytic - numeric).abs() < 3e-3 + 2e-2 * numeric.abs(), "{index:?}: {analytic} vs {numeric}");
        }

        for (param, index) in [(0, vec![0, 0, 0, 0]), (0, vec![1, 1, 2, 5]), (1, vec![3])] {
            layer.parameters_mut()[param].nudge(&index, h);
            let up = weighted_sum(&layer.call(&input.view()).unwrap());
            layer.parameters_mut()[param].nudge(&index, -2.0 * h);
            let down = weighted_sum(&layer.call(&input.view()).unwrap());
            layer.parameters_mut()[param].nudge(&index, h);
            let numeric = (up - down) / (2.0 * h);
            let analytic = grads.params[param][index.as_slice()];
            assert!((analytic - numeric).abs() < 3e-3 + 2e-2 * numeric.abs(), "{index:?}: {analytic} vs {numeric}");
        }
    }

    #[test]
    fn test_primary_capsules_backward_matches_finite_difference() {
        let mut layer = CapsConv2d::new(CapsConv2dConfig::new(2, 3, 2)).unwrap();
        layer.build_with_rng(&[1, 4, 4, 2], &mut rng()).unwrap();
        let input = Array4::from_shape_fn((1, 4, 4, 2), |(_, r, c, ch)| ((r * 5 + c * 3 + ch) % 7) as f32 * 0.2 - 0.6);
        let output = layer.call(&input.view()).unwrap();
        let grad_output = Array5::from_shape_fn(output.raw_dim(), |(b, r, c, f, d)| coeff(&[b, r, c, f, d]));
        let grads = layer.backward(&input.view(), &grad_output.view()).unwrap();
        assert_eq!(grads.params.len(), 2);

        let h = 1e-2;
        for index in [(0, 0, 0, 0), (0, 1, 2, 1), (0, 3, 3, 0)] {
            let (mut plus, mut minus) = (input.clone(), input.clone());
            plus[index] += h;
            minus[index] -= h;
            let numeric = (weighted_sum(&layer.call(&plus.view()).unwrap())
                - weighted_sum(&layer.call(&minus.view()).unwrap()))
                / (2.0 * h);
            assert!((grads.input[index] - numeric).abs() < 3e-3 + 2e-2 * numeric.abs(), "{index:?}");
        }

        let index = [1, 0, 1, 4];
        layer.parameters_mut()[0].nudge(&index, h);
        let up = weighted_sum(&layer.call(&input.view()).unwrap());
        layer.parameters_mut()[0].nudge(&index, -2.0 * h);
        let down = weighted_sum(&layer.call(&input.view()).unwrap());
        let numeric = (up - down) / (2.0 * h);
        assert!((grads.params[0][index.as_slice()] - numeric).abs() < 3e-3 + 2e-2 * numeric.abs());
    }

    #[test]
    fn test_caps_conv_rejects_other_capsule_sizes() {
        let mut layer = CapsConv::new(CapsConvConfig::new(2, 4, 2, 3)).unwrap();
        layer.build_with_rng(&[1, 5, 5, 3, 4], &mut rng()).unwrap();
        let input = capsule_input((1, 5, 5, 3, 5));
        assert!(matches!(layer.call(&input.view()), Err(CapsError::ShapeMismatch(_))));
    }

    #[test]
    fn test_caps_conv_config_records_build_fields() {
        let mut layer = CapsConv::new(CapsConvConfig::new(2, 4, 2, 3)).unwrap();
        layer.build_with_rng(&[1, 5, 5, 3, 4], &mut rng()).unwrap();
        let config = layer.get_config();
        match &config {
            LayerConfig::CapsConv(c) => {
                assert_eq!(c.input_caps_filters, Some(3));
                assert_eq!(c.input_caps_dims, Some(4));
                assert_eq!(c.routing_iter, 2);
            }
            other => panic!("configuration inattendue: {other:?}"),
        }
        let rebuilt = CapsConv::from_config(&config).unwrap();
        assert!(!rebuilt.is_built());
        assert_eq!(layer.parameters().len(), 2);
    }

    #[test]
    fn test_caps_conv_is_deterministic() {
        let mut layer = CapsConv::new(CapsConvConfig::new(3, 4, 3, 2)).unwrap();
        layer.build_with_rng(&[2, 4, 4, 5, 4], &mut rng()).unwrap();
        let input = capsule_input((2, 4, 4, 5, 4));
        let first = layer.call(&input.view()).unwrap();
        let second = layer.call(&input.view()).unwrap();
        assert_eq!(first, second);
    }
}
