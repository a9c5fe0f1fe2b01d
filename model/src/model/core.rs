use ndarray::{Array3, ArrayD, ArrayView2, ArrayView4};
use serde::Serialize;
use tracing::debug;

use super::capsule::{CapsConv, CapsConv2d, CapsuleRoutingLayer};
use super::config::{LayerConfig, NetworkConfig};
use super::dense::CapsDense;
use super::error::{shape_mismatch, Result};
use super::layers::Conv2d;
use super::loss::{accuracy, argmax, capsule_lengths, capsule_lengths_backward, LossFunction, MarginLoss};
use super::parameter::Parameter;

/// Résultat d'une évaluation sur un batch étiqueté.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Evaluation {
    pub loss: f32,
    pub accuracy: f32,
}

/// Margin loss d'un batch et gradients de tous les paramètres, alignés sur
/// `parameters_mut()`.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub loss: f32,
    pub params: Vec<ArrayD<f32>>,
}

/// Modèle CapsNet principal
///
/// Convolutions d'entrée, capsules primaires, capsules convolutives
/// optionnelles puis capsules denses de sortie. Toutes les couches sont
/// construites: on l'obtient par `ModelBuilder`.
pub struct CapsNet {
    config: NetworkConfig,
    stem: Vec<Conv2d>,
    primary: CapsConv2d,
    capsule_convs: Vec<CapsConv>,
    output: CapsDense,
    margin_loss: MarginLoss,
}

impl CapsNet {
    pub(crate) fn new(
        config: NetworkConfig,
        stem: Vec<Conv2d>,
        primary: CapsConv2d,
        capsule_convs: Vec<CapsConv>,
        output: CapsDense,
    ) -> Self {
        let margin_loss = config.loss.into();
        Self {
            config,
            stem,
            primary,
            capsule_convs,
            output,
            margin_loss,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn num_classes(&self) -> usize {
        self.output.config().caps
    }

    /// Forward pass: (batch, rows, cols, channels) → capsules de sortie
    /// (batch, caps, caps_dims).
    pub fn forward(&self, images: &ArrayView4<f32>) -> Result<Array3<f32>> {
        self.check_images(images)?;

        let mut features = images.to_owned();
        for conv in &self.stem {
            features = conv.call(&features.view())?;
        }

        let mut capsules = self.primary.call(&features.view())?;
        debug!(shape = ?capsules.shape(), "capsules primaires");
        for layer in &self.capsule_convs {
            capsules = layer.call(&capsules.view())?;
            debug!(shape = ?capsules.shape(), "capsules convolutives");
        }

        self.output.call(&capsules.view())
    }

    fn check_images(&self, images: &ArrayView4<f32>) -> Result<()> {
        let (_, rows, cols, channels) = images.dim();
        if (rows, cols, channels) != self.config.input_shape {
            return Err(shape_mismatch(format!(
                "image {:?} pour un réseau d'entrée {:?}",
                (rows, cols, channels),
                self.config.input_shape
            )));
        }
        Ok(())
    }

    /// Margin loss et rétropropagation de bout en bout: longueurs, capsules
    /// de sortie, routages, capsules primaires puis convolutions d'entrée.
    pub fn gradients(&self, images: &ArrayView4<f32>, labels: &ArrayView2<f32>) -> Result<Gradients> {
        self.check_images(images)?;

        // Forward en conservant l'entrée de chaque couche
        let mut stem_inputs = Vec::with_capacity(self.stem.len());
        let mut features = images.to_owned();
        for conv in &self.stem {
            let next = conv.call(&features.view())?;
            stem_inputs.push(features);
            features = next;
        }
        let mut capsules = self.primary.call(&features.view())?;
        let mut caps_inputs = Vec::with_capacity(self.capsule_convs.len());
        for layer in &self.capsule_convs {
            let next = layer.call(&capsules.view())?;
            caps_inputs.push(capsules);
            capsules = next;
        }
        let output = self.output.call(&capsules.view())?;

        let lengths = capsule_lengths(&output.view());
        let loss = self
            .margin_loss
            .compute(&labels.view().into_dyn(), &lengths.view().into_dyn())?;
        let grad_lengths = self.margin_loss.length_gradient(labels, &lengths.view())?;
        let grad_output = capsule_lengths_backward(&output.view(), &grad_lengths.view())?;

        // Backprop en ordre inverse; gradients de paramètres empilés à l'envers
        let output_grads = self.output.backward(&capsules.view(), &grad_output.view())?;
        let mut grad_capsules = output_grads.input;
        let mut reversed = vec![output_grads.params];
        for (layer, input) in self.capsule_convs.iter().zip(&caps_inputs).rev() {
            let grads = layer.backward(&input.view(), &grad_capsules.view())?;
            grad_capsules = grads.input;
            reversed.push(grads.params);
        }
        let primary_grads = self.primary.backward(&features.view(), &grad_capsules.view())?;
        let mut grad_features = primary_grads.input;
        reversed.push(primary_grads.params);
        for (conv, input) in self.stem.iter().zip(&stem_inputs).rev() {
            let grads = conv.backward(&input.view(), &grad_features.view())?;
            grad_features = grads.input;
            reversed.push(grads.params);
        }

        debug!(loss, layers = reversed.len(), "gradients calculés");
        Ok(Gradients {
            loss,
            params: reversed.into_iter().rev().flatten().collect(),
        })
    }

    /// Classe prédite: indice de la capsule de sortie la plus longue.
    pub fn predict(&self, images: &ArrayView4<f32>) -> Result<Vec<usize>> {
        let lengths = capsule_lengths(&self.forward(images)?.view());
        Ok(lengths.rows().into_iter().map(|row| argmax(&row)).collect())
    }

    /// Margin loss moyenne et précision sur un batch étiqueté en one-hot.
    pub fn evaluate(&self, images: &ArrayView4<f32>, labels: &ArrayView2<f32>) -> Result<Evaluation> {
        let lengths = capsule_lengths(&self.forward(images)?.view());
        let losses = self.margin_loss.per_example(labels, &lengths.view())?;
        Ok(Evaluation {
            loss: losses.mean().unwrap_or(0.0),
            accuracy: accuracy(labels, &lengths.view())?,
        })
    }

    /// Configurations des couches construites, dans l'ordre du réseau.
    pub fn summary(&self) -> Vec<LayerConfig> {
        let mut layers: Vec<LayerConfig> = self
            .stem
            .iter()
            .map(|conv| LayerConfig::Conv2d(conv.config().clone()))
            .collect();
        layers.push(self.primary.get_config());
        layers.extend(self.capsule_convs.iter().map(|layer| layer.get_config()));
        layers.push(self.output.get_config());
        layers
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut params: Vec<&Parameter> = self.stem.iter().flat_map(|conv| conv.parameters()).collect();
        params.extend(self.primary.parameters());
        params.extend(self.capsule_convs.iter().flat_map(|layer| layer.parameters()));
        params.extend(self.output.parameters());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params: Vec<&mut Parameter> = self
            .stem
            .iter_mut()
            .flat_map(|conv| conv.parameters_mut())
            .collect();
        params.extend(self.primary.parameters_mut());
        params.extend(self.capsule_convs.iter_mut().flat_map(|layer| layer.parameters_mut()));
        params.extend(self.output.parameters_mut());
        params
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.value().len()).sum()
    }
}
