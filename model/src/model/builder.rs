use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::info;

use super::capsule::{CapsConv, CapsConv2d, CapsuleRoutingLayer};
use super::config::{LayerConfig, NetworkConfig};
use super::core::CapsNet;
use super::dense::CapsDense;
use super::error::{invalid_config, Result};
use super::layers::Conv2d;

/// Constructeur de modèle
///
/// Valide la configuration puis construit chaque couche en propageant la
/// forme de sortie de l'une comme forme d'entrée de la suivante.
#[derive(Debug, Default)]
pub struct ModelBuilder {
    network_config: Option<NetworkConfig>,
    seed: Option<u64>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network_config(mut self, config: NetworkConfig) -> Self {
        self.network_config = Some(config);
        self
    }

    /// Graine des initialiseurs, pour des poids reproductibles.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<CapsNet> {
        let config = self.network_config.unwrap_or_default();
        config.validate()?;

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::build_layers(config, &mut rng)
    }

    fn build_layers(config: NetworkConfig, rng: &mut dyn RngCore) -> Result<CapsNet> {
        let (rows, cols, channels) = config.input_shape;
        let mut shape = vec![1, rows, cols, channels];

        let mut stem = Vec::new();
        let mut primary = None;
        let mut capsule_convs = Vec::new();
        let mut output = None;

        for layer_config in &config.layers {
            match layer_config {
                LayerConfig::Conv2d(c) => {
                    let mut conv = Conv2d::new(c.clone())?;
                    conv.build_with_rng(&shape, rng)?;
                    shape = conv.output_shape(&shape)?;
                    stem.push(conv);
                }
                LayerConfig::CapsConv2d(_) => {
                    let mut layer = CapsConv2d::from_config(layer_config)?;
                    layer.build_with_rng(&shape, rng)?;
                    shape = layer.output_shape(&shape)?;
                    primary = Some(layer);
                }
                LayerConfig::CapsConv(_) => {
                    let mut layer = CapsConv::from_config(layer_config)?;
                    layer.build_with_rng(&shape, rng)?;
                    shape = layer.output_shape(&shape)?;
                    capsule_convs.push(layer);
                }
                LayerConfig::CapsDense(_) => {
                    let mut layer = CapsDense::from_config(layer_config)?;
                    layer.build_with_rng(&shape, rng)?;
                    shape = layer.output_shape(&shape)?;
                    output = Some(layer);
                }
            }
            info!(layer = layer_config.class_name(), output = ?&shape[1..], "couche construite");
        }

        let primary = primary.ok_or_else(|| invalid_config("capsules primaires manquantes"))?;
        let output = output.ok_or_else(|| invalid_config("couche de sortie manquante"))?;

        let net = CapsNet::new(config, stem, primary, capsule_convs, output);
        info!(
            parameters = net.num_parameters(),
            classes = net.num_classes(),
            "CapsNet construit"
        );
        Ok(net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{CapsConv2dConfig, CapsDenseConfig};
    use crate::model::error::CapsError;
    use ndarray::Array4;

    fn primary_only() -> NetworkConfig {
        NetworkConfig {
            input_shape: (8, 8, 2),
            layers: vec![
                LayerConfig::CapsConv2d(CapsConv2dConfig::new(2, 4, 3)),
                LayerConfig::CapsDense(CapsDenseConfig::new(2, 3, 1)),
            ],
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn test_default_config_builds_mnist_capsnet() {
        let net = ModelBuilder::new().with_seed(0).build().unwrap();
        let summary = net.summary();
        assert_eq!(summary.len(), 3);
        match &summary[2] {
            LayerConfig::CapsDense(c) => {
                assert_eq!(c.input_caps, Some(6 * 6 * 32));
                assert_eq!(c.input_caps_dims, Some(8));
            }
            other => panic!("couche inattendue: {other:?}"),
        }
    }

    #[test]
    fn test_seed_makes_weights_reproducible() {
        let build = || {
            ModelBuilder::new()
                .with_network_config(primary_only())
                .with_seed(11)
                .build()
                .unwrap()
        };
        let (a, b) = (build(), build());
        let images = Array4::from_shape_fn((2, 8, 8, 2), |(n, r, c, ch)| ((n + r + 2 * c + ch) % 5) as f32 * 0.2);
        assert_eq!(a.forward(&images.view()).unwrap(), b.forward(&images.view()).unwrap());
        assert_ne!(a.parameters()[0].id(), b.parameters()[0].id());
    }

    #[test]
    fn test_invalid_config_is_rejected_before_build() {
        let config = NetworkConfig {
            layers: vec![LayerConfig::CapsDense(CapsDenseConfig::new(2, 3, 1))],
            ..primary_only()
        };
        let result = ModelBuilder::new().with_network_config(config).build();
        assert!(matches!(result, Err(CapsError::InvalidConfig(_))));
    }

    #[test]
    fn test_image_too_small_for_kernels() {
        let config = NetworkConfig {
            input_shape: (2, 2, 2),
            ..primary_only()
        };
        assert!(matches!(
            ModelBuilder::new().with_network_config(config).build(),
            Err(CapsError::ShapeMismatch(_))
        ));
    }
}
