use serde::{Deserialize, Serialize};

use super::error::{invalid_config, Result};

/// Fonction d'activation appliquée en sortie d'une convolution.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum Activation {
    #[serde(rename = "relu")]
    ReLU,
    #[serde(rename = "leaky_relu")]
    LeakyReLU(f32),
    #[serde(rename = "sigmoid")]
    Sigmoid,
    #[serde(rename = "tanh")]
    Tanh,
    #[default]
    #[serde(rename = "linear")]
    None,
}

/// Mode de padding spatial, même arithmétique que `valid` / `same` en Keras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

fn positive(value: usize, label: &str) -> Result<()> {
    if value == 0 {
        return Err(invalid_config(format!("{label} doit être > 0")));
    }
    Ok(())
}

fn positive_pair(value: (usize, usize), label: &str) -> Result<()> {
    positive(value.0, label)?;
    positive(value.1, label)
}

/// Convolution 2D classique (couche d'entrée du réseau).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2dConfig {
    pub filters: usize,
    pub kernel_size: (usize, usize),
    pub strides: (usize, usize),
    #[serde(default)]
    pub padding: Padding,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default = "default_use_bias")]
    pub use_bias: bool,
}

fn default_use_bias() -> bool {
    true
}

impl Conv2dConfig {
    pub fn new(filters: usize, kernel_size: usize) -> Self {
        Self {
            filters,
            kernel_size: (kernel_size, kernel_size),
            strides: (1, 1),
            padding: Padding::Valid,
            activation: Activation::None,
            use_bias: true,
        }
    }

    pub fn with_strides(mut self, stride: usize) -> Self {
        self.strides = (stride, stride);
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn validate(&self) -> Result<()> {
        positive(self.filters, "filters")?;
        positive_pair(self.kernel_size, "kernel_size")?;
        positive_pair(self.strides, "strides")
    }
}

/// Capsules primaires: convolution puis découpage des canaux en capsules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsConv2dConfig {
    pub caps_filters: usize,
    pub caps_dims: usize,
    pub kernel_size: (usize, usize),
    pub strides: (usize, usize),
    #[serde(default)]
    pub padding: Padding,
}

impl CapsConv2dConfig {
    pub fn new(caps_filters: usize, caps_dims: usize, kernel_size: usize) -> Self {
        Self {
            caps_filters,
            caps_dims,
            kernel_size: (kernel_size, kernel_size),
            strides: (1, 1),
            padding: Padding::Valid,
        }
    }

    pub fn with_strides(mut self, stride: usize) -> Self {
        self.strides = (stride, stride);
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn validate(&self) -> Result<()> {
        positive(self.caps_filters, "caps_filters")?;
        positive(self.caps_dims, "caps_dims")?;
        positive_pair(self.kernel_size, "kernel_size")?;
        positive_pair(self.strides, "strides")
    }
}

/// Couche capsule-vers-capsule convolutive avec routage par position.
///
/// `input_caps_filters` et `input_caps_dims` sont renseignés par `build`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsConvConfig {
    pub caps_filters: usize,
    pub caps_dims: usize,
    pub routing_iter: usize,
    pub kernel_size: (usize, usize),
    pub strides: (usize, usize),
    #[serde(default)]
    pub padding: Padding,
    #[serde(default)]
    pub input_caps_filters: Option<usize>,
    #[serde(default)]
    pub input_caps_dims: Option<usize>,
}

impl CapsConvConfig {
    pub fn new(caps_filters: usize, caps_dims: usize, routing_iter: usize, kernel_size: usize) -> Self {
        Self {
            caps_filters,
            caps_dims,
            routing_iter,
            kernel_size: (kernel_size, kernel_size),
            strides: (1, 1),
            padding: Padding::Valid,
            input_caps_filters: None,
            input_caps_dims: None,
        }
    }

    pub fn with_strides(mut self, stride: usize) -> Self {
        self.strides = (stride, stride);
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn validate(&self) -> Result<()> {
        positive(self.caps_filters, "caps_filters")?;
        positive(self.caps_dims, "caps_dims")?;
        positive_pair(self.kernel_size, "kernel_size")?;
        positive_pair(self.strides, "strides")
    }
}

/// Couche de capsules dense (entièrement connectée).
///
/// `input_caps` et `input_caps_dims` sont renseignés par `build`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsDenseConfig {
    pub caps: usize,
    pub caps_dims: usize,
    pub routing_iter: usize,
    #[serde(default)]
    pub input_caps: Option<usize>,
    #[serde(default)]
    pub input_caps_dims: Option<usize>,
}

impl CapsDenseConfig {
    pub fn new(caps: usize, caps_dims: usize, routing_iter: usize) -> Self {
        Self {
            caps,
            caps_dims,
            routing_iter,
            input_caps: None,
            input_caps_dims: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        positive(self.caps, "caps")?;
        positive(self.caps_dims, "caps_dims")
    }
}

/// Configuration sérialisable d'une couche, étiquetée par sa classe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config")]
pub enum LayerConfig {
    Conv2d(Conv2dConfig),
    CapsConv2d(CapsConv2dConfig),
    CapsConv(CapsConvConfig),
    CapsDense(CapsDenseConfig),
}

impl LayerConfig {
    pub fn class_name(&self) -> &'static str {
        match self {
            LayerConfig::Conv2d(_) => "Conv2d",
            LayerConfig::CapsConv2d(_) => "CapsConv2d",
            LayerConfig::CapsConv(_) => "CapsConv",
            LayerConfig::CapsDense(_) => "CapsDense",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarginLossConfig {
    pub positive_margin: f32,
    pub negative_margin: f32,
    pub down_weighting: f32,
}

impl Default for MarginLossConfig {
    fn default() -> Self {
        Self {
            positive_margin: 0.9,
            negative_margin: 0.1,
            down_weighting: 0.5,
        }
    }
}

/// Description complète d'un CapsNet.
///
/// `input_shape` est (rows, cols, channels). Les couches doivent suivre
/// l'ordre: `Conv2d`*, un `CapsConv2d`, `CapsConv`*, un `CapsDense` final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub input_shape: (usize, usize, usize),
    pub layers: Vec<LayerConfig>,
    #[serde(default)]
    pub loss: MarginLossConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            input_shape: (28, 28, 1),
            layers: vec![
                LayerConfig::Conv2d(Conv2dConfig::new(256, 9).with_activation(Activation::ReLU)),
                LayerConfig::CapsConv2d(CapsConv2dConfig::new(32, 8, 9).with_strides(2)),
                LayerConfig::CapsDense(CapsDenseConfig::new(10, 16, 3)),
            ],
            loss: MarginLossConfig::default(),
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        let (rows, cols, channels) = self.input_shape;
        positive(rows, "input_shape.rows")?;
        positive(cols, "input_shape.cols")?;
        positive(channels, "input_shape.channels")?;

        // 0: convolutions, 1: capsules convolutives, 2: capsules denses
        let mut stage = 0;
        for (i, layer) in self.layers.iter().enumerate() {
            stage = match (stage, layer) {
                (0, LayerConfig::Conv2d(c)) => {
                    c.validate()?;
                    0
                }
                (0, LayerConfig::CapsConv2d(c)) => {
                    c.validate()?;
                    1
                }
                (1, LayerConfig::CapsConv(c)) => {
                    c.validate()?;
                    1
                }
                (1, LayerConfig::CapsDense(c)) => {
                    c.validate()?;
                    2
                }
                (_, other) => {
                    return Err(invalid_config(format!(
                        "couche {i} ({}) mal placée dans le réseau",
                        other.class_name()
                    )))
                }
            };
        }

        if stage != 2 {
            return Err(invalid_config(
                "le réseau doit contenir un CapsConv2d puis se terminer par un CapsDense",
            ));
        }

        let loss = &self.loss;
        if loss.negative_margin >= loss.positive_margin || loss.down_weighting < 0.0 {
            return Err(invalid_config("marges de la margin loss incohérentes"));
        }
        Ok(())
    }
}
