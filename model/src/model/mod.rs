pub mod activations;
pub mod builder;
pub mod capsule;
pub mod config;
pub mod core;
pub mod dense;
pub mod error;
pub mod layers;
pub mod loss;
pub mod optimizer;
pub mod parameter;
pub mod routing;

// Réexportations principales
pub use activations::{joint_softmax, softmax, softmax_backward, squash, squash_backward};
pub use builder::ModelBuilder;
pub use capsule::{CapsConv, CapsConv2d, CapsuleRoutingLayer};
pub use config::{
    Activation, CapsConv2dConfig, CapsConvConfig, CapsDenseConfig, Conv2dConfig, LayerConfig, MarginLossConfig,
    NetworkConfig, Padding,
};
pub use self::core::{CapsNet, Evaluation, Gradients};
pub use dense::CapsDense;
pub use error::{CapsError, Result};
pub use layers::Conv2d;
pub use loss::{accuracy, capsule_lengths, capsule_lengths_backward, LossFunction, MarginLoss, ReconstructionLoss};
pub use optimizer::{Adam, Optimizer, Sgd};
pub use parameter::{LayerGradients, ParamId, Parameter};
pub use routing::{DynamicRouting, RoutingSchedule, RoutingStrategy};
