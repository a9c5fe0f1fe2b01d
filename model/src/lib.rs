//! Réseaux de capsules (CapsNet) avec routage dynamique par accord.
//!
//! Tenseurs au format (batch, rows, cols, ...), `f32`. Les couches suivent un
//! cycle en deux temps: configuration validée à la création, puis `build`
//! sur la forme d'entrée avant tout `call`.

pub mod model;

pub use model::{
    accuracy, capsule_lengths, capsule_lengths_backward, joint_softmax, softmax, softmax_backward, squash,
    squash_backward, Activation, Adam, CapsConv, CapsConv2d, CapsConv2dConfig, CapsConvConfig, CapsDense,
    CapsDenseConfig, CapsError, CapsNet, CapsuleRoutingLayer, Conv2d, Conv2dConfig, DynamicRouting, Evaluation,
    Gradients, LayerConfig, LayerGradients, LossFunction, MarginLoss, MarginLossConfig, ModelBuilder, NetworkConfig,
    Optimizer, Padding, ParamId, Parameter, ReconstructionLoss, Result, RoutingSchedule, RoutingStrategy, Sgd,
};
