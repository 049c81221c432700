pub mod activations;
pub mod batch_norm;
pub mod bilstm;
pub mod conv2d;
pub mod factory;
pub mod layer;
pub mod linear;
pub mod pooling;
pub mod reshape;

pub use factory::Layers;
pub use layer::{ForwardMode, Layer, Param};
