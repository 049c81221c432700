pub mod ctc;
pub mod graph;
pub mod layer_spec;
pub mod model_desc;
pub mod summary;
pub mod weight_init;

pub use graph::{build, build_seeded, Graph, Mode, Predictor, TrainingModel};
pub use model_desc::ModelDesc;
