//! Full array-event classifiers built from a [`ModelConfig`].
mod cnn_rnn;
mod mvcnn;

pub use cnn_rnn::CnnRnnModel;
pub use mvcnn::{max_pool_views, MvcnnModel};

use tensorflow::ops;
use tensorflow::DataType;
use tensorflow::Operation;
use tensorflow::Scope;
use tensorflow::Shape;
use tensorflow::Status;
use tensorflow::Variable;

use crate::config::ModelConfig;
use crate::outputs::Outputs;

/// Placeholders every model is fed through. The batch dimension is left open.
#[derive(Clone)]
pub struct ModelInputs {
    /// Float (batch, telescope, width, length, depth)
    pub telescope_data: Operation,
    /// Float (batch, telescope)
    pub telescope_triggers: Operation,
    /// Float (batch, telescope, aux)
    pub telescope_positions: Operation,
    /// Int32 (batch)
    pub gamma_hadron_labels: Operation,
}

fn open_batch(dims: &[u64]) -> Shape {
    let mut shape = vec![None];
    shape.extend(dims.iter().map(|d| Some(*d as i64)));
    Shape::from(Some(shape))
}

impl ModelInputs {
    pub fn new(config: &ModelConfig, scope: &mut Scope) -> Result<ModelInputs, Status> {
        let [w, l, d] = config.image_shape;
        let t = config.num_telescopes;
        Ok(ModelInputs {
            telescope_data: ops::Placeholder::new()
                .dtype(DataType::Float)
                .shape(open_batch(&[t, w, l, d]))
                .build(&mut scope.with_op_name("telescope_data"))?,
            telescope_triggers: ops::Placeholder::new()
                .dtype(DataType::Float)
                .shape(open_batch(&[t]))
                .build(&mut scope.with_op_name("telescope_triggers"))?,
            telescope_positions: ops::Placeholder::new()
                .dtype(DataType::Float)
                .shape(open_batch(&[t, config.num_auxiliary_inputs]))
                .build(&mut scope.with_op_name("telescope_positions"))?,
            gamma_hadron_labels: ops::Placeholder::new()
                .dtype(DataType::Int32)
                .shape(open_batch(&[]))
                .build(&mut scope.with_op_name("gamma_hadron_labels"))?,
        })
    }
}

/// What the runner needs from a built model.
pub trait ArrayModel {
    fn inputs(&self) -> &ModelInputs;

    /// Named outputs; the default output is the logits.
    fn outputs(&self) -> Outputs;

    /// Every variable the model owns, each exactly once.
    fn variables(&self) -> Vec<Variable>;
}
