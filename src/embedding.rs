//! Per-telescope embeddings: shared backbone, flatten, shared projection, then
//! stacking over telescopes and appending the telescope positions.
use log::debug;
use tensorflow::ops;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Status;
use tensorflow::Variable;

use crate::activations;
use crate::backbones::{cnn_block, CnnBlock};
use crate::config::ModelConfig;
use crate::layers::{concat, flatten, stack, Dense};

/// Maps one telescope's image to a fixed-width embedding. One instance holds the
/// only copy of the parameters; `embed` may be called for any telescope index.
pub struct TelescopeEncoder {
    backbone: Box<dyn CnnBlock>,
    projection: Dense,
}

impl TelescopeEncoder {
    pub fn new(config: &ModelConfig, scope: &mut Scope) -> Result<TelescopeEncoder, Status> {
        let mut scope = scope.new_sub_scope("telescope_encoder");
        let scope = &mut scope;
        let backbone = cnn_block(config.cnn_block, config.image_shape, scope)?;
        let projection = Dense::new(backbone.flat_size(), config.embedding_size, true, scope)?;
        Ok(TelescopeEncoder { backbone, projection })
    }

    /// (batch, embedding_size) relu embedding for one telescope.
    pub fn embed(&self, image: Output, trigger: Output, scope: &mut Scope) -> Result<Output, Status> {
        let features = self.backbone.apply(image, trigger, scope)?;
        let flat = flatten(features, self.backbone.flat_size(), scope)?;
        self.projection.apply(flat, &*activations::relu(), scope)
    }

    pub fn variables(&self) -> Vec<Variable> {
        let mut vars = self.backbone.variables();
        vars.extend(self.projection.variables());
        vars
    }
}

/// Slice telescope `index` out of a batch-major tensor (batch, telescope, ...).
pub fn telescope_slice(batched: Output, index: u64, scope: &mut Scope) -> Result<Output, Status> {
    Ok(ops::gather_v2(
        batched,
        ops::constant(index as i32, scope)?,
        ops::constant(1i32, scope)?,
        scope,
    )?
    .into())
}

/// Embed every telescope and append positions:
/// (batch, telescope, embedding_size + aux).
pub fn augmented_embeddings(
    encoder: &TelescopeEncoder,
    telescope_data: Output,
    telescope_triggers: Output,
    telescope_positions: Output,
    num_telescopes: u64,
    scope: &mut Scope,
) -> Result<Output, Status> {
    let mut embeddings = Vec::with_capacity(num_telescopes as usize);
    for index in 0..num_telescopes {
        let mut scope = scope.new_sub_scope("telescope");
        let image = telescope_slice(telescope_data.clone(), index, &mut scope)?;
        let trigger = telescope_slice(telescope_triggers.clone(), index, &mut scope)?;
        embeddings.push(encoder.embed(image, trigger, &mut scope)?);
    }
    debug!("embedded {} telescopes with one shared encoder", embeddings.len());
    let stacked = stack(embeddings, 1, scope)?;
    concat(vec![stacked, telescope_positions], 2, scope)
}
