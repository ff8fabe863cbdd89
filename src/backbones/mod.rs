//! Per-telescope convolutional feature extractors.
//!
//! A backbone owns one parameter set. Models build a single instance and call
//! [`CnnBlock::apply`] once per telescope, so every telescope image goes through
//! identical weights no matter how many telescopes the array has.
mod alexnet;
mod mobilenet;
mod resnet;

pub use alexnet::AlexNet;
pub use mobilenet::MobileNet;
pub use resnet::ResNet;

use log::debug;
use tensorflow::ops;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Status;
use tensorflow::Variable;

use crate::config::CnnBlockKind;

pub trait CnnBlock {
    fn kind(&self) -> CnnBlockKind;

    /// `[height, width, channels]` of the feature map `apply` produces.
    fn output_shape(&self) -> [u64; 3];

    fn flat_size(&self) -> u64 {
        self.output_shape().iter().product()
    }

    /// Extract features from one telescope's images (batch, width, length, depth).
    /// Rows whose `trigger` entry is 0 come out as zeros.
    fn apply(&self, image: Output, trigger: Output, scope: &mut Scope) -> Result<Output, Status>;

    fn variables(&self) -> Vec<Variable>;
}

/// Build the backbone named by the configuration, creating its variables.
pub fn cnn_block(kind: CnnBlockKind, image_shape: [u64; 3], scope: &mut Scope) -> Result<Box<dyn CnnBlock>, Status> {
    let mut scope = scope.new_sub_scope(&kind.to_string());
    let block: Box<dyn CnnBlock> = match kind {
        CnnBlockKind::Alexnet => Box::new(AlexNet::new(image_shape, &mut scope)?),
        CnnBlockKind::Mobilenet => Box::new(MobileNet::new(image_shape, &mut scope)?),
        CnnBlockKind::Resnet => Box::new(ResNet::new(image_shape, &mut scope)?),
    };
    debug!(
        "{} block: output {:?}, {} variables",
        block.kind(),
        block.output_shape(),
        block.variables().len()
    );
    Ok(block)
}

/// Multiply each row of a feature map by that row's trigger flag.
fn zero_untriggered(features: Output, trigger: Output, scope: &mut Scope) -> Result<Output, Status> {
    let shape = ops::constant(&[-1i32, 1, 1, 1][..], scope)?;
    let trigger = ops::reshape(trigger, shape, scope)?;
    Ok(ops::multiply(features, trigger, scope)?.into())
}
