use tensorflow::ops;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Status;
use tensorflow::Variable;

use super::{zero_untriggered, CnnBlock};
use crate::activations;
use crate::config::CnnBlockKind;
use crate::layers::{max_pool, same_padding_size, Conv2d};

const STEM_FILTERS: u64 = 64;
const STEM_KERNEL: u64 = 7;
const STEM_STRIDE: u64 = 2;

/// (filters, stride) of the first conv in each stage
const STAGES: [(u64, u64); 4] = [(64, 1), (128, 2), (256, 2), (512, 2)];

/// Two 3x3 convolutions plus a shortcut. The shortcut is a strided 1x1
/// projection whenever the block changes the spatial size or channel count.
struct ResidualBlock {
    first: Conv2d,
    second: Conv2d,
    projection: Option<Conv2d>,
}

impl ResidualBlock {
    fn new(in_channels: u64, filters: u64, stride: u64, scope: &mut Scope) -> Result<ResidualBlock, Status> {
        let mut scope = scope.new_sub_scope("residual");
        let scope = &mut scope;
        let projection = if stride != 1 || in_channels != filters {
            Some(Conv2d::new(1, in_channels, filters, stride, scope)?)
        } else {
            None
        };
        Ok(ResidualBlock {
            first: Conv2d::new(3, in_channels, filters, stride, scope)?,
            second: Conv2d::new(3, filters, filters, 1, scope)?,
            projection,
        })
    }

    fn apply(&self, input: Output, scope: &mut Scope) -> Result<Output, Status> {
        let x = self.first.apply(input.clone(), &*activations::relu(), scope)?;
        let x = self.second.apply(x, &*activations::identity(), scope)?;
        let shortcut = match &self.projection {
            Some(projection) => projection.apply(input, &*activations::identity(), scope)?,
            None => input,
        };
        Ok(ops::relu(ops::add(x, shortcut, scope)?, scope)?.into())
    }

    fn variables(&self) -> Vec<Variable> {
        let mut vars = self.first.variables();
        vars.extend(self.second.variables());
        if let Some(projection) = &self.projection {
            vars.extend(projection.variables());
        }
        vars
    }
}

/// 7x7/2 stem, 3x3/2 max pool, then one residual block per stage.
pub struct ResNet {
    stem: Conv2d,
    blocks: Vec<ResidualBlock>,
    output_shape: [u64; 3],
}

impl ResNet {
    pub fn new(image_shape: [u64; 3], scope: &mut Scope) -> Result<ResNet, Status> {
        let [h, w, depth] = image_shape;
        let stem = Conv2d::new(STEM_KERNEL, depth, STEM_FILTERS, STEM_STRIDE, scope)?;
        let mut h = same_padding_size(same_padding_size(h, STEM_STRIDE), 2);
        let mut w = same_padding_size(same_padding_size(w, STEM_STRIDE), 2);
        let mut channels = STEM_FILTERS;
        let mut blocks = Vec::with_capacity(STAGES.len());
        for (filters, stride) in STAGES {
            blocks.push(ResidualBlock::new(channels, filters, stride, scope)?);
            h = same_padding_size(h, stride);
            w = same_padding_size(w, stride);
            channels = filters;
        }
        Ok(ResNet {
            stem,
            blocks,
            output_shape: [h, w, channels],
        })
    }
}

impl CnnBlock for ResNet {
    fn kind(&self) -> CnnBlockKind {
        CnnBlockKind::Resnet
    }

    fn output_shape(&self) -> [u64; 3] {
        self.output_shape
    }

    fn apply(&self, image: Output, trigger: Output, scope: &mut Scope) -> Result<Output, Status> {
        let mut x = self.stem.apply(image, &*activations::relu(), scope)?;
        x = max_pool(x, 3, 2, scope)?;
        for block in &self.blocks {
            x = block.apply(x, scope)?;
        }
        zero_untriggered(x, trigger, scope)
    }

    fn variables(&self) -> Vec<Variable> {
        let mut vars = self.stem.variables();
        for block in &self.blocks {
            vars.extend(block.variables());
        }
        vars
    }
}
