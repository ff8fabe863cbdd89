use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Status;
use tensorflow::Variable;

use super::{zero_untriggered, CnnBlock};
use crate::activations;
use crate::config::CnnBlockKind;
use crate::layers::{same_padding_size, Conv2d, DepthwiseConv2d};

const STEM_FILTERS: u64 = 32;
const STEM_STRIDE: u64 = 2;

/// (pointwise filters, depthwise stride) per separable block
const SEPARABLE_BLOCKS: [(u64, u64); 9] = [
    (64, 1),
    (128, 2),
    (128, 1),
    (256, 2),
    (256, 1),
    (512, 2),
    (512, 1),
    (1024, 2),
    (1024, 1),
];

struct SeparableBlock {
    depthwise: DepthwiseConv2d,
    pointwise: Conv2d,
}

/// A 3x3/2 stem followed by depthwise separable blocks, all relu6.
pub struct MobileNet {
    stem: Conv2d,
    blocks: Vec<SeparableBlock>,
    output_shape: [u64; 3],
}

impl MobileNet {
    pub fn new(image_shape: [u64; 3], scope: &mut Scope) -> Result<MobileNet, Status> {
        let [h, w, depth] = image_shape;
        let stem = Conv2d::new(3, depth, STEM_FILTERS, STEM_STRIDE, scope)?;
        let mut h = same_padding_size(h, STEM_STRIDE);
        let mut w = same_padding_size(w, STEM_STRIDE);
        let mut channels = STEM_FILTERS;
        let mut blocks = Vec::with_capacity(SEPARABLE_BLOCKS.len());
        for (filters, stride) in SEPARABLE_BLOCKS {
            let mut scope = scope.new_sub_scope("separable");
            blocks.push(SeparableBlock {
                depthwise: DepthwiseConv2d::new(3, channels, stride, &mut scope)?,
                pointwise: Conv2d::new(1, channels, filters, 1, &mut scope)?,
            });
            h = same_padding_size(h, stride);
            w = same_padding_size(w, stride);
            channels = filters;
        }
        Ok(MobileNet {
            stem,
            blocks,
            output_shape: [h, w, channels],
        })
    }
}

impl CnnBlock for MobileNet {
    fn kind(&self) -> CnnBlockKind {
        CnnBlockKind::Mobilenet
    }

    fn output_shape(&self) -> [u64; 3] {
        self.output_shape
    }

    fn apply(&self, image: Output, trigger: Output, scope: &mut Scope) -> Result<Output, Status> {
        let relu6 = activations::relu6();
        let mut x = self.stem.apply(image, &*relu6, scope)?;
        for block in &self.blocks {
            x = block.depthwise.apply(x, &*relu6, scope)?;
            x = block.pointwise.apply(x, &*relu6, scope)?;
        }
        zero_untriggered(x, trigger, scope)
    }

    fn variables(&self) -> Vec<Variable> {
        let mut vars = self.stem.variables();
        for block in &self.blocks {
            vars.extend(block.depthwise.variables());
            vars.extend(block.pointwise.variables());
        }
        vars
    }
}
