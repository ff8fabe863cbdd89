use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Status;
use tensorflow::Variable;

use super::{zero_untriggered, CnnBlock};
use crate::activations;
use crate::config::CnnBlockKind;
use crate::layers::{max_pool, same_padding_size, Conv2d};

/// (kernel, filters, stride, max pool after)
const ALEXNET_LAYERS: [(u64, u64, u64, bool); 5] = [
    (11, 96, 4, true),
    (5, 256, 1, true),
    (3, 384, 1, false),
    (3, 384, 1, false),
    (3, 256, 1, true),
];

const POOL_SIZE: u64 = 3;
const POOL_STRIDE: u64 = 2;

/// Five convolutions with three interleaved 3x3/2 max pools.
pub struct AlexNet {
    convs: Vec<(Conv2d, bool)>,
    output_shape: [u64; 3],
}

impl AlexNet {
    pub fn new(image_shape: [u64; 3], scope: &mut Scope) -> Result<AlexNet, Status> {
        let [mut h, mut w, mut channels] = image_shape;
        let mut convs = Vec::with_capacity(ALEXNET_LAYERS.len());
        for (kernel, filters, stride, pool) in ALEXNET_LAYERS {
            convs.push((Conv2d::new(kernel, channels, filters, stride, scope)?, pool));
            h = same_padding_size(h, stride);
            w = same_padding_size(w, stride);
            if pool {
                h = same_padding_size(h, POOL_STRIDE);
                w = same_padding_size(w, POOL_STRIDE);
            }
            channels = filters;
        }
        Ok(AlexNet {
            convs,
            output_shape: [h, w, channels],
        })
    }
}

impl CnnBlock for AlexNet {
    fn kind(&self) -> CnnBlockKind {
        CnnBlockKind::Alexnet
    }

    fn output_shape(&self) -> [u64; 3] {
        self.output_shape
    }

    fn apply(&self, image: Output, trigger: Output, scope: &mut Scope) -> Result<Output, Status> {
        let relu = activations::relu();
        let mut x = image;
        for (conv, pool) in &self.convs {
            x = conv.apply(x, &*relu, scope)?;
            if *pool {
                x = max_pool(x, POOL_SIZE, POOL_STRIDE, scope)?;
            }
        }
        zero_untriggered(x, trigger, scope)
    }

    fn variables(&self) -> Vec<Variable> {
        self.convs.iter().flat_map(|(conv, _)| conv.variables()).collect()
    }
}
