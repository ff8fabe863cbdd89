//! Nonlinearities passed to layers as boxed closures over graph outputs.
use tensorflow::ops;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Status;

/// The signature every layer accepts for its nonlinearity.
pub type Activation = dyn Fn(Output, &mut Scope) -> Result<Output, Status>;

pub fn relu() -> Box<Activation> {
    Box::new(|output, scope| Ok(ops::relu(output, scope)?.into()))
}

/// relu clipped at 6, used by the depthwise separable blocks
pub fn relu6() -> Box<Activation> {
    Box::new(|output, scope| Ok(ops::relu6(output, scope)?.into()))
}

/// no activation, for logits and other linear projections
pub fn identity() -> Box<Activation> {
    Box::new(|output, _scope| Ok(output))
}
