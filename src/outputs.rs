use std::collections::HashMap;

use tensorflow::Output;

/// Named graph outputs of a model. The default output is what a caller gets
/// when it does not ask for anything by name (the logits, for both models).
#[derive(Clone)]
pub struct Outputs {
    pub default: Option<Output>,
    pub rest: HashMap<&'static str, Output>,
}

impl Outputs {
    pub fn get(&self, name: &str) -> Option<&Output> {
        self.rest.get(name)
    }

    pub fn default_output(&self) -> Option<&Output> {
        self.default.as_ref()
    }

    /// Output names in sorted order.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.rest.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Build an [`Outputs`] bundle.
///
/// ```ignore
/// out! { default "logits" => logits, "loss" => loss }
/// ```
#[macro_export]
macro_rules! out {
    { default $name:literal => $e:expr, $($x:tt)*} => {{
        let default: ::tensorflow::Output = $e;
        $crate::outputs::Outputs {
            default: Some(default.clone()),
            rest: ::maplit::hashmap!{
                $name => default,
                $($x)*
            },
        }
    }};
    ($($x:tt)*) => {
        $crate::outputs::Outputs {
            default: None,
            rest: ::maplit::hashmap!{$($x)*},
        }
    };
}
