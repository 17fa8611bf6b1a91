pub mod softmax;

use crate::ops::softmax::SOFTMAX_PROGRAM;

/// WGSL source of a program shipped with the crate.
pub fn builtin_program(name: &str) -> Option<&'static str> {
    match name {
        SOFTMAX_PROGRAM => Some(softmax::SOFTMAX_BUFFER_SHADER),
        _ => None,
    }
}
