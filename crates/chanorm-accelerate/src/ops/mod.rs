pub mod softmax;

pub use softmax::SoftmaxKernel;
