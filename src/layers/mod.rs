//! Decoder Layers
//!
//! Hand-written layers with explicit forward and backward passes. Every
//! layer follows the same shape:
//!
//! ```rust,ignore
//! impl Layer {
//!     pub fn forward(&self, x: &Tensor, ..) -> (Tensor, Cache) { }
//!     pub fn backward(&self, grad: &Tensor, cache: &Cache, ..) -> .. { }
//! }
//! ```
//!
//! Leaf layers (linear, layer norm) return a gradients struct whose
//! `record` method moves the parameter gradients into a named
//! [`Gradients`](crate::params::Gradients) sink. Composite layers take the
//! sink directly and return the gradient for their input.

pub mod activation;
pub mod attention;
pub mod block;
pub mod dropout;
pub mod layer_norm;
pub mod linear;
pub mod mlp;

pub use activation::Activation;
pub use attention::{AttentionCache, MultiHeadAttention};
pub use block::{BlockCache, BlockConfig, TransformerBlock};
pub use dropout::{Dropout, DropoutCache};
pub use layer_norm::{LayerNorm, LayerNormCache, LayerNormGradients};
pub use linear::{normal_init, Linear, LinearCache, LinearGradients};
pub use mlp::{FeedForward, FeedForwardCache};
