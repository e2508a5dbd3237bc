//! Operators.
//!
//! Every forward function checks its shape preconditions, computes its
//! output eagerly and returns a Computed node whose `GradFn` knows how to push
//! the output gradient back into the parents. Operators with weights take the
//! `State` and look them up relative to its active scope.

pub mod binary;
pub mod conv;
pub mod loss;
pub mod matmul;
pub mod movement;
pub mod norm;
pub mod reduce;
pub mod unary;

pub use binary::{AddGradFn, BiasGradFn, add, bias};
pub use conv::{ConvConfig, ConvGradFn, conv};
pub use loss::{CrossEntropyGradFn, cross_entropy};
pub use matmul::{ProjGradFn, proj};
pub use movement::{ReshapeGradFn, reshape};
pub use norm::{BatchNormConfig, BatchNormGradFn, bn};
pub use reduce::{MeanGradFn, mean};
pub use unary::{ReluGradFn, relu};
