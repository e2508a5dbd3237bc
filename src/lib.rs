//! A tiny reverse-mode autograd runtime.
//!
//! Forward calls build a graph of [`Tensor`] nodes eagerly; [`backward`]
//! walks it once in reverse topological order and leaves gradients on the
//! parameters. Parameters and other persistent tensors live in a [`State`]:
//! a key store whose keys follow a `/`-joined scope stack, so model code can
//! name its weights by structure (`encoder/block0/proj`) and checkpoints can
//! be saved and loaded per sub-tree.
//!
//! ```
//! use tnn::ops::{bias, cross_entropy, proj, relu};
//! use tnn::{AdamW, Kind, RawTensor, State, TensorOps, free_subgraph};
//!
//! let mut state = State::with_seed(42);
//! let x = RawTensor::input(vec![0.5, -1.0, 2.0, 0.0], &[2, 2]);
//! let target = RawTensor::input(vec![1.0, 0.0, 0.0, 1.0], &[2, 2]);
//!
//! let logits = {
//!     let mut s = state.push("mlp");
//!     let h = s.scoped("l1", |s| {
//!         let h = proj(s, &x, 8);
//!         relu(&bias(s, &h))
//!     });
//!     s.scoped("l2", |s| proj(s, &h, 2))
//! };
//! let loss = cross_entropy(&logits, &target);
//! loss.backward().unwrap();
//! AdamW::default().step(&mut state);
//! state.zero_grad("");
//! free_subgraph(&loss, Kind::is_ephemeral);
//!
//! assert_eq!(state.keys(), [
//!     "adamw/mlp/l1/bias/m1", "adamw/mlp/l1/bias/m2", "adamw/mlp/l1/bias/t",
//!     "adamw/mlp/l1/proj/m1", "adamw/mlp/l1/proj/m2", "adamw/mlp/l1/proj/t",
//!     "adamw/mlp/l2/proj/m1", "adamw/mlp/l2/proj/m2", "adamw/mlp/l2/proj/t",
//!     "mlp/l1/bias", "mlp/l1/proj", "mlp/l2/proj",
//! ]);
//! ```

pub mod autograd;
pub mod error;
pub mod io;
pub mod nn;
pub mod ops;
pub mod state;
pub mod tensor;

pub use autograd::{GradFn, accumulate_grad, backward, free_subgraph};
pub use error::{Result, TnnError};
pub use nn::AdamW;
pub use ops::{BatchNormConfig, ConvConfig};
pub use state::{ScopeGuard, State};
pub use tensor::{Init, Kind, MAX_PARENTS, RawTensor, Tensor, TensorOps, detach};
