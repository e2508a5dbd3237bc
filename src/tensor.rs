use crate::autograd::{self, GradFn};
use crate::error::{Result, TnnError};
use crate::state::State;
use rand::Rng;
use rand_distr::StandardNormal;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Type alias for a reference-counted, interior-mutable tensor.
///
/// Graph edges and store entries both hold `Tensor` handles, so a parameter
/// can be the parent of every step's graph while also living in the `State`.
/// Single-threaded only.
pub type Tensor = Rc<RefCell<RawTensor>>;

/// Largest number of parents any operator records.
pub const MAX_PARENTS: usize = 4;

pub type Parents = SmallVec<[Tensor; MAX_PARENTS]>;

// ===== NODE KIND =====

/// What a node is for, which decides whether it gets a gradient and
/// who is allowed to reclaim it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Externally supplied data. Never receives a gradient.
    Input,
    /// Produced by an operator during a forward pass.
    Computed,
    /// Learnable state owned by the `State` store.
    Parameter,
    /// Persistent non-learnable state (running statistics, optimizer moments).
    Buffer,
    /// Read from a checkpoint and not yet claimed by any operator.
    Unclaimed,
}

impl Kind {
    /// Computed and Parameter nodes get a gradient buffer during backward.
    pub fn receives_grad(self) -> bool {
        matches!(self, Kind::Computed | Kind::Parameter)
    }

    /// Kinds that live in the store rather than in a single step's graph.
    pub fn is_persistent(self) -> bool {
        matches!(self, Kind::Parameter | Kind::Buffer | Kind::Unclaimed)
    }

    pub fn is_ephemeral(self) -> bool {
        matches!(self, Kind::Input | Kind::Computed)
    }
}

// ===== RAW TENSOR STRUCTURE =====

/// The graph vertex: value buffer, lazily allocated gradient, shape, and
/// (for operator outputs) parents plus the backward procedure.
///
/// The `grad_fn` owns whatever the forward kernel saved for backward, so
/// dropping it is how that context gets released.
pub struct RawTensor {
    pub data: Vec<f32>,         // flat data vec, len = prod shape dims
    pub grad: Option<Vec<f32>>, // None until the backward engine allocates it
    pub shape: Vec<usize>,      // empty for scalars
    pub kind: Kind,
    pub(crate) parents: Parents,
    pub(crate) grad_fn: Option<Box<dyn GradFn>>,
}

impl fmt::Debug for RawTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("kind", &self.kind)
            .field("has_grad", &self.grad.is_some())
            .field("num_parents", &self.parents.len())
            .field("has_grad_fn", &self.grad_fn.is_some())
            .finish()
    }
}

/// Product of the dimensions, or `None` on overflow.
pub fn numel_of(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

// ===== TENSOR CONSTRUCTORS =====
impl RawTensor {
    /// Allocate a zero-filled node with no gradient and no parents.
    pub fn try_allocate(shape: &[usize], kind: Kind) -> Result<Tensor> {
        let elements = numel_of(shape).ok_or(TnnError::Allocation {
            elements: usize::MAX,
        })?;
        let mut data = Vec::new();
        data.try_reserve_exact(elements)
            .map_err(|_| TnnError::Allocation { elements })?;
        data.resize(elements, 0.0);
        Ok(Self::wrap(data, shape, kind))
    }

    /// Like [`RawTensor::try_allocate`], but an allocation failure is fatal.
    pub fn allocate(shape: &[usize], kind: Kind) -> Tensor {
        match Self::try_allocate(shape, kind) {
            Ok(t) => t,
            Err(e) => panic!("{e}"),
        }
    }

    /// Create a node from data and shape
    ///
    /// # Panics
    /// Panics if data.len() != shape.product()
    pub fn new(data: Vec<f32>, shape: &[usize], kind: Kind) -> Tensor {
        assert_eq!(
            Some(data.len()),
            numel_of(shape),
            "Data length must match shape {shape:?}"
        );
        Self::wrap(data, shape, kind)
    }

    /// Externally supplied data.
    pub fn input(data: Vec<f32>, shape: &[usize]) -> Tensor {
        Self::new(data, shape, Kind::Input)
    }

    /// A free-standing learnable leaf that is not registered in any store.
    pub fn parameter(data: Vec<f32>, shape: &[usize]) -> Tensor {
        Self::new(data, shape, Kind::Parameter)
    }

    /// Zero-filled input.
    pub fn zeros(shape: &[usize]) -> Tensor {
        Self::allocate(shape, Kind::Input)
    }

    /// Wrap an operator result as a Computed node.
    ///
    /// This is the only way to attach parents. The parent count is a
    /// const generic checked against [`MAX_PARENTS`] at compile time.
    pub fn from_op<const N: usize>(
        data: Vec<f32>,
        shape: &[usize],
        parents: [Tensor; N],
        grad_fn: impl GradFn + 'static,
    ) -> Tensor {
        const {
            assert!(N >= 1 && N <= MAX_PARENTS, "operator arity out of range");
        }
        let out = Self::new(data, shape, Kind::Computed);
        {
            let mut o = out.borrow_mut();
            o.parents = parents.into_iter().collect();
            o.grad_fn = Some(Box::new(grad_fn));
        }
        out
    }

    fn wrap(data: Vec<f32>, shape: &[usize], kind: Kind) -> Tensor {
        Rc::new(RefCell::new(RawTensor {
            data,
            grad: None,
            shape: shape.to_vec(),
            kind,
            parents: Parents::new(),
            grad_fn: None,
        }))
    }
}

// ===== ACCESSORS =====
impl RawTensor {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// First value; meant for scalar losses.
    pub fn item(&self) -> f32 {
        self.data.first().copied().unwrap_or(f32::NAN)
    }

    pub fn parents(&self) -> &[Tensor] {
        &self.parents
    }

    pub fn has_grad_fn(&self) -> bool {
        self.grad_fn.is_some()
    }

    /// The gradient buffer. Backward procedures call this on their own output,
    /// which the engine guarantees is allocated.
    pub fn grad_slice(&self) -> &[f32] {
        self.grad.as_deref().unwrap_or(&[])
    }

    /// Allocate a zeroed gradient buffer if there is none yet.
    pub fn ensure_grad(&mut self) {
        if self.grad.is_none() {
            self.grad = Some(vec![0.0; self.data.len()]);
        }
    }

    /// Drop buffers, parents and any saved context. Shape and kind survive
    /// so the node can still be inspected.
    pub fn release(&mut self) {
        self.data = Vec::new();
        self.grad = None;
        self.grad_fn = None;
        self.parents.clear();
    }

    /// True once [`RawTensor::release`] has reclaimed a non-empty node.
    pub fn is_released(&self) -> bool {
        self.data.is_empty() && self.numel() > 0
    }

    pub(crate) fn take_grad_fn(&mut self) -> Option<Box<dyn GradFn>> {
        self.grad_fn.take()
    }
}

/// Copy of `t`'s values as a fresh Input with no history.
pub fn detach(t: &Tensor) -> Tensor {
    let src = t.borrow();
    RawTensor::new(src.data.clone(), &src.shape, Kind::Input)
}

// ===== DISPLAY =====

impl fmt::Display for RawTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_released() {
            return write!(f, "<released {:?}>", self.shape);
        }
        match self.shape.as_slice() {
            [] => write!(f, "{:.4}", self.item()),
            [_] => write_row(f, &self.data),
            [rows, cols] => {
                writeln!(f, "[")?;
                for r in 0..*rows {
                    write!(f, "  ")?;
                    write_row(f, &self.data[r * cols..(r + 1) * cols])?;
                    writeln!(f, "{}", if r + 1 < *rows { "," } else { "" })?;
                }
                write!(f, "]")
            }
            shape => write!(f, "Tensor(shape={shape:?}, kind={:?})", self.kind),
        }
    }
}

fn write_row(f: &mut fmt::Formatter<'_>, row: &[f32]) -> fmt::Result {
    write!(f, "[")?;
    for (i, v) in row.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{v:.4}")?;
    }
    write!(f, "]")
}

// ===== INITIALIZERS =====

/// How a newly created store entry is filled. Runs only on first creation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    Fill(f32),
    /// Uniform in [-limit, limit] with limit = sqrt(6 / (fan_in + fan_out)).
    XavierUniform { fan_in: usize, fan_out: usize },
    /// N(0, std²).
    Normal { std: f32 },
}

impl Init {
    pub fn apply<R: Rng>(&self, data: &mut [f32], rng: &mut R) {
        match *self {
            Init::Zeros => data.fill(0.0),
            Init::Ones => data.fill(1.0),
            Init::Fill(v) => data.fill(v),
            Init::XavierUniform { fan_in, fan_out } => {
                let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
                if limit.is_finite() && limit > 0.0 {
                    for v in data.iter_mut() {
                        *v = rng.random_range(-limit..limit);
                    }
                } else {
                    data.fill(0.0);
                }
            }
            Init::Normal { std } => {
                for v in data.iter_mut() {
                    let z: f32 = rng.sample(StandardNormal);
                    *v = z * std;
                }
            }
        }
    }
}

// ===== NUMERICAL GRADIENT CHECKING =====

impl RawTensor {
    /// Check gradients numerically using finite differences
    ///
    /// Analytical gradient: what `backward()` accumulates into `tensor`.
    /// Numerical gradient: (f(x+ε) - f(x-ε)) / (2ε), perturbing `tensor`
    /// in place so store-owned parameters keep their identity.
    ///
    /// The error per element is |a - n| / (1 + |n|).
    ///
    /// # Returns
    /// (max_error, mean_error, passed)
    pub fn check_gradients<F>(
        state: &mut State,
        tensor: &Tensor,
        mut loss_fn: F,
        epsilon: f32,
        tolerance: f32,
    ) -> Result<(f32, f32, bool)>
    where
        F: FnMut(&mut State, &Tensor) -> Tensor,
    {
        assert!(
            tensor.borrow().kind.receives_grad(),
            "gradient check needs a Parameter or Computed tensor"
        );

        tensor.borrow_mut().grad = None;
        let loss = loss_fn(state, tensor);
        autograd::backward(&loss)?;
        drop(loss);

        let n = tensor.borrow().data.len();
        let analytical = tensor
            .borrow_mut()
            .grad
            .take()
            .unwrap_or_else(|| vec![0.0; n]);

        let mut max_error: f32 = 0.0;
        let mut total_error: f32 = 0.0;

        for (i, &a) in analytical.iter().enumerate() {
            let original = tensor.borrow().data[i];

            tensor.borrow_mut().data[i] = original + epsilon;
            let plus = loss_fn(state, tensor).borrow().item();
            tensor.borrow_mut().data[i] = original - epsilon;
            let minus = loss_fn(state, tensor).borrow().item();
            tensor.borrow_mut().data[i] = original;

            let numerical = (plus - minus) / (2.0 * epsilon);
            let error = (a - numerical).abs() / (1.0 + numerical.abs());
            if error > tolerance {
                tracing::warn!(
                    index = i,
                    analytical = a,
                    numerical,
                    error,
                    "gradient mismatch"
                );
            }
            max_error = max_error.max(error);
            total_error += error;
        }

        let mean_error = if analytical.is_empty() {
            0.0
        } else {
            total_error / analytical.len() as f32
        };
        Ok((max_error, mean_error, max_error < tolerance))
    }

    /// Gradient check with epsilon=1e-2 and tolerance=1e-2.
    pub fn check_gradients_simple<F>(state: &mut State, tensor: &Tensor, loss_fn: F) -> bool
    where
        F: FnMut(&mut State, &Tensor) -> Tensor,
    {
        match Self::check_gradients(state, tensor, loss_fn, 1e-2, 1e-2) {
            Ok((max_err, mean_err, passed)) => {
                if !passed {
                    tracing::warn!(max_err, mean_err, "gradient check failed");
                }
                passed
            }
            Err(e) => {
                tracing::warn!(error = %e, "gradient check could not run");
                false
            }
        }
    }
}

// ===== TRAIT-BASED API =====

/// Method-call sugar for the parameter-free operators and graph entry points.
///
/// Operators that create parameters (`proj`, `bias`, `conv`, `bn`) need the
/// `State` and stay free functions in [`crate::ops`].
pub trait TensorOps {
    fn shape(&self) -> Vec<usize>;
    fn numel(&self) -> usize;
    fn kind(&self) -> Kind;
    fn item(&self) -> f32;
    fn values(&self) -> Vec<f32>;
    fn grad(&self) -> Option<Vec<f32>>;

    fn backward(&self) -> Result<()>;
    fn detach(&self) -> Tensor;

    fn relu(&self) -> Tensor;
    fn add(&self, other: &Tensor) -> Tensor;
    fn reshape(&self, dims: &[usize]) -> Tensor;
    fn mean(&self, i_dim: usize, num_dims: usize) -> Tensor;
}

impl TensorOps for Tensor {
    fn shape(&self) -> Vec<usize> {
        self.borrow().shape.clone()
    }
    fn numel(&self) -> usize {
        self.borrow().numel()
    }
    fn kind(&self) -> Kind {
        self.borrow().kind
    }
    fn item(&self) -> f32 {
        self.borrow().item()
    }
    fn values(&self) -> Vec<f32> {
        self.borrow().data.clone()
    }
    fn grad(&self) -> Option<Vec<f32>> {
        self.borrow().grad.clone()
    }

    fn backward(&self) -> Result<()> {
        autograd::backward(self)
    }
    fn detach(&self) -> Tensor {
        detach(self)
    }

    fn relu(&self) -> Tensor {
        crate::ops::relu(self)
    }
    fn add(&self, other: &Tensor) -> Tensor {
        crate::ops::add(self, other)
    }
    fn reshape(&self, dims: &[usize]) -> Tensor {
        crate::ops::reshape(self, dims)
    }
    fn mean(&self, i_dim: usize, num_dims: usize) -> Tensor {
        crate::ops::mean(self, i_dim, num_dims)
    }
}
