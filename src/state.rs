//! Scoped key store for persistent tensors.
//!
//! Every Parameter and Buffer lives here under a `/`-joined absolute key.
//! Operators look their weights up relative to the active scope, so the
//! same forward code called under `enc/block0` and `enc/block1` gets two
//! independent sets of weights, and calling it twice under the same scope
//! reuses them.

use crate::tensor::{Init, Kind, RawTensor, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use tracing::warn;

// ===== KEY HELPERS =====

/// Whether `key` is `scope` itself or lies below it.
///
/// The empty scope contains every key. `a/b` contains `a/b` and `a/b/c`
/// but not `a/bc`.
pub fn key_in_scope(key: &str, scope: &str) -> bool {
    relative_key(key, scope).is_some()
}

/// `key` with `scope` and its trailing separator stripped, or `None` if the
/// key is outside the scope.
pub fn relative_key<'a>(key: &'a str, scope: &str) -> Option<&'a str> {
    if scope.is_empty() {
        return Some(key);
    }
    let rest = key.strip_prefix(scope)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

/// Join two key fragments with `/`, where either side may be empty.
pub fn join_keys(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{a}/{b}"),
    }
}

// ===== STATE =====

/// The store plus the active scope and the RNG used by initializers.
pub struct State {
    entries: BTreeMap<String, Tensor>,
    scope: String,
    rng: StdRng,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Empty store seeded from the OS.
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Empty store whose initializers are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        State {
            entries: BTreeMap::new(),
            scope: String::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Active scope path, `""` at the root.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enter `segment` below the active scope until the guard drops.
    ///
    /// ```
    /// use tnn::State;
    ///
    /// let mut state = State::with_seed(0);
    /// {
    ///     let mut enc = state.push("enc");
    ///     let block = enc.push(format_args!("block{}", 3));
    ///     assert_eq!(block.scope(), "enc/block3");
    /// }
    /// assert_eq!(state.scope(), "");
    /// ```
    pub fn push(&mut self, segment: impl Display) -> ScopeGuard<'_> {
        let prev_len = self.scope.len();
        let segment = segment.to_string();
        assert!(!segment.is_empty(), "scope segment must not be empty");
        if !self.scope.is_empty() {
            self.scope.push('/');
        }
        self.scope.push_str(&segment);
        ScopeGuard {
            state: self,
            prev_len,
        }
    }

    /// Run `f` with `segment` pushed.
    pub fn scoped<R>(&mut self, segment: impl Display, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self.push(segment);
        f(&mut guard)
    }

    /// Absolute key for `key` relative to the active scope.
    pub fn absolute_key(&self, key: &str) -> String {
        join_keys(&self.scope, key)
    }

    /// Look up `key` under the active scope, creating it on first use.
    ///
    /// An existing entry is returned as is (shape, kind and `init` are
    /// ignored), except that an Unclaimed checkpoint tensor takes on `kind`.
    /// The flag reports whether the entry was created.
    ///
    /// # Panics
    /// If `kind` is not Parameter or Buffer.
    pub fn get_or_create(
        &mut self,
        key: &str,
        shape: &[usize],
        kind: Kind,
        init: Init,
    ) -> (Tensor, bool) {
        assert!(
            matches!(kind, Kind::Parameter | Kind::Buffer),
            "store entries must be Parameter or Buffer, got {kind:?}"
        );
        let abs = self.absolute_key(key);

        if let Some(existing) = self.entries.get(&abs) {
            let mut t = existing.borrow_mut();
            if t.shape != shape {
                warn!(
                    key = %abs,
                    stored = ?t.shape,
                    requested = ?shape,
                    "store entry exists with a different shape"
                );
            }
            if t.kind == Kind::Unclaimed {
                t.kind = kind;
            }
            drop(t);
            return (Rc::clone(existing), false);
        }

        let tensor = RawTensor::allocate(shape, kind);
        init.apply(&mut tensor.borrow_mut().data, &mut self.rng);
        self.entries.insert(abs, Rc::clone(&tensor));
        (tensor, true)
    }

    /// Entry at `key` relative to the active scope.
    pub fn get(&self, key: &str) -> Option<Tensor> {
        self.entries.get(&self.absolute_key(key)).cloned()
    }

    /// Insert or replace the entry at `key`, returning the previous one.
    pub fn set(&mut self, key: &str, tensor: Tensor) -> Option<Tensor> {
        let abs = self.absolute_key(key);
        self.entries.insert(abs, tensor)
    }

    /// Entries under `prefix`, keyed relative to the active scope, in key order.
    pub fn enumerate(&self, prefix: &str) -> Vec<(String, Tensor)> {
        self.in_scope(prefix)
            .filter_map(|(k, t)| {
                relative_key(k, &self.scope).map(|rel| (rel.to_string(), Rc::clone(t)))
            })
            .collect()
    }

    /// Relative keys of every entry under the active scope.
    pub fn keys(&self) -> Vec<String> {
        self.enumerate("")
            .into_iter()
            .map(|(key, _)| key)
            .collect()
    }

    /// Remove and release every entry under `prefix`. Returns how many went.
    pub fn remove(&mut self, prefix: &str) -> usize {
        let doomed: Vec<String> = self.in_scope(prefix).map(|(k, _)| k.clone()).collect();
        for key in &doomed {
            if let Some(t) = self.entries.remove(key) {
                t.borrow_mut().release();
            }
        }
        doomed.len()
    }

    /// Zero, in place, every existing gradient under `prefix`.
    pub fn zero_grad(&mut self, prefix: &str) {
        for (_, t) in self.in_scope(prefix) {
            if let Some(grad) = t.borrow_mut().grad.as_mut() {
                grad.fill(0.0);
            }
        }
    }

    /// Absolute entries under `prefix` (relative to the active scope).
    fn in_scope<'a>(&'a self, prefix: &str) -> impl Iterator<Item = (&'a String, &'a Tensor)> {
        let abs = self.absolute_key(prefix);
        let start = abs.clone();
        // keys sharing a string prefix are contiguous in the map
        self.entries
            .range(abs.clone()..)
            .take_while(move |(k, _)| k.starts_with(start.as_str()))
            .filter(move |(k, _)| key_in_scope(k, &abs))
    }

    pub(crate) fn insert_absolute(&mut self, key: String, tensor: Tensor) -> Option<Tensor> {
        self.entries.insert(key, tensor)
    }
}

// ===== SCOPE GUARD =====

/// Keeps a scope segment pushed; restores the previous scope on drop.
///
/// Derefs to the [`State`], so forward calls take the guard directly.
pub struct ScopeGuard<'a> {
    state: &'a mut State,
    prev_len: usize,
}

impl Deref for ScopeGuard<'_> {
    type Target = State;

    fn deref(&self) -> &State {
        &*self.state
    }
}

impl DerefMut for ScopeGuard<'_> {
    fn deref_mut(&mut self) -> &mut State {
        &mut *self.state
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.state.scope.truncate(self.prev_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorOps;

    #[test]
    fn key_helpers() {
        assert!(key_in_scope("a/b", "a/b"));
        assert!(key_in_scope("a/b/c", "a/b"));
        assert!(!key_in_scope("a/bc", "a/b"));
        assert!(key_in_scope("anything", ""));
        assert_eq!(relative_key("a/b/c", "a"), Some("b/c"));
        assert_eq!(relative_key("a", "a"), Some(""));
        assert_eq!(relative_key("b/c", "a"), None);
        assert_eq!(join_keys("", "w"), "w");
        assert_eq!(join_keys("a", ""), "a");
        assert_eq!(join_keys("a", "w"), "a/w");
    }

    #[test]
    fn guards_nest_and_restore() {
        let mut state = State::with_seed(0);
        {
            let mut outer = state.push("model");
            {
                let inner = outer.push(format_args!("layer{}", 2));
                assert_eq!(inner.scope(), "model/layer2");
            }
            assert_eq!(outer.scope(), "model");
        }
        assert_eq!(state.scope(), "");
    }

    #[test]
    fn scoped_restores_after_closure() {
        let mut state = State::with_seed(0);
        let seen = state.scoped("a", |s| s.scoped("b", |s| s.scope().to_string()));
        assert_eq!(seen, "a/b");
        assert_eq!(state.scope(), "");
    }

    #[test]
    #[should_panic(expected = "must be Parameter or Buffer")]
    fn get_or_create_rejects_ephemeral_kind() {
        let mut state = State::with_seed(0);
        state.get_or_create("x", &[1], Kind::Computed, Init::Zeros);
    }

    #[test]
    fn get_or_create_applies_init_once() {
        let mut state = State::with_seed(0);
        let (a, created) = state.get_or_create("v", &[2], Kind::Buffer, Init::Ones);
        assert!(created);
        a.borrow_mut().data[0] = 5.0;
        let (b, created) = state.get_or_create("v", &[2], Kind::Buffer, Init::Zeros);
        assert!(!created);
        assert_eq!(b.values(), vec![5.0, 1.0]);
    }

    #[test]
    fn get_or_create_keeps_kind_of_claimed_entry() {
        let mut state = State::with_seed(0);
        let (w, _) = state.get_or_create("w", &[2], Kind::Parameter, Init::Ones);
        w.borrow_mut().grad = Some(vec![1.0, 1.0]);

        let (again, created) = state.get_or_create("w", &[2], Kind::Buffer, Init::Zeros);
        assert!(!created);
        assert_eq!(again.kind(), Kind::Parameter);
        assert_eq!(crate::AdamW::default().step(&mut state), 1);
    }

    #[test]
    fn get_or_create_claims_unclaimed_entry() {
        let mut state = State::with_seed(0);
        state.set("bn/var", RawTensor::new(vec![2.0], &[1], Kind::Unclaimed));
        let (v, created) = state.get_or_create("bn/var", &[1], Kind::Buffer, Init::Ones);
        assert!(!created);
        assert_eq!(v.kind(), Kind::Buffer);
        assert_eq!(v.item(), 2.0);
    }

    #[test]
    fn enumerate_is_relative_to_active_scope() {
        let mut state = State::with_seed(0);
        state.set("net/a/w", RawTensor::parameter(vec![1.0], &[1]));
        state.set("net/b/w", RawTensor::parameter(vec![2.0], &[1]));
        state.set("other/w", RawTensor::parameter(vec![3.0], &[1]));

        let net = state.push("net");
        let keys: Vec<String> = net.enumerate("").into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a/w".to_string(), "b/w".to_string()]);
        assert_eq!(net.enumerate("b").len(), 1);
        assert!(net.get("a/w").is_some());
        assert!(net.get("other/w").is_none());
    }

    #[test]
    fn remove_releases_matched_entries() {
        let mut state = State::with_seed(0);
        let (w, _) = state.get_or_create("a/b/w", &[2], Kind::Parameter, Init::Ones);
        state.get_or_create("a/bc/w", &[2], Kind::Parameter, Init::Ones);
        assert_eq!(state.remove("a/b"), 1);
        assert!(w.borrow().is_released());
        assert_eq!(state.keys(), vec!["a/bc/w".to_string()]);
    }

    #[test]
    fn zero_grad_never_allocates() {
        let mut state = State::with_seed(0);
        let (w, _) = state.get_or_create("l1/w", &[2], Kind::Parameter, Init::Ones);
        let (v, _) = state.get_or_create("l2/w", &[2], Kind::Parameter, Init::Ones);
        w.borrow_mut().grad = Some(vec![3.0, 4.0]);
        v.borrow_mut().grad = Some(vec![3.0, 4.0]);

        state.zero_grad("l1");
        assert_eq!(w.grad(), Some(vec![0.0, 0.0]));
        assert_eq!(v.grad(), Some(vec![3.0, 4.0]));

        let (u, _) = state.get_or_create("l3/w", &[2], Kind::Parameter, Init::Ones);
        state.zero_grad("");
        assert!(u.grad().is_none());
        assert_eq!(v.grad(), Some(vec![0.0, 0.0]));
    }
}
