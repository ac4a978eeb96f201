//! Copy-on-write branched scope tables.
//!
//! While parsing, several pieces of per-variable state (last modifier,
//! last memory access, last control point) live in tables that fork when
//! control flow forks: an if/else opens an affine scope with up to two
//! branches, each branch sees the parent state and copies it on first
//! write, and closing the scope hands the surviving branch tables to a
//! merge callback that writes the joined state (usually phis) back into
//! the parent.

use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;

/// Maximum number of sibling branches per scope: if/then/else.
pub const AFFINITY: usize = 2;

struct Scope<T> {
    parent_branch: usize,
    branches: Vec<Rc<T>>,
    current: usize,
}

/// A stack of scopes over shared, copy-on-write state of type `T`.
///
/// The default scope at the bottom can never be closed.
pub struct AffineContainer<T: Clone> {
    scopes: Vec<Scope<T>>,
}

impl<T: Clone> AffineContainer<T> {
    /// Create the container with its default scope holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            scopes: vec![Scope {
                parent_branch: 0,
                branches: vec![Rc::new(initial)],
                current: 0,
            }],
        }
    }

    /// Number of open scopes, the default one included.
    pub fn num_scopes(&self) -> usize {
        self.scopes.len()
    }

    /// Number of branches in the current scope.
    pub fn num_branches(&self) -> usize {
        let top = self.scopes.last().unwrap();
        top.current + 1
    }

    /// The current branch's state, read-only.
    pub fn current(&self) -> &T {
        let top = self.scopes.last().unwrap();
        &top.branches[top.current]
    }

    /// The current branch's state for writing; copies from the shared
    /// parent snapshot on first write.
    pub fn current_mut(&mut self) -> &mut T {
        let top = self.scopes.last_mut().unwrap();
        Rc::make_mut(&mut top.branches[top.current])
    }

    /// Open a new scope snapshotting the current state.
    pub fn new_scope(&mut self) {
        let top = self.scopes.last().unwrap();
        let snapshot = Rc::clone(&top.branches[top.current]);
        let parent_branch = top.current;
        self.scopes.push(Scope {
            parent_branch,
            branches: vec![snapshot],
            current: 0,
        });
    }

    /// Start a sibling branch sharing the parent snapshot, and switch to
    /// it.
    pub fn new_branch(&mut self) {
        assert!(self.scopes.len() > 1, "cannot branch the default scope");
        let parent_branch = self.scopes.last().unwrap().parent_branch;
        let snapshot = {
            let parent = &self.scopes[self.scopes.len() - 2];
            Rc::clone(&parent.branches[parent_branch])
        };
        let top = self.scopes.last_mut().unwrap();
        assert!(top.current + 1 < AFFINITY, "branch count exceeds affinity");
        top.branches.push(snapshot);
        top.current += 1;
    }

    /// Pop the scope and hand its surviving branch states to `merge`,
    /// which runs against the now-current (parent) scope.
    pub fn close_scope<F>(&mut self, merge: F)
    where
        F: FnOnce(&mut Self, Vec<T>),
    {
        assert!(self.scopes.len() > 1, "cannot close the default scope");
        let top = self.scopes.pop().unwrap();
        let entries: Vec<T> = top
            .branches
            .into_iter()
            .map(|rc| Rc::try_unwrap(rc).unwrap_or_else(|rc| (*rc).clone()))
            .collect();
        merge(self, entries);
    }
}

/// The map-shaped affine table: per-key state with scope semantics.
pub struct AffineRecordTable<K: Eq + Hash + Clone, V: Clone> {
    inner: AffineContainer<HashMap<K, V>>,
}

impl<K, V> AffineRecordTable<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty table in its default scope.
    pub fn new() -> Self {
        Self {
            inner: AffineContainer::new(HashMap::new()),
        }
    }

    /// Look up `key` in the current branch.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.current().get(key)
    }

    /// Whether `key` is bound in the current branch.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.current().contains_key(key)
    }

    /// Bind `key` in the current branch, copying the table on first write.
    pub fn insert(&mut self, key: K, value: V) {
        self.inner.current_mut().insert(key, value);
    }

    /// Iterate the current branch's bindings.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.current().iter()
    }

    /// Number of open scopes.
    pub fn num_scopes(&self) -> usize {
        self.inner.num_scopes()
    }

    /// Number of branches in the current scope.
    pub fn num_branches(&self) -> usize {
        self.inner.num_branches()
    }

    /// Open a new scope.
    pub fn new_scope(&mut self) {
        self.inner.new_scope();
    }

    /// Start the sibling branch.
    pub fn new_branch(&mut self) {
        self.inner.new_branch();
    }

    /// Close the scope; `merge` receives the branch tables and writes the
    /// joined state through `self`.
    pub fn close_scope<F>(&mut self, merge: F)
    where
        F: FnOnce(&mut Self, Vec<HashMap<K, V>>),
    {
        // Reborrow through the container so the callback can keep using
        // the table API.
        let mut tables = Vec::new();
        self.inner.close_scope(|_, entries| tables = entries);
        merge(self, tables);
    }
}
