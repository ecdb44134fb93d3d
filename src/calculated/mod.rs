//! # Calculated-Property Graph
//!
//! Memoized derived properties and the dependency edges between them.
//!
//! While property P is being evaluated on a thread, every property Q read
//! on that thread records the edge Q→P ("P depends on Q"). When Q changes,
//! `notify(Q)` fires Q's handler, drops its memo and walks its targets.
//! One propagation pass visits each node at most once, so cycles terminate.
//!
//! A calculated property that re-enters its own evaluation on the same
//! thread (a cycle) sees its previous memo, or `Null`, instead of recursing.
//!
//! Memos live in a scope. Readers that see only committed state share the
//! committed memo. A session with uncommitted writes evaluates in its own
//! scope: its writes invalidate dependents there without firing handlers,
//! and the scope is discarded when the session completes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::trace;

use crate::model::{Identity, PropertyKey, Value};
use crate::tx::TxId;
use crate::Result;

/// Fired once per node per propagation pass.
pub type ChangeHandler = Arc<dyn Fn(&PropertyKey) + Send + Sync>;

struct PropertyNode {
    handler: ChangeHandler,
    targets: Mutex<HashSet<PropertyKey>>,
    memo: Mutex<Option<Value>>,
    /// Memos of sessions with uncommitted writes.
    scoped: Mutex<HashMap<TxId, Value>>,
}

impl PropertyNode {
    fn memo(&self, scope: Option<TxId>) -> Option<Value> {
        match scope {
            None => self.memo.lock().clone(),
            Some(tx) => self.scoped.lock().get(&tx).cloned(),
        }
    }

    fn store(&self, scope: Option<TxId>, value: Value) {
        match scope {
            None => *self.memo.lock() = Some(value),
            Some(tx) => {
                self.scoped.lock().insert(tx, value);
            }
        }
    }
}

pub struct CalculatedGraph {
    nodes: Mutex<HashMap<PropertyKey, Arc<PropertyNode>>>,
    evaluating: Mutex<HashMap<ThreadId, SmallVec<[PropertyKey; 4]>>>,
    handler: ChangeHandler,
}

impl std::fmt::Debug for CalculatedGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculatedGraph").field("nodes", &self.len()).finish()
    }
}

/// Pops the evaluation frame even if `compute` panics.
struct Frame<'g> {
    graph: &'g CalculatedGraph,
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        let mut evaluating = self.graph.evaluating.lock();
        let id = thread::current().id();
        if let Some(stack) = evaluating.get_mut(&id) {
            stack.pop();
            if stack.is_empty() {
                evaluating.remove(&id);
            }
        }
    }
}

impl CalculatedGraph {
    /// `handler` becomes every node's change handler.
    pub fn new(handler: ChangeHandler) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            evaluating: Mutex::new(HashMap::new()),
            handler,
        }
    }

    fn node(&self, key: &PropertyKey) -> Arc<PropertyNode> {
        self.nodes
            .lock()
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(PropertyNode {
                    handler: self.handler.clone(),
                    targets: Mutex::new(HashSet::new()),
                    memo: Mutex::new(None),
                    scoped: Mutex::new(HashMap::new()),
                })
            })
            .clone()
    }

    /// The property currently being evaluated on this thread.
    pub fn current(&self) -> Option<PropertyKey> {
        self.evaluating
            .lock()
            .get(&thread::current().id())
            .and_then(|stack| stack.last().cloned())
    }

    fn is_evaluating(&self, key: &PropertyKey) -> bool {
        self.evaluating
            .lock()
            .get(&thread::current().id())
            .is_some_and(|stack| stack.contains(key))
    }

    /// Note that `key` was read. Records key→P if P is being evaluated on
    /// this thread.
    pub fn record_read(&self, key: &PropertyKey) {
        if let Some(target) = self.current() {
            if &target != key {
                self.add_dependency(key, &target);
            }
        }
    }

    /// `target` depends on `source`.
    pub fn add_dependency(&self, source: &PropertyKey, target: &PropertyKey) {
        let node = self.node(source);
        if node.targets.lock().insert(target.clone()) {
            trace!(%source, %target, "calculated dependency");
        }
    }

    /// Memoized value of `key` in `scope`, computing it with `compute` if
    /// needed. `None` is the committed scope.
    pub fn evaluate(
        &self,
        key: &PropertyKey,
        scope: Option<TxId>,
        compute: impl FnOnce() -> Result<Value>,
    ) -> Result<Value> {
        self.record_read(key);
        let node = self.node(key);
        if let Some(value) = node.memo(scope) {
            return Ok(value);
        }
        if self.is_evaluating(key) {
            trace!(%key, "calculated cycle, using last value");
            return Ok(Value::Null);
        }

        self.evaluating
            .lock()
            .entry(thread::current().id())
            .or_default()
            .push(key.clone());
        let frame = Frame { graph: self };
        let value = compute()?;
        drop(frame);

        node.store(scope, value.clone());
        Ok(value)
    }

    /// Nodes reachable from `key`, each once, `key` first.
    fn reachable(&self, key: &PropertyKey) -> Vec<(PropertyKey, Arc<PropertyNode>)> {
        let Some(root) = self.nodes.lock().get(key).cloned() else {
            return Vec::new();
        };
        let mut visited: HashSet<PropertyKey> = HashSet::new();
        let mut reached = Vec::new();
        let mut pending: Vec<(PropertyKey, Arc<PropertyNode>)> = vec![(key.clone(), root)];
        while let Some((key, node)) = pending.pop() {
            if !visited.insert(key.clone()) {
                continue;
            }
            let targets: Vec<PropertyKey> = node.targets.lock().iter().cloned().collect();
            reached.push((key, node));
            let nodes = self.nodes.lock();
            for target in targets {
                if visited.contains(&target) {
                    continue;
                }
                if let Some(next) = nodes.get(&target) {
                    pending.push((target, next.clone()));
                }
            }
        }
        reached
    }

    /// Drop the memos `scope` holds for `key` and its dependents. No
    /// handler fires.
    pub fn invalidate_scoped(&self, scope: TxId, key: &PropertyKey) {
        let reached = self.reachable(key);
        for (_, node) in &reached {
            node.scoped.lock().remove(&scope);
        }
        if !reached.is_empty() {
            trace!(%key, %scope, dropped = reached.len(), "calculated scoped invalidation");
        }
    }

    /// Forget every memo computed in `scope`.
    pub fn discard_scope(&self, scope: TxId) {
        let nodes: Vec<Arc<PropertyNode>> = self.nodes.lock().values().cloned().collect();
        for node in nodes {
            node.scoped.lock().remove(&scope);
        }
    }

    /// Propagate a committed change of `key`. Every memo of the reached
    /// nodes is dropped, in all scopes. Returns false if `key` has no node,
    /// in which case nothing fired.
    pub fn notify(&self, key: &PropertyKey) -> bool {
        let reached = self.reachable(key);
        if reached.is_empty() {
            return false;
        }
        for (key, node) in &reached {
            node.memo.lock().take();
            node.scoped.lock().clear();
            (node.handler)(key);
        }
        trace!(%key, fired = reached.len(), "calculated notify");
        true
    }

    /// Drop every node owned by `owner` and every edge into them.
    pub fn dispose_element(&self, owner: &Identity) {
        let mut nodes = self.nodes.lock();
        nodes.retain(|key, _| &key.owner != owner);
        for node in nodes.values() {
            node.targets.lock().retain(|target| &target.owner != owner);
        }
    }

    /// Drop every node owned by an element of `domain`.
    pub fn dispose_domain(&self, domain: &str) {
        let mut nodes = self.nodes.lock();
        nodes.retain(|key, _| key.owner.domain() != domain);
        for node in nodes.values() {
            node.targets.lock().retain(|target| target.owner.domain() != domain);
        }
    }

    pub fn clear(&self) {
        self.nodes.lock().clear();
    }

    /// Committed memo of `key`.
    pub fn memoized(&self, key: &PropertyKey) -> Option<Value> {
        self.memoized_in(key, None)
    }

    pub fn memoized_in(&self, key: &PropertyKey, scope: Option<TxId>) -> Option<Value> {
        let node = self.nodes.lock().get(key).cloned()?;
        node.memo(scope)
    }

    /// Direct dependents of `key`, sorted.
    pub fn targets(&self, key: &PropertyKey) -> Vec<PropertyKey> {
        let Some(node) = self.nodes.lock().get(key).cloned() else {
            return Vec::new();
        };
        let mut targets: Vec<PropertyKey> = node.targets.lock().iter().cloned().collect();
        targets.sort_by(|a, b| (&a.owner, &a.name).cmp(&(&b.owner, &b.name)));
        targets
    }

    pub fn contains(&self, key: &PropertyKey) -> bool {
        self.nodes.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }
}
