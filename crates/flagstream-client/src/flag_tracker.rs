//! Change notifications for flags, including changes that reach a flag only
//! through its prerequisite or segment dependencies.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use flagstream_core::model::{Clause, Flag, Op, Segment};
use flagstream_core::store::{DataKind, FullDataSet, StoreItem};

/// A flag whose effective configuration changed: the flag itself, or
/// anything it transitively depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagChange {
    pub key: String,
}

/// A change in the evaluated value of one flag for one context.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagValueChange {
    pub key: String,
    pub old_value: Value,
    pub new_value: Value,
}

type Node = (DataKind, String);

/// Dependency edges between dataset items, maintained incrementally so a
/// single upsert only touches its own edges.
#[derive(Default)]
struct DependencyGraph {
    forward: HashMap<Node, HashSet<Node>>,
    reverse: HashMap<Node, HashSet<Node>>,
}

impl DependencyGraph {
    fn set_dependencies(&mut self, node: Node, dependencies: HashSet<Node>) {
        if let Some(old) = self.forward.remove(&node) {
            for dependency in old {
                if let Some(dependents) = self.reverse.get_mut(&dependency) {
                    dependents.remove(&node);
                }
            }
        }
        for dependency in &dependencies {
            self.reverse
                .entry(dependency.clone())
                .or_default()
                .insert(node.clone());
        }
        self.forward.insert(node, dependencies);
    }

    /// Everything that transitively depends on `start`, plus `start`.
    fn affected(&self, start: Node) -> HashSet<Node> {
        let mut seen = HashSet::from([start.clone()]);
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            if let Some(dependents) = self.reverse.get(&node) {
                for dependent in dependents {
                    if seen.insert(dependent.clone()) {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }
        seen
    }

    fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }
}

fn segment_refs(clauses: &[Clause], into: &mut HashSet<Node>) {
    for clause in clauses {
        if clause.op == Op::SegmentMatch {
            for value in &clause.values {
                if let Some(key) = value.as_str() {
                    into.insert((DataKind::Segments, key.to_string()));
                }
            }
        }
    }
}

fn flag_dependencies(flag: &Flag) -> HashSet<Node> {
    let mut dependencies = HashSet::new();
    for prerequisite in &flag.prerequisites {
        dependencies.insert((DataKind::Features, prerequisite.key.clone()));
    }
    for rule in &flag.rules {
        segment_refs(&rule.clauses, &mut dependencies);
    }
    dependencies
}

fn segment_dependencies(segment: &Segment) -> HashSet<Node> {
    let mut dependencies = HashSet::new();
    for rule in &segment.rules {
        segment_refs(&rule.clauses, &mut dependencies);
    }
    dependencies
}

fn item_dependencies(item: &StoreItem) -> HashSet<Node> {
    match item {
        StoreItem::Flag(flag) => flag_dependencies(flag),
        StoreItem::Segment(segment) => segment_dependencies(segment),
        StoreItem::Tombstone(_) => HashSet::new(),
    }
}

/// Publishes [`FlagChange`] events derived from data store updates.
pub struct FlagTracker {
    graph: Mutex<DependencyGraph>,
    sender: broadcast::Sender<FlagChange>,
}

impl Default for FlagTracker {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(128);
        Self {
            graph: Mutex::new(DependencyGraph::default()),
            sender,
        }
    }
}

impl FlagTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to flag change events.
    pub fn subscribe(&self) -> broadcast::Receiver<FlagChange> {
        self.sender.subscribe()
    }

    /// Process a full dataset replacement: rebuild the dependency graph and
    /// notify for every flag affected by anything that differs between the
    /// old and new datasets.
    pub(crate) fn apply_init(&self, old: &FullDataSet, new: &FullDataSet) {
        let mut changed: Vec<Node> = Vec::new();
        for kind in [DataKind::Features, DataKind::Segments] {
            let empty = HashMap::new();
            let old_items = old.get(&kind).unwrap_or(&empty);
            let new_items = new.get(&kind).unwrap_or(&empty);
            for key in old_items.keys().chain(new_items.keys()) {
                let node = (kind, key.clone());
                if changed.contains(&node) {
                    continue;
                }
                match (old_items.get(key), new_items.get(key)) {
                    (Some(old_item), Some(new_item)) => {
                        if old_item.version() != new_item.version() {
                            changed.push(node);
                        }
                    }
                    _ => changed.push(node),
                }
            }
        }

        let affected = {
            let mut graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
            graph.clear();
            for (kind, items) in new {
                for (key, item) in items {
                    graph.set_dependencies((*kind, key.clone()), item_dependencies(item));
                }
            }
            let mut affected = HashSet::new();
            for node in changed {
                affected.extend(graph.affected(node));
            }
            affected
        };
        self.notify(affected);
    }

    /// Process a single applied upsert.
    pub(crate) fn apply_upsert(&self, kind: DataKind, key: &str, item: &StoreItem) {
        let node = (kind, key.to_string());
        let affected = {
            let mut graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
            graph.set_dependencies(node.clone(), item_dependencies(item));
            graph.affected(node)
        };
        self.notify(affected);
    }

    fn notify(&self, affected: HashSet<Node>) {
        let mut keys: Vec<String> = affected
            .into_iter()
            .filter(|(kind, _)| *kind == DataKind::Features)
            .map(|(_, key)| key)
            .collect();
        keys.sort();
        for key in keys {
            let _ = self.sender.send(FlagChange { key });
        }
    }

    /// Subscribe to changes in the evaluated value of one flag for one
    /// context. `evaluate` is called once at registration to establish the
    /// baseline, then again on every change to the flag; an event fires
    /// only when the value actually differs.
    pub fn value_change_listener(
        &self,
        flag_key: String,
        evaluate: Arc<dyn Fn() -> Value + Send + Sync>,
    ) -> mpsc::UnboundedReceiver<FlagValueChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut changes = self.subscribe();
        tokio::spawn(async move {
            let mut current = evaluate();
            loop {
                match changes.recv().await {
                    Ok(change) if change.key == flag_key => {}
                    Ok(_) => continue,
                    // Missed events: re-evaluate to be safe.
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                let new_value = evaluate();
                if new_value != current {
                    let event = FlagValueChange {
                        key: flag_key.clone(),
                        old_value: std::mem::replace(&mut current, new_value.clone()),
                        new_value,
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
        });
        rx
    }
}
