// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::VecDeque;
use std::panic::Location;

use fixedbitset::FixedBitSet;
use fnv::{FnvHashMap, FnvHashSet};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::feature::Orderings;
use crate::node::{ApplyNode, NodeId, Op, Tag, Value, VarId, Variable};

///
/// A map from the variables and nodes of one subgraph to their copies, produced by
/// `clone_get_equiv`. Callers use it to relocate references they hold into the copy.
///
#[derive(Clone, Debug, Default)]
pub struct CloneMemo {
    pub vars: FnvHashMap<VarId, VarId>,
    pub nodes: FnvHashMap<NodeId, NodeId>,
}

///
/// The store that owns every `Variable` and `ApplyNode` payload. Handles are indices
/// into it, and slots are never freed: pruning a node from a `FunctionGraph` only drops
/// it from the graph's membership indices, so stale handles held by a driver stay
/// dereferenceable (though no longer members).
///
/// The arena also hosts the pure traversal primitives over the bipartite
/// (variable, node) DAG: they read structure only and never consult membership.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound(
    serialize = "O: Serialize, O::Type: Serialize, Value<O>: Serialize",
    deserialize = "O: serde::de::DeserializeOwned, O::Type: serde::de::DeserializeOwned, \
                   Value<O>: serde::de::DeserializeOwned"
))]
pub struct Arena<O: Op> {
    vars: Vec<Variable<O>>,
    nodes: Vec<ApplyNode<O>>,
}

impl<O: Op> Default for Arena<O> {
    fn default() -> Self {
        Arena::new()
    }
}

impl<O: Op> Arena<O> {
    pub fn new() -> Arena<O> {
        Arena {
            vars: Vec::new(),
            nodes: Vec::new(),
        }
    }

    ///
    /// Create a free variable of the given type. It becomes a graph input, or an orphan
    /// if never declared as one.
    ///
    #[track_caller]
    pub fn variable(&mut self, ty: O::Type, name: Option<&str>) -> VarId {
        self.push_var(Variable {
            ty,
            owner: None,
            value: None,
            name: name.map(str::to_owned),
            test_value: None,
            trace: Some(Location::caller().to_string()),
        })
    }

    ///
    /// Create a constant carrying a literal. Constants are never graph inputs.
    ///
    #[track_caller]
    pub fn constant(&mut self, ty: O::Type, value: Value<O>, name: Option<&str>) -> VarId {
        self.push_var(Variable {
            ty,
            owner: None,
            value: Some(value),
            name: name.map(str::to_owned),
            test_value: None,
            trace: Some(Location::caller().to_string()),
        })
    }

    ///
    /// Apply an op to the given inputs, creating one output variable per entry of
    /// `output_types`.
    ///
    #[track_caller]
    pub fn apply(&mut self, op: O, inputs: Vec<VarId>, output_types: Vec<O::Type>) -> NodeId {
        debug_assert!(inputs.iter().all(|v| v.index() < self.vars.len()));
        let trace = Location::caller().to_string();
        let id = NodeId(self.nodes.len() as u32);
        let outputs = output_types
            .into_iter()
            .enumerate()
            .map(|(i, ty)| {
                self.push_var(Variable {
                    ty,
                    owner: Some((id, i)),
                    value: None,
                    name: None,
                    test_value: None,
                    trace: Some(trace.clone()),
                })
            })
            .collect();
        self.nodes.push(ApplyNode {
            op,
            inputs,
            outputs,
            tag: Tag::default(),
        });
        id
    }

    pub fn set_test_value(&mut self, var: VarId, value: Value<O>) {
        self.vars[var.index()].test_value = Some(value);
    }

    pub fn var(&self, id: VarId) -> &Variable<O> {
        &self.vars[id.index()]
    }

    pub fn node(&self, id: NodeId) -> &ApplyNode<O> {
        &self.nodes[id.index()]
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    ///
    /// Render a variable for diagnostics: its name if it has one, else a stable
    /// handle-derived placeholder.
    ///
    pub fn display_var(&self, id: VarId) -> String {
        match self.vars[id.index()].name {
            Some(ref name) => name.clone(),
            None => format!("*{}", id.index()),
        }
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut ApplyNode<O> {
        &mut self.nodes[id.index()]
    }

    fn push_var(&mut self, var: Variable<O>) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(var);
        id
    }

    fn copy_var(&mut self, v: VarId) -> VarId {
        let data = self.vars[v.index()].clone();
        self.push_var(Variable {
            owner: None,
            ..data
        })
    }

    ///
    /// All variables in the subgraph between `inputs` and `outputs`: the outputs, every
    /// variable on a path from an input (or a rootless variable) to an output, and every
    /// sibling output of each node on such a path. Deterministic discovery order.
    ///
    pub fn vars_between(&self, inputs: &[VarId], outputs: &[VarId]) -> Vec<VarId> {
        let boundary: FnvHashSet<VarId> = inputs.iter().copied().collect();
        let mut seen = FixedBitSet::with_capacity(self.vars.len());
        let mut stack: Vec<VarId> = outputs.to_vec();
        let mut result = Vec::new();
        while let Some(v) = stack.pop() {
            if seen.put(v.index()) {
                continue;
            }
            result.push(v);
            if boundary.contains(&v) {
                continue;
            }
            if let Some((owner, _)) = self.vars[v.index()].owner {
                let node = &self.nodes[owner.index()];
                stack.extend(node.inputs.iter().copied());
                stack.extend(node.outputs.iter().copied());
            }
        }
        result
    }

    ///
    /// All apply nodes in the subgraph between `inputs` and `outputs`, in deterministic
    /// discovery order.
    ///
    pub fn applys_between(&self, inputs: &[VarId], outputs: &[VarId]) -> Vec<NodeId> {
        let boundary: FnvHashSet<VarId> = inputs.iter().copied().collect();
        let mut seen_vars = FixedBitSet::with_capacity(self.vars.len());
        let mut seen_nodes = FixedBitSet::with_capacity(self.nodes.len());
        let mut stack: Vec<VarId> = outputs.to_vec();
        let mut result = Vec::new();
        while let Some(v) = stack.pop() {
            if seen_vars.put(v.index()) || boundary.contains(&v) {
                continue;
            }
            if let Some((owner, _)) = self.vars[v.index()].owner {
                if !seen_nodes.put(owner.index()) {
                    result.push(owner);
                }
                let node = &self.nodes[owner.index()];
                stack.extend(node.inputs.iter().copied());
                stack.extend(node.outputs.iter().copied());
            }
        }
        result
    }

    ///
    /// The free roots of `outputs`: every rootless, non-constant variable reachable by
    /// walking up from the outputs. This is the default input list of a graph
    /// constructed without an explicit one.
    ///
    pub fn graph_inputs(&self, outputs: &[VarId]) -> Vec<VarId> {
        self.vars_between(&[], outputs)
            .into_iter()
            .filter(|&v| {
                let var = &self.vars[v.index()];
                var.owner.is_none() && !var.is_constant()
            })
            .collect()
    }

    ///
    /// Kahn-style topological sort of the apply nodes between a boundary and `outputs`.
    ///
    /// `is_boundary` marks variables the walk must not ascend past (a graph's inputs, or
    /// everything already imported). `orderings` adds `node <- prereqs` constraints on
    /// top of the dataflow edges. Ties break in discovery order, so two runs over an
    /// identical arena return identical sequences.
    ///
    /// Returns the unsorted leftovers when the constraints are cyclic.
    ///
    pub fn io_toposort(
        &self,
        is_boundary: &dyn Fn(VarId) -> bool,
        outputs: &[VarId],
        orderings: &Orderings,
    ) -> Result<Vec<NodeId>, Vec<NodeId>> {
        // Discover the member nodes.
        let mut seen_vars = FixedBitSet::with_capacity(self.vars.len());
        let mut seen_nodes = FixedBitSet::with_capacity(self.nodes.len());
        let mut members: Vec<NodeId> = Vec::new();
        let mut stack: Vec<VarId> = outputs.to_vec();
        while let Some(v) = stack.pop() {
            if seen_vars.put(v.index()) || is_boundary(v) {
                continue;
            }
            if let Some((owner, _)) = self.vars[v.index()].owner {
                if !seen_nodes.put(owner.index()) {
                    members.push(owner);
                    stack.extend(self.nodes[owner.index()].inputs.iter().copied());
                }
            }
        }

        self.sort_members(members, is_boundary, orderings)
    }

    ///
    /// The Kahn phase of `io_toposort`, over an explicit member list. Also used to sort
    /// (and cycle-check) a `FunctionGraph`'s whole node set.
    ///
    pub(crate) fn sort_members(
        &self,
        members: Vec<NodeId>,
        is_boundary: &dyn Fn(VarId) -> bool,
        orderings: &Orderings,
    ) -> Result<Vec<NodeId>, Vec<NodeId>> {
        let member_set: FnvHashSet<NodeId> = members.iter().copied().collect();
        let mut indegree: FnvHashMap<NodeId, usize> = FnvHashMap::default();
        let mut successors: FnvHashMap<NodeId, Vec<NodeId>> = FnvHashMap::default();
        for &n in &members {
            let mut preds: IndexSet<NodeId, fnv::FnvBuildHasher> = IndexSet::default();
            for &inp in &self.nodes[n.index()].inputs {
                if is_boundary(inp) {
                    continue;
                }
                if let Some((p, _)) = self.vars[inp.index()].owner {
                    if member_set.contains(&p) {
                        preds.insert(p);
                    }
                }
            }
            if let Some(prereqs) = orderings.get(&n) {
                for &p in prereqs {
                    if p != n && member_set.contains(&p) {
                        preds.insert(p);
                    }
                }
            }
            indegree.insert(n, preds.len());
            for &p in &preds {
                successors.entry(p).or_default().push(n);
            }
        }

        let mut queue: VecDeque<NodeId> = members
            .iter()
            .copied()
            .filter(|n| indegree[n] == 0)
            .collect();
        let mut order = Vec::with_capacity(members.len());
        while let Some(n) = queue.pop_front() {
            order.push(n);
            if let Some(succs) = successors.get(&n) {
                for &s in succs {
                    let d = indegree.get_mut(&s).unwrap();
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(s);
                    }
                }
            }
        }

        if order.len() == members.len() {
            Ok(order)
        } else {
            Err(members
                .into_iter()
                .filter(|n| indegree[n] > 0)
                .collect())
        }
    }

    ///
    /// Deep-copy the subgraph between `inputs` and `outputs` into fresh slots, wiring
    /// the copies to each other, and return the extended memo.
    ///
    /// Variables already present in `memo` are reused as given, which is how callers
    /// share chosen variables between the original and the copy. With
    /// `copy_inputs = false` (resp. `copy_orphans = false`) the inputs (resp. rootless
    /// non-input variables) are mapped to themselves instead of copied.
    ///
    pub fn clone_get_equiv(
        &mut self,
        inputs: &[VarId],
        outputs: &[VarId],
        copy_inputs: bool,
        copy_orphans: bool,
        mut memo: CloneMemo,
    ) -> CloneMemo {
        for &i in inputs {
            if !memo.vars.contains_key(&i) {
                let mapped = if copy_inputs { self.copy_var(i) } else { i };
                memo.vars.insert(i, mapped);
            }
        }

        let order = {
            let memo_ref = &memo;
            self.io_toposort(
                &|v| memo_ref.vars.contains_key(&v),
                outputs,
                &Orderings::default(),
            )
            .expect("expression construction cannot form cycles")
        };

        for n in order {
            let node = self.nodes[n.index()].clone();
            let new_inputs: Vec<VarId> = node
                .inputs
                .iter()
                .map(|&v| self.map_rootless(&mut memo, v, copy_orphans))
                .collect();
            let out_types: Vec<O::Type> = node
                .outputs
                .iter()
                .map(|&o| self.vars[o.index()].ty.clone())
                .collect();
            let new_node = self.apply(node.op.clone(), new_inputs, out_types);
            let new_outputs = self.nodes[new_node.index()].outputs.clone();
            for (&old_o, &new_o) in node.outputs.iter().zip(new_outputs.iter()) {
                let old = self.vars[old_o.index()].clone();
                let slot = &mut self.vars[new_o.index()];
                slot.name = old.name;
                slot.test_value = old.test_value;
                slot.trace = old.trace;
                memo.vars.insert(old_o, new_o);
            }
            memo.nodes.insert(n, new_node);
        }

        for &o in outputs {
            self.map_rootless(&mut memo, o, copy_orphans);
        }
        memo
    }

    fn map_rootless(&mut self, memo: &mut CloneMemo, v: VarId, copy_orphans: bool) -> VarId {
        if let Some(&m) = memo.vars.get(&v) {
            return m;
        }
        // Producers are mapped in topological order before their consumers, so an
        // unmapped variable here is a constant or an orphan.
        debug_assert!(self.vars[v.index()].owner.is_none());
        let mapped = if copy_orphans { self.copy_var(v) } else { v };
        memo.vars.insert(v, mapped);
        mapped
    }
}
