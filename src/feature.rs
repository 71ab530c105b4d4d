// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::error::Error;
use std::fmt;

use fnv::{FnvBuildHasher, FnvHashMap};
use indexmap::IndexMap;
use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::node::{Client, NodeId, Op, VarId};
use crate::FunctionGraph;

///
/// Extra `node <- prerequisite nodes` constraints contributed to the topological sort.
/// Insertion-ordered so that the sort stays deterministic.
///
pub type Orderings = IndexMap<NodeId, Vec<NodeId>, FnvBuildHasher>;

///
/// Raised by a feature's `on_attach` to signal that an equivalent feature is already
/// installed; `FunctionGraph::attach_feature` swallows it and aborts the attachment.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AlreadyThere;

impl fmt::Display for AlreadyThere {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an equivalent feature is already attached")
    }
}

impl Error for AlreadyThere {}

///
/// Raised by a feature to reject a structural edit. The container reverts the edit it
/// was raised against before propagating it.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InconsistencyError(pub String);

impl fmt::Display for InconsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inconsistent graph: {}", self.0)
    }
}

impl Error for InconsistencyError {}

///
/// A listener attached to a `FunctionGraph`. Every hook has a no-op default, so a
/// feature implements only the subset it cares about.
///
/// Hooks receive the container itself; they may read it freely and may perform further
/// structural edits through the public primitives, but must not bypass them.
///
pub trait Feature<O: Op>: Send + Sync {
    ///
    /// A stable identity used for attach-time deduplication and callback-cost reporting.
    ///
    fn name(&self) -> &'static str;

    fn on_attach(&self, _graph: &mut FunctionGraph<O>) -> Result<(), AlreadyThere> {
        Ok(())
    }

    fn on_detach(&self, _graph: &mut FunctionGraph<O>) {}

    fn on_import(
        &self,
        _graph: &mut FunctionGraph<O>,
        _node: NodeId,
        _reason: &str,
    ) -> Result<(), InconsistencyError> {
        Ok(())
    }

    fn on_prune(
        &self,
        _graph: &mut FunctionGraph<O>,
        _node: NodeId,
        _reason: &str,
    ) -> Result<(), InconsistencyError> {
        Ok(())
    }

    fn on_change_input(
        &self,
        _graph: &mut FunctionGraph<O>,
        _client: Client,
        _old: VarId,
        _new: VarId,
        _reason: &str,
    ) -> Result<(), InconsistencyError> {
        Ok(())
    }

    ///
    /// Extra topological constraints this feature imposes. Collected and merged by
    /// `FunctionGraph::orderings`.
    ///
    fn orderings(&self, _graph: &FunctionGraph<O>) -> Orderings {
        Orderings::default()
    }

    ///
    /// A whole-graph consistency check, run by `FunctionGraph::validate` after a batch
    /// of replacements.
    ///
    fn validate(&self, _graph: &FunctionGraph<O>) -> Result<(), InconsistencyError> {
        Ok(())
    }
}

///
/// The built-in guard attached last to every `FunctionGraph`: its `validate` hook
/// rejects graphs whose dataflow (plus feature orderings) is cyclic and re-audits every
/// node's view/destroy maps. `FunctionGraph::replace_validate` runs replacements under
/// this check and rolls them back on rejection.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplaceValidate;

impl<O: Op> Feature<O> for ReplaceValidate {
    fn name(&self) -> &'static str {
        "ReplaceValidate"
    }

    fn on_attach(&self, graph: &mut FunctionGraph<O>) -> Result<(), AlreadyThere> {
        if graph
            .features()
            .iter()
            .any(|f| f.name() == Feature::<O>::name(self))
        {
            return Err(AlreadyThere);
        }
        Ok(())
    }

    fn validate(&self, graph: &FunctionGraph<O>) -> Result<(), InconsistencyError> {
        if let Err(remaining) = graph.try_toposort() {
            return Err(InconsistencyError(format!(
                "the graph contains a cycle: {}",
                describe_cycle(graph, &remaining)
            )));
        }
        for node in graph.apply_nodes() {
            graph.check_node_maps(node).map_err(InconsistencyError)?;
        }
        Ok(())
    }
}

///
/// Renders one cycle among the given unsortable nodes, via the strongly connected
/// components of their dataflow-plus-orderings projection.
///
fn describe_cycle<O: Op>(graph: &FunctionGraph<O>, members: &[NodeId]) -> String {
    let mut pg: DiGraph<NodeId, ()> = DiGraph::new();
    let mut idx: FnvHashMap<NodeId, NodeIndex> = FnvHashMap::default();
    for &n in members {
        idx.insert(n, pg.add_node(n));
    }
    for &n in members {
        for &inp in graph.arena().node(n).inputs() {
            if let Some((p, _)) = graph.arena().var(inp).owner() {
                if let (Some(&pi), Some(&ni)) = (idx.get(&p), idx.get(&n)) {
                    pg.add_edge(pi, ni, ());
                }
            }
        }
    }
    for (n, prereqs) in graph.orderings() {
        for p in prereqs {
            if let (Some(&pi), Some(&ni)) = (idx.get(&p), idx.get(&n)) {
                pg.add_edge(pi, ni, ());
            }
        }
    }
    for scc in kosaraju_scc(&pg) {
        if scc.len() > 1 || pg.find_edge(scc[0], scc[0]).is_some() {
            return scc
                .iter()
                .map(|&i| graph.arena().node(pg[i]).op().to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
        }
    }
    "unidentified".to_owned()
}
