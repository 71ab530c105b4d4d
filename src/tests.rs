// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{
    Arena, Client, Config, Feature, FunctionGraph, FunctionGraphError, InconsistencyError, NodeId,
    Op, Options, Orderings, TestValueMode, VarId, VarType,
};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
enum TType {
    I32,
    F64,
    Null,
}

impl fmt::Display for TType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TType::I32 => write!(f, "i32"),
            TType::F64 => write!(f, "f64"),
            TType::Null => write!(f, "null"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
struct TValue(Vec<i64>);

impl VarType for TType {
    type Value = TValue;
    type Op = TOp;

    fn filter_variable(
        &self,
        graph: &mut FunctionGraph<TOp>,
        var: VarId,
        allow_convert: bool,
    ) -> Result<VarId, String> {
        let actual = *graph.arena().var(var).ty();
        if actual == *self {
            return Ok(var);
        }
        if allow_convert && *self == TType::F64 && actual == TType::I32 {
            let cast = graph.arena_mut().apply(TOp::Cast, vec![var], vec![TType::F64]);
            return Ok(graph.arena().node(cast).outputs()[0]);
        }
        Err(format!("cannot coerce a variable of type {actual} to {self}"))
    }

    fn why_null(&self) -> Option<&str> {
        match self {
            TType::Null => Some("the gradient at this position is undefined"),
            _ => None,
        }
    }

    fn value_shape(value: &TValue) -> Option<Vec<usize>> {
        Some(vec![value.0.len()])
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
enum TOp {
    Add,
    Mul,
    Neg,
    Cast,
    IncAdd,
    BadMap,
}

impl fmt::Display for TOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Op for TOp {
    type Type = TType;

    fn view_map(&self) -> Vec<(usize, Vec<usize>)> {
        match self {
            TOp::BadMap => vec![(2, vec![0])],
            _ => vec![],
        }
    }

    fn destroy_map(&self) -> Vec<(usize, Vec<usize>)> {
        match self {
            TOp::IncAdd => vec![(0, vec![0])],
            _ => vec![],
        }
    }
}

fn var(arena: &mut Arena<TOp>, name: &str) -> VarId {
    arena.variable(TType::F64, Some(name))
}

fn binop(arena: &mut Arena<TOp>, op: TOp, a: VarId, b: VarId) -> VarId {
    let node = arena.apply(op, vec![a, b], vec![TType::F64]);
    arena.node(node).outputs()[0]
}

fn unop(arena: &mut Arena<TOp>, op: TOp, a: VarId) -> VarId {
    let node = arena.apply(op, vec![a], vec![TType::F64]);
    arena.node(node).outputs()[0]
}

fn owner(graph: &FunctionGraph<TOp>, v: VarId) -> NodeId {
    graph.arena().var(v).owner().unwrap().0
}

///
/// `x`, `y` inputs; `a = Add(x, y)`; `b = Mul(a, x)`; outputs `[b]`.
///
fn diamond() -> (FunctionGraph<TOp>, VarId, VarId, VarId, VarId) {
    let mut arena = Arena::new();
    let x = var(&mut arena, "x");
    let y = var(&mut arena, "y");
    let a = binop(&mut arena, TOp::Add, x, y);
    let b = binop(&mut arena, TOp::Mul, a, x);
    let graph = FunctionGraph::new(arena, vec![x, y], vec![b]).unwrap();
    (graph, x, y, a, b)
}

///
/// A feature that records every event it observes, and optionally vetoes input changes.
///
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    veto: Mutex<bool>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl Feature<TOp> for Recorder {
    fn name(&self) -> &'static str {
        "Recorder"
    }

    fn on_detach(&self, _graph: &mut FunctionGraph<TOp>) {
        self.events.lock().push("detach".to_owned());
    }

    fn on_import(
        &self,
        graph: &mut FunctionGraph<TOp>,
        node: NodeId,
        reason: &str,
    ) -> Result<(), InconsistencyError> {
        self.events
            .lock()
            .push(format!("import {} ({reason})", graph.arena().node(node).op()));
        Ok(())
    }

    fn on_prune(
        &self,
        graph: &mut FunctionGraph<TOp>,
        node: NodeId,
        reason: &str,
    ) -> Result<(), InconsistencyError> {
        self.events
            .lock()
            .push(format!("prune {} ({reason})", graph.arena().node(node).op()));
        Ok(())
    }

    fn on_change_input(
        &self,
        graph: &mut FunctionGraph<TOp>,
        client: Client,
        old: VarId,
        new: VarId,
        _reason: &str,
    ) -> Result<(), InconsistencyError> {
        if *self.veto.lock() {
            return Err(InconsistencyError("the change was rejected".to_owned()));
        }
        self.events.lock().push(format!(
            "change {:?}: {} -> {}",
            client,
            graph.arena().display_var(old),
            graph.arena().display_var(new)
        ));
        Ok(())
    }
}

///
/// A feature that contributes a fixed set of extra toposort constraints.
///
struct ExtraOrdering {
    prereqs: Mutex<Orderings>,
}

impl ExtraOrdering {
    fn new(prereqs: Orderings) -> ExtraOrdering {
        ExtraOrdering {
            prereqs: Mutex::new(prereqs),
        }
    }
}

impl Feature<TOp> for ExtraOrdering {
    fn name(&self) -> &'static str {
        "ExtraOrdering"
    }

    fn orderings(&self, _graph: &FunctionGraph<TOp>) -> Orderings {
        self.prereqs.lock().clone()
    }
}

///
/// A structural fingerprint: io lists in order, membership and client lists as sorted
/// multisets (a revert restores structure, not membership insertion order).
///
#[derive(Debug, Eq, PartialEq)]
struct GraphState {
    inputs: Vec<VarId>,
    outputs: Vec<VarId>,
    nodes: Vec<NodeId>,
    variables: Vec<VarId>,
    clients: Vec<(VarId, Vec<Client>)>,
}

fn graph_state(graph: &FunctionGraph<TOp>) -> GraphState {
    let mut variables: Vec<VarId> = graph.variables().collect();
    variables.sort();
    let mut nodes: Vec<NodeId> = graph.apply_nodes().collect();
    nodes.sort();
    let clients = variables
        .iter()
        .map(|&v| {
            let mut list = graph.get_clients(v).to_vec();
            list.sort();
            (v, list)
        })
        .collect();
    GraphState {
        inputs: graph.inputs().to_vec(),
        outputs: graph.outputs().to_vec(),
        nodes,
        variables,
        clients,
    }
}

#[test]
fn construction() {
    let (graph, x, y, a, b) = diamond();
    graph.check_integrity().unwrap();

    assert_eq!(graph.inputs(), &[x, y]);
    assert_eq!(graph.outputs(), &[b]);
    let add = owner(&graph, a);
    let mul = owner(&graph, b);
    assert_eq!(
        graph.apply_nodes().collect::<Vec<_>>(),
        vec![add, mul],
        "nodes are tracked in import (i.e. topological) order"
    );
    assert_eq!(graph.get_clients(x), &[Client::Node(add, 0), Client::Node(mul, 1)]);
    assert_eq!(graph.get_clients(a), &[Client::Node(mul, 0)]);
    assert_eq!(graph.get_clients(b), &[Client::Output(0)]);
    assert_eq!(graph.toposort().unwrap(), vec![add, mul]);
    assert_eq!(graph.to_string(), "FunctionGraph(x, y -> Mul(Add(x, y), x))");
}

#[test]
fn construction_infers_inputs() {
    let mut arena = Arena::new();
    let x = var(&mut arena, "x");
    let c = arena.constant(TType::F64, TValue(vec![2]), Some("two"));
    let out = binop(&mut arena, TOp::Mul, x, c);
    let (graph, _) = FunctionGraph::new_with(
        arena,
        None,
        vec![out],
        Options {
            clone: false,
            ..Options::default()
        },
    )
    .unwrap();
    graph.check_integrity().unwrap();
    // The constant is reachable but is not an input.
    assert_eq!(graph.inputs(), &[x]);
    assert!(graph.contains_var(c));
}

#[test]
fn construction_rejects_owned_duplicate_and_constant_inputs() {
    let mut arena = Arena::new();
    let x = var(&mut arena, "x");
    let n = binop(&mut arena, TOp::Add, x, x);
    let result = FunctionGraph::new(arena, vec![n], vec![n]);
    assert!(matches!(result, Err(FunctionGraphError::Structural(_))));

    let mut arena = Arena::new();
    let x = var(&mut arena, "x");
    let out = binop(&mut arena, TOp::Add, x, x);
    let result = FunctionGraph::new(arena, vec![x, x], vec![out]);
    assert!(matches!(result, Err(FunctionGraphError::Structural(_))));

    let mut arena = Arena::new();
    let c = arena.constant(TType::F64, TValue(vec![1]), None);
    let x = var(&mut arena, "x");
    let out = binop(&mut arena, TOp::Add, x, c);
    let result = FunctionGraph::new(arena, vec![x, c], vec![out]);
    assert!(matches!(result, Err(FunctionGraphError::Structural(_))));
}

#[test]
fn clone_on_construction() {
    let mut arena = Arena::new();
    let x = var(&mut arena, "x");
    let y = var(&mut arena, "y");
    let a = binop(&mut arena, TOp::Add, x, y);
    let (graph, memo) =
        FunctionGraph::new_with(arena, Some(vec![x, y]), vec![a], Options::default()).unwrap();
    graph.check_integrity().unwrap();
    // The graph operates on copies; the caller's handles are outside it.
    assert_ne!(memo.vars[&x], x);
    assert!(!graph.contains_var(a));
    assert!(graph.contains_var(memo.vars[&a]));
    assert_eq!(graph.inputs(), &[memo.vars[&x], memo.vars[&y]]);
}

#[test]
fn import_and_prune() {
    let _logger = env_logger::try_init();
    let (mut graph, x, y, a, _b) = diamond();
    let add = owner(&graph, a);
    let mul = graph
        .apply_nodes()
        .find(|&n| graph.arena().node(n).op() == &TOp::Mul)
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    graph.attach_feature(recorder.clone());

    graph.replace(a, y, "test", None, false).unwrap();
    graph.check_integrity().unwrap();

    assert_eq!(graph.apply_nodes().collect::<Vec<_>>(), vec![mul]);
    assert_eq!(graph.arena().node(mul).inputs(), &[y, x]);
    assert!(graph.get_clients(a).is_empty());
    assert!(!graph.contains_var(a));
    assert!(!graph.contains_node(add));
    assert_eq!(graph.arena().node(add).tag().removed_by, vec!["test"]);
    let prunes: Vec<_> = recorder
        .events()
        .into_iter()
        .filter(|e| e.starts_with("prune"))
        .collect();
    assert_eq!(prunes, vec!["prune Add (test)"]);
}

#[test]
fn replace_multi_use() {
    let mut arena = Arena::new();
    let x = var(&mut arena, "x");
    let sq = binop(&mut arena, TOp::Mul, x, x);
    let mut graph = FunctionGraph::new(arena, vec![x], vec![sq]).unwrap();
    let mul = owner(&graph, sq);

    let z = graph.arena_mut().variable(TType::F64, Some("z"));
    graph.replace(x, z, "test", None, true).unwrap();
    graph.check_integrity().unwrap();

    assert_eq!(graph.arena().node(mul).inputs(), &[z, z]);
    assert_eq!(graph.get_clients(z), &[Client::Node(mul, 0), Client::Node(mul, 1)]);
    assert!(graph.get_clients(x).is_empty());
    // `z` was promoted to an input; `x` stays registered even though it is unused.
    assert_eq!(graph.inputs(), &[x, z]);
}

#[test]
fn change_input_type_mismatch() {
    let (mut graph, x, _y, _a, b) = diamond();
    let mul = owner(&graph, b);
    let w = graph.arena_mut().variable(TType::I32, Some("w"));

    let before = graph_state(&graph);
    let result = graph.change_input(Client::Node(mul, 1), w, "test", false);
    assert!(matches!(result, Err(FunctionGraphError::TypeMismatch(_))));
    assert_eq!(graph.arena().node(mul).inputs()[1], x);
    assert_eq!(graph_state(&graph), before);
    graph.check_integrity().unwrap();
}

#[test]
fn change_input_same_variable_is_noop() {
    let (mut graph, x, _y, _a, b) = diamond();
    let mul = owner(&graph, b);
    let recorder = Arc::new(Recorder::default());
    graph.attach_feature(recorder.clone());

    graph.change_input(Client::Node(mul, 1), x, "test", false).unwrap();
    assert!(recorder.events().is_empty());
    assert_eq!(graph.get_clients(x).len(), 2);
    graph.check_integrity().unwrap();
}

#[test]
fn replace_same_variable_is_noop() {
    let (mut graph, _x, _y, a, _b) = diamond();
    let recorder = Arc::new(Recorder::default());
    graph.attach_feature(recorder.clone());

    graph.replace(a, a, "test", None, false).unwrap();
    assert!(recorder.events().is_empty());
    graph.check_integrity().unwrap();
}

#[test]
fn replace_missing_variable_is_a_warned_noop() {
    let _logger = env_logger::try_init();
    let (mut graph, _x, y, _a, _b) = diamond();
    let stray = graph.arena_mut().variable(TType::F64, Some("stray"));

    let before = graph_state(&graph);
    graph.replace(stray, y, "test", None, false).unwrap();
    assert_eq!(graph_state(&graph), before);
}

#[test]
fn import_missing_input() {
    let (mut graph, _x, _y, _a, _b) = diamond();
    let q = graph.arena_mut().variable(TType::F64, Some("q"));

    let result = graph.import_var(q, "test", false);
    match result {
        Err(FunctionGraphError::MissingInput { var, message }) => {
            assert_eq!(var, q);
            assert!(message.contains("undeclared input"), "got: {message}");
            assert!(message.contains("created at"), "got: {message}");
        }
        other => panic!("expected MissingInput, got {other:?}"),
    }
    assert!(!graph.contains_var(q));

    graph.import_var(q, "test", true).unwrap();
    assert!(graph.inputs().contains(&q));
    graph.check_integrity().unwrap();
}

#[test]
fn construction_reports_missing_input_use_site() {
    let mut arena = Arena::new();
    let x = var(&mut arena, "x");
    let y = var(&mut arena, "y");
    let out = binop(&mut arena, TOp::Add, x, y);
    let result = FunctionGraph::new(arena, vec![x], vec![out]);
    match result {
        Err(FunctionGraphError::MissingInput { message, .. }) => {
            assert!(message.contains("input 1 of Add"), "got: {message}");
        }
        other => panic!("expected MissingInput, got {other:?}"),
    }
}

#[test]
fn import_null_typed_variable() {
    let (mut graph, _x, _y, _a, _b) = diamond();
    let q = graph.arena_mut().variable(TType::Null, None);
    let result = graph.import_var(q, "test", true);
    match result {
        Err(FunctionGraphError::TypeMismatch(message)) => {
            assert!(message.contains("undefined"), "got: {message}");
        }
        other => panic!("expected TypeMismatch, got {other:?}"),
    }
}

#[test]
fn bad_view_map_is_rejected() {
    let mut arena = Arena::new();
    let x = var(&mut arena, "x");
    let node = arena.apply(TOp::BadMap, vec![x], vec![TType::F64]);
    let out = arena.node(node).outputs()[0];
    let result = FunctionGraph::new(arena, vec![x], vec![out]);
    match result {
        Err(FunctionGraphError::Structural(message)) => {
            assert!(message.contains("bad view map"), "got: {message}");
        }
        other => panic!("expected Structural, got {other:?}"),
    }
}

#[test]
fn feature_veto_is_reverted() {
    let (mut graph, _x, y, a, _b) = diamond();
    let recorder = Arc::new(Recorder::default());
    graph.attach_feature(recorder.clone());
    let before = graph_state(&graph);

    *recorder.veto.lock() = true;
    let result = graph.replace(a, y, "test", None, false);
    assert!(matches!(result, Err(FunctionGraphError::Inconsistency(_))));

    assert_eq!(graph_state(&graph), before);
    graph.check_integrity().unwrap();

    // With the veto lifted the same replacement goes through.
    *recorder.veto.lock() = false;
    graph.replace(a, y, "test", None, false).unwrap();
    graph.check_integrity().unwrap();
}

#[test]
fn replace_validate_rejects_cycles() {
    let mut arena = Arena::new();
    let x = var(&mut arena, "x");
    let a = unop(&mut arena, TOp::Neg, x);
    let b = unop(&mut arena, TOp::Neg, a);
    let mut graph = FunctionGraph::new(arena, vec![x], vec![b]).unwrap();
    let neg_a = owner(&graph, a);
    let before = graph_state(&graph);

    // Feeding `b` back into `a`'s node would make the two nodes feed each other.
    let result = graph.replace_validate(x, b, "test");
    match result {
        Err(FunctionGraphError::Inconsistency(InconsistencyError(message))) => {
            assert!(message.contains("cycle"), "got: {message}");
        }
        other => panic!("expected Inconsistency, got {other:?}"),
    }

    assert_eq!(graph.arena().node(neg_a).inputs(), &[x]);
    assert_eq!(graph_state(&graph), before);
    graph.check_integrity().unwrap();
    graph.toposort().unwrap();
}

#[test]
fn replace_validate_accepts_valid_rewrites() {
    let (mut graph, _x, y, a, b) = diamond();
    let mul = owner(&graph, b);
    graph.replace_validate(a, y, "test").unwrap();
    graph.check_integrity().unwrap();
    assert_eq!(graph.apply_nodes().collect::<Vec<_>>(), vec![mul]);
}

#[test]
fn checkpoint_revert_restores_structure() {
    let (mut graph, x, y, a, _b) = diamond();
    let before = graph_state(&graph);
    let checkpoint = graph.checkpoint();

    graph.replace(a, y, "first", None, false).unwrap();
    graph.replace(y, x, "second", None, false).unwrap();
    assert_ne!(graph_state(&graph), before);

    graph.revert(checkpoint);
    assert_eq!(graph_state(&graph), before);
    graph.check_integrity().unwrap();
}

#[test]
fn toposort_respects_feature_orderings() {
    let mut arena = Arena::new();
    let x = var(&mut arena, "x");
    let y = var(&mut arena, "y");
    let a = unop(&mut arena, TOp::Neg, x);
    let b = unop(&mut arena, TOp::Neg, y);
    let c = binop(&mut arena, TOp::Add, a, a);
    let mut graph = FunctionGraph::new(arena, vec![x, y], vec![c, b]).unwrap();
    let (node_a, node_b, node_c) = (owner(&graph, a), owner(&graph, b), owner(&graph, c));

    let mut prereqs = Orderings::default();
    prereqs.insert(node_c, vec![node_b]);
    graph.attach_feature(Arc::new(ExtraOrdering::new(prereqs)));

    let order = graph.toposort().unwrap();
    let pos = |n: NodeId| order.iter().position(|&m| m == n).unwrap();
    assert!(pos(node_a) < pos(node_c));
    assert!(pos(node_b) < pos(node_c));
    assert_eq!(order, graph.toposort().unwrap());
}

#[test]
fn orderings_merge_in_attachment_order() {
    let mut arena = Arena::new();
    let x = var(&mut arena, "x");
    let a = unop(&mut arena, TOp::Neg, x);
    let b = unop(&mut arena, TOp::Neg, a);
    let mut graph = FunctionGraph::new(arena, vec![x], vec![b]).unwrap();
    let (node_a, node_b) = (owner(&graph, a), owner(&graph, b));

    let mut first = Orderings::default();
    first.insert(node_b, vec![node_a]);
    let mut second = Orderings::default();
    second.insert(node_b, vec![node_b]);
    graph.attach_feature(Arc::new(ExtraOrdering::new(first)));
    graph.attach_feature(Arc::new(ExtraOrdering::new(second)));

    let merged = graph.orderings();
    assert_eq!(merged.get(&node_b), Some(&vec![node_a, node_b]));
}

#[test]
fn toposort_is_deterministic() {
    let build = || {
        let mut arena = Arena::new();
        let x = var(&mut arena, "x");
        let y = var(&mut arena, "y");
        let mut frontier = vec![x, y];
        for i in 0..20 {
            let a = frontier[i % frontier.len()];
            let b = frontier[(i * 7 + 1) % frontier.len()];
            let out = binop(&mut arena, if i % 2 == 0 { TOp::Add } else { TOp::Mul }, a, b);
            frontier.push(out);
        }
        let out = *frontier.last().unwrap();
        FunctionGraph::new(arena, vec![x, y], vec![out]).unwrap()
    };
    let first = build().toposort().unwrap();
    let second = build().toposort().unwrap();
    assert_eq!(first, second);
}

#[test]
fn attach_feature_is_idempotent() {
    let (mut graph, _x, _y, _a, _b) = diamond();
    let baseline = graph.features().len();
    let recorder = Arc::new(Recorder::default());
    graph.attach_feature(recorder.clone());
    graph.attach_feature(recorder.clone());
    assert_eq!(graph.features().len(), baseline + 1);

    // A second ReplaceValidate instance aborts its own attachment with AlreadyThere.
    graph.attach_feature(Arc::new(crate::ReplaceValidate));
    assert_eq!(graph.features().len(), baseline + 1);

    // Removing an absent feature is a no-op.
    let stray: Arc<dyn Feature<TOp>> = Arc::new(Recorder::default());
    graph.remove_feature(&stray);
    assert_eq!(graph.features().len(), baseline + 1);
}

#[test]
fn detach_fires_on_detach() {
    let (mut graph, _x, _y, _a, _b) = diamond();
    let recorder = Arc::new(Recorder::default());
    graph.attach_feature(recorder.clone());
    let arena = graph.disown();
    assert_eq!(recorder.events(), vec!["detach"]);
    assert!(arena.var_count() > 0);
}

#[test]
fn clone_get_equiv_is_isomorphic() {
    let (mut graph, x, _y, a, b) = diamond();
    let recorder = Arc::new(Recorder::default());
    graph.attach_feature(recorder.clone());

    let (mut clone, memo) = graph.clone_get_equiv(true, true).unwrap();
    clone.check_integrity().unwrap();

    // Same wiring through the memo.
    let mul = owner(&graph, b);
    let clone_mul = owner(&clone, memo.vars[&b]);
    assert_eq!(memo.nodes[&mul], clone_mul);
    assert_eq!(
        clone.arena().node(clone_mul).inputs(),
        &[memo.vars[&a], memo.vars[&x]]
    );
    assert_eq!(
        graph.arena().var(a).ty(),
        clone.arena().var(memo.vars[&a]).ty()
    );
    // Features are shared by identity.
    let recorder_ptr = Arc::as_ptr(&recorder) as *const ();
    assert!(clone
        .features()
        .iter()
        .any(|f| Arc::as_ptr(f) as *const () == recorder_ptr));

    // Mutating the clone leaves the original untouched.
    let clone_y = clone.inputs()[1];
    clone.replace(memo.vars[&a], clone_y, "test", None, false).unwrap();
    clone.check_integrity().unwrap();
    graph.check_integrity().unwrap();
    assert!(graph.contains_var(a));
}

#[test]
fn unused_constant_is_pruned() {
    let mut arena = Arena::new();
    let x = var(&mut arena, "x");
    let c = arena.constant(TType::F64, TValue(vec![2]), Some("two"));
    let out = binop(&mut arena, TOp::Mul, x, c);
    let mut graph = FunctionGraph::new(arena, vec![x], vec![out]).unwrap();
    assert!(graph.contains_var(c));

    graph.replace(out, x, "test", None, false).unwrap();
    graph.check_integrity().unwrap();
    assert!(!graph.contains_var(c));
    assert_eq!(graph.apply_nodes().count(), 0);
    assert_eq!(graph.outputs(), &[x]);
}

#[test]
fn replace_coerces_through_filter_variable() {
    let (mut graph, _x, y, _a, _b) = diamond();
    let z = graph.arena_mut().variable(TType::I32, Some("z"));

    // Replacing an f64 variable with an i32 one inserts a Cast.
    graph.replace(y, z, "test", None, true).unwrap();
    graph.check_integrity().unwrap();
    assert!(graph.inputs().contains(&z));
    let cast = graph
        .apply_nodes()
        .find(|&n| graph.arena().node(n).op() == &TOp::Cast)
        .expect("a Cast node was imported");
    assert_eq!(graph.arena().node(cast).inputs(), &[z]);
    assert!(graph.get_clients(y).is_empty());
}

#[test]
fn replace_checks_test_value_shapes() {
    let mut arena = Arena::new();
    let x = var(&mut arena, "x");
    let y = var(&mut arena, "y");
    let out = binop(&mut arena, TOp::Add, x, y);
    arena.set_test_value(out, TValue(vec![1, 2, 3]));
    arena.set_test_value(x, TValue(vec![1]));
    let options = Options {
        clone: false,
        config: Config {
            optimizer_verbose: false,
            compute_test_value: TestValueMode::Check,
        },
        ..Options::default()
    };
    let (mut graph, _) =
        FunctionGraph::new_with(arena, Some(vec![x, y]), vec![out], options).unwrap();

    let before = graph_state(&graph);
    let result = graph.replace(out, x, "test", None, false);
    match result {
        Err(FunctionGraphError::TestValueShape {
            original,
            replacement,
        }) => {
            assert_eq!(original, Some(vec![3]));
            assert_eq!(replacement, Some(vec![1]));
        }
        other => panic!("expected TestValueShape, got {other:?}"),
    }
    assert_eq!(graph_state(&graph), before);

    // Matching shapes go through.
    graph.arena_mut().set_test_value(x, TValue(vec![4, 5, 6]));
    graph.replace(out, x, "test", None, false).unwrap();
    graph.check_integrity().unwrap();
}

#[test]
fn constant_literal_is_its_test_value() {
    let mut arena = Arena::new();
    let x = var(&mut arena, "x");
    let c = arena.constant(TType::F64, TValue(vec![7]), None);
    let out = binop(&mut arena, TOp::Add, x, c);
    let graph = FunctionGraph::new(arena, vec![x], vec![out]).unwrap();
    assert_eq!(graph.get_test_value(c), Ok(&TValue(vec![7])));
    assert!(graph.get_test_value(out).is_err());
}

#[test]
fn snapshot_roundtrip() {
    let (graph, _x, y, a, b) = diamond();
    let bytes = bincode::serialize(&graph).unwrap();
    let mut restored: FunctionGraph<TOp> = bincode::deserialize(&bytes).unwrap();

    restored.check_integrity().unwrap();
    assert_eq!(restored.inputs(), graph.inputs());
    assert_eq!(restored.outputs(), graph.outputs());
    assert_eq!(
        restored.apply_nodes().collect::<Vec<_>>(),
        graph.apply_nodes().collect::<Vec<_>>()
    );
    assert_eq!(restored.toposort().unwrap(), graph.toposort().unwrap());

    // The restored graph is fully operational, including the built-in guard.
    restored.replace_validate(a, y, "test").unwrap();
    restored.check_integrity().unwrap();
    assert_eq!(restored.outputs(), &[b]);
}

#[test]
fn deep_graphs_do_not_overflow_the_stack() {
    let mut arena = Arena::new();
    let x = var(&mut arena, "x");
    let mut tip = x;
    for _ in 0..10_000 {
        tip = unop(&mut arena, TOp::Neg, tip);
    }
    let mut graph = FunctionGraph::new(arena, vec![x], vec![tip]).unwrap();
    assert_eq!(graph.apply_nodes().count(), 10_000);
    assert_eq!(graph.toposort().unwrap().len(), 10_000);

    // Rewiring the single output cascades a prune through the whole chain.
    graph.replace(tip, x, "test", None, false).unwrap();
    graph.check_integrity().unwrap();
    assert_eq!(graph.apply_nodes().count(), 0);
}

#[test]
fn random_replacements_preserve_integrity() {
    let _logger = env_logger::try_init();
    let mut rng = StdRng::seed_from_u64(17);
    let mut arena = Arena::new();
    let inputs: Vec<VarId> = (0..6)
        .map(|i| arena.variable(TType::F64, Some(&format!("in{i}"))))
        .collect();
    let mut pool = inputs.clone();
    for i in 0..40 {
        let a = pool[rng.gen_range(0..pool.len())];
        let b = pool[rng.gen_range(0..pool.len())];
        let out = binop(&mut arena, if i % 3 == 0 { TOp::Mul } else { TOp::Add }, a, b);
        pool.push(out);
    }
    let outputs = pool[pool.len() - 3..].to_vec();
    let mut graph = FunctionGraph::new(arena, inputs, outputs).unwrap();
    graph.check_integrity().unwrap();

    for _ in 0..60 {
        let members: Vec<VarId> = graph.variables().collect();
        let var = members[rng.gen_range(0..members.len())];
        let new_var = members[rng.gen_range(0..members.len())];
        match graph.replace_validate(var, new_var, "stress") {
            Ok(()) => {}
            Err(FunctionGraphError::Inconsistency(_)) => {
                // A rejected (cyclic) rewrite must have been rolled back.
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
        graph.check_integrity().unwrap();
    }
}

#[test]
fn update_mapping_follows_clones() {
    let mut arena = Arena::new();
    let state = var(&mut arena, "state");
    let x = var(&mut arena, "x");
    let next = binop(&mut arena, TOp::Add, state, x);
    let mut update_mapping = fnv::FnvHashMap::default();
    update_mapping.insert(state, next);
    let options = Options {
        update_mapping: Some(update_mapping),
        ..Options::default()
    };
    let (graph, memo) =
        FunctionGraph::new_with(arena, Some(vec![state, x]), vec![next], options).unwrap();
    let mapping = graph.update_mapping().unwrap();
    assert_eq!(mapping.get(&memo.vars[&state]), Some(&memo.vars[&next]));

    let (clone, clone_memo) = graph.clone_get_equiv(true, false).unwrap();
    let mapping = clone.update_mapping().unwrap();
    assert_eq!(
        mapping.get(&clone_memo.vars[&memo.vars[&state]]),
        Some(&clone_memo.vars[&memo.vars[&next]])
    );
}

#[test]
fn visualize_renders_dot() {
    let (graph, _x, _y, _a, _b) = diamond();
    let mut out = Vec::new();
    graph.visualize(&mut out).unwrap();
    let dot = String::from_utf8(out).unwrap();
    assert!(dot.contains("digraph"));
    assert!(dot.contains("Add"));
    assert!(dot.contains("Mul"));
}
