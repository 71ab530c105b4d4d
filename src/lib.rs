// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

mod arena;
mod feature;
mod node;

pub use crate::arena::{Arena, CloneMemo};
pub use crate::feature::{AlreadyThere, Feature, InconsistencyError, Orderings, ReplaceValidate};
pub use crate::node::{ApplyNode, Client, NodeId, Op, Tag, Value, VarId, VarType, Variable};

use std::error::Error;
use std::fmt;
use std::io::{self};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fnv::{FnvBuildHasher, FnvHashMap};
use indexmap::{IndexMap, IndexSet};
use petgraph::dot;
use petgraph::graph::DiGraph;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

type OrderedSet<T> = IndexSet<T, FnvBuildHasher>;
type OrderedMap<K, V> = IndexMap<K, V, FnvBuildHasher>;

///
/// The errors of the container boundary.
///
#[derive(Debug)]
pub enum FunctionGraphError {
    ///
    /// An import reached a rootless, non-constant variable that is not a graph input.
    ///
    MissingInput { var: VarId, message: String },

    ///
    /// A feature rejected a structural edit; the edit it was raised against has been
    /// reverted.
    ///
    Inconsistency(InconsistencyError),

    ///
    /// A type equality or coercion failure. Raised before any mutation.
    ///
    TypeMismatch(String),

    ///
    /// A malformed view/destroy map, an illegal input list, or an integrity violation.
    /// Fatal for the rewrite pass in progress.
    ///
    Structural(String),

    ///
    /// The test values of a variable and its replacement have different shapes. Raised
    /// before any rewiring.
    ///
    TestValueShape {
        original: Option<Vec<usize>>,
        replacement: Option<Vec<usize>>,
    },
}

impl fmt::Display for FunctionGraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionGraphError::MissingInput { message, .. } => write!(f, "{message}"),
            FunctionGraphError::Inconsistency(e) => fmt::Display::fmt(e, f),
            FunctionGraphError::TypeMismatch(msg) => write!(f, "{msg}"),
            FunctionGraphError::Structural(msg) => write!(f, "{msg}"),
            FunctionGraphError::TestValueShape {
                original,
                replacement,
            } => write!(
                f,
                "the replacement variable has a test value with a shape different from the \
                 original variable's test value: original {original:?}, new {replacement:?}"
            ),
        }
    }
}

impl Error for FunctionGraphError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FunctionGraphError::Inconsistency(e) => Some(e),
            _ => None,
        }
    }
}

impl From<InconsistencyError> for FunctionGraphError {
    fn from(e: InconsistencyError) -> FunctionGraphError {
        FunctionGraphError::Inconsistency(e)
    }
}

///
/// A variable has no test value.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TestValueError;

impl fmt::Display for TestValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "the variable has no test value")
    }
}

impl Error for TestValueError {}

///
/// Whether `replace` cross-checks the test values of a variable and its replacement.
/// `Off` is the sentinel that disables the check entirely.
///
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum TestValueMode {
    #[default]
    Off,
    Check,
}

///
/// Driver-level switches, passed in at construction rather than read from process-global
/// state.
///
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub optimizer_verbose: bool,
    pub compute_test_value: TestValueMode,
}

///
/// Construction options for `FunctionGraph::new_with`. The defaults mirror the common
/// driver entrypoint: clone the caller's subgraph, no extra features, default config.
///
pub struct Options<O: Op> {
    pub clone: bool,
    pub features: Vec<Arc<dyn Feature<O>>>,
    pub update_mapping: Option<FnvHashMap<VarId, VarId>>,
    pub config: Config,
    pub memo: CloneMemo,
    pub copy_inputs: bool,
    pub copy_orphans: bool,
}

impl<O: Op> Default for Options<O> {
    fn default() -> Self {
        Options {
            clone: true,
            features: Vec::new(),
            update_mapping: None,
            config: Config::default(),
            memo: CloneMemo::default(),
            copy_inputs: true,
            copy_orphans: true,
        }
    }
}

///
/// A position in the edit journal, as returned by `FunctionGraph::checkpoint`.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint(usize);

#[derive(Clone, Copy, Debug)]
struct ChangeRecord {
    client: Client,
    old: VarId,
}

///
/// A subgraph bound by a list of input variables and a list of output variables, held
/// consistent under rewrites.
///
/// The graph tracks its member nodes and variables in insertion-ordered sets and keeps a
/// `clients` back-edge per use site, so it can be traversed in both directions. All
/// structural edits go through `import_var`/`import_node`, `change_input`, `replace`,
/// and `remove_client`; each edit is broadcast to the attached features, which may
/// reject it.
///
pub struct FunctionGraph<O: Op> {
    arena: Arena<O>,
    inputs: Vec<VarId>,
    outputs: Vec<VarId>,
    variables: OrderedSet<VarId>,
    apply_nodes: OrderedSet<NodeId>,
    clients: OrderedMap<VarId, Vec<Client>>,
    features: Vec<Arc<dyn Feature<O>>>,
    journal: Vec<ChangeRecord>,
    update_mapping: Option<FnvHashMap<VarId, VarId>>,
    config: Config,
    execute_callbacks_time: Duration,
    execute_callbacks_times: FnvHashMap<usize, Duration>,
}

impl<O: Op> fmt::Debug for FunctionGraph<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionGraph")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("variables", &self.variables)
            .field("apply_nodes", &self.apply_nodes)
            .field("features", &self.features.iter().map(|ft| ft.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn feature_key<O: Op>(feature: &Arc<dyn Feature<O>>) -> usize {
    Arc::as_ptr(feature) as *const () as usize
}

impl<O: Op> FunctionGraph<O> {
    ///
    /// Build a graph over an existing arena with explicit inputs, without cloning and
    /// without extra features.
    ///
    pub fn new(
        arena: Arena<O>,
        inputs: Vec<VarId>,
        outputs: Vec<VarId>,
    ) -> Result<FunctionGraph<O>, FunctionGraphError> {
        let options = Options {
            clone: false,
            ..Options::default()
        };
        Ok(Self::new_with(arena, Some(inputs), outputs, options)?.0)
    }

    ///
    /// Build a graph over the subgraph between `inputs` and `outputs`.
    ///
    /// When `inputs` is `None`, the free roots of `outputs` (excluding constants) are
    /// used. With `Options::clone`, the subgraph is deep-copied first and the returned
    /// memo maps the caller's variables and nodes to the copies the graph actually
    /// contains.
    ///
    pub fn new_with(
        mut arena: Arena<O>,
        inputs: Option<Vec<VarId>>,
        outputs: Vec<VarId>,
        options: Options<O>,
    ) -> Result<(FunctionGraph<O>, CloneMemo), FunctionGraphError> {
        let Options {
            clone,
            features,
            update_mapping,
            config,
            memo,
            copy_inputs,
            copy_orphans,
        } = options;

        let mut inputs = match inputs {
            Some(inputs) => inputs,
            None => arena.graph_inputs(&outputs),
        };
        let mut outputs = outputs;
        let mut update_mapping = update_mapping;
        let memo = if clone {
            let memo = arena.clone_get_equiv(&inputs, &outputs, copy_inputs, copy_orphans, memo);
            inputs = inputs.iter().map(|i| memo.vars[i]).collect();
            outputs = outputs.iter().map(|o| memo.vars[o]).collect();
            update_mapping = update_mapping.map(|mapping| {
                mapping
                    .into_iter()
                    .map(|(k, v)| {
                        (
                            memo.vars.get(&k).copied().unwrap_or(k),
                            memo.vars.get(&v).copied().unwrap_or(v),
                        )
                    })
                    .collect()
            });
            memo
        } else {
            memo
        };

        let mut graph = FunctionGraph {
            arena,
            inputs: Vec::new(),
            outputs: outputs.clone(),
            variables: OrderedSet::default(),
            apply_nodes: OrderedSet::default(),
            clients: OrderedMap::default(),
            features: Vec::new(),
            journal: Vec::new(),
            update_mapping,
            config,
            execute_callbacks_time: Duration::ZERO,
            execute_callbacks_times: FnvHashMap::default(),
        };

        for feature in features {
            graph.attach_feature(feature);
        }
        graph.attach_feature(Arc::new(ReplaceValidate));

        for &in_var in &inputs {
            if graph.arena.var(in_var).owner().is_some() {
                return Err(FunctionGraphError::Structural(format!(
                    "input {} is the output of an existing node; discard the owner or \
                     construct with clone",
                    graph.arena.display_var(in_var)
                )));
            }
            if graph.arena.var(in_var).is_constant() {
                return Err(FunctionGraphError::Structural(format!(
                    "input {} is a constant; constants are not graph inputs",
                    graph.arena.display_var(in_var)
                )));
            }
            if graph.inputs.contains(&in_var) {
                return Err(FunctionGraphError::Structural(format!(
                    "duplicate graph input {}",
                    graph.arena.display_var(in_var)
                )));
            }
            graph.inputs.push(in_var);
            graph.setup_var(in_var);
        }

        for &output in &outputs {
            graph.import_var(output, "init", false)?;
        }
        for (i, &output) in outputs.iter().enumerate() {
            graph.add_client(output, Client::Output(i));
        }

        Ok((graph, memo))
    }

    pub fn inputs(&self) -> &[VarId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[VarId] {
        &self.outputs
    }

    pub fn variables(&self) -> impl Iterator<Item = VarId> + '_ {
        self.variables.iter().copied()
    }

    pub fn apply_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.apply_nodes.iter().copied()
    }

    pub fn contains_var(&self, var: VarId) -> bool {
        self.variables.contains(&var)
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.apply_nodes.contains(&node)
    }

    ///
    /// All the `(node, i)` pairs such that `node.inputs[i]` is `var`, plus an
    /// `Output(i)` entry per `outputs[i]` occurrence.
    ///
    pub fn get_clients(&self, var: VarId) -> &[Client] {
        self.clients.get(&var).map_or(&[], |list| list.as_slice())
    }

    pub fn arena(&self) -> &Arena<O> {
        &self.arena
    }

    ///
    /// Mutable access to the arena. The arena's mutable surface only creates new
    /// variables and nodes (which become members once imported), so this cannot corrupt
    /// the graph's indices; it is how `filter_variable` implementations build conversion
    /// nodes.
    ///
    pub fn arena_mut(&mut self) -> &mut Arena<O> {
        &mut self.arena
    }

    pub fn features(&self) -> &[Arc<dyn Feature<O>>] {
        &self.features
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn update_mapping(&self) -> Option<&FnvHashMap<VarId, VarId>> {
        self.update_mapping.as_ref()
    }

    ///
    /// Total time spent in feature callbacks.
    ///
    pub fn execute_callbacks_time(&self) -> Duration {
        self.execute_callbacks_time
    }

    ///
    /// Cumulative callback time of one feature.
    ///
    pub fn execute_callbacks_time_for(&self, feature: &Arc<dyn Feature<O>>) -> Duration {
        self.execute_callbacks_times
            .get(&feature_key(feature))
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    ///
    /// Declare `var` as a graph input. Registering an existing input is a no-op.
    ///
    pub fn add_input(&mut self, var: VarId) -> Result<(), FunctionGraphError> {
        if self.inputs.contains(&var) {
            return Ok(());
        }
        if self.arena.var(var).owner().is_some() {
            return Err(FunctionGraphError::Structural(format!(
                "{} is the output of an existing node and cannot become a graph input",
                self.arena.display_var(var)
            )));
        }
        if self.arena.var(var).is_constant() {
            return Err(FunctionGraphError::Structural(format!(
                "{} is a constant and cannot become a graph input",
                self.arena.display_var(var)
            )));
        }
        self.inputs.push(var);
        self.setup_var(var);
        Ok(())
    }

    ///
    /// Track a variable and give it an (empty) client list.
    ///
    fn setup_var(&mut self, var: VarId) {
        self.variables.insert(var);
        self.clients.entry(var).or_default();
    }

    fn add_client(&mut self, var: VarId, client: Client) {
        self.clients.entry(var).or_default().push(client);
    }

    ///
    /// Validate a node's view/destroy maps against its actual arity.
    ///
    pub(crate) fn check_node_maps(&self, node: NodeId) -> Result<(), String> {
        let nd = self.arena.node(node);
        let (n_in, n_out) = (nd.inputs().len(), nd.outputs().len());
        for (kind, map) in [("view", nd.op().view_map()), ("destroy", nd.op().destroy_map())] {
            for (out_idx, in_idxs) in map {
                if out_idx >= n_out || in_idxs.iter().any(|&i| i >= n_in) {
                    return Err(format!(
                        "op {} has a bad {kind} map: entry {out_idx} -> {in_idxs:?} is out of \
                         range for {n_in} input(s) and {n_out} output(s)",
                        nd.op()
                    ));
                }
            }
        }
        Ok(())
    }

    fn missing_input_error(
        &self,
        var: VarId,
        use_site: Option<(NodeId, usize)>,
    ) -> FunctionGraphError {
        let mut message = match use_site {
            Some((node, i)) => format!(
                "undeclared input: {} (input {} of {}) was not provided and not given a value",
                self.arena.display_var(var),
                i,
                self.arena.node(node).op()
            ),
            None => format!("undeclared input: {}", self.arena.display_var(var)),
        };
        if let Some(trace) = self.arena.var(var).trace() {
            message.push_str(&format!("; the variable was created at {trace}"));
        }
        FunctionGraphError::MissingInput { var, message }
    }

    ///
    /// Import a variable, pulling in its producing node (and everything above it) when
    /// necessary. A rootless, non-constant variable that is not an input is promoted to
    /// one when `import_missing` is set, and is an error otherwise.
    ///
    pub fn import_var(
        &mut self,
        var: VarId,
        reason: &str,
        import_missing: bool,
    ) -> Result<(), FunctionGraphError> {
        if let Some((owner, _)) = self.arena.var(var).owner() {
            if !self.apply_nodes.contains(&owner) {
                self.import_node(owner, true, reason, import_missing)?;
            }
        } else if !self.arena.var(var).is_constant() && !self.inputs.contains(&var) {
            if let Some(why) = self.arena.var(var).ty().why_null() {
                return Err(FunctionGraphError::TypeMismatch(format!(
                    "the graph contains a null-typed variable: {why}"
                )));
            }
            if import_missing {
                self.add_input(var)?;
            } else {
                return Err(self.missing_input_error(var, None));
            }
        }
        self.setup_var(var);
        Ok(())
    }

    ///
    /// Import every node between the already-known variables and `node`'s outputs, in
    /// topological order.
    ///
    /// With `check`, the inputs of each incoming node are verified (or promoted) before
    /// anything is mutated, so a `MissingInput` failure leaves the graph unchanged.
    ///
    pub fn import_node(
        &mut self,
        node: NodeId,
        check: bool,
        reason: &str,
        import_missing: bool,
    ) -> Result<(), FunctionGraphError> {
        // Only new nodes are of interest, so every variable we already know of acts as
        // the input frontier for the traversal.
        let outputs = self.arena.node(node).outputs().to_vec();
        let new_nodes = self
            .arena
            .io_toposort(
                &|v| self.variables.contains(&v),
                &outputs,
                &Orderings::default(),
            )
            .map_err(|_| {
                FunctionGraphError::Structural("cannot import from a cyclic subgraph".to_owned())
            })?;

        if check {
            for &n in &new_nodes {
                let node_inputs = self.arena.node(n).inputs().to_vec();
                for (i, &var) in node_inputs.iter().enumerate() {
                    let rootless = {
                        let v = self.arena.var(var);
                        v.owner().is_none() && !v.is_constant()
                    };
                    if rootless && !self.inputs.contains(&var) {
                        if import_missing {
                            self.add_input(var)?;
                        } else {
                            return Err(self.missing_input_error(var, Some((n, i))));
                        }
                    }
                }
            }
        }

        for n in new_nodes {
            debug_assert!(!self.apply_nodes.contains(&n));
            self.check_node_maps(n)
                .map_err(FunctionGraphError::Structural)?;
            self.apply_nodes.insert(n);
            self.arena
                .node_mut(n)
                .tag_mut()
                .imported_by
                .push(reason.to_owned());
            let (node_inputs, node_outputs) = {
                let nd = self.arena.node(n);
                (nd.inputs().to_vec(), nd.outputs().to_vec())
            };
            for &out in &node_outputs {
                self.setup_var(out);
            }
            for (i, &inp) in node_inputs.iter().enumerate() {
                if !self.variables.contains(&inp) {
                    self.setup_var(inp);
                }
                self.add_client(inp, Client::Node(n, i));
            }
            test_trace_log!("imported {:?} ({})", n, reason);
            self.run_on_import(n, reason)?;
        }
        Ok(())
    }

    ///
    /// Rewire one use site to `new_var`. The current occupant and `new_var` must have
    /// equal types; rewiring a slot to the variable it already holds is a no-op.
    ///
    /// The edit is journaled, and if a feature rejects it the container replays the
    /// inverse edit before propagating the rejection, so the caller observes either the
    /// full edit or none of it.
    ///
    pub fn change_input(
        &mut self,
        client: Client,
        new_var: VarId,
        reason: &str,
        import_missing: bool,
    ) -> Result<(), FunctionGraphError> {
        self.apply_change(client, new_var, reason, import_missing, true, true)
    }

    fn apply_change(
        &mut self,
        client: Client,
        new_var: VarId,
        reason: &str,
        import_missing: bool,
        journal: bool,
        revert_on_veto: bool,
    ) -> Result<(), FunctionGraphError> {
        let old = match client {
            Client::Output(i) => self.outputs[i],
            Client::Node(n, i) => self.arena.node(n).inputs()[i],
        };
        if self.arena.var(old).ty() != self.arena.var(new_var).ty() {
            return Err(FunctionGraphError::TypeMismatch(format!(
                "the type of the replacement ({}) must be the same as the type of the \
                 original variable ({})",
                self.arena.var(new_var).ty(),
                self.arena.var(old).ty()
            )));
        }
        if old == new_var {
            return Ok(());
        }

        self.import_var(new_var, reason, import_missing)?;
        match client {
            Client::Output(i) => self.outputs[i] = new_var,
            Client::Node(n, i) => self.arena.node_mut(n).set_input(i, new_var),
        }
        self.add_client(new_var, client);
        self.remove_client(old, client, reason)?;
        if journal {
            self.journal.push(ChangeRecord { client, old });
        }
        test_trace_log!("changed {:?} to {:?} ({})", client, new_var, reason);

        if let Err(err) = self.run_on_change_input(client, old, new_var, reason) {
            if revert_on_veto {
                if journal {
                    self.journal.pop();
                }
                if let Err(revert_err) =
                    self.apply_change(client, old, "revert", false, false, false)
                {
                    log::warn!("failed to revert a rejected edit: {revert_err}");
                }
            }
            return Err(err.into());
        }
        Ok(())
    }

    ///
    /// Remove one back-edge, garbage-collecting whatever becomes unreachable.
    ///
    /// A variable left with no clients is dropped from the graph (graph inputs stay
    /// registered); a node whose outputs all lose their clients is pruned, and the
    /// removal cascades into its inputs. Uses an explicit worklist so arbitrarily deep
    /// graphs cannot overflow the stack. Removing an edge that a cascaded prune already
    /// removed is tolerated.
    ///
    pub fn remove_client(
        &mut self,
        var: VarId,
        client: Client,
        reason: &str,
    ) -> Result<(), FunctionGraphError> {
        let mut stack: Vec<(VarId, Client)> = vec![(var, client)];
        while let Some((var, client)) = stack.pop() {
            if let Some(list) = self.clients.get_mut(&var) {
                if let Some(pos) = list.iter().position(|c| *c == client) {
                    list.remove(pos);
                }
                // A missing edge was already removed by a cascaded prune; fall through
                // and re-check liveness as if it were removed here.
            }
            if self.clients.get(&var).map_or(false, |list| !list.is_empty()) {
                continue;
            }

            match self.arena.var(var).owner() {
                None => {
                    // A constant or orphan with no remaining use drops out of the graph.
                    // Graph inputs stay registered even when unused.
                    if !self.inputs.contains(&var) {
                        self.variables.shift_remove(&var);
                    }
                }
                Some((node, _)) => {
                    if !self.apply_nodes.contains(&node) {
                        continue;
                    }
                    let node_outputs = self.arena.node(node).outputs().to_vec();
                    if node_outputs
                        .iter()
                        .any(|o| self.clients.get(o).map_or(false, |list| !list.is_empty()))
                    {
                        // Some sibling output is still in use.
                        continue;
                    }
                    self.arena
                        .node_mut(node)
                        .tag_mut()
                        .removed_by
                        .push(reason.to_owned());
                    self.apply_nodes.shift_remove(&node);
                    for o in &node_outputs {
                        self.variables.shift_remove(o);
                    }
                    test_trace_log!("pruned {:?} ({})", node, reason);
                    self.run_on_prune(node, reason)?;
                    let node_inputs = self.arena.node(node).inputs().to_vec();
                    for (k, &in_var) in node_inputs.iter().enumerate() {
                        stack.push((in_var, Client::Node(node, k)));
                    }
                }
            }
        }
        Ok(())
    }

    ///
    /// Make every use of `var` use `new_var` instead.
    ///
    /// `new_var` is first coerced through `var`'s type. Replacing a variable that is not
    /// in the graph is a silent no-op (with a warning): rewrites of multiple-output ops
    /// rely on being able to replace all outputs without checking which ones are used.
    ///
    pub fn replace(
        &mut self,
        var: VarId,
        new_var: VarId,
        reason: &str,
        verbose: Option<bool>,
        import_missing: bool,
    ) -> Result<(), FunctionGraphError> {
        let verbose = verbose.unwrap_or(self.config.optimizer_verbose);
        let ty = self.arena.var(var).ty().clone();
        let new_var = ty
            .filter_variable(self, new_var, true)
            .map_err(FunctionGraphError::TypeMismatch)?;
        if verbose {
            log::info!(
                "{}: replacing {} with {}",
                reason,
                self.arena.display_var(var),
                self.arena.display_var(new_var)
            );
        }

        if !self.variables.contains(&var) {
            log::warn!(
                "{} cannot be replaced: it is not in the graph",
                self.arena.display_var(var)
            );
            return Ok(());
        }

        if self.config.compute_test_value != TestValueMode::Off {
            if let (Ok(tv), Ok(new_tv)) = (self.get_test_value(var), self.get_test_value(new_var))
            {
                let original = <O::Type as VarType>::value_shape(tv);
                let replacement = <O::Type as VarType>::value_shape(new_tv);
                if original != replacement {
                    return Err(FunctionGraphError::TestValueShape {
                        original,
                        replacement,
                    });
                }
            }
        }

        // Iterate over a snapshot: rewiring mutates the client list as we go.
        let snapshot: Vec<Client> = self.clients.get(&var).cloned().unwrap_or_default();
        for client in snapshot {
            if let Client::Node(n, _) = client {
                if !self.apply_nodes.contains(&n) {
                    // The client was pruned by an earlier rewiring in this same loop.
                    continue;
                }
            }
            debug_assert!(match client {
                Client::Output(i) => self.outputs[i] == var,
                Client::Node(n, i) => self.arena.node(n).inputs()[i] == var,
            });
            self.change_input(client, new_var, reason, import_missing)?;
        }
        Ok(())
    }

    ///
    /// Apply each `(var, new_var)` replacement in order.
    ///
    pub fn replace_all(
        &mut self,
        pairs: &[(VarId, VarId)],
        reason: &str,
        verbose: Option<bool>,
        import_missing: bool,
    ) -> Result<(), FunctionGraphError> {
        for &(var, new_var) in pairs {
            self.replace(var, new_var, reason, verbose, import_missing)?;
        }
        Ok(())
    }

    ///
    /// `replace` under the `ReplaceValidate` guard: on any failure, including a
    /// post-replacement validation failure (a cycle, a corrupted view/destroy map), the
    /// whole replacement is rolled back before the error is returned.
    ///
    pub fn replace_validate(
        &mut self,
        var: VarId,
        new_var: VarId,
        reason: &str,
    ) -> Result<(), FunctionGraphError> {
        self.replace_all_validate(&[(var, new_var)], reason)
    }

    pub fn replace_all_validate(
        &mut self,
        pairs: &[(VarId, VarId)],
        reason: &str,
    ) -> Result<(), FunctionGraphError> {
        let checkpoint = self.checkpoint();
        let result = self
            .replace_all(pairs, reason, None, false)
            .and_then(|()| self.validate());
        if let Err(err) = result {
            self.revert(checkpoint);
            return Err(err);
        }
        Ok(())
    }

    ///
    /// Run every feature's `validate` hook.
    ///
    pub fn validate(&mut self) -> Result<(), FunctionGraphError> {
        self.for_each_feature(|graph, feature| feature.validate(graph))
            .map_err(FunctionGraphError::from)
    }

    ///
    /// The current position of the edit journal.
    ///
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.journal.len())
    }

    ///
    /// Replay the inverse of every edit made since `checkpoint`, most recent first,
    /// restoring the structure the graph had at the checkpoint.
    ///
    pub fn revert(&mut self, checkpoint: Checkpoint) {
        while self.journal.len() > checkpoint.0 {
            let record = self.journal.pop().expect("journal is non-empty");
            if let Err(err) = self.apply_change(record.client, record.old, "revert", false, false, false)
            {
                // A revert restores a previously-valid state; a veto of it is ignored.
                log::warn!("a feature rejected an edit revert; continuing: {err}");
            }
        }
    }

    ///
    /// Attach a feature and fire its `on_attach` hook. Attaching the same instance twice
    /// is a no-op, and a feature may abort its own attachment by raising `AlreadyThere`.
    ///
    pub fn attach_feature(&mut self, feature: Arc<dyn Feature<O>>) {
        // Identity is the underlying instance, not the (possibly re-coerced) fat pointer.
        if self
            .features
            .iter()
            .any(|f| feature_key(f) == feature_key(&feature))
        {
            return;
        }
        if feature.on_attach(self).is_err() {
            return;
        }
        self.execute_callbacks_times
            .entry(feature_key(&feature))
            .or_insert(Duration::ZERO);
        self.features.push(feature);
    }

    ///
    /// Detach a feature, firing its `on_detach` hook. Detaching an absent feature is a
    /// no-op.
    ///
    pub fn remove_feature(&mut self, feature: &Arc<dyn Feature<O>>) {
        if let Some(pos) = self
            .features
            .iter()
            .position(|f| feature_key(f) == feature_key(feature))
        {
            let feature = self.features.remove(pos);
            feature.on_detach(self);
        }
    }

    ///
    /// Run a hook on every feature, accumulating per-feature and total callback time.
    /// The first rejection stops the iteration and is returned.
    ///
    fn for_each_feature<F>(&mut self, mut call: F) -> Result<(), InconsistencyError>
    where
        F: FnMut(&mut Self, &dyn Feature<O>) -> Result<(), InconsistencyError>,
    {
        let features: Vec<Arc<dyn Feature<O>>> = self.features.clone();
        let t0 = Instant::now();
        let mut result = Ok(());
        for feature in &features {
            let tf = Instant::now();
            let res = call(self, feature.as_ref());
            *self
                .execute_callbacks_times
                .entry(feature_key(feature))
                .or_insert(Duration::ZERO) += tf.elapsed();
            if res.is_err() {
                result = res;
                break;
            }
        }
        self.execute_callbacks_time += t0.elapsed();
        result
    }

    fn run_on_import(&mut self, node: NodeId, reason: &str) -> Result<(), FunctionGraphError> {
        self.for_each_feature(|graph, feature| feature.on_import(graph, node, reason))
            .map_err(FunctionGraphError::from)
    }

    fn run_on_prune(&mut self, node: NodeId, reason: &str) -> Result<(), FunctionGraphError> {
        self.for_each_feature(|graph, feature| feature.on_prune(graph, node, reason))
            .map_err(FunctionGraphError::from)
    }

    fn run_on_change_input(
        &mut self,
        client: Client,
        old: VarId,
        new: VarId,
        reason: &str,
    ) -> Result<(), InconsistencyError> {
        self.for_each_feature(|graph, feature| {
            feature.on_change_input(graph, client, old, new, reason)
        })
    }

    ///
    /// Collect and merge the extra topological constraints of every feature. A single
    /// contributing feature's map is reused directly; otherwise prereq lists are
    /// appended in feature-attachment order.
    ///
    pub fn orderings(&self) -> Orderings {
        let mut all: Vec<Orderings> = Vec::new();
        for feature in &self.features {
            let ords = feature.orderings(self);
            if !ords.is_empty() {
                all.push(ords);
            }
        }
        if all.len() == 1 {
            all.pop().expect("one element")
        } else {
            let mut merged = Orderings::default();
            for ords in all {
                for (node, prereqs) in ords {
                    merged.entry(node).or_default().extend(prereqs);
                }
            }
            merged
        }
    }

    ///
    /// An ordering of the graph's nodes such that every producer precedes its consumers
    /// and every feature-supplied `node <- prereqs` constraint is satisfied. Two calls
    /// on structurally identical graphs return identical sequences.
    ///
    pub fn toposort(&self) -> Result<Vec<NodeId>, FunctionGraphError> {
        if self.apply_nodes.len() < 2 {
            // When there are 0 or 1 nodes, no sorting is necessary.
            return Ok(self.apply_nodes.iter().copied().collect());
        }
        self.try_toposort().map_err(|remaining| {
            FunctionGraphError::Structural(format!(
                "the graph contains a cycle among {} node(s)",
                remaining.len()
            ))
        })
    }

    pub(crate) fn try_toposort(&self) -> Result<Vec<NodeId>, Vec<NodeId>> {
        let members: Vec<NodeId> = self.apply_nodes.iter().copied().collect();
        let orderings = self.orderings();
        self.arena
            .sort_members(members, &|v| self.inputs.contains(&v), &orderings)
    }

    ///
    /// The test value of a variable: a constant's literal, or whatever was attached to
    /// the variable at construction.
    ///
    pub fn get_test_value(&self, var: VarId) -> Result<&Value<O>, TestValueError> {
        let v = self.arena.var(var);
        if let Some(value) = v.value() {
            return Ok(value);
        }
        v.test_value().ok_or(TestValueError)
    }

    ///
    /// Audit every structural invariant. Call this for a diagnosis if things go awry.
    ///
    pub fn check_integrity(&self) -> Result<(), FunctionGraphError> {
        let expected_nodes: OrderedSet<NodeId> = self
            .arena
            .applys_between(&self.inputs, &self.outputs)
            .into_iter()
            .collect();
        if expected_nodes != self.apply_nodes {
            let missing: Vec<_> = expected_nodes.difference(&self.apply_nodes).collect();
            let excess: Vec<_> = self.apply_nodes.difference(&expected_nodes).collect();
            return Err(FunctionGraphError::Structural(format!(
                "the node set is inappropriately cached: missing {missing:?}, in excess {excess:?}"
            )));
        }
        for &node in &self.apply_nodes {
            for (i, &input) in self.arena.node(node).inputs().iter().enumerate() {
                let present = self
                    .clients
                    .get(&input)
                    .map_or(false, |list| list.contains(&Client::Node(node, i)));
                if !present {
                    return Err(FunctionGraphError::Structural(format!(
                        "inconsistent clients list: ({node:?}, {i}) is not registered as a \
                         client of {}",
                        self.arena.display_var(input)
                    )));
                }
            }
        }

        let mut expected_vars: OrderedSet<VarId> = self
            .arena
            .vars_between(&self.inputs, &self.outputs)
            .into_iter()
            .collect();
        expected_vars.extend(self.inputs.iter().copied());
        if expected_vars != self.variables {
            let missing: Vec<_> = expected_vars.difference(&self.variables).collect();
            let excess: Vec<_> = self.variables.difference(&expected_vars).collect();
            return Err(FunctionGraphError::Structural(format!(
                "the variable set is inappropriately cached: missing {missing:?}, in excess \
                 {excess:?}"
            )));
        }

        for &var in &self.variables {
            let v = self.arena.var(var);
            if v.owner().is_none() && !v.is_constant() && !self.inputs.contains(&var) {
                return Err(FunctionGraphError::Structural(format!(
                    "undeclared input: {}",
                    self.arena.display_var(var)
                )));
            }
            if let Some(list) = self.clients.get(&var) {
                for (idx, &client) in list.iter().enumerate() {
                    if list[..idx].contains(&client) {
                        return Err(FunctionGraphError::Structural(format!(
                            "duplicate client entry {client:?} for {}",
                            self.arena.display_var(var)
                        )));
                    }
                    match client {
                        Client::Output(i) => {
                            if self.outputs.get(i) != Some(&var) {
                                return Err(FunctionGraphError::Structural(format!(
                                    "inconsistent clients list: {} is not outputs[{i}]",
                                    self.arena.display_var(var)
                                )));
                            }
                        }
                        Client::Node(n, i) => {
                            if !self.apply_nodes.contains(&n) {
                                return Err(FunctionGraphError::Structural(format!(
                                    "client {n:?} of {} is not in the graph",
                                    self.arena.display_var(var)
                                )));
                            }
                            if self.arena.node(n).inputs().get(i) != Some(&var) {
                                return Err(FunctionGraphError::Structural(format!(
                                    "inconsistent clients list: ({n:?}, {i}) does not hold {}",
                                    self.arena.display_var(var)
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    ///
    /// Deep-copy the graph. The returned memo maps this graph's variables and nodes to
    /// the clone's, so callers can relocate references they hold. Features are shared by
    /// identity with the clone when `attach_features` is set.
    ///
    pub fn clone_get_equiv(
        &self,
        check_integrity: bool,
        attach_features: bool,
    ) -> Result<(FunctionGraph<O>, CloneMemo), FunctionGraphError> {
        if check_integrity {
            self.check_integrity()?;
        }
        let mut arena = self.arena.clone();
        let memo = arena.clone_get_equiv(&self.inputs, &self.outputs, true, true, CloneMemo::default());
        let inputs: Vec<VarId> = self.inputs.iter().map(|i| memo.vars[i]).collect();
        let outputs: Vec<VarId> = self.outputs.iter().map(|o| memo.vars[o]).collect();
        let update_mapping = self.update_mapping.as_ref().map(|mapping| {
            mapping
                .iter()
                .map(|(k, v)| {
                    (
                        memo.vars.get(k).copied().unwrap_or(*k),
                        memo.vars.get(v).copied().unwrap_or(*v),
                    )
                })
                .collect()
        });
        let options = Options {
            clone: false,
            update_mapping,
            config: self.config,
            ..Options::default()
        };
        let (mut graph, _) = Self::new_with(arena, Some(inputs), outputs, options)?;
        if check_integrity {
            graph.check_integrity()?;
        }
        if attach_features {
            for feature in &self.features {
                graph.attach_feature(feature.clone());
            }
        }
        Ok((graph, memo))
    }

    ///
    /// Render the graph's node projection in GraphViz DOT format.
    ///
    pub fn visualize(&self, f: &mut dyn io::Write) -> io::Result<()> {
        let mut pg: DiGraph<String, String> = DiGraph::new();
        let mut idx: FnvHashMap<NodeId, petgraph::graph::NodeIndex> = FnvHashMap::default();
        for &n in &self.apply_nodes {
            idx.insert(n, pg.add_node(self.arena.node(n).op().to_string()));
        }
        for &n in &self.apply_nodes {
            for &inp in self.arena.node(n).inputs() {
                if let Some((p, _)) = self.arena.var(inp).owner() {
                    if let Some(&pi) = idx.get(&p) {
                        pg.add_edge(pi, idx[&n], String::new());
                    }
                }
            }
        }
        write!(f, "{}", dot::Dot::with_config(&pg, &[dot::Config::EdgeNoLabel]))
    }

    ///
    /// Detach every feature, clear every index, and hand the arena back. The graph is
    /// consumed: there is no container left to misuse.
    ///
    pub fn disown(mut self) -> Arena<O> {
        let features: Vec<_> = self.features.clone();
        for feature in &features {
            self.remove_feature(feature);
        }
        self.variables.clear();
        self.apply_nodes.clear();
        self.clients.clear();
        self.inputs.clear();
        self.outputs.clear();
        self.journal.clear();
        self.update_mapping = None;
        self.arena
    }

    fn render_var(&self, var: VarId, depth: usize, out: &mut String) {
        let v = self.arena.var(var);
        if let Some(name) = v.name() {
            out.push_str(name);
            return;
        }
        if let Some(value) = v.value() {
            out.push_str(&format!("{value:?}"));
            return;
        }
        match v.owner() {
            None => out.push_str(&self.arena.display_var(var)),
            Some((node, i)) => {
                if depth == 0 {
                    out.push_str("...");
                    return;
                }
                let nd = self.arena.node(node);
                out.push_str(&format!("{}", nd.op()));
                if nd.outputs().len() > 1 {
                    out.push_str(&format!(".{i}"));
                }
                out.push('(');
                for (k, &inp) in nd.inputs().iter().enumerate() {
                    if k > 0 {
                        out.push_str(", ");
                    }
                    self.render_var(inp, depth - 1, out);
                }
                out.push(')');
            }
        }
    }
}

impl<O: Op> fmt::Display for FunctionGraph<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs = self
            .inputs
            .iter()
            .map(|&i| self.arena.display_var(i))
            .collect::<Vec<_>>()
            .join(", ");
        let mut outputs = String::new();
        for (k, &o) in self.outputs.iter().enumerate() {
            if k > 0 {
                outputs.push_str(", ");
            }
            self.render_var(o, 4, &mut outputs);
        }
        write!(f, "FunctionGraph({inputs} -> {outputs})")
    }
}

#[derive(Deserialize)]
#[serde(bound(
    deserialize = "O: DeserializeOwned, O::Type: DeserializeOwned, Value<O>: DeserializeOwned"
))]
struct Snapshot<O: Op> {
    arena: Arena<O>,
    inputs: Vec<VarId>,
    outputs: Vec<VarId>,
    variables: OrderedSet<VarId>,
    apply_nodes: OrderedSet<NodeId>,
    clients: OrderedMap<VarId, Vec<Client>>,
    update_mapping: Option<FnvHashMap<VarId, VarId>>,
    config: Config,
    execute_callbacks_time: Duration,
}

#[derive(Serialize)]
#[serde(bound(serialize = "O: Serialize, O::Type: Serialize, Value<O>: Serialize"))]
struct SnapshotRef<'a, O: Op> {
    arena: &'a Arena<O>,
    inputs: &'a Vec<VarId>,
    outputs: &'a Vec<VarId>,
    variables: &'a OrderedSet<VarId>,
    apply_nodes: &'a OrderedSet<NodeId>,
    clients: &'a OrderedMap<VarId, Vec<Client>>,
    update_mapping: &'a Option<FnvHashMap<VarId, VarId>>,
    config: &'a Config,
    execute_callbacks_time: &'a Duration,
}

///
/// Serializes the structural state only: features and the per-feature callback-cost
/// table are dropped, like the journal (a snapshot has no edits to revert).
///
impl<O: Op> Serialize for FunctionGraph<O>
where
    O: Serialize,
    O::Type: Serialize,
    Value<O>: Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SnapshotRef {
            arena: &self.arena,
            inputs: &self.inputs,
            outputs: &self.outputs,
            variables: &self.variables,
            apply_nodes: &self.apply_nodes,
            clients: &self.clients,
            update_mapping: &self.update_mapping,
            config: &self.config,
            execute_callbacks_time: &self.execute_callbacks_time,
        }
        .serialize(serializer)
    }
}

///
/// Restores the structural state and attaches a fresh `ReplaceValidate`. Other features
/// are not part of a snapshot; callers reattach their own instances, whose `on_attach`
/// hooks run as usual.
///
impl<'de, O: Op> Deserialize<'de> for FunctionGraph<O>
where
    O: DeserializeOwned,
    O::Type: DeserializeOwned,
    Value<O>: DeserializeOwned,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let snapshot = Snapshot::<O>::deserialize(deserializer)?;
        let mut graph = FunctionGraph {
            arena: snapshot.arena,
            inputs: snapshot.inputs,
            outputs: snapshot.outputs,
            variables: snapshot.variables,
            apply_nodes: snapshot.apply_nodes,
            clients: snapshot.clients,
            features: Vec::new(),
            journal: Vec::new(),
            update_mapping: snapshot.update_mapping,
            config: snapshot.config,
            execute_callbacks_time: snapshot.execute_callbacks_time,
            execute_callbacks_times: FnvHashMap::default(),
        };
        graph.attach_feature(Arc::new(ReplaceValidate));
        Ok(graph)
    }
}

///
/// Logs at trace level, but only in `cfg(test)`.
///
#[macro_export]
macro_rules! test_trace_log {
    ($($arg:tt)+) => {
      #[cfg(test)]
      {
        log::trace!($($arg)+)
      }
    };
}

#[cfg(test)]
mod tests;
