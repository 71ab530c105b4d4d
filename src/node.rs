// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::{Debug, Display};
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::FunctionGraph;

///
/// A handle to a `Variable` in an `Arena`.
///
/// 2^32 variables ought to be more than enough for anyone!
///
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct VarId(pub(crate) u32);

///
/// A handle to an `ApplyNode` in an `Arena`.
///
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(pub(crate) u32);

impl VarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

///
/// A use site of a variable: either the `i`th input slot of an apply node, or the `i`th
/// slot of the graph's output list.
///
/// The `clients` table of a `FunctionGraph` maps each member variable to the list of its
/// use sites, with one entry per occurrence.
///
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Client {
    Node(NodeId, usize),
    Output(usize),
}

///
/// The literal/test value type of an `Op`'s variable type.
///
pub type Value<O> = <<O as Op>::Type as VarType>::Value;

///
/// The type carried by every variable. Opaque to the container apart from equality,
/// coercion, and the hooks below.
///
pub trait VarType: Clone + Debug + Display + PartialEq + Send + Sync + Sized + 'static {
    ///
    /// Literal values for constants and test values.
    ///
    type Value: Clone + Debug + Send + Sync + 'static;

    ///
    /// The op catalog this type belongs to.
    ///
    /// To coerce a variable, `filter_variable` may need to build conversion nodes, so a
    /// type and its op catalog reference one another (cf. how a graph `Node` and its
    /// `NodeContext` are mutually constrained).
    ///
    type Op: Op<Type = Self>;

    ///
    /// Coerce `var` to this type, or fail with a description of the mismatch.
    ///
    /// Implementations may build conversion nodes in the graph's arena when
    /// `allow_convert` is true; the returned variable is imported by the caller. The
    /// default accepts only an exact type match.
    ///
    fn filter_variable(
        &self,
        graph: &mut FunctionGraph<Self::Op>,
        var: VarId,
        allow_convert: bool,
    ) -> Result<VarId, String> {
        let _ = allow_convert;
        let actual = graph.arena().var(var).ty();
        if actual == self {
            Ok(var)
        } else {
            Err(format!(
                "cannot use a variable of type {actual} where a variable of type {self} is expected"
            ))
        }
    }

    ///
    /// When this type is the poisoned sentinel produced by a failed rewrite, returns the
    /// reason. Importing a rootless variable of such a type is an error even with
    /// `import_missing`.
    ///
    fn why_null(&self) -> Option<&str> {
        None
    }

    ///
    /// The shape attribute of a value, compared between the test values of a variable and
    /// its replacement. `None` means the value carries no shape.
    ///
    fn value_shape(value: &Self::Value) -> Option<Vec<usize>> {
        let _ = value;
        None
    }
}

///
/// An operation descriptor. Opaque to the container apart from identity and the two
/// aliasing maps.
///
/// Both maps associate an output index with the input indices the output aliases
/// (`view_map`) or overwrites (`destroy_map`). Every index must be in range for the
/// arity of the node the op is applied at; `FunctionGraph` validates this at import.
///
pub trait Op: Clone + Debug + Display + Eq + Hash + Send + Sync + 'static {
    type Type: VarType<Op = Self>;

    fn view_map(&self) -> Vec<(usize, Vec<usize>)> {
        Vec::new()
    }

    fn destroy_map(&self) -> Vec<(usize, Vec<usize>)> {
        Vec::new()
    }
}

///
/// Mutable audit metadata attached to every apply node. The container appends the
/// `reason` of each import and prune so that a mis-rewritten graph can be traced back to
/// the pass that touched it.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Tag {
    pub imported_by: Vec<String>,
    pub removed_by: Vec<String>,
}

///
/// A value node: a graph input, a constant, or the output of an apply node.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound(
    serialize = "O::Type: Serialize, Value<O>: Serialize",
    deserialize = "O::Type: serde::de::DeserializeOwned, Value<O>: serde::de::DeserializeOwned"
))]
pub struct Variable<O: Op> {
    pub(crate) ty: O::Type,
    pub(crate) owner: Option<(NodeId, usize)>,
    pub(crate) value: Option<Value<O>>,
    pub(crate) name: Option<String>,
    pub(crate) test_value: Option<Value<O>>,
    pub(crate) trace: Option<String>,
}

impl<O: Op> Variable<O> {
    pub fn ty(&self) -> &O::Type {
        &self.ty
    }

    ///
    /// The node that produced this variable and this variable's index in its outputs, or
    /// `None` for inputs, constants, and orphans.
    ///
    pub fn owner(&self) -> Option<(NodeId, usize)> {
        self.owner
    }

    pub fn is_constant(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<&Value<O>> {
        self.value.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn test_value(&self) -> Option<&Value<O>> {
        self.test_value.as_ref()
    }

    ///
    /// The construction site of this variable, captured for missing-input diagnostics.
    ///
    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }
}

///
/// An operation instance: an op applied to an ordered list of input variables, producing
/// an ordered list of output variables.
///
/// The input slots are the only part of a node the container ever rewrites in place.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound(
    serialize = "O: Serialize",
    deserialize = "O: serde::de::DeserializeOwned"
))]
pub struct ApplyNode<O: Op> {
    pub(crate) op: O,
    pub(crate) inputs: Vec<VarId>,
    pub(crate) outputs: Vec<VarId>,
    pub(crate) tag: Tag,
}

impl<O: Op> ApplyNode<O> {
    pub fn op(&self) -> &O {
        &self.op
    }

    pub fn inputs(&self) -> &[VarId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[VarId] {
        &self.outputs
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub(crate) fn set_input(&mut self, i: usize, var: VarId) {
        self.inputs[i] = var;
    }

    pub(crate) fn tag_mut(&mut self) -> &mut Tag {
        &mut self.tag
    }
}
