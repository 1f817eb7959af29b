use crate::{
    layer::Forward,
    tensor::{reduce_to, ArcTensor, ArcTensorD},
};
use anyhow::{anyhow, ensure, Result};
use ndarray::{arr0, Array, Dimension, Ix0, Ix1, Ix2, Ix4, IxDyn, ShapeError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    marker::PhantomData,
    sync::{Arc, Weak},
};

/// Builders.
pub mod builder {
    use super::*;

    /// VariableBuilder.
    ///
    ///```no_run
    /// # use cascaded_gaze::{result::Result, tensor::ArcTensor2, autograd::{Variable, Variable2}};
    /// # let input: Variable2 = todo!();
    /// let mut builder = Variable::builder();
    /// if let Some(node) = input.node() {
    ///     // Add an edge computing the input gradient from the output gradient.
    ///     builder.edge(node, |output_grad: ArcTensor2| -> Result<ArcTensor2> { todo!() });
    /// }
    /// let output_value: ArcTensor2 = todo!();
    /// # let _ = {
    /// builder.build(output_value)
    /// # };
    ///```
    pub struct VariableBuilder<D: Dimension> {
        grad: Option<Arc<RwLock<Option<ArcTensorD>>>>,
        edges: Vec<EdgeInner>,
        _m: PhantomData<D>,
    }

    impl<D: Dimension> VariableBuilder<D> {
        pub(super) fn new() -> Self {
            Self {
                grad: None,
                edges: Vec::new(),
                _m: PhantomData,
            }
        }
        /// Adds a node.
        ///
        /// Ensures a node is created even if edges are not added, so that the gradient of the
        /// variable can be inspected after the backward pass.
        pub fn node(mut self) -> Self {
            if self.grad.is_none() {
                self.grad.replace(Arc::new(RwLock::default()));
            }
            self
        }
        /// Adds an edge.
        ///
        /// During the backward pass, for each edge to `node`, `f` computes the gradient of `node`
        /// given the gradient of `self`.
        /// When multiple edges compute the same gradient, they are added together.
        /// Once there are no more edges needed to compute a gradient for a node, its edges can
        /// be computed.
        pub fn edge<D2, F>(&mut self, node: &Node<D2>, f: F)
        where
            D2: Dimension,
            F: FnOnce(ArcTensor<D>) -> Result<ArcTensor<D2>> + Send + Sync + 'static,
        {
            let output_grad_lock = self
                .grad
                .get_or_insert_with(|| Arc::new(RwLock::default()))
                .clone();
            let mut output_grad_lock = Some(output_grad_lock);
            let node = node.inner.clone();
            let mut input_grad_lock = Arc::downgrade(&node.grad);
            let dim = node.dim.clone();
            let name = std::any::type_name::<F>();
            let mut f = Some(f);
            let op = Box::new(move || {
                let input_grad_lock = Weak::upgrade(&std::mem::take(&mut input_grad_lock));
                if let Some((f, (input_grad_lock, output_grad_lock))) =
                    f.take().zip(input_grad_lock.zip(output_grad_lock.take()))
                {
                    log::trace!("backward {name}");
                    let grad = output_grad_lock
                        .read()
                        .clone()
                        .ok_or_else(|| anyhow!("{name} has no output gradient!"))?
                        .into_dimensionality::<D>()?;
                    std::mem::drop(output_grad_lock);
                    let grad = (f)(grad)?;
                    ensure!(
                        grad.shape() == dim.slice(),
                        "{name} computed gradient {:?}, expected {:?}!",
                        grad.shape(),
                        dim.slice()
                    );
                    let mut guard = input_grad_lock.write();
                    if let Some(input_grad) = guard.as_mut() {
                        input_grad.zip_mut_with(&grad, |a, b| *a += *b);
                    } else {
                        guard.replace(grad.into_dyn());
                    }
                }
                Ok(())
            });
            self.edges.push(EdgeInner { name, op, node })
        }
        /// Builds the variable with `value`.
        pub fn build(self, value: ArcTensor<D>) -> Variable<D> {
            let node = self
                .grad
                .map(|grad| Node::new(value.raw_dim().into_dyn(), grad, self.edges));
            Variable { value, node }
        }
    }
}
use builder::*;

struct EdgeInner {
    name: &'static str,
    op: Box<dyn FnMut() -> Result<()> + Send + Sync + 'static>,
    node: Arc<NodeInner>,
}

impl Debug for EdgeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeInner")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish()
    }
}

#[derive(Debug)]
struct NodeInner {
    dim: IxDyn,
    grad: Arc<RwLock<Option<ArcTensorD>>>,
    edges: Mutex<Vec<EdgeInner>>,
}

impl NodeInner {
    fn ready(&self) -> bool {
        Arc::weak_count(&self.grad) == 0
    }
}

/// Node.
///
/// Nodes store gradients and can be connected via [`VariableBuilder::edge()`] to
/// form a graph that is traversed in [`.backward()`](Node::backward).
#[derive(Clone, Debug)]
pub struct Node<D: Dimension> {
    inner: Arc<NodeInner>,
    _m: PhantomData<D>,
}

impl<D: Dimension> Node<D> {
    fn new(dim: IxDyn, grad: Arc<RwLock<Option<ArcTensorD>>>, edges: Vec<EdgeInner>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                dim,
                grad,
                edges: Mutex::new(edges),
            }),
            _m: PhantomData,
        }
    }
    /// The gradient.
    pub fn grad(&self) -> Option<ArcTensor<D>> {
        self.inner.grad.read().clone()?.into_dimensionality().ok()
    }
    /// Executes the backward pass, starting from a gradient of ones.
    pub fn backward(&self) -> Result<()> {
        let grad = ArcTensorD::ones(self.inner.dim.clone()).into_dimensionality::<D>()?;
        self.backward_grad(grad)
    }
    /// Executes the backward pass with `grad`.
    ///
    /// Does nothing if the node already has a gradient.
    pub fn backward_grad(&self, grad: ArcTensor<D>) -> Result<()> {
        ensure!(
            grad.shape() == self.inner.dim.slice(),
            "Expected gradient {:?}, found {:?}!",
            self.inner.dim.slice(),
            grad.shape()
        );
        {
            let mut guard = self.inner.grad.write();
            if guard.is_some() {
                return Ok(());
            }
            guard.replace(grad.into_dyn());
        }
        let mut queue = VecDeque::new();
        queue.push_back(self.inner.clone());
        while let Some(node) = queue.pop_front() {
            let edges = std::mem::take(&mut *node.edges.lock());
            std::mem::drop(node);
            for mut edge in edges {
                (edge.op)()?;
                let node = edge.node;
                if node.ready() {
                    queue.push_back(node)
                }
            }
        }
        Ok(())
    }
    fn into_dimensionality<D2: Dimension>(self) -> Node<D2> {
        Node {
            inner: self.inner,
            _m: PhantomData,
        }
    }
}

/// Variable.
///
/// Variables are tensors with an optional [`Node`] that stores a gradient. Operations
/// on variables with a node create a graph of edges that is traversed during the backward pass
/// to compute the gradients.
///
/// Variables can be created from arrays via [`From`], these do not have a node.
/// Use [`builder()`](Variable::builder) to create a Variable as a function of another variable.
#[derive(Clone, Debug)]
pub struct Variable<D: Dimension> {
    value: ArcTensor<D>,
    node: Option<Node<D>>,
}

/// Variable with 1 element
pub type Variable0 = Variable<Ix0>;
/// Variable with 1 dimension
pub type Variable1 = Variable<Ix1>;
/// Variable with 2 dimensions
pub type Variable2 = Variable<Ix2>;
/// Variable with 4 dimensions
pub type Variable4 = Variable<Ix4>;
/// Variable with dynamic dimensions
pub type VariableD = Variable<IxDyn>;

impl<D: Dimension> Variable<D> {
    /// A `VariableBuilder` for creating nodes and edges.
    pub fn builder() -> VariableBuilder<D> {
        VariableBuilder::new()
    }
    /// The value of the variable.
    pub fn value(&self) -> &ArcTensor<D> {
        &self.value
    }
    /// Converts the variable into a tensor.
    pub fn into_value(self) -> ArcTensor<D> {
        self.value
    }
    /// The node.
    pub fn node(&self) -> Option<&Node<D>> {
        self.node.as_ref()
    }
    /// The gradient, if the variable has a node and the backward pass reached it.
    pub fn grad(&self) -> Option<ArcTensor<D>> {
        self.node.as_ref()?.grad()
    }
    /// Maps the variable with `F`.
    ///
    /// Shortcut for `f.forward(self)`. This allows chaining methods together.
    pub fn forward<F: Forward<Self>>(self, f: &F) -> Result<F::Output> {
        f.forward(self)
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim in pattern form.
    pub fn dim(&self) -> D::Pattern {
        self.value.dim()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// Converts into dimensionality `D2`.
    pub fn into_dimensionality<D2>(self) -> Result<Variable<D2>, ShapeError>
    where
        D2: Dimension,
    {
        let value = self.value.into_dimensionality()?;
        Ok(Variable {
            value,
            node: self.node.map(Node::into_dimensionality),
        })
    }
    /// Converts into a dynamic dimensional variable.
    pub fn into_dyn(self) -> VariableD {
        Variable {
            value: self.value.into_dyn(),
            node: self.node.map(Node::into_dimensionality),
        }
    }
}

impl<D: Dimension + 'static> Variable<D> {
    fn check_broadcast<D2: Dimension>(&self, rhs: &Variable<D2>) -> Result<()> {
        ensure!(
            rhs.value.broadcast(self.raw_dim()).is_some(),
            "Can not broadcast {:?} -> {:?}!",
            rhs.shape(),
            self.shape()
        );
        Ok(())
    }
    /// Adds `rhs`, broadcasting it to the shape of `self`.
    ///
    /// **Errors**
    ///
    /// If `rhs` can not be broadcasted.
    pub fn add<D2: Dimension + 'static>(&self, rhs: &Variable<D2>) -> Result<Self> {
        self.check_broadcast(rhs)?;
        let mut value = self.value.to_owned();
        value.zip_mut_with(&rhs.value, |a, b| *a += *b);
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, Ok);
        }
        if let Some(node) = rhs.node() {
            let dim = rhs.raw_dim();
            builder.edge(node, move |output_grad: ArcTensor<D>| {
                Ok(reduce_to(output_grad.view().into_dyn(), dim)?.into_shared())
            });
        }
        Ok(builder.build(value.into_shared()))
    }
    /// Multiplies by `rhs` elementwise, broadcasting it to the shape of `self`.
    ///
    /// **Errors**
    ///
    /// If `rhs` can not be broadcasted.
    pub fn mul<D2: Dimension + 'static>(&self, rhs: &Variable<D2>) -> Result<Self> {
        self.check_broadcast(rhs)?;
        let mut value = self.value.to_owned();
        value.zip_mut_with(&rhs.value, |a, b| *a *= *b);
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let rhs = rhs.value.clone();
            builder.edge(node, move |output_grad: ArcTensor<D>| {
                let mut input_grad = output_grad.into_owned();
                input_grad.zip_mut_with(&rhs, |a, b| *a *= *b);
                Ok(input_grad.into_shared())
            });
        }
        if let Some(node) = rhs.node() {
            let lhs = self.value.clone();
            let dim = rhs.raw_dim();
            builder.edge(node, move |output_grad: ArcTensor<D>| {
                let mut product = output_grad.into_owned();
                product.zip_mut_with(&lhs, |a, b| *a *= *b);
                Ok(reduce_to(product.view().into_dyn(), dim)?.into_shared())
            });
        }
        Ok(builder.build(value.into_shared()))
    }
    /// Sums all elements.
    pub fn sum(&self) -> Variable0 {
        let mut builder = Variable::builder();
        if let Some(node) = self.node() {
            let dim = self.raw_dim();
            builder.edge(node, move |output_grad: ArcTensor<Ix0>| {
                Ok(Array::from_elem(dim, output_grad[()]).into_shared())
            });
        }
        builder.build(arr0(self.value.sum()).into_shared())
    }
    /// The mean of all elements.
    pub fn mean(&self) -> Variable0 {
        let len = self.value.len().max(1) as f32;
        let mut builder = Variable::builder();
        if let Some(node) = self.node() {
            let dim = self.raw_dim();
            builder.edge(node, move |output_grad: ArcTensor<Ix0>| {
                Ok(Array::from_elem(dim, output_grad[()] / len).into_shared())
            });
        }
        builder.build(arr0(self.value.sum() / len).into_shared())
    }
}

impl Variable0 {
    /// Executes the backward pass.
    ///
    /// See [`Node::backward`].
    pub fn backward(&self) -> Result<()> {
        if let Some(node) = self.node.as_ref() {
            node.backward()?;
        }
        Ok(())
    }
}

impl<D: Dimension> From<Array<f32, D>> for Variable<D> {
    fn from(array: Array<f32, D>) -> Self {
        Self::from(array.into_shared())
    }
}

impl<D: Dimension> From<ArcTensor<D>> for Variable<D> {
    fn from(tensor: ArcTensor<D>) -> Self {
        Self {
            value: tensor,
            node: None,
        }
    }
}

/// Parameter.
///
/// A Parameter can be converted to a [`Variable`] via [`.to_variable()`](Parameter::to_variable),
/// which allows it to be used in operations.
/// During training, [`.set_training(true)`](Parameter::set_training) ensures that
/// the variable created from this parameter has a [`Node`], the gradients of every such variable
/// are accumulated into the parameter.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound(serialize = "D: Serialize", deserialize = "D: Deserialize<'de>"))]
pub struct Parameter<D: Dimension> {
    value: ArcTensor<D>,
    #[serde(skip)]
    grad: Option<Arc<RwLock<Option<ArcTensorD>>>>,
}

/// Parameter with dynamic dimensions.
pub type ParameterD = Parameter<IxDyn>;

impl<D: Dimension> Parameter<D> {
    /// The value of the parameter.
    pub fn value(&self) -> &ArcTensor<D> {
        &self.value
    }
    /// Replaces the value.
    ///
    /// **Errors**
    ///
    /// If the shape of `value` differs.
    pub fn set_value(&mut self, value: impl Into<ArcTensor<D>>) -> Result<()> {
        let value = value.into();
        ensure!(
            value.shape() == self.shape(),
            "Expected parameter {:?}, found {:?}!",
            self.shape(),
            value.shape()
        );
        self.value = value;
        Ok(())
    }
    /// The gradient of the parameter.
    pub fn grad(&self) -> Option<ArcTensor<D>> {
        self.grad
            .as_ref()?
            .read()
            .clone()?
            .into_dimensionality()
            .ok()
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// The number of elements.
    pub fn len(&self) -> usize {
        self.value.len()
    }
    /// Whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
    /// Enables / disables training.
    ///
    /// If `training`, ensures that when the parameter is converted to a [`Variable`],
    /// it will have a [`Node`] for computing a gradient.
    /// If `training` is false, discards any gradient that has been computed.
    pub fn set_training(&mut self, training: bool) {
        if training && self.grad.is_none() {
            self.grad.replace(Arc::new(RwLock::default()));
        } else if !training {
            self.grad = None;
        }
    }
    /// Whether gradients are tracked.
    pub fn is_training(&self) -> bool {
        self.grad.is_some()
    }
    /// Converts to a `Variable`.
    pub fn to_variable(&self) -> Variable<D> {
        let value = self.value.clone();
        let node = self
            .grad
            .as_ref()
            .map(|grad| Node::new(value.raw_dim().into_dyn(), grad.clone(), Vec::new()));
        Variable { value, node }
    }
    /// Converts into dimensionality `D2`.
    pub fn into_dimensionality<D2>(self) -> Result<Parameter<D2>, ShapeError>
    where
        D2: Dimension,
    {
        Ok(Parameter {
            value: self.value.into_dimensionality()?,
            grad: self.grad,
        })
    }
    /// Converts into a dynamic dimensional parameter.
    pub fn into_dyn(self) -> ParameterD {
        Parameter {
            value: self.value.into_dyn(),
            grad: self.grad,
        }
    }
}

impl<D: Dimension> From<Array<f32, D>> for Parameter<D> {
    fn from(array: Array<f32, D>) -> Self {
        Self::from(array.into_shared())
    }
}

impl<D: Dimension> From<ArcTensor<D>> for Parameter<D> {
    fn from(tensor: ArcTensor<D>) -> Self {
        Self {
            value: tensor,
            grad: None,
        }
    }
}
