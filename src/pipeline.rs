//! Async DAG executor.
//!
//! A [`Pipeline`] is a statically declared graph: every node is registered
//! with an explicit list of dependency names, each naming either another
//! node or a pipeline input. [`PipelineBuilder::build`] rejects duplicate
//! names, unresolved dependencies, and cycles before anything runs.
//!
//! # Execution model
//!
//! [`Pipeline::execute`] resolves the transitive closure of the requested
//! nodes and drives them on the calling task with a
//! [`FuturesUnordered`]: every node whose dependencies are satisfied is
//! polled concurrently, so a node suspended on I/O never blocks a sibling
//! branch. A node starts only once all of its dependencies finished
//! (fan-in), and runs exactly once per call regardless of how many
//! dependents it has.
//!
//! The first node error aborts the run. Nodes still in flight are dropped;
//! side effects of nodes that already completed are not rolled back.
//!
//! ```rust
//! use text2sql_harness::pipeline::{Inputs, PipelineBuilder};
//!
//! # tokio_test_block(async {
//! let pipeline = PipelineBuilder::new()
//!     .input("x")
//!     .node("double", &["x"], |inputs| async move {
//!         anyhow::Ok(*inputs.get::<i64>("x")? * 2)
//!     })
//!     .node("plus_one", &["double"], |inputs| async move {
//!         anyhow::Ok(*inputs.get::<i64>("double")? + 1)
//!     })
//!     .build()
//!     .unwrap();
//!
//! let out = pipeline
//!     .execute(&["plus_one"], Inputs::new().with("x", 20i64))
//!     .await
//!     .unwrap();
//! assert_eq!(out.get::<i64>("plus_one"), Some(&41));
//! # });
//! # fn tokio_test_block<F: std::future::Future<Output = ()>>(f: F) {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use crate::error::{Error, Result};

/// A type-erased node result or pipeline input.
pub type Value = Arc<dyn Any + Send + Sync>;

type NodeFn = Arc<dyn Fn(NodeInputs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

struct Node {
    name: String,
    deps: Vec<String>,
    run: NodeFn,
}

/// Values supplied to [`Pipeline::execute`], keyed by input name.
#[derive(Default, Clone)]
pub struct Inputs {
    values: HashMap<String, Value>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Inputs::insert`].
    pub fn with<T: Any + Send + Sync>(mut self, name: &str, value: T) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, name: &str, value: T) {
        self.values.insert(name.to_string(), Arc::new(value));
    }
}

/// The resolved dependency values handed to one node invocation.
pub struct NodeInputs {
    node: String,
    values: HashMap<String, Value>,
}

impl NodeInputs {
    /// Borrow the dependency `name` as a `T`.
    ///
    /// Fails if `name` is not among the node's declared dependencies or
    /// holds a value of another type.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> anyhow::Result<&T> {
        let value = self.values.get(name).ok_or_else(|| {
            anyhow!(
                "node '{}' has no dependency named '{}'",
                self.node,
                name
            )
        })?;
        value.downcast_ref::<T>().ok_or_else(|| {
            anyhow!(
                "node '{}': dependency '{}' is not a {}",
                self.node,
                name,
                std::any::type_name::<T>()
            )
        })
    }
}

/// Results of the requested terminal nodes.
#[derive(Default)]
pub struct Outputs {
    values: HashMap<String, Value>,
}

impl Outputs {
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.values.get(name).and_then(|v| v.downcast_ref::<T>())
    }

    /// Like [`Outputs::get`], but a missing or mistyped output is an error.
    pub fn require<T: Any + Send + Sync>(&self, name: &str) -> Result<&T> {
        self.get(name).ok_or_else(|| Error::MissingDependency {
            node: "outputs".to_string(),
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Declares the nodes and inputs of a [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    nodes: Vec<Node>,
    inputs: BTreeSet<String>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a pipeline input that nodes may depend on.
    pub fn input(mut self, name: &str) -> Self {
        self.inputs.insert(name.to_string());
        self
    }

    /// Register a node. `deps` names other nodes or declared inputs; their
    /// values are available to `f` through [`NodeInputs::get`].
    pub fn node<F, Fut, T>(mut self, name: &str, deps: &[&str], f: F) -> Self
    where
        F: Fn(NodeInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Any + Send + Sync,
    {
        let run: NodeFn = Arc::new(move |inputs: NodeInputs| {
            let fut = f(inputs);
            Box::pin(async move { fut.await.map(|v| Arc::new(v) as Value) })
                as BoxFuture<'static, anyhow::Result<Value>>
        });
        self.nodes.push(Node {
            name: name.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            run,
        });
        self
    }

    /// Validate the graph and freeze it.
    pub fn build(self) -> Result<Pipeline> {
        let mut index = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if self.inputs.contains(&node.name) || index.insert(node.name.clone(), i).is_some() {
                return Err(Error::DuplicateNode(node.name.clone()));
            }
        }

        for node in &self.nodes {
            for dep in &node.deps {
                if !index.contains_key(dep) && !self.inputs.contains(dep) {
                    return Err(Error::MissingDependency {
                        node: node.name.clone(),
                        name: dep.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm over node-to-node edges; whatever never reaches
        // in-degree zero sits on a cycle.
        let mut in_degree: Vec<usize> = self
            .nodes
            .iter()
            .map(|n| n.deps.iter().filter(|d| index.contains_key(*d)).count())
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in &node.deps {
                if let Some(&d) = index.get(dep) {
                    dependents[d].push(i);
                }
            }
        }
        let mut queue: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut visited = 0;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            for &next in &dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        if visited != self.nodes.len() {
            let mut cyclic: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|(_, &d)| d > 0)
                .map(|(i, _)| self.nodes[i].name.clone())
                .collect();
            cyclic.sort();
            return Err(Error::CyclicGraph(cyclic));
        }

        Ok(Pipeline {
            nodes: self.nodes,
            index,
            inputs: self.inputs,
        })
    }
}

/// A validated, immutable pipeline graph. Cheap to share behind an `Arc`
/// and safe to execute concurrently.
pub struct Pipeline {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    inputs: BTreeSet<String>,
}

impl Pipeline {
    /// Node names in registration order.
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// Run the nodes needed for `requested` and return their results.
    pub async fn execute(&self, requested: &[&str], inputs: Inputs) -> Result<Outputs> {
        let closure = self.closure(requested)?;

        let mut results: HashMap<String, Value> = HashMap::new();
        for &i in &closure {
            for dep in &self.nodes[i].deps {
                if self.index.contains_key(dep) {
                    continue;
                }
                let value = inputs.values.get(dep).ok_or_else(|| Error::MissingDependency {
                    node: self.nodes[i].name.clone(),
                    name: dep.clone(),
                })?;
                results.insert(dep.clone(), value.clone());
            }
        }

        let mut pending: HashMap<usize, usize> = HashMap::new();
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for &i in &closure {
            let node_deps: Vec<usize> = self.nodes[i]
                .deps
                .iter()
                .filter_map(|d| self.index.get(d).copied())
                .collect();
            pending.insert(i, node_deps.len());
            for d in node_deps {
                dependents.entry(d).or_default().push(i);
            }
        }

        let mut running = FuturesUnordered::new();
        for &i in &closure {
            if pending[&i] == 0 {
                running.push(self.start(i, &results));
            }
        }

        while let Some((i, outcome)) = running.next().await {
            let name = self.nodes[i].name.clone();
            let value = outcome.map_err(|source| Error::NodeFailed {
                node: name.clone(),
                source,
            })?;
            results.insert(name, value);

            if let Some(next) = dependents.get(&i) {
                for &n in next {
                    let left = pending.entry(n).or_insert(0);
                    *left -= 1;
                    if *left == 0 {
                        running.push(self.start(n, &results));
                    }
                }
            }
        }

        let values = requested
            .iter()
            .filter_map(|r| results.remove(*r).map(|v| (r.to_string(), v)))
            .collect();
        Ok(Outputs { values })
    }

    /// Render the execution graph for `requested` as Graphviz DOT.
    /// Inputs are drawn as boxes, nodes as ellipses, requested nodes bold.
    pub fn to_dot(&self, requested: &[&str]) -> Result<String> {
        let closure = self.closure(requested)?;
        let mut used_inputs = BTreeSet::new();
        let mut dot = String::from("digraph pipeline {\n  rankdir=LR;\n");

        for &i in &closure {
            let node = &self.nodes[i];
            let style = if requested.contains(&node.name.as_str()) {
                ", style=bold"
            } else {
                ""
            };
            let _ = writeln!(dot, "  \"{}\" [shape=ellipse{}];", node.name, style);
            for dep in &node.deps {
                if self.inputs.contains(dep) {
                    used_inputs.insert(dep.clone());
                }
            }
        }
        for input in &used_inputs {
            let _ = writeln!(dot, "  \"{}\" [shape=box];", input);
        }
        for &i in &closure {
            let node = &self.nodes[i];
            for dep in &node.deps {
                let _ = writeln!(dot, "  \"{}\" -> \"{}\";", dep, node.name);
            }
        }
        dot.push_str("}\n");
        Ok(dot)
    }

    /// Transitive dependency closure of `requested`, in registration order.
    fn closure(&self, requested: &[&str]) -> Result<Vec<usize>> {
        let mut seen = HashSet::new();
        let mut stack = Vec::new();
        for name in requested {
            let &i = self.index.get(*name).ok_or_else(|| Error::MissingDependency {
                node: "pipeline".to_string(),
                name: name.to_string(),
            })?;
            stack.push(i);
        }
        while let Some(i) = stack.pop() {
            if !seen.insert(i) {
                continue;
            }
            for dep in &self.nodes[i].deps {
                if let Some(&d) = self.index.get(dep) {
                    stack.push(d);
                }
            }
        }
        let mut closure: Vec<usize> = seen.into_iter().collect();
        closure.sort_unstable();
        Ok(closure)
    }

    fn start(
        &self,
        i: usize,
        results: &HashMap<String, Value>,
    ) -> BoxFuture<'static, (usize, anyhow::Result<Value>)> {
        let node = &self.nodes[i];
        let values = node
            .deps
            .iter()
            .filter_map(|d| results.get(d).map(|v| (d.clone(), v.clone())))
            .collect();
        let fut = (node.run)(NodeInputs {
            node: node.name.clone(),
            values,
        });
        let name = node.name.clone();
        Box::pin(async move {
            let started = Instant::now();
            let outcome = fut.await;
            debug!(
                node = %name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = outcome.is_ok(),
                "pipeline node finished"
            );
            (i, outcome)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_chain_passes_values() {
        let pipeline = PipelineBuilder::new()
            .input("x")
            .node("a", &["x"], |i| async move { anyhow::Ok(*i.get::<i32>("x")? + 1) })
            .node("b", &["a"], |i| async move { anyhow::Ok(*i.get::<i32>("a")? * 10) })
            .node("z", &["b", "x"], |i| async move {
                anyhow::Ok(format!("{}-{}", i.get::<i32>("b")?, i.get::<i32>("x")?))
            })
            .build()
            .unwrap();

        let out = pipeline
            .execute(&["z"], Inputs::new().with("x", 1i32))
            .await
            .unwrap();
        assert_eq!(out.get::<String>("z").unwrap(), "20-1");
        // Intermediate nodes are not returned.
        assert!(!out.contains("a"));
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn test_shared_dependency_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let pipeline = PipelineBuilder::new()
            .node("root", &[], move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(5u32)
                }
            })
            .node("left", &["root"], |i| async move { anyhow::Ok(*i.get::<u32>("root")?) })
            .node("right", &["root"], |i| async move { anyhow::Ok(*i.get::<u32>("root")?) })
            .node("join", &["left", "right"], |i| async move {
                anyhow::Ok(i.get::<u32>("left")? + i.get::<u32>("right")?)
            })
            .build()
            .unwrap();

        let out = pipeline
            .execute(&["join", "left"], Inputs::new())
            .await
            .unwrap();
        assert_eq!(out.get::<u32>("join"), Some(&10));
        assert_eq!(out.get::<u32>("left"), Some(&5));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_upstream_aborts_run() {
        let ran_z = Arc::new(AtomicUsize::new(0));
        let flag = ran_z.clone();
        let pipeline = PipelineBuilder::new()
            .node("a", &[], |_| async move {
                Err::<i32, _>(anyhow!("upstream exploded"))
            })
            .node("b", &["a"], |i| async move { anyhow::Ok(*i.get::<i32>("a")?) })
            .node("z", &["b"], move |i| {
                let flag = flag.clone();
                async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(*i.get::<i32>("b")?)
                }
            })
            .build()
            .unwrap();

        let err = pipeline.execute(&["z"], Inputs::new()).await.err().unwrap();
        assert_eq!(err.failed_node(), Some("a"));
        assert!(err.to_string().contains("upstream exploded"));
        assert_eq!(ran_z.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_independent_nodes_do_not_wait_on_each_other() {
        // `waiter` can only finish after `signaller` ran; a sequential
        // executor that starts `waiter` first would never complete.
        let (tx, rx) = tokio::sync::oneshot::channel::<u8>();
        let rx = Arc::new(Mutex::new(Some(rx)));
        let tx = Arc::new(Mutex::new(Some(tx)));

        let pipeline = PipelineBuilder::new()
            .node("waiter", &[], move |_| {
                let rx = rx.lock().unwrap().take();
                async move {
                    let rx = rx.ok_or_else(|| anyhow!("receiver already taken"))?;
                    anyhow::Ok(rx.await?)
                }
            })
            .node("signaller", &[], move |_| {
                let tx = tx.lock().unwrap().take();
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    if let Some(tx) = tx {
                        let _ = tx.send(7);
                    }
                    Ok(())
                }
            })
            .build()
            .unwrap();

        let out = tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.execute(&["waiter", "signaller"], Inputs::new()),
        )
        .await
        .expect("independent branches deadlocked")
        .unwrap();
        assert_eq!(out.get::<u8>("waiter"), Some(&7));
    }

    #[tokio::test]
    async fn test_missing_input_at_run_time() {
        let pipeline = PipelineBuilder::new()
            .input("mdl_str")
            .node("validate", &["mdl_str"], |i| async move {
                anyhow::Ok(i.get::<String>("mdl_str")?.len())
            })
            .build()
            .unwrap();

        let err = pipeline
            .execute(&["validate"], Inputs::new())
            .await
            .err()
            .unwrap();
        match err {
            Error::MissingDependency { node, name } => {
                assert_eq!(node, "validate");
                assert_eq!(name, "mdl_str");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_requested_node() {
        let pipeline = PipelineBuilder::new()
            .node("a", &[], |_| async move { Ok(()) })
            .build()
            .unwrap();
        let err = pipeline.execute(&["nope"], Inputs::new()).await.err().unwrap();
        assert!(matches!(err, Error::MissingDependency { .. }));
    }

    #[test]
    fn test_build_rejects_unresolved_dependency() {
        let err = PipelineBuilder::new()
            .node("a", &["ghost"], |_| async move { Ok(()) })
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::MissingDependency { ref name, .. } if name == "ghost"));
    }

    #[test]
    fn test_build_rejects_cycle() {
        let err = PipelineBuilder::new()
            .node("a", &["c"], |_| async move { Ok(()) })
            .node("b", &["a"], |_| async move { Ok(()) })
            .node("c", &["b"], |_| async move { Ok(()) })
            .node("free", &[], |_| async move { Ok(()) })
            .build()
            .err()
            .unwrap();
        match err {
            Error::CyclicGraph(nodes) => assert_eq!(nodes, vec!["a", "b", "c"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_build_rejects_duplicates() {
        let err = PipelineBuilder::new()
            .input("a")
            .node("a", &[], |_| async move { Ok(()) })
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::DuplicateNode(ref n) if n == "a"));
    }

    #[test]
    fn test_to_dot_only_includes_closure() {
        let pipeline = PipelineBuilder::new()
            .input("x")
            .node("a", &["x"], |_| async move { Ok(()) })
            .node("b", &["a"], |_| async move { Ok(()) })
            .node("unrelated", &[], |_| async move { Ok(()) })
            .build()
            .unwrap();
        let dot = pipeline.to_dot(&["b"]).unwrap();
        assert!(dot.starts_with("digraph pipeline {"));
        assert!(dot.contains("\"x\" [shape=box];"));
        assert!(dot.contains("\"x\" -> \"a\";"));
        assert!(dot.contains("\"a\" -> \"b\";"));
        assert!(dot.contains("\"b\" [shape=ellipse, style=bold];"));
        assert!(!dot.contains("unrelated"));
    }
}
