//! ComfyUI job descriptors.
//!
//! A job descriptor is the API-format workflow JSON submitted to ComfyUI:
//! an object keyed by node ID where every node carries a `class_type` and
//! an `inputs` map. Inputs are either literal values or links to another
//! node's output slot, encoded as `[source_node_id, output_index]`.
//!
//! [`JobDescriptor`] validates the graph on construction (every link
//! resolves, no cycles) and is otherwise an opaque payload: node semantics
//! are never interpreted beyond the seed override.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::types::NodeId;

/// Maximum serialized descriptor size in bytes (10 MB).
pub const MAX_DESCRIPTOR_JSON_SIZE: usize = 10_000_000;

/// KSampler node class type in ComfyUI.
const KSAMPLER_CLASS: &str = "KSampler";

/// KSampler advanced node class type.
const KSAMPLER_ADVANCED_CLASS: &str = "KSamplerAdvanced";

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// Reference to one output slot of another node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSlot {
    pub node_id: NodeId,
    pub slot: u64,
}

/// A single node input, classified as a literal or a link.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeInput<'a> {
    Literal(&'a Value),
    Link(OutputSlot),
}

/// A single node in a job descriptor.
#[derive(Debug, Clone)]
pub struct JobNode {
    id: NodeId,
    class_type: String,
    inputs: Map<String, Value>,
    /// Any other node fields (`_meta`, etc.), passed through untouched.
    extra: Map<String, Value>,
}

impl JobNode {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Operation kind, e.g. `KSampler` or `SaveImage`.
    pub fn class_type(&self) -> &str {
        &self.class_type
    }

    /// Iterate over inputs in declaration order.
    pub fn inputs(&self) -> impl Iterator<Item = (&str, NodeInput<'_>)> {
        self.inputs.iter().map(|(name, value)| {
            let input = match parse_link(value) {
                Some(slot) => NodeInput::Link(slot),
                None => NodeInput::Literal(value),
            };
            (name.as_str(), input)
        })
    }

    /// Look up a single input by name.
    pub fn input(&self, name: &str) -> Option<NodeInput<'_>> {
        self.inputs().find(|(n, _)| *n == name).map(|(_, i)| i)
    }

    /// All links from this node to upstream nodes.
    pub fn links(&self) -> impl Iterator<Item = OutputSlot> + '_ {
        self.inputs.values().filter_map(parse_link)
    }

    fn to_json(&self) -> Value {
        let mut obj = self.extra.clone();
        obj.insert("class_type".into(), Value::String(self.class_type.clone()));
        obj.insert("inputs".into(), Value::Object(self.inputs.clone()));
        Value::Object(obj)
    }
}

/// A validated, acyclic ComfyUI job graph.
///
/// Node order follows the source JSON. Serializes back to the same
/// node-id keyed object it was parsed from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct JobDescriptor {
    nodes: Vec<JobNode>,
}

impl JobDescriptor {
    /// Parse and validate a descriptor from a JSON value.
    ///
    /// The expected format is an object where each key is a node ID and
    /// each value is an object with `class_type` and `inputs` fields:
    ///
    /// ```json
    /// {
    ///   "3": { "class_type": "KSampler", "inputs": { "seed": 42, "model": ["4", 0] } },
    ///   "4": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "a.safetensors" } }
    /// }
    /// ```
    pub fn from_json(json: &Value) -> Result<Self, CoreError> {
        let obj = json
            .as_object()
            .ok_or_else(|| CoreError::Validation("Job descriptor must be a JSON object".into()))?;

        if obj.is_empty() {
            return Err(CoreError::Validation(
                "Job descriptor must contain at least one node".into(),
            ));
        }

        let mut nodes = Vec::with_capacity(obj.len());
        for (node_id, node_value) in obj {
            nodes.push(parse_node(node_id, node_value)?);
        }

        let descriptor = Self { nodes };
        descriptor.validate_links()?;
        descriptor.validate_acyclic()?;
        Ok(descriptor)
    }

    /// Parse and validate a descriptor from raw JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, CoreError> {
        if text.len() > MAX_DESCRIPTOR_JSON_SIZE {
            return Err(CoreError::Validation(format!(
                "Job descriptor exceeds maximum size of {MAX_DESCRIPTOR_JSON_SIZE} bytes (got {} bytes)",
                text.len()
            )));
        }
        let json: Value = serde_json::from_str(text)
            .map_err(|e| CoreError::Validation(format!("Job descriptor is not valid JSON: {e}")))?;
        Self::from_json(&json)
    }

    /// Serialize back into the node-id keyed object ComfyUI expects.
    pub fn to_json(&self) -> Value {
        let obj: Map<String, Value> = self
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.to_json()))
            .collect();
        Value::Object(obj)
    }

    pub fn nodes(&self) -> &[JobNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&JobNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Replace the sampler seed on every KSampler node.
    ///
    /// `KSampler` carries it in `seed`, `KSamplerAdvanced` in `noise_seed`.
    /// Returns the number of nodes updated. Consumes `self` because a
    /// descriptor is immutable once handed to a submission.
    pub fn with_seed(mut self, seed: u64) -> (Self, usize) {
        let mut updated = 0;
        for node in &mut self.nodes {
            let field = match node.class_type.as_str() {
                KSAMPLER_CLASS => "seed",
                KSAMPLER_ADVANCED_CLASS => "noise_seed",
                _ => continue,
            };
            node.inputs.insert(field.into(), Value::from(seed));
            updated += 1;
        }
        (self, updated)
    }

    // ---- private helpers ----

    fn validate_links(&self) -> Result<(), CoreError> {
        for node in &self.nodes {
            for (input_name, input) in node.inputs() {
                if let NodeInput::Link(slot) = input {
                    if self.node(&slot.node_id).is_none() {
                        return Err(CoreError::Validation(format!(
                            "Node '{}' input '{input_name}' references unknown node '{}'",
                            node.id, slot.node_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Depth-first search with three-colour marking.
    fn validate_acyclic(&self) -> Result<(), CoreError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let index: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];

        for start in 0..self.nodes.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            // Explicit stack of (node index, upstream indices) to avoid
            // recursion depth limits on large graphs.
            let mut stack: Vec<(usize, Vec<usize>)> = vec![(start, self.upstream(start, &index))];
            marks[start] = Mark::InProgress;

            while let Some(top) = stack.last_mut() {
                let current = top.0;
                match top.1.pop() {
                    Some(next) => match marks[next] {
                        Mark::InProgress => {
                            return Err(CoreError::Validation(format!(
                                "Job descriptor contains a cycle through node '{}'",
                                self.nodes[next].id
                            )));
                        }
                        Mark::Unvisited => {
                            marks[next] = Mark::InProgress;
                            let upstream = self.upstream(next, &index);
                            stack.push((next, upstream));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[current] = Mark::Done;
                        stack.pop();
                    }
                }
            }
        }
        Ok(())
    }

    fn upstream(&self, i: usize, index: &HashMap<&str, usize>) -> Vec<usize> {
        self.nodes[i]
            .links()
            .filter_map(|slot| index.get(slot.node_id.as_str()).copied())
            .collect()
    }
}

impl TryFrom<Value> for JobDescriptor {
    type Error = CoreError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_json(&value)
    }
}

impl From<JobDescriptor> for Value {
    fn from(descriptor: JobDescriptor) -> Self {
        descriptor.to_json()
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn parse_node(node_id: &str, node_value: &Value) -> Result<JobNode, CoreError> {
    let node_obj = node_value
        .as_object()
        .ok_or_else(|| CoreError::Validation(format!("Node '{node_id}' must be a JSON object")))?;

    let class_type = node_obj
        .get("class_type")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            CoreError::Validation(format!(
                "Node '{node_id}' is missing required 'class_type' field"
            ))
        })?
        .to_string();

    let inputs = match node_obj.get("inputs") {
        None => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(CoreError::Validation(format!(
                "Node '{node_id}' has non-object 'inputs'"
            )))
        }
    };

    let extra = node_obj
        .iter()
        .filter(|(k, _)| k.as_str() != "class_type" && k.as_str() != "inputs")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(JobNode {
        id: node_id.to_string(),
        class_type,
        inputs,
        extra,
    })
}

/// ComfyUI encodes links as `[source_node_id, output_index]`, with the
/// node ID given as either a string or an integer.
fn parse_link(value: &Value) -> Option<OutputSlot> {
    let arr = value.as_array()?;
    if arr.len() != 2 {
        return None;
    }
    let node_id = match &arr[0] {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_u64() => n.to_string(),
        _ => return None,
    };
    let slot = arr[1].as_u64()?;
    Some(OutputSlot { node_id, slot })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
