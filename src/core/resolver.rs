//! OF-003: Reference resolution and dependency DAG construction.
//!
//! Resolves `{{params.key}}`, `{{resources.id.attr}}` and `{{data.id.attr}}`
//! references inside resource specs. A string that is exactly one reference
//! takes the referenced value's type, so ids stay numeric. Builds a DAG from
//! explicit depends_on edges plus reference edges and computes topological
//! order using Kahn's algorithm with deterministic (alphabetical)
//! tie-breaking.

use super::types::*;
use crate::error::{Error, Result};
use indexmap::IndexMap;
use regex::Regex;
use serde_yaml_ng::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

fn reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
            .expect("invalid reference regex")
    })
}

/// What a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Param,
    Resource,
    Data,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Param => write!(f, "param"),
            Self::Resource => write!(f, "resource"),
            Self::Data => write!(f, "data source"),
        }
    }
}

/// A parsed `{{scope.name.path}}` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    pub scope: Scope,
    pub name: String,
    /// Attribute path below the named object (empty for params)
    pub path: Vec<String>,
}

impl Reference {
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.split('.');
        let bad = || Error::Resolve(format!("invalid reference '{{{{{}}}}}'", text));
        let scope = match parts.next() {
            Some("params") => Scope::Param,
            Some("resources") => Scope::Resource,
            Some("data") => Scope::Data,
            _ => return Err(bad()),
        };
        let name = parts.next().ok_or_else(bad)?.to_string();
        let path: Vec<String> = parts.map(str::to_string).collect();
        if scope != Scope::Param && path.is_empty() {
            return Err(bad());
        }
        Ok(Self { scope, name, path })
    }
}

/// Values references resolve against.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    pub params: IndexMap<String, Value>,
    /// Attributes of resources already applied (or read from the lock)
    pub resources: IndexMap<String, Attributes>,
    pub data: IndexMap<String, Attributes>,
}

impl ResolveContext {
    pub fn new(params: IndexMap<String, Value>) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    fn lookup(&self, reference: &Reference) -> Result<Value> {
        let (root, path) = match reference.scope {
            Scope::Param => {
                let value = self.params.get(&reference.name).ok_or_else(|| {
                    Error::Resolve(format!("unknown param: {}", reference.name))
                })?;
                return descend(value, &reference.path, &reference.name);
            }
            Scope::Resource => (
                self.resources.get(&reference.name).ok_or_else(|| {
                    Error::Resolve(format!(
                        "resource '{}' has no attributes yet",
                        reference.name
                    ))
                })?,
                &reference.path,
            ),
            Scope::Data => (
                self.data.get(&reference.name).ok_or_else(|| {
                    Error::Resolve(format!("data source '{}' was not looked up", reference.name))
                })?,
                &reference.path,
            ),
        };
        let (first, rest) = path
            .split_first()
            .ok_or_else(|| Error::Resolve(format!("'{}' needs an attribute", reference.name)))?;
        let value = root.get(first).ok_or_else(|| {
            Error::Resolve(format!("'{}' has no attribute '{}'", reference.name, first))
        })?;
        descend(value, rest, &format!("{}.{}", reference.name, first))
    }
}

fn descend(value: &Value, path: &[String], what: &str) -> Result<Value> {
    let mut current = value;
    let mut seen = what.to_string();
    for segment in path {
        current = match current {
            Value::Mapping(map) => map.get(segment.as_str()),
            Value::Sequence(seq) => segment.parse::<usize>().ok().and_then(|i| seq.get(i)),
            _ => None,
        }
        .ok_or_else(|| Error::Resolve(format!("'{}' has no '{}'", seen, segment)))?;
        seen = format!("{}.{}", seen, segment);
    }
    Ok(current.clone())
}

/// Resolve every reference inside a value.
pub fn resolve_value(value: &Value, ctx: &ResolveContext) -> Result<Value> {
    match value {
        Value::String(s) => resolve_string(s, ctx),
        Value::Sequence(seq) => seq
            .iter()
            .map(|v| resolve_value(v, ctx))
            .collect::<Result<Vec<_>>>()
            .map(Value::Sequence),
        Value::Mapping(map) => {
            let mut out = serde_yaml_ng::Mapping::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, ctx)?);
            }
            Ok(Value::Mapping(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, ctx: &ResolveContext) -> Result<Value> {
    let re = reference_re();
    if let Some(caps) = re.captures(s) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(s.len()) {
            return ctx.lookup(&Reference::parse(&caps[1])?);
        }
    } else {
        if s.contains("{{") {
            return Err(Error::Resolve(format!("malformed reference in \"{}\"", s)));
        }
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in re.captures_iter(s) {
        let whole = caps.get(0).ok_or_else(|| Error::Resolve(s.to_string()))?;
        out.push_str(&s[last..whole.start()]);
        let value = ctx.lookup(&Reference::parse(&caps[1])?)?;
        out.push_str(&yaml_value_to_string(&value));
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

/// Resolve every attribute of a spec.
pub fn resolve_spec(spec: &Spec, ctx: &ResolveContext) -> Result<Spec> {
    spec.iter()
        .map(|(k, v)| resolve_value(v, ctx).map(|v| (k.clone(), v)))
        .collect()
}

fn collect_references(value: &Value, out: &mut BTreeSet<Reference>) -> Result<()> {
    match value {
        Value::String(s) => {
            for caps in reference_re().captures_iter(s) {
                out.insert(Reference::parse(&caps[1])?);
            }
        }
        Value::Sequence(seq) => {
            for v in seq {
                collect_references(v, out)?;
            }
        }
        Value::Mapping(map) => {
            for v in map.values() {
                collect_references(v, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// All references in a spec, sorted and deduplicated.
pub fn references(spec: &Spec) -> Result<Vec<Reference>> {
    let mut out = BTreeSet::new();
    for value in spec.values() {
        collect_references(value, &mut out)?;
    }
    Ok(out.into_iter().collect())
}

/// Resources a spec refers to.
pub fn implicit_dependencies(spec: &Spec) -> Result<Vec<String>> {
    let mut deps: Vec<String> = references(spec)?
        .into_iter()
        .filter(|r| r.scope == Scope::Resource)
        .map(|r| r.name)
        .collect();
    deps.dedup();
    Ok(deps)
}

/// Explicit plus reference-derived dependencies of a resource.
pub fn all_dependencies(resource: &ResourceDecl) -> Result<Vec<String>> {
    let mut deps = resource.depends_on.clone();
    for dep in implicit_dependencies(&resource.spec)? {
        if !deps.contains(&dep) {
            deps.push(dep);
        }
    }
    Ok(deps)
}

/// Kahn's algorithm with sorted tie-breaking over `edges` (node → its deps).
fn kahn(nodes: &[String], edges: &HashMap<String, Vec<String>>) -> (Vec<String>, Vec<String>) {
    let mut in_degree: HashMap<&str, usize> = nodes.iter().map(|n| (n.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in nodes {
        for dep in edges.get(node).into_iter().flatten() {
            if !in_degree.contains_key(dep.as_str()) {
                continue;
            }
            adjacency.entry(dep.as_str()).or_default().push(node.as_str());
            if let Some(degree) = in_degree.get_mut(node.as_str()) {
                *degree += 1;
            }
        }
    }

    let mut zero_degree: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(id, _)| *id)
        .collect();
    zero_degree.sort();
    let mut queue: VecDeque<&str> = zero_degree.into_iter().collect();

    let mut order = Vec::new();
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());
        let mut next_ready: Vec<&str> = Vec::new();
        for neighbor in adjacency.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(neighbor) {
                *degree -= 1;
                if *degree == 0 {
                    next_ready.push(*neighbor);
                }
            }
        }
        next_ready.sort();
        queue.extend(next_ready);
    }

    let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
    let mut remaining: Vec<String> = nodes
        .iter()
        .filter(|n| !ordered.contains(n.as_str()))
        .cloned()
        .collect();
    remaining.sort();
    (order, remaining)
}

/// Build a topological execution order from resource dependencies.
/// Uses Kahn's algorithm with alphabetical tie-breaking for determinism.
pub fn build_execution_order(decl: &Declaration) -> Result<Vec<String>> {
    let nodes: Vec<String> = decl.resources.keys().cloned().collect();
    let mut edges: HashMap<String, Vec<String>> = HashMap::new();
    for (id, resource) in &decl.resources {
        let deps = all_dependencies(resource)?;
        for dep in &deps {
            if !decl.resources.contains_key(dep) {
                return Err(Error::Resolve(format!(
                    "resource '{}' depends on unknown '{}'",
                    id, dep
                )));
            }
        }
        edges.insert(id.clone(), deps);
    }

    let (order, cycle_members) = kahn(&nodes, &edges);
    if !cycle_members.is_empty() {
        return Err(Error::Resolve(format!(
            "dependency cycle detected involving: {}",
            cycle_members.join(", ")
        )));
    }
    Ok(order)
}

/// Order in which locked resources are destroyed: dependents first.
pub fn destroy_order(lock: &StateLock, ids: &[String]) -> Vec<String> {
    let edges: HashMap<String, Vec<String>> = ids
        .iter()
        .filter_map(|id| lock.resources.get(id).map(|r| (id.clone(), r.depends_on.clone())))
        .collect();
    let (mut order, remaining) = kahn(ids, &edges);
    order.extend(remaining);
    order.reverse();
    order
}
