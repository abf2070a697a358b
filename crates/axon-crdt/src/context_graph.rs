//! Grow-only graph of typed relationships.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A typed edge `subject -predicate-> object`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl Edge {
    pub fn new(subject: impl Into<String>, predicate: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }

    pub(crate) fn check(&self) -> Result<(), String> {
        if self.subject.is_empty() || self.predicate.is_empty() || self.object.is_empty() {
            return Err(format!("edge {self} has an empty component"));
        }
        Ok(())
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -{}-> {}", self.subject, self.predicate, self.object)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextGraph {
    edges: BTreeSet<Edge>,
}

impl ContextGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, edge: Edge) -> bool {
        self.edges.insert(edge)
    }

    pub fn contains(&self, edge: &Edge) -> bool {
        self.edges.contains(edge)
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    /// Edges leaving `subject`.
    pub fn outgoing<'a>(&'a self, subject: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.subject == subject)
    }

    /// Edges carrying `predicate`.
    pub fn with_predicate<'a>(&'a self, predicate: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.predicate == predicate)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn merge(&mut self, other: &ContextGraph) -> bool {
        let before = self.edges.len();
        self.edges.extend(other.edges.iter().cloned());
        self.edges.len() != before
    }

    pub(crate) fn check(&self) -> Result<(), String> {
        self.edges.iter().try_for_each(Edge::check)
    }
}
