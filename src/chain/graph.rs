//! Diagnostic chain graph dump
//!
//! A serializable view of a built chain, plus a Graphviz renderer. Edges
//! point from a step to the producers it waits on.

use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;

use super::BuildChain;

#[derive(Debug, Clone, Serialize)]
pub struct GraphStep {
    pub name: String,
    pub produces: Vec<String>,
    pub consumes: Vec<String>,
    pub depends_on: Vec<String>,
}

/// The dependency graph of one built chain, in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct ChainGraph {
    pub steps: Vec<GraphStep>,
}

impl BuildChain {
    pub fn graph(&self) -> ChainGraph {
        let steps = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, node)| {
                // dependents are recorded on the producer side; invert them
                let depends_on = self
                    .steps
                    .iter()
                    .filter(|producer| producer.dependents.contains(&i))
                    .map(|producer| producer.name.clone())
                    .collect();
                GraphStep {
                    name: node.name.clone(),
                    produces: node.produces.iter().map(|id| id.to_string()).collect(),
                    consumes: node.consumes.iter().map(|c| c.id.to_string()).collect(),
                    depends_on,
                }
            })
            .collect();
        ChainGraph { steps }
    }
}

impl ChainGraph {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph {\n    node [shape=rectangle];\n    rankdir=LR;\n\n");
        for step in &self.steps {
            if step.depends_on.is_empty() {
                out.push_str(&format!("    {};\n", quote(&step.name)));
            }
            for dep in &step.depends_on {
                out.push_str(&format!("    {} -> {};\n", quote(&step.name), quote(dep)));
            }
        }
        out.push_str("}\n");
        out
    }

    pub fn write_dot(&self, path: &Path) -> io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(self.to_dot().as_bytes())
    }
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use crate::chain::ChainBuilder;
    use crate::item::BuildItem;
    use crate::step::StepBuilder;

    struct X;
    impl BuildItem for X {}
    struct Y;
    impl BuildItem for Y {}

    fn chain() -> crate::chain::BuildChain {
        ChainBuilder::new()
            .add_step(StepBuilder::from_fn("produce", |_| async { Ok(()) }).produces::<X>())
            .add_step(
                StepBuilder::from_fn("consume", |_| async { Ok(()) })
                    .consumes::<X>()
                    .produces::<Y>(),
            )
            .add_final::<Y>()
            .build()
            .unwrap()
    }

    #[test]
    fn test_graph_records_dependencies() {
        let graph = chain().graph();
        assert_eq!(graph.steps.len(), 2);
        assert_eq!(graph.steps[1].name, "consume");
        assert_eq!(graph.steps[1].depends_on, vec!["produce".to_string()]);
    }

    #[test]
    fn test_dot_output_contains_edges() {
        let dot = chain().graph().to_dot();
        assert!(dot.starts_with("digraph {"));
        assert!(dot.contains("\"consume\" -> \"produce\";"));
    }

    #[test]
    fn test_json_serialization() {
        let json = chain().graph().to_json().unwrap();
        assert!(json.contains("\"depends_on\""));
    }

    #[test]
    #[serial_test::serial]
    fn test_build_dumps_graph_when_env_var_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.dot");
        std::env::set_var(crate::chain::GRAPH_OUTPUT_ENV, &path);
        let _ = chain();
        std::env::remove_var(crate::chain::GRAPH_OUTPUT_ENV);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("digraph {"));
    }

    #[test]
    fn test_dot_written_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.dot");
        chain().graph().write_dot(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("rankdir=LR"));
    }
}
