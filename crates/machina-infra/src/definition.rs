//! Graph definition files.
//!
//! Graphs are stored as YAML (`.yaml`/`.yml`) or TOML (`.toml`). Loading
//! only parses; structural validation happens in the engine against its
//! registry.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};

use machina_types::graph::WorkflowGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Yaml,
    Toml,
}

fn format_of(path: &Path) -> Option<Format> {
    match path.extension()?.to_str()? {
        "yaml" | "yml" => Some(Format::Yaml),
        "toml" => Some(Format::Toml),
        _ => None,
    }
}

pub fn parse_graph_yaml(yaml: &str) -> anyhow::Result<WorkflowGraph> {
    serde_yaml_ng::from_str(yaml).context("invalid graph YAML")
}

pub fn parse_graph_toml(toml: &str) -> anyhow::Result<WorkflowGraph> {
    toml::from_str(toml).context("invalid graph TOML")
}

/// Load a graph, picking the format from the file extension.
pub fn load_graph_file(path: &Path) -> anyhow::Result<WorkflowGraph> {
    let Some(format) = format_of(path) else {
        bail!("unsupported graph file extension: {}", path.display());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let graph = match format {
        Format::Yaml => parse_graph_yaml(&content),
        Format::Toml => parse_graph_toml(&content),
    };
    graph.with_context(|| format!("failed to load {}", path.display()))
}

/// Write a graph as YAML or TOML according to the extension. Creates parent
/// directories if they don't exist.
pub fn save_graph_file(path: &Path, graph: &WorkflowGraph) -> anyhow::Result<()> {
    let Some(format) = format_of(path) else {
        bail!("unsupported graph file extension: {}", path.display());
    };
    let content = match format {
        Format::Yaml => serde_yaml_ng::to_string(graph).context("serialize graph YAML")?,
        Format::Toml => toml::to_string(graph).context("serialize graph TOML")?,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Every parseable graph file under `base_dir`, recursively. Files that fail
/// to parse are logged and skipped.
pub fn discover_graphs(base_dir: &Path) -> anyhow::Result<Vec<(PathBuf, WorkflowGraph)>> {
    let mut results = Vec::new();
    if base_dir.exists() {
        discover_recursive(base_dir, &mut results)?;
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(dir: &Path, results: &mut Vec<(PathBuf, WorkflowGraph)>) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if format_of(&path).is_some() {
            match load_graph_file(&path) {
                Ok(graph) => results.push((path, graph)),
                Err(e) => tracing::warn!(?path, error = %format!("{e:#}"), "Skipping unparseable graph file"),
            }
        }
    }
    Ok(())
}
