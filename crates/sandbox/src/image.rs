//! Runtime kinds and their container images
//!
//! Each custom-node language family maps to one image. The image carries a
//! harness at a fixed path; the harness reads the input descriptor, loads the
//! node's entry point from the read-only `/node` mount, calls its `run`
//! function, and writes the output descriptor and log file before exiting.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Language family of a custom node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRuntime {
    /// JavaScript nodes executed under the Node.js harness
    Javascript,
    /// Python nodes executed under the CPython harness
    Python,
    /// WebAssembly nodes executed under the wasm harness
    Wasm,
}

impl fmt::Display for NodeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRuntime::Javascript => write!(f, "javascript"),
            NodeRuntime::Python => write!(f, "python"),
            NodeRuntime::Wasm => write!(f, "wasm"),
        }
    }
}

impl FromStr for NodeRuntime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "javascript" | "js" => Ok(NodeRuntime::Javascript),
            "python" | "py" => Ok(NodeRuntime::Python),
            "wasm" => Ok(NodeRuntime::Wasm),
            _ => Err(format!(
                "Unknown node runtime: '{s}'. Valid runtimes: javascript, python, wasm"
            )),
        }
    }
}

/// Maps runtime kinds to container images and harness commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCatalog {
    javascript: String,
    python: String,
    wasm: String,
}

impl Default for ImageCatalog {
    fn default() -> Self {
        Self {
            javascript: "edgeql/runtime-js:latest".to_string(),
            python: "edgeql/runtime-python:latest".to_string(),
            wasm: "edgeql/runtime-wasm:latest".to_string(),
        }
    }
}

impl ImageCatalog {
    /// Override the image for one runtime.
    pub fn with_image(mut self, runtime: NodeRuntime, image: impl Into<String>) -> Self {
        match runtime {
            NodeRuntime::Javascript => self.javascript = image.into(),
            NodeRuntime::Python => self.python = image.into(),
            NodeRuntime::Wasm => self.wasm = image.into(),
        }
        self
    }

    /// Image name for a runtime kind.
    pub fn image_for(&self, runtime: NodeRuntime) -> &str {
        match runtime {
            NodeRuntime::Javascript => &self.javascript,
            NodeRuntime::Python => &self.python,
            NodeRuntime::Wasm => &self.wasm,
        }
    }

    /// Harness argv prefix for a runtime kind.
    ///
    /// The invocation appends the container-side entry point path and the
    /// input/output/log paths under `/workspace`.
    pub fn harness_for(&self, runtime: NodeRuntime) -> Vec<String> {
        match runtime {
            NodeRuntime::Javascript => vec![
                "node".to_string(),
                "/usr/local/lib/edgeql/harness.js".to_string(),
            ],
            NodeRuntime::Python => vec![
                "python3".to_string(),
                "/usr/local/lib/edgeql/harness.py".to_string(),
            ],
            NodeRuntime::Wasm => vec!["/usr/local/bin/edgeql-wasm-harness".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_display_roundtrip() {
        for runtime in [
            NodeRuntime::Javascript,
            NodeRuntime::Python,
            NodeRuntime::Wasm,
        ] {
            let parsed = NodeRuntime::from_str(&runtime.to_string()).unwrap();
            assert_eq!(parsed, runtime);
        }
    }

    #[test]
    fn test_runtime_from_str_aliases() {
        assert_eq!(NodeRuntime::from_str("js").unwrap(), NodeRuntime::Javascript);
        assert_eq!(NodeRuntime::from_str("py").unwrap(), NodeRuntime::Python);
    }

    #[test]
    fn test_runtime_from_str_invalid() {
        let err = NodeRuntime::from_str("ruby").unwrap_err();
        assert!(err.contains("Unknown node runtime: 'ruby'"));
    }

    #[test]
    fn test_runtime_serde() {
        let json = serde_json::to_string(&NodeRuntime::Javascript).unwrap();
        assert_eq!(json, "\"javascript\"");
        let parsed: NodeRuntime = serde_json::from_str("\"wasm\"").unwrap();
        assert_eq!(parsed, NodeRuntime::Wasm);
    }

    #[test]
    fn test_default_images() {
        let catalog = ImageCatalog::default();
        assert_eq!(
            catalog.image_for(NodeRuntime::Javascript),
            "edgeql/runtime-js:latest"
        );
        assert_eq!(
            catalog.image_for(NodeRuntime::Python),
            "edgeql/runtime-python:latest"
        );
        assert_eq!(
            catalog.image_for(NodeRuntime::Wasm),
            "edgeql/runtime-wasm:latest"
        );
    }

    #[test]
    fn test_image_override() {
        let catalog =
            ImageCatalog::default().with_image(NodeRuntime::Python, "registry.local/py:3.12");
        assert_eq!(
            catalog.image_for(NodeRuntime::Python),
            "registry.local/py:3.12"
        );
        // Other runtimes untouched
        assert_eq!(
            catalog.image_for(NodeRuntime::Javascript),
            "edgeql/runtime-js:latest"
        );
    }

    #[test]
    fn test_harness_commands() {
        let catalog = ImageCatalog::default();
        assert_eq!(catalog.harness_for(NodeRuntime::Javascript)[0], "node");
        assert_eq!(catalog.harness_for(NodeRuntime::Python)[0], "python3");
        assert_eq!(catalog.harness_for(NodeRuntime::Wasm).len(), 1);
    }
}
