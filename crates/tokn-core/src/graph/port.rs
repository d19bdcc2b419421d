use serde::{Deserialize, Serialize};

use super::node::NodeKind;

/// A named connection point on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Port {
    /// Prompt text: output of a prompt node, input of a model node.
    Prompt,
    /// Tool registrations feeding a model node.
    Tools,
    /// Output of a tool node, wired into a model's `tools` input.
    Register,
    /// Generated text of a model node.
    Output,
    /// Input of an optimizer node.
    Input,
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Prompt => "prompt",
            Self::Tools => "tools",
            Self::Register => "register",
            Self::Output => "output",
            Self::Input => "input",
        };
        f.write_str(s)
    }
}

/// One allowed `(kind, port) -> (kind, port)` pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub source: (NodeKind, Port),
    pub target: (NodeKind, Port),
}

/// Every connection the graph accepts.
///
/// Producers (prompt, tool) never accept inbound edges and optimizers never
/// emit any, so the accepted shapes cannot form a cycle.
pub const CONNECTIONS: &[Connection] = &[
    Connection {
        source: (NodeKind::Prompt, Port::Prompt),
        target: (NodeKind::Model, Port::Prompt),
    },
    Connection {
        source: (NodeKind::Tool, Port::Register),
        target: (NodeKind::Model, Port::Tools),
    },
    Connection {
        source: (NodeKind::Model, Port::Output),
        target: (NodeKind::Optimizer, Port::Input),
    },
];

/// Look up whether a pairing is in the compatibility table.
pub fn is_allowed(source: (NodeKind, Port), target: (NodeKind, Port)) -> bool {
    CONNECTIONS
        .iter()
        .any(|c| c.source == source && c.target == target)
}

/// Input ports that accept at most one inbound edge.
pub fn is_single_valued(kind: NodeKind, port: Port) -> bool {
    matches!(
        (kind, port),
        (NodeKind::Model, Port::Prompt) | (NodeKind::Optimizer, Port::Input)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_rejects_tool_to_tool() {
        assert!(!is_allowed(
            (NodeKind::Tool, Port::Register),
            (NodeKind::Tool, Port::Register)
        ));
        assert!(is_allowed(
            (NodeKind::Tool, Port::Register),
            (NodeKind::Model, Port::Tools)
        ));
    }

    #[test]
    fn test_no_producer_accepts_inbound() {
        for c in CONNECTIONS {
            assert_ne!(c.target.0, NodeKind::Prompt);
            assert_ne!(c.target.0, NodeKind::Tool);
            assert_ne!(c.source.0, NodeKind::Optimizer);
        }
    }

    #[test]
    fn test_single_valued_ports() {
        assert!(is_single_valued(NodeKind::Model, Port::Prompt));
        assert!(!is_single_valued(NodeKind::Model, Port::Tools));
        assert!(is_single_valued(NodeKind::Optimizer, Port::Input));
    }
}
