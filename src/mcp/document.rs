//! Document and selection tools.

use serde_json::{Map, Value};

use super::tools::{InputSchema, ParamKind, ParamSpec, RelayCall, ToolRegistry};
use crate::error::RegistryError;

/// Registers the document tools.
///
/// # Errors
///
/// Returns an error if any of the tool names is already registered.
pub fn register_document_tools(registry: &mut ToolRegistry) -> Result<(), RegistryError> {
    registry.register_tool(
        "get_document_info",
        "Get detailed information about the current Figma document",
        "getting document info",
        InputSchema::empty(),
        |_| RelayCall::new("get_document_info", Map::new()),
    )?;

    registry.register_tool(
        "get_selection",
        "Get information about the current selection in Figma",
        "getting selection",
        InputSchema::empty(),
        |_| RelayCall::new("get_selection", Map::new()),
    )?;

    registry.register_tool(
        "read_my_design",
        "Get detailed information about the current selection in Figma, including all node details",
        "reading design",
        InputSchema::empty(),
        |_| RelayCall::new("read_my_design", Map::new()),
    )?;

    registry.register_tool(
        "get_node_info",
        "Get detailed information about a specific node in Figma",
        "getting node info",
        InputSchema::empty().param(ParamSpec::required(
            "nodeId",
            ParamKind::String,
            "The ID of the node to get information about",
        )),
        |params| {
            RelayCall::new("get_node_info", params.clone())
                .with_summary("Retrieved detailed information for node")
        },
    )?;

    registry.register_tool(
        "get_nodes_info",
        "Get detailed information about multiple nodes in Figma",
        "getting nodes info",
        InputSchema::empty().param(ParamSpec::required(
            "nodeIds",
            ParamKind::StringArray,
            "Array of node IDs to get information about",
        )),
        |params| {
            let count = params
                .get("nodeIds")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            RelayCall::new("get_nodes_info", params.clone())
                .with_summary(format!("Retrieved information for {count} nodes"))
        },
    )?;

    Ok(())
}
