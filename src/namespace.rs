//! Tool namespacing utilities for the `namespaced` collision policy.
//!
//! Prefixes tool names with the source id using a double underscore separator
//! (e.g., `memory__memory_search`) and prepends `[via id]` to descriptions.

use crate::tool::ToolDescriptor;

/// Separator between source id and upstream tool name.
pub const SEPARATOR: &str = "__";

/// Rewrite a tool so its exposed name carries the owning source id.
///
/// The upstream name is preserved in `upstream_name` so calls can be routed
/// back with the name the source expects.
pub fn namespace_tool(mut tool: ToolDescriptor) -> ToolDescriptor {
    tool.name = format!("{}{}{}", tool.source_id, SEPARATOR, tool.upstream_name);
    if let Some(desc) = tool.description.as_mut() {
        *desc = format!("[via {}] {}", tool.source_id, desc);
    }
    tool
}

/// Extract (source_id, upstream_tool_name) from a namespaced tool name.
/// Returns None if no double underscore separator found.
pub fn unnamespace_tool_name(namespaced: &str) -> Option<(&str, &str)> {
    namespaced.split_once(SEPARATOR)
}
