use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use cmb_sandbox::{ExecuteOutcome, SandboxBackend, ToolSet};
use cmb_search::{ToolSearchEntry, ToolSearchIndex};
use cmb_upstream::{ToolDescriptor, ToolListEntry, ToolRegistrySink};
use serde::Serialize;

/// Per-namespace tool counts for status reporting.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NamespaceInfo {
    pub name: String,
    pub tool_count: usize,
}

/// Per-session registry of tool descriptors, keyed namespace then sanitized
/// tool name. Builds the flat callable map handed into each execution.
#[derive(Clone, Default)]
pub struct SandboxManager {
    tools: Arc<StdMutex<HashMap<String, HashMap<String, ToolDescriptor>>>>,
}

impl SandboxManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace one namespace's descriptors. An empty set drops the
    /// namespace entirely.
    pub fn register_tool_descriptors(&self, namespace: &str, descriptors: Vec<ToolDescriptor>) {
        let mut tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        if descriptors.is_empty() {
            tools.remove(namespace);
            return;
        }
        let entry: HashMap<String, ToolDescriptor> =
            descriptors.into_iter().map(|d| (d.name.clone(), d)).collect();
        tools.insert(namespace.to_string(), entry);
    }

    pub fn unregister_tool_descriptors(&self, namespace: &str) {
        self.tools.lock().unwrap_or_else(|e| e.into_inner()).remove(namespace);
    }

    pub fn get_tool_list(&self, namespace: Option<&str>) -> Vec<ToolListEntry> {
        let tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<ToolListEntry> = tools
            .iter()
            .filter(|(name, _)| namespace.is_none_or(|wanted| wanted == name.as_str()))
            .flat_map(|(ns, entry)| {
                entry.values().map(|descriptor| ToolListEntry {
                    server: ns.clone(),
                    name: format!("{ns}__{}", descriptor.name),
                    description: descriptor.description.clone(),
                })
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn get_registered_tool(&self, namespace: &str, name: &str) -> Option<ToolDescriptor> {
        let tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        tools.get(namespace)?.get(name).cloned()
    }

    pub fn get_namespace_info(&self) -> Vec<NamespaceInfo> {
        let tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        let mut info: Vec<NamespaceInfo> = tools
            .iter()
            .map(|(name, entry)| NamespaceInfo { name: name.clone(), tool_count: entry.len() })
            .collect();
        info.sort_by(|a, b| a.name.cmp(&b.name));
        info
    }

    /// Flat `namespace__name → execute` map for one execution.
    pub fn compose_tool_set(&self) -> ToolSet {
        let tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        let flat = tools
            .iter()
            .flat_map(|(ns, entry)| {
                entry
                    .values()
                    .map(move |descriptor| (format!("{ns}__{}", descriptor.name), descriptor.execute.clone()))
            })
            .collect();
        Arc::new(flat)
    }

    /// Search-index input covering every registered tool.
    pub fn search_entries(&self) -> Vec<ToolSearchEntry> {
        let tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<ToolSearchEntry> = tools
            .iter()
            .flat_map(|(ns, entry)| {
                entry.values().map(move |descriptor| ToolSearchEntry {
                    name: format!("{ns}__{}", descriptor.name),
                    description: descriptor.description.clone(),
                    raw_schema: descriptor.raw_schema.clone(),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Run one script against an executor with the current flat tool map.
    pub async fn run_code_with_executor(
        &self,
        executor: &dyn SandboxBackend,
        code: &str,
    ) -> ExecuteOutcome {
        let tools = self.compose_tool_set();
        executor.execute(normalize(code), tools).await
    }
}

/// Leading whitespace confuses expression-shape detection; everything else
/// is the executor's wrap step's concern.
fn normalize(code: &str) -> &str {
    code.trim_start()
}

/// Observer wired into the upstream manager: keeps the sandbox registry and
/// the search index in lockstep with upstream tool-set changes. The index
/// rebuild is atomic, so readers see the old or the new catalog.
pub struct RegistrySync {
    pub sandbox: SandboxManager,
    pub search: Arc<ToolSearchIndex>,
}

impl ToolRegistrySink for RegistrySync {
    fn tools_changed(&self, namespace: &str, tools: Vec<ToolDescriptor>) {
        self.sandbox.register_tool_descriptors(namespace, tools);
        self.search.rebuild(&self.sandbox.search_entries());
    }

    fn namespace_removed(&self, namespace: &str) {
        self.sandbox.unregister_tool_descriptors(namespace);
        self.search.rebuild(&self.sandbox.search_entries());
    }
}
