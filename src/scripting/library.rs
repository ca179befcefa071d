//! Shared formula library
//!
//! Tenants can register named helper snippets (`deadband`, `c_to_f`, …)
//! that user formulas reference by name. Preprocessing prepends the bodies
//! of every referenced snippet so the executor compiles one self-contained
//! script.

use regex::Regex;
use std::collections::HashMap;
use std::sync::RwLock;

/// One registered helper snippet.
#[derive(Debug, Clone)]
pub struct LibraryScript {
    pub name: String,
    /// `None` = shared across tenants.
    pub tenant_id: Option<i32>,
    pub code: String,
}

/// In-memory registry of helper snippets, safe for concurrent reads.
#[derive(Default)]
pub struct ScriptLibrary {
    scripts: RwLock<HashMap<String, Vec<LibraryScript>>>,
}

impl ScriptLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, script: LibraryScript) {
        let mut scripts = self.scripts.write().unwrap_or_else(|e| e.into_inner());
        scripts.entry(script.name.clone()).or_default().push(script);
    }

    /// Names of registered snippets referenced by `formula`.
    ///
    /// A reference is a whole-word occurrence of the snippet name; matching
    /// is textual, which mirrors how operators actually write formulas.
    pub fn collect_dependencies(&self, formula: &str) -> Vec<String> {
        let scripts = self.scripts.read().unwrap_or_else(|e| e.into_inner());
        let mut found = Vec::new();
        for name in scripts.keys() {
            let pattern = format!(r"\b{}\b", regex::escape(name));
            if let Ok(re) = Regex::new(&pattern) {
                if re.is_match(formula) {
                    found.push(name.clone());
                }
            }
        }
        found.sort();
        found
    }

    /// Look up a snippet for a tenant, preferring the tenant-specific
    /// version over the shared one.
    pub fn get(&self, name: &str, tenant_id: i32) -> Option<LibraryScript> {
        let scripts = self.scripts.read().unwrap_or_else(|e| e.into_inner());
        let candidates = scripts.get(name)?;
        candidates
            .iter()
            .find(|s| s.tenant_id == Some(tenant_id))
            .or_else(|| candidates.iter().find(|s| s.tenant_id.is_none()))
            .cloned()
    }

    /// Prepend the bodies of referenced snippets to a user formula.
    ///
    /// A formula with no references passes through unchanged.
    pub fn preprocess(&self, formula: &str, tenant_id: i32) -> String {
        let deps = self.collect_dependencies(formula);
        if deps.is_empty() {
            return formula.to_string();
        }

        let mut out = String::new();
        for name in &deps {
            if let Some(snippet) = self.get(name, tenant_id) {
                out.push_str(snippet.code.trim_end_matches(';'));
                out.push_str(";\n");
            }
        }
        out.push_str(formula);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepends_referenced_snippets_only() {
        let lib = ScriptLibrary::new();
        lib.register(LibraryScript {
            name: "offset_k".to_string(),
            tenant_id: None,
            code: "offset_k = 273.15".to_string(),
        });
        lib.register(LibraryScript {
            name: "unused".to_string(),
            tenant_id: None,
            code: "unused = 0".to_string(),
        });

        let out = lib.preprocess("temp_c + offset_k", 1);
        assert!(out.starts_with("offset_k = 273.15;"));
        assert!(!out.contains("unused"));
        assert!(out.ends_with("temp_c + offset_k"));
    }

    #[test]
    fn tenant_specific_wins_over_shared() {
        let lib = ScriptLibrary::new();
        lib.register(LibraryScript {
            name: "k".to_string(),
            tenant_id: None,
            code: "k = 1".to_string(),
        });
        lib.register(LibraryScript {
            name: "k".to_string(),
            tenant_id: Some(7),
            code: "k = 2".to_string(),
        });

        assert_eq!(lib.get("k", 7).unwrap().code, "k = 2");
        assert_eq!(lib.get("k", 1).unwrap().code, "k = 1");
    }

    #[test]
    fn no_references_passes_through() {
        let lib = ScriptLibrary::new();
        assert_eq!(lib.preprocess("a * 2", 1), "a * 2");
    }
}
