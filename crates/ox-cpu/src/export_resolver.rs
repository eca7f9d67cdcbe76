//! Kernel export tables that guest imports are linked against

use parking_lot::RwLock;
use std::collections::HashMap;

/// What an export provides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    /// Callable kernel function; imports get a syscall thunk
    Function,
    /// Kernel variable; imports get the variable's guest address
    Variable,
}

/// A single export of a built-in kernel module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub ordinal: u16,
    pub name: String,
    pub kind: ExportKind,
    /// Guest address of the variable, 0 until mapped
    pub variable_ptr: u32,
}

impl Export {
    pub fn function(ordinal: u16, name: &str) -> Self {
        Self {
            ordinal,
            name: name.to_string(),
            kind: ExportKind::Function,
            variable_ptr: 0,
        }
    }

    pub fn variable(ordinal: u16, name: &str) -> Self {
        Self {
            ordinal,
            name: name.to_string(),
            kind: ExportKind::Variable,
            variable_ptr: 0,
        }
    }
}

/// Export tables keyed by library name (case-insensitive) and ordinal
#[derive(Debug, Default)]
pub struct ExportResolver {
    tables: RwLock<HashMap<String, HashMap<u16, Export>>>,
}

impl ExportResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(library: &str) -> String {
        library.to_ascii_lowercase()
    }

    /// Register (or extend) the export table of a library
    pub fn register_table(&self, library: &str, exports: Vec<Export>) {
        let count = exports.len();
        let mut tables = self.tables.write();
        let table = tables.entry(Self::key(library)).or_default();
        for export in exports {
            table.insert(export.ordinal, export);
        }
        tracing::debug!("Registered {} exports for {}", count, library);
    }

    pub fn has_library(&self, library: &str) -> bool {
        self.tables.read().contains_key(&Self::key(library))
    }

    pub fn get_export(&self, library: &str, ordinal: u16) -> Option<Export> {
        self.tables
            .read()
            .get(&Self::key(library))
            .and_then(|table| table.get(&ordinal))
            .cloned()
    }

    /// Point a variable export at guest memory. Returns false if unknown.
    pub fn set_variable_mapping(&self, library: &str, ordinal: u16, address: u32) -> bool {
        let mut tables = self.tables.write();
        match tables
            .get_mut(&Self::key(library))
            .and_then(|table| table.get_mut(&ordinal))
        {
            Some(export) if export.kind == ExportKind::Variable => {
                export.variable_ptr = address;
                true
            }
            _ => false,
        }
    }

    pub fn library_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let resolver = ExportResolver::new();
        resolver.register_table(
            "xboxkrnl.exe",
            vec![Export::function(1, "DbgBreakPoint")],
        );
        let export = resolver.get_export("XBOXKRNL.EXE", 1).unwrap();
        assert_eq!(export.name, "DbgBreakPoint");
        assert!(resolver.get_export("xboxkrnl.exe", 2).is_none());
    }

    #[test]
    fn test_variable_mapping() {
        let resolver = ExportResolver::new();
        resolver.register_table(
            "xboxkrnl.exe",
            vec![
                Export::function(1, "DbgBreakPoint"),
                Export::variable(0x1B, "ExLoadedImageName"),
            ],
        );
        assert!(resolver.set_variable_mapping("xboxkrnl.exe", 0x1B, 0x8000_1000));
        assert!(!resolver.set_variable_mapping("xboxkrnl.exe", 1, 0x8000_2000));
        assert_eq!(
            resolver.get_export("xboxkrnl.exe", 0x1B).unwrap().variable_ptr,
            0x8000_1000
        );
    }
}
