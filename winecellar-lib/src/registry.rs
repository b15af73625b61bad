//! REGEDIT4 script generation

use std::path::Path;

/// Value written for a registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryValue {
    String(String),
    Dword(u32),
    /// Remove the value
    Delete,
}

/// A registry import script, grouped by key in insertion order
#[derive(Debug, Clone, Default)]
pub struct RegistryScript {
    sections: Vec<(String, Vec<(String, RegistryValue)>)>,
}

impl RegistryScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, name: &str, value: RegistryValue) -> &mut Self {
        let position = match self.sections.iter().position(|(k, _)| k == key) {
            Some(position) => position,
            None => {
                self.sections.push((key.to_string(), Vec::new()));
                self.sections.len() - 1
            }
        };
        self.sections[position].1.push((name.to_string(), value));
        self
    }

    pub fn set_string(&mut self, key: &str, name: &str, value: &str) -> &mut Self {
        self.set(key, name, RegistryValue::String(value.to_string()))
    }

    pub fn set_dword(&mut self, key: &str, name: &str, value: u32) -> &mut Self {
        self.set(key, name, RegistryValue::Dword(value))
    }

    pub fn delete(&mut self, key: &str, name: &str) -> &mut Self {
        self.set(key, name, RegistryValue::Delete)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::from("REGEDIT4\n");
        for (key, values) in &self.sections {
            out.push_str(&format!("\n[{}]\n", key));
            for (name, value) in values {
                let rendered = match value {
                    RegistryValue::String(s) => format!("\"{}\"", escape(s)),
                    RegistryValue::Dword(d) => format!("dword:{:08x}", d),
                    RegistryValue::Delete => "-".to_string(),
                };
                out.push_str(&format!("\"{}\"={}\n", escape(name), rendered));
            }
        }
        out
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Windows view of a Unix path through Wine's `Z:` drive
pub fn dos_path(path: &Path) -> String {
    format!("Z:{}", path.to_string_lossy().replace('/', "\\"))
}
