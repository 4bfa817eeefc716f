//! capibara_policy
//!
//! Named security policies bundling scanner rules and sandbox resource
//! limits: three built-ins (strict/moderate/permissive, moderate is the
//! default) plus custom policies loaded from one YAML document per file
//! in a configured directory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error in {file}: {source}")]
    Yaml {
        file: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("policy not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Block,
    Warn,
    Allow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityRule {
    pub name: String,
    pub description: String,
    pub pattern: String,
    pub severity: Severity,
    pub action: Action,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_seconds: u32,
    pub memory_mb: u32,
    pub wall_seconds: u32,
    pub max_file_size_mb: u32,
    pub max_files: u32,
    pub network_access: bool,
    pub allow_subprocess: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub name: String,
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub rules: Vec<SecurityRule>,
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub allowed_imports: Vec<String>,
    pub blocked_imports: Vec<String>,
    #[serde(default)]
    pub allowed_functions: Vec<String>,
    pub blocked_functions: Vec<String>,
}

fn default_version() -> String {
    "1".to_string()
}

fn rule(name: &str, description: &str, pattern: &str, severity: Severity, action: Action) -> SecurityRule {
    SecurityRule {
        name: name.into(),
        description: description.into(),
        pattern: pattern.into(),
        severity,
        action,
    }
}

fn strict_policy() -> SecurityPolicy {
    SecurityPolicy {
        name: "strict".into(),
        description: "Maximum restrictions: blocks all dangerous imports, functions, and system calls".into(),
        version: "1".into(),
        rules: vec![
            rule(
                "no_dangerous_imports",
                "Block dangerous imports",
                r"import\s+(os|subprocess|sys|shutil|socket|urllib|requests|pickle|ctypes|multiprocessing|threading|eval|exec|compile|__import__)",
                Severity::Error,
                Action::Block,
            ),
            rule(
                "no_dangerous_functions",
                "Block dangerous function calls",
                r"(eval|exec|compile|__import__|open|file|input|exit|quit)\s*\(",
                Severity::Error,
                Action::Block,
            ),
            rule(
                "no_system_calls",
                "Block system calls",
                r"os\.system|subprocess\.|os\.popen",
                Severity::Error,
                Action::Block,
            ),
        ],
        resource_limits: ResourceLimits {
            cpu_seconds: 10,
            memory_mb: 128,
            wall_seconds: 30,
            max_file_size_mb: 1,
            max_files: 10,
            network_access: false,
            allow_subprocess: false,
        },
        allowed_imports: Vec::new(),
        blocked_imports: strs(&[
            "os", "subprocess", "sys", "shutil", "socket", "urllib", "requests", "pickle",
            "ctypes", "multiprocessing", "threading", "eval", "exec", "compile", "__import__",
        ]),
        allowed_functions: Vec::new(),
        blocked_functions: strs(&[
            "eval", "exec", "compile", "__import__", "open", "file", "input", "exit", "quit", "reload",
        ]),
    }
}

fn moderate_policy() -> SecurityPolicy {
    SecurityPolicy {
        name: "moderate".into(),
        description: "Balanced restrictions: blocks the highest-risk imports and functions, warns on system calls".into(),
        version: "1".into(),
        rules: vec![
            rule(
                "no_dangerous_imports",
                "Block most dangerous imports",
                r"import\s+(subprocess|socket|urllib|requests|pickle|ctypes|multiprocessing|threading|eval|exec|compile|__import__)",
                Severity::Error,
                Action::Block,
            ),
            rule(
                "no_dangerous_functions",
                "Block dangerous function calls",
                r"(eval|exec|compile|__import__|exit|quit)\s*\(",
                Severity::Error,
                Action::Block,
            ),
            rule(
                "warn_system_calls",
                "Warn about system calls",
                r"os\.system|subprocess\.",
                Severity::Warning,
                Action::Warn,
            ),
        ],
        resource_limits: ResourceLimits {
            cpu_seconds: 30,
            memory_mb: 256,
            wall_seconds: 60,
            max_file_size_mb: 5,
            max_files: 50,
            network_access: false,
            allow_subprocess: false,
        },
        allowed_imports: Vec::new(),
        blocked_imports: strs(&[
            "subprocess", "socket", "urllib", "requests", "pickle", "ctypes",
            "multiprocessing", "threading", "eval", "exec", "compile", "__import__",
        ]),
        allowed_functions: Vec::new(),
        blocked_functions: strs(&["eval", "exec", "compile", "__import__", "exit", "quit", "reload"]),
    }
}

fn permissive_policy() -> SecurityPolicy {
    SecurityPolicy {
        name: "permissive".into(),
        description: "Minimal restrictions: blocks only eval/exec-family calls".into(),
        version: "1".into(),
        rules: vec![
            rule(
                "no_eval_exec",
                "Block eval and exec",
                r"(eval|exec|compile|__import__)\s*\(",
                Severity::Error,
                Action::Block,
            ),
            rule(
                "warn_dangerous_imports",
                "Warn about dangerous imports",
                r"import\s+(subprocess|socket|urllib|requests|pickle|ctypes)",
                Severity::Warning,
                Action::Warn,
            ),
        ],
        resource_limits: ResourceLimits {
            cpu_seconds: 60,
            memory_mb: 512,
            wall_seconds: 120,
            max_file_size_mb: 10,
            max_files: 100,
            network_access: false,
            allow_subprocess: false,
        },
        allowed_imports: Vec::new(),
        blocked_imports: strs(&["eval", "exec", "compile", "__import__"]),
        allowed_functions: Vec::new(),
        blocked_functions: strs(&["eval", "exec", "compile", "__import__"]),
    }
}

/// Hardcoded fallback used only when no policy can be resolved at all
/// (no named match, no default set) so a request is never rejected for
/// want of a policy.
fn basic_policy() -> SecurityPolicy {
    SecurityPolicy {
        name: "basic".into(),
        description: "Basic restrictive fallback policy".into(),
        version: "1".into(),
        rules: vec![
            rule(
                "no_dangerous_imports",
                "Block all dangerous imports",
                r"import\s+(os|subprocess|sys|shutil|socket|urllib|requests|pickle|ctypes|multiprocessing|threading|eval|exec|compile|__import__)",
                Severity::Error,
                Action::Block,
            ),
            rule(
                "no_dangerous_functions",
                "Block all dangerous functions",
                r"(eval|exec|compile|__import__|open|file|input|exit|quit|reload)\s*\(",
                Severity::Error,
                Action::Block,
            ),
        ],
        resource_limits: ResourceLimits {
            cpu_seconds: 5,
            memory_mb: 64,
            wall_seconds: 15,
            max_file_size_mb: 1,
            max_files: 5,
            network_access: false,
            allow_subprocess: false,
        },
        allowed_imports: Vec::new(),
        blocked_imports: strs(&[
            "os", "subprocess", "sys", "shutil", "socket", "urllib", "requests", "pickle",
            "ctypes", "multiprocessing", "threading", "eval", "exec", "compile", "__import__",
        ]),
        allowed_functions: Vec::new(),
        blocked_functions: strs(&[
            "eval", "exec", "compile", "__import__", "open", "file", "input", "exit", "quit", "reload",
        ]),
    }
}

fn strs(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub struct PolicyStore {
    policies: Vec<SecurityPolicy>,
    default_name: String,
}

impl PolicyStore {
    /// Build the store with the three built-in policies plus any custom
    /// policy YAML documents found directly under `custom_dir` (a missing
    /// directory is not an error - it simply yields zero custom policies).
    pub fn load(custom_dir: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let mut policies = vec![strict_policy(), moderate_policy(), permissive_policy()];
        policies.extend(Self::load_custom(custom_dir.as_ref())?);
        Ok(Self {
            policies,
            default_name: "moderate".into(),
        })
    }

    fn load_custom(dir: &Path) -> Result<Vec<SecurityPolicy>, PolicyError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }
            let contents = fs::read_to_string(&path)?;
            match serde_yaml::from_str::<SecurityPolicy>(&contents) {
                Ok(policy) => out.push(policy),
                Err(source) => {
                    return Err(PolicyError::Yaml {
                        file: path.display().to_string(),
                        source,
                    })
                }
            }
        }
        Ok(out)
    }

    /// Resolve a policy by name. An unknown or absent name falls back to
    /// the default policy, and if even that is unavailable, to the
    /// hardcoded basic restrictive policy - never an error.
    pub fn get(&self, name: Option<&str>) -> SecurityPolicy {
        if let Some(name) = name {
            if let Some(found) = self.policies.iter().find(|p| p.name == name) {
                return found.clone();
            }
        }
        if let Some(default) = self.policies.iter().find(|p| p.name == self.default_name) {
            return default.clone();
        }
        basic_policy()
    }

    pub fn list_names(&self) -> Vec<String> {
        self.policies.iter().map(|p| p.name.clone()).collect()
    }

    pub fn save_policy(&self, policy: &SecurityPolicy, dir: impl AsRef<Path>) -> Result<PathBuf, PolicyError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.yaml", policy.name));
        let yaml = serde_yaml::to_string(policy).map_err(|source| PolicyError::Yaml {
            file: path.display().to_string(),
            source,
        })?;
        fs::write(&path, yaml)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn unknown_name_falls_back_to_default() {
        let store = PolicyStore::load(std::env::temp_dir().join("nonexistent-policies")).unwrap();
        let p = store.get(Some("does_not_exist"));
        assert_eq!(p.name, "moderate");
    }

    #[test]
    fn named_lookup_returns_exact_policy() {
        let store = PolicyStore::load(std::env::temp_dir().join("nonexistent-policies")).unwrap();
        let p = store.get(Some("strict"));
        assert_eq!(p.resource_limits.memory_mb, 128);
        assert!(!p.resource_limits.network_access);
    }

    #[test]
    fn custom_yaml_policy_loads() {
        let td = TempDir::new().unwrap();
        let custom = basic_policy();
        let yaml = serde_yaml::to_string(&SecurityPolicy { name: "custom_test".into(), ..custom }).unwrap();
        fs::write(td.path().join("custom_test.yaml"), yaml).unwrap();

        let store = PolicyStore::load(td.path()).unwrap();
        assert!(store.list_names().contains(&"custom_test".to_string()));
        assert_eq!(store.get(Some("custom_test")).name, "custom_test");
    }
}
