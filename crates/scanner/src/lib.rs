//! capibara_scanner
//!
//! Per-language static analysis: Python gets an AST walk (imports, calls)
//! plus the shared regex sweep and policy rules; the other three
//! languages (JavaScript, Bash, PowerShell) apply a language-specific
//! regex bank plus the same shared sweep and policy rules. A scan never
//! errors out to the caller - a Python parse failure is surfaced as a
//! single fatal `syntax_error` violation inside a normal `ScanResult`.

use capibara_policy::{Action, SecurityPolicy, Severity as PolicySeverity};
use regex::Regex;
use rustpython_parser::ast::{self, Ranged};
use rustpython_parser::{parse, Mode};
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl From<PolicySeverity> for Severity {
    fn from(s: PolicySeverity) -> Self {
        match s {
            PolicySeverity::Error => Severity::Error,
            PolicySeverity::Warning => Severity::Warning,
            PolicySeverity::Info => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub message: String,
    pub pattern_matched: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub scan_id: String,
    pub artifact_id: Option<String>,
    pub violations: Vec<Violation>,
    pub passed: bool,
    pub rules_applied: Vec<String>,
    pub duration_ms: u64,
}

/// Python imports treated as dangerous regardless of policy, unless the
/// policy's `allowed_imports` whitelists them. Reproduced verbatim from
/// the normative baseline.
const DANGEROUS_IMPORTS: &[&str] = &[
    "os", "subprocess", "sys", "shutil", "glob", "fnmatch", "socket", "urllib", "http",
    "requests", "urllib3", "pickle", "marshal", "shelve", "dbm", "ctypes", "cffi",
    "multiprocessing", "threading", "concurrent", "importlib", "pkgutil", "eval", "exec",
    "compile", "__import__",
];

const DANGEROUS_FUNCTIONS: &[&str] = &[
    "eval", "exec", "compile", "__import__", "open", "file", "input", "raw_input", "exit",
    "quit", "reload",
];

fn generic_patterns() -> Vec<(&'static str, Regex)> {
    [
        r"os\.system\s*\(",
        r"subprocess\.",
        r"eval\s*\(",
        r"exec\s*\(",
        r"__import__\s*\(",
        r"compile\s*\(",
        r#"open\s*\([^)]*['"]w['"]"#,
        r#"file\s*\([^)]*['"]w['"]"#,
    ]
    .into_iter()
    .map(|p| (p, Regex::new(&format!("(?i){p}")).expect("built-in pattern compiles")))
    .collect()
}

fn js_patterns() -> Vec<(&'static str, Regex)> {
    [
        r"eval\s*\(",
        r"Function\s*\(",
        r"setTimeout\s*\([^,]*,\s*[^)]*\)",
        r"setInterval\s*\([^,]*,\s*[^)]*\)",
        r"document\.write\s*\(",
        r"innerHTML\s*=",
        r"outerHTML\s*=",
        r"XMLHttpRequest",
        r"fetch\s*\(",
    ]
    .into_iter()
    .map(|p| (p, Regex::new(&format!("(?i){p}")).expect("built-in pattern compiles")))
    .collect()
}

fn bash_patterns() -> Vec<(&'static str, Regex)> {
    [
        r"rm\s+-rf",
        r"mkdir\s+/",
        r"chmod\s+777",
        r"wget\s+",
        r"curl\s+",
        r"nc\s+",
        r"netcat\s+",
        r"ssh\s+",
        r"scp\s+",
        r"rsync\s+",
        r">&\s*/dev/null",
        r"2>&1",
    ]
    .into_iter()
    .map(|p| (p, Regex::new(&format!("(?i){p}")).expect("built-in pattern compiles")))
    .collect()
}

fn powershell_patterns() -> Vec<(&'static str, Regex)> {
    [
        r"Invoke-Expression",
        r"Invoke-Command",
        r"Start-Process",
        r"Remove-Item\s+-Recurse",
        r"Set-ExecutionPolicy",
        r"Invoke-WebRequest",
        r"Invoke-RestMethod",
    ]
    .into_iter()
    .map(|p| (p, Regex::new(&format!("(?i){p}")).expect("built-in pattern compiles")))
    .collect()
}

fn line_of_offset(code: &str, offset: usize) -> u32 {
    code.get(..offset.min(code.len())).unwrap_or("").matches('\n').count() as u32 + 1
}

fn snippet_at(code: &str, offset: usize, len: usize) -> String {
    code.get(offset..(offset + len).min(code.len()))
        .unwrap_or_default()
        .to_string()
}

fn next_id(prefix: &str, counter: &mut u64) -> String {
    *counter += 1;
    format!("{prefix}_{counter}")
}

/// Scan `code` written in `language` against `policy`, returning a
/// `ScanResult` that never fails - a scan failure mode (e.g. a Python
/// parse error) is reported as a fatal violation inside a normal result.
pub fn scan(code: &str, language: &str, policy: &SecurityPolicy) -> ScanResult {
    let start = Instant::now();
    let mut counter = 0u64;
    let mut violations = Vec::new();
    let mut rules_applied = vec![
        "dangerous_import".to_string(),
        "dangerous_function".to_string(),
        "dangerous_pattern".to_string(),
    ];

    match language.to_lowercase().as_str() {
        "python" => scan_python(code, policy, &mut violations, &mut counter),
        "javascript" => {
            scan_regex_bank(code, &js_patterns(), &mut violations, &mut counter);
        }
        "bash" | "sh" => {
            scan_regex_bank(code, &bash_patterns(), &mut violations, &mut counter);
        }
        "powershell" => {
            scan_regex_bank(code, &powershell_patterns(), &mut violations, &mut counter);
        }
        _ => {}
    }

    scan_generic_patterns(code, &mut violations, &mut counter);
    scan_policy_rules(code, policy, &mut violations, &mut counter);
    rules_applied.extend(policy.rules.iter().map(|r| r.name.clone()));

    let passed = violations.iter().all(|v| v.severity != Severity::Error);

    ScanResult {
        scan_id: format!("scan_{}", counter.max(1)),
        artifact_id: None,
        violations,
        passed,
        rules_applied,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

fn scan_python(code: &str, policy: &SecurityPolicy, violations: &mut Vec<Violation>, counter: &mut u64) {
    let parsed = match parse(code, Mode::Module, "<generated>") {
        Ok(m) => m,
        Err(e) => {
            violations.push(Violation {
                id: next_id("syntax_error", counter),
                rule_name: "syntax_error".into(),
                severity: Severity::Error,
                message: format!("Python syntax error: {e}"),
                pattern_matched: String::new(),
                line: None,
                column: None,
                snippet: None,
            });
            // The original scanner still runs the non-AST passes on a
            // parse failure; only the import/call walk is skipped.
            scan_generic_patterns(code, violations, counter);
            scan_policy_rules(code, policy, violations, counter);
            return;
        }
    };

    let ast::Mod::Module(module) = parsed else {
        return;
    };

    for stmt in &module.body {
        walk_stmt(stmt, code, policy, violations, counter);
    }
}

fn walk_stmt(
    stmt: &ast::Stmt,
    code: &str,
    policy: &SecurityPolicy,
    violations: &mut Vec<Violation>,
    counter: &mut u64,
) {
    use ast::Stmt::*;
    match stmt {
        Import(node) => {
            for alias in &node.names {
                check_import(alias.name.as_str(), stmt.range().start().to_usize(), code, policy, violations, counter);
            }
        }
        ImportFrom(node) => {
            if let Some(module) = &node.module {
                check_import(module.as_str(), stmt.range().start().to_usize(), code, policy, violations, counter);
            }
        }
        FunctionDef(node) => walk_body(&node.body, code, policy, violations, counter),
        AsyncFunctionDef(node) => walk_body(&node.body, code, policy, violations, counter),
        ClassDef(node) => walk_body(&node.body, code, policy, violations, counter),
        If(node) => {
            walk_body(&node.body, code, policy, violations, counter);
            walk_body(&node.orelse, code, policy, violations, counter);
            walk_expr(&node.test, code, policy, violations, counter);
        }
        For(node) => {
            walk_body(&node.body, code, policy, violations, counter);
            walk_body(&node.orelse, code, policy, violations, counter);
        }
        AsyncFor(node) => {
            walk_body(&node.body, code, policy, violations, counter);
            walk_body(&node.orelse, code, policy, violations, counter);
        }
        While(node) => {
            walk_body(&node.body, code, policy, violations, counter);
            walk_body(&node.orelse, code, policy, violations, counter);
        }
        With(node) => walk_body(&node.body, code, policy, violations, counter),
        AsyncWith(node) => walk_body(&node.body, code, policy, violations, counter),
        Try(node) => {
            walk_body(&node.body, code, policy, violations, counter);
            walk_body(&node.orelse, code, policy, violations, counter);
            walk_body(&node.finalbody, code, policy, violations, counter);
            for handler in &node.handlers {
                let ast::ExceptHandler::ExceptHandler(h) = handler;
                walk_body(&h.body, code, policy, violations, counter);
            }
        }
        Expr(node) => walk_expr(&node.value, code, policy, violations, counter),
        Assign(node) => walk_expr(&node.value, code, policy, violations, counter),
        AugAssign(node) => walk_expr(&node.value, code, policy, violations, counter),
        Return(node) => {
            if let Some(value) = &node.value {
                walk_expr(value, code, policy, violations, counter);
            }
        }
        _ => {}
    }
}

fn walk_body(
    body: &[ast::Stmt],
    code: &str,
    policy: &SecurityPolicy,
    violations: &mut Vec<Violation>,
    counter: &mut u64,
) {
    for stmt in body {
        walk_stmt(stmt, code, policy, violations, counter);
    }
}

fn walk_expr(
    expr: &ast::Expr,
    code: &str,
    policy: &SecurityPolicy,
    violations: &mut Vec<Violation>,
    counter: &mut u64,
) {
    use ast::Expr::*;
    if let Call(call) = expr {
        if let Some(name) = callee_name(&call.func) {
            check_function(&name, call.range().start().to_usize(), code, policy, violations, counter);
        }
        walk_expr(&call.func, code, policy, violations, counter);
        for arg in &call.args {
            walk_expr(arg, code, policy, violations, counter);
        }
    }
    match expr {
        BinOp(node) => {
            walk_expr(&node.left, code, policy, violations, counter);
            walk_expr(&node.right, code, policy, violations, counter);
        }
        BoolOp(node) => {
            for v in &node.values {
                walk_expr(v, code, policy, violations, counter);
            }
        }
        UnaryOp(node) => walk_expr(&node.operand, code, policy, violations, counter),
        Compare(node) => {
            walk_expr(&node.left, code, policy, violations, counter);
            for c in &node.comparators {
                walk_expr(c, code, policy, violations, counter);
            }
        }
        Attribute(node) => walk_expr(&node.value, code, policy, violations, counter),
        Subscript(node) => walk_expr(&node.value, code, policy, violations, counter),
        IfExp(node) => {
            walk_expr(&node.test, code, policy, violations, counter);
            walk_expr(&node.body, code, policy, violations, counter);
            walk_expr(&node.orelse, code, policy, violations, counter);
        }
        Await(node) => walk_expr(&node.value, code, policy, violations, counter),
        List(node) => {
            for e in &node.elts {
                walk_expr(e, code, policy, violations, counter);
            }
        }
        Tuple(node) => {
            for e in &node.elts {
                walk_expr(e, code, policy, violations, counter);
            }
        }
        _ => {}
    }
}

fn callee_name(expr: &ast::Expr) -> Option<String> {
    match expr {
        ast::Expr::Name(n) => Some(n.id.to_string()),
        ast::Expr::Attribute(a) => Some(a.attr.to_string()),
        _ => None,
    }
}

fn is_import_allowed(name: &str, policy: &SecurityPolicy) -> bool {
    policy.allowed_imports.iter().any(|a| a == name)
}

fn is_function_allowed(name: &str, policy: &SecurityPolicy) -> bool {
    policy.allowed_functions.iter().any(|a| a == name)
}

fn check_import(
    module_name: &str,
    offset: usize,
    code: &str,
    policy: &SecurityPolicy,
    violations: &mut Vec<Violation>,
    counter: &mut u64,
) {
    let root = module_name.split('.').next().unwrap_or(module_name);
    let dangerous = DANGEROUS_IMPORTS.contains(&root) || policy.blocked_imports.iter().any(|b| b == root);
    if !dangerous || is_import_allowed(root, policy) {
        return;
    }
    violations.push(Violation {
        id: next_id(&format!("import_{root}"), counter),
        rule_name: "dangerous_import".into(),
        severity: Severity::Error,
        message: format!("Dangerous import detected: {root}"),
        pattern_matched: root.to_string(),
        line: Some(line_of_offset(code, offset)),
        column: None,
        snippet: None,
    });
}

fn check_function(
    name: &str,
    offset: usize,
    code: &str,
    policy: &SecurityPolicy,
    violations: &mut Vec<Violation>,
    counter: &mut u64,
) {
    let dangerous = DANGEROUS_FUNCTIONS.contains(&name) || policy.blocked_functions.iter().any(|b| b == name);
    if !dangerous || is_function_allowed(name, policy) {
        return;
    }
    violations.push(Violation {
        id: next_id(&format!("function_{name}"), counter),
        rule_name: "dangerous_function".into(),
        severity: Severity::Error,
        message: format!("Dangerous function call detected: {name}"),
        pattern_matched: name.to_string(),
        line: Some(line_of_offset(code, offset)),
        column: None,
        snippet: None,
    });
}

fn scan_regex_bank(code: &str, bank: &[(&str, Regex)], violations: &mut Vec<Violation>, counter: &mut u64) {
    for (_pattern, re) in bank {
        for m in re.find_iter(code) {
            violations.push(Violation {
                id: next_id("lang_pattern", counter),
                rule_name: "dangerous_pattern".into(),
                severity: Severity::Error,
                message: format!("Dangerous pattern detected: {}", m.as_str()),
                pattern_matched: m.as_str().to_string(),
                line: Some(line_of_offset(code, m.start())),
                column: None,
                snippet: Some(snippet_at(code, m.start(), m.len())),
            });
        }
    }
}

fn scan_generic_patterns(code: &str, violations: &mut Vec<Violation>, counter: &mut u64) {
    scan_regex_bank(code, &generic_patterns(), violations, counter);
}

fn scan_policy_rules(code: &str, policy: &SecurityPolicy, violations: &mut Vec<Violation>, counter: &mut u64) {
    for rule in &policy.rules {
        if rule.action == Action::Allow {
            continue;
        }
        let Ok(re) = Regex::new(&format!("(?i){}", rule.pattern)) else {
            continue;
        };
        for m in re.find_iter(code) {
            violations.push(Violation {
                id: next_id(&format!("policy_{}", rule.name), counter),
                rule_name: rule.name.clone(),
                severity: rule.severity.into(),
                message: format!("Policy violation: {}", rule.description),
                pattern_matched: m.as_str().to_string(),
                line: Some(line_of_offset(code, m.start())),
                column: None,
                snippet: Some(snippet_at(code, m.start(), m.len())),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capibara_policy::PolicyStore;

    fn moderate() -> SecurityPolicy {
        PolicyStore::load(std::env::temp_dir().join("nonexistent-scanner-policies"))
            .unwrap()
            .get(Some("moderate"))
    }

    fn strict() -> SecurityPolicy {
        PolicyStore::load(std::env::temp_dir().join("nonexistent-scanner-policies"))
            .unwrap()
            .get(Some("strict"))
    }

    #[test]
    fn clean_python_passes() {
        let code = "def add(a, b):\n    return a + b\n\nprint(add(1, 2))\n";
        let result = scan(code, "python", &moderate());
        assert!(result.passed);
    }

    #[test]
    fn dangerous_import_and_pattern_both_fire() {
        let code = "import os\nos.system('rm -rf /tmp/*')\n";
        let result = scan(code, "python", &strict());
        assert!(!result.passed);
        assert!(result.violations.iter().any(|v| v.rule_name == "dangerous_import" && v.pattern_matched == "os"));
        assert!(result
            .violations
            .iter()
            .any(|v| v.rule_name == "dangerous_pattern" && v.pattern_matched.to_lowercase().contains("os.system")));
    }

    #[test]
    fn syntax_error_is_single_fatal_violation() {
        let code = "def broken(:\n";
        let result = scan(code, "python", &moderate());
        assert!(!result.passed);
        assert!(result.violations.iter().any(|v| v.rule_name == "syntax_error"));
    }

    #[test]
    fn allowed_import_is_not_flagged() {
        let mut policy = strict();
        policy.allowed_imports.push("os".to_string());
        let code = "import os\nprint(os.name)\n";
        let result = scan(code, "python", &policy);
        assert!(!result.violations.iter().any(|v| v.rule_name == "dangerous_import"));
    }

    #[test]
    fn javascript_bank_flags_eval() {
        let code = "function run(input) { return eval(input); }";
        let result = scan(code, "javascript", &moderate());
        assert!(!result.passed);
    }

    #[test]
    fn bash_bank_flags_rm_rf() {
        let code = "#!/bin/sh\nrm -rf /tmp/scratch\n";
        let result = scan(code, "bash", &moderate());
        assert!(!result.passed);
    }

    #[test]
    fn powershell_bank_flags_invoke_expression() {
        let code = "Invoke-Expression $cmd";
        let result = scan(code, "powershell", &moderate());
        assert!(!result.passed);
    }

    #[test]
    fn policy_rule_severity_is_respected() {
        let code = "subprocess.run(['ls'])\n";
        let result = scan(code, "python", &moderate());
        assert!(result.violations.iter().any(|v| v.rule_name == "warn_system_calls" && v.severity == Severity::Warning));
    }

    #[test]
    fn scan_soundness_no_error_severity_when_passed() {
        let code = "def square(n):\n    return n * n\n";
        let result = scan(code, "python", &strict());
        assert!(result.passed);
        assert!(result.violations.iter().all(|v| v.severity != Severity::Error));
    }
}
