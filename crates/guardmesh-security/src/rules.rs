//! Hard-coded regex rules: the fast first line of defence.
//!
//! Rules cover the well-known attack families. They are compiled once in
//! the constructor; every rule is tried on each check (ordering is
//! irrelevant) and new rules can be added at runtime.

use guardmesh_core::{GuardError, Result, Severity};
use regex::{Regex, RegexBuilder};

/// A compiled, named detection rule.
pub struct FilterRule {
    pub name: String,
    pub severity: Severity,
    regex: Regex,
}

/// Outcome of a filter check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleVerdict {
    pub blocked: bool,
    /// Names of every rule that matched.
    pub matched: Vec<String>,
}

impl RuleVerdict {
    /// Highest severity among the matched rules, if any.
    pub fn worst_severity(&self, filter: &RegexFilter) -> Option<Severity> {
        self.matched
            .iter()
            .filter_map(|name| filter.rule_severity(name))
            .max()
    }
}

/// Default rule table: `(name, pattern, severity)`.
///
/// Patterns are matched case-insensitively. They intentionally favour
/// recall over precision; the pipeline treats any match as a block.
const DEFAULT_RULES: &[(&str, &str, Severity)] = &[
    // --- command injection ------------------------------------------------
    ("rm_rf", r"\brm\s+-(?:[a-z]*r[a-z]*f|[a-z]*f[a-z]*r)\b", Severity::Critical),
    ("fork_bomb", r":\(\)\s*\{\s*:\|:\s*&\s*\}", Severity::Critical),
    ("disk_overwrite", r"\bdd\s+if=/dev/(?:zero|random|urandom)\s+of=/dev/", Severity::Critical),
    ("shell_chain_fetch", r"[;|&`$]\s*(?:wget|curl)\b", Severity::High),
    ("mkfs", r"\bmkfs\.[a-z0-9]+\s+/dev/", Severity::Critical),
    // --- privilege escalation --------------------------------------------
    ("sudo_shell", r"\bsudo\s+(?:su\b|-i\b|bash\b|sh\b)", Severity::High),
    ("setuid_chmod", r"\bchmod\s+(?:\+s|[0-7]*[4-7][0-7]{3})\s", Severity::High),
    ("passwd_write", r"(?:>>?|\btee\b).{0,40}/etc/(?:passwd|shadow|sudoers)", Severity::Critical),
    // --- prompt injection -------------------------------------------------
    ("ignore_instructions", r"\bignore\s+(?:all\s+|any\s+)?(?:previous|prior|above|earlier)\s+(?:instructions|prompts|rules|directives)", Severity::High),
    ("ignore_generic", r"\b(?:disregard|forget|override)\s+(?:your|all|the)\s+(?:instructions|rules|guidelines|training)", Severity::High),
    ("role_injection", r"(?:^|\n)\s*(?:system|assistant)\s*:", Severity::Medium),
    ("prompt_extraction", r"\b(?:reveal|show|print|repeat)\b.{0,30}\b(?:system\s+prompt|initial\s+instructions)", Severity::High),
    ("jailbreak_persona", r"\b(?:you\s+are\s+now|act\s+as)\s+(?:dan|dude|an?\s+unrestricted)", Severity::High),
    // --- injection families ----------------------------------------------
    ("sql_injection", r"\bunion\s+(?:all\s+)?select\b|'\s*or\s+'?1'?\s*=\s*'?1|;\s*drop\s+table\b", Severity::High),
    ("nosql_injection", r#"\$(?:where|ne|gt|regex)\s*['":]"#, Severity::High),
    ("ldap_injection", r"\)\s*\(\s*[|&]\s*\(", Severity::Medium),
    ("xml_entity", r"<!ENTITY\b|<!DOCTYPE[^>]*\bSYSTEM\b", Severity::High),
    ("ssti", r"\{\{\s*(?:config|self|request|[0-9]+\s*\*\s*[0-9]+)", Severity::High),
    ("xss_script", r"<script\b|javascript\s*:|\bonerror\s*=", Severity::Medium),
    ("jwt_alg_none", r#""alg"\s*:\s*"none""#, Severity::High),
    ("path_traversal", r"\.\./\.\./|\.\.\\\.\.\\|%2e%2e%2f", Severity::High),
    ("ssrf_metadata", r"169\.254\.169\.254|metadata\.google\.internal|\blocalhost:2375\b", Severity::High),
    // --- post-exploitation ------------------------------------------------
    ("reverse_shell", r"\bbash\s+-i\s+>&\s*/dev/tcp/|\bnc\b[^\n]{0,40}\s-e\s+/bin/(?:ba)?sh|\bsocat\b[^\n]{0,40}\bexec\b", Severity::Critical),
    ("container_escape", r"/var/run/docker\.sock|\bnsenter\b|--privileged\b|/proc/1/root", Severity::Critical),
    ("credential_exfil", r"\.aws/credentials|\.ssh/id_rsa|aws_secret_access_key|\bcat\b[^\n]{0,40}\.env\b", Severity::Critical),
    ("etc_passwd_read", r"\bcat\b[^\n]{0,30}/etc/(?:passwd|shadow)", Severity::High),
    ("env_exfil", r"\b(?:printenv|env)\b\s*\|\s*(?:curl|wget|nc)\b", Severity::Critical),
    ("crypto_mining", r"\bxmrig\b|stratum\+tcp://|\bminerd\b", Severity::High),
    ("supply_chain_pipe", r"\b(?:curl|wget)\b[^\n|]{0,120}\|\s*(?:ba)?sh\b", Severity::Critical),
    ("history_wipe", r"\bhistory\s+-c\b|\bshred\b[^\n]{0,30}bash_history", Severity::Medium),
];

/// The static regex filter.
pub struct RegexFilter {
    rules: Vec<FilterRule>,
}

impl RegexFilter {
    /// Compile the default rule set.
    pub fn new() -> Result<Self> {
        let mut filter = Self { rules: Vec::new() };
        for (name, pattern, severity) in DEFAULT_RULES {
            filter.push_rule(name, pattern, *severity)?;
        }
        Ok(filter)
    }

    /// Add a rule at runtime. Case-insensitive like the built-ins.
    pub fn add_rule(&mut self, name: &str, pattern: &str, severity: Severity) -> Result<()> {
        self.push_rule(name, pattern, severity)
    }

    fn push_rule(&mut self, name: &str, pattern: &str, severity: Severity) -> Result<()> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| GuardError::Rule(format!("rule '{name}' failed to compile: {e}")))?;
        self.rules.push(FilterRule {
            name: name.to_string(),
            severity,
            regex,
        });
        Ok(())
    }

    /// Try every rule. Blocked iff at least one matches.
    pub fn check(&self, text: &str) -> RuleVerdict {
        let matched: Vec<String> = self
            .rules
            .iter()
            .filter(|rule| rule.regex.is_match(text))
            .map(|rule| rule.name.clone())
            .collect();
        RuleVerdict {
            blocked: !matched.is_empty(),
            matched,
        }
    }

    pub fn rule_severity(&self, name: &str) -> Option<Severity> {
        self.rules
            .iter()
            .find(|rule| rule.name == name)
            .map(|rule| rule.severity)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
