//! Schema registry gating every mutation of the property tree.
//!
//! A [`ValidationRule`] binds a path pattern to a [`ValueType`]. Pattern
//! labels are literals, a single-label `*`, or a trailing `**` that
//! swallows the rest of the path. The most specific matching rule wins:
//! more literal labels first, then the longer literal prefix. A path no
//! rule matches cannot be written at all.
//!
//! Startup rules come from a JSON schema file (plus the built-in baseline
//! for the reserved subtrees) and are immutable afterwards; a daemon may
//! register additional rules at runtime, but only for its own
//! `@/settings/<daemon>/...` namespace.

use std::net::IpAddr;
use std::sync::{OnceLock, RwLock};

use regex::Regex;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::path::TreePath;

/// Semantic type of a property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueType {
    Str,
    Int,
    Bool,
    /// Integer followed by one of `s`/`m`/`h`/`d`.
    Duration,
    Ip,
    Mac,
    Uuid,
    Cidr,
    Enum(Vec<String>),
    Hostname,
}

fn mac_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-fA-F]{2}(:[0-9a-fA-F]{2}){5}$").expect("static regex"))
}

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("static regex")
    })
}

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+[smhd]$").expect("static regex"))
}

fn hostname_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$",
        )
        .expect("static regex")
    })
}

impl ValueType {
    /// Checks `value` against this type's acceptance predicate.
    fn accepts(&self, value: &str) -> Result<(), String> {
        match self {
            Self::Str => Ok(()),
            Self::Int => value
                .parse::<i64>()
                .map(|_| ())
                .map_err(|_| format!("{value:?} is not an integer")),
            Self::Bool => match value {
                "true" | "false" => Ok(()),
                _ => Err(format!("{value:?} is not a boolean")),
            },
            Self::Duration => {
                if duration_re().is_match(value) {
                    Ok(())
                } else {
                    Err(format!("{value:?} is not a duration (<int><s|m|h|d>)"))
                }
            }
            Self::Ip => value
                .parse::<IpAddr>()
                .map(|_| ())
                .map_err(|_| format!("{value:?} is not an IP address")),
            Self::Mac => {
                if mac_re().is_match(value) {
                    Ok(())
                } else {
                    Err(format!("{value:?} is not a MAC address"))
                }
            }
            Self::Uuid => {
                if uuid_re().is_match(value) {
                    Ok(())
                } else {
                    Err(format!("{value:?} is not a UUID"))
                }
            }
            Self::Cidr => parse_cidr(value),
            Self::Enum(allowed) => {
                if allowed.iter().any(|a| a == value) {
                    Ok(())
                } else {
                    Err(format!("{value:?} is not one of {allowed:?}"))
                }
            }
            Self::Hostname => {
                if value.len() <= 253 && hostname_re().is_match(value) {
                    Ok(())
                } else {
                    Err(format!("{value:?} is not a hostname"))
                }
            }
        }
    }
}

fn parse_cidr(value: &str) -> Result<(), String> {
    let err = || format!("{value:?} is not a CIDR block");
    let (addr, prefix) = value.split_once('/').ok_or_else(err)?;
    let addr: IpAddr = addr.parse().map_err(|_| err())?;
    let prefix: u8 = prefix.parse().map_err(|_| err())?;
    let max = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix <= max {
        Ok(())
    } else {
        Err(err())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternLabel {
    Literal(String),
    /// `*`: exactly one label.
    Single,
    /// `**`: the rest of the path, possibly empty. Trailing only.
    Rest,
}

/// A path pattern bound to a value type.
#[derive(Debug, Clone)]
pub struct ValidationRule {
    pattern: String,
    labels: Vec<PatternLabel>,
    value_type: ValueType,
}

impl ValidationRule {
    /// Compiles a pattern such as `@/clients/*/ipv4` or `@/users/**`.
    ///
    /// # Errors
    ///
    /// `BADPATH` when the pattern is malformed or `**` is not trailing.
    pub fn new(pattern: &str, value_type: ValueType) -> Result<Self, ConfigError> {
        let bad = |reason: &str| ConfigError::BadPath {
            path: pattern.to_string(),
            reason: reason.to_string(),
        };
        let raw: Vec<&str> = pattern.split('/').collect();
        if raw.first() != Some(&crate::path::ROOT_LABEL) {
            return Err(bad("pattern must be rooted at @"));
        }
        let mut labels = vec![PatternLabel::Literal(crate::path::ROOT_LABEL.to_string())];
        for (i, label) in raw[1..].iter().enumerate() {
            match *label {
                "" => return Err(bad("empty label")),
                "*" => labels.push(PatternLabel::Single),
                "**" => {
                    if i != raw.len() - 2 {
                        return Err(bad("** must be the final label"));
                    }
                    labels.push(PatternLabel::Rest);
                }
                lit => labels.push(PatternLabel::Literal(lit.to_string())),
            }
        }
        Ok(Self {
            pattern: pattern.to_string(),
            labels,
            value_type,
        })
    }

    /// The source pattern text.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    fn matches(&self, path: &TreePath) -> bool {
        let path_labels = path.labels();
        let mut i = 0;
        for label in &self.labels {
            match label {
                PatternLabel::Rest => return true,
                PatternLabel::Single => {
                    if i >= path_labels.len() {
                        return false;
                    }
                    i += 1;
                }
                PatternLabel::Literal(lit) => {
                    if path_labels.get(i).map(String::as_str) != Some(lit.as_str()) {
                        return false;
                    }
                    i += 1;
                }
            }
        }
        i == path_labels.len()
    }

    /// (literal label count, literal byte length): higher wins.
    fn specificity(&self) -> (usize, usize) {
        let mut count = 0;
        let mut bytes = 0;
        for label in &self.labels {
            if let PatternLabel::Literal(lit) = label {
                count += 1;
                bytes += lit.len();
            }
        }
        (count, bytes)
    }
}

/// One entry of the JSON schema file.
#[derive(Debug, Deserialize)]
struct RawRule {
    pattern: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    values: Vec<String>,
}

/// The rule registry.
///
/// Cheap to share behind an `Arc`; runtime registration takes the inner
/// write lock, matching is read-only.
#[derive(Debug, Default)]
pub struct Validator {
    rules: RwLock<Vec<ValidationRule>>,
}

impl Validator {
    /// An empty registry. Rejects every write until rules are added.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the baseline rules for the reserved
    /// subtrees every appliance carries.
    ///
    /// # Panics
    ///
    /// Never: the baseline patterns are static and well-formed.
    #[must_use]
    pub fn with_baseline() -> Self {
        let validator = Self::new();
        for (pattern, value_type) in baseline_rules() {
            validator
                .install(ValidationRule::new(pattern, value_type).expect("baseline pattern"))
                .expect("baseline install");
        }
        validator
    }

    /// Installs a startup rule. Used while loading the schema file, before
    /// the registry is shared.
    ///
    /// # Errors
    ///
    /// `EXISTS` when a rule with the same pattern is already installed.
    pub fn install(&self, rule: ValidationRule) -> Result<(), ConfigError> {
        let mut rules = self.rules.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if rules.iter().any(|r| r.pattern == rule.pattern) {
            return Err(ConfigError::Exists {
                path: rule.pattern.clone(),
            });
        }
        rules.push(rule);
        Ok(())
    }

    /// Loads startup rules from the JSON schema file format:
    /// `[{"pattern": "@/rings/*/vlan", "type": "int"}, ...]`.
    ///
    /// # Errors
    ///
    /// `VALIDATION` for unknown type names, `BADPATH` for malformed
    /// patterns, `EXISTS` for duplicates.
    pub fn load_schema(&self, json: &str) -> Result<usize, ConfigError> {
        let raw: Vec<RawRule> = serde_json::from_str(json).map_err(|err| ConfigError::Validation {
            path: String::new(),
            reason: format!("schema file: {err}"),
        })?;
        let count = raw.len();
        for entry in raw {
            let value_type = match entry.kind.as_str() {
                "string" => ValueType::Str,
                "int" => ValueType::Int,
                "bool" => ValueType::Bool,
                "duration" => ValueType::Duration,
                "ip" => ValueType::Ip,
                "mac" => ValueType::Mac,
                "uuid" => ValueType::Uuid,
                "cidr" => ValueType::Cidr,
                "enum" => ValueType::Enum(entry.values),
                "hostname" => ValueType::Hostname,
                other => {
                    return Err(ConfigError::Validation {
                        path: entry.pattern,
                        reason: format!("unknown type {other:?}"),
                    })
                }
            };
            self.install(ValidationRule::new(&entry.pattern, value_type)?)?;
        }
        tracing::debug!(count, "schema rules installed");
        Ok(count)
    }

    /// Registers a runtime rule for a daemon-owned setting.
    ///
    /// # Errors
    ///
    /// `UNAUTHORIZED` unless the pattern is a literal
    /// `@/settings/<daemon>/<name>` path; `EXISTS` on duplicates.
    pub fn register_setting(&self, rule: ValidationRule) -> Result<(), ConfigError> {
        let ok = rule.labels.len() == 4
            && rule.labels[1] == PatternLabel::Literal("settings".to_string())
            && rule
                .labels
                .iter()
                .all(|l| matches!(l, PatternLabel::Literal(_)));
        if !ok {
            tracing::warn!(pattern = %rule.pattern, "runtime rule outside @/settings refused");
            return Err(ConfigError::Unauthorized);
        }
        self.install(rule)
    }

    /// Validates a value about to be written at `path`.
    ///
    /// # Errors
    ///
    /// `VALIDATION` when the most specific matching rule rejects the value,
    /// or when no rule matches at all.
    pub fn validate(&self, path: &TreePath, value: &str) -> Result<(), ConfigError> {
        let rules = self.rules.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let best = rules
            .iter()
            .filter(|rule| rule.matches(path))
            .max_by_key(|rule| rule.specificity());
        match best {
            Some(rule) => rule
                .value_type
                .accepts(value)
                .map_err(|reason| ConfigError::Validation {
                    path: path.to_string(),
                    reason,
                }),
            None => Err(ConfigError::Validation {
                path: path.to_string(),
                reason: "no schema rule matches".to_string(),
            }),
        }
    }
}

/// Baseline rules for the reserved subtrees.
fn baseline_rules() -> Vec<(&'static str, ValueType)> {
    vec![
        ("@/apversion", ValueType::Str),
        ("@/clients/*/ring", ValueType::Str),
        ("@/clients/*/ipv4", ValueType::Ip),
        ("@/clients/*/dhcp_name", ValueType::Hostname),
        ("@/clients/*/dns_name", ValueType::Hostname),
        ("@/clients/*/identity", ValueType::Str),
        ("@/clients/*/confidence", ValueType::Str),
        ("@/rings/*/vlan", ValueType::Int),
        ("@/rings/*/subnet", ValueType::Cidr),
        ("@/rings/*/bridge", ValueType::Str),
        ("@/rings/*/vap", ValueType::Str),
        ("@/rings/*/auth", ValueType::Enum(vec![
            "wpa-psk".to_string(),
            "wpa-eap".to_string(),
            "open".to_string(),
        ])),
        // Secret fields are written opaquely.
        ("@/users/**", ValueType::Str),
        ("@/metrics/health/**", ValueType::Str),
        ("@/nodes/*/nics/**", ValueType::Str),
        ("@/network/vpn/client/*/wg/**", ValueType::Str),
        ("@/policy/site/vpn/client/*/enabled", ValueType::Bool),
        ("@/firewall/rules/*/rule", ValueType::Str),
        ("@/firewall/rules/*/active", ValueType::Bool),
    ]
}
