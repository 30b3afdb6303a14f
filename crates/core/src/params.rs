use std::collections::BTreeMap;

/// Parameter groups accepted by default: the magnet/stator geometry group,
/// the furling geometry group, and free-form user overrides.
pub const DEFAULT_ALLOWED_GROUPS: &[&str] = &["magnafpm", "furling", "user"];

/// A single coerced parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// The literal tokens `true` / `false`.
    Bool(bool),
    /// A token that parses as a 64-bit integer.
    Int(i64),
    /// A token that parses as a finite float (and not as an integer).
    Float(f64),
    /// Anything else, verbatim.
    Str(String),
}

impl ParamValue {
    /// Coerce a raw query token. Total: every token maps to some value.
    pub fn coerce(raw: &str) -> Self {
        match raw {
            "true" => return ParamValue::Bool(true),
            "false" => return ParamValue::Bool(false),
            _ => {}
        }
        if let Ok(n) = raw.parse::<i64>() {
            return ParamValue::Int(n);
        }
        if let Ok(f) = raw.parse::<f64>() {
            if f.is_finite() {
                return ParamValue::Float(f);
            }
        }
        ParamValue::Str(raw.to_string())
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Bool(b) => serde_json::Value::Bool(*b),
            ParamValue::Int(n) => serde_json::Value::from(*n),
            ParamValue::Float(f) => {
                // Finite by construction, so Number::from_f64 cannot reject it.
                serde_json::Number::from_f64(*f)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
            ParamValue::Str(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// Parameters grouped by prefix, both levels ordered.
///
/// `BTreeMap` at both levels means the canonical encoding falls out of plain
/// serialization: keys are already sorted.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParamGroups(
    /// Group name → parameter name → value.
    pub BTreeMap<String, BTreeMap<String, ParamValue>>,
);

impl ParamGroups {
    /// Canonical JSON form: sorted group names, sorted parameter names,
    /// values in their coerced native type.
    pub fn canonical_json(&self) -> serde_json::Value {
        let groups: serde_json::Map<String, serde_json::Value> = self
            .0
            .iter()
            .map(|(group, params)| {
                let inner: serde_json::Map<String, serde_json::Value> = params
                    .iter()
                    .map(|(name, value)| (name.clone(), value.to_json()))
                    .collect();
                (group.clone(), serde_json::Value::Object(inner))
            })
            .collect();
        serde_json::Value::Object(groups)
    }
}

/// Rejected request parameters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    /// The key has no `group.name` shape.
    #[error("malformed parameter key {0:?}: expected group.name")]
    MalformedKey(String),
    /// The group prefix is not in the allowed set.
    #[error("unknown parameter group {0:?}")]
    UnknownGroup(String),
    /// The same `group.name` appeared twice.
    #[error("duplicate parameter {0:?}")]
    DuplicateKey(String),
}

/// Group and coerce decoded query pairs into [`ParamGroups`].
///
/// Keys are dotted (`magnafpm.RotorDiskRadius=150`); the prefix must be one
/// of `allowed_groups`. Values go through [`ParamValue::coerce`].
pub fn parse_query_pairs<'a, I>(pairs: I, allowed_groups: &[String]) -> Result<ParamGroups, ParamError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut groups: BTreeMap<String, BTreeMap<String, ParamValue>> = BTreeMap::new();
    for (key, raw) in pairs {
        let Some((group, name)) = key.split_once('.') else {
            return Err(ParamError::MalformedKey(key.to_string()));
        };
        if group.is_empty() || name.is_empty() {
            return Err(ParamError::MalformedKey(key.to_string()));
        }
        if !allowed_groups.iter().any(|allowed| allowed == group) {
            return Err(ParamError::UnknownGroup(group.to_string()));
        }
        let entry = groups.entry(group.to_string()).or_default();
        if entry
            .insert(name.to_string(), ParamValue::coerce(raw))
            .is_some()
        {
            return Err(ParamError::DuplicateKey(key.to_string()));
        }
    }
    Ok(ParamGroups(groups))
}
