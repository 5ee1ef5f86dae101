use once_cell::sync::Lazy;
use regex::Regex;

use crate::ConduitError;
use crate::engine::{EngineKind, ParamValue};

/// One bound parameter: the placeholder name it satisfies plus the value.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedParameter {
    pub name: String,
    pub value: ParamValue,
}

/// Outcome of parameter processing: the SQL rewritten to the engine's
/// marker style plus the ordered parameter list matching those markers.
#[derive(Debug, Clone)]
pub struct BoundQuery {
    pub sql: String,
    pub params: Vec<TypedParameter>,
}

impl BoundQuery {
    pub fn values(&self) -> Vec<ParamValue> {
        self.params.iter().map(|p| p.value.clone()).collect()
    }
}

/// Engine-neutral placeholders look like `:name`. A preceding `:` is a
/// cast, not a placeholder.
static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").unwrap());

struct Placeholder<'a> {
    name: &'a str,
    start: usize,
    end: usize,
}

fn placeholders(sql: &str) -> Vec<Placeholder<'_>> {
    PLACEHOLDER_RE
        .captures_iter(sql)
        .filter_map(|caps| {
            let m = caps.get(0)?;
            if m.start() > 0 && sql.as_bytes()[m.start() - 1] == b':' {
                return None;
            }
            let name = caps.get(1)?;
            Some(Placeholder {
                name: name.as_str(),
                start: m.start(),
                end: m.end(),
            })
        })
        .collect()
}

/// Convert a JSON parameter object (named) or array (positional) plus a SQL
/// template into an ordered parameter list and the template rewritten to the
/// target engine's marker style. Strict in both directions: placeholders
/// without values and values without placeholders are rejected.
pub fn process_parameters(
    params_json: Option<&serde_json::Value>,
    sql_template: &str,
    engine: EngineKind,
) -> Result<BoundQuery, ConduitError> {
    let slots = placeholders(sql_template);

    let ordered: Vec<TypedParameter> = match params_json {
        None | Some(serde_json::Value::Null) => {
            if let Some(first) = slots.first() {
                return Err(ConduitError::Validation(format!(
                    "query requires parameter :{} but none were supplied",
                    first.name
                )));
            }
            Vec::new()
        }
        Some(serde_json::Value::Object(map)) => {
            for placeholder in &slots {
                if !map.contains_key(placeholder.name) {
                    return Err(ConduitError::Validation(format!(
                        "missing value for parameter :{}",
                        placeholder.name
                    )));
                }
            }
            for key in map.keys() {
                if !slots.iter().any(|p| p.name == key) {
                    return Err(ConduitError::Validation(format!(
                        "parameter {key} is not referenced by the query"
                    )));
                }
            }
            slots
                .iter()
                .map(|placeholder| {
                    let value = convert_value(&map[placeholder.name], placeholder.name)?;
                    Ok(TypedParameter {
                        name: placeholder.name.to_string(),
                        value,
                    })
                })
                .collect::<Result<_, ConduitError>>()?
        }
        Some(serde_json::Value::Array(values)) => {
            if values.len() != slots.len() {
                return Err(ConduitError::Validation(format!(
                    "query expects {} parameters, got {}",
                    slots.len(),
                    values.len()
                )));
            }
            slots
                .iter()
                .zip(values)
                .enumerate()
                .map(|(index, (placeholder, value))| {
                    let value = convert_value(value, &index.to_string())?;
                    Ok(TypedParameter {
                        name: placeholder.name.to_string(),
                        value,
                    })
                })
                .collect::<Result<_, ConduitError>>()?
        }
        Some(other) => {
            return Err(ConduitError::Validation(format!(
                "parameters must be a JSON object or array, got {}",
                json_type_name(other)
            )));
        }
    };

    Ok(BoundQuery {
        sql: rewrite_markers(sql_template, &slots, engine),
        params: ordered,
    })
}

/// Replace each placeholder with the engine's native marker, preserving
/// order. PostgreSQL takes ordinal `$n` markers, everything else `?`.
fn rewrite_markers(sql: &str, slots: &[Placeholder<'_>], engine: EngineKind) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut cursor = 0;
    for (ordinal, placeholder) in slots.iter().enumerate() {
        out.push_str(&sql[cursor..placeholder.start]);
        if engine.uses_ordinal_markers() {
            out.push('$');
            out.push_str(&(ordinal + 1).to_string());
        } else {
            out.push('?');
        }
        cursor = placeholder.end;
    }
    out.push_str(&sql[cursor..]);
    out
}

fn convert_value(value: &serde_json::Value, key: &str) -> Result<ParamValue, ConduitError> {
    match value {
        serde_json::Value::String(s) => Ok(ParamValue::Text(s.clone())),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(ParamValue::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(ParamValue::Real(f))
            } else {
                Err(ConduitError::Validation(format!(
                    "parameter {key} is out of range"
                )))
            }
        }
        serde_json::Value::Bool(b) => Ok(ParamValue::Boolean(*b)),
        serde_json::Value::Null => Ok(ParamValue::Null),
        other => Err(ConduitError::Validation(format!(
            "parameter {key} has unsupported type {}",
            json_type_name(other)
        ))),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TEMPLATE: &str =
        "SELECT * FROM users WHERE org = :org AND age > :age AND active = :active";

    #[test]
    fn named_parameters_bind_in_template_order() {
        let params = json!({"age": 21, "org": "acme", "active": true});
        let bound = process_parameters(Some(&params), TEMPLATE, EngineKind::Sqlite).unwrap();
        assert_eq!(
            bound.sql,
            "SELECT * FROM users WHERE org = ? AND age > ? AND active = ?"
        );
        assert_eq!(
            bound.params,
            vec![
                TypedParameter { name: "org".into(), value: ParamValue::Text("acme".into()) },
                TypedParameter { name: "age".into(), value: ParamValue::Integer(21) },
                TypedParameter { name: "active".into(), value: ParamValue::Boolean(true) },
            ]
        );
    }

    #[test]
    fn binding_is_deterministic() {
        let params = json!({"age": 21, "org": "acme", "active": true});
        let first = process_parameters(Some(&params), TEMPLATE, EngineKind::Sqlite).unwrap();
        for _ in 0..10 {
            let again = process_parameters(Some(&params), TEMPLATE, EngineKind::Sqlite).unwrap();
            assert_eq!(again.params, first.params);
        }
    }

    #[test]
    fn postgres_gets_ordinal_markers() {
        let params = json!({"org": "acme", "age": 3, "active": false});
        let bound = process_parameters(Some(&params), TEMPLATE, EngineKind::Postgres).unwrap();
        assert_eq!(
            bound.sql,
            "SELECT * FROM users WHERE org = $1 AND age > $2 AND active = $3"
        );
    }

    #[test]
    fn positional_array_binds_by_appearance() {
        let params = json!(["acme", 21, null]);
        let bound = process_parameters(Some(&params), TEMPLATE, EngineKind::Mysql).unwrap();
        assert_eq!(bound.params[0].value, ParamValue::Text("acme".into()));
        assert_eq!(bound.params[2].value, ParamValue::Null);
    }

    #[test]
    fn repeated_placeholder_consumes_one_marker_each() {
        let sql = "SELECT :v AS a, :v AS b";
        let params = json!({"v": 1.5});
        let bound = process_parameters(Some(&params), sql, EngineKind::Postgres).unwrap();
        assert_eq!(bound.sql, "SELECT $1 AS a, $2 AS b");
        assert_eq!(bound.params.len(), 2);
        assert_eq!(bound.params[1].value, ParamValue::Real(1.5));
    }

    #[test]
    fn missing_parameter_is_rejected() {
        let params = json!({"org": "acme", "age": 21});
        let err = process_parameters(Some(&params), TEMPLATE, EngineKind::Sqlite).unwrap_err();
        assert!(err.to_string().contains("active"));
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let params = json!({"org": "acme", "age": 21, "active": true, "extra": 1});
        let err = process_parameters(Some(&params), TEMPLATE, EngineKind::Sqlite).unwrap_err();
        assert!(err.to_string().contains("extra"));
    }

    #[test]
    fn positional_count_mismatch_is_rejected() {
        let params = json!(["acme", 21]);
        assert!(process_parameters(Some(&params), TEMPLATE, EngineKind::Sqlite).is_err());
    }

    #[test]
    fn nested_values_are_rejected_by_name() {
        let params = json!({"org": {"nested": true}, "age": 1, "active": true});
        let err = process_parameters(Some(&params), TEMPLATE, EngineKind::Sqlite).unwrap_err();
        assert!(err.to_string().contains("org"));
        assert!(err.to_string().contains("object"));
    }

    #[test]
    fn template_without_placeholders_accepts_absent_params() {
        let bound = process_parameters(None, "SELECT 1", EngineKind::Postgres).unwrap();
        assert!(bound.params.is_empty());
        assert_eq!(bound.sql, "SELECT 1");
    }

    #[test]
    fn absent_params_with_placeholders_is_rejected() {
        assert!(process_parameters(None, TEMPLATE, EngineKind::Sqlite).is_err());
    }

    #[test]
    fn double_colon_cast_is_not_a_placeholder() {
        let sql = "SELECT total::text FROM orders WHERE id = :id";
        let params = json!({"id": 9});
        let bound = process_parameters(Some(&params), sql, EngineKind::Postgres).unwrap();
        assert_eq!(bound.sql, "SELECT total::text FROM orders WHERE id = $1");
        assert_eq!(bound.params.len(), 1);
    }
}
