//! Case data document, flow predicates, and declared output schemas.
//!
//! The case data document is a JSON object mutated only under the case lock.
//! Predicates are typed path/op/literal triples evaluated against it with
//! XPath-style boolean coercion; evaluation errors are reported to the caller
//! so the runner can treat them as `false` and log them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Predicates ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredicateOp {
    Eq,
    Neq,
    Lt,
    Gt,
    /// True iff the path resolves to a value that coerces to true.
    Truthy,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Bool(bool),
    I64(i64),
    Str(String),
}

/// Predicate attached to a non-default outgoing flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// Dotted path into the case data document, e.g. `order.total`.
    pub path: String,
    pub op: PredicateOp,
    /// Comparison literal; ignored for `Truthy`.
    pub literal: Option<Literal>,
}

impl Predicate {
    pub fn truthy(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: PredicateOp::Truthy,
            literal: None,
        }
    }

    pub fn eq(path: impl Into<String>, literal: Literal) -> Self {
        Self {
            path: path.into(),
            op: PredicateOp::Eq,
            literal: Some(literal),
        }
    }

    pub fn gt(path: impl Into<String>, literal: Literal) -> Self {
        Self {
            path: path.into(),
            op: PredicateOp::Gt,
            literal: Some(literal),
        }
    }

    pub fn lt(path: impl Into<String>, literal: Literal) -> Self {
        Self {
            path: path.into(),
            op: PredicateOp::Lt,
            literal: Some(literal),
        }
    }

    /// Evaluate against a case data document.
    pub fn eval(&self, doc: &Value) -> Result<bool, PredicateError> {
        let found = lookup(doc, &self.path);
        match self.op {
            PredicateOp::Truthy => Ok(found.map(coerce_bool).unwrap_or(false)),
            PredicateOp::Eq | PredicateOp::Neq => {
                let lit = self.require_literal()?;
                let eq = match found {
                    Some(v) => value_eq(v, lit),
                    None => false,
                };
                Ok(if self.op == PredicateOp::Neq { !eq } else { eq })
            }
            PredicateOp::Lt | PredicateOp::Gt => {
                let lit = self.require_literal()?;
                let v = found.ok_or_else(|| PredicateError {
                    path: self.path.clone(),
                    reason: "path not present".to_string(),
                })?;
                let (a, b) = (as_number(v, &self.path)?, literal_number(lit, &self.path)?);
                Ok(if self.op == PredicateOp::Lt { a < b } else { a > b })
            }
        }
    }

    fn require_literal(&self) -> Result<&Literal, PredicateError> {
        self.literal.as_ref().ok_or_else(|| PredicateError {
            path: self.path.clone(),
            reason: "comparison predicate missing literal".to_string(),
        })
    }
}

/// Evaluation failure. Callers treat the predicate as `false` and record the
/// failure in the event log.
#[derive(Clone, Debug, PartialEq)]
pub struct PredicateError {
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for PredicateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "predicate on `{}`: {}", self.path, self.reason)
    }
}

/// Resolve a dotted path inside a JSON document.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = doc;
    for seg in path.split('.') {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

/// XPath-style boolean coercion: numbers are true unless zero or NaN,
/// strings unless empty, arrays/objects unless empty, null is false.
pub fn coerce_bool(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn value_eq(v: &Value, lit: &Literal) -> bool {
    match (v, lit) {
        (Value::Bool(a), Literal::Bool(b)) => a == b,
        (Value::Number(n), Literal::I64(b)) => n.as_i64() == Some(*b),
        (Value::String(a), Literal::Str(b)) => a == b,
        _ => false,
    }
}

fn as_number(v: &Value, path: &str) -> Result<f64, PredicateError> {
    v.as_f64().ok_or_else(|| PredicateError {
        path: path.to_string(),
        reason: format!("expected a number, found {v}"),
    })
}

fn literal_number(lit: &Literal, path: &str) -> Result<f64, PredicateError> {
    match lit {
        Literal::I64(n) => Ok(*n as f64),
        other => Err(PredicateError {
            path: path.to_string(),
            reason: format!("ordering comparison against non-numeric literal {other:?}"),
        }),
    }
}

// ─── Declared output schemas ──────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Bool,
    Number,
    String,
    Object,
    Array,
    Any,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// Schema a task declares for its output document. An empty schema accepts
/// any object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    pub fields: Vec<FieldSpec>,
}

impl OutputSchema {
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind, required: bool) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required,
        });
        self
    }

    /// Validate an output document. Returns the first violation.
    pub fn validate(&self, doc: &Value) -> Result<(), String> {
        let obj = doc
            .as_object()
            .ok_or_else(|| "output document must be a JSON object".to_string())?;
        for field in &self.fields {
            match obj.get(&field.name) {
                None => {
                    if field.required {
                        return Err(format!("missing required field `{}`", field.name));
                    }
                }
                Some(v) => {
                    let ok = match field.kind {
                        FieldKind::Bool => v.is_boolean(),
                        FieldKind::Number => v.is_number(),
                        FieldKind::String => v.is_string(),
                        FieldKind::Object => v.is_object(),
                        FieldKind::Array => v.is_array(),
                        FieldKind::Any => true,
                    };
                    if !ok {
                        return Err(format!(
                            "field `{}` has wrong type (expected {:?})",
                            field.name, field.kind
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

// ─── Output parameter mappings ────────────────────────────────

/// Copies one value from a task's output document into the case data
/// document when the task completes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputMapping {
    /// Dotted path in the output document.
    pub from: String,
    /// Dotted path in the case data document; intermediate objects are
    /// created as needed.
    pub to: String,
}

/// Apply mappings into the case document. Paths absent from the output
/// document are skipped. With no mappings declared, top-level output fields
/// are merged into the case document directly.
pub fn apply_output(case_doc: &mut Value, output: &Value, mappings: &[OutputMapping]) {
    if mappings.is_empty() {
        if let (Some(case_obj), Some(out_obj)) = (case_doc.as_object_mut(), output.as_object()) {
            for (k, v) in out_obj {
                case_obj.insert(k.clone(), v.clone());
            }
        }
        return;
    }
    for mapping in mappings {
        if let Some(v) = lookup(output, &mapping.from) {
            write_path(case_doc, &mapping.to, v.clone());
        }
    }
}

fn write_path(doc: &mut Value, path: &str, value: Value) {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    let mut cur = doc;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, seg) in segments.iter().enumerate() {
        let obj = cur.as_object_mut().expect("cursor is always an object");
        if i == segments.len() - 1 {
            obj.insert(seg.to_string(), value);
            return;
        }
        let next = obj
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !next.is_object() {
            *next = Value::Object(Map::new());
        }
        cur = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthy_coercion_follows_xpath_rules() {
        let doc = json!({"n": 0, "m": 3, "s": "", "t": "x", "flag": true});
        assert!(!Predicate::truthy("n").eval(&doc).unwrap());
        assert!(Predicate::truthy("m").eval(&doc).unwrap());
        assert!(!Predicate::truthy("s").eval(&doc).unwrap());
        assert!(Predicate::truthy("t").eval(&doc).unwrap());
        assert!(Predicate::truthy("flag").eval(&doc).unwrap());
        // Missing path coerces to false, not an error.
        assert!(!Predicate::truthy("absent").eval(&doc).unwrap());
    }

    #[test]
    fn comparison_predicates() {
        let doc = json!({"order": {"total": 250, "region": "EU"}});
        assert!(Predicate::gt("order.total", Literal::I64(100))
            .eval(&doc)
            .unwrap());
        assert!(!Predicate::lt("order.total", Literal::I64(100))
            .eval(&doc)
            .unwrap());
        assert!(
            Predicate::eq("order.region", Literal::Str("EU".to_string()))
                .eval(&doc)
                .unwrap()
        );
    }

    #[test]
    fn ordering_on_non_number_is_an_error() {
        let doc = json!({"region": "EU"});
        let err = Predicate::gt("region", Literal::I64(1)).eval(&doc).unwrap_err();
        assert!(err.reason.contains("expected a number"));
    }

    #[test]
    fn schema_validation() {
        let schema = OutputSchema::default()
            .field("approved", FieldKind::Bool, true)
            .field("note", FieldKind::String, false);

        assert!(schema.validate(&json!({"approved": true})).is_ok());
        assert!(schema
            .validate(&json!({"approved": true, "note": "ok"}))
            .is_ok());
        assert!(schema.validate(&json!({})).is_err());
        assert!(schema.validate(&json!({"approved": "yes"})).is_err());
        assert!(schema.validate(&json!(42)).is_err());
    }

    #[test]
    fn output_mappings_write_nested_paths() {
        let mut case_doc = json!({"existing": 1});
        let output = json!({"result": {"score": 9}});
        apply_output(
            &mut case_doc,
            &output,
            &[OutputMapping {
                from: "result.score".to_string(),
                to: "review.score".to_string(),
            }],
        );
        assert_eq!(case_doc, json!({"existing": 1, "review": {"score": 9}}));
    }

    #[test]
    fn empty_mappings_merge_top_level() {
        let mut case_doc = json!({"a": 1});
        apply_output(&mut case_doc, &json!({"b": 2}), &[]);
        assert_eq!(case_doc, json!({"a": 1, "b": 2}));
    }
}
