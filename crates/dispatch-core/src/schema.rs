use crate::error::DispatchError;
use crate::template::{Field, Template};
use crate::workunit::WorkUnit;

/// Minimal collaborator standing in for the external schema/CSV layer: given
/// a schema implementation, the core can turn an input line into a
/// [`Template`] and recover a [`WorkUnit`]'s identity from a database or
/// output line. A full production schema (column remapping, output
/// replacement rules, omit rules) is intentionally not reproduced here.
pub trait Schema: Send + Sync {
    fn parse_template_line(&self, line: &str) -> Result<Template, DispatchError>;

    /// Recovers the work unit a database/output record line refers to, using
    /// `arity` secondary fields after the primary as the identity and
    /// discarding anything beyond that (engine output data, extra columns).
    fn extract_work_unit(&self, line: &str, arity: usize) -> Result<WorkUnit, DispatchError>;
}

/// Default `Schema` implementation: semicolon-delimited fields,
/// `primary;field1;field2;...`, where a field of the form `lo..hi` (integers,
/// `lo <= hi`) is a range and anything else is a literal.
pub struct SimpleSchema;

impl Schema for SimpleSchema {
    fn parse_template_line(&self, line: &str) -> Result<Template, DispatchError> {
        let mut parts = line.split(';');
        let primary_str = parts
            .next()
            .ok_or_else(|| DispatchError::Parse(format!("empty template line {line:?}")))?;
        let primary: i64 = primary_str
            .parse()
            .map_err(|_| DispatchError::Parse(format!("invalid primary key in {line:?}")))?;
        let fields = parts
            .map(Field::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Template::new(primary, fields))
    }

    fn extract_work_unit(&self, line: &str, arity: usize) -> Result<WorkUnit, DispatchError> {
        let mut parts = line.split(';');
        let primary_str = parts
            .next()
            .ok_or_else(|| DispatchError::Parse(format!("empty record line {line:?}")))?;
        let primary: i64 = primary_str
            .parse()
            .map_err(|_| DispatchError::Parse(format!("invalid primary key in {line:?}")))?;
        let secondary: Vec<String> = parts.by_ref().take(arity).map(str::to_string).collect();
        if secondary.len() < arity {
            return Err(DispatchError::Parse(format!(
                "record line {line:?} has fewer than {arity} secondary fields"
            )));
        }
        Ok(WorkUnit::new(primary, secondary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_literal_and_range_fields() {
        let schema = SimpleSchema;
        let t = schema.parse_template_line("5;alpha;1..3").unwrap();
        assert_eq!(t.primary(), 5);
        assert_eq!(t.fields().len(), 2);
        assert_eq!(t.cardinality(), 3);
    }

    #[test]
    fn extract_work_unit_matches_to_line_format() {
        let schema = SimpleSchema;
        let unit = WorkUnit::new(4, vec!["x".into()]);
        let parsed = schema.extract_work_unit(&unit.to_line(), 1).unwrap();
        assert_eq!(parsed, unit);
    }

    #[test]
    fn extract_work_unit_ignores_trailing_output_data() {
        let schema = SimpleSchema;
        let parsed = schema.extract_work_unit("1;a;done", 1).unwrap();
        assert_eq!(parsed, WorkUnit::new(1, vec!["a".into()]));
    }

    #[test]
    fn extract_work_unit_errors_on_too_few_secondary_fields() {
        let schema = SimpleSchema;
        assert!(schema.extract_work_unit("1;a", 2).is_err());
    }

    #[test]
    fn rejects_bad_primary() {
        let schema = SimpleSchema;
        assert!(schema.parse_template_line("notanumber;x").is_err());
    }
}
