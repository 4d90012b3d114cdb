use crate::error::DispatchError;
use crate::workunit::WorkUnit;

/// A single secondary-input slot in a [`Template`]: either a fixed literal or
/// an inclusive integer range that expands to one work unit per value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Literal(String),
    Range { lo: i64, hi: i64 },
}

impl Field {
    fn cardinality(&self) -> u64 {
        match self {
            Field::Literal(_) => 1,
            Field::Range { lo, hi } => (hi - lo + 1) as u64,
        }
    }

    fn to_strings(&self) -> Vec<String> {
        match self {
            Field::Literal(s) => vec![s.clone()],
            Field::Range { lo, hi } => (*lo..=*hi).map(|i| i.to_string()).collect(),
        }
    }

    /// Parses a single secondary field, recognizing `min..max` as a range
    /// and anything else as a literal. Matches the `min..max` grammar the
    /// original tool's template loader accepted.
    pub fn parse(field: &str) -> Result<Field, DispatchError> {
        if let Some(idx) = field.find("..") {
            let lo_s = &field[..idx];
            let hi_s = &field[idx + 2..];
            let lo: i64 = lo_s
                .parse()
                .map_err(|_| DispatchError::Parse(format!("invalid range bound in {field:?}")))?;
            let hi: i64 = hi_s
                .parse()
                .map_err(|_| DispatchError::Parse(format!("invalid range bound in {field:?}")))?;
            if lo > hi {
                return Err(DispatchError::Parse(format!(
                    "range should be of the form min..max with min<=max, got {field:?}"
                )));
            }
            Ok(Field::Range { lo, hi })
        } else {
            Ok(Field::Literal(field.to_string()))
        }
    }
}

/// A compact Cartesian descriptor: one primary key plus a sequence of
/// secondary fields, each either a literal or a range. Expanding it yields
/// one [`WorkUnit`] per combination of field values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    primary: i64,
    fields: Vec<Field>,
}

impl Template {
    pub fn new(primary: i64, fields: Vec<Field>) -> Self {
        Template { primary, fields }
    }

    pub fn primary(&self) -> i64 {
        self.primary
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Product of each field's cardinality; the number of work units this
    /// template expands to.
    pub fn cardinality(&self) -> u64 {
        self.fields.iter().map(Field::cardinality).product()
    }

    /// Splits this template along its largest range field into `parts`
    /// roughly equal sub-templates (all but the last get `len / parts`
    /// values, the last absorbs the remainder), so that repeated splitting
    /// drives cardinality under `max_per_template`. Returns `vec![self]`
    /// unchanged if already within budget or there is no range field to
    /// split (an all-literal template already has cardinality 1).
    pub fn split(self, max_per_template: u64) -> Vec<Template> {
        if max_per_template == 0 || self.cardinality() <= max_per_template {
            return vec![self];
        }
        let Some((largest_idx, len)) = self
            .fields
            .iter()
            .enumerate()
            .filter_map(|(i, f)| match f {
                Field::Range { lo, hi } => Some((i, (hi - lo + 1) as u64)),
                Field::Literal(_) => None,
            })
            .max_by_key(|&(_, len)| len)
        else {
            // No range field but still over budget: nothing left to split on.
            return vec![self];
        };
        if len <= 1 {
            return vec![self];
        }
        let cardinality = self.cardinality();
        let parts = ((cardinality + max_per_template - 1) / max_per_template)
            .clamp(1, len);

        let Field::Range { lo, hi } = self.fields[largest_idx] else {
            unreachable!()
        };
        let chunk = len / parts;
        let mut sub_templates = Vec::new();
        let mut start = lo;
        for part in 0..parts {
            let end = if part == parts - 1 {
                hi
            } else {
                start + chunk as i64 - 1
            };
            let mut fields = self.fields.clone();
            fields[largest_idx] = Field::Range { lo: start, hi: end };
            sub_templates.push(Template::new(self.primary, fields));
            start = end + 1;
        }

        sub_templates
            .into_iter()
            .flat_map(|t| t.split(max_per_template))
            .collect()
    }

    /// Materializes every work unit this template describes, via recursive
    /// cartesian expansion over the secondary fields.
    pub fn expand(&self) -> Vec<WorkUnit> {
        let mut results = Vec::new();
        expand_from(self.primary, &self.fields, Vec::new(), &mut results);
        results
    }
}

fn expand_from(
    primary: i64,
    remaining: &[Field],
    prefix: Vec<String>,
    out: &mut Vec<WorkUnit>,
) {
    match remaining.split_first() {
        None => out.push(WorkUnit::new(primary, prefix)),
        Some((field, rest)) => {
            for value in field.to_strings() {
                let mut next = prefix.clone();
                next.push(value);
                expand_from(primary, rest, next, out);
            }
        }
    }
}
