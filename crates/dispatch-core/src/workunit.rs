use std::cmp::Ordering;
use std::fmt;

/// A single concrete input tuple handed to the engine: a primary key plus an
/// ordered sequence of secondary (string) keys. Equality, hashing and
/// ordering are all joint over both fields.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct WorkUnit {
    primary: i64,
    secondary: Vec<String>,
}

impl WorkUnit {
    pub fn new(primary: i64, secondary: Vec<String>) -> Self {
        WorkUnit { primary, secondary }
    }

    pub fn primary(&self) -> i64 {
        self.primary
    }

    pub fn secondary(&self) -> &[String] {
        &self.secondary
    }

    /// `primary;secondary1;secondary2;...`
    pub fn to_line(&self) -> String {
        let mut s = self.primary.to_string();
        for field in &self.secondary {
            s.push(';');
            s.push_str(field);
        }
        s
    }

    /// Parses a line of the form `primary;secondary1;secondary2;...` that was
    /// produced by [`WorkUnit::to_line`].
    pub fn from_line(line: &str) -> Option<WorkUnit> {
        let mut parts = line.split(';');
        let primary = parts.next()?.parse().ok()?;
        let secondary = parts.map(|s| s.to_string()).collect();
        Some(WorkUnit::new(primary, secondary))
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line())
    }
}

impl PartialOrd for WorkUnit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkUnit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.primary
            .cmp(&other.primary)
            .then_with(|| self.secondary.cmp(&other.secondary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_joint_lexicographic() {
        let a = WorkUnit::new(1, vec!["a".into()]);
        let b = WorkUnit::new(1, vec!["b".into()]);
        let c = WorkUnit::new(2, vec!["a".into()]);
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn equality_depends_on_both_keys() {
        let a = WorkUnit::new(1, vec!["x".into(), "y".into()]);
        let b = WorkUnit::new(1, vec!["x".into(), "y".into()]);
        let c = WorkUnit::new(1, vec!["x".into(), "z".into()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn line_round_trip() {
        let u = WorkUnit::new(-3, vec!["alpha".into(), "12".into()]);
        let line = u.to_line();
        assert_eq!(line, "-3;alpha;12");
        assert_eq!(WorkUnit::from_line(&line).unwrap(), u);
    }

    #[test]
    fn from_line_rejects_missing_primary() {
        assert!(WorkUnit::from_line("").is_none());
        assert!(WorkUnit::from_line("notanumber;x").is_none());
    }
}
