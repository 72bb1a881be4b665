#![forbid(unsafe_code)]

//! Change-detection equality policy.

use crate::value::Value;

/// How a watcher decides whether its value changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Equality {
    /// Identity: composites must be the same handle. Two `NaN`s count as
    /// equal so a `NaN`-valued watch can settle.
    #[default]
    Reference,
    /// Structure: the watcher stores a deep copy and compares recursively.
    Deep,
}

impl From<bool> for Equality {
    /// `true` selects [`Equality::Deep`].
    fn from(value_eq: bool) -> Self {
        if value_eq { Self::Deep } else { Self::Reference }
    }
}

impl Equality {
    /// Whether `new` and `old` count as unchanged.
    #[must_use]
    pub fn are_equal(self, new: &Value, old: &Value) -> bool {
        match self {
            Self::Deep => new.deep_eq(old),
            Self::Reference => (new.is_nan() && old.is_nan()) || new.same(old),
        }
    }

    /// The copy a watcher keeps as its last-seen value.
    pub(crate) fn snapshot(self, value: &Value) -> Value {
        match self {
            Self::Deep => value.deep_clone(),
            Self::Reference => value.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_mode_treats_nan_as_equal() {
        let nan = Value::from(f64::NAN);
        assert!(Equality::Reference.are_equal(&nan, &Value::from(f64::NAN)));
        assert!(!Equality::Reference.are_equal(&nan, &Value::from(1)));
    }

    #[test]
    fn reference_mode_ignores_structure() {
        let a = Value::list([1, 2]);
        let b = Value::list([1, 2]);
        assert!(!Equality::Reference.are_equal(&a, &b));
        assert!(Equality::Reference.are_equal(&a, &a.clone()));
    }

    #[test]
    fn deep_mode_compares_structure() {
        let a = Value::list([1, 2]);
        assert!(Equality::Deep.are_equal(&a, &Value::list([1, 2])));
        assert!(!Equality::Deep.are_equal(&a, &Value::list([2, 1])));
    }

    #[test]
    fn snapshot_detaches_only_in_deep_mode() {
        let a = Value::list([1]);
        assert!(Equality::Reference.snapshot(&a).same(&a));
        let copy = Equality::Deep.snapshot(&a);
        assert!(!copy.same(&a));
        assert!(copy.deep_eq(&a));
    }

    #[test]
    fn bool_flag_maps_to_mode() {
        assert_eq!(Equality::from(true), Equality::Deep);
        assert_eq!(Equality::from(false), Equality::Reference);
    }
}
