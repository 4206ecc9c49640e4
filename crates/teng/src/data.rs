/*
 * data.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! The caller-built data tree.
//!
//! A [`Fragment`] is an insertion-ordered mapping from name to
//! [`FragmentValue`]; a value is a scalar, one nested fragment, or a
//! [`FragmentList`]. The caller constructs the tree before rendering and the
//! processor treats it as read-only -- frames in the fragment stack borrow
//! directly from it.

use hashlink::LinkedHashMap;

/// One value stored under a name inside a fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentValue {
    String(String),
    Integral(i64),
    Real(f64),
    Fragment(Box<Fragment>),
    List(FragmentList),
}

impl FragmentValue {
    /// The nested fragment list, when this value is iterable. A single
    /// nested fragment behaves as a one-element list.
    pub fn nested_list(&self) -> Option<NestedFragments<'_>> {
        match self {
            FragmentValue::List(list) => Some(NestedFragments::List(list)),
            FragmentValue::Fragment(frag) => Some(NestedFragments::Single(frag)),
            _ => None,
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            FragmentValue::String(_) | FragmentValue::Integral(_) | FragmentValue::Real(_)
        )
    }
}

/// Borrowed view over the fragments nested under a name.
#[derive(Debug, Clone, Copy)]
pub enum NestedFragments<'d> {
    List(&'d FragmentList),
    Single(&'d Fragment),
}

impl<'d> NestedFragments<'d> {
    pub fn as_slice(&self) -> &'d [Fragment] {
        match self {
            NestedFragments::List(list) => list.as_slice(),
            NestedFragments::Single(frag) => std::slice::from_ref(frag),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl From<&str> for FragmentValue {
    fn from(value: &str) -> Self {
        FragmentValue::String(value.to_string())
    }
}

impl From<String> for FragmentValue {
    fn from(value: String) -> Self {
        FragmentValue::String(value)
    }
}

impl From<i64> for FragmentValue {
    fn from(value: i64) -> Self {
        FragmentValue::Integral(value)
    }
}

impl From<f64> for FragmentValue {
    fn from(value: f64) -> Self {
        FragmentValue::Real(value)
    }
}

/// An ordered mapping from name to value. Names are unique; adding an
/// existing name replaces the previous value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    items: LinkedHashMap<String, FragmentValue>,
}

impl Fragment {
    pub fn new() -> Self {
        Fragment::default()
    }

    /// Add a scalar variable.
    pub fn add_variable(&mut self, name: impl Into<String>, value: impl Into<FragmentValue>) {
        self.items.insert(name.into(), value.into());
    }

    /// Append a new fragment to the list stored under `name`, creating the
    /// list when needed, and return it for population.
    pub fn add_fragment(&mut self, name: impl Into<String>) -> &mut Fragment {
        self.add_fragment_list(name).add_fragment()
    }

    /// Get or create the fragment list stored under `name`. A previously
    /// stored non-list value is replaced.
    pub fn add_fragment_list(&mut self, name: impl Into<String>) -> &mut FragmentList {
        let slot = self
            .items
            .entry(name.into())
            .or_insert_with(|| FragmentValue::List(FragmentList::new()));
        if !matches!(slot, FragmentValue::List(_)) {
            *slot = FragmentValue::List(FragmentList::new());
        }
        match slot {
            FragmentValue::List(list) => list,
            _ => unreachable!("list stored above"),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FragmentValue> {
        self.items.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FragmentValue)> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// An ordered sequence of fragments; one fragment per iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FragmentList {
    items: Vec<Fragment>,
}

impl FragmentList {
    pub fn new() -> Self {
        FragmentList::default()
    }

    /// Append an empty fragment and return it for population.
    pub fn add_fragment(&mut self) -> &mut Fragment {
        let last = self.items.len();
        self.items.push(Fragment::new());
        &mut self.items[last]
    }

    pub fn as_slice(&self) -> &[Fragment] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_api() {
        let mut root = Fragment::new();
        root.add_variable("title", "hello");
        root.add_variable("count", 3i64);

        let row = root.add_fragment("row");
        row.add_variable("cnum", 1i64);
        let row = root.add_fragment("row");
        row.add_variable("cnum", 2i64);

        match root.get("row") {
            Some(FragmentValue::List(list)) => assert_eq!(list.len(), 2),
            other => panic!("expected list, got {:?}", other),
        }
        assert_eq!(root.get("title"), Some(&FragmentValue::String("hello".into())));
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut frag = Fragment::new();
        frag.add_variable("z", 1i64);
        frag.add_variable("a", 2i64);
        frag.add_variable("m", 3i64);
        let names: Vec<&str> = frag.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, ["z", "a", "m"]);
    }

    #[test]
    fn test_single_fragment_iterates_once() {
        let mut frag = Fragment::new();
        frag.add_variable("x", 1i64);
        let value = FragmentValue::Fragment(Box::new(frag));
        let nested = value.nested_list().expect("single nested fragment");
        assert_eq!(nested.len(), 1);
    }
}
