/*
 * value.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! The tagged runtime value and all of its conversion rules.
//!
//! Values live on the processor's operand stack and in per-frame locals.
//! They are parameterized by the render lifetime `'d`: string slices borrow
//! from the compiled program's constant pool or a dictionary, fragment and
//! list references borrow from the caller's data tree. Undefined propagates
//! through arithmetic as undefined, never as an error.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};

use crate::data::{Fragment, FragmentList, FragmentValue};

/// Flags of a regex literal: `i` (case-insensitive), `g` (global),
/// `m` (multiline).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegexFlags {
    pub ignore_case: bool,
    pub global: bool,
    pub multiline: bool,
}

impl RegexFlags {
    pub fn parse(flags: &str) -> Option<RegexFlags> {
        let mut result = RegexFlags::default();
        for ch in flags.chars() {
            match ch {
                'i' => result.ignore_case = true,
                'g' => result.global = true,
                'm' => result.multiline = true,
                _ => return None,
            }
        }
        Some(result)
    }
}

impl fmt::Display for RegexFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ignore_case {
            f.write_str("i")?;
        }
        if self.global {
            f.write_str("g")?;
        }
        if self.multiline {
            f.write_str("m")?;
        }
        Ok(())
    }
}

/// A compiled regex value: source pattern, flags, and the compiled program.
#[derive(Debug)]
pub struct RegexValue {
    pub pattern: String,
    pub flags: RegexFlags,
    pub regex: Regex,
}

impl RegexValue {
    pub fn compile(pattern: &str, flags: RegexFlags) -> Result<RegexValue, regex::Error> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(flags.ignore_case)
            .multi_line(flags.multiline)
            .build()?;
        Ok(RegexValue {
            pattern: pattern.to_string(),
            flags,
            regex,
        })
    }
}

impl fmt::Display for RegexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.pattern, self.flags)
    }
}

/// Reference to a fragment list plus the current iteration index.
#[derive(Debug, Clone, Copy)]
pub struct ListRef<'d> {
    pub list: &'d FragmentList,
    pub index: usize,
}

/// The tagged runtime value.
#[derive(Debug, Clone)]
pub enum Value<'d> {
    Undefined,
    Integral(i64),
    Real(f64),
    String(String),
    StringRef(&'d str),
    FragRef(&'d Fragment),
    ListRef(ListRef<'d>),
    Regex(Arc<RegexValue>),
}

/// Numeric view of a value, used by arithmetic and comparisons.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Integral(i64),
    Real(f64),
}

impl Numeric {
    pub fn as_real(self) -> f64 {
        match self {
            Numeric::Integral(i) => i as f64,
            Numeric::Real(r) => r,
        }
    }
}

impl<'d> Value<'d> {
    /// Build a value from a scalar stored in the data tree. Nested
    /// fragments and lists become references.
    pub fn from_fragment_value(value: &'d FragmentValue) -> Value<'d> {
        match value {
            FragmentValue::String(s) => Value::StringRef(s),
            FragmentValue::Integral(i) => Value::Integral(*i),
            FragmentValue::Real(r) => Value::Real(*r),
            FragmentValue::Fragment(frag) => Value::FragRef(frag),
            FragmentValue::List(list) => Value::ListRef(ListRef { list, index: 0 }),
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_) | Value::StringRef(_))
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, Value::Integral(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Integral(_) => "integral",
            Value::Real(_) => "real",
            Value::String(_) | Value::StringRef(_) => "string",
            Value::FragRef(_) => "frag_ref",
            Value::ListRef(_) => "list_ref",
            Value::Regex(_) => "regex",
        }
    }

    /// Boolean conversion: undefined is false, numbers test against zero,
    /// strings against emptiness, references and regexes are true.
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Undefined => false,
            Value::Integral(i) => *i != 0,
            Value::Real(r) => *r != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::StringRef(s) => !s.is_empty(),
            Value::FragRef(_) | Value::ListRef(_) | Value::Regex(_) => true,
        }
    }

    /// Integral conversion; parse failures and non-numeric tags yield 0.
    pub fn as_integral(&self) -> i64 {
        match self.numeric() {
            Some(Numeric::Integral(i)) => i,
            Some(Numeric::Real(r)) => r as i64,
            None => 0,
        }
    }

    /// Real conversion; parse failures and non-numeric tags yield 0.0.
    pub fn as_real(&self) -> f64 {
        match self.numeric() {
            Some(n) => n.as_real(),
            None => 0.0,
        }
    }

    /// The numeric view used by arithmetic: integrals and reals directly,
    /// strings parsed (integral first, then real). Everything else has no
    /// numeric view.
    pub fn numeric(&self) -> Option<Numeric> {
        match self {
            Value::Integral(i) => Some(Numeric::Integral(*i)),
            Value::Real(r) => Some(Numeric::Real(*r)),
            Value::String(s) => parse_numeric(s),
            Value::StringRef(s) => parse_numeric(s),
            _ => None,
        }
    }

    /// String conversion for printing and concatenation.
    pub fn string(&self) -> Cow<'_, str> {
        match self {
            Value::Undefined => Cow::Borrowed(""),
            Value::Integral(i) => Cow::Owned(i.to_string()),
            Value::Real(r) => Cow::Owned(format_real(*r)),
            Value::String(s) => Cow::Borrowed(s.as_str()),
            Value::StringRef(s) => Cow::Borrowed(s),
            Value::FragRef(_) => Cow::Borrowed("$frag$"),
            Value::ListRef(_) => Cow::Borrowed("$list$"),
            Value::Regex(r) => Cow::Owned(r.to_string()),
        }
    }

    /// Equality: by value for scalars (with numeric coercion across tags),
    /// by identity for fragment and list references. `None` means the
    /// operands are incomparable.
    pub fn equals(&self, other: &Value<'d>) -> Option<bool> {
        match (self, other) {
            (Value::Undefined, _) | (_, Value::Undefined) => None,
            (Value::FragRef(a), Value::FragRef(b)) => Some(std::ptr::eq(*a, *b)),
            (Value::ListRef(a), Value::ListRef(b)) => {
                Some(std::ptr::eq(a.list, b.list) && a.index == b.index)
            }
            (Value::Regex(a), Value::Regex(b)) => {
                Some(a.pattern == b.pattern && a.flags == b.flags)
            }
            (a, b) if a.is_string() && b.is_string() => Some(a.string() == b.string()),
            (a, b) => match (a.numeric(), b.numeric()) {
                (Some(Numeric::Integral(x)), Some(Numeric::Integral(y))) => Some(x == y),
                (Some(x), Some(y)) => Some(x.as_real() == y.as_real()),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Integral(i) => write!(f, "integral({})", i),
            Value::Real(r) => write!(f, "real({})", format_real(*r)),
            Value::String(s) => write!(f, "string({})", s),
            Value::StringRef(s) => write!(f, "string_ref({})", s),
            Value::FragRef(frag) => write!(f, "frag_ref(@{:p})", *frag),
            Value::ListRef(list) => {
                write!(f, "list_ref(@{:p},{},{})", list.list, list.index, list.list.len())
            }
            Value::Regex(r) => write!(f, "regex({})", r),
        }
    }
}

fn parse_numeric(s: &str) -> Option<Numeric> {
    let trimmed = s.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(Numeric::Integral(i));
    }
    trimmed.parse::<f64>().ok().map(Numeric::Real)
}

/// Display form of a real: whole values print without a fraction
/// (`3.0` prints as `3`).
fn format_real(r: f64) -> String {
    format!("{}", r)
}
