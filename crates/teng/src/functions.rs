/*
 * functions.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Built-in functions callable from template expressions.
//!
//! The table is keyed by name; every handler validates its own argument
//! count and logs an error entry on mismatch, yielding `undefined` -- a bad
//! call never halts a render. Arguments arrive in source order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

use crate::content_type::ContentType;
use crate::dictionary::Dictionary;
use crate::error::ErrorLog;
use crate::position::Position;
use crate::value::{Numeric, RegexFlags, RegexValue, Value};

/// Call context handed to every built-in.
pub struct FunctionCtx<'d, 'l> {
    /// UTF-8 encoding is active; string functions count characters.
    pub utf8: bool,
    pub lang: &'d Dictionary,
    /// The innermost content type, used by `escape`/`unescape`.
    pub escaper: &'static ContentType,
    pub log: &'l mut ErrorLog,
    pub pos: Position,
}

impl FunctionCtx<'_, '_> {
    fn error(&mut self, msg: String) -> Value<'static> {
        self.log.error(self.pos.clone(), msg);
        Value::Undefined
    }

    fn diag(&mut self, msg: String) -> Value<'static> {
        self.log.diag(self.pos.clone(), msg);
        Value::Undefined
    }

    fn wrong_args(&mut self, name: &str, expected: &str) -> Value<'static> {
        self.error(format!("{}(): expected {} argument(s)", name, expected))
    }
}

type Builtin = for<'d, 'l> fn(&mut FunctionCtx<'d, 'l>, Vec<Value<'d>>) -> Value<'d>;

static BUILTINS: Lazy<HashMap<&'static str, Builtin>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, Builtin> = HashMap::new();
    table.insert("len", len);
    table.insert("substr", substr);
    table.insert("wordsubstr", wordsubstr);
    table.insert("replace", replace);
    table.insert("regex_replace", regex_replace);
    table.insert("strtolower", strtolower);
    table.insert("strtoupper", strtoupper);
    table.insert("nl2br", nl2br);
    table.insert("reorder", reorder);
    table.insert("repeat", repeat);
    table.insert("int", int);
    table.insert("isnumber", isnumber);
    table.insert("round", round);
    table.insert("abs", abs);
    table.insert("escape", escape);
    table.insert("unescape", unescape);
    table.insert("quoteescape", quoteescape);
    table.insert("now", now);
    table.insert("date", date);
    table.insert("dict", dict);
    table
});

/// Invoke a built-in; `None` when no function of that name exists.
pub fn call<'d>(
    name: &str,
    ctx: &mut FunctionCtx<'d, '_>,
    args: Vec<Value<'d>>,
) -> Option<Value<'d>> {
    BUILTINS.get(name).map(|builtin| builtin(ctx, args))
}

// ---------------------------------------------------------------------
// string functions

fn len<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let [arg] = args.as_slice() else {
        return ctx.wrong_args("len", "1");
    };
    let text = arg.string();
    let length = if ctx.utf8 {
        text.chars().count()
    } else {
        text.len()
    };
    Value::Integral(length as i64)
}

/// Adjusts an index (even negative) to the interval `[0, len]`.
fn idx2offset(len: usize, index: i64) -> usize {
    if index >= 0 {
        (index as usize).min(len)
    } else {
        let shifted = index + len as i64;
        if shifted >= 0 {
            (shifted as usize).min(len)
        } else {
            0
        }
    }
}

struct SubstrArgs {
    text: String,
    start: i64,
    end: i64,
    prefix: String,
    suffix: String,
}

fn parse_substr_args<'d>(
    ctx: &mut FunctionCtx<'d, '_>,
    name: &str,
    args: &[Value<'d>],
) -> Result<SubstrArgs, Value<'static>> {
    if args.len() < 2 || args.len() > 5 {
        return Err(ctx.wrong_args(name, "2 to 5"));
    }
    let text = args[0].string().into_owned();
    if !args[1].is_integral() {
        return Err(ctx.error(format!("{}(): start index must be an int", name)));
    }
    let start = args[1].as_integral();

    let mut rest = &args[2..];
    let mut end = i64::MAX;
    if let Some(first) = rest.first() {
        if first.is_integral() {
            end = first.as_integral();
            rest = &rest[1..];
        } else if args.len() == 5 {
            return Err(ctx.error(format!("{}(): end index must be an int", name)));
        }
    }
    let prefix = rest
        .first()
        .map(|v| v.string().into_owned())
        .unwrap_or_default();
    let suffix = rest
        .get(1)
        .map(|v| v.string().into_owned())
        .unwrap_or_else(|| prefix.clone());
    Ok(SubstrArgs {
        text,
        start,
        end,
        prefix,
        suffix,
    })
}

fn substr_chars(s: &SubstrArgs) -> String {
    let chars: Vec<char> = s.text.chars().collect();
    let start = idx2offset(chars.len(), s.start);
    let end = idx2offset(chars.len(), s.end);

    let mut result = String::new();
    if start != 0 {
        result.push_str(&s.prefix);
    }
    if start < end {
        result.extend(&chars[start..end]);
    }
    if end != chars.len() {
        result.push_str(&s.suffix);
    }
    result
}

/// Byte-indexed variant for one-byte encodings; indices may split a
/// multi-byte sequence.
fn substr_bytes(s: &SubstrArgs) -> String {
    let bytes = s.text.as_bytes();
    let start = idx2offset(bytes.len(), s.start);
    let end = idx2offset(bytes.len(), s.end);

    let mut result = String::new();
    if start != 0 {
        result.push_str(&s.prefix);
    }
    if start < end {
        result.push_str(&String::from_utf8_lossy(&bytes[start..end]));
    }
    if end != bytes.len() {
        result.push_str(&s.suffix);
    }
    result
}

fn substr<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let s = match parse_substr_args(ctx, "substr", &args) {
        Ok(s) => s,
        Err(undefined) => return undefined,
    };
    Value::String(if ctx.utf8 {
        substr_chars(&s)
    } else {
        substr_bytes(&s)
    })
}

fn wordsubstr_chars(s: &SubstrArgs) -> String {
    let chars: Vec<char> = s.text.chars().collect();
    let mut start = idx2offset(chars.len(), s.start);
    let mut end = idx2offset(chars.len(), s.end);
    if start >= end {
        return s.suffix.clone();
    }

    // widen the interval to word boundaries
    while start > 0 && !chars[start].is_whitespace() {
        start -= 1;
    }
    while end < chars.len() && !chars[end].is_whitespace() {
        end += 1;
    }

    let stripped_start = chars.iter().take_while(|c| c.is_whitespace()).count();
    let stripped_end = chars.len() - chars.iter().rev().take_while(|c| c.is_whitespace()).count();

    let mut result = String::new();
    if start > stripped_start {
        result.push_str(&s.prefix);
    }
    result.extend(&chars[start..end]);
    if end < stripped_end {
        result.push_str(&s.suffix);
    }
    result
}

fn wordsubstr_bytes(s: &SubstrArgs) -> String {
    let bytes = s.text.as_bytes();
    let mut start = idx2offset(bytes.len(), s.start);
    let mut end = idx2offset(bytes.len(), s.end);
    if start >= end {
        return s.suffix.clone();
    }

    while start > 0 && !bytes[start].is_ascii_whitespace() {
        start -= 1;
    }
    while end < bytes.len() && !bytes[end].is_ascii_whitespace() {
        end += 1;
    }

    let stripped_start = bytes.iter().take_while(|b| b.is_ascii_whitespace()).count();
    let stripped_end =
        bytes.len() - bytes.iter().rev().take_while(|b| b.is_ascii_whitespace()).count();

    let mut result = String::new();
    if start > stripped_start {
        result.push_str(&s.prefix);
    }
    result.push_str(&String::from_utf8_lossy(&bytes[start..end]));
    if end < stripped_end {
        result.push_str(&s.suffix);
    }
    result
}

fn wordsubstr<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let s = match parse_substr_args(ctx, "wordsubstr", &args) {
        Ok(s) => s,
        Err(undefined) => return undefined,
    };
    Value::String(if ctx.utf8 {
        wordsubstr_chars(&s)
    } else {
        wordsubstr_bytes(&s)
    })
}

fn replace<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let [text, pattern, replacement] = args.as_slice() else {
        return ctx.wrong_args("replace", "3");
    };
    let pattern = pattern.string();
    if pattern.is_empty() {
        // origin algorithm behaviour
        return Value::String(String::new());
    }
    Value::String(
        text.string()
            .replace(pattern.as_ref(), replacement.string().as_ref()),
    )
}

fn regex_replace<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let [text, pattern, replacement] = args.as_slice() else {
        return ctx.wrong_args("regex_replace", "3");
    };
    let compiled = match pattern {
        Value::Regex(regex) => Arc::clone(regex),
        other => match RegexValue::compile(&other.string(), RegexFlags::default()) {
            Ok(regex) => Arc::new(regex),
            Err(err) => {
                return ctx.diag(format!("regex_replace(): invalid regex: {}", err));
            }
        },
    };
    let text = text.string();
    let replacement = replacement.string();
    let replaced = if compiled.flags.global || !matches!(pattern, Value::Regex(_)) {
        compiled.regex.replace_all(&text, replacement.as_ref())
    } else {
        compiled.regex.replace(&text, replacement.as_ref())
    };
    Value::String(replaced.into_owned())
}

fn strtolower<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let [arg] = args.as_slice() else {
        return ctx.wrong_args("strtolower", "1");
    };
    Value::String(arg.string().to_lowercase())
}

fn strtoupper<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let [arg] = args.as_slice() else {
        return ctx.wrong_args("strtoupper", "1");
    };
    Value::String(arg.string().to_uppercase())
}

/// Appends `<br />` after every unix newline.
fn nl2br<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let [arg] = args.as_slice() else {
        return ctx.wrong_args("nl2br", "1");
    };
    let text = arg.string();
    let mut result = String::with_capacity(text.len() + text.len() / 3);
    for ch in text.chars() {
        result.push(ch);
        if ch == '\n' {
            result.push_str("<br />");
        }
    }
    Value::String(result)
}

/// Splices arguments into a format string by position: `%1`, `%{12}`,
/// `%%` for a literal percent.
fn reorder<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    if args.is_empty() {
        return ctx.wrong_args("reorder", "at least 1");
    }
    let format: Vec<char> = args[0].string().chars().collect();
    let mut result = String::with_capacity(format.len() * 2);

    #[derive(PartialEq)]
    enum State {
        Default,
        Format,
        Number,
    }
    let mut state = State::Default;
    let mut index = 0usize;
    let mut mark = 0usize;

    let mut i = 0usize;
    while i <= format.len() {
        let ch = format.get(i).copied();
        let mut replace_now = false;
        match ch {
            Some('%') => match state {
                State::Format => {
                    result.push('%');
                    state = State::Default;
                }
                State::Default => {
                    state = State::Format;
                    mark = i;
                    index = 0;
                }
                State::Number => {
                    ctx.log.error(
                        ctx.pos.clone(),
                        "reorder(): '%' not allowed inside '%{}'",
                    );
                    state = State::Default;
                    result.extend(&format[mark..=i]);
                }
            },
            Some(digit @ '0'..='9') => match state {
                State::Format => {
                    index = digit as usize - '0' as usize;
                    replace_now = true;
                    state = State::Default;
                }
                State::Default => result.push(digit),
                State::Number => {
                    index = index * 10 + (digit as usize - '0' as usize);
                }
            },
            Some('{') => match state {
                State::Format => {
                    state = State::Number;
                    index = 0;
                }
                State::Default => result.push('{'),
                State::Number => {
                    ctx.log.error(
                        ctx.pos.clone(),
                        "reorder(): '{' not allowed inside '%{}'",
                    );
                    state = State::Default;
                    result.extend(&format[mark..=i]);
                }
            },
            Some('}') => match state {
                State::Format => {
                    ctx.log
                        .error(ctx.pos.clone(), "reorder(): '}' not allowed after '%'");
                    state = State::Default;
                    result.extend(&format[mark..=i]);
                }
                State::Default => result.push('}'),
                State::Number => {
                    replace_now = true;
                    state = State::Default;
                }
            },
            None => {
                if state != State::Default {
                    ctx.log
                        .error(ctx.pos.clone(), "reorder(): runaway argument");
                    result.extend(&format[mark..]);
                }
            }
            Some(other) => match state {
                State::Default => result.push(other),
                State::Format | State::Number => {
                    ctx.log.error(
                        ctx.pos.clone(),
                        format!("reorder(): '{}' not allowed inside %{{}} or after %", other),
                    );
                    state = State::Default;
                    result.extend(&format[mark..=i]);
                }
            },
        }

        if replace_now {
            if index == 0 || index >= args.len() {
                ctx.log.error(
                    ctx.pos.clone(),
                    format!(
                        "reorder(): invalid or missing index in format '{}'",
                        format[mark..=i].iter().collect::<String>()
                    ),
                );
                result.extend(&format[mark..=i]);
            } else {
                result.push_str(&args[index].string());
            }
        }

        if ch.is_none() {
            break;
        }
        i += 1;
    }
    Value::String(result)
}

fn repeat<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let [text, count] = args.as_slice() else {
        return ctx.wrong_args("repeat", "2");
    };
    let count = count.as_integral();
    if count < 0 {
        return ctx.error("repeat(): negative count".to_string());
    }
    Value::String(text.string().repeat(count as usize))
}

// ---------------------------------------------------------------------
// numeric functions

fn int<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let (value, lenient) = match args.as_slice() {
        [value] => (value, false),
        [value, flag] => (value, flag.as_bool()),
        _ => return ctx.wrong_args("int", "1 or 2"),
    };
    match value {
        Value::Integral(i) => Value::Integral(*i),
        Value::Real(r) => Value::Integral(*r as i64),
        other => match other.numeric() {
            Some(Numeric::Integral(i)) => Value::Integral(i),
            Some(Numeric::Real(r)) => Value::Integral(r as i64),
            None if lenient => Value::Undefined,
            None => ctx.diag(format!("int(): cannot convert '{}' to int", other.string())),
        },
    }
}

fn isnumber<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let [value] = args.as_slice() else {
        return ctx.wrong_args("isnumber", "1");
    };
    let result = matches!(value, Value::Integral(_) | Value::Real(_));
    Value::Integral(result as i64)
}

fn round<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let (value, precision) = match args.as_slice() {
        [value] => (value, 0i64),
        [value, precision] if precision.is_integral() => (value, precision.as_integral()),
        _ => return ctx.wrong_args("round", "1 or 2 (int precision)"),
    };
    match value.numeric() {
        Some(Numeric::Integral(i)) => Value::Integral(i),
        Some(Numeric::Real(r)) => {
            let factor = 10f64.powi(precision.clamp(-18, 18) as i32);
            Value::Real((r * factor).round() / factor)
        }
        None => ctx.diag("round(): argument is not a number".to_string()),
    }
}

fn abs<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let [value] = args.as_slice() else {
        return ctx.wrong_args("abs", "1");
    };
    match value.numeric() {
        Some(Numeric::Integral(i)) => Value::Integral(i.wrapping_abs()),
        Some(Numeric::Real(r)) => Value::Real(r.abs()),
        None => ctx.diag("abs(): argument is not a number".to_string()),
    }
}

// ---------------------------------------------------------------------
// escaping functions

fn escape<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let [value] = args.as_slice() else {
        return ctx.wrong_args("escape", "1");
    };
    Value::String(ctx.escaper.escape(&value.string()))
}

fn unescape<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let [value] = args.as_slice() else {
        return ctx.wrong_args("unescape", "1");
    };
    Value::String(ctx.escaper.unescape(&value.string()))
}

fn quoteescape<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let [value] = args.as_slice() else {
        return ctx.wrong_args("quoteescape", "1");
    };
    let quoted = ContentType::find("quoted-string").unwrap_or_else(ContentType::default_type);
    Value::String(quoted.escape(&value.string()))
}

// ---------------------------------------------------------------------
// date/time functions

fn now<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    if !args.is_empty() {
        return ctx.wrong_args("now", "0");
    }
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => Value::Real(elapsed.as_secs_f64()),
        Err(_) => Value::Real(0.0),
    }
}

/// Formats a timestamp (UTC) with an strftime subset: `%Y %y %m %d %H %M
/// %S %j %w %%`. Unknown directives are copied verbatim.
fn date<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let (format, timestamp) = match args.as_slice() {
        [format] => (
            format.string().into_owned(),
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs() as i64)
                .unwrap_or(0),
        ),
        [format, timestamp] => (format.string().into_owned(), timestamp.as_integral()),
        _ => return ctx.wrong_args("date", "1 or 2"),
    };
    let Ok(moment) = time::OffsetDateTime::from_unix_timestamp(timestamp) else {
        return ctx.diag(format!("date(): timestamp {} out of range", timestamp));
    };

    let mut result = String::with_capacity(format.len() * 2);
    let mut chars = format.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            result.push(ch);
            continue;
        }
        match chars.next() {
            Some('Y') => result.push_str(&moment.year().to_string()),
            Some('y') => result.push_str(&format!("{:02}", moment.year().rem_euclid(100))),
            Some('m') => result.push_str(&format!("{:02}", u8::from(moment.month()))),
            Some('d') => result.push_str(&format!("{:02}", moment.day())),
            Some('H') => result.push_str(&format!("{:02}", moment.hour())),
            Some('M') => result.push_str(&format!("{:02}", moment.minute())),
            Some('S') => result.push_str(&format!("{:02}", moment.second())),
            Some('j') => result.push_str(&format!("{:03}", moment.ordinal())),
            Some('w') => {
                result.push_str(&moment.weekday().number_days_from_sunday().to_string())
            }
            Some('%') => result.push('%'),
            Some(other) => {
                result.push('%');
                result.push(other);
            }
            None => result.push('%'),
        }
    }
    Value::String(result)
}

// ---------------------------------------------------------------------
// dictionary

fn dict<'d>(ctx: &mut FunctionCtx<'d, '_>, args: Vec<Value<'d>>) -> Value<'d> {
    let [key] = args.as_slice() else {
        return ctx.wrong_args("dict", "1");
    };
    let key = key.string();
    match ctx.lang.lookup(&key) {
        Some(value) => Value::StringRef(value),
        None => {
            ctx.log.warning(
                ctx.pos.clone(),
                format!("Dictionary key '{}' was not found", key),
            );
            Value::Undefined
        }
    }
}
