/*
 * processor.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! The bytecode interpreter.
//!
//! A stack machine over [`Value`]s executing one compiled [`Program`]
//! against the fragment stack, writing through the formatter. User-program
//! failures -- division by zero, bad conversions, missing data, argument
//! errors -- substitute `undefined`, log a diagnostic and keep running;
//! only a failing writer terminates execution.

use crate::config::Config;
use crate::content_type::ContentType;
use crate::data::{Fragment, FragmentValue};
use crate::dictionary::Dictionary;
use crate::error::{ErrorLog, TengError};
use crate::formatter::Formatter;
use crate::fragment_stack::{FragmentStack, StackFailure, ERROR_FRAG_NAME};
use crate::functions::{self, FunctionCtx};
use crate::position::Position;
use crate::program::{Identifier, OpCode, Program};
use crate::value::{ListRef, Numeric, RegexFlags, RegexValue, Value};

/// Executes one program against one data tree.
pub struct Processor<'d, 'l, 'w, 'f> {
    program: &'d Program,
    lang: &'d Dictionary,
    config: &'d Config,
    data: &'d Fragment,
    formatter: &'f mut Formatter<'w>,
    log: &'l mut ErrorLog,
    stack: Vec<Value<'d>>,
    frags: FragmentStack<'d>,
    ctypes: Vec<&'static ContentType>,
    pc: usize,
}

impl<'d, 'l, 'w, 'f> Processor<'d, 'l, 'w, 'f> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        program: &'d Program,
        lang: &'d Dictionary,
        config: &'d Config,
        content_type: &'static ContentType,
        data: &'d Fragment,
        formatter: &'f mut Formatter<'w>,
        log: &'l mut ErrorLog,
    ) -> Self {
        Processor {
            program,
            lang,
            config,
            data,
            formatter,
            log,
            stack: Vec::with_capacity(16),
            frags: FragmentStack::new(data),
            ctypes: vec![content_type],
            pc: 0,
        }
    }

    /// Run the program to completion.
    pub fn run(mut self) -> Result<(), TengError> {
        let instrs = self.program.instrs();
        while self.pc < instrs.len() {
            let instr = &instrs[self.pc];
            let pos = &instr.pos;
            self.pc += 1;
            match &instr.op {
                OpCode::PushConst { index } => match self.program.constant(*index) {
                    Some(constant) => self.stack.push(constant.value()),
                    None => {
                        self.diag(pos, format!("Invalid constant index {}", index));
                        self.stack.push(Value::Undefined);
                    }
                },
                OpCode::PushVar { ident } => self.push_var(*ident, pos),
                OpCode::PushFrag => match self.frags.current_fragment() {
                    Some(frag) => self.stack.push(Value::FragRef(frag)),
                    None => {
                        self.diag(pos, "There is no current fragment".to_string());
                        self.stack.push(Value::Undefined);
                    }
                },
                OpCode::PushAttr { name } => self.push_attr(name, pos),
                OpCode::PushFragCount { ident } => self.push_frag_count(*ident, pos),
                OpCode::PushFragIndex { ident } => {
                    let result = self
                        .identifier(*ident, pos)
                        .and_then(|ident| self.frags.get_fragment_index(&ident).map_err(Some));
                    match result {
                        Ok(index) => self.stack.push(Value::Integral(index as i64)),
                        Err(failure) => self.stack_failure(pos, failure),
                    }
                }
                OpCode::PushThisFragIndex => {
                    let index = self.frags.current_index();
                    self.stack.push(Value::Integral(index as i64));
                }
                OpCode::PushDict { key } => self.push_dict(*key, pos),

                OpCode::Add => {
                    self.arith(pos, "Addition", |a, b| Some(a.wrapping_add(b)), |a, b| a + b)
                }
                OpCode::Sub => {
                    self.arith(pos, "Subtraction", |a, b| Some(a.wrapping_sub(b)), |a, b| a - b)
                }
                OpCode::Mul => self.arith(
                    pos,
                    "Multiplication",
                    |a, b| Some(a.wrapping_mul(b)),
                    |a, b| a * b,
                ),
                OpCode::Div => self.arith(
                    pos,
                    "Division",
                    |a, b| (b != 0).then(|| a.wrapping_div(b)),
                    |a, b| a / b,
                ),
                OpCode::Mod => self.arith(
                    pos,
                    "Modulo",
                    |a, b| (b != 0).then(|| a.wrapping_rem(b)),
                    |a, b| a % b,
                ),
                OpCode::Concat => {
                    let b = self.pop(pos);
                    let a = self.pop(pos);
                    let mut joined = a.string().into_owned();
                    joined.push_str(&b.string());
                    self.stack.push(Value::String(joined));
                }
                OpCode::Eq => self.equality(pos, false),
                OpCode::Ne => self.equality(pos, true),
                OpCode::Lt => self.relational(pos, |ord| ord == std::cmp::Ordering::Less),
                OpCode::Le => self.relational(pos, |ord| ord != std::cmp::Ordering::Greater),
                OpCode::Gt => self.relational(pos, |ord| ord == std::cmp::Ordering::Greater),
                OpCode::Ge => self.relational(pos, |ord| ord != std::cmp::Ordering::Less),
                OpCode::BitAnd => self.bitop(pos, |a, b| a & b),
                OpCode::BitOr => self.bitop(pos, |a, b| a | b),
                OpCode::BitXor => self.bitop(pos, |a, b| a ^ b),
                OpCode::MatchRegex { negated } => self.match_regex(pos, *negated),
                OpCode::Minus => {
                    let value = self.pop(pos);
                    let result = match value.numeric() {
                        Some(Numeric::Integral(i)) => Value::Integral(i.wrapping_neg()),
                        Some(Numeric::Real(r)) => Value::Real(-r),
                        None => {
                            if !value.is_undefined() {
                                self.diag(pos, "Unary minus of a non-number".to_string());
                            }
                            Value::Undefined
                        }
                    };
                    self.stack.push(result);
                }
                OpCode::Not => {
                    let value = self.pop(pos);
                    self.stack.push(Value::Integral(!value.as_bool() as i64));
                }
                OpCode::BitNot => {
                    let value = self.pop(pos);
                    let result = match value.numeric() {
                        Some(Numeric::Integral(i)) => Value::Integral(!i),
                        _ => {
                            if !value.is_undefined() {
                                self.diag(pos, "Bit operation on a non-integral value".to_string());
                            }
                            Value::Undefined
                        }
                    };
                    self.stack.push(result);
                }

                OpCode::Jmp { target } => self.pc = *target,
                OpCode::JmpIfFalse { target } => {
                    let value = self.pop(pos);
                    if !value.as_bool() {
                        self.pc = *target;
                    }
                }
                OpCode::JmpIfTrue { target } => {
                    let value = self.pop(pos);
                    if value.as_bool() {
                        self.pc = *target;
                    }
                }
                OpCode::JmpIfFalseKeep { target } => {
                    let value = self.pop(pos);
                    if !value.as_bool() {
                        self.stack.push(value);
                        self.pc = *target;
                    }
                }
                OpCode::JmpIfTrueKeep { target } => {
                    let value = self.pop(pos);
                    if value.as_bool() {
                        self.stack.push(value);
                        self.pc = *target;
                    }
                }

                OpCode::OpenFrag { ident, exit } => {
                    let exit = *exit;
                    match self.identifier(*ident, pos) {
                        Ok(identifier) => match self.frags.push_frame(&identifier) {
                            Ok(()) => {}
                            Err(StackFailure::NoIterations) => self.pc = exit,
                            Err(failure) => {
                                self.diag(pos, format!("Cannot open fragment: {}", failure));
                                self.pc = exit;
                            }
                        },
                        Err(failure) => {
                            if let Some(failure) = failure {
                                self.diag(pos, format!("Cannot open fragment: {}", failure));
                            }
                            self.pc = exit;
                        }
                    }
                }
                OpCode::OpenErrorFrag { ident, exit } => {
                    let exit = *exit;
                    match self.identifier(*ident, pos) {
                        Ok(identifier) => {
                            let opened = if self.config.error_fragment
                                && self.frags.at_chain_root()
                                && identifier.name == ERROR_FRAG_NAME
                            {
                                let entries = self.log.entries().to_vec();
                                self.frags.push_error_frame(&identifier, entries)
                            } else {
                                self.frags.push_frame(&identifier)
                            };
                            if opened.is_err() {
                                self.pc = exit;
                            }
                        }
                        Err(_) => self.pc = exit,
                    }
                }
                OpCode::CloseFrag => {
                    if let Err(failure) = self.frags.pop_frame() {
                        self.diag(pos, format!("Cannot close fragment: {}", failure));
                    }
                }
                OpCode::RepeatFrag { back } => {
                    let back = *back;
                    if self.frags.next_iteration() {
                        self.pc = back;
                    }
                }

                OpCode::Print => {
                    let value = self.pop(pos);
                    self.formatter.write(&value.string())?;
                }
                OpCode::PrintEsc => {
                    let value = self.pop(pos);
                    let escaped = self.top_ctype().escape(&value.string());
                    self.formatter.write(&escaped)?;
                }

                OpCode::PushFormat { mode } => self.formatter.push(*mode)?,
                OpCode::PopFormat => {
                    self.formatter.pop()?;
                }
                OpCode::PushCtype { name } => self.push_ctype(*name, pos),
                OpCode::PopCtype => {
                    if self.ctypes.len() > 1 {
                        self.ctypes.pop();
                    } else {
                        self.diag(pos, "Unbalanced endctype directive".to_string());
                    }
                }

                OpCode::SetVar { ident } => {
                    let value = self.pop(pos);
                    let result = self
                        .identifier(*ident, pos)
                        .and_then(|ident| self.frags.set_variable(&ident, value).map_err(Some));
                    if let Err(Some(failure)) = result {
                        self.diag(pos, format!("Cannot set variable: {}", failure));
                    }
                }
                OpCode::Func { name, argc } => self.call_function(name, *argc, pos)?,
                OpCode::Defined { ident } => {
                    let result = match self.identifier(*ident, pos) {
                        Ok(identifier) => {
                            self.frags.find_variable(&identifier).is_ok()
                                || self.frags.exists(&identifier).unwrap_or(false)
                        }
                        Err(_) => false,
                    };
                    self.stack.push(Value::Integral(result as i64));
                }
                OpCode::Exists { ident } => {
                    let result = match self.identifier(*ident, pos) {
                        Ok(identifier) => self.frags.exists(&identifier).unwrap_or(false),
                        Err(_) => false,
                    };
                    self.stack.push(Value::Integral(result as i64));
                }

                OpCode::Debug => {
                    if self.config.debug_enabled {
                        let dump = self.debug_dump();
                        self.formatter.write(&dump)?;
                    }
                }
                OpCode::Bytecode => {
                    if self.config.bytecode_enabled {
                        let dump = self.program.dump();
                        self.formatter.write(&dump)?;
                    }
                }
                OpCode::Halt => break,
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------

    fn diag(&mut self, pos: &Position, msg: String) {
        self.log.diag(pos.clone(), msg);
    }

    fn top_ctype(&self) -> &'static ContentType {
        self.ctypes.last().copied().unwrap_or_else(ContentType::default_type)
    }

    fn pop(&mut self, pos: &Position) -> Value<'d> {
        match self.stack.pop() {
            Some(value) => value,
            None => {
                self.log
                    .error(pos.clone(), "Operand stack underflow".to_string());
                Value::Undefined
            }
        }
    }

    /// Identifier-table lookup; a missing entry means corrupted bytecode.
    fn identifier(&mut self, index: usize, pos: &Position) -> Result<Identifier, Option<StackFailure>> {
        match self.program.identifier(index) {
            Some(ident) => Ok(ident.clone()),
            None => {
                self.diag(pos, format!("Invalid identifier index {}", index));
                Err(None)
            }
        }
    }

    fn stack_failure(&mut self, pos: &Position, failure: Option<StackFailure>) {
        if let Some(failure) = failure {
            self.diag(pos, format!("Fragment lookup failed: {}", failure));
        }
        self.stack.push(Value::Undefined);
    }

    fn push_var(&mut self, index: usize, pos: &Position) {
        let result = match self.identifier(index, pos) {
            Ok(ident) => match self.frags.find_variable(&ident) {
                Ok(value) => Ok(value),
                Err(StackFailure::NotFound) => {
                    self.diag(pos, format!("Variable '{}' is undefined", ident.name));
                    Err(())
                }
                Err(StackFailure::TypeMismatch) => {
                    self.diag(
                        pos,
                        format!("'{}' is a fragment, not a variable", ident.name),
                    );
                    Err(())
                }
                Err(failure) => {
                    self.diag(
                        pos,
                        format!("Cannot read variable '{}': {}", ident.name, failure),
                    );
                    Err(())
                }
            },
            Err(_) => Err(()),
        };
        self.stack.push(result.unwrap_or(Value::Undefined));
    }

    fn push_attr(&mut self, name: &str, pos: &Position) {
        let value = self.pop(pos);
        let result = match &value {
            Value::FragRef(frag) => match frag.get(name) {
                Some(FragmentValue::Fragment(nested)) => Value::FragRef(nested),
                // a one-element list behaves as the fragment itself
                Some(FragmentValue::List(list)) if list.len() == 1 => {
                    Value::FragRef(&list.as_slice()[0])
                }
                Some(FragmentValue::List(list)) => Value::ListRef(ListRef { list, index: 0 }),
                Some(scalar) => Value::from_fragment_value(scalar),
                None => {
                    self.diag(pos, format!("Fragment has no attribute '{}'", name));
                    Value::Undefined
                }
            },
            Value::Undefined => {
                self.diag(pos, format!("Cannot read attribute '{}' of undefined", name));
                Value::Undefined
            }
            other => {
                self.diag(
                    pos,
                    format!("Cannot read attribute '{}' of a {}", name, other.type_name()),
                );
                Value::Undefined
            }
        };
        self.stack.push(result);
    }

    fn push_frag_count(&mut self, index: usize, pos: &Position) {
        let result = match self.identifier(index, pos) {
            Ok(ident) => {
                if ident.name == ERROR_FRAG_NAME && self.config.error_fragment {
                    Ok(self.log.count())
                } else if ident.name.is_empty() {
                    self.frags.get_fragment_size(&ident).map_err(Some)
                } else {
                    self.frags.get_sub_fragment_size(&ident).map_err(Some)
                }
            }
            Err(failure) => Err(failure),
        };
        match result {
            Ok(size) => self.stack.push(Value::Integral(size as i64)),
            Err(failure) => self.stack_failure(pos, failure),
        }
    }

    fn push_dict(&mut self, key_index: usize, pos: &Position) {
        let key = match self.program.constant(key_index) {
            Some(constant) => constant.value().string().into_owned(),
            None => {
                self.diag(pos, format!("Invalid constant index {}", key_index));
                self.stack.push(Value::Undefined);
                return;
            }
        };
        match self.lang.lookup(&key) {
            Some(value) => self.stack.push(Value::StringRef(value)),
            None => {
                self.log.warning(
                    pos.clone(),
                    format!("Dictionary item '{}' was not found", key),
                );
                self.stack.push(Value::String(format!("#{{{}}}", key)));
            }
        }
    }

    fn push_ctype(&mut self, name_index: usize, pos: &Position) {
        let name = match self.program.constant(name_index) {
            Some(constant) => constant.value().string().into_owned(),
            None => {
                self.diag(pos, format!("Invalid constant index {}", name_index));
                self.ctypes.push(self.ctypes[0]);
                return;
            }
        };
        match ContentType::find(&name) {
            Some(ctype) => self.ctypes.push(ctype),
            None => {
                self.log.warning(
                    pos.clone(),
                    format!("Unknown content type '{}'", name),
                );
                // keep the scope balanced with the outer type
                self.ctypes.push(self.ctypes[0]);
            }
        }
    }

    /// Numeric binary operation: integral when both operands are
    /// integral, real otherwise. Undefined operands propagate silently;
    /// failed conversions and zero divisors yield undefined with a
    /// diagnostic, as does any non-finite real result of finite inputs.
    /// Integral arithmetic wraps on overflow.
    fn arith(
        &mut self,
        pos: &Position,
        name: &str,
        int_op: fn(i64, i64) -> Option<i64>,
        real_op: fn(f64, f64) -> f64,
    ) {
        let b = self.pop(pos);
        let a = self.pop(pos);
        if a.is_undefined() || b.is_undefined() {
            self.stack.push(Value::Undefined);
            return;
        }
        let result = match (a.numeric(), b.numeric()) {
            (Some(Numeric::Integral(x)), Some(Numeric::Integral(y))) => match int_op(x, y) {
                Some(value) => Value::Integral(value),
                None => {
                    self.diag(pos, format!("{} by zero", name));
                    Value::Undefined
                }
            },
            (Some(x), Some(y)) => {
                let (x, y) = (x.as_real(), y.as_real());
                let value = real_op(x, y);
                if !value.is_finite() && x.is_finite() && y.is_finite() {
                    self.diag(pos, format!("{} result is not a finite number", name));
                    Value::Undefined
                } else {
                    Value::Real(value)
                }
            }
            _ => {
                self.diag(pos, "Arithmetic on a non-numeric value".to_string());
                Value::Undefined
            }
        };
        self.stack.push(result);
    }

    fn equality(&mut self, pos: &Position, negated: bool) {
        let b = self.pop(pos);
        let a = self.pop(pos);
        let result = match a.equals(&b) {
            Some(equal) => Value::Integral((equal != negated) as i64),
            None => {
                if !a.is_undefined() && !b.is_undefined() {
                    self.diag(pos, "Values are not comparable".to_string());
                }
                Value::Undefined
            }
        };
        self.stack.push(result);
    }

    fn relational(&mut self, pos: &Position, test: fn(std::cmp::Ordering) -> bool) {
        let b = self.pop(pos);
        let a = self.pop(pos);
        if a.is_undefined() || b.is_undefined() {
            self.stack.push(Value::Undefined);
            return;
        }
        let ordering = if a.is_string() && b.is_string() {
            Some(a.string().cmp(&b.string()))
        } else {
            match (a.numeric(), b.numeric()) {
                (Some(Numeric::Integral(x)), Some(Numeric::Integral(y))) => Some(x.cmp(&y)),
                (Some(x), Some(y)) => x.as_real().partial_cmp(&y.as_real()),
                _ => None,
            }
        };
        let result = match ordering {
            Some(ordering) => Value::Integral(test(ordering) as i64),
            None => {
                self.diag(pos, "Values are not comparable".to_string());
                Value::Undefined
            }
        };
        self.stack.push(result);
    }

    fn bitop(&mut self, pos: &Position, op: fn(i64, i64) -> i64) {
        let b = self.pop(pos);
        let a = self.pop(pos);
        if a.is_undefined() || b.is_undefined() {
            self.stack.push(Value::Undefined);
            return;
        }
        let result = match (a.numeric(), b.numeric()) {
            (Some(Numeric::Integral(x)), Some(Numeric::Integral(y))) => Value::Integral(op(x, y)),
            _ => {
                self.diag(pos, "Bit operation on a non-integral value".to_string());
                Value::Undefined
            }
        };
        self.stack.push(result);
    }

    fn match_regex(&mut self, pos: &Position, negated: bool) {
        let pattern = self.pop(pos);
        let subject = self.pop(pos);
        let regex = match &pattern {
            Value::Regex(regex) => Some(regex.clone()),
            Value::Undefined => None,
            other => match RegexValue::compile(&other.string(), RegexFlags::default()) {
                Ok(compiled) => Some(std::sync::Arc::new(compiled)),
                Err(err) => {
                    self.diag(pos, format!("Invalid regex: {}", err));
                    None
                }
            },
        };
        let result = match regex {
            Some(regex) => {
                let matched = regex.regex.is_match(&subject.string());
                Value::Integral((matched != negated) as i64)
            }
            None => Value::Undefined,
        };
        self.stack.push(result);
    }

    fn call_function(&mut self, name: &str, argc: usize, pos: &Position) -> Result<(), TengError> {
        let at = self.stack.len().saturating_sub(argc);
        let mut args = self.stack.split_off(at);
        while args.len() < argc {
            args.insert(0, Value::Undefined);
        }
        let escaper = self.top_ctype();
        let result = {
            let mut ctx = FunctionCtx {
                utf8: self.config.utf8,
                lang: self.lang,
                escaper,
                log: &mut *self.log,
                pos: pos.clone(),
            };
            functions::call(name, &mut ctx, args)
        };
        match result {
            Some(value) => self.stack.push(value),
            None => {
                self.log
                    .error(pos.clone(), format!("Unknown function '{}'", name));
                self.stack.push(Value::Undefined);
            }
        }
        Ok(())
    }

    /// Readable dump of the data tree and dictionaries for `<?teng
    /// debug?>`.
    fn debug_dump(&self) -> String {
        let mut out = String::from("Template data:\n");
        dump_fragment(self.data, 1, self.config.max_debug_val_length, &mut out);
        out.push_str("Language dictionary:\n");
        let mut keys: Vec<_> = self.lang.iter().collect();
        keys.sort();
        for (key, value) in keys {
            out.push_str(&format!(
                "    {}: \"{}\"\n",
                key,
                truncated(value, self.config.max_debug_val_length)
            ));
        }
        out
    }
}

fn truncated(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        value.to_string()
    } else {
        let cut: String = value.chars().take(limit).collect();
        format!("{}...", cut)
    }
}

fn dump_fragment(frag: &Fragment, level: usize, limit: usize, out: &mut String) {
    let indent = "    ".repeat(level);
    for (name, value) in frag.iter() {
        match value {
            FragmentValue::String(s) => {
                out.push_str(&format!("{}{}: \"{}\"\n", indent, name, truncated(s, limit)))
            }
            FragmentValue::Integral(i) => out.push_str(&format!("{}{}: {}\n", indent, name, i)),
            FragmentValue::Real(r) => out.push_str(&format!("{}{}: {}\n", indent, name, r)),
            FragmentValue::Fragment(nested) => {
                out.push_str(&format!("{}{}:\n", indent, name));
                dump_fragment(nested, level + 1, limit, out);
            }
            FragmentValue::List(list) => {
                for (index, item) in list.as_slice().iter().enumerate() {
                    out.push_str(&format!("{}{}[{}]:\n", indent, name, index));
                    dump_fragment(item, level + 1, limit, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::FormatterMode;
    use crate::parser::{compile_string, CompileParams};
    use crate::resolver::NullResolver;
    use crate::writer::StringWriter;

    fn render_with(
        source: &str,
        data: &Fragment,
        lang: &Dictionary,
        config: &Config,
    ) -> (String, ErrorLog) {
        let params = CompileParams {
            config,
            resolver: &NullResolver,
        };
        let program = compile_string(source, None, &params);
        let mut log = ErrorLog::new();
        log.append(&program.diagnostics);

        let mut writer = StringWriter::new();
        {
            let mut formatter = Formatter::new(&mut writer, FormatterMode::PassWhite);
            let processor = Processor::new(
                &program,
                lang,
                config,
                ContentType::default_type(),
                data,
                &mut formatter,
                &mut log,
            );
            processor.run().expect("render should not fail");
            formatter.flush().expect("flush should not fail");
        }
        (writer.into_string(), log)
    }

    fn render(source: &str, data: &Fragment) -> (String, ErrorLog) {
        let config = Config {
            print_escape: true,
            short_tag: true,
            error_fragment: true,
            ..Config::default()
        };
        render_with(source, data, &Dictionary::new(), &config)
    }

    fn empty() -> Fragment {
        Fragment::new()
    }

    #[test]
    fn test_plain_text_render() {
        let (out, log) = render("hello world", &empty());
        assert_eq!(out, "hello world");
        assert!(log.is_empty());
    }

    #[test]
    fn test_nested_fragment_iteration() {
        let mut root = Fragment::new();
        let row = root.add_fragment("row");
        let col = row.add_fragment("col");
        col.add_variable("cnum", 1i64);
        let col = row.add_fragment("col");
        col.add_variable("cnum", 2i64);
        let row = root.add_fragment("row");
        let col = row.add_fragment("col");
        col.add_variable("cnum", 3i64);

        let (out, log) = render(
            "<?teng frag row?><?teng frag col?>${cnum}<?teng endfrag?><?teng endfrag?>",
            &root,
        );
        assert_eq!(out, "123");
        assert!(log.is_empty());
    }

    #[test]
    fn test_division_by_zero_is_a_diagnostic() {
        let (out, log) = render("${1/0}", &empty());
        assert_eq!(out, "");
        assert_eq!(log.max_level(), crate::error::Severity::Diag);
    }

    #[test]
    fn test_integer_overflow_wraps_silently() {
        let (out, log) = render("${9223372036854775807 + 1}", &empty());
        assert_eq!(out, "-9223372036854775808");
        assert!(log.is_empty());
    }

    #[test]
    fn test_concat_and_numeric_coercion() {
        let (out, _) = render("${'a' ++ 'b'}", &empty());
        assert_eq!(out, "ab");
        let (out, log) = render("${1 + \"2\"}", &empty());
        assert_eq!(out, "3");
        assert!(log.is_empty());
    }

    #[test]
    fn test_real_arithmetic() {
        let (out, _) = render("${1.5 + 1.5}", &empty());
        assert_eq!(out, "3");
        let (out, _) = render("${3 * 0.5}", &empty());
        assert_eq!(out, "1.5");
    }

    #[test]
    fn test_undefined_propagates_silently_through_arithmetic() {
        let mut root = Fragment::new();
        root.add_variable("x", 1i64);
        let (out, log) = render("${missing + 1}", &root);
        assert_eq!(out, "");
        // the lookup itself logs, the addition does not add more
        assert_eq!(log.count(), 1);
    }

    #[test]
    fn test_short_circuit_values() {
        let (out, _) = render("${0 || 'fallback'}", &empty());
        assert_eq!(out, "fallback");
        let (out, _) = render("${'first' || 'second'}", &empty());
        assert_eq!(out, "first");
        let (out, _) = render("${0 && 'x'}", &empty());
        assert_eq!(out, "0");
        let (out, _) = render("${2 && 3}", &empty());
        assert_eq!(out, "3");
    }

    #[test]
    fn test_ternary() {
        let mut root = Fragment::new();
        root.add_variable("flag", 1i64);
        let (out, _) = render("${flag ? 'yes' : 'no'}", &root);
        assert_eq!(out, "yes");
        root.add_variable("flag", 0i64);
        let (out, _) = render("${flag ? 'yes' : 'no'}", &root);
        assert_eq!(out, "no");
    }

    #[test]
    fn test_conditional_directives() {
        let mut root = Fragment::new();
        root.add_variable("n", 2i64);
        let (out, log) = render(
            "<?teng if n == 1?>one<?teng elif n == 2?>two<?teng else?>many<?teng endif?>",
            &root,
        );
        assert_eq!(out, "two");
        assert!(log.is_empty());
    }

    #[test]
    fn test_set_and_read_local() {
        let (out, log) = render("<?teng set x = 2 * 21?>${x}", &empty());
        assert_eq!(out, "42");
        assert!(log.is_empty());
    }

    #[test]
    fn test_set_cannot_shadow_data() {
        let mut root = Fragment::new();
        root.add_variable("x", 1i64);
        let (out, log) = render("<?teng set x = 9?>${x}", &root);
        assert_eq!(out, "1");
        assert_eq!(log.max_level(), crate::error::Severity::Diag);
    }

    #[test]
    fn test_format_nowhite() {
        let (out, log) = render(
            "<?teng format space=\"nowhite\"?>  a   b  <?teng endformat?>",
            &empty(),
        );
        assert_eq!(out, "ab");
        assert!(log.is_empty());
    }

    #[test]
    fn test_ctype_escaping() {
        let (out, log) = render(
            "<?teng ctype \"text/html\"?>${'a < b'}<?teng endctype?>",
            &empty(),
        );
        assert_eq!(out, "a &lt; b");
        assert!(log.is_empty());
    }

    #[test]
    fn test_nested_ctype_escape_composition() {
        let (out, log) = render(
            "<?teng ctype \"text/html\"?><?teng ctype \"quoted-string\"?>\
             ${escape(\"<b>fuj\\\"</b>\")}<?teng endctype?><?teng endctype?>",
            &empty(),
        );
        assert_eq!(out, "\"\\u003Cb\\u003Efuj\\\"\\u003C/b\\u003E\"");
        assert!(log.is_empty());
    }

    #[test]
    fn test_unknown_ctype_keeps_scope_balanced() {
        let (out, log) = render(
            "<?teng ctype \"text/strange\"?>${'a < b'}<?teng endctype?>ok",
            &empty(),
        );
        assert_eq!(out, "a < bok");
        assert_eq!(log.max_level(), crate::error::Severity::Warning);
    }

    #[test]
    fn test_specials_inside_fragment() {
        let mut root = Fragment::new();
        for n in 1..=3i64 {
            root.add_fragment("row").add_variable("n", n);
        }
        let (out, log) = render(
            "<?teng frag row?>${_index}/${_count}<?teng if _last?>.<?teng else?>,<?teng endif?><?teng endfrag?>",
            &root,
        );
        assert_eq!(out, "0/3,1/3,2/3.");
        assert!(log.is_empty());
    }

    #[test]
    fn test_dotted_attribute_access() {
        let mut root = Fragment::new();
        let user = root.add_fragment("user");
        user.add_variable("name", "kim");
        let (out, log) = render("${user.name}", &root);
        assert_eq!(out, "kim");
        assert!(log.is_empty());
    }

    #[test]
    fn test_case_expression() {
        let mut root = Fragment::new();
        root.add_variable("n", 3i64);
        let (out, log) = render("${case(n, 1: 'one', 2, 3: 'few', *: 'many')}", &root);
        assert_eq!(out, "few");
        assert!(log.is_empty());
        root.add_variable("n", 7i64);
        let (out, _) = render("${case(n, 1: 'one', 2, 3: 'few', *: 'many')}", &root);
        assert_eq!(out, "many");
    }

    #[test]
    fn test_regex_match() {
        let mut root = Fragment::new();
        root.add_variable("mail", "teng@example.com");
        let (out, log) = render("${mail =~ /@example\\.com$/ ? 'ours' : 'other'}", &root);
        assert_eq!(out, "ours");
        assert!(log.is_empty());
        let (out, _) = render("${mail !~ /@example\\.com$/}", &root);
        assert_eq!(out, "0");
    }

    #[test]
    fn test_defined_and_exists() {
        let mut root = Fragment::new();
        root.add_variable("x", 0i64);
        root.add_fragment("row");
        let (out, _) = render("${exists(x)}${exists(row)}${exists(nope)}", &root);
        assert_eq!(out, "110");
        let (out, _) = render("${defined(x)}", &root);
        assert_eq!(out, "1");
    }

    #[test]
    fn test_error_fragment_lists_entries() {
        let (out, log) = render(
            "${1/0}<?teng frag _error?>[${level}:${message}]<?teng endfrag?>",
            &empty(),
        );
        assert_eq!(out, "[2:Division by zero]");
        assert_eq!(log.max_level(), crate::error::Severity::Diag);
    }

    #[test]
    fn test_error_fragment_disabled_is_skipped() {
        let config = Config {
            print_escape: true,
            ..Config::default()
        };
        let (out, _) = render_with(
            "${1/0}<?teng frag _error?>[${message}]<?teng endfrag?>",
            &empty(),
            &Dictionary::new(),
            &config,
        );
        assert_eq!(out, "");
    }

    #[test]
    fn test_function_call_and_arity_error() {
        let (out, log) = render("${strtoupper('ab')}", &empty());
        assert_eq!(out, "AB");
        assert!(log.is_empty());

        let (out, log) = render("${strtoupper('a', 'b')}", &empty());
        assert_eq!(out, "");
        assert_eq!(log.max_level(), crate::error::Severity::Error);
    }

    #[test]
    fn test_unknown_function() {
        let (out, log) = render("${frobnicate(1)}", &empty());
        assert_eq!(out, "");
        assert_eq!(log.max_level(), crate::error::Severity::Error);
    }

    #[test]
    fn test_rooted_access_from_inner_fragment() {
        let mut root = Fragment::new();
        root.add_variable("top", "T");
        root.add_fragment("row").add_variable("n", 1i64);
        let (out, log) = render(
            "<?teng frag row?>${.top}${n}<?teng endfrag?>",
            &root,
        );
        assert_eq!(out, "T1");
        assert!(log.is_empty());
    }

    #[test]
    fn test_new_chain_restarts_at_root() {
        let mut root = Fragment::new();
        root.add_fragment("a").add_variable("x", "inner");
        root.add_fragment("b").add_variable("y", "other");
        let (out, log) = render(
            "<?teng frag a?><?teng frag .b?>${y}<?teng endfrag?>${x}<?teng endfrag?>",
            &root,
        );
        assert_eq!(out, "otherinner");
        assert!(log.is_empty());
    }

    #[test]
    fn test_empty_fragment_skips_body() {
        let (out, log) = render("a<?teng frag none?>${x}<?teng endfrag?>b", &empty());
        assert_eq!(out, "ab");
        assert!(log.is_empty());
    }

    #[test]
    fn test_raw_print_bypasses_escaping() {
        let (out, _) = render(
            "<?teng ctype \"text/html\"?>%{'a<b'}${'a<b'}<?teng endctype?>",
            &empty(),
        );
        assert_eq!(out, "a<ba&lt;b");
    }

    #[test]
    fn test_dict_token_prints_value_or_placeholder() {
        let mut lang = Dictionary::new();
        lang.insert("greeting", "Hello");
        let config = Config {
            print_escape: true,
            ..Config::default()
        };
        let (out, log) = render_with("#{greeting} #{missing}", &empty(), &lang, &config);
        assert_eq!(out, "Hello #{missing}");
        assert_eq!(log.max_level(), crate::error::Severity::Warning);
    }

    #[test]
    fn test_debug_dump_gated_by_config() {
        let mut root = Fragment::new();
        root.add_variable("x", "value");
        let (out, _) = render("<?teng debug?>", &root);
        assert_eq!(out, "");

        let config = Config {
            debug_enabled: true,
            ..Config::default()
        };
        let (out, _) = render_with("<?teng debug?>", &root, &Dictionary::new(), &config);
        assert!(out.contains("x: \"value\""));
    }

    #[test]
    fn test_bytecode_dump_gated_by_config() {
        let config = Config {
            bytecode_enabled: true,
            ..Config::default()
        };
        let (out, _) = render_with("<?teng bytecode?>x", &empty(), &Dictionary::new(), &config);
        assert!(out.contains("BYTECODE"));
        assert!(out.contains("HALT"));
    }
}
