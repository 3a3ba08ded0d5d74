//! Compiles bootstrap source into a frozen module
//!
//! The compiled form is the token stream itself: names and literals are
//! interned into tables and referenced by index, and a line marker precedes
//! the first token of every source line. Brackets are checked for balance.

use crate::encoder::BytecodeWriter;
use crate::error::CompileError;
use crate::lexer::{Lexer, Span, Token};
use crate::module::{Constant, FrozenModule};
use crate::opcode::{Instruction, PUNCTUATION};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Int(i64),
    Float(u64),
    Str(String),
}

/// Single-use compiler for one module
pub struct Compiler {
    module: FrozenModule,
    name_index: FxHashMap<String, u32>,
    const_index: FxHashMap<ConstKey, u32>,
    writer: BytecodeWriter,
    line: u32,
    brackets: Vec<(char, Span)>,
}

impl Compiler {
    /// Create a compiler for a module called `name`
    pub fn new(name: impl Into<String>, flags: u32) -> Self {
        Self {
            module: FrozenModule::new(name, flags),
            name_index: FxHashMap::default(),
            const_index: FxHashMap::default(),
            writer: BytecodeWriter::new(),
            line: 0,
            brackets: Vec::new(),
        }
    }

    /// Compile `source`. Reports the first error; the rest are logged.
    pub fn compile(mut self, source: &str) -> Result<FrozenModule, CompileError> {
        let tokens = Lexer::new(source).tokenize().map_err(first_error)?;

        for (token, span) in tokens {
            if span.line != self.line {
                self.line = span.line;
                Instruction::Line(span.line).encode(&mut self.writer);
            }
            let instruction = match token {
                Token::Name(name) => Instruction::Name(self.intern_name(name)?),
                Token::Int(value) => Instruction::Const(self.intern_const(Constant::Int(value))?),
                Token::Float(value) => {
                    Instruction::Const(self.intern_const(Constant::Float(value))?)
                }
                Token::Str(value) => Instruction::Const(self.intern_const(Constant::Str(value))?),
                Token::Punct(id) => {
                    self.check_bracket(id, span)?;
                    Instruction::Punct(id)
                }
            };
            instruction.encode(&mut self.writer);
        }

        if let Some((open, span)) = self.brackets.pop() {
            return Err(CompileError::UnclosedBracket {
                open,
                line: span.line,
                column: span.column,
            });
        }

        Instruction::End.encode(&mut self.writer);
        self.module.code = self.writer.into_bytes();
        debug!(
            module = %self.module.name,
            names = self.module.names.len(),
            constants = self.module.constants.len(),
            code = self.module.code.len(),
            "module compiled"
        );
        Ok(self.module)
    }

    fn intern_name(&mut self, name: String) -> Result<u32, CompileError> {
        if let Some(&index) = self.name_index.get(&name) {
            return Ok(index);
        }
        let index = u32::try_from(self.module.names.len())
            .map_err(|_| CompileError::TooLarge("names"))?;
        self.name_index.insert(name.clone(), index);
        self.module.names.push(name);
        Ok(index)
    }

    fn intern_const(&mut self, constant: Constant) -> Result<u32, CompileError> {
        let key = match &constant {
            Constant::Int(value) => ConstKey::Int(*value),
            Constant::Float(value) => ConstKey::Float(value.to_bits()),
            Constant::Str(value) => ConstKey::Str(value.clone()),
        };
        if let Some(&index) = self.const_index.get(&key) {
            return Ok(index);
        }
        let index = u32::try_from(self.module.constants.len())
            .map_err(|_| CompileError::TooLarge("constants"))?;
        self.const_index.insert(key, index);
        self.module.constants.push(constant);
        Ok(index)
    }

    fn check_bracket(&mut self, id: u8, span: Span) -> Result<(), CompileError> {
        let Some(ch) = PUNCTUATION
            .get(usize::from(id))
            .and_then(|text| single_char(text))
        else {
            return Ok(());
        };
        match ch {
            '(' | '[' | '{' => {
                self.brackets.push((ch, span));
                Ok(())
            }
            ')' | ']' | '}' => match self.brackets.pop() {
                Some((open, _)) if closer(open) == ch => Ok(()),
                Some((open, _)) => Err(CompileError::MismatchedBracket {
                    open,
                    found: ch,
                    line: span.line,
                    column: span.column,
                }),
                None => Err(CompileError::UnmatchedBracket {
                    found: ch,
                    line: span.line,
                    column: span.column,
                }),
            },
            _ => Ok(()),
        }
    }
}

/// Compile `source` into a module called `name`
pub fn compile(source: &str, name: &str, flags: u32) -> Result<FrozenModule, CompileError> {
    Compiler::new(name, flags).compile(source)
}

fn first_error(mut errors: Vec<CompileError>) -> CompileError {
    for extra in errors.iter().skip(1) {
        warn!(error = %extra, "additional compile error");
    }
    errors.swap_remove(0)
}

fn single_char(text: &str) -> Option<char> {
    let mut chars = text.chars();
    let ch = chars.next()?;
    chars.next().is_none().then_some(ch)
}

fn closer(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::punct_id;

    fn p(text: &str) -> Instruction {
        Instruction::Punct(punct_id(text).unwrap())
    }

    #[test]
    fn test_compile_interns_tables() {
        let module = compile("x = 'a'\ny = x + 'a' + 1\n", "<test>", 0).unwrap();
        assert_eq!(module.names, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(
            module.constants,
            vec![Constant::Str("a".into()), Constant::Int(1)]
        );
        assert_eq!(
            module.instructions().unwrap(),
            vec![
                Instruction::Line(1),
                Instruction::Name(0),
                p("="),
                Instruction::Const(0),
                Instruction::Line(2),
                Instruction::Name(1),
                p("="),
                Instruction::Name(0),
                p("+"),
                Instruction::Const(0),
                p("+"),
                Instruction::Const(1),
                Instruction::End,
            ]
        );
        module.verify().unwrap();
    }

    #[test]
    fn test_empty_source() {
        let module = compile("# nothing here\n", "<test>", 0).unwrap();
        assert_eq!(module.instructions().unwrap(), vec![Instruction::End]);
    }

    #[test]
    fn test_float_constants_keep_bits() {
        let module = compile("0.0 0.0 1.5", "<test>", 0).unwrap();
        assert_eq!(
            module.constants,
            vec![Constant::Float(0.0), Constant::Float(1.5)]
        );
    }

    #[test]
    fn test_bracket_errors() {
        assert_eq!(
            compile("f(x]", "<test>", 0),
            Err(CompileError::MismatchedBracket {
                open: '(',
                found: ']',
                line: 1,
                column: 4
            })
        );
        assert_eq!(
            compile("x)", "<test>", 0),
            Err(CompileError::UnmatchedBracket {
                found: ')',
                line: 1,
                column: 2
            })
        );
        assert_eq!(
            compile("d = {\n  'k': [1, 2]\n", "<test>", 0),
            Err(CompileError::UnclosedBracket {
                open: '{',
                line: 1,
                column: 5
            })
        );
    }

    #[test]
    fn test_first_lex_error_reported() {
        assert_eq!(
            compile("a ? b ? c", "<test>", 0),
            Err(CompileError::UnexpectedCharacter {
                ch: '?',
                line: 1,
                column: 3
            })
        );
    }
}
