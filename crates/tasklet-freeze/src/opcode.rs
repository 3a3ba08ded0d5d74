//! Instruction set of the frozen token stream

use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};

/// Instruction opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Source line marker; operand: line number (u32)
    Line = 0x01,
    /// Identifier or keyword; operand: index into the name table (u32)
    Name = 0x02,
    /// Literal; operand: index into the constant pool (u32)
    Const = 0x03,
    /// Operator or delimiter; operand: punctuation id (u8)
    Punct = 0x04,
    /// End of the stream
    End = 0xFF,
}

impl Opcode {
    /// Convert from a raw byte
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Opcode::Line),
            0x02 => Some(Opcode::Name),
            0x03 => Some(Opcode::Const),
            0x04 => Some(Opcode::Punct),
            0xFF => Some(Opcode::End),
            _ => None,
        }
    }

    /// Convert to the raw byte
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Operators and delimiters, longest first; an instruction carries the index
pub const PUNCTUATION: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "**", "//", "==", "!=", "<=", ">=", "->", "+=", "-=", "*=",
    "/=", "%=", "&=", "|=", "^=", "@=", ">>", "<<", ":=", "+", "-", "*", "/", "%", "@", "&", "|",
    "^", "~", "<", ">", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "=", "!",
];

/// Look up the id of an operator or delimiter
pub fn punct_id(text: &str) -> Option<u8> {
    PUNCTUATION
        .iter()
        .position(|p| *p == text)
        .and_then(|id| u8::try_from(id).ok())
}

/// A decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Source line marker
    Line(u32),
    /// Name table reference
    Name(u32),
    /// Constant pool reference
    Const(u32),
    /// Operator or delimiter id
    Punct(u8),
    /// End of stream
    End,
}

impl Instruction {
    /// Append the instruction to `writer`
    pub fn encode(self, writer: &mut BytecodeWriter) {
        match self {
            Instruction::Line(line) => {
                writer.emit_u8(Opcode::Line.to_u8());
                writer.emit_u32(line);
            }
            Instruction::Name(index) => {
                writer.emit_u8(Opcode::Name.to_u8());
                writer.emit_u32(index);
            }
            Instruction::Const(index) => {
                writer.emit_u8(Opcode::Const.to_u8());
                writer.emit_u32(index);
            }
            Instruction::Punct(id) => {
                writer.emit_u8(Opcode::Punct.to_u8());
                writer.emit_u8(id);
            }
            Instruction::End => writer.emit_u8(Opcode::End.to_u8()),
        }
    }

    /// Read one instruction from `reader`
    pub fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let offset = reader.position();
        let byte = reader.read_u8()?;
        let opcode = Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode(byte, offset))?;
        Ok(match opcode {
            Opcode::Line => Instruction::Line(reader.read_u32()?),
            Opcode::Name => Instruction::Name(reader.read_u32()?),
            Opcode::Const => Instruction::Const(reader.read_u32()?),
            Opcode::Punct => Instruction::Punct(reader.read_u8()?),
            Opcode::End => Instruction::End,
        })
    }
}

/// Decode a whole instruction stream
pub fn decode_all(code: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    let mut reader = BytecodeReader::new(code);
    let mut instructions = Vec::new();
    while reader.has_more() {
        instructions.push(Instruction::decode(&mut reader)?);
    }
    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_bytes() {
        for op in [
            Opcode::Line,
            Opcode::Name,
            Opcode::Const,
            Opcode::Punct,
            Opcode::End,
        ] {
            assert_eq!(Opcode::from_u8(op.to_u8()), Some(op));
        }
        assert_eq!(Opcode::from_u8(0x00), None);
    }

    #[test]
    fn test_punctuation_ids() {
        assert_eq!(punct_id("**="), Some(0));
        assert_eq!(punct_id("("), PUNCTUATION.iter().position(|p| *p == "(").map(|i| i as u8));
        assert_eq!(punct_id("$"), None);
        assert!(PUNCTUATION.len() <= u8::MAX as usize);
    }

    #[test]
    fn test_invalid_opcode_offset() {
        let mut writer = BytecodeWriter::new();
        Instruction::Line(1).encode(&mut writer);
        writer.emit_u8(0x7E);
        assert_eq!(
            decode_all(writer.buffer()),
            Err(DecodeError::InvalidOpcode(0x7E, 5))
        );
    }

    #[test]
    fn test_truncated_operand() {
        let code = [Opcode::Name.to_u8(), 0x01, 0x00];
        assert_eq!(decode_all(&code), Err(DecodeError::UnexpectedEnd(1)));
    }
}
