//! Frozen module format
//!
//! Layout, all integers little-endian:
//! - magic `TKFZ` (4 bytes), version (u32), flags (u32)
//! - module name (length-prefixed UTF-8)
//! - name table: count (u32) + strings
//! - constant pool: count (u32) + tagged constants
//! - code: length (u32) + instruction stream ending in `End`
//! - CRC32 of everything above (u32)

use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError, EncodeError};
use crate::opcode::{self, Instruction, PUNCTUATION};
use thiserror::Error;

/// Magic number of frozen modules: "TKFZ"
pub const MAGIC: [u8; 4] = *b"TKFZ";

/// Current format version
pub const VERSION: u32 = 1;

/// Module flags
pub mod flags {
    /// Compiled from the external half of the bootstrap
    pub const EXTERNAL: u32 = 1 << 0;
}

const CONST_INT: u8 = 0;
const CONST_FLOAT: u8 = 1;
const CONST_STR: u8 = 2;

/// Module encoding/decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    /// Decode error
    #[error("decode error: {0}")]
    DecodeError(#[from] DecodeError),

    /// Encode error
    #[error("encode error: {0}")]
    EncodeError(#[from] EncodeError),

    /// Invalid magic number
    #[error("invalid magic number: expected TKFZ, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("unsupported version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Stored checksum
        expected: u32,
        /// Checksum of the data
        actual: u32,
    },

    /// An instruction refers past the end of a table
    #[error("{table} index {index} out of range")]
    DanglingReference {
        /// Table the operand indexes
        table: &'static str,
        /// Offending operand
        index: u32,
    },

    /// The code does not end with an `End` instruction
    #[error("instruction stream is not terminated")]
    MissingEnd,

    /// Bytes between the code section and the checksum
    #[error("{0} trailing bytes after the code section")]
    TrailingData(usize),
}

/// A literal in the constant pool
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// Integer literal
    Int(i64),
    /// Floating point literal
    Float(f64),
    /// String literal, escapes resolved
    Str(String),
}

impl Constant {
    fn encode(&self, writer: &mut BytecodeWriter) -> Result<(), EncodeError> {
        match self {
            Constant::Int(value) => {
                writer.emit_u8(CONST_INT);
                writer.emit_i64(*value);
            }
            Constant::Float(value) => {
                writer.emit_u8(CONST_FLOAT);
                writer.emit_f64(*value);
            }
            Constant::Str(value) => {
                writer.emit_u8(CONST_STR);
                writer.emit_string(value)?;
            }
        }
        Ok(())
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let offset = reader.position();
        match reader.read_u8()? {
            CONST_INT => Ok(Constant::Int(reader.read_i64()?)),
            CONST_FLOAT => Ok(Constant::Float(reader.read_f64()?)),
            CONST_STR => Ok(Constant::Str(reader.read_string()?)),
            tag => Err(DecodeError::InvalidConstantTag(tag, offset)),
        }
    }
}

/// A compiled bootstrap module
#[derive(Debug, Clone, PartialEq)]
pub struct FrozenModule {
    /// Magic number (must be "TKFZ")
    pub magic: [u8; 4],
    /// Format version
    pub version: u32,
    /// Module flags
    pub flags: u32,
    /// Module name, e.g. `<frozen bootstrap>`
    pub name: String,
    /// Interned identifiers
    pub names: Vec<String>,
    /// Interned literals
    pub constants: Vec<Constant>,
    /// Instruction stream
    pub code: Vec<u8>,
}

impl FrozenModule {
    /// Create an empty module
    pub fn new(name: impl Into<String>, flags: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            name: name.into(),
            names: Vec::new(),
            constants: Vec::new(),
            code: Vec::new(),
        }
    }

    /// True if compiled from the external half of the bootstrap
    pub fn is_external(&self) -> bool {
        self.flags & flags::EXTERNAL != 0
    }

    /// Encode the module, checksum last
    pub fn encode(&self) -> Result<Vec<u8>, ModuleError> {
        let mut writer = BytecodeWriter::with_capacity(self.code.len() * 2 + 64);
        writer.emit_bytes(&self.magic);
        writer.emit_u32(self.version);
        writer.emit_u32(self.flags);
        writer.emit_string(&self.name)?;

        writer.emit_len(self.names.len())?;
        for name in &self.names {
            writer.emit_string(name)?;
        }

        writer.emit_len(self.constants.len())?;
        for constant in &self.constants {
            constant.encode(&mut writer)?;
        }

        writer.emit_len(self.code.len())?;
        writer.emit_bytes(&self.code);

        let checksum = crc32fast::hash(writer.buffer());
        writer.emit_u32(checksum);
        Ok(writer.into_bytes())
    }

    /// Decode and verify a module: magic, version, checksum, and every
    /// instruction operand
    pub fn decode(data: &[u8]) -> Result<Self, ModuleError> {
        let mut header = BytecodeReader::new(data);
        let magic: [u8; 4] = header.read_array()?;
        if magic != MAGIC {
            return Err(ModuleError::InvalidMagic(magic));
        }
        let version = header.read_u32()?;
        if version != VERSION {
            return Err(ModuleError::UnsupportedVersion(version));
        }

        if data.len() < 16 {
            return Err(DecodeError::UnexpectedEnd(data.len()).into());
        }
        let (payload, trailer) = data.split_at(data.len() - 4);
        let expected = BytecodeReader::new(trailer).read_u32()?;
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(ModuleError::ChecksumMismatch { expected, actual });
        }

        let mut reader = BytecodeReader::new(payload);
        reader.read_array::<4>()?;
        reader.read_u32()?;
        let flags = reader.read_u32()?;
        let name = reader.read_string()?;

        let name_count = reader.read_u32()? as usize;
        let mut names = Vec::with_capacity(name_count.min(reader.remaining()));
        for _ in 0..name_count {
            names.push(reader.read_string()?);
        }

        let const_count = reader.read_u32()? as usize;
        let mut constants = Vec::with_capacity(const_count.min(reader.remaining()));
        for _ in 0..const_count {
            constants.push(Constant::decode(&mut reader)?);
        }

        let code_len = reader.read_u32()? as usize;
        let code = reader.read_bytes(code_len)?;
        if reader.has_more() {
            return Err(ModuleError::TrailingData(reader.remaining()));
        }

        let module = Self {
            magic,
            version,
            flags,
            name,
            names,
            constants,
            code,
        };
        module.verify()?;
        Ok(module)
    }

    /// Decode the instruction stream
    pub fn instructions(&self) -> Result<Vec<Instruction>, DecodeError> {
        opcode::decode_all(&self.code)
    }

    /// Check that every operand resolves and the stream is terminated
    pub fn verify(&self) -> Result<(), ModuleError> {
        let instructions = self.instructions()?;
        for instruction in &instructions {
            match *instruction {
                Instruction::Name(index) if index as usize >= self.names.len() => {
                    return Err(ModuleError::DanglingReference {
                        table: "name",
                        index,
                    })
                }
                Instruction::Const(index) if index as usize >= self.constants.len() => {
                    return Err(ModuleError::DanglingReference {
                        table: "constant",
                        index,
                    })
                }
                Instruction::Punct(id) if id as usize >= PUNCTUATION.len() => {
                    return Err(ModuleError::DanglingReference {
                        table: "punctuation",
                        index: u32::from(id),
                    })
                }
                _ => {}
            }
        }
        match instructions.last() {
            Some(Instruction::End) => Ok(()),
            _ => Err(ModuleError::MissingEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FrozenModule {
        let mut module = FrozenModule::new("<frozen bootstrap>", 0);
        module.names.push("print".to_string());
        module.constants.push(Constant::Str("hi".to_string()));
        module.constants.push(Constant::Float(0.5));
        let mut writer = BytecodeWriter::new();
        Instruction::Line(1).encode(&mut writer);
        Instruction::Name(0).encode(&mut writer);
        Instruction::Punct(opcode::punct_id("(").unwrap()).encode(&mut writer);
        Instruction::Const(0).encode(&mut writer);
        Instruction::Punct(opcode::punct_id(")").unwrap()).encode(&mut writer);
        Instruction::End.encode(&mut writer);
        module.code = writer.into_bytes();
        module
    }

    #[test]
    fn test_module_creation() {
        let module = FrozenModule::new("m", flags::EXTERNAL);
        assert_eq!(module.magic, MAGIC);
        assert_eq!(module.version, VERSION);
        assert!(module.is_external());
    }

    #[test]
    fn test_decode_verifies_module() {
        let module = sample();
        let bytes = module.encode().unwrap();
        assert_eq!(&bytes[..4], b"TKFZ");
        assert_eq!(FrozenModule::decode(&bytes).unwrap(), module);
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut bytes = sample().encode().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(matches!(
            FrozenModule::decode(&bytes),
            Err(ModuleError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_magic_and_version() {
        let mut bytes = sample().encode().unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            FrozenModule::decode(&bytes),
            Err(ModuleError::InvalidMagic(_))
        ));

        let mut bytes = sample().encode().unwrap();
        bytes[4] = 9;
        assert_eq!(
            FrozenModule::decode(&bytes),
            Err(ModuleError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn test_truncated_module() {
        let bytes = sample().encode().unwrap();
        assert!(FrozenModule::decode(&bytes[..6]).is_err());
        assert!(FrozenModule::decode(&[]).is_err());
    }

    #[test]
    fn test_verify_rejects_dangling_operands() {
        let mut module = sample();
        module.names.clear();
        assert_eq!(
            module.verify(),
            Err(ModuleError::DanglingReference {
                table: "name",
                index: 0
            })
        );

        let mut module = sample();
        module.code.pop();
        assert_eq!(module.verify(), Err(ModuleError::MissingEnd));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_encode_error_is_a_module_error() {
        let err = ModuleError::from(EncodeError::LengthOverflow(1 << 33));
        assert_eq!(
            err.to_string(),
            "encode error: length 8589934592 does not fit a u32 prefix"
        );
    }
}
