//! Binary serialization of compiled functions
//!
//! Layout: an 8-byte magic, a 1-byte format version, then one recursive
//! function descriptor:
//!
//! ```text
//! name | flags | annotations | symbol table | locals | upvalues | symbols
//!      | nested functions | strings | numbers | code | source refs
//! ```
//!
//! Lengths and indices are little-endian `u32`. Every `SymbolRef` used by a
//! function is written once into its symbol table; a global's environment is
//! a link to an earlier entry stored as `index + 1` (0 = none). Source refs
//! use one tag byte per instruction: 0 = none, 1 = same as the previous
//! instruction, 2 = explicit span follows.

mod cache;
mod dump;
mod undump;

use std::io::{Read, Write};

use sha1::{Digest, Sha1};

use crate::error::ScriptResult;
use crate::proto::FunctionProto;

pub use cache::BytecodeCache;

pub(crate) const MAGIC: [u8; 8] = *b"\x1bFSCRIPT";
pub(crate) const VERSION: u8 = 1;

/// Nested functions and annotation tables deeper than this are rejected
pub(crate) const MAX_NESTING: usize = 200;

/// Serialize a function and everything nested in it
pub fn dump(proto: &FunctionProto) -> ScriptResult<Vec<u8>> {
    let mut out = Vec::with_capacity(64 + proto.code.len() * 9);
    dump::BytecodeWriter::new(&mut out).write_chunk(proto)?;
    Ok(out)
}

/// Rebuild a function serialized by [`dump`]
pub fn undump(bytes: &[u8]) -> ScriptResult<FunctionProto> {
    undump::BytecodeReader::new(bytes).read_chunk()
}

/// Hex SHA-1 of the serialized form
pub fn fingerprint(proto: &FunctionProto) -> ScriptResult<String> {
    let bytes = dump(proto)?;
    let mut hasher = Sha1::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn write_to<W: Write>(proto: &FunctionProto, writer: &mut W) -> ScriptResult<()> {
    let bytes = dump(proto)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

pub fn read_from<R: Read>(reader: &mut R) -> ScriptResult<FunctionProto> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    undump(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScriptError;
    use crate::proto::{OpCode, ProtoBuilder, SourceRef};
    use crate::value::Value;

    fn sample() -> FunctionProto {
        let mut child = ProtoBuilder::function("inner");
        let x = child.local("x");
        child.begin_fn(1, false);
        child.load(&x);
        child.push_number(1.5);
        child.op(OpCode::Add);
        child.ret(1);

        let mut b = ProtoBuilder::chunk("main");
        b.annotate("pure", Value::Boolean(true));
        b.source(Some(SourceRef::new(0, 1, 0, 10).stop_point()));
        b.begin_fn(0, true);
        let f = b.global("f");
        b.closure(child.build());
        b.store(&f);
        b.source(None);
        b.load(&f);
        b.push_string("hi");
        b.call(1, Some("f"));
        b.ret(1);
        b.build()
    }

    #[test]
    fn test_header() {
        let bytes = dump(&sample()).unwrap();
        assert_eq!(&bytes[..8], &MAGIC);
        assert_eq!(bytes[8], VERSION);
    }

    #[test]
    fn test_undump_reproduces_disassembly() {
        let proto = sample();
        let back = undump(&dump(&proto).unwrap()).unwrap();
        assert_eq!(proto.to_string(), back.to_string());
        assert_eq!(dump(&back).unwrap(), dump(&proto).unwrap());
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        let mut bytes = dump(&sample()).unwrap();
        assert!(matches!(undump(&bytes[..bytes.len() - 3]), Err(ScriptError::Bytecode(_))));
        bytes[0] = b'X';
        assert!(matches!(undump(&bytes), Err(ScriptError::Bytecode(_))));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = fingerprint(&sample()).unwrap();
        let b = fingerprint(&sample()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }
}
