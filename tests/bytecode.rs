//! Precompiled chunks: dump, load, files and the fingerprint cache

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::rc::Rc;

use ferrous_script::bytecode::{self, BytecodeCache};
use ferrous_script::{
    OpCode, Processor, ProtoBuilder, ProtoFlags, ScriptError, ScriptResult, SourceRef, Value,
};

/// function(n) local t = {} t.sum = n + 1 return t.sum .. "!" end,
/// wrapped in a chunk with source spans and annotations
fn sample_chunk(source: u32) -> ProtoBuilder {
    let mut f = ProtoBuilder::function("bump");
    let n = f.local("n");
    let t = f.local("t");
    f.source(Some(SourceRef::new(source, 2, 1, 20).stop_point()));
    f.begin_fn(1, false);
    f.new_table(1);
    f.store(&t);
    f.load(&n);
    f.push_number(1.0);
    f.op(OpCode::Add);
    f.load(&t);
    f.index_set(Some("sum"));
    f.source(Some(SourceRef::new(source, 3, 1, 12)));
    f.load(&t);
    f.index(Some("sum"));
    f.push_string("!");
    f.op(OpCode::Concat);
    f.ret(1);

    let mut chunk = ProtoBuilder::chunk("sample");
    let bump = chunk.global("bump");
    chunk.annotate("version", Value::Number(3.0));
    chunk.annotate("author", Value::from("tests"));
    chunk.set_flags(ProtoFlags::IS_CHUNK);
    chunk.begin_fn(0, false);
    chunk.closure(f.build());
    chunk.store(&bump);
    chunk.load(&bump);
    chunk.ret(1);
    chunk
}

#[test]
fn test_processor_dump_and_undump_run_identically() -> ScriptResult<()> {
    let mut p = Processor::default();
    let source = p.register_source("sample");
    let chunk = p.load(Rc::new(sample_chunk(source).build()))?;
    let bytes = p.dump(&chunk)?;

    let mut q = Processor::default();
    let restored = q.undump(&bytes)?;
    let bump = q.call(&restored, vec![])?;
    assert_eq!(q.call(&bump, vec![Value::Number(41.0)])?, Value::from("42!"));

    // the restored proto is structurally the same
    if let (Value::Function(a), Value::Function(b)) = (&chunk, &restored) {
        assert_eq!(a.proto().as_ref(), b.proto().as_ref());
        assert_eq!(b.proto().annotation("version"), Some(&Value::Number(3.0)));
        assert_eq!(b.proto().annotation("author"), Some(&Value::from("tests")));
    } else {
        panic!("expected script functions");
    }
    Ok(())
}

#[test]
fn test_natives_cannot_be_dumped() {
    let p = Processor::default();
    let native = Value::new_callback(ferrous_script::CallbackFunction::new("n", |_ctx, _args| {
        Ok(Value::Nil)
    }));
    assert!(p.dump(&native).is_err());
    assert!(p.dump(&Value::Nil).is_err());
}

#[test]
fn test_file_round_trip() -> ScriptResult<()> {
    let proto = sample_chunk(0).build();
    let mut file: File = tempfile::tempfile()?;
    bytecode::write_to(&proto, &mut file)?;
    file.seek(SeekFrom::Start(0))?;
    let restored = bytecode::read_from(&mut file)?;
    assert_eq!(restored, proto);
    Ok(())
}

#[test]
fn test_corrupted_input_is_rejected() -> ScriptResult<()> {
    let bytes = bytecode::dump(&sample_chunk(0).build())?;

    let mut flipped = bytes.clone();
    flipped[0] ^= 0xff;
    assert!(matches!(bytecode::undump(&flipped), Err(ScriptError::Bytecode(_))));

    for cut in [9, bytes.len() / 2, bytes.len() - 1] {
        assert!(
            matches!(bytecode::undump(&bytes[..cut]), Err(ScriptError::Bytecode(_))),
            "truncation at {} was accepted",
            cut
        );
    }

    let mut padded = bytes.clone();
    padded.push(0);
    assert!(matches!(bytecode::undump(&padded), Err(ScriptError::Bytecode(_))));
    Ok(())
}

#[test]
fn test_fingerprint_is_stable_and_content_sensitive() -> ScriptResult<()> {
    let a = bytecode::fingerprint(&sample_chunk(0).build())?;
    let b = bytecode::fingerprint(&sample_chunk(0).build())?;
    let c = bytecode::fingerprint(&sample_chunk(1).build())?;
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), 40);
    assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    Ok(())
}

#[test]
fn test_cache_shares_entries_between_clones() -> ScriptResult<()> {
    let cache = BytecodeCache::new();
    let view = cache.clone();
    let proto = sample_chunk(0).build();
    let key = cache.insert(&proto)?;
    assert!(view.contains_key(&key)?);
    assert_eq!(view.len()?, 1);
    assert_eq!(view.get(&key)?, Some(proto.clone()));

    // inserting the same function again is idempotent
    assert_eq!(cache.insert(&proto)?, key);
    assert_eq!(cache.len()?, 1);

    let mut p = Processor::default();
    let restored = view.get(&key)?.map(Rc::new).map(|proto| p.load(proto)).transpose()?;
    let bump = p.call(&restored.unwrap_or(Value::Nil), vec![])?;
    assert_eq!(p.call(&bump, vec![Value::Number(1.0)])?, Value::from("2!"));

    view.clear()?;
    assert!(cache.get_bytes(&key)?.is_none());
    Ok(())
}
