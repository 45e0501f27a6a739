//! Error decoration, protected calls and unwinding

use std::rc::Rc;

use ferrous_script::{
    CallbackFunction, OpCode, Processor, ProtoBuilder, RuntimeErrorKind, ScriptError,
    ScriptOptions, ScriptResult, SourceRef, TailCallData, Value,
};

fn native<F>(name: &str, f: F) -> Value
where
    F: Fn(&mut ferrous_script::ExecutionContext<'_>, ferrous_script::CallbackArguments) -> ScriptResult<Value>
        + 'static,
{
    Value::new_callback(CallbackFunction::new(name, f))
}

/// `pcall`-like native: calls its first argument, turning errors into
/// `"caught: <message>"`
fn protect() -> Value {
    native("pcall", |_ctx, args| {
        let data = TailCallData::new(args.get(0), args.tail(1)).with_error_handler(
            CallbackFunction::new("pcall_handler", |_ctx, args| {
                Ok(Value::from(format!("caught: {}", args.get(0))))
            }),
        );
        Ok(Value::new_tail_call_request(data))
    })
}

fn fail() -> Value {
    native("fail", |_ctx, _args| Err(ScriptError::runtime("boom")))
}

/// main calls inner, which adds 1 to an undefined global
fn failing_chunk(source: u32) -> ProtoBuilder {
    let mut inner = ProtoBuilder::function("inner");
    let missing = inner.global("missing");
    inner.source(Some(SourceRef::new(source, 3, 4, 10)));
    inner.begin_fn(0, false);
    inner.load(&missing);
    inner.push_number(1.0);
    inner.op(OpCode::Add);
    inner.ret(1);

    let mut main = ProtoBuilder::chunk("main");
    main.source(Some(SourceRef::new(source, 7, 1, 8)));
    main.begin_fn(0, false);
    main.closure(inner.build());
    main.call(0, Some("inner"));
    main.ret(1);
    main
}

#[test]
fn test_error_handler_catches_native_failure() -> ScriptResult<()> {
    let mut p = Processor::default();
    let pcall = protect();
    assert_eq!(p.call(&pcall, vec![fail()])?, Value::from("caught: boom"));
    // no error: the value passes straight through
    let ok = native("ok", |_ctx, args| Ok(args.get(0)));
    assert_eq!(p.call(&pcall, vec![ok, Value::Number(7.0)])?, Value::Number(7.0));
    assert_eq!(p.call_depth(), 0);
    Ok(())
}

#[test]
fn test_error_location_decoration() -> ScriptResult<()> {
    let mut p = Processor::default();
    let source = p.register_source("main");
    let main = p.load(Rc::new(failing_chunk(source).build()))?;
    match p.call(&main, vec![]) {
        Err(ScriptError::Runtime(e)) => {
            assert_eq!(e.kind(), RuntimeErrorKind::Arithmetic);
            assert_eq!(e.message(), "attempt to perform arithmetic on a nil value");
            assert_eq!(
                e.to_string(),
                "main:(3,4-10): attempt to perform arithmetic on a nil value"
            );
            assert_eq!(e.instruction_pointer(), Some(3));

            let trace: Vec<String> = e.call_stack().iter().map(|f| f.to_string()).collect();
            assert_eq!(
                trace,
                vec![
                    "main:(3,4-10): in function 'inner'".to_string(),
                    "main:(7,1-8): in function 'main'".to_string(),
                ]
            );
        }
        other => panic!("expected a runtime error, got {:?}", other.map(|v| v.to_string())),
    }
    Ok(())
}

#[test]
fn test_legacy_location_format() -> ScriptResult<()> {
    let options = ScriptOptions {
        legacy_error_locations: true,
        ..ScriptOptions::default()
    };
    let mut p = Processor::new(options);
    let source = p.register_source("main");
    let main = p.load(Rc::new(failing_chunk(source).build()))?;
    let err = p.call(&main, vec![]).unwrap_err();
    assert_eq!(err.to_string(), "main:3: attempt to perform arithmetic on a nil value");
    Ok(())
}

#[test]
fn test_handler_sees_decorated_script_error() -> ScriptResult<()> {
    let mut p = Processor::default();
    let source = p.register_source("main");
    let main = p.load(Rc::new(failing_chunk(source).build()))?;
    let pcall = protect();
    assert_eq!(
        p.call(&pcall, vec![main])?,
        Value::from("caught: main:(3,4-10): attempt to perform arithmetic on a nil value")
    );
    Ok(())
}

#[test]
fn test_unwind_decorator_rewrites_message() -> ScriptResult<()> {
    let mut p = Processor::default();
    let traced = native("xpcall", |_ctx, args| {
        let decorator = Value::new_callback(CallbackFunction::new("traceback", |_ctx, args| {
            Ok(Value::from(format!("{}\n[traceback]", args.get(0))))
        }));
        let data = TailCallData::new(args.get(0), vec![])
            .with_error_handler(CallbackFunction::new("handler", |_ctx, args| Ok(args.get(0))))
            .with_unwind_decorator(decorator);
        Ok(Value::new_tail_call_request(data))
    });
    assert_eq!(p.call(&traced, vec![fail()])?, Value::from("boom\n[traceback]"));
    Ok(())
}

#[test]
fn test_failing_handler_propagates() -> ScriptResult<()> {
    let mut p = Processor::default();
    let strict = native("strict", |_ctx, args| {
        let data = TailCallData::new(args.get(0), vec![]).with_error_handler(CallbackFunction::new(
            "rethrow",
            |_ctx, args| Err(ScriptError::runtime(format!("rethrown: {}", args.get(0)))),
        ));
        Ok(Value::new_tail_call_request(data))
    });
    let err = p.call(&strict, vec![fail()]).unwrap_err();
    assert!(err.to_string().contains("rethrown: boom"), "got {}", err);
    assert_eq!(p.call_depth(), 0);
    Ok(())
}

#[test]
fn test_instruction_limit_is_not_catchable() -> ScriptResult<()> {
    // while true do end
    let mut spin = ProtoBuilder::function("spin");
    spin.begin_fn(0, false);
    let top = spin.here();
    spin.op(OpCode::Nop);
    spin.jump_to(OpCode::Jump, top);

    let mut chunk = ProtoBuilder::chunk("main");
    chunk.begin_fn(0, false);
    chunk.closure(spin.build());
    chunk.ret(1);

    let options = ScriptOptions {
        instruction_limit: Some(10_000),
        ..ScriptOptions::default()
    };
    let mut p = Processor::new(options);
    let main = p.load(Rc::new(chunk.build()))?;
    let spin = p.call(&main, vec![])?;
    let pcall = protect();
    match p.call(&pcall, vec![spin]) {
        Err(ScriptError::InstructionLimitExceeded) => {}
        other => panic!("expected the instruction limit, got {:?}", other.map(|v| v.to_string())),
    }
    assert_eq!(p.call_depth(), 0);
    assert!(p.instruction_count() > 10_000);
    Ok(())
}
