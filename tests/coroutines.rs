//! Coroutines: yield/resume value passing, states and auto-yield

use std::rc::Rc;

use ferrous_script::{
    CallbackFunction, CoroutineState, OpCode, Processor, ProtoBuilder, RuntimeErrorKind,
    ScriptError, ScriptResult, Value,
};

fn install_yield(p: &Processor) {
    let yield_fn = Value::new_callback(CallbackFunction::new("yield", |_ctx, args| {
        Ok(Value::new_yield_request(args.into_vec()))
    }));
    p.globals().borrow_mut().set_str("yield", yield_fn);
}

fn compile(p: &mut Processor, f: ProtoBuilder) -> ScriptResult<Value> {
    let mut chunk = ProtoBuilder::chunk("co");
    chunk.begin_fn(0, false);
    chunk.closure(f.build());
    chunk.ret(1);
    let main = p.load(Rc::new(chunk.build()))?;
    p.call(&main, vec![])
}

/// function(a) local x = yield(a + 1) return x * 2 end
fn doubler() -> ProtoBuilder {
    let mut f = ProtoBuilder::function("body");
    let a = f.local("a");
    let x = f.local("x");
    let yield_fn = f.global("yield");
    f.begin_fn(1, false);
    f.load(&yield_fn);
    f.load(&a);
    f.push_number(1.0);
    f.op(OpCode::Add);
    f.call(1, Some("yield"));
    f.store(&x);
    f.load(&x);
    f.push_number(2.0);
    f.op(OpCode::Mul);
    f.ret(1);
    f
}

fn expect_coroutine_error(result: ScriptResult<Value>, message: &str) {
    match result {
        Err(ScriptError::Runtime(e)) => {
            assert_eq!(e.kind(), RuntimeErrorKind::Coroutine);
            assert!(e.message().contains(message), "unexpected message: {}", e.message());
        }
        other => panic!("expected a coroutine error, got {:?}", other.map(|v| v.to_string())),
    }
}

#[test]
fn test_values_flow_both_ways() -> ScriptResult<()> {
    let mut p = Processor::default();
    install_yield(&p);
    let body = compile(&mut p, doubler())?;
    let co = p.create_coroutine(body)?;
    assert_eq!(co.state(), CoroutineState::NotStarted);

    assert_eq!(co.resume(vec![Value::Number(10.0)])?, Value::Number(11.0));
    assert_eq!(co.state(), CoroutineState::Suspended);

    assert_eq!(co.resume(vec![Value::Number(5.0)])?, Value::Number(10.0));
    assert_eq!(co.state(), CoroutineState::Dead);

    expect_coroutine_error(co.resume(vec![]), "cannot resume dead coroutine");
    Ok(())
}

#[test]
fn test_yield_multiple_values_from_native_body() -> ScriptResult<()> {
    let p = Processor::default();
    install_yield(&p);
    let yield_fn = p.globals().borrow().get_str("yield");
    let co = p.create_coroutine(yield_fn)?;
    let first = co.resume(vec![Value::from("a"), Value::from("b")])?;
    assert_eq!(first.tuple_values(), vec![Value::from("a"), Value::from("b")]);
    // the resume arguments become the native's return value
    assert_eq!(co.resume(vec![Value::from("done")])?, Value::from("done"));
    assert_eq!(co.state(), CoroutineState::Dead);
    Ok(())
}

#[test]
fn test_non_callable_body_is_rejected() {
    let p = Processor::default();
    let err = p.create_coroutine(Value::Number(1.0)).unwrap_err();
    assert!(err.to_string().contains("bad argument #1 to 'create'"));
}

#[test]
fn test_yield_outside_coroutine() -> ScriptResult<()> {
    let mut p = Processor::default();
    install_yield(&p);
    let yield_fn = p.globals().borrow().get_str("yield");
    expect_coroutine_error(
        p.call(&yield_fn, vec![Value::Nil]),
        "attempt to yield from outside a coroutine",
    );
    Ok(())
}

#[test]
fn test_running_coroutine_cannot_be_resumed() -> ScriptResult<()> {
    let p = Processor::default();
    let probe = Value::new_callback(CallbackFunction::new("probe", |ctx, _args| {
        let me = ctx
            .current_coroutine()
            .ok_or_else(|| ScriptError::runtime("no current coroutine"))?;
        assert_eq!(me.state(), CoroutineState::Running);
        assert!(ctx.is_yieldable());
        match me.resume(vec![]) {
            Err(e) => Ok(Value::from(e.to_string())),
            Ok(_) => Ok(Value::from("resumed")),
        }
    }));
    let co = p.create_coroutine(probe)?;
    let message = co.resume(vec![])?;
    assert_eq!(message, Value::from("cannot resume non-suspended coroutine"));
    assert!(p.current_coroutine().is_none());
    assert!(!p.is_yieldable());
    Ok(())
}

#[test]
fn test_error_inside_body_kills_coroutine() -> ScriptResult<()> {
    let p = Processor::default();
    let fail = Value::new_callback(CallbackFunction::new("fail", |_ctx, _args| {
        Err(ScriptError::runtime("boom"))
    }));
    let co = p.create_coroutine(fail)?;
    let err = co.resume(vec![]).unwrap_err();
    assert!(err.to_string().contains("boom"));
    assert_eq!(co.state(), CoroutineState::Dead);
    Ok(())
}

/// local i, s = 0, 0; while i < 1000 do s = s + i; i = i + 1 end; return s
fn summing_loop() -> ProtoBuilder {
    let mut f = ProtoBuilder::function("sum");
    let i = f.local("i");
    let s = f.local("s");
    f.begin_fn(0, false);
    f.push_number(0.0);
    f.store(&i);
    f.push_number(0.0);
    f.store(&s);
    let top = f.here();
    f.load(&i);
    f.push_number(1000.0);
    f.op(OpCode::Less);
    let exit = f.jump(OpCode::Jf);
    f.load(&s);
    f.load(&i);
    f.op(OpCode::Add);
    f.store(&s);
    f.load(&i);
    f.push_number(1.0);
    f.op(OpCode::Add);
    f.store(&i);
    f.jump_to(OpCode::Jump, top);
    f.patch(exit);
    f.load(&s);
    f.ret(1);
    f
}

#[test]
fn test_auto_yield_slices_long_loops() -> ScriptResult<()> {
    let mut p = Processor::default();
    let body = compile(&mut p, summing_loop())?;
    let co = p.create_coroutine(body)?;
    co.set_auto_yield(100);

    let mut slices = 0;
    let result = loop {
        let value = co.resume(vec![])?;
        slices += 1;
        match co.state() {
            CoroutineState::ForceSuspended => assert!(value.is_void()),
            CoroutineState::Dead => break value,
            other => panic!("unexpected state {}", other),
        }
    };
    assert_eq!(result, Value::Number(499_500.0));
    assert!(slices > 10, "only {} slices", slices);
    Ok(())
}

#[test]
fn test_force_suspended_rejects_resume_values() -> ScriptResult<()> {
    let mut p = Processor::default();
    let body = compile(&mut p, summing_loop())?;
    let co = p.create_coroutine(body)?;
    co.set_auto_yield(10);
    co.resume(vec![])?;
    assert_eq!(co.state(), CoroutineState::ForceSuspended);
    expect_coroutine_error(co.resume(vec![Value::Nil]), "auto-yield");
    // still resumable without values
    assert_eq!(co.state(), CoroutineState::ForceSuspended);
    co.set_auto_yield(0);
    assert_eq!(co.resume(vec![])?, Value::Number(499_500.0));
    Ok(())
}
