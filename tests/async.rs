//! Host tasks awaited by natives: async calls, auto-await and timeouts

use std::rc::Rc;
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::{Builder, Runtime};

use ferrous_script::{
    CallbackFunction, CoroutineState, OpCode, Processor, ProtoBuilder, ScriptError,
    ScriptOptions, ScriptResult, TailCallData, Value,
};

fn runtime() -> Runtime {
    Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build tokio runtime")
}

/// `sleep(ms)` resolves to "slept" after a tokio timer
fn install_sleep(p: &Processor) {
    let sleep = Value::new_callback(CallbackFunction::new("sleep", |_ctx, args| {
        let ms = args.get(0).as_number().unwrap_or(0.0) as u64;
        let task = async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(Value::from("slept"))
        };
        Ok(Value::new_await_request(task.boxed_local()))
    }));
    p.globals().borrow_mut().set_str("sleep", sleep);
}

/// `ready(v)` resolves immediately with `v`
fn install_ready(p: &Processor) {
    let ready = Value::new_callback(CallbackFunction::new("ready", |_ctx, args| {
        Ok(Value::new_await_request(futures::future::ready(Ok(args.get(0))).boxed_local()))
    }));
    p.globals().borrow_mut().set_str("ready", ready);
}

/// function() return <callee>(1) .. " ok" end
fn awaiting_chunk(callee: &str) -> ProtoBuilder {
    let mut b = ProtoBuilder::chunk("main");
    let f = b.global(callee);
    b.begin_fn(0, false);
    b.load(&f);
    b.push_number(1.0);
    b.call(1, Some(callee));
    b.push_string(" ok");
    b.op(OpCode::Concat);
    b.ret(1);
    b
}

#[test]
fn test_call_async_awaits_host_task() -> ScriptResult<()> {
    let mut p = Processor::default();
    install_sleep(&p);
    let main = p.load(Rc::new(awaiting_chunk("sleep").build()))?;
    let result = runtime().block_on(p.call_async(&main, vec![]))?;
    assert_eq!(result, Value::from("slept ok"));
    assert_eq!(p.call_depth(), 0);
    Ok(())
}

#[test]
fn test_sync_call_rejects_await_without_auto_await() -> ScriptResult<()> {
    let mut p = Processor::default();
    install_ready(&p);
    let main = p.load(Rc::new(awaiting_chunk("ready").build()))?;
    let err = p.call(&main, vec![]).unwrap_err();
    assert!(err.to_string().contains("await"), "got {}", err);
    assert_eq!(p.call_depth(), 0);
    Ok(())
}

#[test]
fn test_auto_await_blocks_in_sync_call() -> ScriptResult<()> {
    let options = ScriptOptions {
        auto_await: true,
        ..ScriptOptions::default()
    };
    let mut p = Processor::new(options);
    install_ready(&p);
    let main = p.load(Rc::new(awaiting_chunk("ready").build()))?;
    assert_eq!(p.call(&main, vec![])?, Value::from("1 ok"));
    Ok(())
}

#[test]
fn test_failed_task_is_caught_by_script_handler() -> ScriptResult<()> {
    let mut p = Processor::default();
    let broken = Value::new_callback(CallbackFunction::new("broken", |_ctx, _args| {
        let task = async { Err::<Value, _>(ScriptError::runtime("io failed")) };
        Ok(Value::new_await_request(task.boxed_local()))
    }));
    p.globals().borrow_mut().set_str("broken", broken);

    // wrapper() return broken() end
    let mut wrapper = ProtoBuilder::function("wrapper");
    let callee = wrapper.global("broken");
    wrapper.begin_fn(0, false);
    wrapper.load(&callee);
    wrapper.call(0, Some("broken"));
    wrapper.ret(1);
    let mut chunk = ProtoBuilder::chunk("main");
    chunk.begin_fn(0, false);
    chunk.closure(wrapper.build());
    chunk.ret(1);
    let main = p.load(Rc::new(chunk.build()))?;
    let wrapper = p.call(&main, vec![])?;

    let pcall = Value::new_callback(CallbackFunction::new("pcall", |_ctx, args| {
        let data = TailCallData::new(args.get(0), vec![]).with_error_handler(CallbackFunction::new(
            "handler",
            |_ctx, args| Ok(Value::from(format!("caught: {}", args.get(0)))),
        ));
        Ok(Value::new_tail_call_request(data))
    }));
    let result = runtime().block_on(p.call_async(&pcall, vec![wrapper]))?;
    assert_eq!(result, Value::from("caught: io failed"));
    Ok(())
}

#[test]
fn test_timeout_abandons_call() -> ScriptResult<()> {
    let mut p = Processor::default();
    install_sleep(&p);
    let main = p.load(Rc::new(awaiting_chunk("sleep").build()))?;
    let slow = {
        let mut b = ProtoBuilder::chunk("slow");
        let f = b.global("sleep");
        b.begin_fn(0, false);
        b.load(&f);
        b.push_number(10_000.0);
        b.call(1, Some("sleep"));
        b.ret(1);
        p.load(Rc::new(b.build()))?
    };

    let rt = runtime();
    let err = rt
        .block_on(p.call_async_with_timeout(&slow, vec![], Duration::from_millis(20)))
        .unwrap_err();
    assert!(err.to_string().contains("timed out"), "got {}", err);
    assert_eq!(p.call_depth(), 0);

    // the processor is clean for the next call
    let result = rt.block_on(p.call_async(&main, vec![]))?;
    assert_eq!(result, Value::from("slept ok"));
    Ok(())
}

#[test]
fn test_coroutine_resume_async() -> ScriptResult<()> {
    let mut p = Processor::default();
    install_sleep(&p);
    let main = p.load(Rc::new(awaiting_chunk("sleep").build()))?;
    let co = p.create_coroutine(main)?;
    let result = runtime().block_on(co.resume_async(vec![]))?;
    assert_eq!(result, Value::from("slept ok"));
    assert_eq!(co.state(), CoroutineState::Dead);
    Ok(())
}
