//! Call protocol: frame push/pop, native invocation, result delivery and the
//! tail-call, yield and await requests natives may return

use std::rc::Rc;

use super::{
    CallStackItem, EntryMark, ExecutionContext, FrameFlags, FrameFunction, FrameHandlers,
    Processor, Resumption, Step, Suspension,
};
use crate::config::LogLevel;
use crate::error::{RuntimeError, RuntimeErrorKind, ScriptError, ScriptResult};
use crate::value::{
    AwaitRequest, CallbackArguments, CallbackFunction, TailCallData, Value, YieldRequest,
};

impl Processor {
    /// Push `function` and `args` and run the call to completion or
    /// suspension, unwinding errors back to this entry.
    pub(crate) fn execute_call(
        &mut self,
        function: Value,
        args: Vec<Value>,
        flags: FrameFlags,
    ) -> ScriptResult<Step> {
        let mark = self.mark();
        let argc = args.len();
        self.stack.push(function);
        self.stack.extend(args);
        let first = self.perform_call(
            argc,
            0,
            flags | FrameFlags::CALL_ENTRY_POINT,
            FrameHandlers::default(),
            None,
        );
        self.run_from(first, mark, 0)
    }

    /// Continue after the first step of an entry; errors raised before the
    /// dispatch loop takes over are attributed to `error_ip`
    pub(crate) fn run_from(
        &mut self,
        first: ScriptResult<Step>,
        mark: EntryMark,
        error_ip: usize,
    ) -> ScriptResult<Step> {
        let step = match first {
            Ok(step) => step,
            Err(e) => self.unwind(e, error_ip, mark)?,
        };
        match step {
            Step::Continue(ip) => self.processing_loop(ip, mark),
            other => Ok(other),
        }
    }

    /// Call the value sitting `argc` slots below the top with the `argc`
    /// values above it.
    ///
    /// Script functions get a frame and `Continue(0)`; natives run right away
    /// and their result is delivered before returning.
    pub(crate) fn perform_call(
        &mut self,
        argc: usize,
        return_address: usize,
        flags: FrameFlags,
        handlers: FrameHandlers,
        name: Option<Rc<str>>,
    ) -> ScriptResult<Step> {
        let mut argc = argc;
        let mut meta_depth = 0;
        loop {
            let function = self.stack.peek(argc)?;
            match function {
                Value::Function(closure) => {
                    if self.frames.len() >= self.shared.options.max_call_depth {
                        return Err(RuntimeError::stack_overflow().into());
                    }
                    self.frames.push(CallStackItem {
                        base_pointer: self.stack.len() - argc,
                        argc,
                        return_address,
                        function: FrameFunction::Script(closure),
                        name,
                        open_upvalues: Vec::new(),
                        handlers,
                        flags,
                    });
                    return Ok(Step::Continue(0));
                }
                Value::NativeFunction(callback) => {
                    let args = self.stack.split_off(self.stack.len() - argc)?;
                    self.stack.pop()?;
                    self.frames.push(CallStackItem {
                        base_pointer: self.stack.len(),
                        argc,
                        return_address,
                        function: FrameFunction::Native(callback.clone()),
                        name,
                        open_upvalues: Vec::new(),
                        handlers,
                        flags,
                    });
                    // on error the frame stays for the unwinder
                    let result = self.invoke_callback(
                        &callback,
                        args,
                        flags.contains(FrameFlags::METHOD_CALL),
                    )?;
                    let frame = self.pop_frame()?;
                    return self.finish_frame(frame, result, true);
                }
                other => {
                    if meta_depth >= self.shared.options.max_call_metamethod_depth {
                        return Err(RuntimeError::new(
                            RuntimeErrorKind::Call,
                            "'__call' chain too long; possible loop",
                        )
                        .into());
                    }
                    let handler = self
                        .unary_metamethod(&other, "__call")
                        .ok_or_else(|| RuntimeError::call_on(&other, name.as_deref()))?;
                    // the callable object becomes the first argument
                    let operands = self.stack.split_off(self.stack.len() - argc - 1)?;
                    self.stack.push(handler);
                    self.stack.extend(operands);
                    argc += 1;
                    meta_depth += 1;
                }
            }
        }
    }

    pub(crate) fn invoke_callback(
        &mut self,
        callback: &Rc<CallbackFunction>,
        args: Vec<Value>,
        is_method_call: bool,
    ) -> ScriptResult<Value> {
        let mut ctx = ExecutionContext::new(self, callback.clone());
        callback.invoke(&mut ctx, CallbackArguments::new(args, is_method_call))
    }

    /// Pop the top frame, closing its upvalues and dropping its slots
    pub(crate) fn pop_frame(&mut self) -> ScriptResult<CallStackItem> {
        let mut frame = self
            .frames
            .pop()
            .ok_or_else(|| ScriptError::internal("execution stack underflow"))?;
        if frame.is_native() {
            self.stack.truncate(frame.base_pointer);
        } else {
            frame.close_upvalues(frame.base_pointer);
            self.stack.truncate(frame.base_pointer.saturating_sub(1));
        }
        Ok(frame)
    }

    /// Hand the result of a popped frame to its caller.
    ///
    /// Results coming from natives may be requests, which are acted on here.
    pub(crate) fn finish_frame(
        &mut self,
        frame: CallStackItem,
        result: Value,
        from_native: bool,
    ) -> ScriptResult<Step> {
        if from_native {
            match &result {
                Value::TailCallRequest(data) => return self.perform_tail_request(frame, data.clone()),
                Value::YieldRequest(request) => return self.suspend_for_yield(frame, request),
                Value::AwaitRequest(request) => return self.handle_await(frame, request),
                _ => {}
            }
        }

        if let Some(continuation) = frame.handlers.continuation.clone() {
            let value = self.invoke_callback(&continuation, result.tuple_values(), false)?;
            let frame = CallStackItem {
                handlers: FrameHandlers::default(),
                ..frame
            };
            return self.finish_frame(frame, value, true);
        }

        self.deliver(frame.flags, frame.return_address, result)
    }

    fn deliver(&mut self, flags: FrameFlags, return_address: usize, result: Value) -> ScriptResult<Step> {
        let result = if flags.contains(FrameFlags::SCALAR_RESULT) {
            result.to_scalar()
        } else {
            result
        };
        if flags.contains(FrameFlags::CALL_ENTRY_POINT) {
            return Ok(Step::Return(result));
        }
        if !flags.contains(FrameFlags::DISCARD_RESULT) {
            self.stack.push(result);
        }
        Ok(Step::Continue(return_address))
    }

    /// Replace a finished native frame with the call it requested
    fn perform_tail_request(&mut self, frame: CallStackItem, data: Rc<TailCallData>) -> ScriptResult<Step> {
        let mut handlers = FrameHandlers {
            continuation: data.continuation.clone(),
            error_handler: data.error_handler.clone(),
            error_handler_before_unwind: data.error_handler_before_unwind.clone(),
        };
        if !frame.handlers.is_empty() {
            if !handlers.is_empty() {
                return Err(ScriptError::internal(
                    "tail call request with handlers returned from a frame that already has handlers",
                ));
            }
            handlers = frame.handlers.clone();
        }

        let flags = frame.flags.intersect(FrameFlags::INHERITED);
        let error_handler = handlers.error_handler.clone();
        let depth = self.frames.len();
        let height = self.stack.len();

        self.stack.push(data.function.clone());
        self.stack.extend(data.args.iter().cloned());
        let result = self.perform_call(
            data.args.len(),
            frame.return_address,
            flags,
            handlers,
            frame.name.clone(),
        );

        match (result, error_handler) {
            // the call failed before any frame existed to catch it
            (Err(e), Some(handler)) if e.is_catchable() && self.frames.len() == depth => {
                self.stack.truncate(height);
                let message = match e.as_runtime() {
                    Some(runtime) => Value::new_string(runtime.display_message()),
                    None => Value::Nil,
                };
                let value = self.invoke_callback(&handler, vec![message], false)?;
                let frame = CallStackItem {
                    handlers: FrameHandlers::default(),
                    flags,
                    ..frame
                };
                self.finish_frame(frame, value, true)
            }
            (result, _) => result,
        }
    }

    fn suspend_for_yield(&mut self, frame: CallStackItem, request: &YieldRequest) -> ScriptResult<Step> {
        if self.coroutine.is_none() {
            return Err(RuntimeError::coroutine("attempt to yield from outside a coroutine").into());
        }
        if self.nested_calls > 0 {
            return Err(
                RuntimeError::coroutine("attempt to yield across a native call boundary").into(),
            );
        }
        let values = Value::new_tuple(request.values().to_vec());
        self.pending = Some((Resumption::Deliver(frame), EntryMark::default()));
        Ok(Step::Suspend(Suspension::Yield(values)))
    }

    fn handle_await(&mut self, frame: CallStackItem, request: &AwaitRequest) -> ScriptResult<Step> {
        let task = request.take_task()?;
        if self.async_mode && self.nested_calls == 0 {
            self.pending = Some((Resumption::Deliver(frame), EntryMark::default()));
            return Ok(Step::Suspend(Suspension::Await(task)));
        }
        if self.shared.options.auto_await {
            vm_log!(self.shared.options, LogLevel::Debug, "VM", "blocking on host task in synchronous call");
            let value = futures::executor::block_on(task)?;
            return self.finish_frame(frame, value, true);
        }
        Err(ScriptError::runtime(
            "attempt to await a host task from a synchronous call (use call_async or enable auto_await)",
        ))
    }

    /// Pick up a suspended execution.
    ///
    /// `input` is the resume value (yield) or the task result (await);
    /// task results may themselves be requests, resume values are data.
    pub(crate) fn resume_pending(&mut self, input: ScriptResult<Value>, from_task: bool) -> ScriptResult<Step> {
        let (resumption, mark) = self
            .pending
            .take()
            .ok_or_else(|| ScriptError::internal("no suspended execution to resume"))?;
        self.since_resume = 0;
        match resumption {
            Resumption::Instruction(ip) => self.processing_loop(ip, mark),
            Resumption::Deliver(frame) => {
                let error_ip = frame.return_address.saturating_sub(1);
                let first = match input {
                    Ok(value) => self.finish_frame(frame, value, from_task),
                    Err(e) => Err(e),
                };
                self.run_from(first, mark, error_ip)
            }
        }
    }
}
