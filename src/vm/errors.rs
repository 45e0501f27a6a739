//! Error decoration and execution-stack unwinding

use super::{EntryMark, FrameFlags, FrameFunction, FrameHandlers, Processor, Step};
use crate::config::LogLevel;
use crate::error::{RuntimeError, ScriptError, ScriptResult, StackFrameInfo};
use crate::value::Value;

impl Processor {
    /// Unwind the frames above `mark` after `err` was raised at `ip` in the
    /// top frame.
    ///
    /// The first frame carrying an error handler receives the message and
    /// execution continues with its result. Without one, every frame down to
    /// and including the entry frame is popped and the error is returned.
    /// Non-runtime errors are never caught.
    pub(crate) fn unwind(&mut self, err: ScriptError, ip: usize, mark: EntryMark) -> ScriptResult<Step> {
        let mut error = match err {
            ScriptError::Runtime(e) => e,
            other => {
                self.abandon(mark);
                return Err(other);
            }
        };

        if !error.is_decorated() {
            self.decorate(&mut error, ip);
        }
        if !error.unwind_decorated {
            // outer loops run the decorators of their own frames unless a
            // handler in this one catches the error
            error.unwind_decorated = self.run_unwind_decorators(&mut error, mark);
        }

        while self.frames.len() > mark.frames {
            let mut frame = self.pop_frame()?;
            if let Some(handler) = frame.handlers.error_handler.take() {
                vm_log!(self.shared.options, LogLevel::Verbose, "VM", "error caught by '{}': {}", handler.name(), error.display_message());
                let resume_ip = frame.return_address.saturating_sub(1);
                let message = Value::new_string(error.display_message());
                let handled = self
                    .invoke_callback(&handler, vec![message], false)
                    .and_then(|value| {
                        let frame = super::CallStackItem {
                            handlers: FrameHandlers::default(),
                            ..frame
                        };
                        self.finish_frame(frame, value, true)
                    });
                return match handled {
                    Ok(step) => Ok(step),
                    Err(e) => self.unwind(e, resume_ip, mark),
                };
            }
            if frame.flags.contains(FrameFlags::CALL_ENTRY_POINT) {
                break;
            }
        }

        self.stack.truncate(mark.stack);
        vm_log!(self.shared.options, LogLevel::Verbose, "VM", "error unwound to host: {}", error.display_message());
        Err(ScriptError::Runtime(error))
    }

    /// Drop everything above `mark` without running handlers
    pub(crate) fn abandon(&mut self, mark: EntryMark) {
        while self.frames.len() > mark.frames {
            if self.pop_frame().is_err() {
                break;
            }
        }
        self.stack.truncate(mark.stack);
    }

    /// Instruction pointer of every frame, bottom first; the top frame is at
    /// `ip`, the others at the call that created the frame above them
    fn frame_ips(&self, ip: usize) -> Vec<usize> {
        let mut ips = vec![0; self.frames.len()];
        if let Some(last) = ips.last_mut() {
            *last = ip;
        }
        for i in (0..self.frames.len().saturating_sub(1)).rev() {
            ips[i] = self.frames[i + 1].return_address.saturating_sub(1);
        }
        ips
    }

    fn location_of(&self, frame: usize, ip: usize) -> Option<String> {
        let closure = self.frames.get(frame)?.closure()?;
        let source_ref = closure.proto().source_ref(ip)?;
        let name = self.source_name(source_ref.source_id);
        Some(source_ref.format_location(&name, self.shared.options.legacy_error_locations))
    }

    /// Attach the location of the innermost script frame and a call-stack
    /// snapshot
    fn decorate(&self, error: &mut RuntimeError, ip: usize) {
        let ips = self.frame_ips(ip);
        let script_frame = (0..self.frames.len())
            .rev()
            .find(|&i| !self.frames[i].is_native());
        let (location, error_ip) = match script_frame {
            Some(i) => (self.location_of(i, ips[i]), ips[i]),
            None => (None, ip),
        };
        let decorated = location.map(|loc| format!("{}: {}", loc, error.message()));
        error.set_decoration(decorated, error_ip, self.call_stack_snapshot(&ips));
    }

    fn call_stack_snapshot(&self, ips: &[usize]) -> Vec<StackFrameInfo> {
        self.frames
            .iter()
            .enumerate()
            .rev()
            .map(|(i, frame)| StackFrameInfo {
                function_name: Some(frame.display_name()),
                location: match frame.function {
                    FrameFunction::Script(_) => self.location_of(i, ips[i]),
                    FrameFunction::Native(_) => None,
                },
                is_native: frame.is_native(),
            })
            .collect()
    }

    /// Offer the message to pre-unwind decorators from the top frame down to
    /// the first frame that will catch the error. Returns whether such a
    /// frame exists above `mark`.
    fn run_unwind_decorators(&mut self, error: &mut RuntimeError, mark: EntryMark) -> bool {
        let mut decorators = Vec::new();
        let mut caught = false;
        for frame in self.frames[mark.frames.min(self.frames.len())..].iter().rev() {
            if let Some(decorator) = &frame.handlers.error_handler_before_unwind {
                decorators.push(decorator.clone());
            }
            if frame.handlers.error_handler.is_some() {
                caught = true;
                break;
            }
            if frame.flags.contains(FrameFlags::CALL_ENTRY_POINT) {
                break;
            }
        }
        for decorator in decorators {
            let message = Value::new_string(error.display_message());
            match self.call_nested(decorator, vec![message]) {
                Ok(result) => {
                    let text = match result.cast_to_string() {
                        Some(s) => s.to_string(),
                        None => result.to_scalar().to_string(),
                    };
                    error.set_decorated_message(text);
                }
                Err(e) => {
                    vm_log!(self.shared.options, LogLevel::Notice, "VM", "error decorator failed: {}", e);
                }
            }
        }
        caught
    }
}
