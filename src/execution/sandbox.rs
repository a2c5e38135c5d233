//! One snippet, one QuickJS runtime.
//!
//! [`Sandbox::execute`] is blocking and runs on a worker thread. It drives
//! the snippet's promise and its timers itself, reports the first settled
//! result through a oneshot channel, then keeps running leftover timers
//! until none remain or the deadline passes. The runtime is dropped on
//! return, taking every scheduled callback with it.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use rquickjs::{
    context::EvalOptions, promise::PromiseState, Context, Ctx, Error, Function, Object, Promise,
    Runtime, Value,
};
use tokio::sync::oneshot;
use tracing::trace;

use super::{
    context::{call_host, ExecutionContext},
    normalize::{describe_thrown, normalize, SerializationFailure},
    output::OutputCollector,
};

const PRELUDE: &str = include_str!("prelude.js");

/// Wall-clock limit shared by the coordinator and the worker thread.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    abandoned: Arc<AtomicBool>,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self { at: Instant::now() + timeout, abandoned: Arc::new(AtomicBool::new(false)) }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Stops the worker at its next interrupt check, even before `at`.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }

    pub fn is_over(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst) || Instant::now() >= self.at
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    Value(Result<Option<serde_json::Value>, SerializationFailure>),
    Thrown(String),
    /// The deadline passed while the snippet was still running.
    Interrupted,
    /// The snippet's promise is pending with no job or timer left to settle it.
    Stalled,
    /// The engine could not run the snippet at all.
    Unavailable(String),
}

#[derive(Debug, Clone, Copy)]
pub struct Sandbox {
    memory_limit: usize,
    max_stack_size: usize,
}

impl Sandbox {
    pub fn new(memory_limit: usize, max_stack_size: usize) -> Self {
        Self { memory_limit, max_stack_size }
    }

    pub fn execute(
        &self,
        source: &str,
        context: &ExecutionContext,
        deadline: &Deadline,
        output: OutputCollector,
        settled: oneshot::Sender<RawResult>,
    ) {
        let mut settled = Some(settled);
        if let Err(message) = self.run(source, context, deadline, output, &mut settled) {
            let raw = if deadline.is_over() {
                RawResult::Interrupted
            } else {
                RawResult::Unavailable(message)
            };
            deliver(&mut settled, raw);
        }
    }

    fn run(
        &self,
        source: &str,
        context: &ExecutionContext,
        deadline: &Deadline,
        output: OutputCollector,
        settled: &mut Option<oneshot::Sender<RawResult>>,
    ) -> Result<(), String> {
        let installed = context.install().map_err(|e| format!("context manifest: {e}"))?;
        let runtime = Runtime::new().map_err(|e| e.to_string())?;
        runtime.set_memory_limit(self.memory_limit);
        runtime.set_max_stack_size(self.max_stack_size);

        let tripped = Rc::new(Cell::new(false));
        let crash: Rc<RefCell<Option<String>>> = Rc::default();
        {
            let deadline = deadline.clone();
            let tripped = Rc::clone(&tripped);
            let crash = Rc::clone(&crash);
            runtime.set_interrupt_handler(Some(Box::new(move || {
                let stop = deadline.is_over() || crash.borrow().is_some();
                if stop {
                    tripped.set(true);
                }
                stop
            })));
        }

        let js = Context::full(&runtime).map_err(|e| e.to_string())?;
        js.with(|ctx| {
            let write = {
                let output = output.clone();
                Function::new(ctx.clone(), move |line: String| {
                    output.write(line);
                })
            }
            .map_err(|e| e.to_string())?;

            let host_call = {
                let functions = installed.functions;
                let crash = Rc::clone(&crash);
                Function::new(ctx.clone(), move |id: u32, args: String| -> String {
                    let call = AssertUnwindSafe(|| call_host(&functions, id as usize, &args));
                    match panic::catch_unwind(call) {
                        Ok(reply) => reply,
                        Err(payload) => {
                            *crash.borrow_mut() = Some(panic_message(payload.as_ref()));
                            r#"{"error":"host function panicked"}"#.to_string()
                        }
                    }
                })
            }
            .map_err(|e| e.to_string())?;

            let prelude: Function = ctx.eval(PRELUDE).map_err(|e| engine_error(&ctx, e))?;
            let helpers: Object = prelude
                .call((write, host_call, installed.manifest))
                .map_err(|e| engine_error(&ctx, e))?;
            let event_loop = EventLoop {
                ctx: &ctx,
                next_delay: helpers.get("nextDelay").map_err(|e| engine_error(&ctx, e))?,
                run_due: helpers.get("runDue").map_err(|e| engine_error(&ctx, e))?,
                deadline,
                output: &output,
                tripped: &tripped,
                crash: &crash,
            };
            event_loop.run(source, settled)
        })
    }
}

struct EventLoop<'a, 'js> {
    ctx: &'a Ctx<'js>,
    next_delay: Function<'js>,
    run_due: Function<'js>,
    deadline: &'a Deadline,
    output: &'a OutputCollector,
    tripped: &'a Cell<bool>,
    crash: &'a RefCell<Option<String>>,
}

impl<'js> EventLoop<'_, 'js> {
    fn run(&self, source: &str, settled: &mut Option<oneshot::Sender<RawResult>>) -> Result<(), String> {
        let wrapped = format!("(async function () {{\n{source}\n}})()");
        let mut options = EvalOptions::default();
        options.strict = false;
        options.backtrace_barrier = true;
        let promise: Promise = match self.ctx.eval_with_options(wrapped, options) {
            Ok(promise) => promise,
            Err(Error::Exception) => {
                let thrown = self.ctx.catch();
                deliver(settled, self.failure(&thrown));
                return Ok(());
            }
            Err(e) => return Err(e.to_string()),
        };

        loop {
            while !self.deadline.is_over() && self.ctx.execute_pending_job() {}

            if let Some(message) = self.crash.borrow_mut().take() {
                deliver(settled, RawResult::Unavailable(message));
                return Ok(());
            }
            if self.tripped.get() || self.deadline.is_over() {
                deliver(settled, RawResult::Interrupted);
                return Ok(());
            }
            if settled.is_some() {
                if let Some(raw) = self.settle(&promise) {
                    trace!("snippet settled");
                    deliver(settled, raw);
                }
            }

            let delay = match self.next_delay.call::<_, f64>(()) {
                Ok(delay) => delay,
                Err(_) if self.tripped.get() => {
                    deliver(settled, RawResult::Interrupted);
                    return Ok(());
                }
                Err(e) => return Err(engine_error(self.ctx, e)),
            };
            if delay < 0.0 {
                deliver(settled, RawResult::Stalled);
                return Ok(());
            }
            let wait = Duration::try_from_secs_f64(delay / 1000.0)
                .unwrap_or(Duration::MAX)
                .min(self.deadline.remaining());
            if !wait.is_zero() {
                trace!(wait_ms = wait.as_millis() as u64, "waiting for timer");
                thread::sleep(wait);
                continue;
            }
            match self.run_due.call::<_, ()>(()) {
                Ok(()) => {}
                Err(Error::Exception) => {
                    let thrown = self.ctx.catch();
                    if !self.tripped.get() {
                        let text = describe_thrown(&thrown);
                        // Non-Error values already read "Uncaught ...".
                        let line = if thrown.is_error() { format!("Uncaught {text}") } else { text };
                        self.output.write(line);
                    }
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    fn settle(&self, promise: &Promise<'js>) -> Option<RawResult> {
        match promise.state() {
            PromiseState::Pending => None,
            PromiseState::Resolved => Some(match promise.result::<Value>() {
                Some(Ok(value)) => {
                    let normalized = normalize(self.ctx, value);
                    // A getter or toJSON may have run into the deadline.
                    if let Some(message) = self.crash.borrow_mut().take() {
                        RawResult::Unavailable(message)
                    } else if self.tripped.get() {
                        RawResult::Interrupted
                    } else {
                        RawResult::Value(normalized)
                    }
                }
                Some(Err(e)) => RawResult::Unavailable(e.to_string()),
                None => return None,
            }),
            PromiseState::Rejected => {
                let _ = promise.result::<Value>();
                let thrown = self.ctx.catch();
                Some(self.failure(&thrown))
            }
        }
    }

    fn failure(&self, thrown: &Value<'js>) -> RawResult {
        if let Some(message) = self.crash.borrow_mut().take() {
            RawResult::Unavailable(message)
        } else if self.tripped.get() {
            RawResult::Interrupted
        } else {
            RawResult::Thrown(describe_thrown(thrown))
        }
    }
}

/// Sends `raw` unless a result was already delivered.
fn deliver(settled: &mut Option<oneshot::Sender<RawResult>>, raw: RawResult) {
    if let Some(tx) = settled.take() {
        let _ = tx.send(raw);
    }
}

fn engine_error(ctx: &Ctx<'_>, e: Error) -> String {
    match e {
        Error::Exception => describe_thrown(&ctx.catch()),
        other => other.to_string(),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::output;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn execute(source: &str, deadline: &Deadline) -> (RawResult, Option<String>) {
        let (collector, captured) = output::channel();
        let (tx, mut rx) = oneshot::channel();
        Sandbox::new(64 << 20, 512 << 10).execute(source, &ExecutionContext::new(), deadline, collector, tx);
        (rx.try_recv().unwrap(), captured.finish())
    }

    #[test]
    fn expired_deadline_is_an_interrupt() {
        for _ in 0..5 {
            let (raw, _) = execute("return 1;", &Deadline::after(Duration::ZERO));
            assert_eq!(raw, RawResult::Interrupted);
        }
    }

    #[test]
    fn looping_getter_is_an_interrupt_not_a_serialization_failure() {
        let deadline = Deadline::after(Duration::from_millis(100));
        let (raw, _) = execute("return { get x() { while (true) {} } };", &deadline);
        assert_eq!(raw, RawResult::Interrupted);
    }

    #[test]
    fn oversized_timer_delays_fire_after_a_millisecond() {
        for delay in ["1e300", "Infinity", "-5", "NaN", "2 ** 31"] {
            let source = format!("await new Promise((r) => setTimeout(r, {delay})); return 1;");
            let (raw, _) = execute(&source, &Deadline::after(Duration::from_millis(500)));
            assert_eq!(raw, RawResult::Value(Ok(Some(json!(1)))), "{delay}");
        }
    }

    #[test]
    fn throwing_callbacks_are_reported_alike() {
        let source = "
            queueMicrotask(() => { throw new Error('mt'); });
            setTimeout(() => { throw 'tt'; }, 1);
            await new Promise((r) => setTimeout(r, 10));
            return 1;";
        let (raw, output) = execute(source, &Deadline::after(Duration::from_millis(500)));
        assert_eq!(raw, RawResult::Value(Ok(Some(json!(1)))));
        assert_eq!(output.as_deref(), Some("Uncaught Error: mt\nUncaught tt"));
    }
}
