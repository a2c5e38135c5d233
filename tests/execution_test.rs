use std::time::{Duration, Instant};

use coderun::execution::{
    Capability, Coordinator, ExecutionContext, ExecutionError, ExecutionLimits, OutcomeStatus,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn coordinator() -> Coordinator {
    Coordinator::new(ExecutionLimits::default())
}

fn math_context() -> ExecutionContext {
    let math = Capability::object([
        (
            "double",
            Capability::function(|args| {
                let n = args.first().and_then(Value::as_i64).ok_or("expected a number")?;
                Ok(json!(n * 2))
            }),
        ),
        ("fail", Capability::function(|_| Err("denied".to_string()))),
    ]);
    ExecutionContext::new().with_module("math", math).unwrap()
}

#[tokio::test]
async fn returns_normalized_value() {
    let outcome = coordinator().run("return 1+1;", ExecutionContext::new()).await;
    assert_eq!(outcome.return_value(), Some(&json!(2)));
    assert_eq!(outcome.return_value_text().as_deref(), Some("2"));
    assert_eq!(outcome.console_output(), None);
    assert_eq!(outcome.error(), None);
}

#[tokio::test]
async fn thrown_error_becomes_failure() {
    let outcome = coordinator().run("throw new Error('boom');", ExecutionContext::new()).await;
    assert_eq!(outcome.status(), OutcomeStatus::Failed);
    assert_eq!(outcome.error(), Some(&ExecutionError::Thrown("Error: boom".into())));
    assert_eq!(outcome.return_value(), None);
    assert_eq!(outcome.console_output(), None);
}

#[tokio::test]
async fn infinite_loop_times_out_on_time() {
    let started = Instant::now();
    let outcome = coordinator().run("while(true){}", ExecutionContext::new()).await;
    let elapsed = started.elapsed();
    assert_eq!(outcome.status(), OutcomeStatus::TimedOut);
    assert_eq!(outcome.error().map(ToString::to_string).as_deref(), Some("execution timed out"));
    assert!(elapsed >= Duration::from_millis(700), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "returned too late: {elapsed:?}");
}

#[tokio::test]
async fn console_lines_in_order() {
    let outcome = coordinator()
        .run("console.log('hi'); console.log('bye');", ExecutionContext::new())
        .await;
    assert_eq!(outcome.console_output(), Some("hi\nbye"));
    assert_eq!(outcome.return_value(), None);
    assert!(outcome.is_success());
}

#[tokio::test]
async fn cyclic_value_is_a_serialization_failure() {
    let outcome = coordinator()
        .run("const o = {}; o.self = o; return o;", ExecutionContext::new())
        .await;
    assert_eq!(outcome.status(), OutcomeStatus::Failed);
    assert_eq!(outcome.return_value(), None);
    let error = outcome.error().unwrap();
    assert_eq!(error.kind(), "serialization");
    assert_eq!(error.to_string(), "Could not stringify object.");
}

#[tokio::test]
async fn console_formats_values_like_a_browser() {
    let outcome = coordinator()
        .run(
            "console.log('n', 1, { a: [1, 2] }, null, undefined); console.error(new TypeError('t'));",
            ExecutionContext::new(),
        )
        .await;
    assert_eq!(outcome.console_output(), Some("n 1 {\"a\":[1,2]} null undefined\nTypeError: t"));
}

#[tokio::test]
async fn falsy_returns_are_values() {
    for (src, expected) in [("return 0;", json!(0)), ("return false;", json!(false)), ("return null;", json!(null))] {
        let outcome = coordinator().run(src, ExecutionContext::new()).await;
        assert_eq!(outcome.return_value(), Some(&expected), "{src}");
    }
}

#[tokio::test]
async fn object_keys_keep_insertion_order() {
    let outcome = coordinator().run("return { b: 1, a: 2 };", ExecutionContext::new()).await;
    let value = outcome.return_value().unwrap();
    assert_eq!(serde_json::to_string(value).unwrap(), r#"{"b":1,"a":2}"#);
}

#[tokio::test]
async fn functions_are_not_serializable() {
    let outcome = coordinator().run("return () => 1;", ExecutionContext::new()).await;
    assert_eq!(outcome.error().map(ExecutionError::kind), Some("serialization"));
}

#[tokio::test]
async fn awaits_timers_and_rejections() {
    let outcome = coordinator()
        .run(
            "await new Promise((resolve) => setTimeout(resolve, 20)); return 'done';",
            ExecutionContext::new(),
        )
        .await;
    assert_eq!(outcome.return_value(), Some(&json!("done")));

    let outcome = coordinator()
        .run("await Promise.reject(new TypeError('bad'));", ExecutionContext::new())
        .await;
    assert_eq!(outcome.error(), Some(&ExecutionError::Thrown("TypeError: bad".into())));
}

#[tokio::test]
async fn intervals_can_be_cleared() {
    let src = "
        let ticks = 0;
        await new Promise((resolve) => {
            const id = setInterval(() => {
                ticks += 1;
                if (ticks === 3) { clearInterval(id); resolve(); }
            }, 5);
        });
        return ticks;";
    let outcome = coordinator().run(src, ExecutionContext::new()).await;
    assert_eq!(outcome.return_value(), Some(&json!(3)));
}

#[tokio::test]
async fn non_error_throw_is_described() {
    let outcome = coordinator().run("throw 'oops';", ExecutionContext::new()).await;
    assert_eq!(outcome.error(), Some(&ExecutionError::Thrown("Uncaught oops".into())));
}

#[tokio::test]
async fn syntax_error_is_a_failure() {
    let outcome = coordinator().run("return (;", ExecutionContext::new()).await;
    let error = outcome.error().map(ToString::to_string).unwrap_or_default();
    assert!(error.starts_with("SyntaxError"), "{error}");
}

#[tokio::test]
async fn runaway_recursion_is_a_failure() {
    let outcome = coordinator()
        .run("function f(n) { return 1 + f(n + 1); } return f(0);", ExecutionContext::new())
        .await;
    assert_eq!(outcome.status(), OutcomeStatus::Failed);
    assert_eq!(outcome.error().map(ExecutionError::kind), Some("thrown"));
}

#[tokio::test]
async fn stalled_promise_times_out_early() {
    let coordinator = Coordinator::new(ExecutionLimits::default().with_timeout(Duration::from_secs(5)));
    let started = Instant::now();
    let outcome = coordinator.run("await new Promise(() => {});", ExecutionContext::new()).await;
    assert_eq!(outcome.status(), OutcomeStatus::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn partial_output_survives_timeout() {
    let outcome = coordinator()
        .run_with_timeout(
            "console.log('start'); while (true) {}",
            ExecutionContext::new(),
            Duration::from_millis(200),
        )
        .await;
    assert_eq!(outcome.status(), OutcomeStatus::TimedOut);
    assert_eq!(outcome.console_output(), Some("start"));
}

#[tokio::test]
async fn writes_after_settling_are_dropped() {
    let outcome = coordinator()
        .run(
            "setTimeout(() => console.log('late'), 10); console.log('early'); return 1;",
            ExecutionContext::new(),
        )
        .await;
    assert_eq!(outcome.console_output(), Some("early"));
    assert_eq!(outcome.return_value(), Some(&json!(1)));
}

#[tokio::test]
async fn concurrent_runs_keep_their_own_output() {
    let coordinator = coordinator();
    let (a, b) = tokio::join!(
        coordinator.run(
            "for (let i = 0; i < 3; i++) { console.log('a' + i); await null; } return 'a';",
            ExecutionContext::new(),
        ),
        coordinator.run(
            "for (let i = 0; i < 3; i++) { console.log('b' + i); await null; } return 'b';",
            ExecutionContext::new(),
        ),
    );
    assert_eq!(a.console_output(), Some("a0\na1\na2"));
    assert_eq!(b.console_output(), Some("b0\nb1\nb2"));
    assert_eq!(a.return_value(), Some(&json!("a")));
    assert_eq!(b.return_value(), Some(&json!("b")));
}

#[tokio::test]
async fn globals_do_not_leak_between_runs() {
    let coordinator = coordinator();
    coordinator.run("globalThis.leak = 1; var hoisted = 2;", ExecutionContext::new()).await;
    let outcome = coordinator
        .run("return [typeof leak, typeof hoisted];", ExecutionContext::new())
        .await;
    assert_eq!(outcome.return_value(), Some(&json!(["undefined", "undefined"])));
}

#[tokio::test]
async fn bindings_and_modules_are_reachable() {
    let ctx = math_context()
        .with_binding("invocation", Capability::value(json!({ "user": "dev" })))
        .unwrap();
    let outcome = coordinator()
        .run("return [invocation.user, require('math').double(21)];", ctx)
        .await;
    assert_eq!(outcome.return_value(), Some(&json!(["dev", 42])));
}

#[tokio::test]
async fn host_errors_are_thrown_into_the_snippet() {
    let outcome = coordinator()
        .run("try { require('math').fail(); } catch (e) { return e.message; }", math_context())
        .await;
    assert_eq!(outcome.return_value(), Some(&json!("denied")));

    let outcome = coordinator().run("require('nope');", math_context()).await;
    assert_eq!(
        outcome.error(),
        Some(&ExecutionError::Thrown("Error: Cannot find module 'nope'".into()))
    );
}

#[tokio::test]
async fn host_panic_is_contained() {
    let ctx = ExecutionContext::new()
        .with_binding("explode", Capability::function(|_| panic!("kaboom")))
        .unwrap();
    let outcome = coordinator().run("try { explode(); } catch (_) {} return 1;", ctx).await;
    assert_eq!(outcome.status(), OutcomeStatus::Failed);
    match outcome.error() {
        Some(ExecutionError::Crashed(message)) => assert!(message.contains("kaboom"), "{message}"),
        other => panic!("expected a crash, got {other:?}"),
    }
}

#[tokio::test]
async fn out_of_range_timer_delays_run_after_a_millisecond() {
    for delay in ["1e300", "Infinity"] {
        let src = format!("await new Promise((r) => setTimeout(r, {delay})); return 1;");
        let outcome = coordinator().run(&src, ExecutionContext::new()).await;
        assert_eq!(outcome.status(), OutcomeStatus::Completed, "{delay}");
        assert_eq!(outcome.return_value(), Some(&json!(1)), "{delay}");
    }
}

#[tokio::test]
async fn deadline_hit_while_stringifying_is_a_timeout() {
    let outcome = coordinator()
        .run_with_timeout(
            "return { get x() { while (true) {} } };",
            ExecutionContext::new(),
            Duration::from_millis(200),
        )
        .await;
    assert_eq!(outcome.status(), OutcomeStatus::TimedOut);
    assert_eq!(outcome.error(), Some(&ExecutionError::TimedOut));
}

#[tokio::test]
async fn deadline_hit_during_setup_is_a_timeout() {
    for _ in 0..5 {
        let outcome = coordinator()
            .run_with_timeout("return 1;", ExecutionContext::new(), Duration::ZERO)
            .await;
        assert_eq!(outcome.status(), OutcomeStatus::TimedOut);
    }
}

#[tokio::test]
async fn throwing_microtasks_are_reported_like_timers() {
    let outcome = coordinator()
        .run(
            "queueMicrotask(() => { throw new Error('mt'); });
             setTimeout(() => { throw new Error('tt'); }, 1);
             await new Promise((r) => setTimeout(r, 10));
             return 1;",
            ExecutionContext::new(),
        )
        .await;
    assert_eq!(outcome.console_output(), Some("Uncaught Error: mt\nUncaught Error: tt"));
    assert_eq!(outcome.return_value(), Some(&json!(1)));
}
