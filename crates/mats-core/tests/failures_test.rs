//! Failure semantics: refusal, overflow protection, at-least-once
//! redelivery, legal-flow strictness, and the DLQ as the observation
//! surface for poison messages.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mats_core::testing::{test_factory_with, TestLatch};
use mats_core::{FlowViolation, MatsError, ProcessContext};
use serde::{Deserialize, Serialize};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct Dto {
    number: i64,
}

/// S5: an endpoint that always requests itself blows the stack limit; the
/// flow is refused at the limit and the poison envelope lands on the DLQ,
/// with no further calls produced.
#[tokio::test]
async fn recursive_flow_is_refused_at_max_stack_height() {
    let factory = test_factory_with("StackOverflow", |c| {
        c.max_stack_height = 6;
        c.max_redeliveries = 1;
    });

    let depth_counter = Arc::new(AtomicU32::new(0));
    {
        let depth_counter = depth_counter.clone();
        let recursive = factory.staged::<(), Dto>("Test.recursive").unwrap();
        recursive
            .stage::<Dto, _>(move |ctx, d| {
                depth_counter.fetch_add(1, Ordering::SeqCst);
                ctx.request("Test.recursive", &Dto { number: d.number + 1 })
            })
            .unwrap();
        recursive.last_stage::<Dto, _>(|_ctx, d| Ok(d)).unwrap();
    }

    let latch: Arc<TestLatch<Dto, ()>> = TestLatch::new();
    factory
        .terminator::<Dto, (), _>("Test.terminator", latch.handler())
        .unwrap();

    factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("recursion").to("Test.recursive");
            init.reply_to("Test.terminator", &())?;
            init.request(&Dto { number: 0 })
        })
        .await
        .unwrap();

    // The refused envelope must end up dead-lettered on the stage's queue.
    let deadline = tokio::time::Instant::now() + WAIT;
    let dead = loop {
        if let Some(dead) = factory.broker().dlq_pop("mats.Test.recursive") {
            break dead;
        }
        assert!(tokio::time::Instant::now() < deadline, "expected a DLQ entry");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    // The flow got refused, so no reply ever reaches the terminator.
    latch.assert_quiet(Duration::from_millis(200)).await;

    // The dead envelope carries the full trace up to the failing depth.
    let serializer = mats_trace::SerializerKind::default();
    let trace = serializer
        .deserialize_envelope(&dead.wire.envelope, &dead.wire.serializer_meta)
        .unwrap();
    assert!(trace.current_stack_height() > 6);
    assert_eq!(trace.trace_id, "recursion");

    // Recursion stopped at the limit rather than running to the call cap.
    let depth = depth_counter.load(Ordering::SeqCst);
    assert!(depth <= 8, "recursion ran past the stack limit: {depth}");
    factory.stop(1000).await;
}

/// RefuseMessage: rollback now, redeliver to the broker limit, then DLQ.
#[tokio::test]
async fn refused_message_rides_redelivery_to_the_dlq() {
    let factory = test_factory_with("Refusal", |c| c.max_redeliveries = 2);

    let attempts = Arc::new(AtomicU32::new(0));
    {
        let attempts = attempts.clone();
        factory
            .terminator::<Dto, (), _>("Test.refuser", move |_ctx, _d| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(MatsError::refuse("not today"))
            })
            .unwrap();
    }

    factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("refusal").to("Test.refuser");
            init.send(&Dto { number: 1 })
        })
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    while factory.broker().queue_stats("mats.Test.refuser").dlq_depth == 0 {
        assert!(tokio::time::Instant::now() < deadline, "expected a DLQ entry");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // 1 initial delivery + 2 redeliveries.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    factory.stop(1000).await;
}

/// At-least-once: a stage that fails after producing outgoing messages gets
/// redelivered, and the failed attempt's messages are never visible
/// downstream.
#[tokio::test]
async fn failed_attempt_output_is_invisible_downstream() {
    let factory = test_factory_with("AtLeastOnce", |c| c.max_redeliveries = 3);

    let latch: Arc<TestLatch<Dto, ()>> = TestLatch::new();
    factory
        .terminator::<Dto, (), _>("Test.downstream", latch.handler())
        .unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    {
        let attempts = attempts.clone();
        factory
            .terminator::<Dto, (), _>("Test.flaky", move |ctx: &mut ProcessContext<()>, d: Dto| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                ctx.initiate(|init| {
                    init.to("Test.downstream");
                    init.send(&Dto {
                        number: i64::from(attempt),
                    })
                })?;
                if attempt < 3 {
                    // Fail after producing output; the commit never happens.
                    return Err(MatsError::Handler(anyhow::anyhow!("flaky attempt")));
                }
                let _ = d;
                Ok(())
            })
            .unwrap();
    }

    factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("at-least-once").to("Test.flaky");
            init.send(&Dto { number: 0 })
        })
        .await
        .unwrap();

    // Exactly one downstream message: the one from the committing attempt.
    let received = latch.await_one(WAIT).await.expect("committed attempt sent");
    assert_eq!(received.payload.number, 3);
    latch.assert_quiet(Duration::from_millis(300)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    factory.stop(1000).await;
}

/// Under Fail strictness a double reply is a hard error; the message rides
/// the DLQ path instead of sending anything.
#[tokio::test]
async fn double_reply_fails_under_strict_mode() {
    let factory = test_factory_with("StrictFlows", |c| {
        c.flow_violation = FlowViolation::Fail;
        c.max_redeliveries = 1;
    });

    let latch: Arc<TestLatch<Dto, ()>> = TestLatch::new();
    factory
        .terminator::<Dto, (), _>("Test.terminator", latch.handler())
        .unwrap();

    factory
        .staged::<(), Dto>("Test.doublereplier")
        .unwrap()
        .last_stage::<Dto, _>(|ctx, d| {
            ctx.reply(&d)?;
            // The wrapper will attempt the second reply and must fail.
            Ok(d)
        })
        .unwrap();

    factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("double-reply").to("Test.doublereplier");
            init.reply_to("Test.terminator", &())?;
            init.request(&Dto { number: 1 })
        })
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    while factory
        .broker()
        .queue_stats("mats.Test.doublereplier")
        .dlq_depth
        == 0
    {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected the violating message on the DLQ"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Neither reply escaped the rolled-back transaction.
    latch.assert_quiet(Duration::from_millis(200)).await;
    factory.stop(1000).await;
}

/// Under the default Warn strictness the same flow proceeds: the violation
/// is logged, both replies are sent.
#[tokio::test]
async fn double_reply_proceeds_under_warn_mode() {
    let factory = test_factory_with("LenientFlows", |c| {
        c.flow_violation = FlowViolation::Warn;
    });

    let latch: Arc<TestLatch<Dto, ()>> = TestLatch::new();
    factory
        .terminator::<Dto, (), _>("Test.terminator", latch.handler())
        .unwrap();

    factory
        .staged::<(), Dto>("Test.doublereplier")
        .unwrap()
        .last_stage::<Dto, _>(|ctx, d| {
            ctx.reply(&Dto { number: d.number + 100 })?;
            Ok(d)
        })
        .unwrap();

    factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("lenient-double").to("Test.doublereplier");
            init.reply_to("Test.terminator", &())?;
            init.request(&Dto { number: 1 })
        })
        .await
        .unwrap();

    let received = latch.await_n(2, WAIT).await;
    assert_eq!(received.len(), 2, "warn mode lets both replies through");
    factory.stop(1000).await;
}

/// A panicking stage lambda is contained: rollback, redelivery, DLQ - the
/// processor itself survives and keeps consuming.
#[tokio::test]
async fn panicking_lambda_is_contained() {
    let factory = test_factory_with("Panics", |c| c.max_redeliveries = 1);

    let latch: Arc<TestLatch<Dto, ()>> = TestLatch::new();
    {
        let latch = latch.clone();
        factory
            .terminator::<Dto, (), _>("Test.panicky", move |ctx, d: Dto| {
                if d.number == 13 {
                    panic!("unlucky number");
                }
                let handler = latch.handler();
                handler(ctx, d)
            })
            .unwrap();
    }

    factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("panic-1").to("Test.panicky");
            init.send(&Dto { number: 13 })
        })
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    while factory.broker().queue_stats("mats.Test.panicky").dlq_depth == 0 {
        assert!(tokio::time::Instant::now() < deadline, "expected a DLQ entry");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The pool is still alive: an ordinary message processes normally.
    factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("panic-2").to("Test.panicky");
            init.send(&Dto { number: 1 })
        })
        .await
        .unwrap();
    assert!(latch.await_one(WAIT).await.is_some());
    factory.stop(1000).await;
}

/// do_after_commit runs only when the commit succeeded, never on rollback.
#[tokio::test]
async fn after_commit_runs_only_on_success() {
    let factory = test_factory_with("AfterCommit", |c| c.max_redeliveries = 1);

    let committed = Arc::new(AtomicU32::new(0));
    let rolled_back_hooks = Arc::new(AtomicU32::new(0));

    {
        let committed = committed.clone();
        factory
            .terminator::<Dto, (), _>("Test.committing", move |ctx, _d| {
                let committed = committed.clone();
                ctx.do_after_commit(move || {
                    committed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                Ok(())
            })
            .unwrap();
    }
    {
        let rolled_back_hooks = rolled_back_hooks.clone();
        factory
            .terminator::<Dto, (), _>("Test.failing", move |ctx, _d| {
                let rolled_back_hooks = rolled_back_hooks.clone();
                ctx.do_after_commit(move || {
                    rolled_back_hooks.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                Err(MatsError::refuse("no commit, no hook"))
            })
            .unwrap();
    }

    factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("hooks").to("Test.committing");
            init.send(&Dto { number: 1 })?;
            init.to("Test.failing");
            init.send(&Dto { number: 2 })
        })
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    while factory.broker().queue_stats("mats.Test.failing").dlq_depth == 0 {
        assert!(tokio::time::Instant::now() < deadline, "failing side should DLQ");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(committed.load(Ordering::SeqCst), 1);
    assert_eq!(rolled_back_hooks.load(Ordering::SeqCst), 0);
    factory.stop(1000).await;
}

/// Call-number overflow refuses non-replies past the cap. A ping-pong pair
/// of endpoints that keeps requesting forever is cut off at the limit.
#[tokio::test]
async fn call_overflow_is_refused() {
    let factory = test_factory_with("CallOverflow", |c| {
        c.max_total_call_number = 10;
        c.max_stack_height = 100;
        c.max_redeliveries = 1;
    });

    // An endpoint that, upon receiving the reply, requests again - forever.
    let looper = factory.staged::<(), Dto>("Test.looper").unwrap();
    looper
        .stage::<Dto, _>(|ctx, d| ctx.request("Test.echo", &d))
        .unwrap();
    looper
        .stage::<Dto, _>(|ctx, d| ctx.request("Test.echo", &d))
        .unwrap();
    looper
        .stage::<Dto, _>(|ctx, d| ctx.request("Test.echo", &d))
        .unwrap();
    looper
        .stage::<Dto, _>(|ctx, d| ctx.request("Test.echo", &d))
        .unwrap();
    looper
        .stage::<Dto, _>(|ctx, d| ctx.request("Test.echo", &d))
        .unwrap();
    looper
        .stage::<Dto, _>(|ctx, d| ctx.request("Test.echo", &d))
        .unwrap();
    looper.last_stage::<Dto, _>(|_ctx, d| Ok(d)).unwrap();

    factory
        .single::<Dto, Dto, _>("Test.echo", |_ctx, d| Ok(d))
        .unwrap();

    let latch: Arc<TestLatch<Dto, ()>> = TestLatch::new();
    factory
        .terminator::<Dto, (), _>("Test.terminator", latch.handler())
        .unwrap();

    factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("call-overflow").to("Test.looper");
            init.reply_to("Test.terminator", &())?;
            init.request(&Dto { number: 1 })
        })
        .await
        .unwrap();

    // Some request along the chain crosses the cap and gets refused; the
    // terminator never hears back.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let dlq_hit = factory.broker().queue_stats("mats.Test.echo").dlq_depth > 0
            || factory.broker().queue_stats("mats.Test.looper").dlq_depth > 0;
        if dlq_hit {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "expected overflow DLQ");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    latch.assert_quiet(Duration::from_millis(200)).await;
    factory.stop(1000).await;
}
