//! Initiation semantics: trace-id modifier discipline, pipelining, trace
//! properties, and initiations nested inside stages.

use std::sync::Arc;
use std::time::Duration;

use mats_core::testing::{test_factory, TestLatch};
use serde::{Deserialize, Serialize};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct Dto {
    number: i64,
}

/// S3: a factory modifier `f` with an outer initiation pipelining K messages
/// puts `f(t)` on every envelope - never `f(f(t))`.
#[tokio::test]
async fn trace_id_modifier_applies_once_per_message() {
    let factory = test_factory("Modifier");
    factory.set_initiate_trace_id_modifier(|orig| format!("P|{orig}"));

    let latch: Arc<TestLatch<Dto, ()>> = TestLatch::new();
    factory
        .terminator::<Dto, (), _>("Test.terminator", latch.handler())
        .unwrap();

    factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("abc");
            for i in 0..20 {
                init.to("Test.terminator");
                init.send(&Dto { number: i })?;
            }
            Ok(())
        })
        .await
        .unwrap();

    let received = latch.await_n(20, WAIT).await;
    assert_eq!(received.len(), 20);
    for message in &received {
        assert_eq!(message.trace_id, "P|abc");
    }
    factory.stop(1000).await;
}

/// All messages of one initiate lambda commit atomically: when the lambda
/// errors after pipelining some, none are sent.
#[tokio::test]
async fn failed_initiation_sends_nothing() {
    let factory = test_factory("AtomicInit");

    let latch: Arc<TestLatch<Dto, ()>> = TestLatch::new();
    factory
        .terminator::<Dto, (), _>("Test.terminator", latch.handler())
        .unwrap();

    let result = factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("doomed").to("Test.terminator");
            init.send(&Dto { number: 1 })?;
            init.to("Test.terminator");
            init.send(&Dto { number: 2 })?;
            Err(mats_core::MatsError::Handler(anyhow::anyhow!(
                "changed my mind"
            )))
        })
        .await;

    assert!(result.is_err());
    latch.assert_quiet(Duration::from_millis(200)).await;
    factory.stop(1000).await;
}

/// Trace properties set at initiation are visible at every stage of the
/// flow, terminator included.
#[tokio::test]
async fn initiation_trace_properties_stick_to_the_flow() {
    let factory = test_factory("Props");

    factory
        .single::<Dto, Dto, _>("Test.hop", |ctx, d| {
            let tenant: Option<String> = ctx.get_trace_property("tenant")?;
            assert_eq!(tenant.as_deref(), Some("acme"));
            Ok(d)
        })
        .unwrap();

    let latch: Arc<TestLatch<Dto, ()>> = TestLatch::new();
    factory
        .terminator::<Dto, (), _>("Test.terminator", latch.handler())
        .unwrap();

    factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("props").to("Test.hop");
            init.set_trace_property("tenant", &"acme")?;
            init.reply_to("Test.terminator", &())?;
            init.request(&Dto { number: 1 })
        })
        .await
        .unwrap();

    let received = latch.await_one(WAIT).await.expect("terminator invoked");
    assert_eq!(
        received.trace_properties.get("tenant").map(String::as_str),
        Some("\"acme\"")
    );
    factory.stop(1000).await;
}

/// Properties set inside a stage reach that stage's outgoing calls, and
/// initiations made from the stage inherit exactly what was set at the time
/// of the initiate call.
#[tokio::test]
async fn stage_set_properties_respect_ordering() {
    let factory = test_factory("PropOrder");

    let side_latch: Arc<TestLatch<Dto, ()>> = TestLatch::new();
    factory
        .terminator::<Dto, (), _>("Test.side", side_latch.handler())
        .unwrap();

    let main_latch: Arc<TestLatch<Dto, ()>> = TestLatch::new();
    factory
        .terminator::<Dto, (), _>("Test.terminator", main_latch.handler())
        .unwrap();

    factory
        .staged::<(), Dto>("Test.propsetter")
        .unwrap()
        .last_stage::<Dto, _>(|ctx, d| {
            // Initiation happens BEFORE the property exists.
            ctx.initiate(|init| {
                init.to("Test.side");
                init.send(&Dto { number: 100 })
            })?;
            ctx.set_trace_property("late", &true)?;
            Ok(d)
        })
        .unwrap();

    factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("prop-order").to("Test.propsetter");
            init.reply_to("Test.terminator", &())?;
            init.request(&Dto { number: 1 })
        })
        .await
        .unwrap();

    let side = side_latch.await_one(WAIT).await.expect("side flow ran");
    assert!(
        !side.trace_properties.contains_key("late"),
        "initiation made before the property was set must not carry it"
    );

    let main = main_latch.await_one(WAIT).await.expect("main flow ran");
    assert_eq!(
        main.trace_properties.get("late").map(String::as_str),
        Some("true"),
        "the stage's own outgoing reply carries the property"
    );
    factory.stop(1000).await;
}

/// Stage-nested initiations inherit the incoming trace id (optionally
/// extended), and the factory's modifier is NOT applied to them.
#[tokio::test]
async fn nested_initiations_inherit_trace_id_unmodified() {
    let factory = test_factory("NestedInit");
    factory.set_initiate_trace_id_modifier(|orig| format!("P|{orig}"));

    let plain_latch: Arc<TestLatch<Dto, ()>> = TestLatch::new();
    factory
        .terminator::<Dto, (), _>("Test.plain", plain_latch.handler())
        .unwrap();

    let extended_latch: Arc<TestLatch<Dto, ()>> = TestLatch::new();
    factory
        .terminator::<Dto, (), _>("Test.extended", extended_latch.handler())
        .unwrap();

    factory
        .terminator::<Dto, (), _>("Test.nesting", |ctx: &mut mats_core::ProcessContext<()>, d: Dto| {
            ctx.initiate(|init| {
                init.to("Test.plain");
                init.send(&d)
            })?;
            ctx.initiate(|init| {
                init.trace_id("suffix").to("Test.extended");
                init.send(&d)
            })
        })
        .unwrap();

    factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("outer").to("Test.nesting");
            init.send(&Dto { number: 1 })
        })
        .await
        .unwrap();

    // The outermost initiation went through the modifier...
    let plain = plain_latch.await_one(WAIT).await.expect("plain flow");
    assert_eq!(plain.trace_id, "P|outer");
    // ...and the nested ones inherit that id without a second application.
    let extended = extended_latch.await_one(WAIT).await.expect("extended flow");
    assert_eq!(extended.trace_id, "P|outer|suffix");
    factory.stop(1000).await;
}

/// A nested initiation joins the stage's commit: when the stage fails after
/// initiating, the side flow is never sent.
#[tokio::test]
async fn nested_initiation_rolls_back_with_the_stage() {
    let factory = mats_core::testing::test_factory_with("NestedRollback", |c| {
        c.max_redeliveries = 1;
    });

    let side_latch: Arc<TestLatch<Dto, ()>> = TestLatch::new();
    factory
        .terminator::<Dto, (), _>("Test.side", side_latch.handler())
        .unwrap();

    factory
        .terminator::<Dto, (), _>("Test.failing", |ctx: &mut mats_core::ProcessContext<()>, d: Dto| {
            ctx.initiate(|init| {
                init.to("Test.side");
                init.send(&d)
            })?;
            Err(mats_core::MatsError::Handler(anyhow::anyhow!("boom")))
        })
        .unwrap();

    factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("nested-rollback").to("Test.failing");
            init.send(&Dto { number: 1 })
        })
        .await
        .unwrap();

    // The failing stage retries then dead-letters; the nested send must
    // never become visible.
    side_latch.assert_quiet(Duration::from_millis(500)).await;
    assert!(factory.broker().queue_stats("mats.Test.failing").dlq_depth >= 1);
    factory.stop(1000).await;
}

/// Flags set on the initiation land in the wire headers (and the envelope).
#[tokio::test]
async fn initiation_flags_propagate() {
    let factory = test_factory("Flags");

    let latch: Arc<TestLatch<Dto, ()>> = TestLatch::new();
    factory
        .terminator::<Dto, (), _>("Test.terminator", latch.handler())
        .unwrap();

    factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("flags")
                .interactive()
                .non_persistent()
                .no_audit()
                .to("Test.terminator");
            init.send(&Dto { number: 1 })
        })
        .await
        .unwrap();

    assert!(latch.await_one(WAIT).await.is_some());
    factory.stop(1000).await;
}

/// Sideloads ride outside the envelope and reach the next message only.
#[tokio::test]
async fn sideloads_attach_to_one_message() {
    let factory = test_factory("Sideloads");

    let latch: Arc<TestLatch<Dto, ()>> = TestLatch::new();
    factory
        .terminator::<Dto, (), _>("Test.terminator", latch.handler())
        .unwrap();

    factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("sideloads").to("Test.terminator");
            init.add_string("note", "hello");
            init.add_bytes("blob", vec![1, 2, 3]);
            init.send(&Dto { number: 1 })?;
            // Second message: no sideloads.
            init.to("Test.terminator");
            init.send(&Dto { number: 2 })
        })
        .await
        .unwrap();

    let mut received = latch.await_n(2, WAIT).await;
    assert_eq!(received.len(), 2);
    received.sort_by_key(|m| m.payload.number);
    assert_eq!(
        received[0].sideloads.strings.get("note").map(String::as_str),
        Some("hello")
    );
    assert_eq!(received[0].sideloads.bytes.get("blob").unwrap(), &[1, 2, 3]);
    assert!(received[1].sideloads.is_empty());
    factory.stop(1000).await;
}

/// Missing to()/trace_id() are setup errors surfaced synchronously.
#[tokio::test]
async fn initiation_validation_errors() {
    let factory = test_factory("Validation");

    let err = factory
        .initiator("test")
        .initiate(|init| {
            init.to("Somewhere");
            init.send(&Dto { number: 1 })
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("trace_id"));

    let err = factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("no-to");
            init.send(&Dto { number: 1 })
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("to("));

    let err = factory
        .initiator("test")
        .initiate(|init| {
            init.trace_id("no-reply-to").to("Somewhere");
            init.request(&Dto { number: 1 })
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("reply_to"));
    factory.stop(1000).await;
}
