//! # Stage Processor
//!
//! One long-running consumer per pool slot. Per message: receive under a
//! fresh transactional context, deserialize, run the user lambda, enforce the
//! envelope invariants, stage the buffered outgoing messages, commit both
//! transactions, then run after-commit hooks. Any failure rolls everything
//! back and the broker's redelivery/DLQ pipeline takes over, envelope intact.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use mats_shared::{BrokerError, MatsError, ReceiveSelector, ReceivedMessage};
use mats_trace::CallType;
use tracing::{debug, error, info_span, warn};

use crate::context::StageExecution;
use crate::factory::EngineShared;
use crate::interceptor::InterceptContext;
use crate::stage::StageRuntime;
use crate::tx::TxContext;

/// Back-off after an unexpected (non-Closed) receive error.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// The processor main loop. Exits on stage shutdown or broker close; the
/// message in flight (if any) always completes its commit or rollback first.
pub(crate) async fn run(
    engine: Arc<EngineShared>,
    stage: Arc<StageRuntime>,
    selector: ReceiveSelector,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut consumer = match engine.broker.consumer(&stage.channel, selector) {
        Ok(consumer) => consumer,
        Err(e) => {
            error!(stage_id = %stage.stage_id, error = %e, "could not create consumer; processor exits");
            return;
        }
    };
    stage.mark_receiving();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                // A dropped sender also means the stage is going away.
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = consumer.next() => match received {
                Ok(message) => process_message(&engine, &stage, message),
                Err(BrokerError::Closed(_)) => break,
                Err(e) => {
                    warn!(stage_id = %stage.stage_id, error = %e, "receive failed; backing off");
                    tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                }
            }
        }
    }
    stage.unmark_receiving();
    debug!(stage_id = %stage.stage_id, "processor exited");
}

/// The per-message algorithm. Synchronous: the user lambda runs to completion
/// on this processor's task, and its blocking time counts against the slot.
fn process_message(engine: &Arc<EngineShared>, stage: &Arc<StageRuntime>, received: ReceivedMessage) {
    let receipt = received.receipt.clone();
    let interceptors = engine.interceptors();
    let external = engine.external();

    let tx = match TxContext::open(&engine.broker, external.as_ref()) {
        Ok(tx) => tx,
        Err(e) => {
            error!(stage_id = %stage.stage_id, error = %e, "could not open transaction; rolling back");
            // No session was handed out; nack through a throwaway one.
            if let Err(nack_err) = engine.broker.session().rollback(Some(&receipt), true) {
                error!(error = %nack_err, "rollback after failed transaction open also failed");
            }
            return;
        }
    };

    // Deserialize the envelope before anything else; a mismatched serializer
    // is poison and rides redelivery to the DLQ.
    let trace = match engine
        .serializer
        .deserialize_envelope(&received.wire.envelope, &received.wire.serializer_meta)
    {
        Ok(trace) => trace,
        Err(e) => {
            error!(
                stage_id = %stage.stage_id,
                system_message_id = %received.system_message_id,
                error = %e,
                "incoming envelope failed to deserialize; refusing message"
            );
            tx.rollback(Some(&receipt), true);
            return;
        }
    };

    let span = info_span!(
        "mats.stage",
        stage_id = %stage.stage_id,
        trace_id = %trace.trace_id,
        flow_id = %trace.flow_id,
        system_message_id = %received.system_message_id,
    );
    let _guard = span.enter();

    let icontext = InterceptContext {
        stage_id: stage.stage_id.clone(),
        trace_id: trace.trace_id.clone(),
        flow_id: trace.flow_id.clone(),
        system_message_id: received.system_message_id.clone(),
        delivery_count: received.delivery_count,
    };
    for interceptor in &interceptors {
        interceptor.message_received(&icontext);
    }

    let fail = |tx: TxContext, error: MatsError| {
        error!(error = %error, delivery_count = received.delivery_count, "stage processing failed; rolling back");
        tx.rollback(Some(&receipt), true);
        for interceptor in &interceptors {
            interceptor.failed(&icontext, &error);
        }
    };

    // Envelope invariants are enforced against the *incoming* message so an
    // oversized flow never propagates further.
    let height = trace.current_stack_height();
    let max_height = engine.config.max_stack_height;
    if height > max_height {
        fail(
            tx,
            MatsError::StackOverflow {
                height,
                max: max_height,
            },
        );
        return;
    }
    let max_calls = engine.config.max_total_call_number;
    let is_reply = trace.current_call().map(|c| c.call_type) == Some(CallType::Reply);
    if trace.total_call_number > max_calls && !is_reply {
        fail(
            tx,
            MatsError::CallOverflow {
                total: trace.total_call_number,
                max: max_calls,
            },
        );
        return;
    }

    let exec = StageExecution::new(
        engine.clone(),
        stage.endpoint_id.clone(),
        stage.stage_id.clone(),
        stage.next_stage_id.clone(),
        trace,
        received.wire.envelope.clone(),
        received.wire.serializer_meta.clone(),
        received.wire.sideloads.clone(),
        received.system_message_id.clone(),
        received.delivery_count,
        tx.attributes(),
    );

    for interceptor in &interceptors {
        interceptor.user_lambda_entered(&icontext);
    }
    let lambda = stage.lambda.clone();
    let outcome = catch_unwind(AssertUnwindSafe(move || lambda(exec)));
    let mut exec = match outcome {
        Err(panic) => {
            let description = panic_message(&panic);
            fail(tx, MatsError::Handler(anyhow::anyhow!("stage lambda panicked: {description}")));
            return;
        }
        Ok(Err(e)) => {
            fail(tx, e);
            return;
        }
        Ok(Ok(exec)) => exec,
    };
    for interceptor in &interceptors {
        interceptor.user_lambda_exited(&icontext);
    }

    // The single editable interception point.
    for interceptor in &interceptors {
        interceptor.intercept_outgoing(&icontext, &mut exec.outgoing);
    }

    let mut tx = tx;
    if let Err(e) = exec.dispatch(&mut tx) {
        fail(tx, e);
        return;
    }

    match tx.commit(Some(&receipt)) {
        Ok(()) => {
            run_after_commit(exec.after_commit);
            for interceptor in &interceptors {
                interceptor.completed(&icontext);
            }
            debug!(system_message_id = %received.system_message_id, "message committed");
        }
        Err(e) => {
            // Commit already rolled the broker side back where possible.
            error!(error = %e, "commit failed; message will redeliver");
            for interceptor in &interceptors {
                interceptor.failed(&icontext, &e);
            }
        }
    }
}

/// After-commit hooks run outside the transaction; their failures (and
/// panics) are logged and swallowed - the message is already committed.
pub(crate) fn run_after_commit(hooks: Vec<crate::context::AfterCommitHook>) {
    for hook in hooks {
        match catch_unwind(AssertUnwindSafe(hook)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "do_after_commit hook failed (ignored)"),
            Err(panic) => {
                warn!("do_after_commit hook panicked (ignored): {}", panic_message(&panic));
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
