//! Terminal transitions
//!
//! Seals the reassembler, freezes derived timestamps, reconciles token
//! totals, runs the threshold rules, emits the terminal event, and queues
//! the Flow for persistence. Returns without suspending; the persistence
//! enqueue is non-blocking.

use crate::{CaptureService, UpstreamOutcome};
use flowscope_core::error::{ErrorKind, FlowError};
use flowscope_core::events::{FlowEvent, FlowSummary};
use flowscope_core::flow::{Flow, FlowResponse, FlowState};
use flowscope_reassembly::{AssembledResponse, Reassembler};

pub(crate) fn finalize(service: &CaptureService, flow_id: &str, outcome: UpstreamOutcome) {
    let Some(shared) = service.memory().get(flow_id) else {
        // Normal when a racing cancel already purged the flow
        tracing::debug!(flow_id = %flow_id, "finalize for unknown flow dropped");
        return;
    };
    let reassembler = service.take_reassembler(flow_id);

    let snapshot = {
        let mut flow = shared.write().expect("flow lock poisoned");
        if flow.is_terminal() {
            // Terminator already finalized this flow; the proxy's
            // completion call is a duplicate.
            return;
        }

        match outcome {
            UpstreamOutcome::Cancelled => {
                // Partial reassembly buffers are discarded with the machine
                transition(&mut flow, FlowState::Cancelled);
            }
            UpstreamOutcome::Ok => {
                let assembled = reassembler.map(Reassembler::finish);
                let stream_error = assembled.as_ref().and_then(|a| a.error.clone());
                if let Some(assembled) = assembled {
                    apply_assembled(&mut flow, assembled);
                }
                match stream_error {
                    Some(error) => {
                        flow.error = Some(error);
                        transition(&mut flow, FlowState::Failed);
                    }
                    None => transition(&mut flow, FlowState::Completed),
                }
            }
            UpstreamOutcome::Error {
                kind,
                message,
                status_code,
                raw_body,
            } => {
                if let Some(assembled) = reassembler.map(Reassembler::finish) {
                    apply_assembled(&mut flow, assembled);
                }
                let mut error = FlowError::new(kind, message);
                error.status_code = status_code;
                error.raw_body = raw_body;
                flow.error = Some(error);
                transition(&mut flow, FlowState::Failed);
            }
        }

        flow.seal_timestamps();
        reconcile_usage(&mut flow);
        flow.clone()
    };

    service.memory().mark_terminal(flow_id);

    match snapshot.state {
        FlowState::Failed => {
            let error = snapshot.error.clone().unwrap_or_else(|| {
                FlowError::new(ErrorKind::Network, "upstream failed without detail")
            });
            service.bus().publish(FlowEvent::FlowFailed {
                id: snapshot.id.clone(),
                error,
            });
        }
        _ => {
            service.bus().publish(FlowEvent::FlowCompleted {
                id: snapshot.id.clone(),
                summary: FlowSummary::from(&snapshot),
            });
        }
    }

    if snapshot.state == FlowState::Completed
        && let Some(warning) = service.threshold().evaluate(&snapshot)
    {
        service.bus().publish(FlowEvent::ThresholdWarning {
            id: snapshot.id.clone(),
            warning,
        });
    }

    let stats = service.stats().record(&snapshot);
    service.bus().publish(FlowEvent::StatsUpdated {
        stats: Box::new(stats),
    });

    service.files().enqueue(snapshot);
}

fn transition(flow: &mut Flow, to: FlowState) {
    if let Err(e) = flow.transition(to) {
        tracing::warn!(flow_id = %flow.id, error = %e, "terminal transition rejected");
    }
}

fn apply_assembled(flow: &mut Flow, assembled: AssembledResponse) {
    // Nothing arrived and no head was seen: leave the response absent
    // rather than fabricating one.
    if flow.response.is_none() && assembled.bytes_ingested == 0 {
        return;
    }
    let response = flow
        .response
        .get_or_insert_with(|| FlowResponse::head(200, "OK", Vec::new()));

    if !assembled.content.is_empty() {
        response.content = assembled.content;
    }
    if assembled.thinking.is_some() {
        response.thinking = assembled.thinking;
    }
    if !assembled.tool_calls.is_empty() {
        response.tool_calls = assembled.tool_calls;
    }
    if !assembled.usage.is_empty() {
        response.usage = assembled.usage;
    }
    if assembled.stop_reason.is_some() {
        response.stop_reason = assembled.stop_reason;
    }
    if response.body.is_none() && !assembled.body.is_null() {
        response.body = Some(assembled.body);
    }
    response.body_bytes = assembled.bytes_ingested;
    response.stream = assembled.was_streaming.then_some(assembled.stream);
}

/// The invariant: `total_tokens == input + output` whenever the provider
/// gave both and no explicit total.
fn reconcile_usage(flow: &mut Flow) {
    if let Some(response) = &mut flow.response
        && response.usage.total_tokens.is_none()
        && (response.usage.input_tokens > 0 || response.usage.output_tokens > 0)
    {
        response.usage.total_tokens =
            Some(response.usage.input_tokens + response.usage.output_tokens);
    }
}
