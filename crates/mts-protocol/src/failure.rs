/// FAILURE notifications sent back to the sender of an undeliverable message.
///
/// The notification is a FAILURE reply from the platform's system agent,
/// addressed to the original sender, whose content names the receiver and
/// the cause:
///
/// ```text
/// ( (action bob@home (ACLMessage) ) (MTS-error carol@home "agent not found: carol@home") )
/// ```
use crate::error::DeliveryError;
use crate::message::{AclMessage, Performative, SingleMessage};
use crate::types::AgentId;

/// Whether failures of `message` must not be reported.
///
/// True when the sender is this platform's system agent (reporting to it
/// could loop) or when the message opted out.
pub fn is_suppressed(message: &SingleMessage, platform: &str) -> bool {
    let sender = message.sender();
    (sender.is_system_agent() && !sender.is_foreign_to(platform))
        || message.acl().ignore_failure()
}

/// Build the FAILURE reply for `original`, which could not reach `receiver`.
pub fn failure_notification(
    original: &SingleMessage,
    receiver: &AgentId,
    error: &DeliveryError,
    platform: &str,
) -> SingleMessage {
    let acl = original.acl();
    let mut failure = acl.create_reply(Performative::Failure, AgentId::system(platform));
    failure.receivers = vec![acl.sender.clone()];
    failure.content = failure_content(acl, receiver, error);
    // A notification that cannot be delivered is dropped, not reported.
    failure.set_ignore_failure(true);

    let notification = SingleMessage::new(failure);
    match original.trace_id() {
        Some(trace) => notification.with_trace_id(trace),
        None => notification,
    }
}

fn failure_content(acl: &AclMessage, receiver: &AgentId, error: &DeliveryError) -> String {
    let cause = error.to_string().replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        "( (action {} (ACLMessage) ) (MTS-error {} \"{}\") )",
        acl.sender, receiver, cause
    )
}
