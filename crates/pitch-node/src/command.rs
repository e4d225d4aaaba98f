//! Command admission rules for a node.
//!
//! Pure evaluation, no side effects: given the node's current status
//! and a requested command, decide accept or reject with a reason. The
//! runner applies the resulting transition and answers over the
//! command queue.

use pitch_state::{NodeCommand, NodeStatus};

/// Outcome of evaluating one command against the current status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Apply the command; the node moves to this status next.
    Accept(NodeStatus),
    /// Leave the status unchanged and answer with this reason.
    Reject(String),
}

/// Decide whether `command` is valid in `status`.
///
/// HELLO is always accepted and never changes status. Terminal states
/// reject everything else.
pub fn evaluate(status: NodeStatus, command: NodeCommand) -> Verdict {
    use NodeCommand::*;
    use NodeStatus::*;

    if command == Hello {
        return Verdict::Accept(status);
    }
    if status.is_terminal() {
        return Verdict::Reject(format!("node is {status:?}, accepting no commands"));
    }

    match (status, command) {
        (Running, Pause) => Verdict::Accept(Paused),
        (Running, Resume) => Verdict::Reject("already running".into()),
        (Running, Update) => Verdict::Reject("must be paused".into()),

        (Paused, Pause) => Verdict::Reject("already paused".into()),
        (Paused, Resume) => Verdict::Accept(Running),
        (Paused, Update) => Verdict::Accept(Updating),

        // An update in flight must finish before anything else runs.
        (Updating, Pause | Resume | Update) => {
            Verdict::Reject("update in progress".into())
        }

        (_, Stop) => Verdict::Accept(Stopped),
        // Hello and terminal states handled above.
        _ => Verdict::Reject(format!("{command:?} not valid while {status:?}")),
    }
}
