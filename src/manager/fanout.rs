use ahash::AHashMap as HashMap;
use crossbeam_channel::unbounded;
use std::thread;

use crate::twopc::{Participant, ParticipantError};

/// Per-participant failures collected from one fan-out round.
pub type FailureMap = HashMap<Participant, ParticipantError>;

/// One protocol call to run against one participant.
pub(crate) type Task<'a, R> = (
    Participant,
    Box<dyn FnOnce() -> Result<R, ParticipantError> + Send + 'a>,
);

/// Runs every task concurrently, the last one inline on the calling thread, and
/// waits for all of them. Successes come back in participant order; failures
/// are gathered rather than raised so the caller can make one decision.
pub(crate) fn fan_out<'a, R: Send + 'a>(
    mut tasks: Vec<Task<'a, R>>,
) -> (Vec<(Participant, R)>, FailureMap) {
    let (sender, receiver) = unbounded::<(Participant, Result<R, ParticipantError>)>();
    let last = tasks.pop();

    thread::scope(|scope| {
        for (participant, call) in tasks {
            let sender = sender.clone();
            scope.spawn(move || {
                let result = call();
                let _ = sender.send((participant, result));
            });
        }
        if let Some((participant, call)) = last {
            let result = call();
            let _ = sender.send((participant, result));
        }
    });
    drop(sender);

    let mut successes = Vec::new();
    let mut failures = FailureMap::new();
    for (participant, result) in receiver.try_iter() {
        match result {
            Ok(value) => successes.push((participant, value)),
            Err(e) => {
                failures.insert(participant, e);
            }
        }
    }
    successes.sort_by(|a, b| a.0.cmp(&b.0));
    (successes, failures)
}

/// Failures in a stable order, for error values and log lines.
pub(crate) fn sorted_failures(failures: FailureMap) -> Vec<(Participant, ParticipantError)> {
    let mut failures: Vec<_> = failures.into_iter().collect();
    failures.sort_by(|a, b| a.0.cmp(&b.0));
    failures
}
