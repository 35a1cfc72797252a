use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Published,
    PublishFailed,
    Acked,
    Nacked,
}

/// One publish attempt or one settled delivery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MessageObservation<'a> {
    pub topic: &'a str,
    pub outcome: MessageOutcome,
    pub duration: Duration,
}
