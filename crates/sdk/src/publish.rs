use crate::{error::PublishError, event::TaskEvent};

/// Hands committed task mutations to a broker.
///
/// Implementations push exactly one envelope per call, on the topic of the
/// event's kind. Callers must only publish after the mutation has durably
/// committed; a failure here leaves the write in place without its event.
pub trait Publisher: Send + Sync {
    fn publish(&self, event: &TaskEvent) -> impl Future<Output = Result<(), PublishError>> + Send;
}

impl<P: Publisher> Publisher for &P {
    fn publish(&self, event: &TaskEvent) -> impl Future<Output = Result<(), PublishError>> + Send {
        (**self).publish(event)
    }
}

impl<P: Publisher> Publisher for std::sync::Arc<P> {
    fn publish(&self, event: &TaskEvent) -> impl Future<Output = Result<(), PublishError>> + Send {
        (**self).publish(event)
    }
}
