//! Update sinks receive partial state updates from the read loop.

use dps150_protocol::StateUpdate;
use tokio::sync::broadcast;

/// Receives the fields projected from each decoded frame.
///
/// Called from the read loop in frame-arrival order. Implementations must not
/// block.
pub trait UpdateSink: Send + Sync {
    fn on_update(&self, update: &StateUpdate);
}

impl<F> UpdateSink for F
where
    F: Fn(&StateUpdate) + Send + Sync,
{
    fn on_update(&self, update: &StateUpdate) {
        self(update)
    }
}

impl UpdateSink for broadcast::Sender<StateUpdate> {
    fn on_update(&self, update: &StateUpdate) {
        // No receivers is fine.
        let _ = self.send(update.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dps150_protocol::{DeviceField, FieldUpdate, FieldValue};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn update(value: f32) -> StateUpdate {
        StateUpdate::new(
            192,
            vec![FieldUpdate::new(
                DeviceField::InputVoltage,
                FieldValue::Float(value),
            )],
        )
    }

    #[test]
    fn test_closure_sink_preserves_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink = move |u: &StateUpdate| {
            captured.lock().push(u.get(DeviceField::InputVoltage).cloned());
        };

        sink.on_update(&update(1.0));
        sink.on_update(&update(2.0));

        assert_eq!(
            *seen.lock(),
            vec![Some(FieldValue::Float(1.0)), Some(FieldValue::Float(2.0))]
        );
    }

    #[test]
    fn test_broadcast_sink() {
        let (tx, mut rx) = broadcast::channel(4);
        tx.on_update(&update(3.5));
        assert_eq!(rx.try_recv().unwrap(), update(3.5));

        // Without receivers the update is dropped silently.
        drop(rx);
        tx.on_update(&update(1.0));
    }
}
