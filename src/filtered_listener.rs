use crate::error::ListenerError;
use crate::event::EventRecord;
use crate::eventbus::EventListener;
use std::sync::Arc;

/// Wraps a listener and filters events based on a user-supplied predicate.
pub struct FilteredListener {
    name: String,
    predicate: Box<dyn Fn(&EventRecord) -> bool + Send + Sync>,
    inner: Arc<dyn EventListener>,
}

impl FilteredListener {
    pub fn new(
        predicate: impl Fn(&EventRecord) -> bool + Send + Sync + 'static,
        inner: Arc<dyn EventListener>,
    ) -> Self {
        Self {
            name: format!("filtered({})", inner.name()),
            predicate: Box::new(predicate),
            inner,
        }
    }
}

impl EventListener for FilteredListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, event: &EventRecord) -> Result<(), ListenerError> {
        if (self.predicate)(event) {
            self.inner.handle(event)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::event_type;
    use crate::event::EventSchema;
    use std::sync::Mutex;

    struct Count(Mutex<usize>);

    impl EventListener for Count {
        fn name(&self) -> &str {
            "count"
        }

        fn handle(&self, _: &EventRecord) -> Result<(), ListenerError> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn predicate_gates_inner_listener() {
        let count = Arc::new(Count(Mutex::new(0)));
        let filtered = FilteredListener::new(|e| e.filter_id == 0, count.clone());
        assert_eq!(filtered.name(), "filtered(count)");

        let schema = Arc::new(EventSchema::compose(event_type::LOG, "LogEvent", vec![]));
        let mut ev = EventRecord::new(schema, vec![]).unwrap();
        filtered.handle(&ev).unwrap();
        ev.filter_id = 2;
        filtered.handle(&ev).unwrap();
        assert_eq!(*count.0.lock().unwrap(), 1);
    }
}
