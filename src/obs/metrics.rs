// self
use crate::obs::{Component, Outcome};

/// Records an operation outcome via the global metrics recorder (when enabled).
pub fn record_outcome(component: Component, outcome: Outcome) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(
			"lookup_broker_op_total",
			"component" => component.as_str(),
			"outcome" => outcome.as_str()
		)
		.increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = (component, outcome);
	}
}

/// Records the current depth of a component queue (when enabled).
pub fn record_queue_depth(component: Component, depth: usize) {
	#[cfg(feature = "metrics")]
	{
		metrics::gauge!("lookup_broker_queue_depth", "component" => component.as_str())
			.set(depth as f64);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = (component, depth);
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn recorders_noop_without_metrics() {
		record_outcome(Component::Deduplicator, Outcome::Rejected);
		record_queue_depth(Component::BatchCoordinator, 3);
	}
}
