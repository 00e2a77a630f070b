//! Execution Timeline
//!
//! Tracks node start/end times for generating run reports and
//! Gantt charts. Resource nodes also record when they were destroyed.

use std::collections::HashMap;
use std::time::Instant;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Node started executing
    Started,
    /// Node completed successfully
    Succeeded,
    /// Node failed
    Failed,
    /// Node never ran
    Skipped,
    /// Resource instance was torn down
    Destroyed,
}

impl EventType {
    fn ends_run(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// ID of the node
    pub node_id: String,
    /// Type of event
    pub event_type: EventType,
    /// When the event occurred
    pub timestamp: Instant,
}

/// Tracks the execution timeline of a run.
///
/// Records when each node starts, completes, fails or is skipped,
/// enabling generation of Gantt charts and ordering checks.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a node.
    pub fn add_event(&mut self, node_id: impl Into<String>, event_type: EventType) {
        self.add_event_at(node_id, event_type, Instant::now());
    }

    /// Records an event that happened at `timestamp`.
    pub fn add_event_at(
        &mut self,
        node_id: impl Into<String>,
        event_type: EventType,
        timestamp: Instant,
    ) {
        self.events.push(TimelineEvent {
            node_id: node_id.into(),
            event_type,
            timestamp,
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Earliest event of a type for a node.
    pub fn first_event(&self, node_id: &str, event_type: EventType) -> Option<&TimelineEvent> {
        self.events
            .iter()
            .filter(|e| e.node_id == node_id && e.event_type == event_type)
            .min_by_key(|e| e.timestamp)
    }

    /// Timestamp of the earliest event of a type for a node.
    pub fn time_of(&self, node_id: &str, event_type: EventType) -> Option<Instant> {
        self.first_event(node_id, event_type).map(|e| e.timestamp)
    }

    /// True if the node was ever started.
    pub fn was_started(&self, node_id: &str) -> bool {
        self.first_event(node_id, EventType::Started).is_some()
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each node is shown as a bar indicating when it ran
    /// relative to the total execution time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self
            .events
            .iter()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(self.start_time)
            .duration_since(self.start_time)
            .as_millis();

        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut node_times: Vec<(String, u128, u128)> = self
            .spans()
            .into_iter()
            .map(|(id, (start, end))| (id, start, end))
            .collect();
        node_times.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        for (node_id, start, end) in node_times {
            let start_pos = (start as f64 * scale) as usize;
            let duration = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(duration));

            output.push_str(&format!(
                "{:16} |{}| ({} ms)\n",
                truncate(&node_id, 16),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Start and end offsets in milliseconds for every node that finished.
    fn spans(&self) -> HashMap<String, (u128, u128)> {
        let mut starts: HashMap<&str, u128> = HashMap::new();
        let mut spans: HashMap<String, (u128, u128)> = HashMap::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            match event.event_type {
                EventType::Started => {
                    starts.insert(&event.node_id, elapsed);
                }
                kind if kind.ends_run() => {
                    if let Some(start) = starts.get(event.node_id.as_str()) {
                        spans.insert(event.node_id.clone(), (*start, elapsed.max(*start)));
                    }
                }
                _ => {}
            }
        }
        spans
    }

    /// Returns node durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .map(|(id, (start, end))| (id, end - start))
            .collect()
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncates a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_add_events() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("step.a", EventType::Started);
        thread::sleep(Duration::from_millis(10));
        timeline.add_event("step.a", EventType::Succeeded);

        assert_eq!(timeline.get_events().len(), 2);
        assert!(timeline.was_started("step.a"));
        assert!(!timeline.was_started("step.b"));
    }

    #[test]
    fn test_get_durations() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("step.a", EventType::Started);
        thread::sleep(Duration::from_millis(50));
        timeline.add_event("step.a", EventType::Failed);

        let durations = timeline.get_durations();
        assert!(durations["step.a"] >= 50);
    }

    #[test]
    fn test_get_durations_only_started() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("step.a", EventType::Started);
        timeline.add_event("step.b", EventType::Skipped);

        assert!(timeline.get_durations().is_empty());
    }

    #[test]
    fn test_first_event_uses_timestamp() {
        let mut timeline = ExecutionTimeline::new();
        let early = Instant::now();
        thread::sleep(Duration::from_millis(5));
        timeline.add_event("resource.db", EventType::Destroyed);
        timeline.add_event_at("resource.db", EventType::Destroyed, early);

        let first = timeline
            .first_event("resource.db", EventType::Destroyed)
            .unwrap();
        assert_eq!(first.timestamp, early);
        assert_eq!(timeline.time_of("resource.db", EventType::Destroyed), Some(early));
        assert!(timeline.first_event("resource.db", EventType::Started).is_none());
    }

    #[test]
    fn test_gantt_chart_generation() {
        let mut timeline = ExecutionTimeline::new();

        timeline.add_event("step.one", EventType::Started);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event("step.one", EventType::Succeeded);

        timeline.add_event("step.two", EventType::Started);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event("step.two", EventType::Succeeded);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("step.one"));
        assert!(chart.contains("step.two"));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let timeline = ExecutionTimeline::new();
        let chart = timeline.gantt_chart();
        assert!(chart.contains("Timeline"));
        assert!(!chart.contains("Total:"));
    }

    #[test]
    fn test_truncate_long_ids() {
        assert_eq!(truncate("step.a", 8), "step.a  ");
        assert_eq!(truncate("step.very_long_name[10]", 10), "step.ve...");
    }
}
