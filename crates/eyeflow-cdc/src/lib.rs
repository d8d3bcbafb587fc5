// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! CDC Event Processor (C9).
//!
//! Normalizes raw change-data-capture payloads into the [`CdcEvent`]
//! shape, deduplicates by `(table, txId, logOffset)`, and matches each
//! accepted event against registered [`CdcRule`]s to produce a
//! [`Mission`] with a priority-derived deadline. Grounded on this
//! workspace's JSONL frame/codec pair (`sidecar-kit/src/frame.rs`,
//! `codec.rs`): a tagged wire shape decoded into a typed internal event,
//! generalized here from a sidecar handshake protocol into a
//! deduplicating change-event normalizer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use eyeflow_core::{EyeflowError, WorkflowId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default time-to-live for a dedup cache entry ("default 1 h").
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(3600);

/// The three change kinds a CDC source reports (`operation ∈ {I,U,D}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CdcOperation {
    /// Row inserted (`I`).
    #[serde(rename = "I")]
    Insert,
    /// Row updated (`U`).
    #[serde(rename = "U")]
    Update,
    /// Row deleted (`D`).
    #[serde(rename = "D")]
    Delete,
}

/// Identifies the origin of a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdcSource {
    /// Source database name.
    pub db: String,
    /// Source table name.
    pub table: String,
    /// Source schema, where the database has one (e.g. Postgres).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Connector identifier that produced this change.
    pub connector: String,
}

/// Raw change payload as received from a connector, prior to
/// normalization. Optional fields default when normalized.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCdcEvent {
    /// Pre-assigned event id, if the connector provides one.
    pub event_id: Option<Uuid>,
    /// Free-form classification the connector assigns.
    #[serde(default)]
    pub event_type: Option<String>,
    /// ISO-8601 timestamp, if the connector provides one.
    pub timestamp: Option<String>,
    /// Origin of the change.
    pub source: CdcSource,
    /// Row state before the change (absent for inserts).
    #[serde(default)]
    pub before: Option<serde_json::Value>,
    /// Row state after the change (absent for deletes).
    #[serde(default)]
    pub after: Option<serde_json::Value>,
    /// What kind of change this is.
    pub operation: CdcOperation,
    /// Source transaction identifier.
    pub tx_id: String,
    /// Offset into the source's change log.
    pub log_offset: u64,
    /// Monotone sequence number, if the connector provides one.
    pub sequence: Option<u64>,
}

/// A normalized change event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcEvent {
    /// Unique identifier for this event.
    pub event_id: Uuid,
    /// Connector-assigned classification, or `"change"` if unspecified.
    pub event_type: String,
    /// ISO-8601 timestamp of normalization (or the connector's own, if given).
    pub timestamp: String,
    /// Origin of the change.
    pub source: CdcSource,
    /// Row state before the change.
    pub before: Option<serde_json::Value>,
    /// Row state after the change.
    pub after: Option<serde_json::Value>,
    /// What kind of change this is.
    pub operation: CdcOperation,
    /// Source transaction identifier.
    pub tx_id: String,
    /// Offset into the source's change log.
    pub log_offset: u64,
    /// Monotone sequence number, assigned if the connector omitted one.
    pub sequence: u64,
}

/// Normalize a raw connector payload into the internal [`CdcEvent`] shape.
#[must_use]
pub fn normalize(raw: RawCdcEvent, fallback_sequence: u64) -> CdcEvent {
    CdcEvent {
        event_id: raw.event_id.unwrap_or_else(Uuid::new_v4),
        event_type: raw.event_type.unwrap_or_else(|| "change".to_string()),
        timestamp: raw.timestamp.unwrap_or_else(|| Utc::now().to_rfc3339()),
        source: raw.source,
        before: raw.before,
        after: raw.after,
        operation: raw.operation,
        tx_id: raw.tx_id,
        log_offset: raw.log_offset,
        sequence: raw.sequence.unwrap_or(fallback_sequence),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    table: String,
    tx_id: String,
    log_offset: u64,
}

impl DedupKey {
    fn of(event: &CdcEvent) -> Self {
        Self {
            table: event.source.table.clone(),
            tx_id: event.tx_id.clone(),
            log_offset: event.log_offset,
        }
    }
}

/// TTL-bounded `(table, txId, logOffset)` dedup cache.
pub struct Deduplicator {
    ttl: Duration,
    seen: Mutex<HashMap<DedupKey, Instant>>,
}

impl Deduplicator {
    /// Construct a deduplicator with [`DEFAULT_DEDUP_TTL`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_DEDUP_TTL)
    }

    /// Construct a deduplicator with a custom TTL.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// `true` if this event's dedup key was already seen within the TTL
    /// window. Marks the key as seen either way (a fresh event records
    /// its own arrival; a duplicate refreshes nothing, matching a cache
    /// rather than a sliding window).
    pub fn is_duplicate(&self, event: &CdcEvent) -> bool {
        let key = DedupKey::of(event);
        let now = Instant::now();
        let mut seen = self.seen.lock().expect("dedup cache mutex poisoned");
        seen.retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);
        if seen.contains_key(&key) {
            return true;
        }
        seen.insert(key, now);
        false
    }

    /// Number of keys currently held (post-expiry sweep would shrink this;
    /// sweeps happen lazily on [`is_duplicate`](Self::is_duplicate)).
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.lock().expect("dedup cache mutex poisoned").len()
    }

    /// `true` if no keys are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
    }
}

/// Priority tier a matching rule assigns, deriving a mission's deadline
/// (critical=5min, high=30min, normal=2h, low=24h).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MissionPriority {
    /// 24 h deadline.
    Low,
    /// 2 h deadline.
    Normal,
    /// 30 min deadline.
    High,
    /// 5 min deadline.
    Critical,
}

impl MissionPriority {
    /// How long a mission of this priority has to complete before it is
    /// considered overdue.
    #[must_use]
    pub fn deadline_window(self) -> Duration {
        match self {
            MissionPriority::Critical => Duration::from_secs(5 * 60),
            MissionPriority::High => Duration::from_secs(30 * 60),
            MissionPriority::Normal => Duration::from_secs(2 * 3600),
            MissionPriority::Low => Duration::from_secs(24 * 3600),
        }
    }
}

/// Matches accepted events to a workflow and priority.
///
/// `predicate`, when present, is an additional arbitrary check run after
/// the structural match (db/table/schema/operation) passes — e.g. "only
/// when `after.status` changed to `'shipped'`".
pub struct CdcRule {
    /// Rule identifier, surfaced in logs and diagnostics.
    pub rule_id: String,
    /// Source database this rule watches.
    pub db: String,
    /// Source table this rule watches.
    pub table: String,
    /// Source schema this rule watches, if the database has one.
    pub schema: Option<String>,
    /// Operations this rule reacts to.
    pub operations: Vec<CdcOperation>,
    /// Workflow a matching event is routed to.
    pub workflow_id: WorkflowId,
    /// Priority tier, determining the mission's deadline.
    pub priority: MissionPriority,
    /// Optional additional predicate over the normalized event.
    pub predicate: Option<Arc<dyn Fn(&CdcEvent) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for CdcRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdcRule")
            .field("rule_id", &self.rule_id)
            .field("db", &self.db)
            .field("table", &self.table)
            .field("schema", &self.schema)
            .field("operations", &self.operations)
            .field("workflow_id", &self.workflow_id)
            .field("priority", &self.priority)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl CdcRule {
    fn matches(&self, event: &CdcEvent) -> bool {
        if self.db != event.source.db || self.table != event.source.table {
            return false;
        }
        if let Some(schema) = &self.schema {
            if event.source.schema.as_deref() != Some(schema.as_str()) {
                return false;
            }
        }
        if !self.operations.contains(&event.operation) {
            return false;
        }
        self.predicate.as_ref().is_none_or(|p| p(event))
    }
}

/// The outcome of matching an accepted event against the rule table:
/// a workflow to route to, a priority, and the deadline it implies.
#[derive(Debug, Clone)]
pub struct Mission {
    /// The event that triggered this mission.
    pub event: CdcEvent,
    /// Which rule matched first.
    pub rule_id: String,
    /// Workflow the event routes to.
    pub workflow_id: WorkflowId,
    /// Priority tier of the matching rule.
    pub priority: MissionPriority,
    /// Wall-clock deadline by which this mission should complete.
    pub deadline: DateTime<Utc>,
}

/// Normalizes, deduplicates, and routes CDC events end to end.
pub struct CdcProcessor {
    dedup: Deduplicator,
    rules: Mutex<Vec<CdcRule>>,
    sequence: Mutex<u64>,
}

impl CdcProcessor {
    /// Construct a processor with the default dedup TTL and no rules.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dedup: Deduplicator::new(),
            rules: Mutex::new(Vec::new()),
            sequence: Mutex::new(0),
        }
    }

    /// Construct a processor with a custom dedup TTL.
    #[must_use]
    pub fn with_dedup_ttl(ttl: Duration) -> Self {
        Self {
            dedup: Deduplicator::with_ttl(ttl),
            rules: Mutex::new(Vec::new()),
            sequence: Mutex::new(0),
        }
    }

    /// Register a routing rule. Rules are evaluated in registration
    /// order; the first match wins.
    pub fn register_rule(&self, rule: CdcRule) {
        self.rules.lock().expect("CDC rule table mutex poisoned").push(rule);
    }

    /// Remove every rule with the given id.
    pub fn unregister_rule(&self, rule_id: &str) {
        self.rules
            .lock()
            .expect("CDC rule table mutex poisoned")
            .retain(|r| r.rule_id != rule_id);
    }

    fn next_sequence(&self) -> u64 {
        let mut seq = self.sequence.lock().expect("CDC sequence mutex poisoned");
        *seq += 1;
        *seq
    }

    /// Normalize, deduplicate, and route one raw change payload.
    ///
    /// Returns `Ok(None)` if the event is a duplicate of one seen within
    /// the TTL window, or if no registered rule matches it. Returns
    /// `Ok(Some(mission))` for the first matching rule.
    pub fn process(&self, raw: RawCdcEvent) -> Result<Option<Mission>, EyeflowError> {
        let event = normalize(raw, self.next_sequence());
        if self.dedup.is_duplicate(&event) {
            tracing::debug!(event_id = %event.event_id, "duplicate CDC event, dropping");
            return Ok(None);
        }

        let rules = self.rules.lock().expect("CDC rule table mutex poisoned");
        let Some(matched) = rules.iter().find(|r| r.matches(&event)) else {
            tracing::debug!(event_id = %event.event_id, table = %event.source.table, "no rule matched CDC event");
            return Ok(None);
        };

        let deadline = Utc::now()
            + chrono::Duration::from_std(matched.priority.deadline_window())
                .map_err(|e| EyeflowError::Internal { message: e.to_string() })?;

        Ok(Some(Mission {
            event: event.clone(),
            rule_id: matched.rule_id.clone(),
            workflow_id: matched.workflow_id,
            priority: matched.priority,
            deadline,
        }))
    }
}

impl Default for CdcProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(table: &str, op: CdcOperation, tx_id: &str, offset: u64) -> RawCdcEvent {
        RawCdcEvent {
            event_id: None,
            event_type: None,
            timestamp: None,
            source: CdcSource {
                db: "orders_db".to_string(),
                table: table.to_string(),
                schema: Some("public".to_string()),
                connector: "pg-debezium".to_string(),
            },
            before: None,
            after: Some(serde_json::json!({"status": "shipped"})),
            operation: op,
            tx_id: tx_id.to_string(),
            log_offset: offset,
            sequence: None,
        }
    }

    fn rule(table: &str, priority: MissionPriority) -> CdcRule {
        CdcRule {
            rule_id: format!("rule-{table}"),
            db: "orders_db".to_string(),
            table: table.to_string(),
            schema: Some("public".to_string()),
            operations: vec![CdcOperation::Update, CdcOperation::Insert],
            workflow_id: WorkflowId::new(),
            priority,
            predicate: None,
        }
    }

    #[test]
    fn matching_rule_produces_a_mission_with_priority_deadline() {
        let processor = CdcProcessor::new();
        processor.register_rule(rule("orders", MissionPriority::Critical));

        let mission = processor
            .process(raw("orders", CdcOperation::Update, "tx-1", 10))
            .unwrap()
            .unwrap();
        assert_eq!(mission.priority, MissionPriority::Critical);
        let window = (mission.deadline - Utc::now()).num_seconds();
        assert!((290..=300).contains(&window));
    }

    #[test]
    fn unmatched_table_produces_no_mission() {
        let processor = CdcProcessor::new();
        processor.register_rule(rule("orders", MissionPriority::Normal));

        let mission = processor
            .process(raw("shipments", CdcOperation::Update, "tx-1", 10))
            .unwrap();
        assert!(mission.is_none());
    }

    #[test]
    fn duplicate_key_is_dropped_on_second_delivery() {
        let processor = CdcProcessor::new();
        processor.register_rule(rule("orders", MissionPriority::Normal));

        let first = processor.process(raw("orders", CdcOperation::Update, "tx-1", 10)).unwrap();
        assert!(first.is_some());
        let second = processor.process(raw("orders", CdcOperation::Update, "tx-1", 10)).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn distinct_log_offset_is_not_a_duplicate() {
        let processor = CdcProcessor::new();
        processor.register_rule(rule("orders", MissionPriority::Normal));

        let first = processor.process(raw("orders", CdcOperation::Update, "tx-1", 10)).unwrap();
        let second = processor.process(raw("orders", CdcOperation::Update, "tx-1", 11)).unwrap();
        assert!(first.is_some());
        assert!(second.is_some());
    }

    #[test]
    fn predicate_can_reject_a_structurally_matching_event() {
        let processor = CdcProcessor::new();
        let mut r = rule("orders", MissionPriority::High);
        r.predicate = Some(Arc::new(|event: &CdcEvent| {
            event
                .after
                .as_ref()
                .and_then(|v| v.get("status"))
                .and_then(|v| v.as_str())
                == Some("cancelled")
        }));
        processor.register_rule(r);

        let mission = processor.process(raw("orders", CdcOperation::Update, "tx-1", 10)).unwrap();
        assert!(mission.is_none());
    }

    #[test]
    fn dedup_cache_expires_after_ttl() {
        let dedup = Deduplicator::with_ttl(Duration::from_millis(10));
        let event = normalize(raw("orders", CdcOperation::Update, "tx-1", 10), 1);
        assert!(!dedup.is_duplicate(&event));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!dedup.is_duplicate(&event));
    }
}
