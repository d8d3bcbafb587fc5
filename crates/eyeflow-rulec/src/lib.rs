// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Rule Compiler & Feedback (C14).
//!
//! Validates a user-authored rule (trigger + optional condition + ordered
//! actions) against a connector registry and a project's allowed sets,
//! producing a structured [`CompilationReport`] instead of raising on the
//! first problem — every issue a rule has is surfaced in one pass, plus
//! a derived data-flow graph; a rule that fails validation is never
//! handed to the project/version lifecycle (C12) to persist.

use std::collections::BTreeMap;

use eyeflow_lifecycle::AllowedSets;
use eyeflow_manifest::TypedSignature;
use serde::{Deserialize, Serialize};

/// What a rule's trigger reacts to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Connector id the event originates from.
    pub source_connector: String,
    /// Trigger type, e.g. `"cdc_insert"`, `"cron"`, `"webhook"`.
    pub trigger_type: String,
    /// Driver-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A single comparison gating whether the rule's actions run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSpec {
    /// Field name, resolved against the trigger connector's declared event
    /// fields.
    pub field: String,
    /// Comparison operator, e.g. `"eq"`, `"gt"`, `"contains"`.
    pub operator: String,
    /// Right-hand side of the comparison.
    pub value: serde_json::Value,
}

/// One step in the rule's ordered action list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Connector id the action dispatches through.
    pub connector: String,
    /// Function name or id on that connector.
    pub function: String,
    /// Arguments, may reference `$event`/`$result`/`$stepN` placeholders.
    #[serde(default)]
    pub args: serde_json::Value,
}

/// A complete, not-yet-compiled rule (input).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// What fires this rule.
    pub trigger: TriggerSpec,
    /// Optional gate on the trigger's event.
    pub condition: Option<ConditionSpec>,
    /// Ordered actions to run once triggered (and, if present, the
    /// condition holds).
    pub actions: Vec<ActionSpec>,
}

/// One function a connector exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorFunction {
    /// Stable id, independent of display name.
    pub id: String,
    /// Human-readable/referenceable name.
    pub name: String,
}

/// A connector's declaration: what trigger event fields it produces and
/// what functions it exposes for actions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorDefinition {
    /// Stable connector id.
    pub id: String,
    /// Typed event fields this connector's triggers may reference in a
    /// condition.
    #[serde(default)]
    pub event_fields: Vec<TypedSignature>,
    /// Functions available for this connector's actions.
    #[serde(default)]
    pub functions: Vec<ConnectorFunction>,
}

impl ConnectorDefinition {
    fn field_type(&self, field: &str) -> Option<&str> {
        self.event_fields
            .iter()
            .find(|f| f.name == field)
            .map(|f| f.type_name.as_str())
    }

    fn find_function(&self, function: &str) -> Option<&ConnectorFunction> {
        self.functions
            .iter()
            .find(|f| f.id == function || f.name == function)
    }
}

/// Process-wide table of known connector definitions, consulted during
/// compilation (not the manifest C1 resolves against — connectors are a
/// compile-time, user-facing concept; manifest entries are a
/// dispatch-time, service-level one).
#[derive(Debug, Clone, Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, ConnectorDefinition>,
}

impl ConnectorRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a connector definition.
    pub fn register(&mut self, connector: ConnectorDefinition) {
        self.connectors.insert(connector.id.clone(), connector);
    }

    /// Look up a connector by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ConnectorDefinition> {
        self.connectors.get(id)
    }
}

/// Severity of one [`Issue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Blocks compilation; `isValid` is `false` if any `Error` issue exists.
    Error,
    /// Does not block compilation, but is surfaced to the author.
    Warning,
}

/// One structured diagnostic ("issues (type, severity,
/// message, path, suggestion)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Short machine-readable category, e.g. `"missing_connector"`.
    pub issue_type: String,
    /// Blocking or advisory.
    pub severity: Severity,
    /// Human-readable diagnostic.
    pub message: String,
    /// Path into the rule this issue concerns, e.g. `"actions[1].function"`.
    pub path: String,
    /// A suggested fix, if one can be derived (e.g. nearby valid function
    /// names).
    pub suggestion: Option<String>,
}

/// One node in the derived data-flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFlowNode {
    /// Step identifier: `"trigger"`, `"condition"`, or `"step<N>"`.
    pub id: String,
    /// What this step's output may be referenced as downstream.
    pub output_alias: String,
}

/// The step graph a rule compiles into: `trigger → condition →
/// action[0] … action[n]`, with each step's output aliased for later
/// steps to reference (`$event`, `$result`, `$stepI`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFlowGraph {
    /// Every step, in execution order.
    pub nodes: Vec<DataFlowNode>,
    /// Directed edges `(from, to)` between consecutive node ids.
    pub edges: Vec<(String, String)>,
}

/// Per-action cost used by [`RuleCompiler::compile`]'s execution-time
/// estimate. Not a measurement — a fixed planning constant, the same role
/// `default_timeout_ms` plays for service dispatch in the manifest crate.
const ESTIMATED_CONDITION_MS: u64 = 10;
/// Estimated wall-clock cost per compiled action, used only for the
/// compilation report's advisory estimate.
const ESTIMATED_ACTION_MS: u64 = 100;

/// Output of [`RuleCompiler::compile`] ("compilation
/// report").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationReport {
    /// `true` iff no [`Issue`] has [`Severity::Error`].
    pub is_valid: bool,
    /// Every issue found, in the order validation passes ran.
    pub issues: Vec<Issue>,
    /// Requirements the rule is missing entirely (e.g. "condition field
    /// requires connector X to declare event field Y"), independent of
    /// any single issue's path.
    pub missing_requirements: Vec<String>,
    /// The derived trigger→condition→actions step graph.
    pub data_flow: DataFlowGraph,
    /// Advisory estimate of one execution's wall-clock cost, in
    /// milliseconds.
    pub estimated_execution_time_ms: u64,
}

impl CompilationReport {
    /// Count of [`Severity::Error`] issues.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.issues.iter().filter(|i| i.severity == Severity::Error).count()
    }

    /// Count of [`Severity::Warning`] issues.
    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.issues.iter().filter(|i| i.severity == Severity::Warning).count()
    }
}

/// Validates rules against a [`ConnectorRegistry`] and a project's
/// [`AllowedSets`], producing a [`CompilationReport`].
pub struct RuleCompiler {
    connectors: ConnectorRegistry,
}

impl RuleCompiler {
    /// Build a compiler backed by `connectors`.
    #[must_use]
    pub fn new(connectors: ConnectorRegistry) -> Self {
        Self { connectors }
    }

    /// Run every validation pass over `rule` against `allowed`, the
    /// owning project's allowlists.
    ///
    /// Never raises: every problem becomes an [`Issue`] in the returned
    /// report. Callers must check `report.is_valid` before handing the
    /// rule to compilation into IR (C10) — an invalid rule is never
    /// persisted.
    #[must_use]
    pub fn compile(&self, rule: &Rule, allowed: &AllowedSets) -> CompilationReport {
        let mut issues = Vec::new();
        let mut missing_requirements = Vec::new();

        // Pass 1: trigger source connector exists.
        let trigger_connector = self.connectors.get(&rule.trigger.source_connector);
        if trigger_connector.is_none() {
            issues.push(Issue {
                issue_type: "missing_connector".to_string(),
                severity: Severity::Error,
                message: format!(
                    "trigger source connector '{}' is not registered",
                    rule.trigger.source_connector
                ),
                path: "trigger.sourceConnector".to_string(),
                suggestion: None,
            });
        }
        if !allowed.trigger_types.is_empty() && !allowed.trigger_types.contains(&rule.trigger.trigger_type) {
            issues.push(Issue {
                issue_type: "trigger_type_not_allowed".to_string(),
                severity: Severity::Error,
                message: format!(
                    "trigger type '{}' is not in this project's allowed trigger types",
                    rule.trigger.trigger_type
                ),
                path: "trigger.triggerType".to_string(),
                suggestion: Some(format!("allowed: {}", allowed.trigger_types.join(", "))),
            });
        }

        // Pass 2 & 3: each action's connector is allowed + registered,
        // and its function exists.
        for (i, action) in rule.actions.iter().enumerate() {
            let path_prefix = format!("actions[{i}]");

            if !allowed.connector_ids.is_empty() && !allowed.connector_ids.contains(&action.connector) {
                issues.push(Issue {
                    issue_type: "connector_not_allowed".to_string(),
                    severity: Severity::Error,
                    message: format!(
                        "action connector '{}' is not in this project's allowed connector set",
                        action.connector
                    ),
                    path: format!("{path_prefix}.connector"),
                    suggestion: None,
                });
            }

            match self.connectors.get(&action.connector) {
                None => {
                    issues.push(Issue {
                        issue_type: "missing_connector".to_string(),
                        severity: Severity::Error,
                        message: format!("action connector '{}' is not registered", action.connector),
                        path: format!("{path_prefix}.connector"),
                        suggestion: None,
                    });
                }
                Some(connector) => {
                    if connector.find_function(&action.function).is_none() {
                        let available: Vec<&str> =
                            connector.functions.iter().map(|f| f.name.as_str()).collect();
                        issues.push(Issue {
                            issue_type: "missing_function".to_string(),
                            severity: Severity::Error,
                            message: format!(
                                "connector '{}' has no function '{}'",
                                action.connector, action.function
                            ),
                            path: format!("{path_prefix}.function"),
                            suggestion: if available.is_empty() {
                                None
                            } else {
                                Some(format!("available functions: {}", available.join(", ")))
                            },
                        });
                    }
                    if !allowed.function_ids.is_empty()
                        && !allowed.function_ids.contains(&action.function)
                        && connector.find_function(&action.function).is_some()
                    {
                        issues.push(Issue {
                            issue_type: "function_not_allowed".to_string(),
                            severity: Severity::Error,
                            message: format!(
                                "function '{}' is not in this project's allowed function set",
                                action.function
                            ),
                            path: format!("{path_prefix}.function"),
                            suggestion: None,
                        });
                    }
                }
            }
        }

        // Pass 4: condition field type matches the trigger connector's
        // declared schema.
        if let Some(condition) = &rule.condition {
            match trigger_connector {
                None => missing_requirements.push(format!(
                    "condition references field '{}' but the trigger connector is unresolved",
                    condition.field
                )),
                Some(connector) => match connector.field_type(&condition.field) {
                    None => {
                        missing_requirements.push(format!(
                            "connector '{}' does not declare event field '{}' used in condition",
                            connector.id, condition.field
                        ));
                        issues.push(Issue {
                            issue_type: "unknown_condition_field".to_string(),
                            severity: Severity::Error,
                            message: format!(
                                "condition references undeclared event field '{}'",
                                condition.field
                            ),
                            path: "condition.field".to_string(),
                            suggestion: None,
                        });
                    }
                    Some(declared_type) => {
                        if !value_matches_type(&condition.value, declared_type) {
                            issues.push(Issue {
                                issue_type: "condition_type_mismatch".to_string(),
                                severity: Severity::Error,
                                message: format!(
                                    "condition value for field '{}' does not match declared type '{declared_type}'",
                                    condition.field
                                ),
                                path: "condition.value".to_string(),
                                suggestion: None,
                            });
                        }
                    }
                },
            }
        }

        // Pass 5: data-flow graph, built regardless of validity so the
        // author can see the rule's shape even while fixing errors.
        let data_flow = build_data_flow(rule);

        let estimated_execution_time_ms = rule
            .condition
            .as_ref()
            .map_or(0, |_| ESTIMATED_CONDITION_MS)
            + ESTIMATED_ACTION_MS * rule.actions.len() as u64;

        let is_valid = issues.iter().all(|i| i.severity != Severity::Error);
        CompilationReport {
            is_valid,
            issues,
            missing_requirements,
            data_flow,
            estimated_execution_time_ms,
        }
    }
}

fn build_data_flow(rule: &Rule) -> DataFlowGraph {
    let mut nodes = vec![DataFlowNode {
        id: "trigger".to_string(),
        output_alias: "$event".to_string(),
    }];
    let mut edges = Vec::new();
    let mut previous = "trigger".to_string();

    if rule.condition.is_some() {
        nodes.push(DataFlowNode {
            id: "condition".to_string(),
            output_alias: "$event".to_string(),
        });
        edges.push((previous.clone(), "condition".to_string()));
        previous = "condition".to_string();
    }

    for i in 0..rule.actions.len() {
        let id = format!("step{i}");
        nodes.push(DataFlowNode {
            id: id.clone(),
            output_alias: format!("$step{i}"),
        });
        edges.push((previous, id.clone()));
        previous = id;
    }

    DataFlowGraph { nodes, edges }
}

fn value_matches_type(value: &serde_json::Value, declared_type: &str) -> bool {
    match declared_type {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        // An unrecognized declared type is not this pass's problem to flag.
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ConnectorRegistry {
        let mut reg = ConnectorRegistry::new();
        reg.register(ConnectorDefinition {
            id: "postgres".to_string(),
            event_fields: vec![TypedSignature {
                name: "amount".to_string(),
                type_name: "number".to_string(),
                required: true,
            }],
            functions: vec![],
        });
        reg.register(ConnectorDefinition {
            id: "slack".to_string(),
            event_fields: vec![],
            functions: vec![ConnectorFunction {
                id: "post_message".to_string(),
                name: "Post Message".to_string(),
            }],
        });
        reg
    }

    fn valid_rule() -> Rule {
        Rule {
            trigger: TriggerSpec {
                source_connector: "postgres".to_string(),
                trigger_type: "cdc_insert".to_string(),
                config: serde_json::json!({}),
            },
            condition: Some(ConditionSpec {
                field: "amount".to_string(),
                operator: "gt".to_string(),
                value: serde_json::json!(100),
            }),
            actions: vec![ActionSpec {
                connector: "slack".to_string(),
                function: "post_message".to_string(),
                args: serde_json::json!({"text": "$event"}),
            }],
        }
    }

    #[test]
    fn valid_rule_compiles_clean() {
        let compiler = RuleCompiler::new(registry());
        let report = compiler.compile(&valid_rule(), &AllowedSets::default());
        assert!(report.is_valid, "issues: {:?}", report.issues);
        assert_eq!(report.data_flow.nodes.len(), 3);
    }

    #[test]
    fn unknown_trigger_connector_is_an_error() {
        let compiler = RuleCompiler::new(registry());
        let mut rule = valid_rule();
        rule.trigger.source_connector = "nonexistent".to_string();
        let report = compiler.compile(&rule, &AllowedSets::default());
        assert!(!report.is_valid);
        assert!(report.issues.iter().any(|i| i.issue_type == "missing_connector"));
    }

    #[test]
    fn unknown_action_function_suggests_available_ones() {
        let compiler = RuleCompiler::new(registry());
        let mut rule = valid_rule();
        rule.actions[0].function = "send_dm".to_string();
        let report = compiler.compile(&rule, &AllowedSets::default());
        assert!(!report.is_valid);
        let issue = report
            .issues
            .iter()
            .find(|i| i.issue_type == "missing_function")
            .unwrap();
        assert!(issue.suggestion.as_ref().unwrap().contains("Post Message"));
    }

    #[test]
    fn condition_type_mismatch_is_flagged() {
        let compiler = RuleCompiler::new(registry());
        let mut rule = valid_rule();
        rule.condition.as_mut().unwrap().value = serde_json::json!("not-a-number");
        let report = compiler.compile(&rule, &AllowedSets::default());
        assert!(!report.is_valid);
        assert!(report
            .issues
            .iter()
            .any(|i| i.issue_type == "condition_type_mismatch"));
    }

    #[test]
    fn connector_outside_allowed_set_is_rejected() {
        let compiler = RuleCompiler::new(registry());
        let rule = valid_rule();
        let allowed = AllowedSets {
            connector_ids: vec!["postgres".to_string()],
            ..AllowedSets::default()
        };
        let report = compiler.compile(&rule, &allowed);
        assert!(!report.is_valid);
        assert!(report.issues.iter().any(|i| i.issue_type == "connector_not_allowed"));
    }

    #[test]
    fn estimated_time_scales_with_action_count() {
        let compiler = RuleCompiler::new(registry());
        let mut rule = valid_rule();
        rule.actions.push(ActionSpec {
            connector: "slack".to_string(),
            function: "post_message".to_string(),
            args: serde_json::json!({}),
        });
        let report = compiler.compile(&rule, &AllowedSets::default());
        assert_eq!(
            report.estimated_execution_time_ms,
            ESTIMATED_CONDITION_MS + ESTIMATED_ACTION_MS * 2
        );
    }
}
