//! Reconstructs token usage from an execution result payload.
//!
//! The engine has no fixed contract for where LLM usage lands in a node's
//! output, so each emitted item is probed against an ordered list of known
//! locations. The first location that yields counts wins for that item; the
//! remaining aliases are ignored so a usage block exposed twice is counted
//! once.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::models::usage::{NodeUsage, TokenUsage};

/// Usage block locations, highest priority first.
pub const DEFAULT_USAGE_PATHS: &[&[&str]] = &[
    &["tokenUsage"],
    &["usage"],
    &["response", "usage"],
    &["metadata", "tokenUsage"],
];

const RUN_DATA_PATHS: &[&[&str]] = &[
    &["data", "resultData", "runData"],
    &["resultData", "runData"],
    &["runData"],
];

const PROMPT_FIELDS: &[&str] = &["promptTokens", "prompt_tokens", "inputTokens", "input_tokens"];
const COMPLETION_FIELDS: &[&str] = &[
    "completionTokens",
    "completion_tokens",
    "outputTokens",
    "output_tokens",
];
const TOTAL_FIELDS: &[&str] = &["totalTokens", "total_tokens"];

const ITEM_MODEL_PATHS: &[&[&str]] = &[
    &["model"],
    &["modelName"],
    &["response", "model"],
    &["metadata", "model"],
    &["options", "model"],
];

const DEFAULT_MAX_DEPTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRule {
    pub path: Vec<String>,
}

impl UsageRule {
    pub fn new<S: AsRef<str>>(path: &[S]) -> Self {
        Self {
            path: path.iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }

    fn locate<'a>(&self, item: &'a Value) -> Option<&'a Value> {
        let mut cur = item;
        for key in &self.path {
            cur = cur.get(key.as_str())?;
        }
        cur.is_object().then_some(cur)
    }
}

#[derive(Debug, Clone)]
pub struct UsageExtractor {
    rules: Vec<UsageRule>,
    max_depth: usize,
}

impl Default for UsageExtractor {
    fn default() -> Self {
        Self {
            rules: DEFAULT_USAGE_PATHS
                .iter()
                .map(|path| UsageRule::new(path))
                .collect(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Counts taken from one matched usage block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ItemCounts {
    prompt: u64,
    completion: u64,
    total: u64,
}

impl ItemCounts {
    /// A block matches when it carries at least one recognised count. When
    /// both sides are known the total is their sum; when only one side is
    /// known the total is that side, never zero.
    fn from_block(block: &Value) -> Option<Self> {
        let prompt = first_count(block, PROMPT_FIELDS);
        let completion = first_count(block, COMPLETION_FIELDS);
        let reported_total = first_count(block, TOTAL_FIELDS);

        let total = match (prompt, completion) {
            (Some(p), Some(c)) => p.saturating_add(c),
            (Some(p), None) => p,
            (None, Some(c)) => c,
            (None, None) => reported_total?,
        };
        Some(Self {
            prompt: prompt.unwrap_or(0),
            completion: completion.unwrap_or(0),
            total,
        })
    }
}

#[derive(Default)]
struct NodeTally {
    prompt: u64,
    completion: u64,
    total: u64,
    model: Option<String>,
}

impl UsageExtractor {
    pub fn with_rules(rules: Vec<UsageRule>) -> Self {
        Self {
            rules,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Appends a lowest-priority location, for aliases newer engine
    /// versions introduce.
    pub fn push_rule(mut self, rule: UsageRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn rules(&self) -> &[UsageRule] {
        &self.rules
    }

    /// Pure and deterministic: the same payload always yields the same
    /// `TokenUsage`, and a payload without usage yields all zeros.
    pub fn extract(&self, execution: &Value) -> TokenUsage {
        let Some(run_data) = RUN_DATA_PATHS
            .iter()
            .find_map(|path| follow(execution, path))
            .and_then(Value::as_object)
        else {
            debug!("execution payload has no run data");
            return TokenUsage::default();
        };

        let node_types = node_types(execution);

        let mut node_names: Vec<&String> = run_data.keys().collect();
        node_names.sort();

        let mut breakdown = Vec::new();
        let mut providers: Vec<Option<String>> = Vec::new();

        for node_name in node_names {
            let Some(runs) = run_data[node_name].as_array() else {
                debug!(node = %node_name, "skipping malformed node output");
                continue;
            };

            let mut tally = NodeTally::default();
            for run in runs {
                let Some(output) = run.get("data") else {
                    debug!(node = %node_name, "node run has no output data");
                    continue;
                };
                let mut items = Vec::new();
                self.collect_items(output, 0, &mut items);
                for item in items {
                    self.tally_item(item, &mut tally);
                }
            }

            if tally.total == 0 && tally.prompt == 0 && tally.completion == 0 {
                continue;
            }

            let node_type = node_types
                .get(node_name.as_str())
                .copied()
                .unwrap_or("unknown")
                .to_string();
            providers.push(infer_provider(&node_type));
            breakdown.push(NodeUsage {
                node_name: node_name.clone(),
                node_type,
                prompt_tokens: tally.prompt,
                completion_tokens: tally.completion,
                total_tokens: tally.total,
                model: tally.model,
            });
        }

        let mut usage = TokenUsage::default();
        for node in &breakdown {
            usage.prompt_tokens = usage.prompt_tokens.saturating_add(node.prompt_tokens);
            usage.completion_tokens = usage.completion_tokens.saturating_add(node.completion_tokens);
            usage.total_tokens = usage.total_tokens.saturating_add(node.total_tokens);
        }

        // The heaviest node names the execution's model; ties keep node order.
        let mut heaviest: Option<usize> = None;
        for (idx, node) in breakdown.iter().enumerate() {
            if heaviest.map_or(true, |h| node.total_tokens > breakdown[h].total_tokens) {
                heaviest = Some(idx);
            }
        }
        if let Some(idx) = heaviest {
            usage.model = breakdown[idx]
                .model
                .clone()
                .or_else(|| breakdown.iter().find_map(|n| n.model.clone()));
            usage.provider = providers[idx]
                .clone()
                .or_else(|| providers.iter().flatten().next().cloned());
        }
        usage.node_breakdown = breakdown;
        usage
    }

    fn collect_items<'a>(&self, value: &'a Value, depth: usize, out: &mut Vec<&'a Value>) {
        if depth > self.max_depth {
            debug!(depth, "node output nested beyond walk limit");
            return;
        }
        match value {
            Value::Array(entries) => {
                for entry in entries {
                    self.collect_items(entry, depth + 1, out);
                }
            }
            Value::Object(map) => match map.get("json") {
                Some(item) if item.is_object() => out.push(item),
                Some(_) => debug!("output item has a non-object json field"),
                None => {
                    for entry in map.values() {
                        self.collect_items(entry, depth + 1, out);
                    }
                }
            },
            _ => {}
        }
    }

    fn tally_item(&self, item: &Value, tally: &mut NodeTally) {
        let matched = self.rules.iter().find_map(|rule| {
            let block = rule.locate(item)?;
            ItemCounts::from_block(block).map(|counts| (block, counts))
        });
        let Some((block, counts)) = matched else {
            return;
        };

        tally.prompt = tally.prompt.saturating_add(counts.prompt);
        tally.completion = tally.completion.saturating_add(counts.completion);
        tally.total = tally.total.saturating_add(counts.total);
        if tally.model.is_none() {
            tally.model = item_model(item).or_else(|| item_model(block));
        }
    }
}

fn follow<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

fn node_types(execution: &Value) -> HashMap<&str, &str> {
    let mut out = HashMap::new();
    let nodes = follow(execution, &["workflowData", "nodes"])
        .or_else(|| follow(execution, &["data", "workflowData", "nodes"]))
        .and_then(Value::as_array);
    for node in nodes.into_iter().flatten() {
        if let (Some(name), Some(kind)) = (
            node.get("name").and_then(Value::as_str),
            node.get("type").and_then(Value::as_str),
        ) {
            out.insert(name, kind);
        }
    }
    out
}

fn first_count(block: &Value, fields: &[&str]) -> Option<u64> {
    fields.iter().find_map(|field| as_count(block.get(*field)?))
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f.round() as u64)
        }),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn item_model(value: &Value) -> Option<String> {
    ITEM_MODEL_PATHS.iter().find_map(|path| {
        let raw = follow(value, path)?;
        let name = match raw {
            Value::String(s) => s.trim(),
            // Resource-locator shape: {"__rl": true, "value": "gpt-4o"}
            Value::Object(_) => raw.get("value")?.as_str()?.trim(),
            _ => return None,
        };
        (!name.is_empty()).then(|| name.to_string())
    })
}

/// Best-effort provider name from the node type identifier.
pub fn infer_provider(node_type: &str) -> Option<String> {
    let lowered = node_type.to_ascii_lowercase();
    const KNOWN: &[(&str, &str)] = &[
        ("azureopenai", "azure-openai"),
        ("openrouter", "openrouter"),
        ("openai", "openai"),
        ("anthropic", "anthropic"),
        ("gemini", "google"),
        ("vertex", "google"),
        ("googlepalm", "google"),
        ("mistral", "mistral"),
        ("groq", "groq"),
        ("ollama", "ollama"),
        ("bedrock", "aws-bedrock"),
        ("deepseek", "deepseek"),
    ];
    KNOWN
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, provider)| provider.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn execution(run_data: Value, nodes: Value) -> Value {
        json!({
            "id": "1001",
            "data": { "resultData": { "runData": run_data } },
            "workflowData": { "nodes": nodes }
        })
    }

    fn run(connection: &str, items: Vec<Value>) -> Value {
        let wrapped: Vec<Value> = items.into_iter().map(|j| json!({ "json": j })).collect();
        json!({ "startTime": 1, "data": { connection: [wrapped] } })
    }

    #[test]
    fn sums_nodes_and_omits_nodes_without_usage() {
        let payload = execution(
            json!({
                "A": [run("ai_languageModel", vec![json!({
                    "tokenUsage": {"promptTokens": 120, "completionTokens": 30, "totalTokens": 150}
                })])],
                "B": [run("main", vec![json!({"text": "no usage here"})])],
                "C": [run("main", vec![json!({
                    "usage": {"prompt_tokens": 50, "completion_tokens": 10}
                })])]
            }),
            json!([
                {"name": "A", "type": "@n8n/n8n-nodes-langchain.lmChatOpenAi"},
                {"name": "B", "type": "n8n-nodes-base.set"},
                {"name": "C", "type": "@n8n/n8n-nodes-langchain.lmChatAnthropic"}
            ]),
        );

        let usage = UsageExtractor::default().extract(&payload);

        assert_eq!(usage.total_tokens, 210);
        assert_eq!(usage.prompt_tokens, 170);
        assert_eq!(usage.completion_tokens, 40);
        let names: Vec<&str> = usage
            .node_breakdown
            .iter()
            .map(|n| n.node_name.as_str())
            .collect();
        assert_eq!(names, vec!["A", "C"]);
        assert_eq!(usage.node_breakdown[1].node_type, "@n8n/n8n-nodes-langchain.lmChatAnthropic");
        assert_eq!(usage.provider.as_deref(), Some("openai"));
    }

    #[test]
    fn first_matching_location_wins_per_item() {
        let payload = execution(
            json!({
                "Agent": [run("main", vec![json!({
                    "tokenUsage": {"promptTokens": 10, "completionTokens": 5},
                    "usage": {"prompt_tokens": 10, "completion_tokens": 5},
                    "response": {"usage": {"prompt_tokens": 99, "completion_tokens": 99}}
                })])]
            }),
            json!([]),
        );

        let usage = UsageExtractor::default().extract(&payload);
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(usage.node_breakdown[0].node_type, "unknown");
    }

    #[test]
    fn falls_through_locations_without_counts() {
        let payload = execution(
            json!({
                "Agent": [run("main", vec![json!({
                    "tokenUsage": {"note": "estimate unavailable"},
                    "metadata": {"tokenUsage": {"inputTokens": 7, "outputTokens": 3}}
                })])]
            }),
            json!([]),
        );

        let usage = UsageExtractor::default().extract(&payload);
        assert_eq!(usage.total_tokens, 10);
    }

    #[test]
    fn single_known_side_becomes_the_total() {
        let payload = execution(
            json!({
                "Embed": [run("main", vec![json!({"usage": {"prompt_tokens": 42, "total_tokens": 99}})])]
            }),
            json!([]),
        );

        let usage = UsageExtractor::default().extract(&payload);
        assert_eq!(usage.prompt_tokens, 42);
        assert_eq!(usage.completion_tokens, 0);
        assert_eq!(usage.total_tokens, 42);
    }

    #[test]
    fn reported_total_is_used_when_no_sides_are_known() {
        let payload = execution(
            json!({
                "Agent": [run("main", vec![json!({"usage": {"total_tokens": "64"}})])]
            }),
            json!([]),
        );
        assert_eq!(UsageExtractor::default().extract(&payload).total_tokens, 64);
    }

    #[test]
    fn totals_equal_prompt_plus_completion_when_both_present() {
        let payload = execution(
            json!({
                "A": [
                    run("main", vec![
                        json!({"usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 1000}}),
                        json!({"tokenUsage": {"promptTokens": 11, "completionTokens": 13}})
                    ]),
                    run("ai_languageModel", vec![
                        json!({"response": {"usage": {"input_tokens": 8, "output_tokens": 1}}})
                    ])
                ]
            }),
            json!([]),
        );

        let usage = UsageExtractor::default().extract(&payload);
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
        assert_eq!(usage.total_tokens, 40);
        for node in &usage.node_breakdown {
            assert_eq!(node.total_tokens, node.prompt_tokens + node.completion_tokens);
        }
    }

    #[test]
    fn payload_without_usage_is_zero_not_error() {
        let payload = execution(
            json!({"Webhook": [run("main", vec![json!({"body": {}})])]}),
            json!([]),
        );
        let usage = UsageExtractor::default().extract(&payload);
        assert_eq!(usage, TokenUsage::default());

        assert_eq!(UsageExtractor::default().extract(&json!({})), TokenUsage::default());
    }

    #[test]
    fn oversized_counts_saturate_instead_of_overflowing() {
        let payload = execution(
            json!({
                "Chat A": [run("ai_languageModel", vec![
                    json!({"usage": {"prompt_tokens": u64::MAX}}),
                    json!({"usage": {"prompt_tokens": 5}}),
                ])],
                "Chat B": [run("ai_languageModel", vec![
                    json!({"usage": {"prompt_tokens": "18446744073709551615", "completion_tokens": 7}}),
                ])],
            }),
            json!([]),
        );

        let usage = UsageExtractor::default().extract(&payload);

        assert_eq!(usage.prompt_tokens, u64::MAX);
        assert_eq!(usage.total_tokens, u64::MAX);
        assert_eq!(usage.completion_tokens, 7);
        assert_eq!(usage.node_breakdown.len(), 2);
    }

    #[test]
    fn malformed_nodes_are_skipped() {
        let payload = execution(
            json!({
                "Broken": "not-a-run-list",
                "NoData": [{"startTime": 1}],
                "Weird": [{"data": {"main": [[{"json": "string"}]]}}],
                "Good": [run("main", vec![json!({"usage": {"prompt_tokens": 1, "completion_tokens": 1}})])]
            }),
            json!([]),
        );

        let usage = UsageExtractor::default().extract(&payload);
        assert_eq!(usage.total_tokens, 2);
        assert_eq!(usage.node_breakdown.len(), 1);
    }

    #[test]
    fn extraction_is_idempotent() {
        let payload = execution(
            json!({
                "Z": [run("main", vec![json!({"usage": {"prompt_tokens": 5, "completion_tokens": 6, "model": "gpt-4o"}})])],
                "A": [run("main", vec![json!({"tokenUsage": {"promptTokens": 1, "completionTokens": 2}, "model": "claude-3-haiku"})])]
            }),
            json!([{"name": "Z", "type": "@n8n/n8n-nodes-langchain.openAi"}]),
        );
        let extractor = UsageExtractor::default();
        let first = serde_json::to_vec(&extractor.extract(&payload)).unwrap();
        let second = serde_json::to_vec(&extractor.extract(&payload)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn picks_model_from_item_or_usage_block() {
        let payload = execution(
            json!({
                "Chat": [run("ai_languageModel", vec![json!({
                    "response": {"model": "gpt-4o-mini"},
                    "tokenUsage": {"promptTokens": 10, "completionTokens": 2}
                })])],
                "Small": [run("main", vec![json!({
                    "usage": {"prompt_tokens": 1, "completion_tokens": 1, "model": "tiny"}
                })])]
            }),
            json!([]),
        );

        let usage = UsageExtractor::default().extract(&payload);
        assert_eq!(usage.model.as_deref(), Some("gpt-4o-mini"));
        let small = usage
            .node_breakdown
            .iter()
            .find(|n| n.node_name == "Small")
            .unwrap();
        assert_eq!(small.model.as_deref(), Some("tiny"));
    }

    #[test]
    fn custom_rules_extend_the_probe_list() {
        let payload = execution(
            json!({
                "Agent": [run("main", vec![json!({"llmOutput": {"tokenUsage": {"promptTokens": 4, "completionTokens": 4}}})])]
            }),
            json!([]),
        );

        assert_eq!(UsageExtractor::default().extract(&payload).total_tokens, 0);
        let extended =
            UsageExtractor::default().push_rule(UsageRule::new(&["llmOutput", "tokenUsage"]));
        assert_eq!(extended.extract(&payload).total_tokens, 8);
    }

    #[test]
    fn walk_stops_at_depth_limit() {
        let deep = json!({"main": [[[[[[[[{"json": {"usage": {"prompt_tokens": 1, "completion_tokens": 1}}}]]]]]]]]});
        let payload = execution(json!({"Deep": [{"data": deep}]}), json!([]));

        assert_eq!(UsageExtractor::default().extract(&payload).total_tokens, 0);
        assert_eq!(
            UsageExtractor::default()
                .with_max_depth(12)
                .extract(&payload)
                .total_tokens,
            2
        );
    }

    #[test]
    fn infers_provider_from_node_type() {
        assert_eq!(
            infer_provider("@n8n/n8n-nodes-langchain.lmChatAzureOpenAi").as_deref(),
            Some("azure-openai")
        );
        assert_eq!(
            infer_provider("@n8n/n8n-nodes-langchain.lmChatGoogleGemini").as_deref(),
            Some("google")
        );
        assert_eq!(infer_provider("n8n-nodes-base.httpRequest"), None);
    }
}
