use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use gauntlet_core::traits::ProviderGateway;
use gauntlet_core::types::{ProviderError, ProviderRequest, ProviderResponse};

type Reply = std::result::Result<String, ProviderError>;

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCall {
    pub provider: String,
    pub stage_id: String,
    pub prompt: String,
}

#[derive(Default)]
struct Script {
    /// stage id -> replies consumed in order.
    queued: HashMap<String, VecDeque<Reply>>,
    /// stage id -> reply once the queue is empty.
    fallback: HashMap<String, String>,
    /// stage id -> simulated latency.
    latency: HashMap<String, Duration>,
    calls: Vec<ScriptedCall>,
}

/// Offline gateway replying from a script keyed by stage id.
///
/// Used by `gauntlet demo` and by tests. Stages with nothing scripted get `{}`.
pub struct ScriptedGateway {
    script: Mutex<Script>,
    /// When set, only these providers exist.
    providers: Option<HashSet<String>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            providers: None,
        }
    }

    /// Canned replies for the built-in review pipeline.
    pub fn demo() -> Self {
        Self::new()
            .respond(
                "analysis",
                r#"{"analysis": "The calculator divides without guarding against zero.",
"issues": ["divide() raises ZeroDivisionError for b == 0", "calculate_average() fails on an empty list"],
"recommendations": ["Validate the divisor", "Return None for empty input"]}"#,
            )
            .respond(
                "enhancement",
                r#"{"changes": [{"file": "calculator.py", "description": "Guard divide() and calculate_average() against empty or zero input"}],
"summary": "Added input validation to both arithmetic helpers."}"#,
            )
            .respond(
                "review",
                r#"```json
{"score": 8, "notes": "Validation is correct; consider raising ValueError instead of returning None."}
```"#,
            )
            .respond(
                "verification",
                r#"{"verdict": "approved", "summary": "Changes address every reported issue without regressions."}"#,
            )
    }

    /// Reply used for `stage_id` once its queue is drained.
    pub fn respond(self, stage_id: &str, text: &str) -> Self {
        self.lock().fallback.insert(stage_id.to_string(), text.to_string());
        self
    }

    /// Queue one reply (or error) for `stage_id`.
    pub fn enqueue(self, stage_id: &str, reply: Reply) -> Self {
        self.lock()
            .queued
            .entry(stage_id.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Delay every call for `stage_id` by `latency`.
    pub fn latency(self, stage_id: &str, latency: Duration) -> Self {
        self.lock().latency.insert(stage_id.to_string(), latency);
        self
    }

    /// Restrict the set of known providers.
    pub fn with_providers<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.providers = Some(providers.into_iter().map(Into::into).collect());
        self
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, stage_id: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.stage_id == stage_id)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderGateway for ScriptedGateway {
    fn call(
        &self,
        provider_id: &str,
        request: ProviderRequest,
    ) -> BoxFuture<'_, std::result::Result<ProviderResponse, ProviderError>> {
        let (reply, latency) = {
            let mut script = self.lock();
            script.calls.push(ScriptedCall {
                provider: provider_id.to_string(),
                stage_id: request.stage_id.clone(),
                prompt: request.prompt.clone(),
            });
            let queued = script
                .queued
                .get_mut(&request.stage_id)
                .and_then(VecDeque::pop_front);
            let reply = match queued {
                Some(reply) => reply,
                None => Ok(script
                    .fallback
                    .get(&request.stage_id)
                    .cloned()
                    .unwrap_or_else(|| "{}".to_string())),
            };
            (reply, script.latency.get(&request.stage_id).copied())
        };
        let model = format!("scripted/{provider_id}");

        Box::pin(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            reply.map(|text| ProviderResponse {
                text,
                model: Some(model),
                ..Default::default()
            })
        })
    }

    fn has_provider(&self, provider_id: &str) -> bool {
        self.providers
            .as_ref()
            .map_or(true, |p| p.contains(provider_id))
    }
}
