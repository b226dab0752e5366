//! Scripted [`CommandRunner`] for unit tests.
//!
//! Rules match on a substring of the full command line (`<bin> <args..>`).
//! The first matching rule answers. A rule built with a sequence hands out
//! its responses in order and then keeps repeating the last one. Calls that
//! match no rule succeed with empty output.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::cli::{Cli, CommandOutput, CommandRunner};
use crate::error::E2eResult;

struct Rule {
    pattern: String,
    responses: VecDeque<CommandOutput>,
}

#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call containing `pattern` with `output`.
    #[must_use]
    pub fn on(self, pattern: &str, output: CommandOutput) -> Self {
        self.on_sequence(pattern, vec![output])
    }

    /// Answer calls containing `pattern` with `outputs` in order.
    #[must_use]
    pub fn on_sequence(self, pattern: &str, outputs: Vec<CommandOutput>) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                pattern: pattern.to_string(),
                responses: outputs.into(),
            });
        }
        self
    }

    /// Command lines seen so far, without the binary.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Calls whose command line contains `pattern`.
    #[must_use]
    pub fn calls_matching(&self, pattern: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.contains(pattern))
            .collect()
    }

    /// Wrap into a namespaced [`Cli`] sharing this runner.
    #[must_use]
    pub fn into_cli(self: Arc<Self>, namespace: &str) -> Cli {
        Cli::new("oc", self).with_namespace(namespace)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> E2eResult<CommandOutput> {
        let line = args.join(" ");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line.clone());
        }
        let full = format!("{program} {line}");
        let Ok(mut rules) = self.rules.lock() else {
            return Ok(CommandOutput::ok(""));
        };
        let response = rules
            .iter_mut()
            .find(|rule| full.contains(&rule.pattern))
            .and_then(|rule| {
                if rule.responses.len() > 1 {
                    rule.responses.pop_front()
                } else {
                    rule.responses.front().cloned()
                }
            });
        Ok(response.unwrap_or_else(|| CommandOutput::ok("")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_then_repeat() {
        // the namespace flag sits between verb and args, so patterns match the tail
        let runner = Arc::new(ScriptedRunner::new().on_sequence(
            "pvc a",
            vec![CommandOutput::ok("Pending"), CommandOutput::ok("Bound")],
        ));
        let cli = runner.clone().into_cli("ns");
        for expected in ["Pending", "Bound", "Bound"] {
            let out = cli.run("get").args(["pvc", "a"]).output().await.unwrap();
            assert_eq!(out, expected);
        }
        assert_eq!(runner.calls().len(), 3);
        assert_eq!(runner.calls()[0], "get --namespace=ns pvc a");
    }

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("pvc a", CommandOutput::ok("first"))
                .on("pvc", CommandOutput::ok("second")),
        );
        let cli = runner.clone().into_cli("ns");
        let out = cli.run("get").args(["pvc", "a"]).output().await.unwrap();
        assert_eq!(out, "first");
        let out = cli.run("get").args(["pvc", "b"]).output().await.unwrap();
        assert_eq!(out, "second");
        assert_eq!(runner.calls_matching("pvc b").len(), 1);
    }
}
