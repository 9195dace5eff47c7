use crate::error::{AssistantError, Result};
use crate::llm::ChatModel;
use crate::query_engine::QueryEngine;
use crate::vector_db::RetrievedNode;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const FINAL_ANSWER_PREFIX: &str = "Final Answer:";
const OBSERVATION_STOP: &[&str] = &["\nObservation:", "\n\tObservation:"];
pub const ITERATION_LIMIT_MESSAGE: &str = "Agent stopped due to iteration limit.";

const DEFAULT_PREFIX: &str = "You are a dedicated research assistant, designed to help gather and \
analyze research for the topics the user is currently working on. You are polite, friendly, and \
you always remind the user of your purpose when greeted.\n\
Answer the following questions as truthfully and honestly as you can. You have access to the \
following tools:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// Return the tool output as the answer instead of feeding it back to the model.
    #[serde(default)]
    pub return_direct: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub prefix: String,
    pub max_iterations: usize,
    pub tools: Vec<ToolSpec>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            max_iterations: 15,
            tools: vec![
                ToolSpec {
                    name: "Indigenous Narratives & Opioid Crisis Analyzer".to_string(),
                    description: "Useful for answering questions about the opioid crisis and \
                                  First Nations communities."
                        .to_string(),
                    return_direct: true,
                },
                ToolSpec {
                    name: "Science of Storytelling Explorer".to_string(),
                    description: "Designed to delve into the art and science behind effective \
                                  storytelling. Use this to explore the psychological, cultural, \
                                  and neurological aspects of how stories influence, engage, and \
                                  inspire us."
                        .to_string(),
                    return_direct: true,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub text: String,
    pub sources: Vec<RetrievedNode>,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: &str) -> Result<ToolOutput>;
}

#[async_trait]
impl ToolHandler for QueryEngine {
    async fn call(&self, input: &str) -> Result<ToolOutput> {
        let response = self.query(input).await?;
        Ok(ToolOutput {
            text: response.text,
            sources: response.source_nodes,
        })
    }
}

pub struct Tool {
    pub spec: ToolSpec,
    handler: Arc<dyn ToolHandler>,
}

impl Tool {
    pub fn new(spec: ToolSpec, handler: Arc<dyn ToolHandler>) -> Self {
        Tool { spec, handler }
    }
}

/// Plain transcript of completed agent runs.
#[derive(Debug, Default)]
pub struct ConversationMemory {
    turns: Vec<(String, String)>,
}

impl ConversationMemory {
    pub fn save(&mut self, input: &str, output: &str) {
        self.turns.push((input.to_string(), output.to_string()));
    }

    pub fn buffer(&self) -> String {
        self.turns
            .iter()
            .map(|(human, ai)| format!("Human: {human}\nAI: {ai}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub answer: String,
    /// Passages gathered from every tool call during the run.
    pub sources: Vec<RetrievedNode>,
    pub steps: usize,
}

#[derive(Debug, PartialEq)]
enum AgentStep {
    Finish(String),
    Action {
        tool: String,
        input: String,
        log: String,
    },
}

fn parse_output(text: &str) -> AgentStep {
    lazy_static! {
        static ref ACTION: Regex = Regex::new(
            r"(?s)Action\s*\d*\s*:[\s]*(.*?)[\s]*Action\s*\d*\s*Input\s*\d*\s*:[\s]*(.*)"
        )
        .expect("valid regex");
    }

    if let Some(pos) = text.find(FINAL_ANSWER_PREFIX) {
        let answer = text[pos + FINAL_ANSWER_PREFIX.len()..].trim();
        return AgentStep::Finish(answer.to_string());
    }

    if let Some(caps) = ACTION.captures(text) {
        let tool = caps[1].trim().to_string();
        let input = caps[2].trim().trim_matches('"').to_string();
        return AgentStep::Action {
            tool,
            input,
            log: text.trim_end().to_string(),
        };
    }

    // the model answered without following the format
    AgentStep::Finish(text.trim().to_string())
}

/// Zero-shot agent that lets the model choose among research tools.
pub struct Agent {
    model: Arc<dyn ChatModel>,
    tools: Vec<Tool>,
    prefix: String,
    max_iterations: usize,
    memory: ConversationMemory,
}

impl Agent {
    pub fn new(model: Arc<dyn ChatModel>, tools: Vec<Tool>, config: &AgentConfig) -> Result<Self> {
        if tools.is_empty() {
            return Err(AssistantError::Config("agent needs at least one tool".into()));
        }

        Ok(Agent {
            model,
            tools,
            prefix: config.prefix.clone(),
            max_iterations: config.max_iterations.max(1),
            memory: ConversationMemory::default(),
        })
    }

    /// Builds an agent whose configured tools all dispatch to `handler`.
    pub fn from_config(
        model: Arc<dyn ChatModel>,
        config: &AgentConfig,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<Self> {
        let tools = config
            .tools
            .iter()
            .map(|spec| Tool::new(spec.clone(), Arc::clone(&handler)))
            .collect();
        Self::new(model, tools, config)
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut ConversationMemory {
        &mut self.memory
    }

    pub async fn run(&mut self, input: &str) -> Result<AgentOutcome> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AssistantError::EmptyQuery);
        }

        let outcome = self.execute(input).await?;
        self.memory.save(input, &outcome.answer);
        info!(
            steps = outcome.steps,
            sources = outcome.sources.len(),
            memory_turns = self.memory().len(),
            "agent finished"
        );
        Ok(outcome)
    }

    async fn execute(&self, input: &str) -> Result<AgentOutcome> {
        let mut scratchpad = String::new();
        let mut sources = Vec::new();

        for step in 1..=self.max_iterations {
            let prompt = self.build_prompt(input, &scratchpad);
            let output = self.model.complete(&prompt, OBSERVATION_STOP).await?;

            let (tool_name, tool_input, log) = match parse_output(&output) {
                AgentStep::Finish(answer) => {
                    return Ok(AgentOutcome {
                        answer,
                        sources,
                        steps: step,
                    });
                }
                AgentStep::Action { tool, input, log } => (tool, input, log),
            };

            // a blank action input falls back to the user's question
            let tool_input = if tool_input.trim().is_empty() {
                input.to_string()
            } else {
                tool_input
            };

            debug!(step, tool = %tool_name, input = %tool_input, "agent chose action");

            let observation = match self.tools.iter().find(|t| t.spec.name == tool_name) {
                Some(tool) => {
                    let output = tool.handler.call(&tool_input).await?;
                    sources.extend(output.sources);
                    if tool.spec.return_direct {
                        return Ok(AgentOutcome {
                            answer: output.text,
                            sources,
                            steps: step,
                        });
                    }
                    output.text
                }
                None => {
                    warn!(tool = %tool_name, "model requested an unknown tool");
                    format!(
                        "{tool_name} is not a valid tool, try one of [{}].",
                        self.tool_names()
                    )
                }
            };

            scratchpad.push_str(&log);
            scratchpad.push_str(&format!("\nObservation: {observation}\nThought: "));
        }

        warn!(max_iterations = self.max_iterations, "agent hit the iteration limit");
        Ok(AgentOutcome {
            answer: ITERATION_LIMIT_MESSAGE.to_string(),
            sources,
            steps: self.max_iterations,
        })
    }

    fn tool_names(&self) -> String {
        self.tools
            .iter()
            .map(|t| t.spec.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn build_prompt(&self, input: &str, scratchpad: &str) -> String {
        let tool_strings = self
            .tools
            .iter()
            .map(|t| format!("{}: {}", t.spec.name, t.spec.description))
            .collect::<Vec<_>>()
            .join("\n");

        let format_instructions = format!(
            "Use the following format:\n\n\
             Question: the input question you must answer\n\
             Thought: you should always think about what to do\n\
             Action: the action to take, should be one of [{}]\n\
             Action Input: the input to the action\n\
             Observation: the result of the action\n\
             ... (this Thought/Action/Action Input/Observation can repeat N times)\n\
             Thought: I now know the final answer\n\
             Final Answer: the final answer to the original input question",
            self.tool_names()
        );

        let suffix = format!(
            "Begin!\n\n{}\nQuestion: {input}\n{scratchpad}",
            self.memory.buffer()
        );

        [
            self.prefix.as_str(),
            tool_strings.as_str(),
            format_instructions.as_str(),
            suffix.as_str(),
        ]
        .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_engine::tests::{ScriptedModel, sample_retriever};
    use std::sync::Mutex;

    struct StubTool {
        reply: String,
        calls: Mutex<Vec<String>>,
    }

    impl StubTool {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                calls: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl ToolHandler for StubTool {
        async fn call(&self, input: &str) -> Result<ToolOutput> {
            self.calls.lock().unwrap().push(input.to_string());
            Ok(ToolOutput {
                text: self.reply.clone(),
                sources: Vec::new(),
            })
        }
    }

    fn spec(name: &str, return_direct: bool) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: format!("{name} description"),
            return_direct,
        }
    }

    fn agent_with(model: Arc<ScriptedModel>, tool: Arc<StubTool>, return_direct: bool) -> Agent {
        let config = AgentConfig {
            tools: vec![spec("Search", return_direct)],
            max_iterations: 3,
            ..AgentConfig::default()
        };
        Agent::from_config(model, &config, tool).unwrap()
    }

    #[test]
    fn test_parse_final_answer() {
        let step = parse_output("Thought: I know this\nFinal Answer: Forty-two.");
        assert_eq!(step, AgentStep::Finish("Forty-two.".into()));
    }

    #[test]
    fn test_parse_action_strips_quotes() {
        let text = "Thought: look it up\nAction: Search\nAction Input: \"opioid policy\"";
        match parse_output(text) {
            AgentStep::Action { tool, input, log } => {
                assert_eq!(tool, "Search");
                assert_eq!(input, "opioid policy");
                assert!(log.starts_with("Thought: look it up"));
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn test_unformatted_output_is_the_answer() {
        let step = parse_output("Hello! I'm your research assistant.");
        assert_eq!(
            step,
            AgentStep::Finish("Hello! I'm your research assistant.".into())
        );
    }

    #[tokio::test]
    async fn test_return_direct_tool_ends_run() {
        let model = Arc::new(ScriptedModel::new(vec![
            "Thought: use the tool\nAction: Search\nAction Input: overdose trends",
        ]));
        let tool = StubTool::new("Overdoses rose.");
        let mut agent = agent_with(model.clone(), tool.clone(), true);

        let outcome = agent.run("What happened to overdoses?").await.unwrap();
        assert_eq!(outcome.answer, "Overdoses rose.");
        assert_eq!(outcome.steps, 1);
        assert_eq!(tool.calls.lock().unwrap().as_slice(), ["overdose trends"]);
        assert_eq!(model.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_observation_fed_back_until_final_answer() {
        let model = Arc::new(ScriptedModel::new(vec![
            "Thought: search\nAction: Search\nAction Input: stories",
            "Thought: I now know the final answer\nFinal Answer: Stories persuade.",
        ]));
        let tool = StubTool::new("Narrative transportation.");
        let mut agent = agent_with(model.clone(), tool, false);

        let outcome = agent.run("Why do stories work?").await.unwrap();
        assert_eq!(outcome.answer, "Stories persuade.");
        assert_eq!(outcome.steps, 2);

        let second = model.prompt(1);
        assert!(second.contains("Action Input: stories\nObservation: Narrative transportation.\nThought: "));
    }

    #[tokio::test]
    async fn test_unknown_tool_yields_observation() {
        let model = Arc::new(ScriptedModel::new(vec![
            "Action: Calculator\nAction Input: 2+2",
            "Final Answer: done",
        ]));
        let mut agent = agent_with(model.clone(), StubTool::new("unused"), false);

        let outcome = agent.run("add").await.unwrap();
        assert_eq!(outcome.answer, "done");
        assert!(model
            .prompt(1)
            .contains("Calculator is not a valid tool, try one of [Search]."));
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let loop_reply = "Action: Search\nAction Input: again";
        let model = Arc::new(ScriptedModel::new(vec![loop_reply, loop_reply, loop_reply]));
        let mut agent = agent_with(model.clone(), StubTool::new("nothing"), false);

        let outcome = agent.run("loop forever").await.unwrap();
        assert_eq!(outcome.answer, ITERATION_LIMIT_MESSAGE);
        assert_eq!(outcome.steps, 3);
        assert_eq!(model.prompts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_memory_carries_previous_turns() {
        let model = Arc::new(ScriptedModel::new(vec![
            "Final Answer: Hi, I help with research.",
            "Final Answer: Sure.",
        ]));
        let mut agent = agent_with(model.clone(), StubTool::new("unused"), true);

        agent.run("Hello").await.unwrap();
        agent.run("Can you help?").await.unwrap();

        assert_eq!(agent.memory().len(), 2);
        assert!(model
            .prompt(1)
            .contains("Human: Hello\nAI: Hi, I help with research.\nQuestion: Can you help?"));

        agent.memory_mut().clear();
        assert_eq!(agent.memory().buffer(), "");
    }

    #[tokio::test]
    async fn test_query_engine_tool_returns_sources() {
        let agent_model = Arc::new(ScriptedModel::new(vec![
            "Action: Indigenous Narratives & Opioid Crisis Analyzer\nAction Input: opioid deaths",
        ]));
        let engine_model = Arc::new(ScriptedModel::new(vec!["They doubled."]));
        let engine = QueryEngine::new(sample_retriever(), engine_model);

        let mut agent =
            Agent::from_config(agent_model.clone(), &AgentConfig::default(), Arc::new(engine))
                .unwrap();

        let outcome = agent.run("What about opioid deaths?").await.unwrap();
        assert_eq!(outcome.answer, "They doubled.");
        assert_eq!(outcome.sources.len(), 1);
        assert_eq!(outcome.sources[0].id, "health");

        let prompt = agent_model.prompt(0);
        assert!(prompt.contains("Science of Storytelling Explorer: Designed to delve"));
        assert!(prompt.contains("should be one of [Indigenous Narratives & Opioid Crisis Analyzer, Science of Storytelling Explorer]"));
    }

    #[tokio::test]
    async fn test_blank_action_input_uses_the_question() {
        let model = Arc::new(ScriptedModel::new(vec![
            "Thought: search\nAction: Search\nAction Input: \"\"",
            "Final Answer: Found it.",
        ]));
        let tool = StubTool::new("Some passage.");
        let mut agent = agent_with(model, tool.clone(), false);

        let outcome = agent.run("What changed in 2021?").await.unwrap();
        assert_eq!(outcome.answer, "Found it.");
        assert_eq!(tool.calls.lock().unwrap().as_slice(), ["What changed in 2021?"]);
    }

    #[tokio::test]
    async fn test_blank_action_input_reaches_query_engine() {
        let agent_model = Arc::new(ScriptedModel::new(vec![
            "Action: Indigenous Narratives & Opioid Crisis Analyzer\nAction Input: \"\"",
        ]));
        let engine_model = Arc::new(ScriptedModel::new(vec!["They doubled."]));
        let engine = QueryEngine::new(sample_retriever(), engine_model.clone());

        let mut agent =
            Agent::from_config(agent_model, &AgentConfig::default(), Arc::new(engine)).unwrap();

        let outcome = agent.run("How did opioid deaths change?").await.unwrap();
        assert_eq!(outcome.answer, "They doubled.");
        assert!(engine_model
            .prompt(0)
            .contains("Query: How did opioid deaths change?"));
    }

    #[test]
    fn test_agent_requires_tools() {
        let config = AgentConfig {
            tools: vec![],
            ..AgentConfig::default()
        };
        let model = Arc::new(ScriptedModel::new(vec![]));
        assert!(Agent::from_config(model, &config, StubTool::new("x")).is_err());
    }
}
