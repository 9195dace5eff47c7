use crate::error::{AssistantError, Result};
use crate::llm::ChatModel;
use crate::retriever::Retriever;
use crate::vector_db::RetrievedNode;
use std::sync::Arc;
use tracing::{debug, info};

/// Synthesized answer plus the passages it was grounded in, in retrieval order.
#[derive(Debug, Clone)]
pub struct Response {
    pub text: String,
    pub source_nodes: Vec<RetrievedNode>,
}

#[derive(Clone)]
pub struct QueryEngine {
    retriever: Retriever,
    model: Arc<dyn ChatModel>,
}

impl QueryEngine {
    pub fn new(retriever: Retriever, model: Arc<dyn ChatModel>) -> Self {
        QueryEngine { retriever, model }
    }

    pub async fn query(&self, query: &str) -> Result<Response> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AssistantError::EmptyQuery);
        }

        let source_nodes = self.retriever.retrieve(query);
        info!(
            top_k = self.retriever.top_k(),
            retrieved = source_nodes.len(),
            "retrieved context"
        );
        for node in &source_nodes {
            debug!(id = %node.id, score = node.score, "context passage");
        }

        let prompt = construct_prompt(query, &source_nodes);
        let text = self.model.complete(&prompt, &[]).await?;

        Ok(Response {
            text: text.trim().to_string(),
            source_nodes,
        })
    }
}

fn construct_prompt(query: &str, nodes: &[RetrievedNode]) -> String {
    let context_str = if nodes.is_empty() {
        "(no relevant passages were found)".to_string()
    } else {
        nodes
            .iter()
            .enumerate()
            .map(|(i, node)| format!("[{}] {}\n{}", i + 1, provenance(node), node.text.trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    format!(
        "Context information is below.\n\
         ---------------------\n\
         {context_str}\n\
         ---------------------\n\
         Given the context information and not prior knowledge, answer the query.\n\
         Query: {query}\n\
         Answer: "
    )
}

fn provenance(node: &RetrievedNode) -> String {
    let mut parts = vec![format!("title: {}", node.title().unwrap_or("Untitled"))];
    if let Some(page) = node.page_number() {
        parts.push(format!("page: {page}"));
    }
    if let Some(doc) = node.document_id() {
        parts.push(format!("document: {doc}"));
    }
    parts.join(", ")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::vector_db::{Node, VectorDB};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned completions and records every prompt it was given.
    #[derive(Default)]
    pub(crate) struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String>>>,
        pub(crate) prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        pub(crate) fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().map(|r| Ok(r.to_string())).collect()),
                prompts: Mutex::default(),
            }
        }

        pub(crate) fn failing(err: AssistantError) -> Self {
            Self::from_results(vec![Err(err)])
        }

        pub(crate) fn from_results(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::default(),
            }
        }

        pub(crate) fn prompt(&self, i: usize) -> String {
            self.prompts.lock().unwrap()[i].clone()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, prompt: &str, _stop: &[&str]) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("no more scripted replies".to_string()))
        }
    }

    pub(crate) fn sample_retriever() -> Retriever {
        let db = VectorDB::from_nodes(vec![
            Node {
                id: "health".into(),
                text: "Opioid deaths in First Nations communities doubled between 2019 and 2021.".into(),
                metadata: [
                    ("title".to_string(), json!("Community Health Report")),
                    ("page_number".to_string(), json!(7)),
                ]
                .into_iter()
                .collect(),
            },
            Node {
                id: "story".into(),
                text: "Narrative transportation explains why stories persuade.".into(),
                metadata: Default::default(),
            },
        ]);
        Retriever::new(db, 1)
    }

    #[tokio::test]
    async fn test_query_grounds_prompt_in_retrieved_passages() {
        let model = Arc::new(ScriptedModel::new(vec!["  Deaths doubled.  "]));
        let engine = QueryEngine::new(sample_retriever(), model.clone());

        let response = engine.query("How did opioid deaths change?").await.unwrap();
        assert_eq!(response.text, "Deaths doubled.");
        assert_eq!(response.source_nodes.len(), 1);
        assert_eq!(response.source_nodes[0].id, "health");

        let prompt = model.prompt(0);
        assert!(prompt.contains("[1] title: Community Health Report, page: 7"));
        assert!(prompt.contains("doubled between 2019 and 2021"));
        assert!(prompt.contains("Query: How did opioid deaths change?"));
        assert!(!prompt.contains("Narrative transportation"));
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected_without_calling_model() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let engine = QueryEngine::new(sample_retriever(), model.clone());

        let err = engine.query("   ").await.unwrap_err();
        assert!(matches!(err, AssistantError::EmptyQuery));
        assert!(model.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_propagates() {
        let model = Arc::new(ScriptedModel::failing(AssistantError::RateLimited(
            "slow down".into(),
        )));
        let engine = QueryEngine::new(sample_retriever(), model);

        let err = engine.query("stories").await.unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_prompt_without_context() {
        let prompt = construct_prompt("anything?", &[]);
        assert!(prompt.contains("(no relevant passages were found)"));
        assert!(prompt.ends_with("Answer: "));
    }
}
