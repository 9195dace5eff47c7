use crate::history::ChatMessage;
use crate::vector_db::RetrievedNode;
use std::path::Path;

pub fn format_source(index: usize, node: &RetrievedNode) -> String {
    let title = node.title().unwrap_or("Untitled");
    match node.page_number() {
        Some(page) => format!("[{index}] {title}, page {page} (score {:.2})", node.score),
        None => format!("[{index}] {title} (score {:.2})", node.score),
    }
}

/// Answer text followed by a numbered source list, if there are sources.
pub fn format_answer(text: &str, sources: &[RetrievedNode]) -> String {
    let mut out = text.trim().to_string();
    if sources.is_empty() {
        return out;
    }

    out.push_str("\n\nSources:");
    for (i, node) in sources.iter().enumerate() {
        out.push('\n');
        out.push_str(&format_source(i + 1, node));
    }
    out
}

pub fn format_message(message: &ChatMessage) -> String {
    format!(
        "[{}] {}: {}",
        message.timestamp.format("%Y-%m-%d %H:%M:%S"),
        message.role,
        message.content
    )
}

pub fn index_load_message(storage_dir: &Path) -> String {
    format!(
        "Could not load the knowledge base from '{}'. Check that the index exists, then reload.",
        storage_dir.display()
    )
}

pub fn rate_limit_message() -> &'static str {
    "The language model is rate limited right now. Please wait a moment and try again."
}
