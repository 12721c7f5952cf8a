//! Prompt context assembly from the knowledge tiers and retrieval.

use crate::error::Result;
use crate::retrieval::{Retriever, SearchOptions};
use crate::tiers::{KnowledgeTier, TierFiles};
use tracing::warn;

/// Returned when no tier has content and retrieval found nothing.
pub const EMPTY_CONTEXT: &str = "No context available yet.";

const SECTION_SEPARATOR: &str = "\n\n---\n\n";

pub struct ContextAssembler {
    files: TierFiles,
    retriever: Option<Retriever>,
    top_k: usize,
}

impl ContextAssembler {
    pub fn new(files: TierFiles) -> Self {
        Self {
            files,
            retriever: None,
            top_k: 5,
        }
    }

    pub fn with_retriever(mut self, retriever: Retriever, top_k: usize) -> Self {
        self.retriever = Some(retriever);
        self.top_k = top_k.max(1);
        self
    }

    /// Tier sections followed by chunks relevant to `task`, separated by
    /// horizontal rules. Retrieval failures drop only the relevance section.
    pub async fn assemble(&self, task: Option<&str>) -> Result<String> {
        let mut parts = Vec::new();

        for (tier, title) in [
            (KnowledgeTier::Guardrails, "Guardrails"),
            (KnowledgeTier::Style, "Style"),
            (KnowledgeTier::Recent, "Recent Sessions"),
        ] {
            let content = self.files.read_tier(tier)?;
            let content = content.trim();
            if !content.is_empty() {
                parts.push(format!("## {title}\n\n{content}"));
            }
        }

        if let (Some(task), Some(retriever)) = (task.filter(|t| !t.trim().is_empty()), &self.retriever) {
            match retriever.search(task, SearchOptions::default().top_k(self.top_k)).await {
                Ok(hits) if !hits.is_empty() => {
                    let relevant = hits
                        .iter()
                        .map(|hit| format!("- {}", hit.chunk.content))
                        .collect::<Vec<_>>()
                        .join("\n");
                    parts.push(format!("## Relevant to \"{task}\"\n\n{relevant}"));
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "Retrieval failed, assembling tiers only"),
            }
        }

        if parts.is_empty() {
            return Ok(EMPTY_CONTEXT.to_string());
        }
        Ok(parts.join(SECTION_SEPARATOR))
    }
}
