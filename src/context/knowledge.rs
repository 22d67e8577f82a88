use crate::llm::LanguageModel;
use crate::store::Store;

const SIMILARITY_THRESHOLD: f32 = 0.5;
const CHUNK_SEPARATOR: &str = "\n\n---\n\n";

/// The `limit` chunks of `source_ids` closest to `query`, joined into one
/// block. `None` when there is nothing to inject or the query cannot be
/// embedded. Falls back to unranked chunks when vector search fails.
pub async fn search(
    store: &dyn Store,
    llm: &dyn LanguageModel,
    source_ids: &[String],
    query: &str,
    limit: usize,
) -> Option<String> {
    if source_ids.is_empty() {
        return None;
    }

    let embedding = match llm.embed(query).await {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!("Could not embed knowledge query: {e}");
            return None;
        }
    };

    let chunks = match store
        .match_knowledge_chunks(&embedding, source_ids, limit, SIMILARITY_THRESHOLD)
        .await
    {
        Ok(chunks) => chunks,
        Err(e) => {
            tracing::warn!("Vector search failed, using unranked chunks: {e}");
            match store.knowledge_chunks(source_ids, limit).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    tracing::error!("Failed to load knowledge chunks: {e}");
                    return None;
                }
            }
        }
    };

    if chunks.is_empty() {
        tracing::debug!("No relevant knowledge chunks");
        return None;
    }
    tracing::info!(count = chunks.len(), "Knowledge chunks found");
    Some(
        chunks
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join(CHUNK_SEPARATOR),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryStore, StoredChunk};
    use crate::testing::ScriptedModel;

    fn chunk(source: &str, content: &str, embedding: Vec<f32>) -> StoredChunk {
        StoredChunk {
            knowledge_source_id: source.into(),
            content: content.into(),
            embedding,
        }
    }

    #[tokio::test]
    async fn relevant_chunks_are_joined() {
        let store = MemoryStore::default();
        store
            .with(|t| {
                t.knowledge_chunks = vec![
                    chunk("ks1", "Open 9 to 5.", vec![1.0, 0.0, 0.0]),
                    chunk("ks1", "Unrelated.", vec![0.0, 1.0, 0.0]),
                    chunk("ks2", "Parking in back.", vec![0.9, 0.1, 0.0]),
                    chunk("other", "Not ours.", vec![1.0, 0.0, 0.0]),
                ]
            })
            .await;
        let llm = ScriptedModel::replying("");
        let ids = vec!["ks1".to_string(), "ks2".to_string()];

        let found = search(&store, &llm, &ids, "hours?", 3).await.unwrap();
        assert_eq!(found, "Open 9 to 5.\n\n---\n\nParking in back.");
    }

    #[tokio::test]
    async fn nothing_to_search() {
        let store = MemoryStore::default();
        let llm = ScriptedModel::replying("");
        assert_eq!(search(&store, &llm, &[], "hours?", 3).await, None);
        assert_eq!(search(&store, &llm, &["ks1".to_string()], "hours?", 3).await, None);

        let failing = ScriptedModel::failing();
        store
            .with(|t| t.knowledge_chunks = vec![chunk("ks1", "Open 9 to 5.", vec![1.0, 0.0, 0.0])])
            .await;
        assert_eq!(
            search(&store, &failing, &["ks1".to_string()], "hours?", 3).await,
            None,
            "no embedding, no search"
        );
    }
}
