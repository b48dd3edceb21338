//! TF-IDF full-text index over a namespaced key-value store.
//!
//! Keyspace, under the configured prefix:
//! - `doc:{id}:tokens` — JSON token-frequency map for one post
//! - `doc:count`       — number of indexed posts
//! - `token:{T}:docs`  — set of post ids containing token `T`
//!
//! Every mutation and every scoring read runs as one pipelined batch.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::analyzer::analyze;
use crate::error::ServiceError;
use crate::kv::{IndexStore, PipeCmd};

type TokenFreq = HashMap<String, u32>;

pub struct FullTextIndex {
    store: Arc<dyn IndexStore>,
    prefix: String,
}

fn token_frequency(tokens: &[String]) -> TokenFreq {
    let mut freq = TokenFreq::new();
    for token in tokens {
        *freq.entry(token.clone()).or_insert(0) += 1;
    }
    freq
}

impl FullTextIndex {
    pub fn new(store: Arc<dyn IndexStore>, prefix: impl Into<String>) -> Self {
        FullTextIndex { store, prefix: prefix.into() }
    }

    fn doc_count_key(&self) -> String {
        format!("{}doc:count", self.prefix)
    }

    fn doc_tokens_key(&self, id: i64) -> String {
        format!("{}doc:{}:tokens", self.prefix, id)
    }

    fn token_docs_key(&self, token: &str) -> String {
        format!("{}token:{}:docs", self.prefix, token)
    }

    pub fn is_indexed(&self, id: i64) -> Result<bool, ServiceError> {
        Ok(self.store.get(&self.doc_tokens_key(id))?.is_some())
    }

    pub fn doc_count(&self) -> Result<i64, ServiceError> {
        let raw = self.store.get(&self.doc_count_key())?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Indexes a new document. Delegates to `reindex` for known ids and
    /// no-ops when analysis yields nothing.
    pub fn index(&self, id: i64, text: &str) -> Result<(), ServiceError> {
        if self.is_indexed(id)? {
            return self.reindex(id, text);
        }

        let tokens = analyze(text);
        if tokens.is_empty() {
            return Ok(());
        }
        let freq = token_frequency(&tokens);

        let mut cmds = vec![
            PipeCmd::Set(self.doc_tokens_key(id), serialize_tokens(&freq)?),
            PipeCmd::Incr(self.doc_count_key()),
        ];
        for token in freq.keys() {
            cmds.push(PipeCmd::SetAdd(self.token_docs_key(token), id.to_string()));
        }
        self.store.pipeline(&cmds)?;
        Ok(())
    }

    /// Replaces the stored tokens of an indexed document, adjusting only the
    /// posting sets whose membership changed. `doc:count` stays untouched.
    pub fn reindex(&self, id: i64, text: &str) -> Result<(), ServiceError> {
        if !self.is_indexed(id)? {
            return self.index(id, text);
        }

        let tokens = analyze(text);
        if tokens.is_empty() {
            return self.deindex(id);
        }
        let new_freq = token_frequency(&tokens);
        let old_freq = self.load_tokens(id)?;

        let mut cmds = vec![PipeCmd::Set(self.doc_tokens_key(id), serialize_tokens(&new_freq)?)];
        for token in old_freq.keys().filter(|t| !new_freq.contains_key(*t)) {
            cmds.push(PipeCmd::SetRemove(self.token_docs_key(token), id.to_string()));
        }
        for token in new_freq.keys().filter(|t| !old_freq.contains_key(*t)) {
            cmds.push(PipeCmd::SetAdd(self.token_docs_key(token), id.to_string()));
        }
        self.store.pipeline(&cmds)?;
        Ok(())
    }

    /// Removes every trace of a document from the index.
    pub fn deindex(&self, id: i64) -> Result<(), ServiceError> {
        let freq = self.load_tokens(id)?;

        let mut cmds = vec![
            PipeCmd::Del(vec![self.doc_tokens_key(id)]),
            PipeCmd::Decr(self.doc_count_key()),
        ];
        for token in freq.keys() {
            cmds.push(PipeCmd::SetRemove(self.token_docs_key(token), id.to_string()));
        }
        self.store.pipeline(&cmds)?;
        Ok(())
    }

    /// Deletes the whole keyspace under the prefix. `doc:count` is covered
    /// by the `doc:` pattern.
    pub fn clear_all_indexes(&self) -> Result<(), ServiceError> {
        for pattern in [format!("{}doc:*", self.prefix), format!("{}token:*", self.prefix)] {
            let keys = self.store.keys(&pattern)?;
            if !keys.is_empty() {
                self.store.delete(&keys)?;
            }
        }
        Ok(())
    }

    /// Runs a query. `partial` unions the per-token posting sets instead of
    /// intersecting them. Returns the analyzed query tokens together with
    /// `(id, score)` pairs sorted by score, ties broken by id descending.
    /// `limit == 0` means unlimited.
    pub fn search(
        &self,
        query: &str,
        partial: bool,
        limit: usize,
    ) -> Result<(Vec<String>, Vec<(i64, f64)>), ServiceError> {
        let tokens = analyze(query);
        if tokens.is_empty() {
            return Ok((tokens, Vec::new()));
        }

        let mut candidates: Option<HashSet<i64>> = None;
        for token in &tokens {
            let members = self.store.set_members(&self.token_docs_key(token))?;
            let ids: HashSet<i64> = members.iter().filter_map(|m| m.parse().ok()).collect();
            candidates = Some(match candidates {
                None => ids,
                Some(acc) if partial => acc.union(&ids).copied().collect(),
                Some(acc) => acc.intersection(&ids).copied().collect(),
            });
        }

        let ids: Vec<i64> = candidates.unwrap_or_default().into_iter().collect();
        if ids.is_empty() {
            return Ok((tokens, Vec::new()));
        }

        let mut ranked = self.rank(&tokens, &ids)?;
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(b.0.cmp(&a.0))
        });
        if limit > 0 && ranked.len() > limit {
            ranked.truncate(limit);
        }
        Ok((tokens, ranked))
    }

    /// TF-IDF with length normalization and query-coverage weighting. All
    /// reads happen in one pipeline: `doc:count`, one token map per
    /// candidate, one posting-set cardinality per query token.
    fn rank(&self, tokens: &[String], ids: &[i64]) -> Result<Vec<(i64, f64)>, ServiceError> {
        let mut cmds = vec![PipeCmd::Get(self.doc_count_key())];
        for id in ids {
            cmds.push(PipeCmd::Get(self.doc_tokens_key(*id)));
        }
        for token in tokens {
            cmds.push(PipeCmd::SetCard(self.token_docs_key(token)));
        }
        let replies = self.store.pipeline(&cmds)?;

        let total_docs = replies[0].as_int().unwrap_or(0) as f64;
        let freqs: Vec<TokenFreq> = replies[1..=ids.len()]
            .iter()
            .map(|reply| {
                reply
                    .as_str()
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .unwrap_or_default()
            })
            .collect();
        let doc_freqs: Vec<f64> = replies[1 + ids.len()..]
            .iter()
            .map(|reply| reply.as_int().unwrap_or(0) as f64)
            .collect();

        let mut results = Vec::with_capacity(ids.len());
        for (id, freq) in ids.iter().zip(&freqs) {
            let mut score = 0.0;
            let mut matching_terms = 0usize;

            for (token, df) in tokens.iter().zip(&doc_freqs) {
                let tf = f64::from(freq.get(token).copied().unwrap_or(0));
                if tf > 0.0 {
                    matching_terms += 1;
                }
                // 1 + log(tf) dampens high-frequency terms.
                let normalized_tf = if tf > 0.0 { 1.0 + tf.log10() } else { 0.0 };
                let idf = if *df > 0.0 { (total_docs / df).max(1.0).log10() } else { 0.0 };
                score += normalized_tf * idf;
            }

            // Length normalization, so long documents get no free advantage.
            let total_terms: u32 = freq.values().sum();
            if total_terms > 0 {
                score /= f64::from(total_terms).sqrt();
            }

            // Weight documents covering the whole query.
            let coverage = matching_terms as f64 / tokens.len() as f64;
            if coverage == 1.0 {
                score *= 2.0;
            } else {
                score *= coverage;
            }

            results.push((*id, score));
        }
        Ok(results)
    }

    fn load_tokens(&self, id: i64) -> Result<TokenFreq, ServiceError> {
        let raw = self.store.get(&self.doc_tokens_key(id))?.ok_or_else(|| {
            ServiceError::InvariantViolation(format!("no stored token map for post {id}"))
        })?;
        let freq: TokenFreq = serde_json::from_str(&raw).map_err(|err| {
            ServiceError::InvariantViolation(format!("corrupt token map for post {id}: {err}"))
        })?;
        if freq.is_empty() {
            return Err(ServiceError::InvariantViolation(format!(
                "empty token map for post {id}"
            )));
        }
        Ok(freq)
    }
}

fn serialize_tokens(freq: &TokenFreq) -> Result<String, ServiceError> {
    serde_json::to_string(freq)
        .map_err(|err| ServiceError::Internal(format!("token map serialization failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryIndexStore;

    fn index() -> FullTextIndex {
        FullTextIndex::new(Arc::new(MemoryIndexStore::new()), "test:")
    }

    #[test]
    fn indexes_chinese_html() {
        let idx = index();
        idx.index(1, "<p>这是一个<strong>测试</strong>文档</p>").unwrap();

        assert!(idx.is_indexed(1).unwrap());
        assert_eq!(idx.doc_count().unwrap(), 1);

        let (_, results) = idx.search("测试", true, 0).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, 1);
        assert!(results[0].1 > 0.0);
    }

    #[test]
    fn punctuation_only_text_is_not_indexed() {
        let idx = index();
        idx.index(1, "").unwrap();
        idx.index(2, "!@#$%^&*()").unwrap();

        assert!(!idx.is_indexed(1).unwrap());
        assert!(!idx.is_indexed(2).unwrap());
        assert_eq!(idx.doc_count().unwrap(), 0);
    }

    #[test]
    fn reindex_swaps_tokens_and_keeps_doc_count() {
        let idx = index();
        idx.index(1, "hello world python").unwrap();
        idx.reindex(1, "hello advanced").unwrap();

        assert_eq!(idx.doc_count().unwrap(), 1);
        let (_, gone) = idx.search("world", true, 0).unwrap();
        assert!(gone.is_empty());
        let (_, kept) = idx.search("advanced", true, 0).unwrap();
        assert_eq!(kept[0].0, 1);
    }

    #[test]
    fn reindex_of_unknown_id_falls_back_to_index() {
        let idx = index();
        idx.reindex(7, "fresh content").unwrap();
        assert!(idx.is_indexed(7).unwrap());
        assert_eq!(idx.doc_count().unwrap(), 1);
    }

    #[test]
    fn reindex_to_empty_text_deindexes() {
        let idx = index();
        idx.index(1, "short lived").unwrap();
        idx.reindex(1, "...").unwrap();
        assert!(!idx.is_indexed(1).unwrap());
        assert_eq!(idx.doc_count().unwrap(), 0);
    }

    #[test]
    fn deindex_round_trip_restores_the_keyspace() {
        let idx = index();
        idx.index(1, "hello world").unwrap();
        idx.deindex(1).unwrap();

        assert!(!idx.is_indexed(1).unwrap());
        assert_eq!(idx.doc_count().unwrap(), 0);
        let (_, results) = idx.search("hello world", true, 0).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn deindex_twice_is_an_invariant_violation() {
        let idx = index();
        idx.index(1, "once only").unwrap();
        idx.deindex(1).unwrap();
        assert!(matches!(
            idx.deindex(1),
            Err(ServiceError::InvariantViolation(_))
        ));
    }

    #[test]
    fn ranking_orders_by_relevance() {
        let idx = index();
        idx.index(1, "python great programming python many python").unwrap();
        idx.index(2, "python programming concepts").unwrap();
        idx.index(3, "another python once").unwrap();
        idx.index(4, "unrelated").unwrap();

        let (_, results) = idx.search("python programming", true, 0).unwrap();
        let ids: Vec<i64> = results.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&4));
        // Full-coverage docs above the partial match, scores strictly falling.
        assert_eq!(*ids.last().unwrap(), 3);
        assert!(results[0].1 > results[1].1);
        assert!(results[1].1 > results[2].1);
    }

    #[test]
    fn partial_results_contain_exact_results() {
        let idx = index();
        idx.index(1, "rust tokio async").unwrap();
        idx.index(2, "rust sync only").unwrap();
        idx.index(3, "tokio by itself").unwrap();

        let (_, exact) = idx.search("rust tokio", false, 0).unwrap();
        let (_, partial) = idx.search("rust tokio", true, 0).unwrap();

        let exact_ids: HashSet<i64> = exact.iter().map(|(id, _)| *id).collect();
        let partial_ids: HashSet<i64> = partial.iter().map(|(id, _)| *id).collect();
        assert!(exact_ids.is_subset(&partial_ids));
        assert_eq!(exact_ids, HashSet::from([1]));
        assert_eq!(partial_ids, HashSet::from([1, 2, 3]));
    }

    #[test]
    fn limit_truncates_ranked_results() {
        let idx = index();
        for id in 1..=5 {
            idx.index(id, "repeated topic").unwrap();
        }
        let (_, results) = idx.search("topic", true, 3).unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn empty_query_returns_nothing() {
        let idx = index();
        idx.index(1, "something").unwrap();
        let (tokens, results) = idx.search("the of and", true, 0).unwrap();
        assert!(tokens.is_empty());
        assert!(results.is_empty());
    }

    #[test]
    fn search_on_empty_index_is_not_an_error() {
        let idx = index();
        let (_, results) = idx.search("anything", false, 0).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn clear_all_indexes_wipes_the_namespace() {
        let idx = index();
        idx.index(1, "wipe me").unwrap();
        idx.clear_all_indexes().unwrap();

        assert!(!idx.is_indexed(1).unwrap());
        assert_eq!(idx.doc_count().unwrap(), 0);
        let (_, results) = idx.search("wipe", true, 0).unwrap();
        assert!(results.is_empty());
    }
}
