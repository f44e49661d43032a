//! BM25 index (C3) — a small in-memory corpus fitted per query batch, with
//! CJK-aware tokenisation and the small-corpus hit-ratio fallback (§4.3,
//! §8 property 3).
//!
//! This is a from-scratch Okapi BM25, not a wrapper over a dictionary-based
//! segmenter: there is no bundled CJK dictionary in this crate's dependency
//! stack, so "search-mode segmentation" is approximated as maximal CJK runs
//! expanded into overlapping bigrams, with a further unigram expansion for
//! any CJK token longer than two characters (exactly the rule the spec
//! calls out). Latin-script tokens are lowercased whitespace/punctuation
//! splits.

use std::collections::{HashMap, HashSet};

/// Corpus has at most this many documents before BM25's IDF becomes
/// degenerate and we fall back to a plain hit ratio.
pub const SMALL_CORPUS_THRESHOLD: usize = 3;

const BM25_K1: f64 = 1.5;
const BM25_B: f64 = 0.75;

const CHINESE_STOPWORDS: &[&str] = &[
    "的", "了", "和", "是", "在", "我", "你", "他", "她", "它", "们", "这", "那", "就", "也",
    "都", "还", "与", "及", "或", "而", "着", "过", "啊", "吗", "呢", "吧", "啦", "一个", "一下",
];

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x20000..=0x2A6DF | 0x3040..=0x30FF | 0xAC00..=0xD7A3
    )
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() && !is_cjk(c)
}

/// Tokenise free text into a bag of lowercase word tokens and CJK
/// (bigram + unigram-expanded) tokens, filtering punctuation and the
/// built-in Chinese stopword list.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut latin_buf = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    let flush_latin = |buf: &mut String, tokens: &mut Vec<String>| {
        if !buf.is_empty() {
            let lower = buf.to_lowercase();
            if !CHINESE_STOPWORDS.contains(&lower.as_str()) {
                tokens.push(lower);
            }
            buf.clear();
        }
    };

    let flush_cjk = |run: &mut Vec<char>, tokens: &mut Vec<String>| {
        if run.is_empty() {
            return;
        }
        if run.len() <= 2 {
            let word: String = run.iter().collect();
            if !CHINESE_STOPWORDS.contains(&word.as_str()) {
                tokens.push(word);
            }
        } else {
            // search-mode approximation: overlapping bigrams...
            for window in run.windows(2) {
                let bigram: String = window.iter().collect();
                if !CHINESE_STOPWORDS.contains(&bigram.as_str()) {
                    tokens.push(bigram);
                }
            }
            // ...plus unigram expansion for runs longer than two characters.
            for &c in run.iter() {
                let unigram = c.to_string();
                if !CHINESE_STOPWORDS.contains(&unigram.as_str()) {
                    tokens.push(unigram);
                }
            }
        }
        run.clear();
    };

    for c in text.chars() {
        if is_cjk(c) {
            flush_latin(&mut latin_buf, &mut tokens);
            cjk_run.push(c);
        } else if is_word_char(c) {
            flush_cjk(&mut cjk_run, &mut tokens);
            latin_buf.push(c);
        } else {
            flush_latin(&mut latin_buf, &mut tokens);
            flush_cjk(&mut cjk_run, &mut tokens);
        }
    }
    flush_latin(&mut latin_buf, &mut tokens);
    flush_cjk(&mut cjk_run, &mut tokens);

    tokens
}

/// One document in the corpus fitted by a single [`Bm25Index::fit`] call.
#[derive(Debug, Clone)]
pub struct Bm25Document {
    pub id: String,
    pub text: String,
    pub keywords: String,
}

struct FittedDoc {
    id: String,
    term_freq: HashMap<String, usize>,
    len: usize,
}

/// A BM25 index fitted over one small corpus. Re-fit per query batch —
/// this is not a persistent index.
pub struct Bm25Index {
    docs: Vec<FittedDoc>,
    doc_freq: HashMap<String, usize>,
    avg_len: f64,
}

impl Bm25Index {
    pub fn fit(documents: &[Bm25Document]) -> Self {
        let mut docs = Vec::with_capacity(documents.len());
        let mut doc_freq: HashMap<String, usize> = HashMap::new();

        for doc in documents {
            let combined = format!("{} {}", doc.text, doc.keywords);
            let tokens = tokenize(&combined);
            let len = tokens.len();
            let mut term_freq: HashMap<String, usize> = HashMap::new();
            for token in &tokens {
                *term_freq.entry(token.clone()).or_insert(0) += 1;
            }
            for token in term_freq.keys() {
                *doc_freq.entry(token.clone()).or_insert(0) += 1;
            }
            docs.push(FittedDoc {
                id: doc.id.clone(),
                term_freq,
                len,
            });
        }

        let avg_len = if docs.is_empty() {
            0.0
        } else {
            docs.iter().map(|d| d.len as f64).sum::<f64>() / docs.len() as f64
        };

        Self {
            docs,
            doc_freq,
            avg_len,
        }
    }

    fn is_small_corpus(&self) -> bool {
        self.docs.len() <= SMALL_CORPUS_THRESHOLD
    }

    /// Score every fitted document against `query`. Small corpora
    /// (`<= SMALL_CORPUS_THRESHOLD` documents) use the unigram hit-ratio
    /// fallback instead of Okapi BM25, whose IDF term can go negative with
    /// so few documents.
    pub fn score(&self, query: &str) -> HashMap<String, f64> {
        let query_tokens = tokenize(query);
        if self.docs.is_empty() || query_tokens.is_empty() {
            return self.docs.iter().map(|d| (d.id.clone(), 0.0)).collect();
        }

        if self.is_small_corpus() {
            return self.score_hit_ratio(&query_tokens);
        }

        self.score_okapi(&query_tokens)
    }

    fn score_hit_ratio(&self, query_tokens: &[String]) -> HashMap<String, f64> {
        let query_set: HashSet<&String> = query_tokens.iter().collect();
        let query_len = query_set.len() as f64;
        self.docs
            .iter()
            .map(|doc| {
                let doc_set: HashSet<&String> = doc.term_freq.keys().collect();
                let hits = query_set.intersection(&doc_set).count() as f64;
                (doc.id.clone(), hits / query_len)
            })
            .collect()
    }

    fn score_okapi(&self, query_tokens: &[String]) -> HashMap<String, f64> {
        let n = self.docs.len() as f64;

        self.docs
            .iter()
            .map(|doc| {
                let mut score = 0.0;
                for token in query_tokens {
                    let Some(&tf) = doc.term_freq.get(token) else {
                        continue;
                    };
                    let df = *self.doc_freq.get(token).unwrap_or(&0) as f64;
                    let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                    let tf = tf as f64;
                    let denom = tf
                        + BM25_K1 * (1.0 - BM25_B + BM25_B * (doc.len as f64 / self.avg_len.max(1.0)));
                    score += idf * (tf * (BM25_K1 + 1.0)) / denom.max(f64::EPSILON);
                }
                (doc.id.clone(), score)
            })
            .collect()
    }

    /// Convenience: scores sorted descending, truncated to `k`.
    pub fn top_k(&self, query: &str, k: usize) -> Vec<(String, f64)> {
        let mut scored: Vec<(String, f64)> = self.score(query).into_iter().collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_corpus_hit_ratio_fallback() {
        let docs = vec![Bm25Document {
            id: "doc1".to_string(),
            text: "alpha beta".to_string(),
            keywords: String::new(),
        }];
        let index = Bm25Index::fit(&docs);
        assert!(index.is_small_corpus());

        let scores = index.score("alpha");
        assert_eq!(scores["doc1"], 1.0);

        let scores = index.score("gamma");
        assert_eq!(scores["doc1"], 0.0);

        let scores = index.score("alpha beta");
        assert_eq!(scores["doc1"], 1.0);
    }

    #[test]
    fn larger_corpus_uses_okapi_and_ranks_matching_doc_higher() {
        let docs = vec![
            Bm25Document {
                id: "a".to_string(),
                text: "the quick brown fox jumps over the lazy dog".to_string(),
                keywords: String::new(),
            },
            Bm25Document {
                id: "b".to_string(),
                text: "completely unrelated text about gardening".to_string(),
                keywords: String::new(),
            },
            Bm25Document {
                id: "c".to_string(),
                text: "foxes are quick and clever animals".to_string(),
                keywords: String::new(),
            },
            Bm25Document {
                id: "d".to_string(),
                text: "another filler document with no overlap at all".to_string(),
                keywords: String::new(),
            },
        ];
        let index = Bm25Index::fit(&docs);
        assert!(!index.is_small_corpus());

        let top = index.top_k("quick fox", 1);
        assert_eq!(top[0].0, "a");
    }

    #[test]
    fn cjk_tokenization_expands_long_runs() {
        let tokens = tokenize("自然语言处理");
        // a 6-character run produces bigrams plus a unigram expansion
        assert!(tokens.len() > 6);
        assert!(tokens.contains(&"自".to_string()));
    }
}
