use std::path::Path;

use tokenizers::{AddedToken, PaddingDirection, Tokenizer as HfTokenizer};
use tracing::warn;

use crate::enums::PaddingSide;
use crate::error::{Error, Result};

/// Candidates for the end-of-sequence token, in lookup order.
const EOS_TOKENS: [&str; 5] = ["</s>", "<|endoftext|>", "<|end_of_text|>", "<eos>", "<|eos|>"];

const TOKENIZER_FILE: &str = "tokenizer.json";

pub struct Tokenizer {
    inner: HfTokenizer,
    eos_token_id: u32,
    padding_side: PaddingSide,
}

impl Tokenizer {
    pub fn new(inner: HfTokenizer) -> Self {
        let eos_token_id = EOS_TOKENS
            .iter()
            .find_map(|token| inner.token_to_id(token))
            .unwrap_or_else(|| {
                let fallback = 2.min(inner.get_vocab_size(true).saturating_sub(1) as u32);
                warn!(
                    "no end-of-sequence token ({}) in the vocabulary, using id {fallback} for padding and stopping",
                    EOS_TOKENS.join(", ")
                );
                fallback
            });
        let padding_side = match inner.get_padding().map(|p| p.direction) {
            Some(PaddingDirection::Left) => PaddingSide::Left,
            _ => PaddingSide::Right,
        };
        Self {
            inner,
            eos_token_id,
            padding_side,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = HfTokenizer::from_file(path).map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(Self::new(inner))
    }

    /// Loads `name` as a tokenizer file, or `name/tokenizer.json` when it is a directory.
    pub fn from_pretrained(name: &str) -> Result<Self> {
        let path = Path::new(name);
        if path.is_dir() {
            Self::from_file(path.join(TOKENIZER_FILE))
        } else {
            Self::from_file(path)
        }
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }

    pub fn batch_decode(&self, sequences: &[Vec<u32>], skip_special_tokens: bool) -> Result<Vec<String>> {
        let sequences: Vec<&[u32]> = sequences.iter().map(Vec::as_slice).collect();
        self.inner
            .decode_batch(&sequences, skip_special_tokens)
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }

    /// Registers special tokens and returns how many were new to the vocabulary.
    pub fn add_special_tokens(&mut self, tokens: &[String]) -> usize {
        let tokens: Vec<AddedToken> = tokens
            .iter()
            .map(|t| AddedToken::from(t.as_str(), true))
            .collect();
        self.inner.add_special_tokens(&tokens)
    }

    /// Vocabulary size including added tokens.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    /// Padding side declared by the tokenizer file (right when unspecified).
    pub fn padding_side(&self) -> PaddingSide {
        self.padding_side
    }

    /// Writes `tokenizer.json` into `dir`.
    pub fn save_pretrained<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        self.inner
            .save(dir.as_ref().join(TOKENIZER_FILE), true)
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;

    use super::*;

    /// Word-level tokenizer over `<unk>`, `</s>` and the words `w0 .. w{n-1}`.
    pub(crate) fn word_level(num_words: usize) -> HfTokenizer {
        let mut vocab: HashMap<String, u32> = HashMap::new();
        vocab.insert("<unk>".to_string(), 0);
        vocab.insert("</s>".to_string(), 1);
        for i in 0..num_words {
            vocab.insert(format!("w{i}"), i as u32 + 2);
        }
        let model = WordLevel::builder()
            .vocab(vocab.into_iter().collect())
            .unk_token("<unk>".to_string())
            .build()
            .unwrap();
        let mut inner = HfTokenizer::new(model);
        inner.with_pre_tokenizer(Some(Whitespace {}));
        inner.add_special_tokens(&[AddedToken::from("</s>", true)]);
        inner
    }

    #[test]
    fn test_eos_and_padding_side_resolution() {
        let tokenizer = Tokenizer::new(word_level(8));
        assert_eq!(tokenizer.eos_token_id(), 1);
        assert_eq!(tokenizer.padding_side(), PaddingSide::Right);
        assert_eq!(tokenizer.vocab_size(), 10);
    }

    #[test]
    fn test_missing_eos_falls_back_to_id_two() {
        let vocab: HashMap<String, u32> = ["<unk>", "a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(id, token)| (token.to_string(), id as u32))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab.into_iter().collect())
            .unk_token("<unk>".to_string())
            .build()
            .unwrap();
        let tokenizer = Tokenizer::new(HfTokenizer::new(model));
        assert_eq!(tokenizer.eos_token_id(), 2);
    }

    #[test]
    fn test_encode_decode_skips_special_tokens() {
        let tokenizer = Tokenizer::new(word_level(8));
        let ids = tokenizer.encode("w1 w3", false).unwrap();
        assert_eq!(ids, vec![3, 5]);
        let texts = tokenizer
            .batch_decode(&[vec![3, 5, 1], vec![4, 1, 1]], true)
            .unwrap();
        assert_eq!(texts, vec!["w1 w3".to_string(), "w2".to_string()]);
    }

    #[test]
    fn test_add_special_tokens_grows_vocab() {
        let mut tokenizer = Tokenizer::new(word_level(4));
        let before = tokenizer.vocab_size();
        let added = tokenizer.add_special_tokens(&["<tool>".to_string(), "</s>".to_string()]);
        assert_eq!(added, 1);
        assert_eq!(tokenizer.vocab_size(), before + 1);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let tokenizer = Tokenizer::new(word_level(4));
        tokenizer.save_pretrained(dir.path()).unwrap();
        let reloaded = Tokenizer::from_pretrained(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(reloaded.vocab_size(), tokenizer.vocab_size());
        assert_eq!(reloaded.eos_token_id(), 1);
    }
}
