//! Channel registry: named, deterministic text → vector functions.
//!
//! Every channel's output is zero-padded or truncated to the registry's
//! dimensionality, so all moves share one vector length.
//!
//! | Channel | Features |
//! |---------|----------|
//! | `rhetoric` | 12 connective / punctuation heuristics |
//! | `imagery` | 6 lexical buckets, L2-normalized |
//! | `lexico_semantic` | SHA-512 hash chain, values in `[0, 1)` |

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha512};

use crate::vector::fit_dims;

/// A named text → feature-vector function.
pub trait Channelizer: Send + Sync {
    fn name(&self) -> &str;

    /// Raw features for `text`. `dims` is the target length; shorter or
    /// longer output is fitted by the registry.
    fn features(&self, text: &str, dims: usize) -> Vec<f32>;
}

pub struct ChannelRegistry {
    dims: usize,
    channels: Vec<Box<dyn Channelizer>>,
}

impl ChannelRegistry {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            channels: Vec::new(),
        }
    }

    /// A registry holding the three built-in channels.
    pub fn with_builtin(dims: usize) -> Self {
        let mut registry = Self::new(dims);
        registry.register(Box::new(Rhetoric));
        registry.register(Box::new(Imagery));
        registry.register(Box::new(LexicoSemantic));
        registry
    }

    /// Add a channel, replacing any existing channel with the same name.
    pub fn register(&mut self, channel: Box<dyn Channelizer>) {
        self.channels.retain(|c| c.name() != channel.name());
        self.channels.push(channel);
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.iter().any(|c| c.name() == name)
    }

    /// Run the chosen channels (all when `None`) over `text`.
    ///
    /// Unknown names are skipped; each channel runs at most once.
    pub fn run(&self, text: &str, chosen: Option<&[String]>) -> Vec<(String, Vec<f32>)> {
        let active: Vec<&dyn Channelizer> = match chosen {
            None => self.channels.iter().map(|c| c.as_ref()).collect(),
            Some(names) => {
                let mut picked: Vec<&dyn Channelizer> = Vec::new();
                for name in names {
                    if picked.iter().any(|c| c.name() == name) {
                        continue;
                    }
                    if let Some(c) = self.channels.iter().find(|c| c.name() == name) {
                        picked.push(c.as_ref());
                    }
                }
                picked
            }
        };
        active
            .into_iter()
            .map(|c| {
                (
                    c.name().to_string(),
                    fit_dims(c.features(text, self.dims), self.dims),
                )
            })
            .collect()
    }
}

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in channel pattern is valid")
}

static CONTRAST: LazyLock<Regex> = LazyLock::new(|| regex(r"\b(but|yet|however)\b"));
static CAUSAL: LazyLock<Regex> = LazyLock::new(|| regex(r"\b(so|therefore|thus)\b"));
static CONDITIONAL: LazyLock<Regex> = LazyLock::new(|| regex(r"\bif\b"));
static NEGATION: LazyLock<Regex> = LazyLock::new(|| regex(r"\b(no|not|never|none)\b"));
static IMPERATIVE: LazyLock<Regex> = LazyLock::new(|| regex(r"^[a-z]+(?:\s+[a-z]+){0,2}\b"));
static FIRST_PERSON: LazyLock<Regex> = LazyLock::new(|| regex(r"\bi\b"));
static SECOND_PERSON: LazyLock<Regex> = LazyLock::new(|| regex(r"\byou\b"));
static COORDINATION: LazyLock<Regex> = LazyLock::new(|| regex(r"\b(and|or)\b.*\b(and|or)\b"));

fn flag(hit: bool) -> f32 {
    if hit {
        1.0
    } else {
        0.0
    }
}

fn ratio(count: usize, full: f32) -> f32 {
    (count as f32 / full).min(1.0)
}

/// Connectives, mood, and punctuation density.
pub struct Rhetoric;

impl Channelizer for Rhetoric {
    fn name(&self) -> &str {
        "rhetoric"
    }

    fn features(&self, text: &str, _dims: usize) -> Vec<f32> {
        let t = text.to_lowercase();
        vec![
            flag(CONTRAST.is_match(&t)),
            flag(CAUSAL.is_match(&t)),
            flag(CONDITIONAL.is_match(&t)),
            flag(NEGATION.is_match(&t)),
            flag(IMPERATIVE.is_match(&t) && t.ends_with('!')),
            flag(t.contains('?')),
            flag(FIRST_PERSON.is_match(&t) && SECOND_PERSON.is_match(&t)),
            ratio(t.matches(',').count(), 3.0),
            ratio(t.chars().filter(|c| matches!(c, ';' | ':')).count(), 2.0),
            ratio(t.chars().filter(|c| matches!(c, '\'' | '"')).count(), 2.0),
            ratio(t.chars().count(), 160.0),
            flag(COORDINATION.is_match(&t)),
        ]
    }
}

const IMAGERY_BUCKETS: &[(&str, &[&str])] = &[
    ("light", &["light", "shine", "bright", "candle", "lamp", "sun"]),
    ("dark", &["dark", "shadow", "night", "gloom", "dim", "fog"]),
    ("body", &["hand", "heart", "mouth", "eyes", "foot", "back", "bone"]),
    ("nature", &["river", "tree", "seed", "harvest", "wind", "stone", "mountain"]),
    ("money", &["gold", "silver", "coin", "wealth", "poor", "debt", "price"]),
    ("family", &["father", "mother", "son", "daughter", "friend", "neighbor"]),
];

/// Substring counts per imagery bucket.
pub struct Imagery;

impl Channelizer for Imagery {
    fn name(&self) -> &str {
        "imagery"
    }

    fn features(&self, text: &str, _dims: usize) -> Vec<f32> {
        let t = text.to_lowercase();
        let counts: Vec<f32> = IMAGERY_BUCKETS
            .iter()
            .map(|(_, words)| words.iter().map(|w| t.matches(w).count()).sum::<usize>() as f32)
            .collect();
        let norm = counts.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm = if norm > 0.0 { norm } else { 1.0 };
        counts.into_iter().map(|x| x / norm).collect()
    }
}

/// Stable pseudo-embedding from a chained SHA-512 digest.
pub struct LexicoSemantic;

impl Channelizer for LexicoSemantic {
    fn name(&self) -> &str {
        "lexico_semantic"
    }

    fn features(&self, text: &str, dims: usize) -> Vec<f32> {
        let mut values = Vec::with_capacity(dims);
        let mut digest = Sha512::digest(text.as_bytes());
        while values.len() < dims {
            for chunk in digest.chunks_exact(8) {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                let n = i64::from_be_bytes(word).unsigned_abs();
                values.push((n % 10_000) as f32 / 10_000.0);
                if values.len() == dims {
                    break;
                }
            }
            digest = Sha512::digest(digest);
        }
        values
    }
}
