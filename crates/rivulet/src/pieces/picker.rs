//! Order in which pieces are downloaded.
use std::{cmp::Ordering, fmt::Debug};

use serde::{Deserialize, Serialize};

/// The algorithm that determines how pieces are downloaded.
/// The recommended is rarest-first. Sequential is used for streaming.
#[derive(
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    Default,
    Debug,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum PieceStrategy {
    /// Rarest-first, give priority to the rarest pieces.
    #[default]
    Rarest,
    /// Sequential downloads, useful in streaming.
    Sequential,
}

impl PieceStrategy {
    pub fn picker(self) -> Box<dyn PiecePicker> {
        match self {
            PieceStrategy::Rarest => Box::new(RarestFirst),
            PieceStrategy::Sequential => Box::new(Sequential),
        }
    }
}

/// A piece that a remote can give us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub index: u32,
    /// How many connected remotes have the piece.
    pub availability: u32,
    /// Some of its blocks were already received or requested.
    pub partial: bool,
}

/// Decides which of the candidates is downloaded first, the smallest
/// candidate wins.
pub trait PiecePicker: Debug + Send + Sync {
    fn cmp(&self, a: &Candidate, b: &Candidate) -> Ordering;
}

/// Rarest pieces first, partial pieces before fresh pieces of the same
/// rarity so they complete early, then by index.
#[derive(Debug, Clone, Copy, Default)]
pub struct RarestFirst;

impl PiecePicker for RarestFirst {
    fn cmp(&self, a: &Candidate, b: &Candidate) -> Ordering {
        a.availability
            .cmp(&b.availability)
            .then(b.partial.cmp(&a.partial))
            .then(a.index.cmp(&b.index))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl PiecePicker for Sequential {
    fn cmp(&self, a: &Candidate, b: &Candidate) -> Ordering {
        a.index.cmp(&b.index)
    }
}
