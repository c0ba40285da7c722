//! Ranking and weighted draw over scored candidates.

use rand::Rng;
use std::cmp::Ordering;

use idrs_core::ResourceId;

/// Candidates kept after ranking.
pub const TOP_K: usize = 5;

/// Draw weights for the three best candidates.
pub const DRAW_WEIGHTS: [f64; 3] = [0.6, 0.3, 0.1];

#[derive(Clone, Debug, PartialEq)]
pub struct Ranked {
    pub id: ResourceId,
    pub score: f64,
}

/// Best-first, positive scores only, at most [`TOP_K`].
pub fn rank<I>(scored: I) -> Vec<Ranked>
where
    I: IntoIterator<Item = (ResourceId, f64)>,
{
    let mut ranked: Vec<Ranked> = scored
        .into_iter()
        .filter(|(_, score)| *score > 0.0)
        .map(|(id, score)| Ranked { id, score })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked.truncate(TOP_K);
    ranked
}

/// Order in which ranked candidates are tried.
///
/// The first entry is drawn from the top three by [`DRAW_WEIGHTS`]
/// (renormalised when fewer exist); the rest follow in rank order.
pub fn draw_order<R: Rng>(mut ranked: Vec<Ranked>, rng: &mut R) -> Vec<Ranked> {
    let pool = ranked.len().min(DRAW_WEIGHTS.len());
    if pool <= 1 {
        return ranked;
    }
    let weights = &DRAW_WEIGHTS[..pool];
    let total: f64 = weights.iter().sum();
    let mut roll = rng.gen_range(0.0..total);
    let mut chosen = pool - 1;
    for (i, w) in weights.iter().enumerate() {
        if roll < *w {
            chosen = i;
            break;
        }
        roll -= w;
    }
    let first = ranked.remove(chosen);
    ranked.insert(0, first);
    ranked
}
