//! Weighted shuffle
//!
//! Orders candidates so higher-weighted entries tend toward the front
//! while preserving randomness. The route writer and the connection
//! strategy both use this to bias, not fix, their try order.

use rand::Rng;

/// Shuffle `items` in place, biased by `weight`
///
/// Each output position is drawn with probability proportional to the
/// remaining items' effective weights. `entropy` in `[0, 1]` blends the
/// weights toward uniform: at 0 the raw weights apply, at 1 the shuffle
/// is unbiased. Non-finite or negative weights count as zero; when all
/// effective weights are zero the draw falls back to uniform.
pub fn weighted_shuffle<T, F, R>(items: &mut [T], weight: F, entropy: f32, rng: &mut R)
where
    F: Fn(&T) -> f32,
    R: Rng + ?Sized,
{
    let n = items.len();
    if n < 2 {
        return;
    }

    let entropy = entropy.clamp(0.0, 1.0);
    let mut weights: Vec<f32> = items
        .iter()
        .map(|item| {
            let w = weight(item);
            if w.is_finite() && w > 0.0 { w } else { 0.0 }
        })
        .collect();

    let mean = weights.iter().sum::<f32>() / n as f32;
    for w in &mut weights {
        *w = (1.0 - entropy) * *w + entropy * mean;
    }

    for pos in 0..n - 1 {
        let total: f32 = weights[pos..].iter().sum();
        let chosen = if total > 0.0 {
            let mut draw = rng.gen_range(0.0..total);
            let mut chosen = n - 1;
            for (offset, w) in weights[pos..].iter().enumerate() {
                if draw < *w {
                    chosen = pos + offset;
                    break;
                }
                draw -= *w;
            }
            chosen
        } else {
            rng.gen_range(pos..n)
        };

        items.swap(pos, chosen);
        weights.swap(pos, chosen);
    }
}
