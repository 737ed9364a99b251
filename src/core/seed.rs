use rand::{seq::SliceRandom, Rng};

use super::matchup::MatchupSeed;

/// Smallest power of two that fits `entries`.
pub fn bracket_size(entries: usize) -> usize {
    entries.max(1).next_power_of_two()
}

/// Shuffle the nominated names and lay out round 1.
///
/// The permutation is uniform (Fisher-Yates). The list is padded with byes up
/// to [`bracket_size`]; byes take the second slot of the last pairs so every
/// bye matchup still carries a real entry.
pub fn seed_round_one<R: Rng + ?Sized>(mut names: Vec<String>, rng: &mut R) -> Vec<MatchupSeed> {
    names.shuffle(rng);

    let pairs = bracket_size(names.len()) / 2;
    let byes = bracket_size(names.len()) - names.len();
    let full_pairs = pairs - byes;

    let mut names = names.into_iter();
    let mut seeds = Vec::with_capacity(pairs);
    for position in 0..pairs {
        let entry_a = match names.next() {
            Some(name) => name,
            None => break,
        };
        let entry_b = if position < full_pairs {
            names.next()
        } else {
            None
        };
        seeds.push(MatchupSeed::new(1, position as u32, entry_a, entry_b));
    }

    seeds
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::core::matchup::BYE;

    fn entries(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("entry-{}", i)).collect()
    }

    #[test]
    fn test_bracket_size() {
        assert_eq!(bracket_size(2), 2);
        assert_eq!(bracket_size(3), 4);
        assert_eq!(bracket_size(4), 4);
        assert_eq!(bracket_size(5), 8);
        assert_eq!(bracket_size(17), 32);
    }

    #[test]
    fn test_seed_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        for n in 2..=40 {
            let seeds = seed_round_one(entries(n), &mut rng);
            let size = bracket_size(n);

            assert_eq!(seeds.len(), size / 2, "matchups for {} entries", n);
            assert_eq!(
                seeds.iter().filter(|s| s.is_bye()).count(),
                size - n,
                "byes for {} entries",
                n
            );
            assert!(seeds.iter().all(|s| s.entry_a != BYE && s.round == 1));
            for (i, seed) in seeds.iter().enumerate() {
                assert_eq!(seed.position, i as u32);
            }

            let mut seen: Vec<&str> = seeds
                .iter()
                .flat_map(|s| [s.entry_a.as_str(), s.entry_b.as_str()])
                .filter(|name| *name != BYE)
                .collect();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), n);
        }
    }

    #[test]
    fn test_three_entries() {
        let mut rng = StdRng::seed_from_u64(3);
        let seeds = seed_round_one(vec!["A".into(), "B".into(), "C".into()], &mut rng);

        assert_eq!(seeds.len(), 2);
        assert!(!seeds[0].is_bye());
        assert!(seeds[1].is_bye());
    }

    #[test]
    fn test_duplicate_names_kept() {
        let mut rng = StdRng::seed_from_u64(11);
        let seeds = seed_round_one(vec!["Pizza".into(), "Pizza".into()], &mut rng);

        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].entry_a, "Pizza");
        assert_eq!(seeds[0].entry_b, "Pizza");
    }

    #[test]
    fn test_shuffle_is_uniform() {
        // 4 entries have 24 orderings; with 24k draws each should land near 1000.
        let mut rng = StdRng::seed_from_u64(1234);
        let mut counts: HashMap<Vec<String>, u32> = HashMap::new();
        for _ in 0..24_000 {
            let seeds = seed_round_one(entries(4), &mut rng);
            let order = seeds
                .into_iter()
                .flat_map(|s| [s.entry_a, s.entry_b])
                .collect();
            *counts.entry(order).or_default() += 1;
        }

        assert_eq!(counts.len(), 24);
        assert!(counts.values().all(|c| (800..1200).contains(c)));
    }
}
