//! Splitting a driver's threads across its agents.

/// Share of one agent: how many threads it runs and the global id of the
/// first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Share {
    pub threads: usize,
    pub first_thread: usize,
}

/// Splits `threads` over `agents` as evenly as possible, the first agents
/// taking the remainder. Agents that would run no thread are dropped.
pub fn partition(threads: usize, agents: usize) -> Vec<Share> {
    if agents == 0 {
        return Vec::new();
    }
    let agents = agents.min(threads);
    let (base, extra) = (threads / agents.max(1), threads % agents.max(1));
    let mut first_thread = 0;
    (0..agents)
        .map(|i| {
            let threads = base + usize::from(i < extra);
            let share = Share { threads, first_thread };
            first_thread += threads;
            share
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn remainder_goes_to_the_first_agents() {
        let shares = partition(17, 5);
        let threads: Vec<_> = shares.iter().map(|s| s.threads).collect();
        let first: Vec<_> = shares.iter().map(|s| s.first_thread).collect();
        assert_eq!(threads, vec![4, 4, 3, 3, 3]);
        assert_eq!(first, vec![0, 4, 8, 11, 14]);
    }

    #[test]
    fn more_agents_than_threads() {
        assert_eq!(
            partition(2, 4),
            vec![
                Share { threads: 1, first_thread: 0 },
                Share { threads: 1, first_thread: 1 },
            ]
        );
        assert!(partition(0, 3).is_empty());
        assert!(partition(3, 0).is_empty());
    }

    proptest! {
        #[test]
        fn shares_cover_every_thread_once(threads in 0usize..500, agents in 1usize..40) {
            let shares = partition(threads, agents);
            prop_assert_eq!(shares.iter().map(|s| s.threads).sum::<usize>(), threads);
            let mut next = 0;
            for s in &shares {
                prop_assert_eq!(s.first_thread, next);
                prop_assert!(s.threads > 0);
                next += s.threads;
            }
            let (min, max) = shares.iter().fold((usize::MAX, 0), |(lo, hi), s| (lo.min(s.threads), hi.max(s.threads)));
            prop_assert!(shares.is_empty() || max - min <= 1);
        }
    }
}
