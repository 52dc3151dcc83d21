//! Idle detection with hysteresis.
//!
//! A server is only reaped after `strikes` consecutive idle observations;
//! any observation with players resets it.

/// Per-server idle marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KillFlag {
    #[default]
    Clear,
    /// Seen idle this many consecutive times, short of the threshold.
    Flagged(u32),
}

/// What one observation decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    /// First idle observations: logged, not acted on.
    Flag,
    Remove,
}

impl KillFlag {
    /// Apply one player-count observation. `strikes` is the number of
    /// consecutive idle observations that trigger removal (minimum 1).
    pub fn observe(self, players: u32, strikes: u32) -> (KillFlag, Verdict) {
        if players > 0 {
            return (KillFlag::Clear, Verdict::Keep);
        }
        let seen = match self {
            KillFlag::Clear => 1,
            KillFlag::Flagged(n) => n + 1,
        };
        if seen >= strikes.max(1) {
            (KillFlag::Clear, Verdict::Remove)
        } else {
            (KillFlag::Flagged(seen), Verdict::Flag)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(observations: &[u32], strikes: u32) -> Vec<Verdict> {
        let mut flag = KillFlag::Clear;
        observations
            .iter()
            .map(|players| {
                let (next, verdict) = flag.observe(*players, strikes);
                flag = next;
                verdict
            })
            .collect()
    }

    #[test]
    fn two_idle_checks_remove() {
        assert_eq!(run(&[0, 0], 2), vec![Verdict::Flag, Verdict::Remove]);
    }

    #[test]
    fn players_in_between_reset_the_flag() {
        assert_eq!(run(&[0, 5], 2), vec![Verdict::Flag, Verdict::Keep]);
        assert_eq!(
            run(&[0, 5, 0], 2),
            vec![Verdict::Flag, Verdict::Keep, Verdict::Flag]
        );
    }

    #[test]
    fn removal_clears_the_flag() {
        let (flag, verdict) = KillFlag::Flagged(1).observe(0, 2);
        assert_eq!(verdict, Verdict::Remove);
        assert_eq!(flag, KillFlag::Clear);
    }

    #[test]
    fn single_strike_removes_immediately() {
        assert_eq!(run(&[0], 1), vec![Verdict::Remove]);
        assert_eq!(run(&[0], 0), vec![Verdict::Remove]);
    }

    #[test]
    fn three_strikes() {
        assert_eq!(
            run(&[0, 0, 3, 0, 0, 0], 3),
            vec![
                Verdict::Flag,
                Verdict::Flag,
                Verdict::Keep,
                Verdict::Flag,
                Verdict::Flag,
                Verdict::Remove
            ]
        );
    }
}
